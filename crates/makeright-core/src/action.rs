//! What a step asks the engine to do next.

use crate::error::FiberError;
use crate::packet::Packet;
use crate::step::Chain;
use futures::channel::oneshot;
use std::fmt;
use std::time::Duration;

/// Callback run when a fiber suspends. It receives the only handle able to
/// wake the fiber again.
pub type OnSuspend = Box<dyn FnOnce(Resumer) + Send + 'static>;

/// Packet mutation applied when a suspended fiber resumes.
pub type PacketUpdate = Box<dyn FnOnce(&mut Packet) + Send + 'static>;

/// The directive a step returns.
///
/// `None` as a next chain means the end of the pipeline: the fiber
/// completes successfully.
pub enum NextAction {
    /// Proceed with `next`. Counts toward the engine's fairness budget, so a
    /// long run of continues periodically yields the worker thread.
    Continue(Option<Chain>),
    /// Proceed with `next` without the regular yield check. A long run of
    /// invokes still yields, at a multiple of the fairness budget.
    Invoke(Option<Chain>),
    /// Wait `delay`, then proceed with `next`.
    Delay {
        /// Chain to run once the delay elapses.
        next: Option<Chain>,
        /// How long to wait.
        delay: Duration,
    },
    /// Wait `delay`, then apply the current step again.
    Retry {
        /// How long to wait before retrying.
        delay: Duration,
    },
    /// Park the fiber until the [`Resumer`] given to the callback is used.
    Suspend(OnSuspend),
    /// Run every child chain in its own fiber, then continue with `join`
    /// once all of them are done.
    ForkJoin {
        /// Child chains, each with the packet it runs against.
        children: Vec<(Chain, Packet)>,
        /// Chain to run after the last child finishes.
        join: Option<Chain>,
    },
    /// Stop the fiber; `Some` marks a failure.
    Terminate(Option<FiberError>),
}

impl NextAction {
    /// Continues with `next`, or ends the fiber when `next` is `None`.
    pub fn next(next: Option<Chain>) -> Self {
        NextAction::Continue(next)
    }

    /// Continues with `next` without yielding.
    pub fn invoke(next: Option<Chain>) -> Self {
        NextAction::Invoke(next)
    }

    /// Ends the fiber successfully.
    pub fn end() -> Self {
        NextAction::Terminate(None)
    }

    /// Ends the fiber with `error`.
    pub fn terminate(error: FiberError) -> Self {
        NextAction::Terminate(Some(error))
    }

    /// Continues with `next` after `delay`.
    pub fn delay(next: Option<Chain>, delay: Duration) -> Self {
        NextAction::Delay { next, delay }
    }

    /// Applies the current step again after `delay`.
    pub fn retry(delay: Duration) -> Self {
        NextAction::Retry { delay }
    }

    /// Suspends the fiber; `on_suspend` decides when it resumes.
    pub fn suspend(on_suspend: impl FnOnce(Resumer) + Send + 'static) -> Self {
        NextAction::Suspend(Box::new(on_suspend))
    }

    /// Forks `children` and continues with `join` once all are done.
    pub fn fork_join(children: Vec<(Chain, Packet)>, join: Option<Chain>) -> Self {
        NextAction::ForkJoin { children, join }
    }

    /// Short tag for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            NextAction::Continue(_) => "continue",
            NextAction::Invoke(_) => "invoke",
            NextAction::Delay { .. } => "delay",
            NextAction::Retry { .. } => "retry",
            NextAction::Suspend(_) => "suspend",
            NextAction::ForkJoin { .. } => "fork_join",
            NextAction::Terminate(_) => "terminate",
        }
    }
}

impl fmt::Debug for NextAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NextAction::Continue(next) => f.debug_tuple("Continue").field(next).finish(),
            NextAction::Invoke(next) => f.debug_tuple("Invoke").field(next).finish(),
            NextAction::Delay { next, delay } => f
                .debug_struct("Delay")
                .field("next", next)
                .field("delay", delay)
                .finish(),
            NextAction::Retry { delay } => f.debug_struct("Retry").field("delay", delay).finish(),
            NextAction::Suspend(_) => f.write_str("Suspend(..)"),
            NextAction::ForkJoin { children, join } => f
                .debug_struct("ForkJoin")
                .field("children", &children.len())
                .field("join", join)
                .finish(),
            NextAction::Terminate(error) => f.debug_tuple("Terminate").field(error).finish(),
        }
    }
}

/// How a suspended fiber continues.
pub enum Resumption {
    /// Keep the packet and continue with the chain.
    Next(Option<Chain>),
    /// Swap in a new packet and continue with the chain.
    Replace(Packet, Option<Chain>),
    /// Mutate the packet, then continue with the chain.
    Update(PacketUpdate, Option<Chain>),
    /// Terminate the fiber with an error.
    Fail(FiberError),
}

impl fmt::Debug for Resumption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resumption::Next(next) => f.debug_tuple("Next").field(next).finish(),
            Resumption::Replace(packet, next) => {
                f.debug_tuple("Replace").field(packet).field(next).finish()
            }
            Resumption::Update(_, next) => f.debug_tuple("Update").field(next).finish(),
            Resumption::Fail(error) => f.debug_tuple("Fail").field(error).finish(),
        }
    }
}

/// One-shot handle that wakes a suspended fiber.
///
/// Each method consumes the handle. Every method returns `false` when the
/// fiber stopped waiting in the meantime (it was cancelled). Dropping the
/// handle unused terminates the fiber with [`FiberError::Abandoned`].
///
/// ```
/// use makeright_core::{Resumer, Resumption};
///
/// let (resumer, receiver) = Resumer::channel("fiber-7");
/// assert_eq!(resumer.fiber_id(), "fiber-7");
/// assert!(resumer.resume(None));
///
/// let resumption = futures::executor::block_on(receiver).unwrap();
/// assert!(matches!(resumption, Resumption::Next(None)));
/// ```
pub struct Resumer {
    tx: oneshot::Sender<Resumption>,
    fiber_id: String,
}

impl fmt::Debug for Resumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resumer")
            .field("fiber_id", &self.fiber_id)
            .finish()
    }
}

impl Resumer {
    /// Creates a handle for `fiber_id` and the receiver the fiber awaits.
    pub fn channel(fiber_id: impl Into<String>) -> (Resumer, oneshot::Receiver<Resumption>) {
        let (tx, rx) = oneshot::channel();
        (
            Resumer {
                tx,
                fiber_id: fiber_id.into(),
            },
            rx,
        )
    }

    /// The fiber this handle resumes.
    pub fn fiber_id(&self) -> &str {
        &self.fiber_id
    }

    /// Returns `true` while the fiber is still waiting for this handle.
    pub fn is_waiting(&self) -> bool {
        !self.tx.is_canceled()
    }

    /// Resumes with the current packet.
    pub fn resume(self, next: Option<Chain>) -> bool {
        self.send(Resumption::Next(next))
    }

    /// Resumes with a replacement packet.
    pub fn resume_with(self, packet: Packet, next: Option<Chain>) -> bool {
        self.send(Resumption::Replace(packet, next))
    }

    /// Applies `update` to the packet, then resumes.
    pub fn resume_updating(
        self,
        update: impl FnOnce(&mut Packet) + Send + 'static,
        next: Option<Chain>,
    ) -> bool {
        self.send(Resumption::Update(Box::new(update), next))
    }

    /// Terminates the fiber with `error`.
    pub fn fail(self, error: FiberError) -> bool {
        self.send(Resumption::Fail(error))
    }

    fn send(self, resumption: Resumption) -> bool {
        self.tx.send(resumption).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;

    #[test]
    fn test_constructors() {
        assert!(matches!(NextAction::next(None), NextAction::Continue(None)));
        assert!(matches!(NextAction::end(), NextAction::Terminate(None)));
        assert!(matches!(
            NextAction::retry(Duration::from_millis(5)),
            NextAction::Retry { delay } if delay == Duration::from_millis(5)
        ));
        assert_eq!(NextAction::fork_join(Vec::new(), None).kind(), "fork_join");
        assert_eq!(NextAction::suspend(|_| {}).kind(), "suspend");
    }

    #[test]
    fn test_resumer_updates_packet() {
        let (resumer, rx) = Resumer::channel("fiber-1");
        assert!(resumer.resume_updating(|p| p.put("answer", 42u32), None));

        match block_on(rx).unwrap() {
            Resumption::Update(update, None) => {
                let mut packet = Packet::new();
                update(&mut packet);
                assert_eq!(packet.get::<u32>("answer"), Some(&42));
            }
            other => panic!("unexpected resumption: {other:?}"),
        }
    }

    #[test]
    fn test_resumer_reports_stopped_fiber() {
        let (resumer, rx) = Resumer::channel("fiber-2");
        drop(rx);
        assert!(!resumer.is_waiting());
        assert!(!resumer.fail(FiberError::Cancelled));
    }

    #[test]
    fn test_dropped_resumer_closes_channel() {
        let (resumer, rx) = Resumer::channel("fiber-3");
        drop(resumer);
        assert!(block_on(rx).is_err());
    }
}
