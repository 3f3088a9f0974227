//! Fibers: one suspendable run of a step chain over a packet.
//!
//! A fiber is a tokio task driving a loop. Each turn checks the
//! cancellation flag, applies the head of the chain and dispatches on the
//! returned [`NextAction`]. Waiting (delays, suspension, fork-join) is an
//! `await` inside that loop, so a fiber's steps never overlap and a long
//! chain never grows the call stack.

use crate::engine::Engine;
use futures::FutureExt;
use makeright_core::{
    ChildOutcome, Chain, FiberError, JoinResults, NextAction, OnSuspend, Packet, Resumer,
    Resumption, Step, StepName,
};
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// `Invoke` skips the regular yield check, but a run of inline steps this
/// many times `yield_interval` long always yields.
const INVOKE_YIELD_FACTOR: u32 = 4;

/// Reported when a panic happens before a step's name is known.
const UNNAMED_STEP: &str = "<unnamed>";

/// Invoked exactly once when a fiber finishes, with its final packet.
pub type CompletionCallback = Box<dyn FnOnce(Packet, Result<(), FiberError>) + Send + 'static>;

/// Identifier of a fiber, unique within its engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId(u64);

impl FiberId {
    pub(crate) fn new(id: u64) -> Self {
        Self(id)
    }

    /// The numeric id.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fiber-{}", self.0)
    }
}

/// Lifecycle of a fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberState {
    /// Created but not started.
    Created,
    /// Applying steps.
    Running,
    /// Parked on a delay, a suspension, forked children or a predecessor.
    Waiting,
    /// Finished and its completion callback has returned.
    Done,
}

/// Handle to one logical execution of a step chain.
///
/// Cloning the handle does not clone the execution.
#[derive(Clone)]
pub struct Fiber {
    inner: Arc<FiberInner>,
}

struct FiberInner {
    id: FiberId,
    engine: Engine,
    parent: Option<FiberId>,
    key: Option<String>,
    cancel: CancellationToken,
    state: watch::Sender<FiberState>,
    started: AtomicBool,
    outstanding_children: AtomicUsize,
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.inner.id)
            .field("key", &self.inner.key)
            .field("parent", &self.inner.parent)
            .field("state", &self.state())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl Fiber {
    pub(crate) fn new(engine: Engine, parent: Option<&Fiber>, key: Option<String>) -> Self {
        let cancel = match parent {
            Some(parent) => parent.inner.cancel.child_token(),
            None => CancellationToken::new(),
        };
        let (state, _) = watch::channel(FiberState::Created);
        Fiber {
            inner: Arc::new(FiberInner {
                id: engine.next_fiber_id(),
                parent: parent.map(Fiber::id),
                engine,
                key,
                cancel,
                state,
                started: AtomicBool::new(false),
                outstanding_children: AtomicUsize::new(0),
            }),
        }
    }

    /// This fiber's id.
    pub fn id(&self) -> FiberId {
        self.inner.id
    }

    /// The forking fiber, for children of a fork-join.
    pub fn parent_id(&self) -> Option<FiberId> {
        self.inner.parent
    }

    /// The gate key this fiber was started under, if any.
    pub fn key(&self) -> Option<&str> {
        self.inner.key.as_deref()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> FiberState {
        *self.inner.state.borrow()
    }

    /// Forked children that have not finished yet.
    pub fn outstanding_children(&self) -> usize {
        self.inner.outstanding_children.load(Ordering::SeqCst)
    }

    /// Returns `true` once cancellation was requested, for this fiber or an
    /// ancestor.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Requests cancellation.
    ///
    /// The fiber stops before its next step, or immediately if it is
    /// waiting on a delay or suspension, and completes with
    /// [`FiberError::Cancelled`]. A step already inside `apply` runs to the
    /// end. Forked children are cancelled as well.
    pub fn cancel(&self) {
        if !self.inner.cancel.is_cancelled() {
            debug!(fiber = %self.inner.id, "cancellation requested");
        }
        self.inner.cancel.cancel();
    }

    /// Waits until the fiber is [`FiberState::Done`]. Never returns for a
    /// fiber that is never started.
    pub async fn join(&self) {
        let mut rx = self.inner.state.subscribe();
        let _ = rx.wait_for(|state| *state == FiberState::Done).await;
    }

    /// Starts running `chain` over `packet`.
    ///
    /// `on_complete` is called exactly once with the final packet and
    /// `Ok(())` or the termination cause.
    ///
    /// # Errors
    ///
    /// Returns [`FiberError::AlreadyStarted`] if the fiber was started before.
    pub fn start<F>(&self, chain: Chain, packet: Packet, on_complete: F) -> Result<(), FiberError>
    where
        F: FnOnce(Packet, Result<(), FiberError>) + Send + 'static,
    {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(FiberError::AlreadyStarted(self.inner.id.to_string()));
        }
        self.launch(None, chain, packet, Box::new(on_complete));
        Ok(())
    }

    /// Spawns the fiber task. When `predecessor` is given, the first step
    /// waits until that fiber is done.
    pub(crate) fn launch(
        &self,
        predecessor: Option<Fiber>,
        chain: Chain,
        packet: Packet,
        on_complete: CompletionCallback,
    ) {
        self.inner.started.store(true, Ordering::SeqCst);
        let span = info_span!(
            "fiber",
            id = %self.inner.id,
            key = self.inner.key.as_deref().unwrap_or("-"),
        );
        let fiber = self.clone();
        let engine = self.inner.engine.clone();
        engine.fiber_started();
        engine.executor().spawn(
            async move {
                if let Some(predecessor) = predecessor {
                    fiber.set_state(FiberState::Waiting);
                    debug!(predecessor = %predecessor.id(), "waiting for superseded fiber");
                    predecessor.join().await;
                }
                let (packet, result) = AssertUnwindSafe(fiber.run(chain, packet))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|payload| {
                        let message = panic_message(payload.as_ref());
                        error!(%message, "fiber task panicked");
                        (
                            Packet::new(),
                            Err(FiberError::Panicked {
                                step_name: StepName::new(UNNAMED_STEP),
                                message,
                            }),
                        )
                    });
                fiber.finish(packet, result, on_complete);
            }
            .instrument(span),
        );
    }

    fn set_state(&self, state: FiberState) {
        self.inner.state.send_replace(state);
    }

    async fn run(&self, chain: Chain, mut packet: Packet) -> (Packet, Result<(), FiberError>) {
        self.set_state(FiberState::Running);
        let yield_interval = self.inner.engine.config().yield_interval.max(1);
        let mut inline_steps = 0u32;
        let mut current = Some(chain);

        loop {
            if self.is_cancelled() {
                return (packet, Err(FiberError::Cancelled));
            }
            let Some(chain) = current.take() else {
                return (packet, Ok(()));
            };
            let step = Arc::clone(chain.step());

            let (name, action) = self.apply_step(&step, &mut packet, chain.rest()).await;
            match action {
                NextAction::Continue(next) => {
                    inline_steps += 1;
                    if inline_steps >= yield_interval {
                        inline_steps = 0;
                        tokio::task::yield_now().await;
                    }
                    current = next;
                }
                NextAction::Invoke(next) => {
                    inline_steps = inline_steps.saturating_add(1);
                    if inline_steps >= yield_interval.saturating_mul(INVOKE_YIELD_FACTOR) {
                        inline_steps = 0;
                        tokio::task::yield_now().await;
                    }
                    current = next;
                }
                NextAction::Delay { next, delay } => {
                    inline_steps = 0;
                    if !self.sleep(delay).await {
                        return (packet, Err(FiberError::Cancelled));
                    }
                    current = next;
                }
                NextAction::Retry { delay } => {
                    inline_steps = 0;
                    debug!(step = %name, ?delay, "retrying step");
                    if !self.sleep(delay).await {
                        return (packet, Err(FiberError::Cancelled));
                    }
                    current = Some(chain);
                }
                NextAction::Suspend(on_suspend) => {
                    inline_steps = 0;
                    match self.suspend(on_suspend, name.clone()).await {
                        Ok(Resumption::Next(next)) => current = next,
                        Ok(Resumption::Replace(replacement, next)) => {
                            packet = replacement;
                            current = next;
                        }
                        Ok(Resumption::Update(update, next)) => {
                            let updated =
                                std::panic::catch_unwind(AssertUnwindSafe(|| update(&mut packet)));
                            if let Err(payload) = updated {
                                let message = panic_message(payload.as_ref());
                                error!(step = %name, %message, "resume update panicked");
                                let error = FiberError::Panicked {
                                    step_name: name,
                                    message,
                                };
                                return (packet, Err(error));
                            }
                            current = next;
                        }
                        Ok(Resumption::Fail(error)) | Err(error) => return (packet, Err(error)),
                    }
                }
                NextAction::ForkJoin { children, join } => {
                    inline_steps = 0;
                    let results = self.fork_join(children).await;
                    packet.put(JoinResults::KEY, results);
                    current = join;
                }
                NextAction::Terminate(error) => {
                    return (packet, error.map_or(Ok(()), Err));
                }
            }
        }
    }

    async fn apply_step(
        &self,
        step: &Arc<dyn Step>,
        packet: &mut Packet,
        next: Option<Chain>,
    ) -> (StepName, NextAction) {
        let described =
            std::panic::catch_unwind(AssertUnwindSafe(|| (step.name(), step.timeout())));
        let (name, declared) = match described {
            Ok(described) => described,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(%message, "step metadata panicked");
                let name = StepName::new(UNNAMED_STEP);
                let error = FiberError::Panicked {
                    step_name: name.clone(),
                    message,
                };
                return (name, NextAction::terminate(error));
            }
        };
        debug!(step = %name, "applying step");
        let limit = declared.or_else(|| self.inner.engine.config().default_step_timeout());
        let applied = AssertUnwindSafe(step.apply(packet, next)).catch_unwind();

        let outcome = match limit {
            Some(limit) => match tokio::time::timeout(limit, applied).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(step = %name, ?limit, "step timed out");
                    let error = FiberError::Timeout {
                        step_name: name.clone(),
                        elapsed: limit,
                    };
                    return (name, NextAction::terminate(error));
                }
            },
            None => applied.await,
        };

        let action = match outcome {
            Ok(Ok(action)) => action,
            Ok(Err(error)) => {
                warn!(step = %name, %error, "step failed");
                NextAction::terminate(error)
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(step = %name, %message, "step panicked");
                NextAction::terminate(FiberError::Panicked {
                    step_name: name.clone(),
                    message,
                })
            }
        };
        (name, action)
    }

    /// Waits out `delay`; `false` when cancelled first.
    async fn sleep(&self, delay: Duration) -> bool {
        self.set_state(FiberState::Waiting);
        let elapsed = tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = self.inner.cancel.cancelled() => false,
        };
        self.set_state(FiberState::Running);
        elapsed
    }

    async fn suspend(
        &self,
        on_suspend: OnSuspend,
        step_name: StepName,
    ) -> Result<Resumption, FiberError> {
        let (resumer, resumed) = Resumer::channel(self.inner.id.to_string());
        self.set_state(FiberState::Waiting);
        debug!(step = %step_name, "fiber suspended");

        if let Err(payload) = std::panic::catch_unwind(AssertUnwindSafe(|| on_suspend(resumer))) {
            let message = panic_message(payload.as_ref());
            error!(step = %step_name, %message, "suspend callback panicked");
            return Err(FiberError::Panicked { step_name, message });
        }

        let outcome = tokio::select! {
            resumption = resumed => {
                resumption.map_err(|_| FiberError::Abandoned { step_name: step_name.clone() })
            }
            _ = self.inner.cancel.cancelled() => Err(FiberError::Cancelled),
        };
        if let Err(FiberError::Abandoned { step_name }) = &outcome {
            warn!(step = %step_name, "resumer dropped without resuming");
        }
        self.set_state(FiberState::Running);
        outcome
    }

    async fn fork_join(&self, children: Vec<(Chain, Packet)>) -> JoinResults {
        let count = children.len();
        if count == 0 {
            return JoinResults::default();
        }

        self.set_state(FiberState::Waiting);
        debug!(children = count, "forking");

        let (tx, mut rx) = mpsc::unbounded_channel::<ChildOutcome>();
        for (index, (chain, packet)) in children.into_iter().enumerate() {
            let child = self.inner.engine.create_child_fiber(self);
            let tx = tx.clone();
            child.launch(
                None,
                chain,
                packet,
                Box::new(move |packet, result| {
                    let _ = tx.send(ChildOutcome {
                        index,
                        packet,
                        result,
                    });
                }),
            );
        }
        drop(tx);
        self.inner.outstanding_children.store(count, Ordering::SeqCst);

        let mut outcomes = Vec::with_capacity(count);
        while let Some(outcome) = rx.recv().await {
            self.inner.outstanding_children.fetch_sub(1, Ordering::SeqCst);
            if let Err(error) = &outcome.result {
                if !error.is_cancelled() {
                    warn!(child = outcome.index, %error, "forked child failed");
                }
            }
            outcomes.push(outcome);
        }

        // every sender is gone, so a missing index means its callback was
        // dropped without running
        if outcomes.len() < count {
            let seen: Vec<usize> = outcomes.iter().map(|o| o.index).collect();
            for index in (0..count).filter(|i| !seen.contains(i)) {
                outcomes.push(ChildOutcome {
                    index,
                    packet: Packet::new(),
                    result: Err(FiberError::Abandoned {
                        step_name: StepName::new("fork_join"),
                    }),
                });
            }
            self.inner.outstanding_children.store(0, Ordering::SeqCst);
        }

        debug!(children = count, "joined");
        self.set_state(FiberState::Running);
        JoinResults::new(outcomes)
    }

    fn finish(
        &self,
        packet: Packet,
        result: Result<(), FiberError>,
        on_complete: CompletionCallback,
    ) {
        let result = match result {
            Ok(()) if self.is_cancelled() => Err(FiberError::Cancelled),
            other => other,
        };
        match &result {
            Ok(()) => info!(elapsed = ?packet.elapsed(), "fiber completed"),
            Err(error) if error.is_cancelled() => info!("fiber cancelled"),
            Err(error) => warn!(%error, "fiber failed"),
        }

        self.inner.engine.fiber_finished();
        if std::panic::catch_unwind(AssertUnwindSafe(|| on_complete(packet, result))).is_err() {
            error!("completion callback panicked");
        }
        self.set_state(FiberState::Done);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use makeright_core::chain;
    use std::sync::Mutex;
    use tokio::sync::oneshot;

    #[derive(Debug)]
    struct Record(&'static str);

    #[async_trait]
    impl Step for Record {
        async fn apply(
            &self,
            packet: &mut Packet,
            next: Option<Chain>,
        ) -> Result<NextAction, FiberError> {
            if let Some(log) = packet.get::<Mutex<Vec<&'static str>>>("log") {
                log.lock().unwrap().push(self.0);
            }
            Ok(NextAction::next(next))
        }
    }

    #[derive(Debug)]
    struct Park;

    #[async_trait]
    impl Step for Park {
        async fn apply(
            &self,
            _packet: &mut Packet,
            _next: Option<Chain>,
        ) -> Result<NextAction, FiberError> {
            Ok(NextAction::suspend(|resumer| drop(resumer)))
        }
    }

    #[derive(Debug)]
    struct Nameless;

    #[async_trait]
    impl Step for Nameless {
        async fn apply(
            &self,
            _packet: &mut Packet,
            next: Option<Chain>,
        ) -> Result<NextAction, FiberError> {
            Ok(NextAction::next(next))
        }

        fn name(&self) -> StepName {
            panic!("name lookup failed")
        }
    }

    fn start(
        fiber: &Fiber,
        chain: Chain,
        packet: Packet,
    ) -> oneshot::Receiver<(Packet, Result<(), FiberError>)> {
        let (tx, rx) = oneshot::channel();
        fiber
            .start(chain, packet, move |p, r| {
                let _ = tx.send((p, r));
            })
            .unwrap();
        rx
    }

    #[test]
    fn test_fiber_id_display() {
        assert_eq!(FiberId::new(7).to_string(), "fiber-7");
        assert_eq!(FiberId::new(7).as_u64(), 7);
    }

    #[tokio::test]
    async fn test_state_transitions_to_done() {
        let engine = Engine::current().unwrap();
        let fiber = engine.create_fiber();
        assert_eq!(fiber.state(), FiberState::Created);

        let mut packet = Packet::new();
        packet.put("log", Mutex::new(Vec::<&'static str>::new()));
        let rx = start(&fiber, chain![Record("a"), Record("b")], packet);

        fiber.join().await;
        assert_eq!(fiber.state(), FiberState::Done);
        let (packet, result) = rx.await.unwrap();
        assert!(result.is_ok());
        let log = packet.get::<Mutex<Vec<&'static str>>>("log").unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["a", "b"]);
        assert_eq!(engine.active_fibers(), 0);
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let engine = Engine::current().unwrap();
        let fiber = engine.create_fiber();
        let _rx = start(&fiber, chain![Record("a")], Packet::new());
        let again = fiber.start(chain![Record("a")], Packet::new(), |_, _| {});
        assert!(matches!(again, Err(FiberError::AlreadyStarted(_))));
    }

    #[tokio::test]
    async fn test_cancel_before_start_runs_no_step() {
        let engine = Engine::current().unwrap();
        let fiber = engine.create_fiber();
        fiber.cancel();

        let mut packet = Packet::new();
        packet.put("log", Mutex::new(Vec::<&'static str>::new()));
        let (packet, result) = start(&fiber, chain![Record("a")], packet).await.unwrap();

        assert_eq!(result, Err(FiberError::Cancelled));
        let log = packet.get::<Mutex<Vec<&'static str>>>("log").unwrap();
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dropped_resumer_abandons_fiber() {
        let engine = Engine::current().unwrap();
        let fiber = engine.create_fiber();
        let (_, result) = start(&fiber, chain![Park], Packet::new()).await.unwrap();
        assert_eq!(
            result,
            Err(FiberError::Abandoned {
                step_name: StepName::new("Park")
            })
        );
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(17u8);
        assert_eq!(panic_message(payload.as_ref()), "non-string panic payload");
    }

    #[tokio::test]
    async fn test_panicking_step_name_still_completes_fiber() {
        let engine = Engine::current().unwrap();
        let fiber = engine.create_fiber();
        let (_, result) = start(&fiber, chain![Nameless], Packet::new()).await.unwrap();

        assert_eq!(
            result,
            Err(FiberError::Panicked {
                step_name: StepName::new(UNNAMED_STEP),
                message: "name lookup failed".to_string(),
            })
        );
        fiber.join().await;
        assert_eq!(engine.active_fibers(), 0);
    }
}
