//! Step trait and step chaining.

use crate::action::NextAction;
use crate::error::FiberError;
use crate::packet::Packet;
use async_trait::async_trait;
use std::fmt::{self, Debug};
use std::sync::Arc;
use std::time::Duration;

/// Type-safe step name wrapper.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StepName(String);

impl StepName {
    /// Creates a new StepName.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Creates a StepName from a type's name: the last path segment, without
    /// generic arguments.
    pub fn from_type_name<T: ?Sized>() -> Self {
        let full_name = std::any::type_name::<T>();
        let base = full_name.split('<').next().unwrap_or(full_name);
        let short_name = base.rsplit("::").next().unwrap_or("UnknownStep");
        Self::new(short_name)
    }

    /// Returns the step name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StepName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for StepName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for StepName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::borrow::Borrow<str> for StepName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for StepName {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for StepName {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// One unit of work in a reconciliation pipeline.
///
/// A step holds only configuration captured at construction; everything a
/// particular run needs lives in the [`Packet`]. The engine hands the step
/// the remainder of its chain as `next`, and the step answers with a
/// [`NextAction`] telling the engine how to proceed.
///
/// `apply` may run more than once for the same logical operation (a
/// [`NextAction::Retry`] re-applies the step), so side effects that must
/// happen exactly once need their own guard, e.g. a check against packet
/// state or an optimistic-concurrency precondition on the API call.
///
/// Returning `Err(e)` is the same as returning
/// `Ok(NextAction::Terminate(Some(e)))`.
///
/// # Examples
///
/// ```
/// use makeright_core::{Chain, FiberError, NextAction, Packet, Step};
/// use async_trait::async_trait;
///
/// #[derive(Debug)]
/// struct RecordGeneration(u64);
///
/// #[async_trait]
/// impl Step for RecordGeneration {
///     async fn apply(
///         &self,
///         packet: &mut Packet,
///         next: Option<Chain>,
///     ) -> Result<NextAction, FiberError> {
///         packet.put("domain.generation", self.0);
///         Ok(NextAction::next(next))
///     }
/// }
/// ```
#[async_trait]
pub trait Step: Send + Sync + Debug {
    /// Performs the step against `packet`.
    async fn apply(&self, packet: &mut Packet, next: Option<Chain>)
        -> Result<NextAction, FiberError>;

    /// Name used in logs and errors. Defaults to the type name.
    fn name(&self) -> StepName {
        StepName::from_type_name::<Self>()
    }

    /// Upper bound on a single `apply` call. `None` defers to the engine's
    /// configured default.
    fn timeout(&self) -> Option<Duration> {
        None
    }
}

struct Link {
    step: Arc<dyn Step>,
    rest: Option<Chain>,
}

// unlink iteratively so dropping a long chain does not recurse
impl Drop for Link {
    fn drop(&mut self) {
        let mut rest = self.rest.take();
        while let Some(Chain(link)) = rest {
            rest = match Arc::try_unwrap(link) {
                Ok(mut link) => link.rest.take(),
                Err(_) => None,
            };
        }
    }
}

/// An immutable, shareable sequence of steps.
///
/// Chains are persistent lists: cloning is cheap and appending builds new
/// links without touching the originals, so one chain can be the tail of
/// many others.
///
/// ```
/// use makeright_core::{chain, Chain, FiberError, NextAction, Packet, Step};
/// use async_trait::async_trait;
///
/// #[derive(Debug)]
/// struct ReadDomain;
/// #[derive(Debug)]
/// struct UpdateStatus;
///
/// #[async_trait]
/// impl Step for ReadDomain {
///     async fn apply(
///         &self,
///         _: &mut Packet,
///         next: Option<Chain>,
///     ) -> Result<NextAction, FiberError> {
///         Ok(NextAction::next(next))
///     }
/// }
///
/// #[async_trait]
/// impl Step for UpdateStatus {
///     async fn apply(
///         &self,
///         _: &mut Packet,
///         next: Option<Chain>,
///     ) -> Result<NextAction, FiberError> {
///         Ok(NextAction::next(next))
///     }
/// }
///
/// let pipeline = chain![ReadDomain, UpdateStatus];
/// assert_eq!(pipeline.len(), 2);
/// assert_eq!(pipeline.step_names()[1], "UpdateStatus");
/// ```
#[derive(Clone)]
pub struct Chain(Arc<Link>);

impl Chain {
    /// A chain of a single step.
    pub fn of(step: impl Step + 'static) -> Chain {
        Chain::link(Arc::new(step), None)
    }

    /// Prepends `step` to `rest`.
    pub fn link(step: Arc<dyn Step>, rest: Option<Chain>) -> Chain {
        Chain(Arc::new(Link { step, rest }))
    }

    /// Builds a chain from a first step and any number of followers.
    pub fn from_parts(first: Arc<dyn Step>, rest: Vec<Arc<dyn Step>>) -> Chain {
        let tail = Chain::from_steps(rest);
        Chain::link(first, tail)
    }

    /// Builds a chain from steps in order. `None` when `steps` is empty.
    pub fn from_steps<I>(steps: I) -> Option<Chain>
    where
        I: IntoIterator<Item = Arc<dyn Step>>,
    {
        let steps: Vec<_> = steps.into_iter().collect();
        steps
            .into_iter()
            .rev()
            .fold(None, |rest, step| Some(Chain::link(step, rest)))
    }

    /// Returns a chain that runs `self` and then `next`.
    pub fn then(&self, next: Option<Chain>) -> Chain {
        let steps: Vec<_> = self.iter().cloned().collect();
        let mut chain = next;
        for step in steps.into_iter().rev() {
            chain = Some(Chain::link(step, chain));
        }
        // self has at least one step, so the fold always produces a link
        chain.unwrap_or_else(|| self.clone())
    }

    /// The first step.
    pub fn step(&self) -> &Arc<dyn Step> {
        &self.0.step
    }

    /// Everything after the first step.
    pub fn rest(&self) -> Option<Chain> {
        self.0.rest.clone()
    }

    /// Iterates over the steps in order.
    pub fn iter(&self) -> ChainIter<'_> {
        ChainIter { current: Some(self) }
    }

    /// Number of steps in the chain.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// Always `false`: a chain holds at least one step.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Names of the steps in order.
    pub fn step_names(&self) -> Vec<StepName> {
        self.iter().map(|s| s.name()).collect()
    }
}

impl fmt::Debug for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.step_names()).finish()
    }
}

/// Iterator over the steps of a [`Chain`].
pub struct ChainIter<'a> {
    current: Option<&'a Chain>,
}

impl<'a> Iterator for ChainIter<'a> {
    type Item = &'a Arc<dyn Step>;

    fn next(&mut self) -> Option<Self::Item> {
        let chain = self.current?;
        self.current = chain.0.rest.as_ref();
        Some(&chain.0.step)
    }
}

/// Concatenates optional chains, skipping the empty ones.
pub fn chain_all<I>(parts: I) -> Option<Chain>
where
    I: IntoIterator<Item = Option<Chain>>,
{
    let parts: Vec<Chain> = parts.into_iter().flatten().collect();
    parts
        .into_iter()
        .rev()
        .fold(None, |rest, part| Some(part.then(rest)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Noop;

    #[async_trait]
    impl Step for Noop {
        async fn apply(
            &self,
            _packet: &mut Packet,
            next: Option<Chain>,
        ) -> Result<NextAction, FiberError> {
            Ok(NextAction::next(next))
        }
    }

    #[derive(Debug)]
    struct Named(&'static str);

    #[async_trait]
    impl Step for Named {
        async fn apply(
            &self,
            _packet: &mut Packet,
            next: Option<Chain>,
        ) -> Result<NextAction, FiberError> {
            Ok(NextAction::next(next))
        }

        fn name(&self) -> StepName {
            StepName::new(self.0)
        }
    }

    #[derive(Debug)]
    struct Generic<T>(std::marker::PhantomData<T>);

    fn names(chain: &Chain) -> Vec<String> {
        chain.step_names().into_iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_step_name() {
        let name: StepName = "test".into();
        assert_eq!(name.as_str(), "test");
        assert_eq!(Noop.name(), "Noop");
        assert_eq!(
            StepName::from_type_name::<Generic<String>>(),
            StepName::new("Generic")
        );
    }

    #[test]
    fn test_chain_macro_preserves_order() {
        let chain = crate::chain![Named("a"), Named("b"), Named("c")];
        assert_eq!(names(&chain), vec!["a", "b", "c"]);
        assert_eq!(chain.len(), 3);
        assert_eq!(names(&chain.rest().unwrap()), vec!["b", "c"]);
    }

    #[test]
    fn test_then_leaves_original_untouched() {
        let head = crate::chain![Named("a"), Named("b")];
        let tail = Chain::of(Named("c"));
        let joined = head.then(Some(tail.clone()));

        assert_eq!(names(&joined), vec!["a", "b", "c"]);
        assert_eq!(names(&head), vec!["a", "b"]);
        assert_eq!(names(&head.then(None)), vec!["a", "b"]);
    }

    #[test]
    fn test_chain_all_skips_empty_parts() {
        let joined = chain_all([
            None,
            Some(Chain::of(Named("a"))),
            None,
            Some(crate::chain![Named("b"), Named("c")]),
        ])
        .unwrap();
        assert_eq!(names(&joined), vec!["a", "b", "c"]);
        assert!(chain_all([None, None]).is_none());
        assert!(Chain::from_steps(Vec::new()).is_none());
    }

    #[test]
    fn test_long_chain_drops_without_overflow() {
        let chain =
            Chain::from_steps((0..200_000).map(|_| Arc::new(Noop) as Arc<dyn Step>)).unwrap();
        let tail = chain.rest().unwrap();
        assert_eq!(tail.len(), 199_999);
        drop(chain);
        // the shared tail survives its former head
        assert_eq!(tail.len(), 199_999);
    }
}
