//! Core traits and types for the makeright step engine.
//!
//! This crate provides the building blocks of a reconciliation pipeline
//! without any runtime dependency. Crates that only define steps should
//! depend on it; the `makeright` crate runs them.
//!
//! # Core Types
//!
//! - [`Step`] - One unit of work, applied to a [`Packet`]
//! - [`Chain`] - Immutable sequence of steps, built with [`chain!`]
//! - [`NextAction`] - What the engine does after a step returns
//! - [`Packet`] - Per-run heterogeneous state, plus [`Component`] injection
//! - [`Resumer`] - Wakes a fiber parked by [`NextAction::Suspend`]
//! - [`JoinResults`] - Child outcomes handed to a fork-join's join step
//! - [`RetryPolicy`] - Backoff bookkeeping for recoverable failures
//! - [`FiberError`] - Why a fiber terminated abnormally

mod action;
mod error;
mod join;
mod packet;
mod retry;
mod step;

pub use action::{NextAction, OnSuspend, PacketUpdate, Resumer, Resumption};
pub use error::FiberError;
pub use join::{ChildOutcome, JoinResults};
pub use packet::{Component, Packet};
pub use retry::{RetryPolicy, RetryPolicyError};
pub use step::{chain_all, Chain, ChainIter, Step, StepName};

/// Builds a [`Chain`] from one or more step values, in order.
///
/// ```
/// use makeright_core::{chain, Chain, FiberError, NextAction, Packet, Step};
/// use async_trait::async_trait;
///
/// #[derive(Debug)]
/// struct Noop;
///
/// #[async_trait]
/// impl Step for Noop {
///     async fn apply(
///         &self,
///         _: &mut Packet,
///         next: Option<Chain>,
///     ) -> Result<NextAction, FiberError> {
///         Ok(NextAction::next(next))
///     }
/// }
///
/// let single = chain![Noop];
/// let triple = chain![Noop, Noop, Noop];
/// assert_eq!(single.len(), 1);
/// assert_eq!(triple.len(), 3);
/// ```
#[macro_export]
macro_rules! chain {
    ($first:expr $(, $rest:expr)* $(,)?) => {
        $crate::Chain::from_parts(
            ::std::sync::Arc::new($first),
            ::std::vec![$(::std::sync::Arc::new($rest) as ::std::sync::Arc<dyn $crate::Step>),*],
        )
    };
}
