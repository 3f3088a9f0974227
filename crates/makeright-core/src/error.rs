//! Fiber termination causes.

use crate::step::StepName;
use std::time::Duration;
use thiserror::Error;

/// Why a fiber stopped without completing its chain normally.
///
/// Steps return this from [`Step::apply`](crate::Step::apply) to fail the
/// fiber; the engine produces the remaining variants itself. Cancellation is
/// a distinct variant so callers can tell intentionally superseded work from
/// real failures (see [`FiberError::is_cancelled`]).
///
/// # Non-Exhaustive
///
/// Always include a wildcard arm when matching:
///
/// ```
/// use makeright_core::FiberError;
///
/// fn report(error: &FiberError) -> Option<String> {
///     match error {
///         FiberError::Cancelled => None,
///         FiberError::StepError { step_name, details } => {
///             Some(format!("{step_name}: {details}"))
///         }
///         other => Some(other.to_string()),
///     }
/// }
///
/// assert_eq!(report(&FiberError::Cancelled), None);
/// ```
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum FiberError {
    /// A step reported a failure.
    #[error("Step failed: {step_name}, details: {details}")]
    StepError {
        /// The name of the step that failed.
        step_name: StepName,
        /// Details about the failure.
        details: String,
    },

    /// A step exceeded its timeout.
    #[error("Timeout occurred in step: {step_name} after {elapsed:?}")]
    Timeout {
        /// The name of the step that timed out.
        step_name: StepName,
        /// The timeout that was exceeded.
        elapsed: Duration,
    },

    /// The fiber was cancelled, typically because newer work superseded it.
    #[error("fiber cancelled")]
    Cancelled,

    /// A step panicked inside `apply`.
    #[error("Step panicked: {step_name}: {message}")]
    Panicked {
        /// The step that panicked.
        step_name: StepName,
        /// The panic payload, when it was a string.
        message: String,
    },

    /// A suspended fiber's resume handle was dropped without being used.
    #[error("fiber abandoned while suspended in step: {step_name}")]
    Abandoned {
        /// The step that suspended the fiber.
        step_name: StepName,
    },

    /// A step used up its retry policy.
    #[error("Step {step_name} failed after {attempts} retries: {last_error}")]
    RetriesExhausted {
        /// The step that kept failing.
        step_name: StepName,
        /// How many retries were attempted.
        attempts: u32,
        /// Display form of the last failure.
        last_error: String,
    },

    /// `start` was called on a fiber that already started.
    #[error("fiber already started: {0}")]
    AlreadyStarted(String),

    /// The engine configuration is invalid.
    #[error("Invalid engine configuration: {0}")]
    Configuration(String),
}

impl FiberError {
    /// Convenience constructor for [`FiberError::StepError`].
    pub fn step(step_name: impl Into<StepName>, details: impl Into<String>) -> Self {
        FiberError::StepError {
            step_name: step_name.into(),
            details: details.into(),
        }
    }

    /// Returns `true` for the cancellation cause.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, FiberError::Cancelled)
    }
}
