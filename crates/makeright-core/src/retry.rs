//! Retry policies for steps that back off on recoverable errors.
//!
//! The engine itself knows nothing about retry counts. A step that wants to
//! retry keeps its attempt count in the packet and asks its policy what to do.

use crate::action::NextAction;
use crate::error::FiberError;
use crate::packet::Packet;
use crate::step::StepName;
use std::time::Duration;

/// Retry policy for step execution.
///
/// # Examples
///
/// ```
/// use makeright_core::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential(5, Duration::from_millis(100));
///
/// // Delays: 100ms, 200ms, 400ms, ...
/// assert_eq!(policy.delay_for_attempt(0), Some(Duration::from_millis(100)));
/// assert_eq!(policy.delay_for_attempt(2), Some(Duration::from_millis(400)));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RetryPolicy {
    /// No retry - fail immediately on error.
    #[default]
    None,
    /// Fixed delay between retries.
    Fixed {
        /// Maximum number of retry attempts.
        max_retries: u32,
        /// Delay between each retry.
        delay: Duration,
    },
    /// Exponential backoff with configurable parameters.
    ExponentialBackoff {
        /// Maximum number of retry attempts.
        max_retries: u32,
        /// Initial delay before first retry.
        initial_delay: Duration,
        /// Maximum delay cap.
        max_delay: Duration,
        /// Multiplier for each retry.
        multiplier: u32,
    },
}

/// Error returned when [`RetryPolicy`] configuration is invalid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicyError(pub &'static str);

impl std::fmt::Display for RetryPolicyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for RetryPolicyError {}

impl RetryPolicy {
    /// Creates a fixed retry policy.
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        RetryPolicy::Fixed { max_retries, delay }
    }

    /// Creates an exponential backoff retry policy with default settings.
    ///
    /// Uses `multiplier=2` and `max_delay=60s`.
    pub fn exponential(max_retries: u32, initial_delay: Duration) -> Self {
        RetryPolicy::ExponentialBackoff {
            max_retries,
            initial_delay,
            max_delay: Duration::from_secs(60),
            multiplier: 2,
        }
    }

    /// Creates an exponential backoff retry policy with custom settings.
    ///
    /// # Errors
    ///
    /// Returns [`RetryPolicyError`] if `multiplier` is 0 or greater than 10,
    /// or if `max_delay` is less than `initial_delay`.
    pub fn exponential_backoff(
        max_retries: u32,
        initial_delay: Duration,
        max_delay: Duration,
        multiplier: u32,
    ) -> Result<Self, RetryPolicyError> {
        if multiplier == 0 {
            return Err(RetryPolicyError("multiplier must be greater than 0"));
        }
        if multiplier > 10 {
            return Err(RetryPolicyError(
                "multiplier must be 10 or less to avoid overflow",
            ));
        }
        if max_delay < initial_delay {
            return Err(RetryPolicyError("max_delay must be >= initial_delay"));
        }
        Ok(RetryPolicy::ExponentialBackoff {
            max_retries,
            initial_delay,
            max_delay,
            multiplier,
        })
    }

    /// Returns the maximum number of retries for this policy.
    pub fn max_retries(&self) -> u32 {
        match self {
            RetryPolicy::None => 0,
            RetryPolicy::Fixed { max_retries, .. } => *max_retries,
            RetryPolicy::ExponentialBackoff { max_retries, .. } => *max_retries,
        }
    }

    /// Calculates the delay for the given retry attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        match self {
            RetryPolicy::None => None,
            RetryPolicy::Fixed { delay, .. } => Some(*delay),
            RetryPolicy::ExponentialBackoff {
                initial_delay,
                max_delay,
                multiplier,
                ..
            } => {
                let factor = (*multiplier as u64).saturating_pow(attempt);
                let delay = (initial_delay.as_millis() as u64).saturating_mul(factor);
                Some(Duration::from_millis(
                    delay.min(max_delay.as_millis() as u64),
                ))
            }
        }
    }

    /// Decides how `step` reacts to a recoverable `error`.
    ///
    /// While attempts remain, records one more attempt in `packet` and
    /// returns [`NextAction::Retry`]. Once exhausted, clears the count and
    /// terminates with [`FiberError::RetriesExhausted`].
    pub fn next_action(
        &self,
        step: &StepName,
        packet: &mut Packet,
        error: &FiberError,
    ) -> NextAction {
        let attempt = packet.retry_count(step.as_str());
        match self.delay_for_attempt(attempt) {
            Some(delay) if attempt < self.max_retries() => {
                packet.increment_retry(step.as_str());
                NextAction::retry(delay)
            }
            _ => {
                packet.reset_retry(step.as_str());
                NextAction::terminate(FiberError::RetriesExhausted {
                    step_name: step.clone(),
                    attempts: attempt,
                    last_error: error.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy_fixed() {
        let policy = RetryPolicy::fixed(3, Duration::from_secs(1));
        assert_eq!(policy.max_retries(), 3);
        assert_eq!(policy.delay_for_attempt(0), Some(Duration::from_secs(1)));
        assert_eq!(policy.delay_for_attempt(2), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_retry_policy_exponential() {
        let policy = RetryPolicy::ExponentialBackoff {
            max_retries: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2,
        };
        assert_eq!(policy.delay_for_attempt(1), Some(Duration::from_millis(200)));
        // capped at max_delay
        assert_eq!(policy.delay_for_attempt(10), Some(Duration::from_secs(10)));
        assert_eq!(policy.delay_for_attempt(200), Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_retry_policy_validation() {
        let result = RetryPolicy::exponential_backoff(
            3,
            Duration::from_millis(100),
            Duration::from_secs(10),
            0,
        );
        assert_eq!(result.unwrap_err().0, "multiplier must be greater than 0");

        let result = RetryPolicy::exponential_backoff(
            3,
            Duration::from_secs(10),
            Duration::from_millis(100),
            2,
        );
        assert_eq!(result.unwrap_err().0, "max_delay must be >= initial_delay");
    }

    #[test]
    fn test_next_action_counts_attempts_in_packet() {
        let policy = RetryPolicy::fixed(2, Duration::from_millis(10));
        let step = StepName::new("PatchPod");
        let error = FiberError::step("PatchPod", "conflict");
        let mut packet = Packet::new();

        assert!(matches!(
            policy.next_action(&step, &mut packet, &error),
            NextAction::Retry { .. }
        ));
        assert!(matches!(
            policy.next_action(&step, &mut packet, &error),
            NextAction::Retry { .. }
        ));
        assert_eq!(packet.retry_count("PatchPod"), 2);

        match policy.next_action(&step, &mut packet, &error) {
            NextAction::Terminate(Some(FiberError::RetriesExhausted { attempts, .. })) => {
                assert_eq!(attempts, 2)
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
        assert_eq!(packet.retry_count("PatchPod"), 0);
    }

    #[test]
    fn test_no_retry_terminates_immediately() {
        let mut packet = Packet::new();
        let action = RetryPolicy::None.next_action(
            &StepName::new("ReadDomain"),
            &mut packet,
            &FiberError::step("ReadDomain", "bad input"),
        );
        assert!(matches!(action, NextAction::Terminate(Some(_))));
    }
}
