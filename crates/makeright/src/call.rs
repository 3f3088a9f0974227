//! A step that wraps an asynchronous API call.

use async_trait::async_trait;
use futures::future::BoxFuture;
use makeright_core::{Chain, FiberError, NextAction, Packet, RetryPolicy, Step, StepName};
use std::any::Any;
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

/// Future produced by a [`CallStep`] request factory.
pub type CallFuture<T> = BoxFuture<'static, Result<T, FiberError>>;

type RequestFactory<T> = Box<dyn Fn(&Packet) -> CallFuture<T> + Send + Sync>;

/// Issues a request built from the packet, stores the response under
/// `response_key` and continues.
///
/// Failed or timed-out requests are retried according to the step's
/// [`RetryPolicy`]; the retry count lives in the packet, so it survives
/// across attempts and is cleared on success. A cancelled request ends the
/// fiber without retrying.
///
/// ```
/// use makeright::{CallStep, RetryPolicy};
/// use futures::FutureExt;
/// use std::time::Duration;
///
/// let read_domain = CallStep::new("ReadDomain", "domain.spec", |packet| {
///     let uid = packet.get::<String>("domain.uid").cloned().unwrap_or_default();
///     async move { Ok(format!("spec of {uid}")) }.boxed()
/// })
/// .retry_policy(RetryPolicy::exponential(3, Duration::from_millis(200)))
/// .request_timeout(Duration::from_secs(30));
/// ```
pub struct CallStep<T> {
    name: StepName,
    response_key: String,
    request: RequestFactory<T>,
    retry_policy: RetryPolicy,
    request_timeout: Option<Duration>,
}

impl<T> fmt::Debug for CallStep<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallStep")
            .field("name", &self.name)
            .field("response_key", &self.response_key)
            .field("retry_policy", &self.retry_policy)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl<T: Any + Send + Sync> CallStep<T> {
    /// Creates a call step named `name` with no retries and no timeout.
    pub fn new<F>(name: impl Into<StepName>, response_key: impl Into<String>, request: F) -> Self
    where
        F: Fn(&Packet) -> CallFuture<T> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            response_key: response_key.into(),
            request: Box::new(request),
            retry_policy: RetryPolicy::None,
            request_timeout: None,
        }
    }

    /// Sets how failed requests are retried.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Bounds each request; an expired request counts as a failed attempt.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Packet key the response is stored under.
    pub fn response_key(&self) -> &str {
        &self.response_key
    }
}

#[async_trait]
impl<T: Any + Send + Sync> Step for CallStep<T> {
    async fn apply(
        &self,
        packet: &mut Packet,
        next: Option<Chain>,
    ) -> Result<NextAction, FiberError> {
        let request = (self.request)(packet);
        let response = match self.request_timeout {
            Some(limit) => tokio::time::timeout(limit, request)
                .await
                .unwrap_or_else(|_| {
                    Err(FiberError::Timeout {
                        step_name: self.name.clone(),
                        elapsed: limit,
                    })
                }),
            None => request.await,
        };

        match response {
            Ok(value) => {
                debug!(step = %self.name, key = %self.response_key, "call succeeded");
                packet.reset_retry(self.name.as_str());
                packet.put(self.response_key.clone(), value);
                Ok(NextAction::next(next))
            }
            Err(error) if error.is_cancelled() => Ok(NextAction::terminate(error)),
            Err(error) => {
                warn!(
                    step = %self.name,
                    attempt = packet.retry_count(self.name.as_str()) + 1,
                    %error,
                    "call failed"
                );
                Ok(self.retry_policy.next_action(&self.name, packet, &error))
            }
        }
    }

    fn name(&self) -> StepName {
        self.name.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn flaky(failures: u32) -> (CallStep<u32>, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let step = CallStep::new("ListPods", "pods.count", move |_packet: &Packet| {
            let call = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if call < failures {
                    Err(FiberError::step("ListPods", "connection reset"))
                } else {
                    Ok(5u32)
                }
            }
            .boxed()
        });
        (step, calls)
    }

    #[test]
    fn test_success_stores_response() {
        let (step, _) = flaky(0);
        let mut packet = Packet::new();
        let action = tokio_test::block_on(step.apply(&mut packet, None)).unwrap();
        assert!(matches!(action, NextAction::Continue(None)));
        assert_eq!(packet.get::<u32>("pods.count"), Some(&5));
        assert_eq!(step.name(), "ListPods");
        assert_eq!(step.response_key(), "pods.count");
    }

    #[tokio::test]
    async fn test_failure_consults_retry_policy() {
        let (step, calls) = flaky(1);
        let step = step.retry_policy(RetryPolicy::fixed(2, Duration::from_millis(1)));
        let mut packet = Packet::new();

        let action = step.apply(&mut packet, None).await.unwrap();
        assert!(matches!(action, NextAction::Retry { .. }));
        assert_eq!(packet.retry_count("ListPods"), 1);

        let action = step.apply(&mut packet, None).await.unwrap();
        assert!(matches!(action, NextAction::Continue(None)));
        assert_eq!(packet.retry_count("ListPods"), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failure_without_policy_terminates() {
        let (step, _) = flaky(1);
        let mut packet = Packet::new();
        let action = step.apply(&mut packet, None).await.unwrap();
        assert!(matches!(
            action,
            NextAction::Terminate(Some(FiberError::RetriesExhausted { attempts: 0, .. }))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout_counts_as_failure() {
        let step = CallStep::new("WatchDomain", "domain.event", |_packet: &Packet| {
            async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            }
            .boxed()
        })
        .request_timeout(Duration::from_secs(1));

        let mut packet = Packet::new();
        match step.apply(&mut packet, None).await.unwrap() {
            NextAction::Terminate(Some(FiberError::RetriesExhausted { last_error, .. })) => {
                assert!(last_error.contains("Timeout"));
            }
            other => panic!("unexpected action: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancelled_call_is_not_retried() {
        let step = CallStep::<()>::new("PatchStatus", "status", |_packet: &Packet| {
            async { Err(FiberError::Cancelled) }.boxed()
        })
        .retry_policy(RetryPolicy::fixed(5, Duration::from_millis(1)));

        let mut packet = Packet::new();
        let action = step.apply(&mut packet, None).await.unwrap();
        assert!(matches!(action, NextAction::Terminate(Some(FiberError::Cancelled))));
        assert_eq!(packet.retry_count("PatchStatus"), 0);
    }
}
