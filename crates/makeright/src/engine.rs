//! The scheduler that creates and drives fibers.

use crate::config::EngineConfig;
use crate::fiber::{Fiber, FiberId};
use makeright_core::{Chain, FiberError, Packet, StepName};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Creates fibers and runs them on a tokio runtime.
///
/// `Engine` is a cheap handle; clones share the same runtime, id sequence
/// and configuration.
///
/// # Example
///
/// ```
/// use makeright::prelude::*;
/// use async_trait::async_trait;
///
/// #[derive(Debug)]
/// struct ComputeTopology;
///
/// #[async_trait]
/// impl Step for ComputeTopology {
///     async fn apply(
///         &self,
///         packet: &mut Packet,
///         next: Option<Chain>,
///     ) -> Result<NextAction, FiberError> {
///         packet.put("topology.servers", 3u32);
///         Ok(NextAction::next(next))
///     }
/// }
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), FiberError> {
/// let engine = Engine::builder().yield_interval(32).build()?;
/// let (packet, result) = engine.run_steps(chain![ComputeTopology], Packet::new()).await;
///
/// assert!(result.is_ok());
/// assert_eq!(packet.get::<u32>("topology.servers"), Some(&3));
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    handle: Handle,
    config: EngineConfig,
    next_id: AtomicU64,
    active: AtomicUsize,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("name", &self.inner.config.name)
            .field("active_fibers", &self.active_fibers())
            .finish()
    }
}

impl Engine {
    /// Creates a new engine builder.
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Engine with default configuration on the runtime the caller runs in.
    ///
    /// # Errors
    ///
    /// Returns [`FiberError::Configuration`] outside a tokio runtime.
    pub fn current() -> Result<Engine, FiberError> {
        Engine::builder().build()
    }

    /// Creates a fiber bound to this engine. It does nothing until
    /// [`Fiber::start`] is called.
    pub fn create_fiber(&self) -> Fiber {
        Fiber::new(self.clone(), None, None)
    }

    pub(crate) fn create_keyed_fiber(&self, key: &str) -> Fiber {
        Fiber::new(self.clone(), None, Some(key.to_string()))
    }

    pub(crate) fn create_child_fiber(&self, parent: &Fiber) -> Fiber {
        Fiber::new(self.clone(), Some(parent), None)
    }

    pub(crate) fn next_fiber_id(&self) -> FiberId {
        FiberId::new(self.inner.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn fiber_started(&self) {
        self.inner.active.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn fiber_finished(&self) {
        self.inner.active.fetch_sub(1, Ordering::SeqCst);
    }

    /// Runs `chain` over `packet` in a new fiber and waits for it to finish.
    pub async fn run_steps(
        &self,
        chain: Chain,
        packet: Packet,
    ) -> (Packet, Result<(), FiberError>) {
        let (tx, rx) = oneshot::channel();
        let fiber = self.create_fiber();
        let started = fiber.start(chain, packet, move |packet, result| {
            let _ = tx.send((packet, result));
        });
        if let Err(error) = started {
            return (Packet::new(), Err(error));
        }
        rx.await.unwrap_or_else(|_| {
            (
                Packet::new(),
                Err(FiberError::Abandoned {
                    step_name: StepName::new("run_steps"),
                }),
            )
        })
    }

    /// The runtime fibers are spawned on, for scheduling unrelated work
    /// alongside them.
    pub fn executor(&self) -> &Handle {
        &self.inner.handle
    }

    /// This engine's configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Fibers started and not yet done, children included.
    pub fn active_fibers(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Runs `task` once after `delay`.
    pub fn schedule<F>(&self, delay: Duration, task: F) -> ScheduledTask
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = self.inner.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            task();
        });
        ScheduledTask { handle }
    }

    /// Runs `task` after `initial_delay`, then again `delay` after each run
    /// finishes, until the returned handle is cancelled.
    pub fn schedule_with_fixed_delay<F>(
        &self,
        initial_delay: Duration,
        delay: Duration,
        mut task: F,
    ) -> ScheduledTask
    where
        F: FnMut() + Send + 'static,
    {
        let handle = self.inner.handle.spawn(async move {
            tokio::time::sleep(initial_delay).await;
            loop {
                task();
                tokio::time::sleep(delay).await;
            }
        });
        ScheduledTask { handle }
    }
}

/// Handle to work registered with [`Engine::schedule`] or
/// [`Engine::schedule_with_fixed_delay`].
#[derive(Debug)]
pub struct ScheduledTask {
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    /// Stops future runs. A run already in progress completes.
    pub fn cancel(&self) {
        self.handle.abort();
    }

    /// Returns `true` once the task ran to completion or was cancelled.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Builder for constructing [`Engine`] instances.
#[derive(Debug, Default)]
pub struct EngineBuilder {
    config: EngineConfig,
    handle: Option<Handle>,
}

impl EngineBuilder {
    /// Creates a builder with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole configuration.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the engine name used in logs.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Sets how many consecutive steps a fiber runs before yielding.
    pub fn yield_interval(mut self, steps: u32) -> Self {
        self.config.yield_interval = steps;
        self
    }

    /// Bounds every step that declares no timeout of its own.
    pub fn default_step_timeout(mut self, timeout: Duration) -> Self {
        self.config.default_step_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Runs fibers on `handle` instead of the ambient runtime.
    pub fn handle(mut self, handle: Handle) -> Self {
        self.handle = Some(handle);
        self
    }

    /// Builds the engine.
    ///
    /// # Errors
    ///
    /// Returns [`FiberError::Configuration`] for an invalid configuration,
    /// or when no handle was given and the caller is outside a runtime.
    pub fn build(self) -> Result<Engine, FiberError> {
        self.config.validate()?;
        let handle = match self.handle {
            Some(handle) => handle,
            None => Handle::try_current().map_err(|e| FiberError::Configuration(e.to_string()))?,
        };
        info!(
            engine = %self.config.name,
            yield_interval = self.config.yield_interval,
            "engine created"
        );
        debug!(config = ?self.config, "engine configuration");
        Ok(Engine {
            inner: Arc::new(EngineInner {
                handle,
                config: self.config,
                next_id: AtomicU64::new(1),
                active: AtomicUsize::new(0),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_build_outside_runtime_fails() {
        let result = Engine::builder().build();
        assert!(matches!(result, Err(FiberError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_builder_validation() {
        let result = Engine::builder().yield_interval(0).build();
        assert!(matches!(result, Err(FiberError::Configuration(_))));

        let engine = Engine::builder()
            .name("operator")
            .default_step_timeout(Duration::from_secs(5))
            .build()
            .unwrap();
        assert_eq!(engine.config().name, "operator");
        assert_eq!(
            engine.config().default_step_timeout(),
            Some(Duration::from_secs(5))
        );
    }

    #[tokio::test]
    async fn test_fiber_ids_are_unique() {
        let engine = Engine::current().unwrap();
        let a = engine.create_fiber();
        let b = engine.create_fiber();
        assert_ne!(a.id(), b.id());
        assert_eq!(engine.active_fibers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_runs_once_after_delay() {
        let engine = Engine::current().unwrap();
        let (tx, rx) = oneshot::channel();
        engine.schedule(Duration::from_secs(10), move || {
            let _ = tx.send(());
        });
        tokio::time::timeout(Duration::from_secs(11), rx)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_with_fixed_delay_repeats_until_cancelled() {
        let engine = Engine::current().unwrap();
        let runs = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&runs);
        let task = engine.schedule_with_fixed_delay(
            Duration::from_secs(1),
            Duration::from_secs(5),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        );

        tokio::time::sleep(Duration::from_secs(12)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);

        task.cancel();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(task.is_finished());
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }
}
