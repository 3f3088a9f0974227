//! Per-key admission control: at most one active fiber per key.

use crate::engine::Engine;
use crate::fiber::{CompletionCallback, Fiber, FiberId};
use makeright_core::{Chain, FiberError, Packet};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Tracks the active fiber for each key, typically a resource UID.
///
/// Starting a fiber through the gate registers it under its key. The entry
/// goes away when that fiber finishes, unless a newer fiber took its place
/// in the meantime.
///
/// A replacement never overlaps the fiber it replaces: it is registered at
/// once, but runs its first step only after its predecessor is done.
#[derive(Clone)]
pub struct FiberGate {
    engine: Engine,
    fibers: Arc<Mutex<HashMap<String, Fiber>>>,
}

impl fmt::Debug for FiberGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberGate")
            .field("keys", &self.current_keys())
            .finish()
    }
}

impl FiberGate {
    /// Creates an empty gate whose fibers run on `engine`.
    pub fn new(engine: Engine) -> Self {
        Self {
            engine,
            fibers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Fiber>> {
        self.fibers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts a fiber for `key`, cancelling the fiber currently registered
    /// for it. Latest intent wins: the cancelled fiber's callback reports
    /// [`FiberError::Cancelled`].
    pub fn start_fiber_if_last<F>(
        &self,
        key: &str,
        chain: Chain,
        packet: Packet,
        on_complete: F,
    ) -> Fiber
    where
        F: FnOnce(Packet, Result<(), FiberError>) + Send + 'static,
    {
        let fiber = self.engine.create_keyed_fiber(key);
        let previous = self.lock().insert(key.to_string(), fiber.clone());
        if let Some(previous) = &previous {
            debug!(key, superseded = %previous.id(), by = %fiber.id(), "replacing fiber");
            previous.cancel();
        }
        self.launch(&fiber, previous, chain, packet, Box::new(on_complete));
        fiber
    }

    /// Starts a fiber for `key` only when none is registered for it.
    pub fn start_fiber_if_no_current_fiber<F>(
        &self,
        key: &str,
        chain: Chain,
        packet: Packet,
        on_complete: F,
    ) -> Option<Fiber>
    where
        F: FnOnce(Packet, Result<(), FiberError>) + Send + 'static,
    {
        self.start_fiber_if_last_fiber_matches(key, None, chain, packet, on_complete)
    }

    /// Starts a fiber for `key` only when the registered fiber is `expected`
    /// (`None` meaning no fiber). The registered fiber is not cancelled; the
    /// new one waits for it to finish.
    pub fn start_fiber_if_last_fiber_matches<F>(
        &self,
        key: &str,
        expected: Option<FiberId>,
        chain: Chain,
        packet: Packet,
        on_complete: F,
    ) -> Option<Fiber>
    where
        F: FnOnce(Packet, Result<(), FiberError>) + Send + 'static,
    {
        let (fiber, previous) = {
            let mut fibers = self.lock();
            let current = fibers.get(key).map(Fiber::id);
            if current != expected {
                debug!(key, ?current, ?expected, "gate refused fiber");
                return None;
            }
            let fiber = self.engine.create_keyed_fiber(key);
            let previous = fibers.insert(key.to_string(), fiber.clone());
            (fiber, previous)
        };
        self.launch(&fiber, previous, chain, packet, Box::new(on_complete));
        Some(fiber)
    }

    fn launch(
        &self,
        fiber: &Fiber,
        previous: Option<Fiber>,
        chain: Chain,
        packet: Packet,
        on_complete: CompletionCallback,
    ) {
        let fibers = Arc::clone(&self.fibers);
        let id = fiber.id();
        let key = fiber.key().unwrap_or_default().to_string();
        fiber.launch(
            previous,
            chain,
            packet,
            Box::new(move |packet, result| {
                {
                    let mut fibers = fibers.lock().unwrap_or_else(PoisonError::into_inner);
                    if fibers.get(&key).map(Fiber::id) == Some(id) {
                        fibers.remove(&key);
                    }
                }
                on_complete(packet, result);
            }),
        );
    }

    /// The fiber registered for `key`.
    pub fn current_fiber(&self, key: &str) -> Option<Fiber> {
        self.lock().get(key).cloned()
    }

    /// Keys with a registered fiber, sorted.
    pub fn current_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Cancels the fiber registered for `key`. Returns `false` when there is
    /// none. The entry stays until the fiber finishes.
    pub fn cancel(&self, key: &str) -> bool {
        match self.current_fiber(key) {
            Some(fiber) => {
                fiber.cancel();
                true
            }
            None => false,
        }
    }

    /// Number of keys with a registered fiber.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns `true` when no key has a registered fiber.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
