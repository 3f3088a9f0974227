//! A fiber-based step engine for Kubernetes operator reconciliation.
//!
//! Work is written as a [`Chain`] of [`Step`]s run over a [`Packet`]. An
//! [`Engine`] runs each chain in its own [`Fiber`]: a lightweight task that
//! can delay, suspend until an external callback resumes it, or fork child
//! fibers and join them. A [`FiberGate`] keeps at most one fiber active per
//! resource key, so the newest request for a resource supersedes older ones.
//!
//! # Example
//!
//! ```rust
//! use makeright::prelude::*;
//! use async_trait::async_trait;
//!
//! #[derive(Debug)]
//! struct ReadDomain;
//!
//! #[async_trait]
//! impl Step for ReadDomain {
//!     async fn apply(
//!         &self,
//!         packet: &mut Packet,
//!         next: Option<Chain>,
//!     ) -> Result<NextAction, FiberError> {
//!         packet.put("domain.replicas", 2u32);
//!         Ok(NextAction::next(next))
//!     }
//! }
//!
//! #[derive(Debug)]
//! struct ScaleServers;
//!
//! #[async_trait]
//! impl Step for ScaleServers {
//!     async fn apply(
//!         &self,
//!         packet: &mut Packet,
//!         _next: Option<Chain>,
//!     ) -> Result<NextAction, FiberError> {
//!         let replicas = packet.get::<u32>("domain.replicas").copied().unwrap_or(0);
//!         packet.put("servers.started", replicas);
//!         Ok(NextAction::end())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), FiberError> {
//!     let engine = Engine::current()?;
//!     let gate = FiberGate::new(engine.clone());
//!     let (tx, rx) = tokio::sync::oneshot::channel();
//!
//!     let chain = chain![ReadDomain, ScaleServers];
//!     gate.start_fiber_if_last("uid-1", chain, Packet::new(), move |packet, result| {
//!         let _ = tx.send((packet.get::<u32>("servers.started").copied(), result));
//!     });
//!
//!     let (started, result) = rx.await.map_err(|e| FiberError::Configuration(e.to_string()))?;
//!     assert_eq!(started, Some(2));
//!     assert!(result.is_ok());
//!     Ok(())
//! }
//! ```

mod call;
mod config;
mod engine;
mod fiber;
mod gate;

// Re-export core types
pub use makeright_core::*;

pub use call::{CallFuture, CallStep};
pub use config::{EngineConfig, STEP_TIMEOUT_ENV, YIELD_INTERVAL_ENV};
pub use engine::{Engine, EngineBuilder, ScheduledTask};
pub use fiber::{CompletionCallback, Fiber, FiberId, FiberState};
pub use gate::FiberGate;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::{
        chain, CallStep, Chain, Component, Engine, EngineConfig, Fiber, FiberError, FiberGate,
        FiberId, FiberState, JoinResults, NextAction, Packet, Resumer, RetryPolicy, Step,
        StepName,
    };
}
