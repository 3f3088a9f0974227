//! Domain reconciliation example.
//!
//! This example demonstrates the pieces working together:
//! 1. Reading the domain through a retried API call
//! 2. Starting one server per replica in forked fibers
//! 3. Checking the servers in the join step
//! 4. Superseding an in-flight reconciliation through the gate
//!
//! Run with `RUST_LOG` unset to see the engine's info-level logs.

use async_trait::async_trait;
use futures::FutureExt;
use makeright::prelude::*;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

#[derive(Debug, Clone)]
struct DomainSpec {
    name: String,
    replicas: u32,
}

#[derive(Debug)]
struct StartServers;

#[async_trait]
impl Step for StartServers {
    async fn apply(
        &self,
        packet: &mut Packet,
        _next: Option<Chain>,
    ) -> Result<NextAction, FiberError> {
        let spec = packet
            .get::<DomainSpec>("domain.spec")
            .cloned()
            .ok_or_else(|| FiberError::step("StartServers", "domain spec not read"))?;

        let children = (1..=spec.replicas)
            .map(|i| {
                let mut child = packet.copy();
                child.put("server.name", format!("{}-server{}", spec.name, i));
                (chain![StartServer], child)
            })
            .collect();
        Ok(NextAction::fork_join(children, Some(chain![CheckServers, UpdateStatus])))
    }
}

#[derive(Debug)]
struct StartServer;

#[async_trait]
impl Step for StartServer {
    async fn apply(
        &self,
        packet: &mut Packet,
        next: Option<Chain>,
    ) -> Result<NextAction, FiberError> {
        let name = packet.get::<String>("server.name").cloned().unwrap_or_default();
        println!("  starting {name}");
        // wait for the pod to report ready
        Ok(NextAction::delay(
            Some(Chain::of(ServerReady).then(next)),
            Duration::from_millis(200),
        ))
    }
}

#[derive(Debug)]
struct ServerReady;

#[async_trait]
impl Step for ServerReady {
    async fn apply(
        &self,
        packet: &mut Packet,
        next: Option<Chain>,
    ) -> Result<NextAction, FiberError> {
        packet.put("server.ready", true);
        Ok(NextAction::next(next))
    }
}

#[derive(Debug)]
struct CheckServers;

#[async_trait]
impl Step for CheckServers {
    async fn apply(
        &self,
        packet: &mut Packet,
        next: Option<Chain>,
    ) -> Result<NextAction, FiberError> {
        let ready = {
            let results = JoinResults::from_packet(packet)
                .ok_or_else(|| FiberError::step("CheckServers", "no servers were started"))?;
            results.into_result()?;
            results
                .successes()
                .filter(|o| o.packet.get::<bool>("server.ready") == Some(&true))
                .count()
        };
        packet.put("servers.ready", ready);
        Ok(NextAction::next(next))
    }
}

#[derive(Debug)]
struct UpdateStatus;

#[async_trait]
impl Step for UpdateStatus {
    async fn apply(
        &self,
        packet: &mut Packet,
        _next: Option<Chain>,
    ) -> Result<NextAction, FiberError> {
        let ready = packet.get::<usize>("servers.ready").copied().unwrap_or(0);
        let name = packet
            .get::<DomainSpec>("domain.spec")
            .map(|s| s.name.clone())
            .unwrap_or_default();
        println!("  status of {name}: {ready} servers ready");
        Ok(NextAction::end())
    }
}

fn reconcile_chain(replicas: u32) -> Chain {
    let conflicts = Arc::new(AtomicU32::new(1));
    let read_domain = CallStep::new("ReadDomain", "domain.spec", move |packet: &Packet| {
        let uid = packet.get::<String>("domain.uid").cloned().unwrap_or_default();
        let conflict = conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if conflict {
                return Err(FiberError::step("ReadDomain", "409 Conflict"));
            }
            Ok(DomainSpec {
                name: uid,
                replicas,
            })
        }
        .boxed()
    })
    .retry_policy(RetryPolicy::exponential(3, Duration::from_millis(50)))
    .request_timeout(Duration::from_secs(5));

    chain![read_domain, StartServers]
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let engine = Engine::builder()
        .config(EngineConfig::from_env()?)
        .name("domain-operator")
        .build()?;
    let gate = FiberGate::new(engine.clone());

    let resync_gate = gate.clone();
    let resync = engine.schedule_with_fixed_delay(
        Duration::from_millis(100),
        Duration::from_millis(250),
        move || println!("resync: active domains {:?}", resync_gate.current_keys()),
    );

    let mut pending = Vec::new();
    for (uid, replicas) in [("sample-domain1", 2), ("sample-domain1", 3), ("sample-domain2", 1)] {
        let mut packet = Packet::new();
        packet.put("domain.uid", uid.to_string());
        let (tx, rx) = oneshot::channel();
        let chain = reconcile_chain(replicas);
        let fiber = gate.start_fiber_if_last(uid, chain, packet, move |_packet, result| {
            let _ = tx.send(result);
        });
        println!("requested reconcile of {uid} with {replicas} replicas as {}", fiber.id());
        pending.push((fiber.id(), uid, rx));
    }

    for (id, uid, rx) in pending {
        match rx.await? {
            Ok(()) => println!("{id} ({uid}) reconciled"),
            Err(FiberError::Cancelled) => println!("{id} ({uid}) superseded by a newer request"),
            Err(error) => eprintln!("{id} ({uid}) failed: {error}"),
        }
    }

    resync.cancel();
    println!("fibers still active: {}", engine.active_fibers());
    Ok(())
}
