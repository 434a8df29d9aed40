//! Shared fixtures for engine integration tests.
//!
//! Engines here run with short leases, a fixed 10 s slice target and no
//! backoff jitter so timing-based tests can advance a paused clock precisely.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use keyspace_dispatch::config::EngineConfig;
use keyspace_dispatch::engine::{Engine, SharedStores};
use keyspace_dispatch::events::EngineEvent;
use keyspace_dispatch::slice::{Assignment, NoWorkReason, SliceRequest};
use keyspace_dispatch::{AgentId, AttackId, HashMode};

pub const HASH_MODE: HashMode = 1000;
pub const ATTACK: AttackId = 1;
pub const LEASE_TTL: Duration = Duration::from_secs(10);

/// 10 s leases, 1 s sweeps, 10 s slices, deterministic backoff.
pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::new(1)
        .with_lease_ttl(LEASE_TTL)
        .with_sweep_interval(Duration::from_secs(1))
        .with_target_slice_duration(Duration::from_secs(10))
        .with_slice_bounds(1, 1_000_000_000_000);
    config.backoff.jitter = 0.0;
    config
}

pub fn benchmarks(rate: u64) -> HashMap<HashMode, u64> {
    HashMap::from([(HASH_MODE, rate)])
}

/// Engine with `agents` registered at `rate` candidates/s.
pub async fn engine_with_agents(config: EngineConfig, agents: &[AgentId], rate: u64) -> Arc<Engine> {
    let engine = Arc::new(Engine::new(config));
    for &agent_id in agents {
        engine.register_agent(agent_id, benchmarks(rate)).await;
    }
    engine
}

/// Two engines over one set of shared stores.
pub fn engine_pair(config: EngineConfig) -> (Arc<Engine>, Arc<Engine>) {
    let stores = SharedStores::in_memory(&config);
    let mut second = config.clone();
    second.instance_id = config.instance_id + 1;
    (
        Arc::new(Engine::with_stores(config, stores.clone())),
        Arc::new(Engine::with_stores(second, stores)),
    )
}

pub fn expect_assigned(request: SliceRequest) -> Assignment {
    match request {
        SliceRequest::Assigned(assignment) => assignment,
        SliceRequest::NoWork(reason) => panic!("Expected an assignment, got {:?}", reason),
    }
}

pub fn expect_no_work(request: SliceRequest) -> NoWorkReason {
    match request {
        SliceRequest::NoWork(reason) => reason,
        SliceRequest::Assigned(a) => panic!("Expected no work, got slice {}", a.slice.id),
    }
}

/// Everything published so far, without waiting.
pub fn drain_events(rx: &mut broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
