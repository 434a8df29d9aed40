//! Agent capability and health tracking.
//!
//! The registry stands in for the external heartbeat subsystem: it records
//! benchmarks, heartbeats, load and reliability, and hands out immutable
//! [`AgentSnapshot`]s for scoring.

pub mod registry;
pub mod reliability;

pub use registry::{AgentRegistry, AgentSnapshot, AgentState, HeartbeatOutcome};
pub use reliability::Reliability;
