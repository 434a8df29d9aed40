pub mod agent;
pub mod api;
pub mod attack;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod lease;
pub mod planner;
pub mod scorer;
pub mod shutdown;
pub mod slice;
pub mod status;

/// Identifier assigned to an attack by the attack/resource layer.
pub type AttackId = u64;

/// Identifier assigned to an agent by the registry.
pub type AgentId = u64;

/// Hash mode number (hashcat `-m` value).
pub type HashMode = u32;
