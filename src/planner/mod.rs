//! Keyspace sizing and partitioning.

pub mod keyspace;
pub mod plan;

pub use keyspace::{parse_keyspace, KeyspaceParams, KeyspaceSource};
pub use plan::{cover_gaps, partition, slice_count, verify_coverage, TaskPlan, TaskPlanner};
