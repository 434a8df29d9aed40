//! Exclusive, time-bounded ownership of slices.
//!
//! A lease is the single source of truth for "who currently owns slice X".
//! Every lease carries a fencing token that strictly increases per resource,
//! so a report bearing an older token is provably stale.
//!
//! # Components
//!
//! - [`LeaseStore`]: the shared store contract (atomic conditional writes,
//!   native expiry, per-key fencing counter)
//! - [`MemoryLeaseStore`]: in-process store used by a single deployment and
//!   by tests
//! - [`LeaseManager`]: the only caller-facing API for lease mutation

pub mod manager;
pub mod store;

pub use manager::LeaseManager;
pub use store::{
    AcquireOutcome, FencingToken, Lease, LeaseError, LeaseStore, MemoryLeaseStore,
    ReclaimOutcome, ReleaseOutcome, RenewOutcome,
};
