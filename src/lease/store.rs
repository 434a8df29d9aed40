use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::AgentId;

pub type FencingToken = u64;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LeaseError {
    #[error("Resource {resource_id} is held by agent {holder}")]
    Conflict {
        resource_id: String,
        holder: AgentId,
    },

    #[error("Lease on {0} expired or was superseded")]
    Expired(String),

    #[error("Token {token} is stale for {resource_id}")]
    Stale {
        resource_id: String,
        token: FencingToken,
    },

    #[error("Lease store unavailable: {0}")]
    Store(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub resource_id: String,
    pub holder: AgentId,
    pub token: FencingToken,
    pub acquired_at: Instant,
    pub expires_at: Instant,
}

impl Lease {
    pub fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }

    pub fn remaining(&self, now: Instant) -> Duration {
        self.expires_at.saturating_duration_since(now)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired(Lease),
    /// Another live lease exists.
    Held(Lease),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenewOutcome {
    Renewed(Lease),
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    Stale,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReclaimOutcome {
    /// This caller removed the lapsed lease.
    Reclaimed(Lease),
    /// The lease was renewed in the meantime.
    StillLive,
    /// Nothing to reclaim for that token; someone else got there first.
    Gone,
}

/// Shared lease store.
///
/// Every method is a single atomic conditional write against one key. The
/// fencing counter for a key survives release and reclamation, so tokens are
/// never reused.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Create a lease if no live one exists, bumping the fencing counter.
    async fn acquire(
        &self,
        resource_id: &str,
        holder: AgentId,
        ttl: Duration,
    ) -> Result<AcquireOutcome, LeaseError>;

    /// Extend a live lease whose token matches. Keeps the token.
    async fn renew(
        &self,
        resource_id: &str,
        token: FencingToken,
        ttl: Duration,
    ) -> Result<RenewOutcome, LeaseError>;

    /// Drop the lease if the token matches.
    async fn release(
        &self,
        resource_id: &str,
        token: FencingToken,
    ) -> Result<ReleaseOutcome, LeaseError>;

    /// Drop whatever lease exists, ignoring tokens.
    async fn revoke(&self, resource_id: &str) -> Result<Option<Lease>, LeaseError>;

    /// Drop the lease only if it still carries `token` and has lapsed.
    async fn reclaim(
        &self,
        resource_id: &str,
        token: FencingToken,
    ) -> Result<ReclaimOutcome, LeaseError>;

    async fn get(&self, resource_id: &str) -> Result<Option<Lease>, LeaseError>;

    /// Leases past their expiry that nobody has reclaimed yet.
    async fn expired(&self) -> Result<Vec<Lease>, LeaseError>;
}

#[derive(Debug, Default)]
struct KeyEntry {
    lease: Option<Lease>,
    fencing: FencingToken,
}

/// In-memory [`LeaseStore`]. All writes for a key happen under one lock so
/// each operation is a compare-and-set.
#[derive(Debug, Default)]
pub struct MemoryLeaseStore {
    entries: Mutex<HashMap<String, KeyEntry>>,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys holding a live lease.
    pub async fn live_count(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .await
            .values()
            .filter(|e| e.lease.as_ref().is_some_and(|l| l.is_live(now)))
            .count()
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn acquire(
        &self,
        resource_id: &str,
        holder: AgentId,
        ttl: Duration,
    ) -> Result<AcquireOutcome, LeaseError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let entry = entries.entry(resource_id.to_string()).or_default();

        if let Some(existing) = entry.lease.as_ref().filter(|l| l.is_live(now)) {
            return Ok(AcquireOutcome::Held(existing.clone()));
        }

        entry.fencing += 1;
        let lease = Lease {
            resource_id: resource_id.to_string(),
            holder,
            token: entry.fencing,
            acquired_at: now,
            expires_at: now + ttl,
        };
        entry.lease = Some(lease.clone());
        Ok(AcquireOutcome::Acquired(lease))
    }

    async fn renew(
        &self,
        resource_id: &str,
        token: FencingToken,
        ttl: Duration,
    ) -> Result<RenewOutcome, LeaseError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let lease = entries
            .get_mut(resource_id)
            .and_then(|e| e.lease.as_mut())
            .filter(|l| l.token == token && l.is_live(now));

        match lease {
            Some(lease) => {
                lease.expires_at = now + ttl;
                Ok(RenewOutcome::Renewed(lease.clone()))
            }
            None => Ok(RenewOutcome::Expired),
        }
    }

    async fn release(
        &self,
        resource_id: &str,
        token: FencingToken,
    ) -> Result<ReleaseOutcome, LeaseError> {
        let mut entries = self.entries.lock().await;
        match entries.get_mut(resource_id) {
            Some(entry) if entry.lease.as_ref().is_some_and(|l| l.token == token) => {
                entry.lease = None;
                Ok(ReleaseOutcome::Released)
            }
            _ => Ok(ReleaseOutcome::Stale),
        }
    }

    async fn revoke(&self, resource_id: &str) -> Result<Option<Lease>, LeaseError> {
        let mut entries = self.entries.lock().await;
        Ok(entries.get_mut(resource_id).and_then(|e| e.lease.take()))
    }

    async fn reclaim(
        &self,
        resource_id: &str,
        token: FencingToken,
    ) -> Result<ReclaimOutcome, LeaseError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.get_mut(resource_id) else {
            return Ok(ReclaimOutcome::Gone);
        };

        match entry.lease.as_ref() {
            Some(lease) if lease.token == token && lease.is_live(now) => {
                Ok(ReclaimOutcome::StillLive)
            }
            Some(lease) if lease.token == token => {
                let lease = entry.lease.take().ok_or_else(|| {
                    LeaseError::Store(format!("lease on {} vanished under lock", resource_id))
                })?;
                Ok(ReclaimOutcome::Reclaimed(lease))
            }
            _ => Ok(ReclaimOutcome::Gone),
        }
    }

    async fn get(&self, resource_id: &str) -> Result<Option<Lease>, LeaseError> {
        let entries = self.entries.lock().await;
        Ok(entries.get(resource_id).and_then(|e| e.lease.clone()))
    }

    async fn expired(&self) -> Result<Vec<Lease>, LeaseError> {
        let now = Instant::now();
        let entries = self.entries.lock().await;
        Ok(entries
            .values()
            .filter_map(|e| e.lease.as_ref())
            .filter(|l| !l.is_live(now))
            .cloned()
            .collect())
    }
}
