use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::lease::store::{
    AcquireOutcome, FencingToken, Lease, LeaseError, LeaseStore, ReclaimOutcome, ReleaseOutcome,
    RenewOutcome,
};
use crate::AgentId;

/// Caller-facing lease API on top of a shared [`LeaseStore`].
///
/// The manager holds no lease state of its own; several managers (one per
/// scheduler instance) can share a store.
#[derive(Clone)]
pub struct LeaseManager {
    store: Arc<dyn LeaseStore>,
    default_ttl: Duration,
}

impl LeaseManager {
    pub fn new(store: Arc<dyn LeaseStore>, default_ttl: Duration) -> Self {
        Self { store, default_ttl }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Take ownership of `resource_id`. Returns the lease with a fencing
    /// token strictly greater than any previously issued for the resource.
    pub async fn acquire(
        &self,
        resource_id: &str,
        holder: AgentId,
        ttl: Duration,
    ) -> Result<Lease, LeaseError> {
        match self.store.acquire(resource_id, holder, ttl).await? {
            AcquireOutcome::Acquired(lease) => {
                tracing::debug!(resource_id, holder, token = lease.token, "Lease acquired");
                Ok(lease)
            }
            AcquireOutcome::Held(current) => Err(LeaseError::Conflict {
                resource_id: resource_id.to_string(),
                holder: current.holder,
            }),
        }
    }

    pub async fn renew(
        &self,
        resource_id: &str,
        token: FencingToken,
        ttl: Duration,
    ) -> Result<Lease, LeaseError> {
        match self.store.renew(resource_id, token, ttl).await? {
            RenewOutcome::Renewed(lease) => Ok(lease),
            RenewOutcome::Expired => Err(LeaseError::Expired(resource_id.to_string())),
        }
    }

    pub async fn release(&self, resource_id: &str, token: FencingToken) -> Result<(), LeaseError> {
        match self.store.release(resource_id, token).await? {
            ReleaseOutcome::Released => Ok(()),
            ReleaseOutcome::Stale => Err(LeaseError::Stale {
                resource_id: resource_id.to_string(),
                token,
            }),
        }
    }

    /// Administrative release that ignores fencing tokens.
    pub async fn revoke(&self, resource_id: &str) -> Result<Option<Lease>, LeaseError> {
        let revoked = self.store.revoke(resource_id).await?;
        if let Some(ref lease) = revoked {
            tracing::info!(
                resource_id,
                holder = lease.holder,
                token = lease.token,
                "Lease revoked"
            );
        }
        Ok(revoked)
    }

    /// True when `token` names the live lease on `resource_id`.
    pub async fn is_current(&self, resource_id: &str, token: FencingToken) -> Result<bool, LeaseError> {
        let now = Instant::now();
        Ok(self
            .store
            .get(resource_id)
            .await?
            .is_some_and(|l| l.token == token && l.is_live(now)))
    }

    pub async fn reclaim(
        &self,
        resource_id: &str,
        token: FencingToken,
    ) -> Result<ReclaimOutcome, LeaseError> {
        self.store.reclaim(resource_id, token).await
    }

    /// Reclaim every lapsed lease in the store. Returns only the leases this
    /// caller reclaimed; a concurrent sweeper racing for the same lease gets
    /// nothing back for it.
    pub async fn sweep(&self) -> Result<Vec<Lease>, LeaseError> {
        let mut reclaimed = Vec::new();
        for lease in self.store.expired().await? {
            if let ReclaimOutcome::Reclaimed(lease) =
                self.store.reclaim(&lease.resource_id, lease.token).await?
            {
                tracing::warn!(
                    resource_id = %lease.resource_id,
                    holder = lease.holder,
                    token = lease.token,
                    "Reclaimed expired lease"
                );
                reclaimed.push(lease);
            }
        }
        Ok(reclaimed)
    }
}
