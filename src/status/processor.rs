use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

use crate::agent::AgentRegistry;
use crate::attack::{AttackAction, AttackState, AttackTable};
use crate::error::{DispatchError, Result};
use crate::events::{EngineEvent, EventBus};
use crate::lease::{FencingToken, LeaseError};
use crate::slice::{
    FailureOutcome, ResultSummary, SliceId, SliceState, TableError, WorkSlice, WorkSliceManager,
};
use crate::status::BackoffController;
use crate::AttackId;

/// Reply to an accepted agent report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    Progress { lease_expires_in: Duration },
    Completed { attack_completed: bool },
    Requeued { attempt_count: u32 },
    Dead { attempt_count: u32 },
}

/// Applies agent reports to slices, leases and agent health.
///
/// Every report carries the fencing token it was issued with; a report whose
/// token is no longer current is rejected with [`DispatchError::StaleLease`]
/// and changes nothing.
#[derive(Clone)]
pub struct StatusStreamProcessor {
    slices: WorkSliceManager,
    attacks: Arc<AttackTable>,
    agents: Arc<RwLock<AgentRegistry>>,
    backoff: Arc<Mutex<BackoffController>>,
    events: EventBus,
}

impl StatusStreamProcessor {
    pub fn new(
        slices: WorkSliceManager,
        attacks: Arc<AttackTable>,
        agents: Arc<RwLock<AgentRegistry>>,
        backoff: Arc<Mutex<BackoffController>>,
        events: EventBus,
    ) -> Self {
        Self {
            slices,
            attacks,
            agents,
            backoff,
            events,
        }
    }

    fn stale(&self, slice: SliceId, token: FencingToken, report: &'static str) -> DispatchError {
        tracing::warn!(slice = %slice, token, report, "Rejected stale report");
        DispatchError::StaleLease { slice, token }
    }

    fn table_error(
        &self,
        err: TableError,
        slice: SliceId,
        token: FencingToken,
        report: &'static str,
    ) -> DispatchError {
        match err {
            TableError::Conflict { .. } | TableError::NotFound(_) => self.stale(slice, token, report),
            other => other.into(),
        }
    }

    async fn require_current(
        &self,
        slice: SliceId,
        token: FencingToken,
        report: &'static str,
    ) -> Result<()> {
        if self
            .slices
            .leases()
            .is_current(&slice.resource_id(), token)
            .await?
        {
            Ok(())
        } else {
            Err(self.stale(slice, token, report))
        }
    }

    async fn release(&self, slice: SliceId, token: FencingToken) {
        if let Err(e) = self.slices.leases().release(&slice.resource_id(), token).await {
            tracing::debug!(slice = %slice, token, error = %e, "Lease already gone on release");
        }
    }

    /// Renew the lease, then record progress.
    pub async fn report_progress(
        &self,
        token: FencingToken,
        slice_id: SliceId,
        candidates_tested: u128,
        rate: u64,
    ) -> Result<Ack> {
        let leases = self.slices.leases();
        let lease = match leases
            .renew(&slice_id.resource_id(), token, leases.default_ttl())
            .await
        {
            Ok(lease) => lease,
            Err(LeaseError::Expired(_)) => return Err(self.stale(slice_id, token, "progress")),
            Err(e) => return Err(e.into()),
        };

        let slice = self
            .slices
            .mark_progress(slice_id, token, candidates_tested, rate)
            .await
            .map_err(|e| self.table_error(e, slice_id, token, "progress"))?;

        tracing::debug!(
            slice = %slice_id,
            token,
            tested = %slice.candidates_tested,
            rate,
            "Progress"
        );
        self.events.publish(EngineEvent::SliceProgress {
            slice: slice_id,
            candidates_tested: slice.candidates_tested.to_string(),
            rate,
        });
        Ok(Ack::Progress {
            lease_expires_in: lease.remaining(Instant::now()),
        })
    }

    pub async fn report_completion(
        &self,
        token: FencingToken,
        slice_id: SliceId,
        summary: ResultSummary,
    ) -> Result<Ack> {
        self.require_current(slice_id, token, "completion").await?;
        let cracked = summary.cracked;
        let slice = self
            .slices
            .complete(slice_id, token, summary)
            .await
            .map_err(|e| self.table_error(e, slice_id, token, "completion"))?;
        self.release(slice_id, token).await;

        if let Some(agent_id) = slice.assigned_agent {
            {
                let mut agents = self.agents.write().await;
                agents.adjust_load(agent_id, -1);
                agents.record_outcome(agent_id, true);
            }
            self.backoff.lock().await.record_success(agent_id);
            tracing::info!(slice = %slice_id, agent_id, cracked, "Slice completed");
            self.events.publish(EngineEvent::SliceCompleted {
                slice: slice_id,
                agent_id,
                cracked,
            });
        }

        let attack_completed = self.complete_attack_if_done(slice_id.attack_id).await;
        Ok(Ack::Completed { attack_completed })
    }

    pub async fn report_failure(
        &self,
        token: FencingToken,
        slice_id: SliceId,
        reason: &str,
    ) -> Result<Ack> {
        self.require_current(slice_id, token, "failure").await?;
        let holder = self
            .slices
            .table()
            .get(slice_id)
            .await
            .and_then(|s| s.assigned_agent);
        let (slice, outcome) = self
            .slices
            .fail(slice_id, token, reason)
            .await
            .map_err(|e| self.table_error(e, slice_id, token, "failure"))?;
        self.release(slice_id, token).await;

        let agent_id = slice.assigned_agent.or(holder);
        if let Some(agent_id) = agent_id {
            self.slices.penalize(agent_id).await;
            self.events.publish(EngineEvent::SliceFailed {
                slice: slice_id,
                agent_id,
                attempt_count: slice.attempt_count,
                reason: reason.to_string(),
            });
        }

        match outcome {
            FailureOutcome::Requeued { attempt_count } => {
                tracing::info!(slice = %slice_id, ?agent_id, attempt_count, reason, "Slice requeued");
                Ok(Ack::Requeued { attempt_count })
            }
            FailureOutcome::Dead { attempt_count } => {
                tracing::warn!(slice = %slice_id, ?agent_id, attempt_count, reason, "Slice is dead");
                self.events.publish(EngineEvent::SliceDead {
                    slice: slice_id,
                    reason: reason.to_string(),
                });
                Ok(Ack::Dead { attempt_count })
            }
        }
    }

    /// The holder gives up the untried remainder of its slice.
    pub async fn request_split(
        &self,
        token: FencingToken,
        slice_id: SliceId,
        at: Option<u128>,
    ) -> Result<(WorkSlice, WorkSlice)> {
        self.require_current(slice_id, token, "split").await?;
        self.slices
            .split(slice_id, token, at)
            .await
            .map_err(|e| match e {
                TableError::Conflict { .. } | TableError::NotFound(_) => {
                    self.stale(slice_id, token, "split")
                }
                other => other.into(),
            })
    }

    /// Move a running attack to `completed` once every slice is.
    async fn complete_attack_if_done(&self, attack_id: AttackId) -> bool {
        let counts = self.slices.table().counts(attack_id).await;
        let all_done = !counts.is_empty()
            && counts
                .iter()
                .all(|(state, n)| *state == SliceState::Completed || *n == 0);
        if !all_done {
            return false;
        }

        match self.attacks.get(attack_id).await {
            Some(attack) if attack.state == AttackState::Running => {}
            _ => return false,
        }
        match self.attacks.transition(attack_id, AttackAction::Complete).await {
            Ok(_) => {
                tracing::info!(attack_id, "Attack completed");
                self.events.publish(EngineEvent::AttackCompleted { attack_id });
                true
            }
            // Another report got there first.
            Err(_) => false,
        }
    }
}
