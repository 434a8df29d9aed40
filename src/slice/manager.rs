use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::agent::AgentRegistry;
use crate::config::{AssignmentConfig, SliceOrdering};
use crate::error::Result;
use crate::events::{EngineEvent, EventBus};
use crate::lease::{FencingToken, LeaseError, LeaseManager, ReclaimOutcome};
use crate::scorer::AgentScorer;
use crate::slice::machine::{apply, SliceAction};
use crate::slice::model::{ResultSummary, SliceId, SliceState, WorkSlice};
use crate::slice::table::{Guard, SliceTable, TableError};
use crate::status::BackoffController;
use crate::{AgentId, AttackId, HashMode};

/// An attack currently accepting work, as seen by the assigner.
#[derive(Debug, Clone)]
pub struct ActiveAttack {
    pub attack_id: AttackId,
    pub hash_mode: HashMode,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone)]
pub struct Assignment {
    pub slice: WorkSlice,
    pub lease_token: FencingToken,
    pub lease_ttl: Duration,
}

/// Why a request came back empty. Never an error: the agent just asks again.
#[derive(Debug, Clone, PartialEq)]
pub enum NoWorkReason {
    BackingOff { retry_after: Duration },
    Throttled { retry_after: Duration },
    UnknownAgent,
    Ineligible(String),
    NothingPending,
    /// Better-ranked agents have first claim on what is pending.
    Outranked,
    /// Every candidate was taken by someone else first.
    Contended,
}

#[derive(Debug, Clone)]
pub enum SliceRequest {
    Assigned(Assignment),
    NoWork(NoWorkReason),
}

impl SliceRequest {
    pub fn assignment(self) -> Option<Assignment> {
        match self {
            SliceRequest::Assigned(a) => Some(a),
            SliceRequest::NoWork(_) => None,
        }
    }
}

/// How a failed slice came out of the failure transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    Requeued { attempt_count: u32 },
    Dead { attempt_count: u32 },
}

/// Owner of the slice lifecycle. Every state or token change on a slice
/// goes through one of the guarded methods here.
#[derive(Clone)]
pub struct WorkSliceManager {
    slices: Arc<SliceTable>,
    leases: LeaseManager,
    agents: Arc<RwLock<AgentRegistry>>,
    backoff: Arc<Mutex<BackoffController>>,
    scorer: AgentScorer,
    events: EventBus,
    config: AssignmentConfig,
}

impl WorkSliceManager {
    pub fn new(
        slices: Arc<SliceTable>,
        leases: LeaseManager,
        agents: Arc<RwLock<AgentRegistry>>,
        backoff: Arc<Mutex<BackoffController>>,
        scorer: AgentScorer,
        events: EventBus,
        config: AssignmentConfig,
    ) -> Self {
        Self {
            slices,
            leases,
            agents,
            backoff,
            scorer,
            events,
            config,
        }
    }

    pub fn table(&self) -> &Arc<SliceTable> {
        &self.slices
    }

    pub fn leases(&self) -> &LeaseManager {
        &self.leases
    }

    /// Hand the requesting agent at most one pending slice from `attacks`.
    pub async fn request_slice(
        &self,
        agent_id: AgentId,
        attacks: &[ActiveAttack],
    ) -> Result<SliceRequest> {
        let now = Instant::now();
        if let Some(retry_after) = self.backoff.lock().await.retry_after(agent_id, now) {
            return Ok(SliceRequest::NoWork(NoWorkReason::BackingOff { retry_after }));
        }

        let (agent, fleet) = {
            let agents = self.agents.read().await;
            (agents.snapshot(agent_id), agents.snapshots())
        };
        let Some(agent) = agent else {
            return Ok(SliceRequest::NoWork(NoWorkReason::UnknownAgent));
        };
        if let Err(why) = self.scorer.check_healthy(&agent, now) {
            tracing::debug!(agent_id, reason = %why, "Agent not eligible for work");
            return Ok(SliceRequest::NoWork(NoWorkReason::Ineligible(why.to_string())));
        }
        if attacks.is_empty() {
            return Ok(SliceRequest::NoWork(NoWorkReason::NothingPending));
        }

        let runnable: HashMap<AttackId, &ActiveAttack> = attacks
            .iter()
            .filter(|a| !a.cancel.is_cancelled() && agent.rate_for(a.hash_mode).is_some())
            .map(|a| (a.attack_id, a))
            .collect();
        if runnable.is_empty() {
            return Ok(SliceRequest::NoWork(NoWorkReason::Ineligible(
                "no runnable attack among those requested".to_string(),
            )));
        }

        let mut attack_ids: Vec<AttackId> = runnable.keys().copied().collect();
        attack_ids.sort_unstable();
        let pending = self.slices.pending_for(&attack_ids).await;
        if pending.is_empty() {
            return Ok(SliceRequest::NoWork(NoWorkReason::NothingPending));
        }

        let mut pending_counts: HashMap<AttackId, usize> = HashMap::new();
        for slice in &pending {
            *pending_counts.entry(slice.id.attack_id).or_insert(0) += 1;
        }
        let mut ranks: HashMap<HashMode, usize> = HashMap::new();
        for attack in runnable.values() {
            ranks.entry(attack.hash_mode).or_insert_with(|| {
                self.scorer
                    .rank_of(&fleet, attack.hash_mode, agent_id, now)
                    .unwrap_or(usize::MAX)
            });
        }

        let mut candidates: Vec<WorkSlice> = pending
            .into_iter()
            .filter(|slice| {
                let Some(attack) = runnable.get(&slice.id.attack_id) else {
                    return false;
                };
                let rank = ranks.get(&attack.hash_mode).copied().unwrap_or(usize::MAX);
                let pending_count = pending_counts.get(&slice.id.attack_id).copied().unwrap_or(0);
                rank < pending_count
                    || now.saturating_duration_since(slice.pending_since)
                        >= self.config.reservation_window
            })
            .collect();
        if candidates.is_empty() {
            return Ok(SliceRequest::NoWork(NoWorkReason::Outranked));
        }
        order_candidates(&mut candidates, self.config.ordering);

        // Smoothing meters assignments; the token is refunded if none is leased.
        if let Err(retry_after) = self.backoff.lock().await.try_admit(now) {
            return Ok(SliceRequest::NoWork(NoWorkReason::Throttled { retry_after }));
        }

        let mut outcome = Ok(SliceRequest::NoWork(NoWorkReason::Contended));
        for slice in candidates.iter().take(self.config.max_lease_attempts.max(1)) {
            let Some(attack) = runnable.get(&slice.id.attack_id) else {
                continue;
            };
            match self.try_assign(slice.id, agent_id, &attack.cancel).await {
                Ok(Some(assignment)) => return Ok(SliceRequest::Assigned(assignment)),
                Ok(None) => {}
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
        }
        self.backoff.lock().await.refund(now);
        outcome
    }

    /// Lease then commit `pending -> leased`. `None` means someone else won.
    async fn try_assign(
        &self,
        id: SliceId,
        agent_id: AgentId,
        cancel: &CancellationToken,
    ) -> Result<Option<Assignment>> {
        let resource = id.resource_id();
        let ttl = self.leases.default_ttl();
        let lease = match self.leases.acquire(&resource, agent_id, ttl).await {
            Ok(lease) => lease,
            Err(LeaseError::Conflict { holder, .. }) => {
                tracing::debug!(slice = %id, agent_id, holder, "Slice already leased");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        if cancel.is_cancelled() {
            self.release_quietly(&resource, lease.token).await;
            return Ok(None);
        }

        let committed = self
            .slices
            .update(id, Guard::State(SliceState::Pending), |s| {
                s.state = apply(s.state, SliceAction::Lease)?;
                s.assigned_agent = Some(agent_id);
                s.lease_token = Some(lease.token);
                Ok(())
            })
            .await;

        match committed {
            Ok(slice) => {
                self.agents.write().await.adjust_load(agent_id, 1);
                tracing::info!(
                    slice = %id,
                    agent_id,
                    token = lease.token,
                    range = %slice.range,
                    "Slice assigned"
                );
                self.events.publish(EngineEvent::SliceAssigned {
                    slice: id,
                    agent_id,
                    token: lease.token,
                });
                Ok(Some(Assignment {
                    slice,
                    lease_token: lease.token,
                    lease_ttl: ttl,
                }))
            }
            Err(TableError::Conflict { .. }) | Err(TableError::NotFound(_)) => {
                self.release_quietly(&resource, lease.token).await;
                Ok(None)
            }
            Err(e) => {
                self.release_quietly(&resource, lease.token).await;
                Err(e.into())
            }
        }
    }

    async fn release_quietly(&self, resource: &str, token: FencingToken) {
        if let Err(e) = self.leases.release(resource, token).await {
            tracing::debug!(resource, token, error = %e, "Lease release skipped");
        }
    }

    /// Record progress from the current holder. The first report moves the
    /// slice to `running`.
    pub async fn mark_progress(
        &self,
        id: SliceId,
        token: FencingToken,
        candidates_tested: u128,
        rate: u64,
    ) -> std::result::Result<WorkSlice, TableError> {
        self.slices
            .update(id, Guard::Token(token), |s| {
                match s.state {
                    SliceState::Leased => s.state = apply(s.state, SliceAction::Start)?,
                    SliceState::Running => {}
                    other => {
                        return Err(TableError::Conflict {
                            slice: s.id,
                            expected: "leased or running".to_string(),
                            found: other.to_string(),
                        })
                    }
                }
                s.candidates_tested = candidates_tested.min(s.range.len());
                s.rate = rate;
                Ok(())
            })
            .await
    }

    pub async fn complete(
        &self,
        id: SliceId,
        token: FencingToken,
        summary: ResultSummary,
    ) -> std::result::Result<WorkSlice, TableError> {
        self.slices
            .update(id, Guard::Token(token), |s| {
                s.state = apply(s.state, SliceAction::Complete)?;
                s.candidates_tested = s.range.len();
                s.rate = 0;
                s.lease_token = None;
                s.result = Some(summary);
                Ok(())
            })
            .await
    }

    /// `failed`, then straight on to `pending` or `dead` in the same write.
    pub async fn fail(
        &self,
        id: SliceId,
        token: FencingToken,
        reason: &str,
    ) -> std::result::Result<(WorkSlice, FailureOutcome), TableError> {
        let max_attempts = self.config.max_attempts.max(1);
        let now = Instant::now();
        let slice = self
            .slices
            .update(id, Guard::Token(token), |s| {
                s.state = apply(s.state, SliceAction::Fail)?;
                s.attempt_count = s.attempt_count.saturating_add(1);
                s.last_error = Some(reason.to_string());
                if s.attempt_count >= max_attempts {
                    s.state = apply(s.state, SliceAction::Bury)?;
                    s.lease_token = None;
                    s.rate = 0;
                } else {
                    s.state = apply(s.state, SliceAction::Requeue)?;
                    s.back_to_pending(now);
                }
                Ok(())
            })
            .await?;

        let outcome = if slice.state == SliceState::Dead {
            FailureOutcome::Dead {
                attempt_count: slice.attempt_count,
            }
        } else {
            FailureOutcome::Requeued {
                attempt_count: slice.attempt_count,
            }
        };
        Ok((slice, outcome))
    }

    /// Split a held slice; the holder keeps the head.
    pub async fn split(
        &self,
        id: SliceId,
        token: FencingToken,
        at: Option<u128>,
    ) -> std::result::Result<(WorkSlice, WorkSlice), TableError> {
        let (head, tail) = self.slices.split(id, token, at).await?;
        tracing::info!(
            slice = %id,
            remainder = %tail.id,
            at = %tail.range.start,
            "Slice split"
        );
        self.events.publish(EngineEvent::SliceSplit {
            slice: id,
            remainder: tail.id,
            at: tail.range.start.to_string(),
        });
        Ok((head, tail))
    }

    /// Return every held slice whose lease has lapsed to `pending`. Safe to
    /// run from several instances at once: each slice is reclaimed by
    /// exactly one of them.
    pub async fn reclaim_expired(&self) -> Result<Vec<WorkSlice>> {
        let mut reclaimed = Vec::new();
        for slice in self.slices.held().await {
            let Some(token) = slice.lease_token else {
                continue;
            };
            match self.leases.reclaim(&slice.id.resource_id(), token).await? {
                ReclaimOutcome::StillLive => continue,
                ReclaimOutcome::Reclaimed(_) | ReclaimOutcome::Gone => {}
            }

            let now = Instant::now();
            let expired = self
                .slices
                .update(slice.id, Guard::Token(token), |s| {
                    s.state = apply(s.state, SliceAction::Expire)?;
                    s.state = apply(s.state, SliceAction::Reclaim)?;
                    s.back_to_pending(now);
                    Ok(())
                })
                .await;
            let Ok(expired) = expired else {
                // Completed, failed or reclaimed elsewhere in the meantime.
                continue;
            };

            if let Some(agent_id) = slice.assigned_agent {
                self.penalize(agent_id).await;
            }
            tracing::warn!(
                slice = %slice.id,
                agent_id = ?slice.assigned_agent,
                token,
                "Lease expired, slice back to pending"
            );
            self.events.publish(EngineEvent::SliceExpired {
                slice: slice.id,
                agent_id: slice.assigned_agent,
            });
            reclaimed.push(expired);
        }

        // Orphaned leases whose slice moved on without releasing them.
        self.leases.sweep().await?;
        Ok(reclaimed)
    }

    /// Release load and charge a failure to an agent that lost a slice.
    pub(crate) async fn penalize(&self, agent_id: AgentId) {
        {
            let mut agents = self.agents.write().await;
            agents.adjust_load(agent_id, -1);
            agents.record_outcome(agent_id, false);
        }
        let (level, delay) = self
            .backoff
            .lock()
            .await
            .record_failure(agent_id, Instant::now());
        self.events.publish(EngineEvent::AgentBackoff {
            agent_id,
            level,
            retry_after_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
        });
    }

    /// Move every non-terminal slice of the attack to `paused` and revoke
    /// outstanding leases. Returns how many leases were revoked.
    pub async fn pause_slices(&self, attack_id: AttackId) -> Result<usize> {
        let mut revoked = 0;
        for slice in self.slices.for_attack(attack_id).await {
            let mut holder = None;
            let paused = self
                .slices
                .update(slice.id, Guard::Any, |s| {
                    s.state = apply(s.state, SliceAction::Pause)?;
                    holder = s.assigned_agent.zip(s.lease_token);
                    s.assigned_agent = None;
                    s.lease_token = None;
                    s.rate = 0;
                    Ok(())
                })
                .await;
            if paused.is_err() {
                // Terminal or already paused.
                continue;
            }
            if let Some((agent_id, _)) = holder {
                self.revoke(slice.id, agent_id).await?;
                revoked += 1;
            }
        }
        Ok(revoked)
    }

    async fn revoke(&self, id: SliceId, agent_id: AgentId) -> Result<()> {
        self.leases.revoke(&id.resource_id()).await?;
        self.agents.write().await.adjust_load(agent_id, -1);
        Ok(())
    }

    /// Paused slices go back to the pending queue.
    pub async fn resume_slices(&self, attack_id: AttackId) -> usize {
        let now = Instant::now();
        let mut resumed = 0;
        for slice in self.slices.for_attack(attack_id).await {
            if slice.state != SliceState::Paused {
                continue;
            }
            let result = self
                .slices
                .update(slice.id, Guard::State(SliceState::Paused), |s| {
                    s.state = apply(s.state, SliceAction::Resume)?;
                    s.back_to_pending(now);
                    Ok(())
                })
                .await;
            if result.is_ok() {
                resumed += 1;
            }
        }
        resumed
    }

    /// Revoke leases and release load for slices that were removed from the
    /// table by a re-plan or invalidation.
    pub async fn discard(&self, removed: &[WorkSlice]) -> Result<usize> {
        let mut revoked = 0;
        for slice in removed {
            if let (Some(agent_id), Some(_)) = (slice.assigned_agent, slice.lease_token) {
                if slice.state.is_held() {
                    self.revoke(slice.id, agent_id).await?;
                    revoked += 1;
                }
            }
        }
        Ok(revoked)
    }

    /// Drop every slice of the attack, revoking what is held.
    pub async fn invalidate(&self, attack_id: AttackId) -> Result<usize> {
        let removed = self.slices.remove_attack(attack_id).await;
        let revoked = self.discard(&removed).await?;
        if !removed.is_empty() {
            tracing::info!(attack_id, removed = removed.len(), revoked, "Slices invalidated");
        }
        Ok(revoked)
    }

    /// Give a dead slice a fresh retry budget.
    pub async fn revive(&self, id: SliceId) -> std::result::Result<WorkSlice, TableError> {
        let now = Instant::now();
        let slice = self
            .slices
            .update(id, Guard::State(SliceState::Dead), |s| {
                s.state = apply(s.state, SliceAction::Revive)?;
                s.attempt_count = 0;
                s.last_error = None;
                s.back_to_pending(now);
                Ok(())
            })
            .await?;
        tracing::info!(slice = %id, "Dead slice revived");
        Ok(slice)
    }
}

/// Order pending candidates; ties always fall back to `(attack_id, index)`.
pub fn order_candidates(candidates: &mut [WorkSlice], ordering: SliceOrdering) {
    match ordering {
        SliceOrdering::OldestPendingFirst => {
            candidates.sort_by(|a, b| a.pending_since.cmp(&b.pending_since).then(a.id.cmp(&b.id)))
        }
        SliceOrdering::LargestRemainingFirst => {
            candidates.sort_by(|a, b| b.remaining().cmp(&a.remaining()).then(a.id.cmp(&b.id)))
        }
    }
}
