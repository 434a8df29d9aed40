use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agent::{AgentRegistry, HeartbeatOutcome};
use crate::api::{run_api, ApiState};
use crate::attack::{AttackAction, AttackRecord, AttackState, AttackTable};
use crate::config::EngineConfig;
use crate::error::{DispatchError, PlanningError, Result};
use crate::events::{EngineEvent, EventBus};
use crate::lease::{FencingToken, LeaseManager, LeaseStore, MemoryLeaseStore};
use crate::planner::{KeyspaceSource, TaskPlan, TaskPlanner};
use crate::scorer::AgentScorer;
use crate::slice::{
    ActiveAttack, ResultSummary, SliceId, SliceRequest, SliceState, SliceTable, WorkSlice,
    WorkSliceManager,
};
use crate::status::{Ack, BackoffController, StatusStreamProcessor};
use crate::{AgentId, AttackId, HashMode};

/// State shared by every engine instance in a deployment. Each handle is
/// constructed explicitly and passed in.
#[derive(Clone)]
pub struct SharedStores {
    pub slices: Arc<SliceTable>,
    pub leases: Arc<dyn LeaseStore>,
    pub attacks: Arc<AttackTable>,
    pub agents: Arc<RwLock<AgentRegistry>>,
    pub backoff: Arc<Mutex<BackoffController>>,
    pub events: EventBus,
}

impl SharedStores {
    /// In-memory stores sized from `config`.
    pub fn in_memory(config: &EngineConfig) -> Self {
        Self {
            slices: Arc::new(SliceTable::new()),
            leases: Arc::new(MemoryLeaseStore::new()),
            attacks: Arc::new(AttackTable::new()),
            agents: Arc::new(RwLock::new(AgentRegistry::new(
                config.scorer.heartbeat_staleness,
                config.scorer.reliability_half_life,
            ))),
            backoff: Arc::new(Mutex::new(BackoffController::new(config.backoff.clone()))),
            events: EventBus::new(config.event_capacity),
        }
    }
}

/// Snapshot of an attack's progress.
#[derive(Debug, Clone)]
pub struct AttackProgress {
    pub attack_id: AttackId,
    pub state: AttackState,
    pub total_keyspace: u128,
    pub keyspace_processed: u128,
    pub percent_complete: f64,
    pub slices_by_state: BTreeMap<SliceState, usize>,
    pub dead_slices: Vec<SliceId>,
    /// Sum of the last reported rates of held slices.
    pub aggregate_rate: u64,
    pub eta: Option<Duration>,
}

impl AttackProgress {
    pub fn dead_slice_count(&self) -> usize {
        self.dead_slices.len()
    }

    /// An attack is degraded while any slice is dead.
    pub fn degraded(&self) -> bool {
        !self.dead_slices.is_empty()
    }

    pub fn ensure_healthy(&self) -> Result<()> {
        match self.dead_slices.first() {
            Some(id) => Err(DispatchError::SliceDead(*id)),
            None => Ok(()),
        }
    }
}

/// One scheduler instance: the public operations plus its own sweep timer.
pub struct Engine {
    config: EngineConfig,
    stores: SharedStores,
    planner: TaskPlanner,
    scorer: AgentScorer,
    slices: WorkSliceManager,
    status: StatusStreamProcessor,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let stores = SharedStores::in_memory(&config);
        Self::with_stores(config, stores)
    }

    pub fn with_stores(config: EngineConfig, stores: SharedStores) -> Self {
        let scorer = AgentScorer::new(config.scorer.clone());
        let leases = LeaseManager::new(stores.leases.clone(), config.lease.ttl);
        let slices = WorkSliceManager::new(
            stores.slices.clone(),
            leases,
            stores.agents.clone(),
            stores.backoff.clone(),
            scorer.clone(),
            stores.events.clone(),
            config.assignment.clone(),
        );
        let status = StatusStreamProcessor::new(
            slices.clone(),
            stores.attacks.clone(),
            stores.agents.clone(),
            stores.backoff.clone(),
            stores.events.clone(),
        );
        Self {
            planner: TaskPlanner::new(config.planner.clone()),
            config,
            stores,
            scorer,
            slices,
            status,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn stores(&self) -> &SharedStores {
        &self.stores
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.stores.events.subscribe()
    }

    pub async fn register_agent(&self, agent_id: AgentId, benchmarks: HashMap<HashMode, u64>) {
        self.stores
            .agents
            .write()
            .await
            .register_agent(agent_id, benchmarks);
    }

    /// Heartbeat with optional benchmark updates. Reconnects count towards
    /// mass-reconnect detection.
    pub async fn heartbeat(
        &self,
        agent_id: AgentId,
        benchmarks: HashMap<HashMode, u64>,
    ) -> HeartbeatOutcome {
        let outcome = {
            let mut agents = self.stores.agents.write().await;
            let outcome = agents.heartbeat(agent_id);
            for (hash_mode, rate) in benchmarks {
                agents.update_benchmark(agent_id, hash_mode, rate);
            }
            outcome
        };

        if outcome == HeartbeatOutcome::Reconnected {
            let engaged = self
                .stores
                .backoff
                .lock()
                .await
                .note_reconnect(Instant::now());
            if engaged {
                self.stores.events.publish(EngineEvent::AssignmentSmoothing {
                    reconnects: self.config.backoff.mass_reconnect_threshold,
                    duration_ms: u64::try_from(self.config.backoff.smoothing_duration.as_millis())
                        .unwrap_or(u64::MAX),
                });
            }
        }
        outcome
    }

    async fn slice_size_for(&self, hash_mode: HashMode) -> u128 {
        let fleet = self.stores.agents.read().await.snapshots();
        let rates = self
            .scorer
            .eligible_rates(&fleet, hash_mode, Instant::now());
        self.planner.slice_size(&rates)
    }

    /// Plan an attack and materialize its slices. Calling again with the same
    /// total and hash mode returns the existing plan; a different total
    /// re-slices.
    pub async fn create_task_plan(
        &self,
        attack_id: AttackId,
        keyspace: impl Into<KeyspaceSource>,
        hash_mode: HashMode,
    ) -> Result<Uuid> {
        let source = keyspace.into();
        let _planning = self.stores.attacks.planning_lock().await;
        let record = self.stores.attacks.get_or_insert(attack_id, hash_mode).await;

        if record.state == AttackState::Completed {
            return match (source.resolve(), &record.plan) {
                (Ok(total), Some(plan))
                    if plan.total_keyspace == total && plan.hash_mode == hash_mode =>
                {
                    Ok(plan.id)
                }
                _ => Err(PlanningError::NotPlannable {
                    attack_id,
                    state: record.state.to_string(),
                }
                .into()),
            };
        }

        let total = match source.resolve() {
            Ok(total) => total,
            Err(e) => return Err(self.fail_planning(attack_id, e).await),
        };

        if let Some(plan) = &record.plan {
            let live = matches!(record.state, AttackState::Running | AttackState::Paused);
            if live && plan.total_keyspace == total && plan.hash_mode == hash_mode {
                tracing::debug!(attack_id, plan_id = %plan.id, "Plan already exists");
                return Ok(plan.id);
            }
        }

        match record.state {
            AttackState::Failed => {
                self.stores
                    .attacks
                    .transition(attack_id, AttackAction::Retry)
                    .await?;
            }
            AttackState::Abandoned => {
                self.stores
                    .attacks
                    .transition(attack_id, AttackAction::Reactivate)
                    .await?;
            }
            _ => {}
        }

        let plan = self
            .plan_locked(attack_id, record.hash_mode, total, hash_mode)
            .await?;
        Ok(plan.id)
    }

    /// Re-slice a planned attack for a new keyspace total. Work already
    /// leased, completed or dead is kept when it still fits.
    pub async fn replan_attack(
        &self,
        attack_id: AttackId,
        keyspace: impl Into<KeyspaceSource>,
    ) -> Result<Uuid> {
        let source = keyspace.into();
        let _planning = self.stores.attacks.planning_lock().await;
        let record = self.stores.attacks.require(attack_id).await?;
        if !matches!(record.state, AttackState::Running | AttackState::Paused) {
            return Err(PlanningError::NotPlannable {
                attack_id,
                state: record.state.to_string(),
            }
            .into());
        }

        let total = match source.resolve() {
            Ok(total) => total,
            Err(e) => return Err(self.fail_planning(attack_id, e).await),
        };
        let plan = self
            .plan_locked(attack_id, record.hash_mode, total, record.hash_mode)
            .await?;
        Ok(plan.id)
    }

    /// Materialize slices for `total`. Caller holds the planning lock.
    async fn plan_locked(
        &self,
        attack_id: AttackId,
        previous_hash_mode: HashMode,
        total: u128,
        hash_mode: HashMode,
    ) -> Result<TaskPlan> {
        let table = &self.stores.slices;
        if previous_hash_mode != hash_mode {
            // Completed ranges mean nothing under another hash mode.
            self.slices.invalidate(attack_id).await?;
        }

        let slice_size = self.slice_size_for(hash_mode).await;
        let existing = !table.for_attack(attack_id).await.is_empty();

        let plan = if existing {
            let reslice = match table
                .reslice(
                    attack_id,
                    total,
                    slice_size,
                    self.planner.config().max_slices_per_attack,
                )
                .await
            {
                Ok(reslice) => reslice,
                Err(crate::slice::ResliceError::Planning(e)) => {
                    return Err(self.fail_planning(attack_id, e).await)
                }
                Err(e) => return Err(e.into()),
            };
            let revoked = self.slices.discard(&reslice.removed).await?;
            tracing::info!(
                attack_id,
                removed = reslice.removed.len(),
                created = reslice.created.len(),
                revoked,
                reset = reslice.reset,
                "Attack re-sliced"
            );
            self.stores.events.publish(EngineEvent::SlicesCreated {
                attack_id,
                count: reslice.created.len(),
            });
            let slice_count = table.for_attack(attack_id).await.len() as u64;
            TaskPlan::new(attack_id, total, slice_size, slice_count, hash_mode)
        } else {
            let (plan, ranges) = match self.planner.plan(attack_id, total, hash_mode, slice_size) {
                Ok(planned) => planned,
                Err(e) => return Err(self.fail_planning(attack_id, e).await),
            };
            let created = table.insert_ranges(attack_id, &ranges).await?;
            self.stores.events.publish(EngineEvent::SlicesCreated {
                attack_id,
                count: created.len(),
            });
            plan
        };

        let stored = plan.clone();
        let record = self
            .stores
            .attacks
            .update(attack_id, move |r| {
                r.plan = Some(stored);
                r.hash_mode = hash_mode;
                r.last_error = None;
            })
            .await?;

        tracing::info!(
            attack_id,
            plan_id = %plan.id,
            total = %plan.total_keyspace,
            slice_size = %plan.slice_size,
            slices = plan.slice_count,
            "Task plan created"
        );
        if record.state == AttackState::Pending {
            self.stores
                .attacks
                .transition(attack_id, AttackAction::Start)
                .await?;
            self.stores.events.publish(EngineEvent::AttackStarted {
                attack_id,
                plan_id: plan.id,
                slice_count: plan.slice_count,
            });
        }
        Ok(plan)
    }

    /// Drop all slices and mark the attack failed. Returns the error to
    /// surface to the caller.
    async fn fail_planning(&self, attack_id: AttackId, err: PlanningError) -> DispatchError {
        tracing::error!(attack_id, error = %err, "Planning failed");
        if let Err(e) = self.slices.invalidate(attack_id).await {
            tracing::error!(attack_id, error = %e, "Failed to invalidate slices");
        }

        let path: &[AttackAction] = match self.stores.attacks.get(attack_id).await.map(|a| a.state) {
            Some(AttackState::Pending) => &[AttackAction::Start, AttackAction::Fail],
            Some(AttackState::Running) => &[AttackAction::Fail],
            Some(AttackState::Paused) => &[AttackAction::Resume, AttackAction::Fail],
            _ => &[],
        };
        for action in path {
            if let Err(e) = self.stores.attacks.transition(attack_id, *action).await {
                tracing::error!(attack_id, error = %e, "Failed to mark attack failed");
                break;
            }
        }
        let reason = err.to_string();
        if let Err(e) = self
            .stores
            .attacks
            .update(attack_id, |r| {
                r.plan = None;
                r.last_error = Some(reason.clone());
            })
            .await
        {
            tracing::error!(attack_id, error = %e, "Failed to record planning failure");
        }
        self.stores
            .events
            .publish(EngineEvent::AttackFailed { attack_id, reason });
        err.into()
    }

    /// Offer the agent one slice from whichever of `eligible_attack_ids` are
    /// running.
    pub async fn request_slice(
        &self,
        agent_id: AgentId,
        eligible_attack_ids: &[AttackId],
    ) -> Result<SliceRequest> {
        let active: Vec<ActiveAttack> = self
            .stores
            .attacks
            .running(eligible_attack_ids)
            .await
            .into_iter()
            .map(|a| ActiveAttack {
                attack_id: a.id,
                hash_mode: a.hash_mode,
                cancel: a.cancel,
            })
            .collect();
        self.slices.request_slice(agent_id, &active).await
    }

    pub async fn report_progress(
        &self,
        lease_token: FencingToken,
        slice_id: SliceId,
        candidates_tested: u128,
        rate: u64,
    ) -> Result<Ack> {
        self.status
            .report_progress(lease_token, slice_id, candidates_tested, rate)
            .await
    }

    pub async fn report_completion(
        &self,
        lease_token: FencingToken,
        slice_id: SliceId,
        result_summary: ResultSummary,
    ) -> Result<Ack> {
        self.status
            .report_completion(lease_token, slice_id, result_summary)
            .await
    }

    pub async fn report_failure(
        &self,
        lease_token: FencingToken,
        slice_id: SliceId,
        reason: &str,
    ) -> Result<Ack> {
        self.status.report_failure(lease_token, slice_id, reason).await
    }

    pub async fn request_split(
        &self,
        lease_token: FencingToken,
        slice_id: SliceId,
        at: Option<u128>,
    ) -> Result<(WorkSlice, WorkSlice)> {
        self.status.request_split(lease_token, slice_id, at).await
    }

    pub async fn get_attack_progress(&self, attack_id: AttackId) -> Result<AttackProgress> {
        let record = self.stores.attacks.require(attack_id).await?;
        let slices = self.stores.slices.for_attack(attack_id).await;

        let mut slices_by_state = BTreeMap::new();
        let mut dead_slices = Vec::new();
        let mut processed: u128 = 0;
        let mut aggregate_rate: u64 = 0;
        for slice in &slices {
            *slices_by_state.entry(slice.state).or_insert(0) += 1;
            if slice.state == SliceState::Dead {
                dead_slices.push(slice.id);
            }
            if slice.state.is_held() {
                aggregate_rate = aggregate_rate.saturating_add(slice.rate);
            }
            processed = processed.saturating_add(slice.processed());
        }

        let total = record.plan.as_ref().map_or(0, |p| p.total_keyspace);
        let percent_complete = if total == 0 {
            0.0
        } else {
            (processed as f64 / total as f64 * 100.0).min(100.0)
        };
        let remaining = total.saturating_sub(processed);
        let eta = (aggregate_rate > 0 && remaining > 0).then(|| {
            let secs = remaining / u128::from(aggregate_rate);
            Duration::from_secs(u64::try_from(secs).unwrap_or(u64::MAX))
        });

        Ok(AttackProgress {
            attack_id,
            state: record.state,
            total_keyspace: total,
            keyspace_processed: processed,
            percent_complete,
            slices_by_state,
            dead_slices,
            aggregate_rate,
            eta,
        })
    }

    /// Stop handing out work for the attack. Outstanding leases are revoked
    /// and every non-terminal slice is parked in `paused`.
    pub async fn pause_attack(&self, attack_id: AttackId) -> Result<usize> {
        self.stores
            .attacks
            .transition(attack_id, AttackAction::Pause)
            .await?;
        let revoked = self.slices.pause_slices(attack_id).await?;
        tracing::info!(attack_id, revoked, "Attack paused");
        self.stores
            .events
            .publish(EngineEvent::AttackPaused { attack_id, revoked });
        Ok(revoked)
    }

    pub async fn resume_attack(&self, attack_id: AttackId) -> Result<usize> {
        self.stores
            .attacks
            .transition(attack_id, AttackAction::Resume)
            .await?;
        let resumed = self.slices.resume_slices(attack_id).await;
        tracing::info!(attack_id, resumed, "Attack resumed");
        self.stores
            .events
            .publish(EngineEvent::AttackResumed { attack_id });
        Ok(resumed)
    }

    /// Abandon the attack. Slices stay as paused records so completed work
    /// survives a later reactivation.
    pub async fn cancel_attack(&self, attack_id: AttackId) -> Result<usize> {
        let record = self.stores.attacks.require(attack_id).await?;
        let action = if record.state == AttackState::Pending {
            AttackAction::Abandon
        } else {
            AttackAction::Abort
        };
        self.stores.attacks.transition(attack_id, action).await?;
        let revoked = self.slices.pause_slices(attack_id).await?;
        tracing::info!(attack_id, revoked, "Attack cancelled");
        self.stores
            .events
            .publish(EngineEvent::AttackCancelled { attack_id, revoked });
        Ok(revoked)
    }

    pub async fn revive_slice(&self, slice_id: SliceId) -> Result<WorkSlice> {
        Ok(self.slices.revive(slice_id).await?)
    }

    pub async fn attack(&self, attack_id: AttackId) -> Option<AttackRecord> {
        self.stores.attacks.get(attack_id).await
    }

    pub async fn slices(&self, attack_id: AttackId) -> Vec<WorkSlice> {
        self.stores.slices.for_attack(attack_id).await
    }

    /// One reclamation pass; returns how many slices went back to pending.
    pub async fn sweep_once(&self) -> Result<usize> {
        Ok(self.slices.reclaim_expired().await?.len())
    }

    /// Run the sweep timer (and the API, if configured) until `shutdown`.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let sweeper = self.clone();
        let sweep_shutdown = shutdown.clone();
        let sweep_handle = tokio::spawn(async move {
            sweeper.sweep_loop(sweep_shutdown).await;
        });

        let api_handle = self.config.api_addr.map(|addr| {
            let state = ApiState {
                engine: self.clone(),
            };
            let api_shutdown = shutdown.clone();
            tokio::spawn(async move {
                run_api(addr, state, api_shutdown).await;
            })
        });

        tracing::info!(
            instance_id = self.config.instance_id,
            lease_ttl_secs = self.config.lease.ttl.as_secs(),
            sweep_interval_ms = self.config.lease.sweep_interval.as_millis() as u64,
            "Engine running"
        );
        shutdown.cancelled().await;

        if let Err(e) = sweep_handle.await {
            tracing::error!(error = %e, "Sweep task panicked");
        }
        if let Some(handle) = api_handle {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "API task panicked");
            }
        }
        tracing::info!(instance_id = self.config.instance_id, "Engine stopped");
    }

    async fn sweep_loop(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.lease.sweep_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    match self.sweep_once().await {
                        Ok(0) => {}
                        Ok(reclaimed) => {
                            tracing::info!(instance_id = self.config.instance_id, reclaimed, "Sweep reclaimed slices");
                        }
                        Err(e) => {
                            tracing::error!(instance_id = self.config.instance_id, error = %e, "Sweep failed");
                        }
                    }
                }
            }
        }
    }
}
