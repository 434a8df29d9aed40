use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::agent::reliability::Reliability;
use crate::{AgentId, HashMode};

/// Point-in-time view of an agent, consumed by the scorer and planner.
#[derive(Debug, Clone)]
pub struct AgentSnapshot {
    pub agent_id: AgentId,
    /// Benchmarked candidates per second, keyed by hash mode.
    pub benchmarks: HashMap<HashMode, u64>,
    pub reliability: Reliability,
    /// Slices currently leased to the agent.
    pub current_load: u32,
    pub last_heartbeat_at: Instant,
}

impl AgentSnapshot {
    pub fn rate_for(&self, hash_mode: HashMode) -> Option<u64> {
        self.benchmarks.get(&hash_mode).copied().filter(|&r| r > 0)
    }
}

/// Agent state tracking
#[derive(Debug, Clone)]
pub struct AgentState {
    pub id: AgentId,
    pub benchmarks: HashMap<HashMode, u64>,
    pub reliability: Reliability,
    pub current_load: u32,
    pub last_heartbeat: Instant,
}

impl AgentState {
    pub fn new(id: AgentId, half_life: Duration, now: Instant) -> Self {
        Self {
            id,
            benchmarks: HashMap::new(),
            reliability: Reliability::new(half_life, now),
            current_load: 0,
            last_heartbeat: now,
        }
    }

    pub fn is_alive(&self, timeout: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.last_heartbeat) < timeout
    }

    pub fn snapshot(&self) -> AgentSnapshot {
        AgentSnapshot {
            agent_id: self.id,
            benchmarks: self.benchmarks.clone(),
            reliability: self.reliability,
            current_load: self.current_load,
            last_heartbeat_at: self.last_heartbeat,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    Registered,
    Alive,
    /// The agent had gone stale and is back.
    Reconnected,
}

/// In-process stand-in for the agent registry/heartbeat subsystem.
#[derive(Debug)]
pub struct AgentRegistry {
    agents: HashMap<AgentId, AgentState>,
    heartbeat_timeout: Duration,
    half_life: Duration,
}

impl AgentRegistry {
    pub fn new(heartbeat_timeout: Duration, half_life: Duration) -> Self {
        Self {
            agents: HashMap::new(),
            heartbeat_timeout,
            half_life,
        }
    }

    /// Register an agent, replacing its benchmarks if it already exists.
    pub fn register_agent(&mut self, agent_id: AgentId, benchmarks: HashMap<HashMode, u64>) {
        let now = Instant::now();
        let half_life = self.half_life;
        let agent = self
            .agents
            .entry(agent_id)
            .or_insert_with(|| AgentState::new(agent_id, half_life, now));
        agent.benchmarks = benchmarks;
        agent.last_heartbeat = now;
        tracing::info!(agent_id, modes = agent.benchmarks.len(), "Agent registered");
    }

    /// Update heartbeat, auto-registering unknown agents.
    pub fn heartbeat(&mut self, agent_id: AgentId) -> HeartbeatOutcome {
        let now = Instant::now();
        match self.agents.get_mut(&agent_id) {
            Some(agent) => {
                let was_alive = agent.is_alive(self.heartbeat_timeout, now);
                agent.last_heartbeat = now;
                if was_alive {
                    HeartbeatOutcome::Alive
                } else {
                    tracing::info!(agent_id, "Agent reconnected");
                    HeartbeatOutcome::Reconnected
                }
            }
            None => {
                self.register_agent(agent_id, HashMap::new());
                HeartbeatOutcome::Registered
            }
        }
    }

    pub fn update_benchmark(&mut self, agent_id: AgentId, hash_mode: HashMode, rate: u64) -> bool {
        match self.agents.get_mut(&agent_id) {
            Some(agent) => {
                agent.benchmarks.insert(hash_mode, rate);
                true
            }
            None => false,
        }
    }

    pub fn adjust_load(&mut self, agent_id: AgentId, delta: i32) {
        if let Some(agent) = self.agents.get_mut(&agent_id) {
            agent.current_load = agent.current_load.saturating_add_signed(delta);
        }
    }

    pub fn record_outcome(&mut self, agent_id: AgentId, success: bool) {
        if let Some(agent) = self.agents.get_mut(&agent_id) {
            agent.reliability.record(success, Instant::now());
        }
    }

    pub fn get(&self, agent_id: AgentId) -> Option<&AgentState> {
        self.agents.get(&agent_id)
    }

    pub fn snapshot(&self, agent_id: AgentId) -> Option<AgentSnapshot> {
        self.agents.get(&agent_id).map(AgentState::snapshot)
    }

    /// Snapshots of every known agent, ordered by id.
    pub fn snapshots(&self) -> Vec<AgentSnapshot> {
        let mut snapshots: Vec<AgentSnapshot> =
            self.agents.values().map(AgentState::snapshot).collect();
        snapshots.sort_by_key(|s| s.agent_id);
        snapshots
    }

    /// Agents whose heartbeat has lapsed.
    pub fn stale_agents(&self) -> Vec<AgentId> {
        let now = Instant::now();
        let mut stale: Vec<AgentId> = self
            .agents
            .values()
            .filter(|a| !a.is_alive(self.heartbeat_timeout, now))
            .map(|a| a.id)
            .collect();
        stale.sort_unstable();
        stale
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> AgentRegistry {
        AgentRegistry::new(Duration::from_secs(30), Duration::from_secs(600))
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_auto_registers_then_stays_alive() {
        let mut agents = registry();
        assert_eq!(agents.heartbeat(7), HeartbeatOutcome::Registered);
        assert_eq!(agents.heartbeat(7), HeartbeatOutcome::Alive);
        assert_eq!(agents.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_agent_reconnects() {
        let mut agents = registry();
        agents.register_agent(1, HashMap::from([(0, 1000)]));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(agents.stale_agents(), vec![1]);
        assert_eq!(agents.heartbeat(1), HeartbeatOutcome::Reconnected);
        assert!(agents.stale_agents().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn load_never_underflows() {
        let mut agents = registry();
        agents.register_agent(1, HashMap::new());
        agents.adjust_load(1, 2);
        agents.adjust_load(1, -5);
        assert_eq!(agents.get(1).unwrap().current_load, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_exposes_positive_rates_only() {
        let mut agents = registry();
        agents.register_agent(1, HashMap::from([(0, 5000), (1000, 0)]));
        assert!(agents.update_benchmark(1, 1400, 200));
        assert!(!agents.update_benchmark(9, 1400, 200));

        let snap = agents.snapshot(1).unwrap();
        assert_eq!(snap.rate_for(0), Some(5000));
        assert_eq!(snap.rate_for(1000), None);
        assert_eq!(snap.rate_for(1400), Some(200));
    }

    #[tokio::test(start_paused = true)]
    async fn recorded_failures_show_in_snapshot() {
        let mut agents = registry();
        agents.register_agent(1, HashMap::new());
        agents.record_outcome(1, false);
        let snap = agents.snapshot(1).unwrap();
        assert!(snap.reliability.score_at(Instant::now()) < 1.0);
    }
}
