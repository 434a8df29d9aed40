//! Agent eligibility and ranking. Everything here is a pure function of the
//! snapshots it is handed and the scoring instant.

use std::cmp::Ordering;
use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

use crate::agent::AgentSnapshot;
use crate::config::ScorerConfig;
use crate::{AgentId, HashMode};

#[derive(Debug, Clone, PartialEq)]
pub enum Ineligible {
    StaleHeartbeat(Duration),
    Unreliable(f64),
    NoBenchmark(HashMode),
}

impl fmt::Display for Ineligible {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ineligible::StaleHeartbeat(age) => {
                write!(f, "last heartbeat {}s ago", age.as_secs())
            }
            Ineligible::Unreliable(score) => write!(f, "reliability {:.2} below minimum", score),
            Ineligible::NoBenchmark(mode) => write!(f, "no benchmark for hash mode {}", mode),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RankedAgent {
    pub agent_id: AgentId,
    pub score: f64,
}

#[derive(Debug, Clone)]
pub struct AgentScorer {
    config: ScorerConfig,
}

impl AgentScorer {
    pub fn new(config: ScorerConfig) -> Self {
        Self { config }
    }

    /// Heartbeat freshness and reliability, independent of hash mode.
    pub fn check_healthy(&self, agent: &AgentSnapshot, now: Instant) -> Result<(), Ineligible> {
        let age = now.saturating_duration_since(agent.last_heartbeat_at);
        if age > self.config.heartbeat_staleness {
            return Err(Ineligible::StaleHeartbeat(age));
        }
        let reliability = agent.reliability.score_at(now);
        if reliability < self.config.min_reliability {
            return Err(Ineligible::Unreliable(reliability));
        }
        Ok(())
    }

    /// Full eligibility for `hash_mode`; returns the agent's rate for it.
    pub fn check_eligible(
        &self,
        agent: &AgentSnapshot,
        hash_mode: HashMode,
        now: Instant,
    ) -> Result<u64, Ineligible> {
        self.check_healthy(agent, now)?;
        agent
            .rate_for(hash_mode)
            .ok_or(Ineligible::NoBenchmark(hash_mode))
    }

    /// Benchmarks of every eligible agent for `hash_mode`.
    pub fn eligible_rates(
        &self,
        agents: &[AgentSnapshot],
        hash_mode: HashMode,
        now: Instant,
    ) -> Vec<u64> {
        agents
            .iter()
            .filter_map(|a| self.check_eligible(a, hash_mode, now).ok())
            .collect()
    }

    /// Eligible agents by descending score, ties by ascending id.
    pub fn rank(
        &self,
        agents: &[AgentSnapshot],
        hash_mode: HashMode,
        now: Instant,
    ) -> Vec<RankedAgent> {
        let eligible: Vec<(&AgentSnapshot, u64)> = agents
            .iter()
            .filter_map(|a| self.check_eligible(a, hash_mode, now).ok().map(|r| (a, r)))
            .collect();
        let max_rate = eligible.iter().map(|(_, r)| *r).max().unwrap_or(0);
        if max_rate == 0 {
            return Vec::new();
        }

        let mut ranked: Vec<RankedAgent> = eligible
            .into_iter()
            .map(|(agent, rate)| {
                let hashrate_norm = rate as f64 / max_rate as f64;
                let reliability = agent.reliability.score_at(now);
                RankedAgent {
                    agent_id: agent.agent_id,
                    score: hashrate_norm * reliability / (1.0 + f64::from(agent.current_load)),
                }
            })
            .collect();
        ranked.sort_by(|a, b| match b.score.total_cmp(&a.score) {
            Ordering::Equal => a.agent_id.cmp(&b.agent_id),
            other => other,
        });
        ranked
    }

    /// Zero-based position of `agent_id` in [`rank`](Self::rank).
    pub fn rank_of(
        &self,
        agents: &[AgentSnapshot],
        hash_mode: HashMode,
        agent_id: AgentId,
        now: Instant,
    ) -> Option<usize> {
        self.rank(agents, hash_mode, now)
            .iter()
            .position(|r| r.agent_id == agent_id)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::agent::Reliability;

    const HALF_LIFE: Duration = Duration::from_secs(600);

    fn scorer() -> AgentScorer {
        AgentScorer::new(ScorerConfig {
            heartbeat_staleness: Duration::from_secs(30),
            min_reliability: 0.3,
            reliability_half_life: HALF_LIFE,
        })
    }

    fn agent(id: AgentId, rate: u64, load: u32, now: Instant) -> AgentSnapshot {
        AgentSnapshot {
            agent_id: id,
            benchmarks: HashMap::from([(0, rate)]),
            reliability: Reliability::new(HALF_LIFE, now),
            current_load: load,
            last_heartbeat_at: now,
        }
    }

    #[test]
    fn faster_agents_rank_first() {
        let now = Instant::now();
        let agents = vec![agent(1, 100, 0, now), agent(2, 400, 0, now)];
        let ranked = scorer().rank(&agents, 0, now);
        assert_eq!(ranked[0].agent_id, 2);
        assert_eq!(ranked[0].score, 1.0);
        assert_eq!(ranked[1].score, 0.25);
    }

    #[test]
    fn load_divides_score() {
        let now = Instant::now();
        let agents = vec![agent(1, 400, 3, now), agent(2, 200, 0, now)];
        let ranked = scorer().rank(&agents, 0, now);
        assert_eq!(ranked[0].agent_id, 2);
        assert_eq!(ranked[1].score, 0.25);
    }

    #[test]
    fn ties_break_by_agent_id() {
        let now = Instant::now();
        let agents = vec![
            agent(9, 100, 0, now),
            agent(3, 100, 0, now),
            agent(5, 100, 0, now),
        ];
        let ids: Vec<AgentId> = scorer().rank(&agents, 0, now).iter().map(|r| r.agent_id).collect();
        assert_eq!(ids, vec![3, 5, 9]);
    }

    #[test]
    fn ranking_is_deterministic_and_pure() {
        let now = Instant::now();
        let agents = vec![agent(1, 100, 1, now), agent(2, 300, 2, now), agent(3, 50, 0, now)];
        let before = format!("{:?}", agents);
        let first = scorer().rank(&agents, 0, now);
        let second = scorer().rank(&agents, 0, now);
        assert_eq!(first, second);
        assert_eq!(before, format!("{:?}", agents));
    }

    #[test]
    fn ineligible_agents_are_excluded() {
        let now = Instant::now();
        let later = now + Duration::from_secs(60);
        let scorer = scorer();

        let stale = agent(1, 100, 0, now);
        assert!(matches!(
            scorer.check_eligible(&stale, 0, later),
            Err(Ineligible::StaleHeartbeat(_))
        ));

        let mut flaky = agent(2, 100, 0, now);
        for _ in 0..5 {
            flaky.reliability.record(false, now);
        }
        assert!(matches!(
            scorer.check_eligible(&flaky, 0, now),
            Err(Ineligible::Unreliable(_))
        ));

        let healthy = agent(3, 100, 0, now);
        assert_eq!(
            scorer.check_eligible(&healthy, 1000, now),
            Err(Ineligible::NoBenchmark(1000))
        );
        assert_eq!(scorer.check_eligible(&healthy, 0, now), Ok(100));

        let ranked = scorer.rank(&[stale, flaky, healthy], 0, now);
        assert_eq!(ranked.len(), 1);
        assert_eq!(scorer.rank_of(&[agent(3, 100, 0, now)], 0, 3, now), Some(0));
    }
}
