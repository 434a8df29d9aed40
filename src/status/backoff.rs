use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use crate::config::BackoffConfig;
use crate::AgentId;

#[derive(Debug, Clone, Default)]
struct AgentBackoff {
    level: u32,
    consecutive_successes: u32,
    until: Option<Instant>,
}

#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    refilled_at: Instant,
}

/// Per-agent exponential backoff plus a global token bucket that engages
/// after a burst of reconnects.
#[derive(Debug)]
pub struct BackoffController {
    config: BackoffConfig,
    agents: HashMap<AgentId, AgentBackoff>,
    reconnects: VecDeque<Instant>,
    smoothing_until: Option<Instant>,
    bucket: TokenBucket,
}

impl BackoffController {
    pub fn new(config: BackoffConfig) -> Self {
        let burst = f64::from(config.smoothing_burst);
        Self {
            config,
            agents: HashMap::new(),
            reconnects: VecDeque::new(),
            smoothing_until: None,
            bucket: TokenBucket {
                tokens: burst,
                refilled_at: Instant::now(),
            },
        }
    }

    /// Un-jittered delay for a backoff level.
    pub fn base_delay_for(&self, level: u32) -> Duration {
        if level == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(level - 1);
        self.config
            .base_delay
            .saturating_mul(factor)
            .min(self.config.max_delay)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        let jitter = self.config.jitter.clamp(0.0, 0.99);
        if jitter == 0.0 {
            return delay;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-jitter..=jitter);
        delay.mul_f64(factor)
    }

    /// Escalate the agent's backoff. Returns the new level and delay.
    pub fn record_failure(&mut self, agent_id: AgentId, now: Instant) -> (u32, Duration) {
        let level = {
            let entry = self.agents.entry(agent_id).or_default();
            entry.level = entry.level.saturating_add(1);
            entry.consecutive_successes = 0;
            entry.level
        };
        let delay = self.jittered(self.base_delay_for(level));
        if let Some(entry) = self.agents.get_mut(&agent_id) {
            entry.until = Some(now + delay);
        }
        tracing::debug!(agent_id, level, delay_ms = delay.as_millis() as u64, "Agent backing off");
        (level, delay)
    }

    /// Count a success; enough in a row drop the agent one level.
    pub fn record_success(&mut self, agent_id: AgentId) {
        let Some(entry) = self.agents.get_mut(&agent_id) else {
            return;
        };
        entry.consecutive_successes += 1;
        if entry.consecutive_successes >= self.config.relax_after_successes.max(1) {
            entry.level = entry.level.saturating_sub(1);
            entry.consecutive_successes = 0;
            if entry.level == 0 {
                self.agents.remove(&agent_id);
            }
        }
    }

    pub fn level(&self, agent_id: AgentId) -> u32 {
        self.agents.get(&agent_id).map_or(0, |e| e.level)
    }

    /// Remaining backoff for the agent, if any.
    pub fn retry_after(&self, agent_id: AgentId, now: Instant) -> Option<Duration> {
        self.agents
            .get(&agent_id)
            .and_then(|e| e.until)
            .filter(|until| *until > now)
            .map(|until| until - now)
    }

    /// Record a reconnect. Returns true if this one engaged smoothing.
    pub fn note_reconnect(&mut self, now: Instant) -> bool {
        let window = self.config.mass_reconnect_window;
        self.reconnects.push_back(now);
        while self
            .reconnects
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) > window)
        {
            self.reconnects.pop_front();
        }

        if self.is_smoothing(now) || self.reconnects.len() < self.config.mass_reconnect_threshold.max(1) {
            return false;
        }

        let reconnects = self.reconnects.len();
        self.reconnects.clear();
        self.smoothing_until = Some(now + self.config.smoothing_duration);
        self.bucket = TokenBucket {
            tokens: f64::from(self.config.smoothing_burst),
            refilled_at: now,
        };
        tracing::warn!(
            reconnects,
            duration_secs = self.config.smoothing_duration.as_secs(),
            "Mass reconnect, smoothing assignments"
        );
        true
    }

    pub fn is_smoothing(&self, now: Instant) -> bool {
        self.smoothing_until.is_some_and(|until| now < until)
    }

    /// Admit one assignment through the global throttle, or say how long to
    /// wait. Always admits outside a smoothing period.
    pub fn try_admit(&mut self, now: Instant) -> Result<(), Duration> {
        if !self.is_smoothing(now) {
            self.smoothing_until = None;
            return Ok(());
        }

        let rate = self.config.smoothed_assignments_per_sec.max(f64::MIN_POSITIVE);
        let burst = f64::from(self.config.smoothing_burst.max(1));
        let elapsed = now
            .saturating_duration_since(self.bucket.refilled_at)
            .as_secs_f64();
        self.bucket.tokens = (self.bucket.tokens + elapsed * rate).min(burst);
        self.bucket.refilled_at = now;

        if self.bucket.tokens >= 1.0 {
            self.bucket.tokens -= 1.0;
            Ok(())
        } else {
            let wait = (1.0 - self.bucket.tokens) / rate;
            Err(Duration::from_secs_f64(wait.min(self.config.smoothing_duration.as_secs_f64())))
        }
    }

    /// Return a token taken by `try_admit` that led to no assignment.
    pub fn refund(&mut self, now: Instant) {
        if self.is_smoothing(now) {
            let burst = f64::from(self.config.smoothing_burst.max(1));
            self.bucket.tokens = (self.bucket.tokens + 1.0).min(burst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(jitter: f64) -> BackoffConfig {
        BackoffConfig {
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            jitter,
            relax_after_successes: 2,
            mass_reconnect_threshold: 3,
            mass_reconnect_window: Duration::from_secs(10),
            smoothing_duration: Duration::from_secs(20),
            smoothed_assignments_per_sec: 2.0,
            smoothing_burst: 2,
        }
    }

    #[test]
    fn delay_doubles_up_to_max() {
        let backoff = BackoffController::new(config(0.0));
        let delays: Vec<u64> = (0..=6).map(|l| backoff.base_delay_for(l).as_secs()).collect();
        assert_eq!(delays, vec![0, 2, 4, 8, 16, 30, 30]);
        assert_eq!(backoff.base_delay_for(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let mut backoff = BackoffController::new(config(0.2));
        let now = Instant::now();
        for _ in 0..50 {
            backoff.agents.clear();
            let (_, delay) = backoff.record_failure(1, now);
            assert!(delay >= Duration::from_millis(1600), "{:?}", delay);
            assert!(delay <= Duration::from_millis(2400), "{:?}", delay);
        }
    }

    #[test]
    fn failures_escalate_and_successes_relax() {
        let mut backoff = BackoffController::new(config(0.0));
        let now = Instant::now();
        assert_eq!(backoff.record_failure(7, now), (1, Duration::from_secs(2)));
        assert_eq!(backoff.record_failure(7, now), (2, Duration::from_secs(4)));
        assert_eq!(backoff.retry_after(7, now), Some(Duration::from_secs(4)));
        assert_eq!(backoff.retry_after(7, now + Duration::from_secs(5)), None);

        backoff.record_success(7);
        assert_eq!(backoff.level(7), 2);
        backoff.record_success(7);
        assert_eq!(backoff.level(7), 1);

        // A failure resets the success streak.
        backoff.record_success(7);
        backoff.record_failure(7, now);
        assert_eq!(backoff.level(7), 2);
    }

    #[test]
    fn unknown_agents_are_never_backing_off() {
        let mut backoff = BackoffController::new(config(0.0));
        backoff.record_success(1);
        assert_eq!(backoff.level(1), 0);
        assert_eq!(backoff.retry_after(1, Instant::now()), None);
    }

    #[test]
    fn mass_reconnect_engages_token_bucket() {
        let mut backoff = BackoffController::new(config(0.0));
        let start = Instant::now();
        assert!(backoff.try_admit(start).is_ok());

        assert!(!backoff.note_reconnect(start));
        assert!(!backoff.note_reconnect(start));
        assert!(backoff.note_reconnect(start));
        assert!(backoff.is_smoothing(start));

        // Burst of two, then one every half second.
        assert!(backoff.try_admit(start).is_ok());
        assert!(backoff.try_admit(start).is_ok());
        let wait = backoff.try_admit(start).unwrap_err();
        assert_eq!(wait, Duration::from_millis(500));
        assert!(backoff.try_admit(start + Duration::from_millis(500)).is_ok());

        let after = start + Duration::from_secs(21);
        assert!(!backoff.is_smoothing(after));
        for _ in 0..10 {
            assert!(backoff.try_admit(after).is_ok());
        }
    }

    #[test]
    fn refunded_tokens_are_admitted_again() {
        let mut backoff = BackoffController::new(config(0.0));
        let start = Instant::now();
        for _ in 0..3 {
            backoff.note_reconnect(start);
        }
        assert!(backoff.try_admit(start).is_ok());
        assert!(backoff.try_admit(start).is_ok());
        assert!(backoff.try_admit(start).is_err());

        backoff.refund(start);
        assert!(backoff.try_admit(start).is_ok());

        // Refunds never exceed the burst.
        backoff.refund(start);
        backoff.refund(start);
        backoff.refund(start);
        assert!(backoff.try_admit(start).is_ok());
        assert!(backoff.try_admit(start).is_ok());
        assert!(backoff.try_admit(start).is_err());
    }

    #[test]
    fn spread_out_reconnects_do_not_smooth() {
        let mut backoff = BackoffController::new(config(0.0));
        let start = Instant::now();
        for i in 0..5 {
            assert!(!backoff.note_reconnect(start + Duration::from_secs(11 * i)));
        }
        assert!(!backoff.is_smoothing(start + Duration::from_secs(44)));
    }
}
