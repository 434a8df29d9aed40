use std::time::Duration;

use tokio::time::Instant;

/// Pseudo-success every agent starts with, so a fresh agent scores 1.0 and a
/// single failure does not zero it out.
const PRIOR_SUCCESSES: f64 = 1.0;

/// Rolling success ratio with exponential recency decay.
///
/// Each observation's weight halves every `half_life`. Old failures fade
/// towards the prior, so an agent that failed an hour ago scores higher than
/// one with the same failure count a minute ago.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reliability {
    successes: f64,
    failures: f64,
    updated_at: Instant,
    half_life: Duration,
}

impl Reliability {
    pub fn new(half_life: Duration, now: Instant) -> Self {
        Self {
            successes: 0.0,
            failures: 0.0,
            updated_at: now,
            half_life,
        }
    }

    fn decay(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.updated_at).as_secs_f64();
        let half_life = self.half_life.as_secs_f64();
        if half_life <= 0.0 {
            return if elapsed > 0.0 { 0.0 } else { 1.0 };
        }
        0.5f64.powf(elapsed / half_life)
    }

    pub fn record(&mut self, success: bool, now: Instant) {
        let k = self.decay(now);
        self.successes *= k;
        self.failures *= k;
        if success {
            self.successes += 1.0;
        } else {
            self.failures += 1.0;
        }
        self.updated_at = now;
    }

    /// Decayed success ratio in `[0,1]` as seen at `now`.
    pub fn score_at(&self, now: Instant) -> f64 {
        let k = self.decay(now);
        let successes = self.successes * k + PRIOR_SUCCESSES;
        let failures = self.failures * k;
        successes / (successes + failures)
    }

    /// Decayed failure weight, mostly useful in logs.
    pub fn recent_failures(&self, now: Instant) -> f64 {
        self.failures * self.decay(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HALF_LIFE: Duration = Duration::from_secs(600);

    #[test]
    fn fresh_agent_is_fully_reliable() {
        let now = Instant::now();
        let r = Reliability::new(HALF_LIFE, now);
        assert_eq!(r.score_at(now), 1.0);
    }

    #[test]
    fn failures_lower_the_score() {
        let now = Instant::now();
        let mut r = Reliability::new(HALF_LIFE, now);
        r.record(false, now);
        assert!((r.score_at(now) - 0.5).abs() < 1e-9);
        r.record(true, now);
        assert!((r.score_at(now) - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn recent_failures_weigh_more_than_old_ones() {
        let start = Instant::now();
        let later = start + Duration::from_secs(3600);

        let mut old_flake = Reliability::new(HALF_LIFE, start);
        old_flake.record(false, start);
        old_flake.record(false, start);

        let mut new_flake = Reliability::new(HALF_LIFE, start);
        new_flake.record(false, later);
        new_flake.record(false, later);

        assert!(old_flake.score_at(later) > new_flake.score_at(later));
        assert!(old_flake.recent_failures(later) < 0.1);
    }

    #[test]
    fn one_half_life_halves_the_weight() {
        let start = Instant::now();
        let mut r = Reliability::new(HALF_LIFE, start);
        r.record(false, start);
        let weight = r.recent_failures(start + HALF_LIFE);
        assert!((weight - 0.5).abs() < 1e-9);
    }
}
