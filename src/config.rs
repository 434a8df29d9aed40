use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

/// Lease timing.
#[derive(Debug, Clone)]
pub struct LeaseConfig {
    /// Time a lease stays live without renewal.
    pub ttl: Duration,
    /// Period of the background sweep that reclaims lapsed leases.
    pub sweep_interval: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(5),
        }
    }
}

/// Keyspace partitioning knobs.
#[derive(Debug, Clone)]
pub struct PlannerConfig {
    /// Wall-clock work a single slice should represent on a typical agent.
    pub target_slice_duration: Duration,
    pub min_slice_size: u128,
    pub max_slice_size: u128,
    /// How many of the fastest eligible agents feed the effective rate.
    pub rate_sample_agents: usize,
    /// Upper bound on slices materialized for one attack.
    pub max_slices_per_attack: u64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            target_slice_duration: Duration::from_secs(300),
            min_slice_size: 10_000,
            max_slice_size: 1_000_000_000_000_000,
            rate_sample_agents: 3,
            max_slices_per_attack: 1_000_000,
        }
    }
}

/// Agent eligibility and reliability tuning.
#[derive(Debug, Clone)]
pub struct ScorerConfig {
    /// Agents whose last heartbeat is older than this are never assigned work.
    pub heartbeat_staleness: Duration,
    /// Minimum decayed reliability in `[0,1]`.
    pub min_reliability: f64,
    /// Half-life of a success/failure observation.
    pub reliability_half_life: Duration,
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            heartbeat_staleness: Duration::from_secs(90),
            min_reliability: 0.25,
            reliability_half_life: Duration::from_secs(30 * 60),
        }
    }
}

/// Order in which pending slices are offered to a requesting agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SliceOrdering {
    #[default]
    OldestPendingFirst,
    LargestRemainingFirst,
}

impl fmt::Display for SliceOrdering {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SliceOrdering::OldestPendingFirst => write!(f, "oldest-pending-first"),
            SliceOrdering::LargestRemainingFirst => write!(f, "largest-remaining-first"),
        }
    }
}

impl FromStr for SliceOrdering {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "oldest-pending-first" | "oldest" => Ok(SliceOrdering::OldestPendingFirst),
            "largest-remaining-first" | "largest" => Ok(SliceOrdering::LargestRemainingFirst),
            other => Err(format!("unknown slice ordering: {}", other)),
        }
    }
}

/// Assignment protocol tuning.
#[derive(Debug, Clone)]
pub struct AssignmentConfig {
    pub ordering: SliceOrdering,
    /// Lease attempts per request before giving up under contention.
    pub max_lease_attempts: usize,
    /// Failure reports a slice may take; the last one declares it dead.
    pub max_attempts: u32,
    /// How long a pending slice is held for better-ranked agents before any
    /// eligible agent may take it.
    pub reservation_window: Duration,
}

impl Default for AssignmentConfig {
    fn default() -> Self {
        Self {
            ordering: SliceOrdering::default(),
            max_lease_attempts: 3,
            max_attempts: 3,
            reservation_window: Duration::from_secs(10),
        }
    }
}

/// Per-agent backoff and global assignment smoothing.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Relative jitter applied to each delay, in `[0,1)`.
    pub jitter: f64,
    /// Consecutive successes needed to drop one backoff level.
    pub relax_after_successes: u32,
    /// Reconnects within `mass_reconnect_window` that engage smoothing.
    pub mass_reconnect_threshold: usize,
    pub mass_reconnect_window: Duration,
    pub smoothing_duration: Duration,
    pub smoothed_assignments_per_sec: f64,
    pub smoothing_burst: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(300),
            jitter: 0.2,
            relax_after_successes: 3,
            mass_reconnect_threshold: 10,
            mass_reconnect_window: Duration::from_secs(10),
            smoothing_duration: Duration::from_secs(30),
            smoothed_assignments_per_sec: 5.0,
            smoothing_burst: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Distinguishes scheduler instances in logs.
    pub instance_id: u64,
    pub lease: LeaseConfig,
    pub planner: PlannerConfig,
    pub scorer: ScorerConfig,
    pub assignment: AssignmentConfig,
    pub backoff: BackoffConfig,
    /// Address for the JSON API. `None` runs the engine headless.
    pub api_addr: Option<SocketAddr>,
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            instance_id: 1,
            lease: LeaseConfig::default(),
            planner: PlannerConfig::default(),
            scorer: ScorerConfig::default(),
            assignment: AssignmentConfig::default(),
            backoff: BackoffConfig::default(),
            api_addr: None,
            event_capacity: 1024,
        }
    }
}

impl EngineConfig {
    pub fn new(instance_id: u64) -> Self {
        Self {
            instance_id,
            ..Default::default()
        }
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease.ttl = ttl;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.lease.sweep_interval = interval;
        self
    }

    pub fn with_target_slice_duration(mut self, duration: Duration) -> Self {
        self.planner.target_slice_duration = duration;
        self
    }

    pub fn with_slice_bounds(mut self, min: u128, max: u128) -> Self {
        self.planner.min_slice_size = min;
        self.planner.max_slice_size = max;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.assignment.max_attempts = max_attempts;
        self
    }

    pub fn with_ordering(mut self, ordering: SliceOrdering) -> Self {
        self.assignment.ordering = ordering;
        self
    }

    pub fn with_api_addr(mut self, addr: SocketAddr) -> Self {
        self.api_addr = Some(addr);
        self
    }
}
