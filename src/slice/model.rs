use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::lease::FencingToken;
use crate::{AgentId, AttackId};

/// Slices are keyed by `(attack_id, index)`; indices are never reused within
/// an attack, even across re-slicing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SliceId {
    pub attack_id: AttackId,
    pub index: u32,
}

impl SliceId {
    pub fn new(attack_id: AttackId, index: u32) -> Self {
        Self { attack_id, index }
    }

    /// Key used for this slice in the lease store.
    pub fn resource_id(&self) -> String {
        format!("slice/{}/{}", self.attack_id, self.index)
    }
}

impl fmt::Display for SliceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.attack_id, self.index)
    }
}

/// Half-open range `[start, end)` of candidate indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeyRange {
    pub start: u128,
    pub end: u128,
}

impl KeyRange {
    pub fn new(start: u128, end: u128) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u128 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// Cut at `at`, which must lie strictly inside the range.
    pub fn split_at(&self, at: u128) -> Option<(KeyRange, KeyRange)> {
        if at <= self.start || at >= self.end {
            return None;
        }
        Some((KeyRange::new(self.start, at), KeyRange::new(at, self.end)))
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SliceState {
    Pending,
    Leased,
    Running,
    Completed,
    Failed,
    Dead,
    Expired,
    Paused,
}

impl SliceState {
    pub const ALL: [SliceState; 8] = [
        SliceState::Pending,
        SliceState::Leased,
        SliceState::Running,
        SliceState::Completed,
        SliceState::Failed,
        SliceState::Dead,
        SliceState::Expired,
        SliceState::Paused,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(self, SliceState::Completed | SliceState::Dead)
    }

    /// Held by an agent under a lease.
    pub fn is_held(&self) -> bool {
        matches!(self, SliceState::Leased | SliceState::Running)
    }
}

impl fmt::Display for SliceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SliceState::Pending => "pending",
            SliceState::Leased => "leased",
            SliceState::Running => "running",
            SliceState::Completed => "completed",
            SliceState::Failed => "failed",
            SliceState::Dead => "dead",
            SliceState::Expired => "expired",
            SliceState::Paused => "paused",
        };
        write!(f, "{}", s)
    }
}

/// What an agent reports when it finishes a slice.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultSummary {
    /// Hashes cracked within the slice.
    #[serde(default)]
    pub cracked: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone)]
pub struct WorkSlice {
    pub id: SliceId,
    pub range: KeyRange,
    pub state: SliceState,
    pub assigned_agent: Option<AgentId>,
    pub lease_token: Option<FencingToken>,
    /// Failures charged against this slice.
    pub attempt_count: u32,
    pub candidates_tested: u128,
    /// Last reported candidates/sec.
    pub rate: u64,
    /// Entered `pending` at this instant; drives ordering and the
    /// reservation window.
    pub pending_since: Instant,
    pub updated_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub result: Option<ResultSummary>,
}

impl WorkSlice {
    pub fn new(id: SliceId, range: KeyRange, now: Instant) -> Self {
        Self {
            id,
            range,
            state: SliceState::Pending,
            assigned_agent: None,
            lease_token: None,
            attempt_count: 0,
            candidates_tested: 0,
            rate: 0,
            pending_since: now,
            updated_at: Utc::now(),
            last_error: None,
            result: None,
        }
    }

    pub fn remaining(&self) -> u128 {
        self.range.len().saturating_sub(self.candidates_tested)
    }

    /// Time to finish at the last reported rate.
    pub fn eta(&self) -> Option<Duration> {
        if self.rate == 0 || !self.state.is_held() {
            return None;
        }
        let secs = self.remaining() / u128::from(self.rate);
        Some(Duration::from_secs(u64::try_from(secs).unwrap_or(u64::MAX)))
    }

    /// Candidates this slice has accounted for.
    pub fn processed(&self) -> u128 {
        if self.state == SliceState::Completed {
            self.range.len()
        } else {
            self.candidates_tested.min(self.range.len())
        }
    }

    /// Drop ownership and put the slice back in the pending queue.
    pub(crate) fn back_to_pending(&mut self, now: Instant) {
        self.assigned_agent = None;
        self.lease_token = None;
        self.candidates_tested = 0;
        self.rate = 0;
        self.pending_since = now;
    }
}
