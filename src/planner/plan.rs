use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::PlannerConfig;
use crate::error::PlanningError;
use crate::slice::KeyRange;
use crate::{AttackId, HashMode};

/// One plan per attack; replaced when the attack is re-planned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskPlan {
    pub id: Uuid,
    pub attack_id: AttackId,
    pub total_keyspace: u128,
    pub slice_size: u128,
    pub slice_count: u64,
    pub hash_mode: HashMode,
    pub created_at: DateTime<Utc>,
}

impl TaskPlan {
    pub fn new(
        attack_id: AttackId,
        total_keyspace: u128,
        slice_size: u128,
        slice_count: u64,
        hash_mode: HashMode,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            attack_id,
            total_keyspace,
            slice_size,
            slice_count,
            hash_mode,
            created_at: Utc::now(),
        }
    }
}

/// Number of `slice_size` slices needed to cover `len` candidates.
pub fn slice_count(len: u128, slice_size: u128) -> u128 {
    let size = slice_size.max(1);
    len / size + u128::from(len % size != 0)
}

/// Contiguous `slice_size` ranges covering `range`; the last may be shorter.
pub fn partition(range: KeyRange, slice_size: u128) -> Vec<KeyRange> {
    let size = slice_size.max(1);
    let count = usize::try_from(slice_count(range.len(), size)).unwrap_or(0);
    let mut ranges = Vec::with_capacity(count);
    let mut start = range.start;
    while start < range.end {
        let end = start.saturating_add(size).min(range.end);
        ranges.push(KeyRange::new(start, end));
        start = end;
    }
    ranges
}

/// Partition whatever `[0, total)` is not covered by `kept`. Returns `None`
/// if a kept range reaches past `total` or kept ranges overlap.
pub fn cover_gaps(total: u128, kept: &[KeyRange], slice_size: u128) -> Option<Vec<KeyRange>> {
    let mut kept = kept.to_vec();
    kept.sort();

    let mut gaps = Vec::new();
    let mut cursor = 0u128;
    for range in &kept {
        if range.end > total || range.start < cursor {
            return None;
        }
        if range.start > cursor {
            gaps.extend(partition(KeyRange::new(cursor, range.start), slice_size));
        }
        cursor = range.end;
    }
    if cursor < total {
        gaps.extend(partition(KeyRange::new(cursor, total), slice_size));
    }
    Some(gaps)
}

/// True when `ranges` are pairwise disjoint, non-empty and their union is
/// exactly `[0, total)`.
pub fn verify_coverage(total: u128, ranges: &[KeyRange]) -> bool {
    let mut sorted = ranges.to_vec();
    sorted.sort();
    let mut cursor = 0u128;
    for range in sorted {
        if range.start != cursor || range.is_empty() {
            return false;
        }
        cursor = range.end;
    }
    cursor == total
}

/// Computes slice sizes and partitions keyspaces.
#[derive(Debug, Clone)]
pub struct TaskPlanner {
    config: PlannerConfig,
}

impl TaskPlanner {
    pub fn new(config: PlannerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    /// Mean of the `rate_sample_agents` fastest rates, or `None` without any.
    pub fn effective_rate(&self, rates: &[u64]) -> Option<u128> {
        let mut rates: Vec<u64> = rates.iter().copied().filter(|&r| r > 0).collect();
        if rates.is_empty() {
            return None;
        }
        rates.sort_unstable_by(|a, b| b.cmp(a));
        let sample = &rates[..rates.len().min(self.config.rate_sample_agents.max(1))];
        let sum: u128 = sample.iter().map(|&r| u128::from(r)).sum();
        Some(sum / sample.len() as u128)
    }

    /// Target duration times effective rate, clamped to the configured bounds.
    pub fn slice_size(&self, rates: &[u64]) -> u128 {
        let min = self.config.min_slice_size.max(1);
        let max = self.config.max_slice_size.max(min);
        match self.effective_rate(rates) {
            Some(rate) => {
                let millis = self.config.target_slice_duration.as_millis();
                let size = rate.saturating_mul(millis) / 1000;
                size.clamp(min, max)
            }
            None => min,
        }
    }

    /// Validate and partition `[0, total)`. Nothing is materialized here.
    pub fn plan(
        &self,
        attack_id: AttackId,
        total: u128,
        hash_mode: HashMode,
        slice_size: u128,
    ) -> Result<(TaskPlan, Vec<KeyRange>), PlanningError> {
        if total == 0 {
            return Err(PlanningError::EmptyKeyspace);
        }
        let count = slice_count(total, slice_size);
        let limit = self.config.max_slices_per_attack;
        if count > u128::from(limit) {
            return Err(PlanningError::TooManySlices {
                slices: count,
                limit,
            });
        }

        let ranges = partition(KeyRange::new(0, total), slice_size);
        let plan = TaskPlan::new(attack_id, total, slice_size, ranges.len() as u64, hash_mode);
        Ok((plan, ranges))
    }
}
