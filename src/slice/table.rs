use std::collections::{BTreeMap, HashMap};

use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::error::{InvalidTransition, PlanningError};
use crate::lease::FencingToken;
use crate::planner::{cover_gaps, partition, verify_coverage};
use crate::slice::model::{KeyRange, SliceId, SliceState, WorkSlice};
use crate::AttackId;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TableError {
    #[error("Slice {0} not found")]
    NotFound(SliceId),

    #[error("Slice {slice} changed concurrently: expected {expected}, found {found}")]
    Conflict {
        slice: SliceId,
        expected: String,
        found: String,
    },

    #[error(transparent)]
    Transition(#[from] InvalidTransition),

    #[error("Cannot split slice {slice}: {reason}")]
    Split { slice: SliceId, reason: String },

    #[error("Attack {0} ran out of slice indices")]
    IndicesExhausted(AttackId),
}

/// Precondition checked under the table lock before a mutation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Guard {
    Any,
    State(SliceState),
    /// The slice must still carry this lease token.
    Token(FencingToken),
}

impl Guard {
    fn check(&self, slice: &WorkSlice) -> Result<(), TableError> {
        match *self {
            Guard::Any => Ok(()),
            Guard::State(expected) if slice.state == expected => Ok(()),
            Guard::State(expected) => Err(TableError::Conflict {
                slice: slice.id,
                expected: expected.to_string(),
                found: slice.state.to_string(),
            }),
            Guard::Token(token) if slice.lease_token == Some(token) => Ok(()),
            Guard::Token(token) => Err(TableError::Conflict {
                slice: slice.id,
                expected: format!("token {}", token),
                found: match slice.lease_token {
                    Some(t) => format!("token {}", t),
                    None => "no token".to_string(),
                },
            }),
        }
    }
}

/// Result of re-slicing one attack.
#[derive(Debug, Clone)]
pub struct Reslice {
    pub removed: Vec<WorkSlice>,
    pub created: Vec<WorkSlice>,
    /// Kept ranges did not fit; every slice was replaced.
    pub reset: bool,
}

#[derive(Debug, Default)]
struct TableInner {
    slices: BTreeMap<SliceId, WorkSlice>,
    next_index: HashMap<AttackId, u32>,
}

impl TableInner {
    fn allocate(&mut self, attack_id: AttackId) -> Result<SliceId, TableError> {
        let next = self.next_index.entry(attack_id).or_insert(0);
        let index = *next;
        *next = next
            .checked_add(1)
            .ok_or(TableError::IndicesExhausted(attack_id))?;
        Ok(SliceId::new(attack_id, index))
    }

    fn insert_ranges(
        &mut self,
        attack_id: AttackId,
        ranges: &[KeyRange],
        now: Instant,
    ) -> Result<Vec<WorkSlice>, TableError> {
        let mut created = Vec::with_capacity(ranges.len());
        for range in ranges {
            let id = self.allocate(attack_id)?;
            let slice = WorkSlice::new(id, *range, now);
            self.slices.insert(id, slice.clone());
            created.push(slice);
        }
        Ok(created)
    }

    fn attack_ids(&self, attack_id: AttackId) -> Vec<SliceId> {
        self.slices
            .range(SliceId::new(attack_id, 0)..=SliceId::new(attack_id, u32::MAX))
            .map(|(id, _)| *id)
            .collect()
    }
}

/// Shared slice table keyed by `(attack_id, slice_index)`.
///
/// Reads hand out clones. Every write checks a [`Guard`] under the write
/// lock, so two writers racing on one slice cannot both succeed.
#[derive(Debug, Default)]
pub struct SliceTable {
    inner: RwLock<TableInner>,
}

impl SliceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, id: SliceId) -> Option<WorkSlice> {
        self.inner.read().await.slices.get(&id).cloned()
    }

    pub async fn for_attack(&self, attack_id: AttackId) -> Vec<WorkSlice> {
        let inner = self.inner.read().await;
        inner
            .slices
            .range(SliceId::new(attack_id, 0)..=SliceId::new(attack_id, u32::MAX))
            .map(|(_, s)| s.clone())
            .collect()
    }

    /// Pending slices of the given attacks, in key order.
    pub async fn pending_for(&self, attack_ids: &[AttackId]) -> Vec<WorkSlice> {
        let inner = self.inner.read().await;
        attack_ids
            .iter()
            .flat_map(|&attack_id| {
                inner
                    .slices
                    .range(SliceId::new(attack_id, 0)..=SliceId::new(attack_id, u32::MAX))
                    .map(|(_, s)| s)
                    .filter(|s| s.state == SliceState::Pending)
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Slices currently held under a lease, across all attacks.
    pub async fn held(&self) -> Vec<WorkSlice> {
        let inner = self.inner.read().await;
        inner
            .slices
            .values()
            .filter(|s| s.state.is_held())
            .cloned()
            .collect()
    }

    pub async fn counts(&self, attack_id: AttackId) -> BTreeMap<SliceState, usize> {
        let mut counts = BTreeMap::new();
        for slice in self.for_attack(attack_id).await {
            *counts.entry(slice.state).or_insert(0) += 1;
        }
        counts
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.slices.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.slices.is_empty()
    }

    pub(crate) async fn insert_ranges(
        &self,
        attack_id: AttackId,
        ranges: &[KeyRange],
    ) -> Result<Vec<WorkSlice>, TableError> {
        let now = Instant::now();
        self.inner
            .write()
            .await
            .insert_ranges(attack_id, ranges, now)
    }

    /// Guarded read-modify-write of one slice. `f` runs on a copy; the copy
    /// replaces the stored slice only if both the guard and `f` succeed.
    pub(crate) async fn update<F>(
        &self,
        id: SliceId,
        guard: Guard,
        f: F,
    ) -> Result<WorkSlice, TableError>
    where
        F: FnOnce(&mut WorkSlice) -> Result<(), TableError>,
    {
        let mut inner = self.inner.write().await;
        let stored = inner.slices.get_mut(&id).ok_or(TableError::NotFound(id))?;
        guard.check(stored)?;

        let mut next = stored.clone();
        f(&mut next)?;
        next.updated_at = chrono::Utc::now();
        *stored = next.clone();
        Ok(next)
    }

    /// Cut a held slice at `at` (default: just past the attempted prefix).
    /// The original keeps its lease and shrinks; the remainder becomes a new
    /// pending slice. Both writes happen under one lock.
    pub(crate) async fn split(
        &self,
        id: SliceId,
        token: FencingToken,
        at: Option<u128>,
    ) -> Result<(WorkSlice, WorkSlice), TableError> {
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        let current = inner.slices.get(&id).ok_or(TableError::NotFound(id))?;
        Guard::Token(token).check(current)?;
        if !current.state.is_held() {
            return Err(TableError::Split {
                slice: id,
                reason: format!("slice is {}", current.state),
            });
        }

        let at = at.unwrap_or_else(|| current.range.start.saturating_add(current.candidates_tested));
        let (head, tail) = current.range.split_at(at).ok_or_else(|| TableError::Split {
            slice: id,
            reason: format!("split point {} is outside {}", at, current.range),
        })?;

        let mut shrunk = current.clone();
        shrunk.range = head;
        shrunk.candidates_tested = shrunk.candidates_tested.min(head.len());
        shrunk.updated_at = chrono::Utc::now();

        let new_id = inner.allocate(id.attack_id)?;
        let remainder = WorkSlice::new(new_id, tail, now);
        inner.slices.insert(id, shrunk.clone());
        inner.slices.insert(new_id, remainder.clone());
        Ok((shrunk, remainder))
    }

    /// Re-partition an attack for a new total. Unclaimed slices (pending,
    /// expired, paused) are dropped; the rest keep their ranges and only the
    /// gaps are re-partitioned. If a kept range does not fit inside the new
    /// total, everything is dropped and the attack is partitioned from zero.
    ///
    /// Nothing is written when planning fails.
    pub(crate) async fn reslice(
        &self,
        attack_id: AttackId,
        total: u128,
        slice_size: u128,
        max_slices: u64,
    ) -> Result<Reslice, ResliceError> {
        if total == 0 {
            return Err(PlanningError::EmptyKeyspace.into());
        }

        let now = Instant::now();
        let mut inner = self.inner.write().await;
        let ids = inner.attack_ids(attack_id);

        let (kept, dropped): (Vec<SliceId>, Vec<SliceId>) = ids.into_iter().partition(|id| {
            inner.slices.get(id).is_some_and(|s| {
                !matches!(
                    s.state,
                    SliceState::Pending | SliceState::Expired | SliceState::Paused
                )
            })
        });
        let kept_ranges: Vec<KeyRange> = kept
            .iter()
            .filter_map(|id| inner.slices.get(id).map(|s| s.range))
            .collect();

        let (to_remove, ranges, reset) = match cover_gaps(total, &kept_ranges, slice_size) {
            Some(gaps) => (dropped, gaps, false),
            None => {
                let mut all = kept;
                all.extend(dropped);
                (all, partition(KeyRange::new(0, total), slice_size), true)
            }
        };

        let surviving = if reset { 0 } else { kept_ranges.len() as u128 };
        let slices = surviving + ranges.len() as u128;
        if slices > u128::from(max_slices) {
            return Err(PlanningError::TooManySlices {
                slices,
                limit: max_slices,
            }
            .into());
        }

        let removed: Vec<WorkSlice> = to_remove
            .iter()
            .filter_map(|id| inner.slices.remove(id))
            .collect();
        let created = inner.insert_ranges(attack_id, &ranges, now)?;
        Ok(Reslice {
            removed,
            created,
            reset,
        })
    }

    /// Drop every slice of an attack, returning what was removed.
    pub(crate) async fn remove_attack(&self, attack_id: AttackId) -> Vec<WorkSlice> {
        let mut inner = self.inner.write().await;
        let ids = inner.attack_ids(attack_id);
        ids.iter().filter_map(|id| inner.slices.remove(id)).collect()
    }

    /// Check the partition invariant for an attack.
    pub async fn covers(&self, attack_id: AttackId, total: u128) -> bool {
        let ranges: Vec<KeyRange> = self
            .for_attack(attack_id)
            .await
            .iter()
            .map(|s| s.range)
            .collect();
        verify_coverage(total, &ranges)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResliceError {
    #[error(transparent)]
    Planning(#[from] PlanningError),

    #[error(transparent)]
    Table(#[from] TableError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slice::machine::{apply, SliceAction};

    async fn table_with(total: u128, size: u128) -> SliceTable {
        let table = SliceTable::new();
        let ranges = partition(KeyRange::new(0, total), size);
        table.insert_ranges(1, &ranges).await.unwrap();
        table
    }

    async fn lease(table: &SliceTable, id: SliceId, token: FencingToken) -> WorkSlice {
        table
            .update(id, Guard::State(SliceState::Pending), |s| {
                s.state = apply(s.state, SliceAction::Lease)?;
                s.assigned_agent = Some(9);
                s.lease_token = Some(token);
                Ok(())
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn guard_rejects_wrong_state_without_mutation() {
        let table = table_with(100, 10).await;
        let id = SliceId::new(1, 0);
        lease(&table, id, 5).await;

        let err = table
            .update(id, Guard::State(SliceState::Pending), |s| {
                s.assigned_agent = Some(99);
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TableError::Conflict { .. }));
        assert_eq!(table.get(id).await.unwrap().assigned_agent, Some(9));
    }

    #[tokio::test]
    async fn failed_closure_leaves_slice_untouched() {
        let table = table_with(100, 10).await;
        let id = SliceId::new(1, 0);
        let err = table
            .update(id, Guard::Any, |s| {
                s.candidates_tested = 50;
                s.state = apply(s.state, SliceAction::Complete)?;
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TableError::Transition(_)));
        assert_eq!(table.get(id).await.unwrap().candidates_tested, 0);
    }

    #[tokio::test]
    async fn token_guard() {
        let table = table_with(100, 10).await;
        let id = SliceId::new(1, 3);
        lease(&table, id, 5).await;
        assert!(table.update(id, Guard::Token(4), |_| Ok(())).await.is_err());
        assert!(table.update(id, Guard::Token(5), |_| Ok(())).await.is_ok());
    }

    #[tokio::test]
    async fn split_preserves_coverage() {
        let table = table_with(100, 50).await;
        let id = SliceId::new(1, 0);
        lease(&table, id, 1).await;
        table
            .update(id, Guard::Token(1), |s| {
                s.candidates_tested = 20;
                Ok(())
            })
            .await
            .unwrap();

        let (head, tail) = table.split(id, 1, None).await.unwrap();
        assert_eq!(head.range, KeyRange::new(0, 20));
        assert_eq!(head.state, SliceState::Leased);
        assert_eq!(tail.range, KeyRange::new(20, 50));
        assert_eq!(tail.state, SliceState::Pending);
        assert_eq!(tail.id, SliceId::new(1, 2));
        assert!(table.covers(1, 100).await);
    }

    #[tokio::test]
    async fn split_rejects_bad_points_and_tokens() {
        let table = table_with(100, 50).await;
        let id = SliceId::new(1, 0);
        assert!(matches!(
            table.split(id, 1, Some(10)).await,
            Err(TableError::Conflict { .. })
        ));
        lease(&table, id, 1).await;
        assert!(matches!(
            table.split(id, 1, None).await,
            Err(TableError::Split { .. })
        ));
        assert!(matches!(
            table.split(id, 1, Some(50)).await,
            Err(TableError::Split { .. })
        ));
        assert_eq!(table.len().await, 2);
    }

    #[tokio::test]
    async fn reslice_keeps_claimed_ranges_and_fills_gaps() {
        let table = table_with(100, 25).await;
        lease(&table, SliceId::new(1, 1), 1).await;

        let result = table.reslice(1, 150, 25, 100).await.unwrap();
        assert!(!result.reset);
        assert_eq!(result.removed.len(), 3);
        assert!(table.covers(1, 150).await);

        let kept = table.get(SliceId::new(1, 1)).await.unwrap();
        assert_eq!(kept.range, KeyRange::new(25, 50));
        assert!(result.created.iter().all(|s| s.id.index >= 4));
    }

    #[tokio::test]
    async fn reslice_resets_when_kept_range_no_longer_fits() {
        let table = table_with(100, 25).await;
        lease(&table, SliceId::new(1, 3), 1).await;

        let result = table.reslice(1, 60, 25, 100).await.unwrap();
        assert!(result.reset);
        assert_eq!(result.removed.len(), 4);
        assert!(table.get(SliceId::new(1, 3)).await.is_none());
        assert!(table.covers(1, 60).await);
    }

    #[tokio::test]
    async fn reslice_errors_leave_table_alone() {
        let table = table_with(100, 25).await;
        assert_eq!(
            table.reslice(1, 0, 25, 100).await.unwrap_err(),
            ResliceError::Planning(PlanningError::EmptyKeyspace)
        );
        assert!(matches!(
            table.reslice(1, 1000, 25, 10).await,
            Err(ResliceError::Planning(PlanningError::TooManySlices { .. }))
        ));
        assert_eq!(table.len().await, 4);
        assert!(table.covers(1, 100).await);
    }

    #[tokio::test]
    async fn remove_attack_only_touches_that_attack() {
        let table = table_with(100, 25).await;
        table
            .insert_ranges(2, &[KeyRange::new(0, 10)])
            .await
            .unwrap();
        assert_eq!(table.remove_attack(1).await.len(), 4);
        assert_eq!(table.len().await, 1);
        assert_eq!(table.pending_for(&[1, 2]).await.len(), 1);
    }
}
