use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tokio_util::sync::CancellationToken;

use crate::attack::machine::{self, AttackAction, AttackState};
use crate::error::{DispatchError, Result};
use crate::planner::TaskPlan;
use crate::{AttackId, HashMode};

#[derive(Debug, Clone)]
pub struct AttackRecord {
    pub id: AttackId,
    pub hash_mode: HashMode,
    pub state: AttackState,
    pub plan: Option<TaskPlan>,
    /// Cancelled whenever the attack stops accepting work. In-flight
    /// assignments check it before committing a lease.
    pub cancel: CancellationToken,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl AttackRecord {
    pub fn new(id: AttackId, hash_mode: HashMode) -> Self {
        Self {
            id,
            hash_mode,
            state: AttackState::Pending,
            plan: None,
            cancel: CancellationToken::new(),
            last_error: None,
            updated_at: Utc::now(),
        }
    }
}

/// Shared attack registry. Planning for any attack is serialized through
/// [`planning_lock`](AttackTable::planning_lock) so engines sharing the table
/// never plan the same attack twice.
#[derive(Debug, Default)]
pub struct AttackTable {
    attacks: RwLock<HashMap<AttackId, AttackRecord>>,
    planning: Mutex<()>,
}

impl AttackTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn planning_lock(&self) -> MutexGuard<'_, ()> {
        self.planning.lock().await
    }

    pub async fn get(&self, id: AttackId) -> Option<AttackRecord> {
        self.attacks.read().await.get(&id).cloned()
    }

    pub async fn require(&self, id: AttackId) -> Result<AttackRecord> {
        self.get(id).await.ok_or(DispatchError::AttackNotFound(id))
    }

    pub async fn get_or_insert(&self, id: AttackId, hash_mode: HashMode) -> AttackRecord {
        self.attacks
            .write()
            .await
            .entry(id)
            .or_insert_with(|| AttackRecord::new(id, hash_mode))
            .clone()
    }

    /// Apply an action, managing the cancellation token alongside the state.
    pub async fn transition(&self, id: AttackId, action: AttackAction) -> Result<AttackRecord> {
        let mut attacks = self.attacks.write().await;
        let record = attacks
            .get_mut(&id)
            .ok_or(DispatchError::AttackNotFound(id))?;
        let next = machine::apply(record.state, action)?;

        match next {
            AttackState::Running if record.cancel.is_cancelled() => {
                record.cancel = CancellationToken::new();
            }
            AttackState::Paused
            | AttackState::Abandoned
            | AttackState::Completed
            | AttackState::Failed => record.cancel.cancel(),
            _ => {}
        }

        tracing::info!(
            attack_id = id,
            from = %record.state,
            to = %next,
            action = %action,
            "Attack transition"
        );
        record.state = next;
        record.updated_at = Utc::now();
        Ok(record.clone())
    }

    /// Mutate non-state fields (plan, hash mode, last error).
    pub async fn update<F>(&self, id: AttackId, f: F) -> Result<AttackRecord>
    where
        F: FnOnce(&mut AttackRecord),
    {
        let mut attacks = self.attacks.write().await;
        let record = attacks
            .get_mut(&id)
            .ok_or(DispatchError::AttackNotFound(id))?;
        f(record);
        record.updated_at = Utc::now();
        Ok(record.clone())
    }

    /// Running attacks among `ids`, in the order given. Unknown ids are skipped.
    pub async fn running(&self, ids: &[AttackId]) -> Vec<AttackRecord> {
        let attacks = self.attacks.read().await;
        ids.iter()
            .filter_map(|id| attacks.get(id))
            .filter(|a| a.state == AttackState::Running)
            .cloned()
            .collect()
    }

    pub async fn all(&self) -> Vec<AttackRecord> {
        let mut all: Vec<AttackRecord> = self.attacks.read().await.values().cloned().collect();
        all.sort_by_key(|a| a.id);
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pause_cancels_and_resume_renews_token() {
        let attacks = AttackTable::new();
        attacks.get_or_insert(1, 0).await;
        let running = attacks.transition(1, AttackAction::Start).await.unwrap();
        let token = running.cancel.clone();

        attacks.transition(1, AttackAction::Pause).await.unwrap();
        assert!(token.is_cancelled());

        let resumed = attacks.transition(1, AttackAction::Resume).await.unwrap();
        assert!(!resumed.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn invalid_transitions_surface_as_errors() {
        let attacks = AttackTable::new();
        assert!(matches!(
            attacks.transition(5, AttackAction::Start).await,
            Err(DispatchError::AttackNotFound(5))
        ));
        attacks.get_or_insert(5, 0).await;
        assert!(matches!(
            attacks.transition(5, AttackAction::Resume).await,
            Err(DispatchError::InvalidTransition(_))
        ));
    }

    #[tokio::test]
    async fn running_filters_by_state() {
        let attacks = AttackTable::new();
        for id in 1..=3 {
            attacks.get_or_insert(id, 0).await;
        }
        attacks.transition(2, AttackAction::Start).await.unwrap();
        attacks.transition(3, AttackAction::Start).await.unwrap();
        attacks.transition(3, AttackAction::Pause).await.unwrap();

        let running: Vec<AttackId> = attacks.running(&[1, 2, 3, 4]).await.iter().map(|a| a.id).collect();
        assert_eq!(running, vec![2]);
    }
}
