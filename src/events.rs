use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::lease::FencingToken;
use crate::slice::SliceId;
use crate::{AgentId, AttackId};

/// Engine lifecycle notifications. Keyspace offsets are decimal strings so
/// JSON consumers never lose precision.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    AttackStarted {
        attack_id: AttackId,
        plan_id: Uuid,
        slice_count: u64,
    },
    AttackPaused {
        attack_id: AttackId,
        revoked: usize,
    },
    AttackResumed {
        attack_id: AttackId,
    },
    AttackCancelled {
        attack_id: AttackId,
        revoked: usize,
    },
    AttackCompleted {
        attack_id: AttackId,
    },
    AttackFailed {
        attack_id: AttackId,
        reason: String,
    },
    SlicesCreated {
        attack_id: AttackId,
        count: usize,
    },
    SliceAssigned {
        slice: SliceId,
        agent_id: AgentId,
        token: FencingToken,
    },
    SliceProgress {
        slice: SliceId,
        candidates_tested: String,
        rate: u64,
    },
    SliceCompleted {
        slice: SliceId,
        agent_id: AgentId,
        cracked: u64,
    },
    SliceFailed {
        slice: SliceId,
        agent_id: AgentId,
        attempt_count: u32,
        reason: String,
    },
    SliceDead {
        slice: SliceId,
        reason: String,
    },
    SliceExpired {
        slice: SliceId,
        agent_id: Option<AgentId>,
    },
    SliceSplit {
        slice: SliceId,
        remainder: SliceId,
        at: String,
    },
    AgentBackoff {
        agent_id: AgentId,
        level: u32,
        retry_after_ms: u64,
    },
    AssignmentSmoothing {
        reconnects: usize,
        duration_ms: u64,
    },
}

/// Fan-out of [`EngineEvent`]s. Publishing never blocks; subscribers that
/// fall behind skip ahead.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: EngineEvent) {
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(EngineEvent::AttackCompleted { attack_id: 3 });
        assert_eq!(
            rx.recv().await.unwrap(),
            EngineEvent::AttackCompleted { attack_id: 3 }
        );
    }

    #[tokio::test]
    async fn publishing_without_subscribers_is_harmless() {
        let bus = EventBus::new(8);
        bus.publish(EngineEvent::AttackResumed { attack_id: 1 });
        assert_eq!(bus.receiver_count(), 0);
    }

    #[tokio::test]
    async fn lagging_subscriber_skips_ahead() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for attack_id in 0..5 {
            bus.publish(EngineEvent::AttackCompleted { attack_id });
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(3))
        ));
        assert_eq!(
            rx.recv().await.unwrap(),
            EngineEvent::AttackCompleted { attack_id: 3 }
        );
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let event = EngineEvent::SliceProgress {
            slice: SliceId::new(1, 2),
            candidates_tested: u128::MAX.to_string(),
            rate: 10,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "slice_progress");
        assert_eq!(json["slice"]["index"], 2);
        assert_eq!(json["candidates_tested"], u128::MAX.to_string());
    }
}
