//! Pausing, resuming and cancelling attacks with work in flight.

mod test_harness;

use keyspace_dispatch::attack::AttackState;
use keyspace_dispatch::error::DispatchError;
use keyspace_dispatch::events::EngineEvent;
use keyspace_dispatch::slice::{Assignment, NoWorkReason, ResultSummary, SliceState};
use test_harness::*;

async fn three_running(engine: &keyspace_dispatch::engine::Engine) -> Vec<Assignment> {
    let mut running = Vec::new();
    for agent_id in 1..=3 {
        let assignment = expect_assigned(engine.request_slice(agent_id, &[ATTACK]).await.unwrap());
        engine
            .report_progress(assignment.lease_token, assignment.slice.id, 1_000, 10_000)
            .await
            .unwrap();
        running.push(assignment);
    }
    running
}

#[tokio::test]
async fn test_cancel_revokes_running_slices() {
    let engine = engine_with_agents(test_config(), &[1, 2, 3], 10_000).await;
    engine
        .create_task_plan(ATTACK, 1_000_000u128, HASH_MODE)
        .await
        .unwrap();
    let running = three_running(&engine).await;
    let mut events = engine.subscribe();

    let revoked = engine.cancel_attack(ATTACK).await.unwrap();
    assert_eq!(revoked, 3);

    let record = engine.attack(ATTACK).await.unwrap();
    assert_eq!(record.state, AttackState::Abandoned);
    assert!(record.cancel.is_cancelled());

    for assignment in &running {
        let slice = engine.stores().slices.get(assignment.slice.id).await.unwrap();
        assert_eq!(slice.state, SliceState::Paused);
        assert_eq!(slice.assigned_agent, None);
        assert_eq!(slice.lease_token, None);
    }
    assert!(engine
        .slices(ATTACK)
        .await
        .iter()
        .all(|s| s.state == SliceState::Paused));
    let lease = engine
        .stores()
        .leases
        .get(&running[0].slice.id.resource_id())
        .await
        .unwrap();
    assert_eq!(lease, None);

    let late = &running[0];
    let err = engine
        .report_completion(late.lease_token, late.slice.id, ResultSummary::default())
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::StaleLease { .. }));

    let reason = expect_no_work(engine.request_slice(1, &[ATTACK]).await.unwrap());
    assert_eq!(reason, NoWorkReason::NothingPending);

    let agents = engine.stores().agents.read().await;
    for agent_id in 1..=3 {
        assert_eq!(agents.snapshot(agent_id).unwrap().current_load, 0);
    }
    drop(agents);

    assert!(drain_events(&mut events).contains(&EngineEvent::AttackCancelled {
        attack_id: ATTACK,
        revoked: 3
    }));
}

#[tokio::test]
async fn test_pause_then_resume_restores_pending_work() {
    let engine = engine_with_agents(test_config(), &[1, 2, 3], 10_000).await;
    engine
        .create_task_plan(ATTACK, 1_000_000u128, HASH_MODE)
        .await
        .unwrap();
    let running = three_running(&engine).await;

    assert_eq!(engine.pause_attack(ATTACK).await.unwrap(), 3);
    assert_eq!(
        engine.attack(ATTACK).await.unwrap().state,
        AttackState::Paused
    );

    let err = engine
        .report_progress(running[1].lease_token, running[1].slice.id, 2_000, 10_000)
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::StaleLease { .. }));

    let resumed = engine.resume_attack(ATTACK).await.unwrap();
    assert_eq!(resumed, 10);
    let progress = engine.get_attack_progress(ATTACK).await.unwrap();
    assert_eq!(progress.state, AttackState::Running);
    assert_eq!(progress.slices_by_state.get(&SliceState::Pending), Some(&10));
    assert_eq!(progress.keyspace_processed, 0);

    let again = expect_assigned(engine.request_slice(1, &[ATTACK]).await.unwrap());
    assert_eq!(again.slice.id, running[0].slice.id);
    assert!(again.lease_token > running[0].lease_token);
}

#[tokio::test]
async fn test_completed_work_survives_cancel_and_reactivation() {
    let engine = engine_with_agents(test_config(), &[1], 10_000).await;
    engine
        .create_task_plan(ATTACK, 1_000_000u128, HASH_MODE)
        .await
        .unwrap();
    let done = expect_assigned(engine.request_slice(1, &[ATTACK]).await.unwrap());
    engine
        .report_completion(done.lease_token, done.slice.id, ResultSummary::default())
        .await
        .unwrap();

    engine.cancel_attack(ATTACK).await.unwrap();
    engine
        .create_task_plan(ATTACK, 1_000_000u128, HASH_MODE)
        .await
        .expect("reactivate");

    let progress = engine.get_attack_progress(ATTACK).await.unwrap();
    assert_eq!(progress.state, AttackState::Running);
    assert_eq!(progress.keyspace_processed, 100_000);
    assert_eq!(progress.slices_by_state.get(&SliceState::Completed), Some(&1));
    assert_eq!(progress.slices_by_state.get(&SliceState::Pending), Some(&9));
    assert!(engine.stores().slices.covers(ATTACK, 1_000_000).await);
}

#[tokio::test]
async fn test_invalid_lifecycle_operations_are_rejected() {
    let engine = engine_with_agents(test_config(), &[1], 10_000).await;

    assert!(matches!(
        engine.cancel_attack(ATTACK).await.unwrap_err(),
        DispatchError::AttackNotFound(ATTACK)
    ));

    engine
        .create_task_plan(ATTACK, 1_000_000u128, HASH_MODE)
        .await
        .unwrap();
    assert!(matches!(
        engine.resume_attack(ATTACK).await.unwrap_err(),
        DispatchError::InvalidTransition(_)
    ));

    engine.cancel_attack(ATTACK).await.unwrap();
    assert!(matches!(
        engine.pause_attack(ATTACK).await.unwrap_err(),
        DispatchError::InvalidTransition(_)
    ));
}
