//! Planning through the engine: slice sizing from the fleet, idempotent
//! re-planning, re-slicing and planning failures.

mod test_harness;

use keyspace_dispatch::attack::AttackState;
use keyspace_dispatch::error::{DispatchError, PlanningError};
use keyspace_dispatch::events::EngineEvent;
use keyspace_dispatch::planner::{KeyspaceParams, KeyspaceSource};
use keyspace_dispatch::slice::{ResultSummary, SliceState};
use test_harness::*;

#[tokio::test]
async fn test_plan_sizes_slices_from_agent_rate() {
    let engine = engine_with_agents(test_config(), &[1], 10_000).await;
    let mut events = engine.subscribe();

    let plan_id = engine
        .create_task_plan(ATTACK, 1_000_000u128, HASH_MODE)
        .await
        .expect("plan");

    let record = engine.attack(ATTACK).await.expect("attack exists");
    assert_eq!(record.state, AttackState::Running);
    let plan = record.plan.expect("plan stored");
    assert_eq!(plan.id, plan_id);
    assert_eq!(plan.slice_size, 100_000);
    assert_eq!(plan.slice_count, 10);

    let slices = engine.slices(ATTACK).await;
    assert_eq!(slices.len(), 10);
    assert!(slices.iter().all(|s| s.state == SliceState::Pending));
    assert!(slices.iter().all(|s| s.range.len() == 100_000));
    assert!(engine.stores().slices.covers(ATTACK, 1_000_000).await);

    let published = drain_events(&mut events);
    assert_eq!(
        published,
        vec![
            EngineEvent::SlicesCreated {
                attack_id: ATTACK,
                count: 10
            },
            EngineEvent::AttackStarted {
                attack_id: ATTACK,
                plan_id,
                slice_count: 10
            },
        ]
    );
}

#[tokio::test]
async fn test_replanning_same_keyspace_is_idempotent() {
    let engine = engine_with_agents(test_config(), &[1], 10_000).await;
    let first = engine
        .create_task_plan(ATTACK, 1_000_000u128, HASH_MODE)
        .await
        .unwrap();
    let mut events = engine.subscribe();

    let second = engine
        .create_task_plan(ATTACK, KeyspaceSource::Decimal("1000000".to_string()), HASH_MODE)
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(engine.slices(ATTACK).await.len(), 10);
    assert!(drain_events(&mut events).is_empty());
}

#[tokio::test]
async fn test_plan_from_mask_parameters() {
    let engine = engine_with_agents(test_config(), &[1], 10_000).await;
    let params = KeyspaceParams::Mask {
        charset_sizes: vec![10; 6],
    };

    engine
        .create_task_plan(ATTACK, params, HASH_MODE)
        .await
        .unwrap();

    let progress = engine.get_attack_progress(ATTACK).await.unwrap();
    assert_eq!(progress.total_keyspace, 1_000_000);
    assert_eq!(progress.slices_by_state.get(&SliceState::Pending), Some(&10));
}

#[tokio::test]
async fn test_plan_without_agents_uses_minimum_slice_size() {
    let config = test_config().with_slice_bounds(250, 1_000_000);
    let engine = engine_with_agents(config, &[], 0).await;

    engine
        .create_task_plan(ATTACK, 1000u128, HASH_MODE)
        .await
        .unwrap();

    let slices = engine.slices(ATTACK).await;
    assert_eq!(slices.len(), 4);
    assert!(slices.iter().all(|s| s.range.len() == 250));
}

#[tokio::test]
async fn test_empty_keyspace_fails_attack_and_retry_recovers() {
    let engine = engine_with_agents(test_config(), &[1], 10_000).await;
    let mut events = engine.subscribe();

    let err = engine
        .create_task_plan(ATTACK, 0u128, HASH_MODE)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        DispatchError::Planning(PlanningError::EmptyKeyspace)
    ));

    let record = engine.attack(ATTACK).await.unwrap();
    assert_eq!(record.state, AttackState::Failed);
    assert!(record.plan.is_none());
    assert!(record.last_error.is_some());
    assert!(engine.slices(ATTACK).await.is_empty());
    assert!(drain_events(&mut events)
        .iter()
        .any(|e| matches!(e, EngineEvent::AttackFailed { attack_id: ATTACK, .. })));

    engine
        .create_task_plan(ATTACK, 1_000_000u128, HASH_MODE)
        .await
        .expect("retry after failure");
    let record = engine.attack(ATTACK).await.unwrap();
    assert_eq!(record.state, AttackState::Running);
    assert!(record.last_error.is_none());
    assert_eq!(engine.slices(ATTACK).await.len(), 10);
}

#[tokio::test]
async fn test_oversized_decimal_keyspace_is_rejected() {
    let engine = engine_with_agents(test_config(), &[1], 10_000).await;
    let too_big = format!("{}0", u128::MAX);

    let err = engine
        .create_task_plan(ATTACK, KeyspaceSource::Decimal(too_big), HASH_MODE)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        DispatchError::Planning(PlanningError::KeyspaceOverflow(_))
    ));
    assert!(engine.slices(ATTACK).await.is_empty());
}

#[tokio::test]
async fn test_slice_limit_fails_planning_without_materializing() {
    let mut config = test_config();
    config.planner.max_slices_per_attack = 5;
    let engine = engine_with_agents(config, &[1], 10_000).await;

    let err = engine
        .create_task_plan(ATTACK, 1_000_000u128, HASH_MODE)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        DispatchError::Planning(PlanningError::TooManySlices {
            slices: 10,
            limit: 5
        })
    ));
    assert!(engine.slices(ATTACK).await.is_empty());
}

#[tokio::test]
async fn test_growing_keyspace_keeps_completed_work() {
    let engine = engine_with_agents(test_config(), &[1], 10_000).await;
    engine
        .create_task_plan(ATTACK, 1_000_000u128, HASH_MODE)
        .await
        .unwrap();

    let assignment = expect_assigned(engine.request_slice(1, &[ATTACK]).await.unwrap());
    engine
        .report_completion(
            assignment.lease_token,
            assignment.slice.id,
            ResultSummary::default(),
        )
        .await
        .unwrap();

    let first_plan = engine.attack(ATTACK).await.unwrap().plan.unwrap().id;
    let new_plan = engine
        .create_task_plan(ATTACK, 1_500_000u128, HASH_MODE)
        .await
        .unwrap();
    assert_ne!(first_plan, new_plan);

    let slices = engine.slices(ATTACK).await;
    assert_eq!(slices.len(), 15);
    assert!(engine.stores().slices.covers(ATTACK, 1_500_000).await);
    let done = engine
        .stores()
        .slices
        .get(assignment.slice.id)
        .await
        .expect("completed slice kept");
    assert_eq!(done.state, SliceState::Completed);

    let progress = engine.get_attack_progress(ATTACK).await.unwrap();
    assert_eq!(progress.total_keyspace, 1_500_000);
    assert_eq!(progress.keyspace_processed, 100_000);
}

#[tokio::test]
async fn test_shrinking_below_kept_work_resets_partition() {
    let engine = engine_with_agents(test_config(), &[1], 10_000).await;
    engine
        .create_task_plan(ATTACK, 1_000_000u128, HASH_MODE)
        .await
        .unwrap();
    let assignment = expect_assigned(engine.request_slice(1, &[ATTACK]).await.unwrap());
    engine
        .report_completion(
            assignment.lease_token,
            assignment.slice.id,
            ResultSummary::default(),
        )
        .await
        .unwrap();

    engine.replan_attack(ATTACK, 50_000u128).await.unwrap();

    let slices = engine.slices(ATTACK).await;
    assert_eq!(slices.len(), 1);
    assert_eq!(slices[0].state, SliceState::Pending);
    assert_eq!(slices[0].range.len(), 50_000);
    // Indices are never reused.
    assert!(slices[0].id.index >= 10);
    assert!(engine.stores().slices.covers(ATTACK, 50_000).await);
}

#[tokio::test]
async fn test_replan_requires_a_planned_attack() {
    let engine = engine_with_agents(test_config(), &[1], 10_000).await;

    let err = engine.replan_attack(ATTACK, 1000u128).await.unwrap_err();
    assert!(matches!(err, DispatchError::AttackNotFound(ATTACK)));
}
