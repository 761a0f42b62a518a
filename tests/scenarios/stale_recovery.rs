//! Recovering tasks whose worker stopped heartbeating

use crate::helpers::*;
use chrono::{Duration, Utc};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use syncsched::core::config::ScheduleConfig;
use syncsched::core::{ActivityStatus, ExecutionStatus, TaskStatus};
use syncsched::persistence::ScheduleStore;

fn tolerant_pair() -> ScheduleBuilder {
    ScheduleBuilder::new("Pair")
        .step("Sync a", 1, true)
        .parallel("Sync b", 2, true)
        .parallel("Sync c", 3, true)
        .step("Export", 4, false)
}

#[tokio::test]
async fn test_recovers_exactly_the_stale_tasks() {
    let harness = Harness::new();
    let schedule = harness.add(&tolerant_pair()).await;
    let execution = harness.start(&schedule).await;

    let long_ago = Utc::now() - Duration::minutes(30);
    let claimed = harness.claim_all_at(long_ago).await;
    assert_eq!(claimed.len(), 3);

    // One worker is alive, one never heartbeat at all
    harness.engine.update_heartbeats(&[claimed[0].id]).await.unwrap();
    let mut silent = harness.store.load_task(claimed[1].id).await.unwrap().unwrap();
    silent.last_heartbeat = None;
    harness.store.delete_task(silent.id).await.unwrap();
    harness.store.insert_task(&silent).await.unwrap();

    let recovered = harness.engine.recover_stale_tasks(Duration::minutes(5)).await.unwrap();
    assert_eq!(recovered, 2);

    let remaining = harness.tasks_at(execution.id, 0).await;
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, claimed[0].id);

    for task in &claimed[1..] {
        let activity = harness.store.load_activity(task.activity_id).await.unwrap().unwrap();
        assert_eq!(activity.status, ActivityStatus::FailedWithError);
        assert!(activity
            .error_message
            .unwrap()
            .contains("not a data-integrity concern"));
    }
    assert_execution_status(&harness, execution.id, ExecutionStatus::InProgress).await;
}

#[tokio::test]
async fn test_recovery_lets_tolerant_group_advance() {
    let harness = Harness::new();
    let schedule = harness.add(&tolerant_pair()).await;
    let execution = harness.start(&schedule).await;

    harness.claim_all_at(Utc::now() - Duration::hours(1)).await;
    let recovered = harness.engine.recover_stale_tasks(Duration::minutes(5)).await.unwrap();
    assert_eq!(recovered, 3);

    let moved = harness.execution(execution.id).await;
    assert_eq!(moved.current_step_index, 1);
    assert_task_statuses(&harness.tasks_at(execution.id, 1).await, TaskStatus::Queued);
}

#[tokio::test]
async fn test_tasks_are_deleted_even_when_outcome_update_fails() {
    let store = Arc::new(FlakyStore::new());
    let harness = Harness::with_store(store.clone());
    let schedule = harness.add(&tolerant_pair()).await;
    let execution = harness.start(&schedule).await;

    harness.claim_all_at(Utc::now() - Duration::hours(1)).await;
    store.fail_activity_updates.store(true, Ordering::SeqCst);

    let recovered = harness.engine.recover_stale_tasks(Duration::minutes(5)).await.unwrap();
    assert_eq!(recovered, 3);
    assert!(harness.tasks_at(execution.id, 0).await.is_empty());

    // Outcomes could not be written, so the step is not yet considered finished
    let step = harness.activities_at(execution.id, 0).await;
    assert!(step.iter().all(|a| a.status == ActivityStatus::InProgress));
    assert_eq!(harness.execution(execution.id).await.current_step_index, 0);

    // Once writes succeed again the open records are closed and the group moves on
    store.fail_activity_updates.store(false, Ordering::SeqCst);
    let closed = harness.engine.close_orphaned_outcomes(Duration::zero()).await.unwrap();
    assert_eq!(closed, 3);
    let step = harness.activities_at(execution.id, 0).await;
    assert!(step.iter().all(|a| a.status == ActivityStatus::FailedWithError));
    assert_eq!(harness.execution(execution.id).await.current_step_index, 1);
    assert_task_statuses(&harness.tasks_at(execution.id, 1).await, TaskStatus::Queued);
}

fn slow_import(timeout_secs: u64) -> String {
    format!(
        r#"
name: "Slow import"
steps:
  - name: "Import"
    type: run_profile
    connected_system_id: "00000000-0000-4000-8000-000000000001"
    run_profile_id: "00000000-0000-4000-8000-000000000002"
    timeout_secs: {}
"#,
        timeout_secs
    )
}

#[tokio::test]
async fn test_long_step_timeout_does_not_hide_silent_worker() {
    let harness = Harness::new();
    let schedule = ScheduleConfig::from_yaml(&slow_import(7200)).unwrap().to_schedule();
    harness.store.save_schedule(&schedule).await.unwrap();
    let execution = harness.start(&schedule).await;

    harness.claim_all_at(Utc::now() - Duration::minutes(30)).await;
    let recovered = harness.engine.recover_stale_tasks(Duration::minutes(5)).await.unwrap();
    assert_eq!(recovered, 1);
    assert!(harness.tasks_at(execution.id, 0).await.is_empty());
    assert_execution_status(&harness, execution.id, ExecutionStatus::Failed).await;
}

#[tokio::test]
async fn test_heartbeating_worker_within_step_timeout_is_kept() {
    let harness = Harness::new();
    let schedule = ScheduleConfig::from_yaml(&slow_import(60)).unwrap().to_schedule();
    harness.store.save_schedule(&schedule).await.unwrap();
    let execution = harness.start(&schedule).await;

    let claimed = harness.claim_all_at(Utc::now() - Duration::seconds(20)).await;
    harness.engine.update_heartbeats(&[claimed[0].id]).await.unwrap();
    let recovered = harness.engine.recover_stale_tasks(Duration::minutes(5)).await.unwrap();
    assert_eq!(recovered, 0);
    assert_eq!(harness.tasks_at(execution.id, 0).await.len(), 1);
}

#[tokio::test]
async fn test_overrunning_step_is_failed_despite_heartbeats() {
    let harness = Harness::new();
    let schedule = ScheduleConfig::from_yaml(&slow_import(60)).unwrap().to_schedule();
    harness.store.save_schedule(&schedule).await.unwrap();
    let execution = harness.start(&schedule).await;

    let claimed = harness.claim_all_at(Utc::now() - Duration::minutes(2)).await;
    harness.engine.update_heartbeats(&[claimed[0].id]).await.unwrap();
    let recovered = harness.engine.recover_stale_tasks(Duration::minutes(5)).await.unwrap();
    assert_eq!(recovered, 1);

    let activity = harness.store.load_activity(claimed[0].activity_id).await.unwrap().unwrap();
    assert!(activity.error_message.unwrap().contains("step timeout of 60s"));
    assert_execution_status(&harness, execution.id, ExecutionStatus::Failed).await;
}
