//! A failure in a group that does not tolerate it ends the execution

use crate::helpers::*;
use syncsched::core::config::ScheduleConfig;
use syncsched::core::{ActivityStatus, ExecutionStatus, Initiator, TaskKind};
use syncsched::persistence::ScheduleStore;

#[tokio::test]
async fn test_intolerant_member_fails_execution_and_drops_later_steps() {
    let harness = Harness::new();
    let schedule = harness
        .add(
            &ScheduleBuilder::new("Cascade")
                .step("Import", 1, false)
                .step("Sync a", 2, true)
                .parallel("Sync b", 3, false)
                .step("Export", 4, false)
                .step("Report", 5, false),
        )
        .await;
    let execution = harness.start(&schedule).await;

    let first = harness.claim_all().await;
    harness.finish(&first[0], ActivityStatus::Complete).await;

    let group = harness.claim_all().await;
    assert_eq!(group.len(), 2);
    for task in &group {
        harness.finish(task, ActivityStatus::Complete).await;
    }
    assert_execution_status(&harness, execution.id, ExecutionStatus::InProgress).await;

    let export = harness.claim_all().await;
    harness.finish(&export[0], ActivityStatus::FailedWithError).await;

    let failed = harness.execution(execution.id).await;
    assert_eq!(failed.status, ExecutionStatus::Failed);
    assert!(failed.completed_at.is_some());
    assert!(failed.error_message.as_deref().unwrap().contains("Export"));

    // Every waiting task for later steps is gone, and its outcome says why
    assert!(harness.tasks(execution.id).await.is_empty());
    let report = harness.activities_at(execution.id, 3).await;
    assert_eq!(report.len(), 1);
    assert_eq!(report[0].status, ActivityStatus::Cancelled);
    assert!(report[0].error_message.as_deref().unwrap().contains("step 2"));
}

#[tokio::test]
async fn test_any_intolerant_member_fails_the_group() {
    let harness = Harness::new();
    let schedule = harness
        .add(
            &ScheduleBuilder::new("Mixed group")
                .step("Sync a", 1, true)
                .parallel("Sync b", 2, false)
                .step("Export", 3, false),
        )
        .await;
    let execution = harness.start(&schedule).await;

    let group = harness.claim_all().await;
    let failing = group
        .iter()
        .find(|t| match &t.kind {
            TaskKind::SynchronisationRun { run_profile_id, .. } => *run_profile_id == profile_id(1),
            _ => false,
        })
        .unwrap();
    let other = group.iter().find(|t| t.id != failing.id).unwrap();

    // Tolerant member fails, intolerant member succeeds: the group still fails
    harness.finish(failing, ActivityStatus::FailedWithError).await;
    assert_execution_status(&harness, execution.id, ExecutionStatus::InProgress).await;
    harness.finish(other, ActivityStatus::Complete).await;

    let failed = harness.execution(execution.id).await;
    assert_eq!(failed.status, ExecutionStatus::Failed);
    let message = failed.error_message.unwrap();
    assert!(message.contains("Sync a"));
    assert!(message.contains("Sync b"));
    assert!(harness.tasks(execution.id).await.is_empty());
}

#[tokio::test]
async fn test_invalid_step_fails_fast_at_start() {
    let harness = Harness::new();
    let yaml = r#"
name: "Broken"
steps:
  - name: "Import"
    type: run_profile
    connected_system_id: "00000000-0000-4000-8000-000000000001"
    run_profile_id: "00000000-0000-4000-8000-000000000002"
  - name: "Missing profile"
    type: run_profile
    connected_system_id: "00000000-0000-4000-8000-000000000003"
"#;
    let schedule = ScheduleConfig::from_yaml(yaml).unwrap().to_schedule();
    harness.store.save_schedule(&schedule).await.unwrap();

    let err = harness
        .engine
        .start_execution(&schedule, &Initiator::system())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Missing profile"));

    let executions = harness.store.list_executions(Some(schedule.id), 10).await.unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].status, ExecutionStatus::Failed);
    assert!(executions[0].error_message.as_deref().unwrap().contains("Missing profile"));
    assert!(harness.tasks(executions[0].id).await.is_empty());
}

#[tokio::test]
async fn test_failed_execution_ignores_further_advancement() {
    let harness = Harness::new();
    let schedule = harness
        .add(&ScheduleBuilder::new("Strict").step("Import", 1, false).step("Export", 2, false))
        .await;
    let execution = harness.start(&schedule).await;

    let first = harness.claim_all().await;
    harness.finish(&first[0], ActivityStatus::FailedWithError).await;
    let failed = harness.execution(execution.id).await;

    harness.engine.advance(execution.id).await.unwrap();
    harness.engine.sweep_in_progress().await.unwrap();
    assert_eq!(harness.execution(execution.id).await, failed);
    assert!(harness.claim_all().await.is_empty());
}

fn tolerant_then_export() -> ScheduleBuilder {
    ScheduleBuilder::new("Tolerant")
        .step("Sync a", 1, true)
        .parallel("Sync b", 2, true)
        .step("Export", 3, false)
}

async fn tolerance_survives_schedule_deletion(harness: Harness) {
    let schedule = harness.add(&tolerant_then_export()).await;
    let execution = harness.start(&schedule).await;
    assert!(harness.store.delete_schedule(schedule.id).await.unwrap());

    let group = harness.claim_all().await;
    assert_eq!(group.len(), 2);
    harness.finish(&group[0], ActivityStatus::FailedWithError).await;
    harness.finish(&group[1], ActivityStatus::Complete).await;

    let moved = harness.execution(execution.id).await;
    assert_eq!(moved.status, ExecutionStatus::InProgress);
    assert_eq!(moved.current_step_index, 1);

    harness.run_to_end(execution.id, ActivityStatus::Complete).await;
    assert_execution_status(&harness, execution.id, ExecutionStatus::Completed).await;
}

#[tokio::test]
async fn test_tolerated_failure_still_tolerated_after_schedule_deleted() {
    tolerance_survives_schedule_deletion(Harness::new()).await;
}

#[cfg(feature = "sqlite")]
#[tokio::test]
async fn test_sqlite_tolerated_failure_still_tolerated_after_schedule_deleted() {
    use std::sync::Arc;
    use syncsched::persistence::SqliteScheduleStore;

    let store = SqliteScheduleStore::new(":memory:").await.unwrap();
    tolerance_survives_schedule_deletion(Harness::with_store(Arc::new(store))).await;
}
