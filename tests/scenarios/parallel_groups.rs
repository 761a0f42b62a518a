//! Step groups: queueing up front, promotion, and continue-on-failure across a group

use crate::helpers::*;
use syncsched::core::{ActivityStatus, ExecutionStatus, Initiator, TaskExecutionMode, TaskStatus};
use syncsched::persistence::ScheduleStore;

fn three_step_schedule() -> ScheduleBuilder {
    ScheduleBuilder::new("Three step")
        .step("Import HR", 1, false)
        .step("Sync directory", 2, true)
        .parallel("Sync apps", 3, true)
        .step("Export", 4, false)
}

#[tokio::test]
async fn test_start_creates_one_task_per_step() {
    let harness = Harness::new();
    let schedule = harness.add(&three_step_schedule()).await;
    let execution = harness.start(&schedule).await;

    assert_eq!(harness.tasks(execution.id).await.len(), 4);
    assert_task_statuses(&harness.tasks_at(execution.id, 0).await, TaskStatus::Queued);
    assert_task_statuses(&harness.tasks_at(execution.id, 1).await, TaskStatus::WaitingForPreviousStep);
    assert_task_statuses(&harness.tasks_at(execution.id, 2).await, TaskStatus::WaitingForPreviousStep);

    let parallel = harness.tasks_at(execution.id, 1).await;
    assert_eq!(parallel.len(), 2);
    assert!(parallel
        .iter()
        .all(|t| t.schedule.as_ref().unwrap().execution_mode == TaskExecutionMode::Parallel));
    assert_eq!(execution.initiated_by.name, "tester");
}

#[tokio::test]
async fn test_tolerated_failure_in_parallel_group_completes() {
    let harness = Harness::new();
    let schedule = harness.add(&three_step_schedule()).await;
    let execution = harness.start(&schedule).await;

    let first = harness.claim_all().await;
    assert_eq!(first.len(), 1);
    harness.finish(&first[0], ActivityStatus::Complete).await;

    // Both parallel members become runnable together
    assert_task_statuses(&harness.tasks_at(execution.id, 1).await, TaskStatus::Queued);
    assert_eq!(harness.execution(execution.id).await.current_step_index, 1);

    let group = harness.claim_all().await;
    assert_eq!(group.len(), 2);
    harness.finish(&group[1], ActivityStatus::FailedWithError).await;
    assert_eq!(harness.execution(execution.id).await.current_step_index, 1);
    assert_execution_status(&harness, execution.id, ExecutionStatus::InProgress).await;

    harness.finish(&group[0], ActivityStatus::Complete).await;
    assert_eq!(harness.execution(execution.id).await.current_step_index, 2);
    assert_task_statuses(&harness.tasks_at(execution.id, 2).await, TaskStatus::Queued);

    harness.run_to_end(execution.id, ActivityStatus::Complete).await;
    assert_execution_status(&harness, execution.id, ExecutionStatus::Completed).await;

    let step_one = outcome_statuses(&harness.activities_at(execution.id, 1).await);
    assert_eq!(step_one, vec![ActivityStatus::Complete, ActivityStatus::FailedWithError]);
}

#[tokio::test]
async fn test_completion_order_within_group_does_not_matter() {
    let harness = Harness::new();
    let schedule = harness.add(&three_step_schedule()).await;
    let execution = harness.start(&schedule).await;

    let first = harness.claim_all().await;
    harness.finish(&first[0], ActivityStatus::Complete).await;

    let group = harness.claim_all().await;
    harness.finish(&group[0], ActivityStatus::Complete).await;
    harness.finish(&group[1], ActivityStatus::FailedWithError).await;

    harness.run_to_end(execution.id, ActivityStatus::Complete).await;
    assert_execution_status(&harness, execution.id, ExecutionStatus::Completed).await;
}

#[tokio::test]
async fn test_complete_with_error_counts_as_failure() {
    let harness = Harness::new();
    let schedule = harness
        .add(&ScheduleBuilder::new("Strict").step("Import", 1, false).step("Export", 2, false))
        .await;
    let execution = harness.start(&schedule).await;

    let first = harness.claim_all().await;
    harness.finish(&first[0], ActivityStatus::CompleteWithError).await;

    assert_execution_status(&harness, execution.id, ExecutionStatus::Failed).await;
    assert!(harness.tasks(execution.id).await.is_empty());
}

#[tokio::test]
async fn test_zero_step_schedule_returns_nothing() {
    let harness = Harness::new();
    let schedule = harness.add(&ScheduleBuilder::new("Empty")).await;

    let started = harness
        .engine
        .start_execution(&schedule, &Initiator::system())
        .await
        .unwrap();
    assert!(started.is_none());
    assert!(harness.store.list_executions(None, 10).await.unwrap().is_empty());
}
