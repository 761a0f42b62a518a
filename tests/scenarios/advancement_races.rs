//! Advancement under repeated and concurrent invocation

use crate::helpers::*;
use std::sync::Arc;
use syncsched::core::{ActivityStatus, ExecutionStatus, ScheduleExecution, TaskStatus};
use syncsched::execution::{AdvanceOutcome, Pending};
use syncsched::persistence::ScheduleStore;

fn staged() -> ScheduleBuilder {
    ScheduleBuilder::new("Staged")
        .step("Import", 1, false)
        .parallel("Import apps", 2, false)
        .step("Sync", 3, false)
        .step("Export", 4, false)
}

#[tokio::test]
async fn test_repeated_advance_is_idempotent() {
    let harness = Harness::new();
    let schedule = harness.add(&staged()).await;
    let execution = harness.start(&schedule).await;

    for task in harness.claim_all().await {
        harness.record_outcome(&task, ActivityStatus::Complete).await;
    }

    let first = harness.engine.advance(execution.id).await.unwrap();
    assert!(matches!(first, AdvanceOutcome::Advanced { step_index: 1, promoted: 1 }));
    let after_first = (harness.execution(execution.id).await, harness.tasks(execution.id).await);

    let second = harness.engine.advance(execution.id).await.unwrap();
    assert!(matches!(second, AdvanceOutcome::StillRunning(_)));
    let after_second = (harness.execution(execution.id).await, harness.tasks(execution.id).await);
    assert_eq!(after_first, after_second);
}

#[tokio::test]
async fn test_step_index_never_decreases() {
    let harness = Harness::new();
    let schedule = harness.add(&staged()).await;
    let execution = harness.start(&schedule).await;

    let mut last_index = 0;
    loop {
        let claimed = harness.claim_all().await;
        if claimed.is_empty() {
            break;
        }
        for task in &claimed {
            harness.finish(task, ActivityStatus::Complete).await;
            for _ in 0..3 {
                harness.engine.advance(execution.id).await.unwrap();
                let index = harness.execution(execution.id).await.current_step_index;
                assert!(index >= last_index);
                last_index = index;
            }
        }
    }
    assert_eq!(last_index, 2);
    assert_execution_status(&harness, execution.id, ExecutionStatus::Completed).await;
}

#[tokio::test]
async fn test_concurrent_advance_promotes_exactly_once() {
    let harness = Harness::new();
    let schedule = harness.add(&staged()).await;
    let execution = harness.start(&schedule).await;

    // Both parallel members finish, then every trigger fires at once
    for task in harness.claim_all().await {
        harness.record_outcome(&task, ActivityStatus::Complete).await;
    }

    let mut handles = Vec::new();
    for _ in 0..8 {
        let engine = harness.engine.clone();
        handles.push(tokio::spawn(async move { engine.advance(execution.id).await }));
    }
    // A caller that lands between the index move and the release may repeat
    // the release, but each waiting task changes state only once
    let mut promoted_total = 0;
    for handle in handles {
        if let AdvanceOutcome::Advanced { promoted, .. } = handle.await.unwrap().unwrap() {
            promoted_total += promoted;
        }
    }
    assert_eq!(promoted_total, 1);

    let moved = harness.execution(execution.id).await;
    assert_eq!(moved.current_step_index, 1);
    assert_task_statuses(&harness.tasks_at(execution.id, 1).await, TaskStatus::Queued);
    assert_task_statuses(&harness.tasks_at(execution.id, 2).await, TaskStatus::WaitingForPreviousStep);
}

#[tokio::test]
async fn test_sweep_recovers_missed_completion_callback() {
    let harness = Harness::new();
    let schedule = harness.add(&staged()).await;
    let execution = harness.start(&schedule).await;

    // Workers finished but died before calling back
    for task in harness.claim_all().await {
        harness.record_outcome(&task, ActivityStatus::Complete).await;
    }
    assert_eq!(harness.execution(execution.id).await.current_step_index, 0);

    let report = harness.engine.sweep_in_progress().await.unwrap();
    assert_eq!(report.checked, 1);
    assert_eq!(report.advanced, 1);
    assert_eq!(harness.execution(execution.id).await.current_step_index, 1);
}

#[tokio::test]
async fn test_tasks_left_waiting_at_current_step_are_released() {
    let harness = Harness::new();
    let schedule = harness.add(&staged()).await;
    let execution = harness.start(&schedule).await;

    for task in harness.claim_all().await {
        harness.record_outcome(&task, ActivityStatus::Complete).await;
    }

    // Crash between moving the index and releasing the group
    assert!(harness.store.advance_step_index(execution.id, 0, 1).await.unwrap());
    assert_task_statuses(&harness.tasks_at(execution.id, 1).await, TaskStatus::WaitingForPreviousStep);

    let outcome = harness.engine.advance(execution.id).await.unwrap();
    assert!(matches!(outcome, AdvanceOutcome::Advanced { step_index: 1, promoted: 1 }));
    assert_task_statuses(&harness.tasks_at(execution.id, 1).await, TaskStatus::Queued);
    assert_task_statuses(&harness.tasks_at(execution.id, 2).await, TaskStatus::WaitingForPreviousStep);
}

fn two_steps() -> ScheduleBuilder {
    ScheduleBuilder::new("Two steps").step("Import", 1, false).step("Export", 2, false)
}

#[tokio::test]
async fn test_lagging_read_never_completes_released_group() {
    let store = Arc::new(FlakyStore::new());
    let harness = Harness::with_store(store.clone());
    let schedule = harness.add(&two_steps()).await;
    let execution = harness.start(&schedule).await;

    for task in harness.claim_all().await {
        harness.record_outcome(&task, ActivityStatus::Complete).await;
    }
    let before_move = harness.execution(execution.id).await;

    let first = harness.engine.advance(execution.id).await.unwrap();
    assert!(matches!(first, AdvanceOutcome::Advanced { step_index: 1, promoted: 1 }));

    // A second trigger read the execution before the index moved
    store.lag_next_execution_read(before_move);
    let late = harness.engine.advance(execution.id).await.unwrap();
    assert!(matches!(late, AdvanceOutcome::StillRunning(Pending::LaterTasks(1))));

    assert_execution_status(&harness, execution.id, ExecutionStatus::InProgress).await;
    assert_task_statuses(&harness.tasks_at(execution.id, 1).await, TaskStatus::Queued);

    let export = harness.claim_all().await;
    harness.finish(&export[0], ActivityStatus::FailedWithError).await;
    assert_execution_status(&harness, execution.id, ExecutionStatus::Failed).await;
}

#[tokio::test]
async fn test_completion_from_lagging_read_is_superseded() {
    let store = Arc::new(FlakyStore::new());
    let harness = Harness::with_store(store.clone());
    let schedule = harness.add(&two_steps()).await;
    let execution = harness.start(&schedule).await;

    for task in harness.claim_all().await {
        harness.finish(&task, ActivityStatus::Complete).await;
    }
    let before_move = ScheduleExecution {
        current_step_index: 0,
        ..harness.execution(execution.id).await
    };
    assert_eq!(harness.execution(execution.id).await.current_step_index, 1);

    // The last group failed and its row is gone, but nobody has advanced yet
    for task in harness.claim_all().await {
        harness.record_outcome(&task, ActivityStatus::FailedWithError).await;
    }

    // Judged at the old index every task is finished, so only the store guard
    // stops a completion here
    store.lag_next_execution_read(before_move);
    let late = harness.engine.advance(execution.id).await.unwrap();
    assert!(matches!(late, AdvanceOutcome::Superseded));
    assert_execution_status(&harness, execution.id, ExecutionStatus::InProgress).await;

    let outcome = harness.engine.advance(execution.id).await.unwrap();
    assert!(matches!(outcome, AdvanceOutcome::Failed { .. }));
    assert_execution_status(&harness, execution.id, ExecutionStatus::Failed).await;
}
