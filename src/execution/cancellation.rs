//! Per-task and whole-execution cancellation

use crate::{
    core::{
        ActivityOutcome, EngineError, EngineResult, ExecutionStatus, ExecutionTransition, Initiator, TaskStatus,
    },
    execution::engine::{ExecutionEvent, ScheduleEngine},
};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Each conflicting retry observes a later task state, and a task has at most
/// three transitions left, so this bounds the loop.
const MAX_CANCEL_ATTEMPTS: usize = 4;

/// Result of asking for one task to stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskCancellation {
    /// No such task; it has already finished or been removed
    NotFound,
    /// The task is being worked; its worker was asked to stop
    Requested,
    /// The task had not started and was removed
    Cancelled,
}

impl ScheduleEngine {
    /// Cancel a single task.
    ///
    /// A task held by a worker is flagged and stops cooperatively. One that
    /// has not started is removed straight away.
    pub async fn request_task_cancellation(
        &self,
        task_id: Uuid,
        initiator: &Initiator,
    ) -> EngineResult<TaskCancellation> {
        for _ in 0..MAX_CANCEL_ATTEMPTS {
            let Some(task) = self.store().load_task(task_id).await? else {
                info!(task_id = %task_id, "Task not found; nothing to cancel");
                return Ok(TaskCancellation::NotFound);
            };

            match task.status {
                TaskStatus::CancellationRequested => return Ok(TaskCancellation::Requested),
                TaskStatus::Processing => {
                    if self
                        .store()
                        .update_task_status(task_id, TaskStatus::Processing, TaskStatus::CancellationRequested)
                        .await?
                    {
                        info!(task_id = %task_id, initiator = %initiator.name, "Cancellation requested");
                        self.emit_event(ExecutionEvent::TaskCancellationRequested { task_id }).await;
                        return Ok(TaskCancellation::Requested);
                    }
                }
                TaskStatus::Queued | TaskStatus::WaitingForPreviousStep => {
                    let reason = format!("Cancelled by {}", initiator.name);
                    if self.withdraw_task(&task, &reason).await {
                        info!(task_id = %task_id, initiator = %initiator.name, "Cancelled task before it started");
                        self.emit_event(ExecutionEvent::TaskCancelled { task_id }).await;

                        if let Some(execution_id) = task.execution_id() {
                            if let Err(e) = self.advance(execution_id).await {
                                error!(execution_id = %execution_id, error = %e, "Failed to advance after task cancellation");
                            }
                        }
                        return Ok(TaskCancellation::Cancelled);
                    }
                }
            }
        }

        Err(EngineError::Store(anyhow::anyhow!(
            "Task {} kept changing state while being cancelled",
            task_id
        )))
    }

    /// Force an execution to stop: every task is removed and every open
    /// activity marked cancelled. Returns the number of tasks removed.
    pub async fn cancel_execution(
        &self,
        execution_id: Uuid,
        reason: Option<&str>,
        initiator: &Initiator,
    ) -> EngineResult<usize> {
        let execution = self
            .store()
            .load_execution(execution_id)
            .await?
            .ok_or(EngineError::ExecutionNotFound(execution_id))?;

        let cancellable = [ExecutionStatus::Queued, ExecutionStatus::InProgress];
        if !cancellable.contains(&execution.status) {
            return Err(EngineError::InvalidExecutionState {
                id: execution_id,
                status: execution.status,
            });
        }

        let reason = match reason {
            Some(reason) => format!("Cancelled by {}: {}", initiator.name, reason),
            None => format!("Cancelled by {}", initiator.name),
        };

        let applied = self
            .store()
            .transition_execution(execution_id, &cancellable, &ExecutionTransition::cancelled(reason.clone()))
            .await?;
        if !applied {
            let status = self
                .store()
                .load_execution(execution_id)
                .await?
                .map(|e| e.status)
                .unwrap_or(execution.status);
            return Err(EngineError::InvalidExecutionState {
                id: execution_id,
                status,
            });
        }

        let mut removed = 0;
        for task in self.store().tasks_for_execution(execution_id).await? {
            if let Err(e) = self
                .store()
                .complete_activity(task.activity_id, &ActivityOutcome::cancelled(reason.clone()))
                .await
            {
                warn!(task_id = %task.id, activity_id = %task.activity_id, error = %e, "Failed to cancel activity");
            }
            match self.store().delete_task(task.id).await {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => error!(task_id = %task.id, error = %e, "Failed to remove task"),
            }
        }

        info!(
            execution_id = %execution_id,
            initiator = %initiator.name,
            tasks_removed = removed,
            "Schedule execution cancelled"
        );
        self.emit_event(ExecutionEvent::ExecutionCancelled {
            execution_id,
            tasks_removed: removed,
        })
        .await;
        Ok(removed)
    }
}
