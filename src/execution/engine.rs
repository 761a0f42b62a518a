//! Schedule engine - starts executions and moves them through their step groups

use crate::{
    core::{
        Activity, ActivityOutcome, EngineError, EngineResult, ExecutionStatus, ExecutionTransition,
        Initiator, Materialization, Schedule, ScheduleExecution, ScheduleLink, ScheduleStep, TaskExecutionMode,
        TaskKind, TaskStatus, WorkerTask,
    },
    execution::advancement::{self, AdvanceDecision, AdvanceOutcome, StepSnapshot},
    persistence::ScheduleStore,
};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Events that can occur while executions run
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    ExecutionStarted {
        execution_id: Uuid,
        schedule_name: String,
        tasks_queued: usize,
    },
    StepAdvanced {
        execution_id: Uuid,
        step_index: usize,
        promoted: usize,
    },
    ExecutionCompleted {
        execution_id: Uuid,
    },
    ExecutionFailed {
        execution_id: Uuid,
        message: String,
    },
    ExecutionCancelled {
        execution_id: Uuid,
        tasks_removed: usize,
    },
    TaskCancellationRequested {
        task_id: Uuid,
    },
    TaskCancelled {
        task_id: Uuid,
    },
    TaskRecovered {
        task_id: Uuid,
        execution_id: Option<Uuid>,
    },
}

/// Type for event handlers
pub type EventHandler = Arc<dyn Fn(ExecutionEvent) + Send + Sync>;

/// Tally of one advancement sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub checked: usize,
    pub advanced: usize,
    pub completed: usize,
    pub failed: usize,
    pub still_running: usize,
    pub errors: usize,
}

/// A step turned into the records that will be persisted for it
struct PlannedTask {
    step_index: usize,
    activity: Activity,
    task: WorkerTask,
}

/// Schedule execution engine.
///
/// Holds no execution state of its own: every decision is made from a fresh
/// read of the store, so any number of engines may share one store.
pub struct ScheduleEngine {
    store: Arc<dyn ScheduleStore>,
    event_handlers: Arc<Mutex<Vec<EventHandler>>>,
}

impl ScheduleEngine {
    pub fn new(store: Arc<dyn ScheduleStore>) -> Self {
        Self {
            store,
            event_handlers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn store(&self) -> &Arc<dyn ScheduleStore> {
        &self.store
    }

    /// Add an event handler
    pub async fn add_event_handler<F>(&self, handler: F)
    where
        F: Fn(ExecutionEvent) + Send + Sync + 'static,
    {
        self.event_handlers.lock().await.push(Arc::new(handler));
    }

    /// Emit an event to all handlers
    pub(crate) async fn emit_event(&self, event: ExecutionEvent) {
        let handlers = self.event_handlers.lock().await;
        for handler in handlers.iter() {
            handler(event.clone());
        }
    }

    /// Start a stored schedule by id
    pub async fn start_schedule(
        &self,
        schedule_id: Uuid,
        initiator: &Initiator,
    ) -> EngineResult<Option<ScheduleExecution>> {
        let schedule = self
            .store
            .load_schedule(schedule_id)
            .await?
            .ok_or(EngineError::ScheduleNotFound(schedule_id))?;
        self.start_execution(&schedule, initiator).await
    }

    /// Start one execution of a schedule.
    ///
    /// Every step's task is queued up front: the first group runnable, later
    /// groups waiting. Returns `None` for a schedule without steps.
    pub async fn start_execution(
        &self,
        schedule: &Schedule,
        initiator: &Initiator,
    ) -> EngineResult<Option<ScheduleExecution>> {
        let groups = schedule.step_groups();
        let Some(first_index) = groups.keys().next().copied() else {
            info!(schedule = %schedule.name, "Schedule has no steps; nothing to run");
            return Ok(None);
        };

        let mut execution =
            ScheduleExecution::new(schedule.id, &schedule.name, schedule.steps.len(), initiator.clone());
        execution.start(first_index);
        self.store.insert_execution(&execution).await?;
        self.store.set_last_run_time(schedule.id, Utc::now()).await?;

        info!(
            execution_id = %execution.id,
            schedule = %schedule.name,
            initiator = %initiator.name,
            "Starting schedule execution"
        );

        let queued = match self.queue_steps(&execution, schedule, first_index, initiator).await {
            Ok(queued) => queued,
            Err(e) => {
                self.abort_start(&execution, &e).await;
                return Err(e);
            }
        };

        let first_group = queued.iter().filter(|(index, _)| *index == first_index).count();
        self.emit_event(ExecutionEvent::ExecutionStarted {
            execution_id: execution.id,
            schedule_name: schedule.name.clone(),
            tasks_queued: queued.len(),
        })
        .await;

        if first_group == 0 {
            debug!(execution_id = %execution.id, "First step group produced no tasks; advancing");
            self.advance(execution.id).await?;
        }

        let execution = self
            .store
            .load_execution(execution.id)
            .await?
            .ok_or(EngineError::ExecutionNotFound(execution.id))?;
        Ok(Some(execution))
    }

    /// Persist a task and activity for every executable step.
    ///
    /// Later groups are written first so a fast worker cannot finish the first
    /// group before its successors exist.
    async fn queue_steps(
        &self,
        execution: &ScheduleExecution,
        schedule: &Schedule,
        first_index: usize,
        initiator: &Initiator,
    ) -> EngineResult<Vec<(usize, Uuid)>> {
        let mut planned = Vec::new();
        for (step_index, steps) in schedule.step_groups() {
            let status = if step_index == first_index {
                TaskStatus::Queued
            } else {
                TaskStatus::WaitingForPreviousStep
            };
            let mode = TaskExecutionMode::for_group_size(steps.len());

            for step in steps {
                match step.step_type.materialize(&step.name)? {
                    Materialization::Task(kind) => {
                        planned.push(plan_task(execution, step, kind, status, mode, initiator));
                    }
                    Materialization::Unsupported(step_type) => {
                        warn!(
                            execution_id = %execution.id,
                            step = %step.name,
                            step_type,
                            "Step type is not executable yet; skipping"
                        );
                    }
                }
            }
        }

        let mut queued = Vec::with_capacity(planned.len());
        for PlannedTask {
            step_index,
            activity,
            task,
        } in planned.into_iter().rev()
        {
            self.store.insert_activity(&activity).await?;
            self.store.insert_task(&task).await?;
            debug!(
                execution_id = %execution.id,
                task_id = %task.id,
                step_index,
                status = task.status.as_str(),
                "Queued task"
            );
            queued.push((step_index, task.id));
        }

        Ok(queued)
    }

    /// Fail an execution whose tasks could not all be queued and pull back what was
    async fn abort_start(&self, execution: &ScheduleExecution, cause: &EngineError) {
        error!(execution_id = %execution.id, error = %cause, "Failed to queue schedule steps");

        let transition = ExecutionTransition::failed(
            format!("Failed to queue schedule steps: {}", cause),
            Some(format!("{:?}", cause)),
        );
        if let Err(e) = self
            .store
            .transition_execution(execution.id, &[ExecutionStatus::InProgress], &transition)
            .await
        {
            error!(execution_id = %execution.id, error = %e, "Failed to mark execution as failed");
        }

        let tasks = match self.store.tasks_for_execution(execution.id).await {
            Ok(tasks) => tasks,
            Err(e) => {
                error!(execution_id = %execution.id, error = %e, "Failed to load tasks for cleanup");
                return;
            }
        };
        for task in tasks {
            self.withdraw_task(&task, "Not run: the execution failed to start").await;
        }

        self.emit_event(ExecutionEvent::ExecutionFailed {
            execution_id: execution.id,
            message: transition.error_message.unwrap_or_default(),
        })
        .await;
    }

    /// Queue a standalone task outside any schedule
    pub async fn submit_task(&self, kind: TaskKind, target_name: &str, initiator: &Initiator) -> EngineResult<WorkerTask> {
        let activity = Activity::new(target_name, kind.name(), initiator.clone());
        let task = WorkerTask::new(kind, activity.id);
        self.store.insert_activity(&activity).await?;
        self.store.insert_task(&task).await?;
        info!(task_id = %task.id, kind = task.kind.name(), "Queued standalone task");
        Ok(task)
    }

    /// Read everything the advancement decision needs.
    pub async fn snapshot(&self, execution_id: Uuid) -> EngineResult<StepSnapshot> {
        let execution = self
            .store
            .load_execution(execution_id)
            .await?
            .ok_or(EngineError::ExecutionNotFound(execution_id))?;

        if execution.status != ExecutionStatus::InProgress {
            return Ok(StepSnapshot {
                execution,
                tasks: Vec::new(),
                step_activities: Vec::new(),
            });
        }

        // Continue-on-failure was copied onto each activity at start, so the
        // schedule row is not consulted and may since have changed or gone
        let current = execution.current_step_index;
        let tasks = self.store.tasks_for_execution(execution_id).await?;
        let step_activities = self.store.activities_for_step(execution_id, current).await?;

        Ok(StepSnapshot {
            execution,
            tasks,
            step_activities,
        })
    }

    /// Decide whether an execution can move on, and apply the decision.
    ///
    /// Safe to call any number of times from any number of callers.
    pub async fn advance(&self, execution_id: Uuid) -> EngineResult<AdvanceOutcome> {
        let snapshot = self.snapshot(execution_id).await?;
        let decision = advancement::decide(&snapshot);
        debug!(execution_id = %execution_id, ?decision, "Advancement decision");

        match decision {
            AdvanceDecision::NotInProgress(status) => Ok(AdvanceOutcome::NotInProgress(status)),
            AdvanceDecision::StillRunning(pending) => Ok(AdvanceOutcome::StillRunning(pending)),
            AdvanceDecision::Promote { from, to } => self.promote(execution_id, from, to).await,
            AdvanceDecision::Complete { step_index } => self.complete(execution_id, step_index).await,
            AdvanceDecision::Fail { step_index, message } => self.fail(execution_id, step_index, message).await,
        }
    }

    /// Worker completion hook
    pub async fn on_task_completed(&self, task: &WorkerTask) -> EngineResult<Option<AdvanceOutcome>> {
        match task.execution_id() {
            Some(execution_id) => Ok(Some(self.advance(execution_id).await?)),
            None => Ok(None),
        }
    }

    async fn promote(&self, execution_id: Uuid, from: usize, to: usize) -> EngineResult<AdvanceOutcome> {
        if to != from && !self.store.advance_step_index(execution_id, from, to).await? {
            debug!(execution_id = %execution_id, from, to, "Step index already moved by another caller");
            return Ok(AdvanceOutcome::Superseded);
        }

        let promoted = self.store.promote_waiting_tasks(execution_id, to).await?;
        if to == from {
            warn!(execution_id = %execution_id, step_index = to, promoted, "Released tasks left waiting at the current step");
        } else {
            info!(execution_id = %execution_id, from, to, promoted, "Advanced to next step group");
        }

        self.emit_event(ExecutionEvent::StepAdvanced {
            execution_id,
            step_index: to,
            promoted,
        })
        .await;

        Ok(AdvanceOutcome::Advanced {
            step_index: to,
            promoted,
        })
    }

    async fn complete(&self, execution_id: Uuid, step_index: usize) -> EngineResult<AdvanceOutcome> {
        let applied = self
            .store
            .transition_execution(
                execution_id,
                &[ExecutionStatus::InProgress],
                &ExecutionTransition::completed().at_step(step_index),
            )
            .await?;
        if !applied {
            debug!(execution_id = %execution_id, step_index, "Execution moved on before it could complete");
            return Ok(AdvanceOutcome::Superseded);
        }

        info!(execution_id = %execution_id, "Schedule execution completed");
        self.emit_event(ExecutionEvent::ExecutionCompleted { execution_id }).await;
        Ok(AdvanceOutcome::Completed)
    }

    async fn fail(&self, execution_id: Uuid, step_index: usize, message: String) -> EngineResult<AdvanceOutcome> {
        let applied = self
            .store
            .transition_execution(
                execution_id,
                &[ExecutionStatus::InProgress],
                &ExecutionTransition::failed(message.clone(), None).at_step(step_index),
            )
            .await?;

        // Another caller may have won the transition; still clear up after a real failure
        if !applied && !self.has_status(execution_id, ExecutionStatus::Failed).await? {
            debug!(execution_id = %execution_id, step_index, "Execution moved on before it could fail");
            return Ok(AdvanceOutcome::Superseded);
        }

        let cascade = format!("Not run: step {} failed", step_index);
        for task in self.store.tasks_for_execution(execution_id).await? {
            if task.status == TaskStatus::WaitingForPreviousStep {
                self.withdraw_task(&task, &cascade).await;
            }
        }

        if !applied {
            return Ok(AdvanceOutcome::Superseded);
        }

        warn!(execution_id = %execution_id, step_index, %message, "Schedule execution failed");
        self.emit_event(ExecutionEvent::ExecutionFailed {
            execution_id,
            message: message.clone(),
        })
        .await;
        Ok(AdvanceOutcome::Failed { message })
    }

    async fn has_status(&self, execution_id: Uuid, status: ExecutionStatus) -> EngineResult<bool> {
        let execution = self.store.load_execution(execution_id).await?;
        Ok(execution.is_some_and(|e| e.status == status))
    }

    /// Remove an unclaimed task and mark its activity cancelled.
    ///
    /// The row goes first so a worker claiming it concurrently keeps it. An
    /// activity left open by a failed outcome write is closed later by
    /// `close_orphaned_outcomes`. Returns false if the task had already
    /// changed state.
    pub(crate) async fn withdraw_task(&self, task: &WorkerTask, reason: &str) -> bool {
        match self.store.delete_task_if_status(task.id, task.status).await {
            Ok(true) => {}
            Ok(false) => return false,
            Err(e) => {
                error!(task_id = %task.id, error = %e, "Failed to remove task");
                return false;
            }
        }

        if let Err(e) = self
            .store
            .complete_activity(task.activity_id, &ActivityOutcome::cancelled(reason))
            .await
        {
            error!(task_id = %task.id, activity_id = %task.activity_id, error = %e, "Failed to cancel activity");
        }
        true
    }

    /// Safety net: re-evaluate every in-progress execution
    pub async fn sweep_in_progress(&self) -> EngineResult<SweepReport> {
        let executions = self.store.executions_with_status(ExecutionStatus::InProgress).await?;
        let mut report = SweepReport {
            checked: executions.len(),
            ..SweepReport::default()
        };

        for execution in executions {
            match self.advance(execution.id).await {
                Ok(AdvanceOutcome::Advanced { .. }) => report.advanced += 1,
                Ok(AdvanceOutcome::Completed) => report.completed += 1,
                Ok(AdvanceOutcome::Failed { .. }) => report.failed += 1,
                Ok(AdvanceOutcome::StillRunning(_)) => report.still_running += 1,
                Ok(AdvanceOutcome::NotInProgress(_) | AdvanceOutcome::Superseded) => {}
                Err(e) => {
                    error!(execution_id = %execution.id, error = %e, "Failed to advance execution during sweep");
                    report.errors += 1;
                }
            }
        }

        if report.advanced + report.completed + report.failed > 0 {
            info!(?report, "Advancement sweep moved executions on");
        } else {
            debug!(?report, "Advancement sweep finished");
        }
        Ok(report)
    }

    /// Move heartbeats forward for tasks this process is working
    pub async fn update_heartbeats(&self, task_ids: &[Uuid]) -> EngineResult<usize> {
        if task_ids.is_empty() {
            return Ok(0);
        }
        Ok(self.store.update_heartbeats(task_ids, Utc::now()).await?)
    }

    /// Execution with its tasks and outcome records
    pub async fn execution_detail(&self, execution_id: Uuid) -> EngineResult<ExecutionDetail> {
        let execution = self
            .store
            .load_execution(execution_id)
            .await?
            .ok_or(EngineError::ExecutionNotFound(execution_id))?;
        let tasks = self.store.tasks_for_execution(execution_id).await?;
        let activities = self.store.activities_for_execution(execution_id).await?;
        Ok(ExecutionDetail {
            execution,
            tasks,
            activities,
        })
    }
}

/// Read model for status views
#[derive(Debug, Clone)]
pub struct ExecutionDetail {
    pub execution: ScheduleExecution,
    pub tasks: Vec<WorkerTask>,
    pub activities: Vec<Activity>,
}

fn plan_task(
    execution: &ScheduleExecution,
    step: &ScheduleStep,
    kind: TaskKind,
    status: TaskStatus,
    mode: TaskExecutionMode,
    initiator: &Initiator,
) -> PlannedTask {
    let activity = Activity::new(&step.name, kind.name(), initiator.clone())
        .for_step(execution.id, step.step_index)
        .tolerating_failure(step.continue_on_failure);
    let link = ScheduleLink {
        execution_id: execution.id,
        step_index: step.step_index,
        execution_mode: mode,
        continue_on_failure: step.continue_on_failure,
    };
    let task = WorkerTask::for_schedule(kind, activity.id, status, link, step.timeout_secs);
    PlannedTask {
        step_index: step.step_index,
        activity,
        task,
    }
}
