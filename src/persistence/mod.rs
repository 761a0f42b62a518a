//! Persistence layer: the single coordination point between the engine and workers
//!
//! Every status change goes through a conditional update that reports whether
//! it applied. Callers treat a `false` as "someone else got there first".

#[cfg(feature = "sqlite")]
pub mod store;

#[cfg(feature = "sqlite")]
pub use store::SqliteScheduleStore;

use crate::core::{
    Activity, ActivityOutcome, ExecutionStatus, ExecutionTransition, Schedule, ScheduleExecution,
    TaskStatus, WorkerTask,
};
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Trait for persistence backends
#[async_trait::async_trait]
pub trait ScheduleStore: Send + Sync {
    /// Insert or replace a schedule and its steps
    async fn save_schedule(&self, schedule: &Schedule) -> Result<()>;

    async fn load_schedule(&self, schedule_id: Uuid) -> Result<Option<Schedule>>;

    async fn list_schedules(&self) -> Result<Vec<Schedule>>;

    async fn delete_schedule(&self, schedule_id: Uuid) -> Result<bool>;

    async fn set_last_run_time(&self, schedule_id: Uuid, at: DateTime<Utc>) -> Result<()>;

    async fn set_next_run_time(&self, schedule_id: Uuid, at: Option<DateTime<Utc>>) -> Result<()>;

    async fn insert_execution(&self, execution: &ScheduleExecution) -> Result<()>;

    async fn load_execution(&self, execution_id: Uuid) -> Result<Option<ScheduleExecution>>;

    /// Executions newest first, optionally for one schedule
    async fn list_executions(&self, schedule_id: Option<Uuid>, limit: usize) -> Result<Vec<ScheduleExecution>>;

    async fn executions_with_status(&self, status: ExecutionStatus) -> Result<Vec<ScheduleExecution>>;

    /// Apply `transition` only while the execution is in one of `from` and,
    /// when the transition carries one, still at its step index
    async fn transition_execution(
        &self,
        execution_id: Uuid,
        from: &[ExecutionStatus],
        transition: &ExecutionTransition,
    ) -> Result<bool>;

    /// Move `current_step_index` from `from` to `to` while the execution is in progress
    async fn advance_step_index(&self, execution_id: Uuid, from: usize, to: usize) -> Result<bool>;

    async fn insert_task(&self, task: &WorkerTask) -> Result<()>;

    async fn load_task(&self, task_id: Uuid) -> Result<Option<WorkerTask>>;

    async fn tasks_for_execution(&self, execution_id: Uuid) -> Result<Vec<WorkerTask>>;

    /// Tasks a worker has claimed (`Processing` or `CancellationRequested`)
    async fn claimed_tasks(&self) -> Result<Vec<WorkerTask>>;

    async fn update_task_status(&self, task_id: Uuid, from: TaskStatus, to: TaskStatus) -> Result<bool>;

    /// Claim the oldest queued task: `Queued -> Processing` with a first heartbeat
    async fn claim_next_task(&self, now: DateTime<Utc>) -> Result<Option<WorkerTask>>;

    /// `WaitingForPreviousStep -> Queued` for every task at the step; returns how many moved
    async fn promote_waiting_tasks(&self, execution_id: Uuid, step_index: usize) -> Result<usize>;

    /// Refresh heartbeats of claimed tasks; returns how many were touched
    async fn update_heartbeats(&self, task_ids: &[Uuid], now: DateTime<Utc>) -> Result<usize>;

    async fn delete_task(&self, task_id: Uuid) -> Result<bool>;

    /// Delete only while the task is still in `status`
    async fn delete_task_if_status(&self, task_id: Uuid, status: TaskStatus) -> Result<bool>;

    async fn insert_activity(&self, activity: &Activity) -> Result<()>;

    async fn load_activity(&self, activity_id: Uuid) -> Result<Option<Activity>>;

    async fn activities_for_execution(&self, execution_id: Uuid) -> Result<Vec<Activity>>;

    async fn activities_for_step(&self, execution_id: Uuid, step_index: usize) -> Result<Vec<Activity>>;

    /// Write a terminal outcome; a no-op returning `false` once already terminal
    async fn complete_activity(&self, activity_id: Uuid, outcome: &ActivityOutcome) -> Result<bool>;
}

#[derive(Default)]
struct MemoryState {
    schedules: HashMap<Uuid, Schedule>,
    executions: HashMap<Uuid, ScheduleExecution>,
    tasks: HashMap<Uuid, WorkerTask>,
    activities: HashMap<Uuid, Activity>,
}

/// In-memory persistence (for testing or ephemeral use).
///
/// All state sits behind one lock, so every trait call is atomic.
pub struct InMemoryStore {
    state: RwLock<MemoryState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
        }
    }

    /// Number of queued task rows, whatever their status
    pub async fn task_count(&self) -> usize {
        self.state.read().await.tasks.len()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn sorted_by_creation(mut tasks: Vec<WorkerTask>) -> Vec<WorkerTask> {
    tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    tasks
}

#[async_trait::async_trait]
impl ScheduleStore for InMemoryStore {
    async fn save_schedule(&self, schedule: &Schedule) -> Result<()> {
        let mut state = self.state.write().await;
        state.schedules.insert(schedule.id, schedule.clone());
        Ok(())
    }

    async fn load_schedule(&self, schedule_id: Uuid) -> Result<Option<Schedule>> {
        Ok(self.state.read().await.schedules.get(&schedule_id).cloned())
    }

    async fn list_schedules(&self) -> Result<Vec<Schedule>> {
        let state = self.state.read().await;
        let mut schedules: Vec<Schedule> = state.schedules.values().cloned().collect();
        schedules.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(schedules)
    }

    async fn delete_schedule(&self, schedule_id: Uuid) -> Result<bool> {
        Ok(self.state.write().await.schedules.remove(&schedule_id).is_some())
    }

    async fn set_last_run_time(&self, schedule_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        if let Some(schedule) = self.state.write().await.schedules.get_mut(&schedule_id) {
            schedule.last_run_time = Some(at);
        }
        Ok(())
    }

    async fn set_next_run_time(&self, schedule_id: Uuid, at: Option<DateTime<Utc>>) -> Result<()> {
        if let Some(schedule) = self.state.write().await.schedules.get_mut(&schedule_id) {
            schedule.next_run_time = at;
        }
        Ok(())
    }

    async fn insert_execution(&self, execution: &ScheduleExecution) -> Result<()> {
        let mut state = self.state.write().await;
        if state.executions.contains_key(&execution.id) {
            anyhow::bail!("Execution {} already exists", execution.id);
        }
        state.executions.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn load_execution(&self, execution_id: Uuid) -> Result<Option<ScheduleExecution>> {
        Ok(self.state.read().await.executions.get(&execution_id).cloned())
    }

    async fn list_executions(&self, schedule_id: Option<Uuid>, limit: usize) -> Result<Vec<ScheduleExecution>> {
        let state = self.state.read().await;
        let mut executions: Vec<ScheduleExecution> = state
            .executions
            .values()
            .filter(|e| schedule_id.map_or(true, |id| e.schedule_id == id))
            .cloned()
            .collect();
        executions.sort_by(|a, b| b.queued_at.cmp(&a.queued_at));
        executions.truncate(limit);
        Ok(executions)
    }

    async fn executions_with_status(&self, status: ExecutionStatus) -> Result<Vec<ScheduleExecution>> {
        let state = self.state.read().await;
        let mut executions: Vec<ScheduleExecution> = state
            .executions
            .values()
            .filter(|e| e.status == status)
            .cloned()
            .collect();
        executions.sort_by(|a, b| a.queued_at.cmp(&b.queued_at));
        Ok(executions)
    }

    async fn transition_execution(
        &self,
        execution_id: Uuid,
        from: &[ExecutionStatus],
        transition: &ExecutionTransition,
    ) -> Result<bool> {
        let mut state = self.state.write().await;
        match state.executions.get_mut(&execution_id) {
            Some(execution) if from.contains(&execution.status) && transition.guard_holds(execution) => {
                transition.apply(execution);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn advance_step_index(&self, execution_id: Uuid, from: usize, to: usize) -> Result<bool> {
        let mut state = self.state.write().await;
        match state.executions.get_mut(&execution_id) {
            Some(execution)
                if execution.status == ExecutionStatus::InProgress
                    && execution.current_step_index == from
                    && to >= from =>
            {
                execution.current_step_index = to;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn insert_task(&self, task: &WorkerTask) -> Result<()> {
        let mut state = self.state.write().await;
        if state.tasks.contains_key(&task.id) {
            anyhow::bail!("Task {} already exists", task.id);
        }
        state.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn load_task(&self, task_id: Uuid) -> Result<Option<WorkerTask>> {
        Ok(self.state.read().await.tasks.get(&task_id).cloned())
    }

    async fn tasks_for_execution(&self, execution_id: Uuid) -> Result<Vec<WorkerTask>> {
        let state = self.state.read().await;
        let tasks = state
            .tasks
            .values()
            .filter(|t| t.execution_id() == Some(execution_id))
            .cloned()
            .collect();
        Ok(sorted_by_creation(tasks))
    }

    async fn claimed_tasks(&self) -> Result<Vec<WorkerTask>> {
        let state = self.state.read().await;
        let tasks = state
            .tasks
            .values()
            .filter(|t| t.status.is_claimed())
            .cloned()
            .collect();
        Ok(sorted_by_creation(tasks))
    }

    async fn update_task_status(&self, task_id: Uuid, from: TaskStatus, to: TaskStatus) -> Result<bool> {
        let mut state = self.state.write().await;
        match state.tasks.get_mut(&task_id) {
            Some(task) if task.status == from => {
                task.status = to;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn claim_next_task(&self, now: DateTime<Utc>) -> Result<Option<WorkerTask>> {
        let mut state = self.state.write().await;
        let next_id = state
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Queued)
            .min_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)))
            .map(|t| t.id);

        let Some(task_id) = next_id else {
            return Ok(None);
        };

        Ok(state.tasks.get_mut(&task_id).map(|task| {
            task.status = TaskStatus::Processing;
            task.started_at = Some(now);
            task.last_heartbeat = Some(now);
            task.clone()
        }))
    }

    async fn promote_waiting_tasks(&self, execution_id: Uuid, step_index: usize) -> Result<usize> {
        let mut state = self.state.write().await;
        let mut promoted = 0;
        for task in state.tasks.values_mut() {
            if task.execution_id() == Some(execution_id)
                && task.step_index() == Some(step_index)
                && task.status == TaskStatus::WaitingForPreviousStep
            {
                task.status = TaskStatus::Queued;
                promoted += 1;
            }
        }
        Ok(promoted)
    }

    async fn update_heartbeats(&self, task_ids: &[Uuid], now: DateTime<Utc>) -> Result<usize> {
        let mut state = self.state.write().await;
        let mut touched = 0;
        for task_id in task_ids {
            if let Some(task) = state.tasks.get_mut(task_id) {
                if task.status.is_claimed() {
                    task.last_heartbeat = Some(now);
                    touched += 1;
                }
            }
        }
        Ok(touched)
    }

    async fn delete_task(&self, task_id: Uuid) -> Result<bool> {
        Ok(self.state.write().await.tasks.remove(&task_id).is_some())
    }

    async fn delete_task_if_status(&self, task_id: Uuid, status: TaskStatus) -> Result<bool> {
        let mut state = self.state.write().await;
        match state.tasks.get(&task_id) {
            Some(task) if task.status == status => {
                state.tasks.remove(&task_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn insert_activity(&self, activity: &Activity) -> Result<()> {
        let mut state = self.state.write().await;
        if state.activities.contains_key(&activity.id) {
            anyhow::bail!("Activity {} already exists", activity.id);
        }
        state.activities.insert(activity.id, activity.clone());
        Ok(())
    }

    async fn load_activity(&self, activity_id: Uuid) -> Result<Option<Activity>> {
        Ok(self.state.read().await.activities.get(&activity_id).cloned())
    }

    async fn activities_for_execution(&self, execution_id: Uuid) -> Result<Vec<Activity>> {
        let state = self.state.read().await;
        let mut activities: Vec<Activity> = state
            .activities
            .values()
            .filter(|a| a.execution_id == Some(execution_id))
            .cloned()
            .collect();
        activities.sort_by(|a, b| a.step_index.cmp(&b.step_index).then(a.created_at.cmp(&b.created_at)));
        Ok(activities)
    }

    async fn activities_for_step(&self, execution_id: Uuid, step_index: usize) -> Result<Vec<Activity>> {
        let state = self.state.read().await;
        Ok(state
            .activities
            .values()
            .filter(|a| a.execution_id == Some(execution_id) && a.step_index == Some(step_index))
            .cloned()
            .collect())
    }

    async fn complete_activity(&self, activity_id: Uuid, outcome: &ActivityOutcome) -> Result<bool> {
        let mut state = self.state.write().await;
        match state.activities.get_mut(&activity_id) {
            Some(activity) if !activity.status.is_terminal() => {
                outcome.apply(activity);
                Ok(true)
            }
            Some(_) => Ok(false),
            None => anyhow::bail!("Activity {} not found", activity_id),
        }
    }
}
