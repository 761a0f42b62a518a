//! Shared fixtures for scenario tests

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use syncsched::core::config::ScheduleConfig;
use syncsched::core::{
    Activity, ActivityOutcome, ActivityStatus, ExecutionStatus, ExecutionTransition, Initiator, Schedule,
    ScheduleExecution, TaskKind, TaskStatus, WorkerTask,
};
use syncsched::execution::{ScheduleEngine, TaskResult, TaskRunner};
use syncsched::persistence::{InMemoryStore, ScheduleStore};
use uuid::Uuid;

/// Deterministic run profile id for step number `n`
pub fn profile_id(n: u32) -> Uuid {
    Uuid::parse_str(&format!("00000000-0000-4000-8000-{:012}", n)).unwrap()
}

/// Fluent builder for schedule YAML
pub struct ScheduleBuilder {
    name: String,
    steps: Vec<String>,
}

impl ScheduleBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            steps: Vec::new(),
        }
    }

    fn push(mut self, name: &str, n: u32, mode: &str, continue_on_failure: bool) -> Self {
        self.steps.push(format!(
            "  - name: \"{name}\"\n    mode: {mode}\n    type: run_profile\n    connected_system_id: \"{cs}\"\n    run_profile_id: \"{rp}\"\n    continue_on_failure: {continue_on_failure}\n",
            cs = profile_id(1000 + n),
            rp = profile_id(n),
        ));
        self
    }

    /// A step that starts a new group
    pub fn step(self, name: &str, n: u32, continue_on_failure: bool) -> Self {
        self.push(name, n, "sequential", continue_on_failure)
    }

    /// A step that joins the previous step's group
    pub fn parallel(self, name: &str, n: u32, continue_on_failure: bool) -> Self {
        self.push(name, n, "parallel_with_previous", continue_on_failure)
    }

    pub fn yaml(&self) -> String {
        if self.steps.is_empty() {
            return format!("name: \"{}\"\nsteps: []\n", self.name);
        }
        format!("name: \"{}\"\nsteps:\n{}", self.name, self.steps.concat())
    }

    pub fn build(&self) -> Schedule {
        ScheduleConfig::from_yaml(&self.yaml()).unwrap().to_schedule()
    }
}

/// Engine over a store, with a few shortcuts for driving executions by hand
pub struct Harness {
    pub store: Arc<dyn ScheduleStore>,
    pub engine: Arc<ScheduleEngine>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_store(Arc::new(InMemoryStore::new()))
    }

    pub fn with_store(store: Arc<dyn ScheduleStore>) -> Self {
        let engine = Arc::new(ScheduleEngine::new(store.clone()));
        Self { store, engine }
    }

    pub async fn add(&self, builder: &ScheduleBuilder) -> Schedule {
        let schedule = builder.build();
        self.store.save_schedule(&schedule).await.unwrap();
        schedule
    }

    pub async fn start(&self, schedule: &Schedule) -> ScheduleExecution {
        self.engine
            .start_execution(schedule, &Initiator::user(None, "tester"))
            .await
            .unwrap()
            .expect("schedule has steps")
    }

    pub async fn execution(&self, execution_id: Uuid) -> ScheduleExecution {
        self.store.load_execution(execution_id).await.unwrap().unwrap()
    }

    pub async fn tasks(&self, execution_id: Uuid) -> Vec<WorkerTask> {
        self.store.tasks_for_execution(execution_id).await.unwrap()
    }

    pub async fn tasks_at(&self, execution_id: Uuid, step_index: usize) -> Vec<WorkerTask> {
        self.tasks(execution_id)
            .await
            .into_iter()
            .filter(|t| t.step_index() == Some(step_index))
            .collect()
    }

    pub async fn activities_at(&self, execution_id: Uuid, step_index: usize) -> Vec<Activity> {
        self.store.activities_for_step(execution_id, step_index).await.unwrap()
    }

    /// Claim every queued task, the way a pool of idle workers would
    pub async fn claim_all(&self) -> Vec<WorkerTask> {
        self.claim_all_at(Utc::now()).await
    }

    pub async fn claim_all_at(&self, now: DateTime<Utc>) -> Vec<WorkerTask> {
        let mut claimed = Vec::new();
        while let Some(task) = self.store.claim_next_task(now).await.unwrap() {
            claimed.push(task);
        }
        claimed
    }

    /// Finish a claimed task the way a worker does: outcome, delete, advance
    pub async fn finish(&self, task: &WorkerTask, status: ActivityStatus) {
        self.record_outcome(task, status).await;
        self.engine.on_task_completed(task).await.unwrap();
    }

    /// Finish a task but skip the completion hook, as if the worker died right after
    pub async fn record_outcome(&self, task: &WorkerTask, status: ActivityStatus) {
        let outcome = match status {
            ActivityStatus::Complete => ActivityOutcome::complete(),
            ActivityStatus::FailedWithError => ActivityOutcome::failed("run profile failed"),
            other => ActivityOutcome::new(other).with_error("finished with errors"),
        };
        self.store.complete_activity(task.activity_id, &outcome).await.unwrap();
        self.store.delete_task(task.id).await.unwrap();
    }

    /// Claim and finish every queued task with `status` until the execution stops moving
    pub async fn run_to_end(&self, execution_id: Uuid, status: ActivityStatus) {
        loop {
            let claimed = self.claim_all().await;
            if claimed.is_empty() {
                break;
            }
            for task in &claimed {
                self.finish(task, status).await;
            }
        }
        assert_ne!(self.execution(execution_id).await.status, ExecutionStatus::InProgress);
    }
}

pub async fn assert_execution_status(harness: &Harness, execution_id: Uuid, expected: ExecutionStatus) {
    let execution = harness.execution(execution_id).await;
    assert_eq!(
        execution.status, expected,
        "execution error: {:?}",
        execution.error_message
    );
}

pub fn assert_task_statuses(tasks: &[WorkerTask], expected: TaskStatus) {
    assert!(!tasks.is_empty(), "expected at least one task");
    for task in tasks {
        assert_eq!(task.status, expected, "task {} at step {:?}", task.id, task.step_index());
    }
}

pub fn outcome_statuses(activities: &[Activity]) -> Vec<ActivityStatus> {
    let mut statuses: Vec<ActivityStatus> = activities.iter().map(|a| a.status).collect();
    statuses.sort_by_key(|s| s.as_str());
    statuses
}

/// Runner that answers from a script keyed by run profile id
pub struct ScriptedRunner {
    results: HashMap<Uuid, TaskResult>,
    pub observed_cancel: Arc<AtomicBool>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self {
            results: HashMap::new(),
            observed_cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with(mut self, step: u32, result: TaskResult) -> Self {
        self.results.insert(profile_id(step), result);
        self
    }
}

#[async_trait]
impl TaskRunner for ScriptedRunner {
    async fn run(&self, task: &WorkerTask, cancelled: Arc<AtomicBool>) -> TaskResult {
        if cancelled.load(Ordering::SeqCst) {
            self.observed_cancel.store(true, Ordering::SeqCst);
            return TaskResult::Cancelled;
        }
        match &task.kind {
            TaskKind::SynchronisationRun { run_profile_id, .. } => self
                .results
                .get(run_profile_id)
                .cloned()
                .unwrap_or(TaskResult::Complete),
            _ => TaskResult::Complete,
        }
    }
}

/// Store whose reads or writes can be made to misbehave on demand
pub struct FlakyStore {
    inner: InMemoryStore,
    pub fail_activity_updates: AtomicBool,
    lagging_execution: Mutex<Option<ScheduleExecution>>,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self {
            inner: InMemoryStore::new(),
            fail_activity_updates: AtomicBool::new(false),
            lagging_execution: Mutex::new(None),
        }
    }

    /// Serve `execution` once in place of the stored row, as a lagging read would
    pub fn lag_next_execution_read(&self, execution: ScheduleExecution) {
        *self.lagging_execution.lock().unwrap() = Some(execution);
    }
}

#[async_trait]
impl ScheduleStore for FlakyStore {
    async fn save_schedule(&self, schedule: &Schedule) -> anyhow::Result<()> {
        self.inner.save_schedule(schedule).await
    }
    async fn load_schedule(&self, schedule_id: Uuid) -> anyhow::Result<Option<Schedule>> {
        self.inner.load_schedule(schedule_id).await
    }
    async fn list_schedules(&self) -> anyhow::Result<Vec<Schedule>> {
        self.inner.list_schedules().await
    }
    async fn delete_schedule(&self, schedule_id: Uuid) -> anyhow::Result<bool> {
        self.inner.delete_schedule(schedule_id).await
    }
    async fn set_last_run_time(&self, schedule_id: Uuid, at: DateTime<Utc>) -> anyhow::Result<()> {
        self.inner.set_last_run_time(schedule_id, at).await
    }
    async fn set_next_run_time(&self, schedule_id: Uuid, at: Option<DateTime<Utc>>) -> anyhow::Result<()> {
        self.inner.set_next_run_time(schedule_id, at).await
    }
    async fn insert_execution(&self, execution: &ScheduleExecution) -> anyhow::Result<()> {
        self.inner.insert_execution(execution).await
    }
    async fn load_execution(&self, execution_id: Uuid) -> anyhow::Result<Option<ScheduleExecution>> {
        let lagging = self.lagging_execution.lock().unwrap().take();
        match lagging {
            Some(execution) if execution.id == execution_id => Ok(Some(execution)),
            _ => self.inner.load_execution(execution_id).await,
        }
    }
    async fn list_executions(&self, schedule_id: Option<Uuid>, limit: usize) -> anyhow::Result<Vec<ScheduleExecution>> {
        self.inner.list_executions(schedule_id, limit).await
    }
    async fn executions_with_status(&self, status: ExecutionStatus) -> anyhow::Result<Vec<ScheduleExecution>> {
        self.inner.executions_with_status(status).await
    }
    async fn transition_execution(
        &self,
        execution_id: Uuid,
        from: &[ExecutionStatus],
        transition: &ExecutionTransition,
    ) -> anyhow::Result<bool> {
        self.inner.transition_execution(execution_id, from, transition).await
    }
    async fn advance_step_index(&self, execution_id: Uuid, from: usize, to: usize) -> anyhow::Result<bool> {
        self.inner.advance_step_index(execution_id, from, to).await
    }
    async fn insert_task(&self, task: &WorkerTask) -> anyhow::Result<()> {
        self.inner.insert_task(task).await
    }
    async fn load_task(&self, task_id: Uuid) -> anyhow::Result<Option<WorkerTask>> {
        self.inner.load_task(task_id).await
    }
    async fn tasks_for_execution(&self, execution_id: Uuid) -> anyhow::Result<Vec<WorkerTask>> {
        self.inner.tasks_for_execution(execution_id).await
    }
    async fn claimed_tasks(&self) -> anyhow::Result<Vec<WorkerTask>> {
        self.inner.claimed_tasks().await
    }
    async fn update_task_status(&self, task_id: Uuid, from: TaskStatus, to: TaskStatus) -> anyhow::Result<bool> {
        self.inner.update_task_status(task_id, from, to).await
    }
    async fn claim_next_task(&self, now: DateTime<Utc>) -> anyhow::Result<Option<WorkerTask>> {
        self.inner.claim_next_task(now).await
    }
    async fn promote_waiting_tasks(&self, execution_id: Uuid, step_index: usize) -> anyhow::Result<usize> {
        self.inner.promote_waiting_tasks(execution_id, step_index).await
    }
    async fn update_heartbeats(&self, task_ids: &[Uuid], now: DateTime<Utc>) -> anyhow::Result<usize> {
        self.inner.update_heartbeats(task_ids, now).await
    }
    async fn delete_task(&self, task_id: Uuid) -> anyhow::Result<bool> {
        self.inner.delete_task(task_id).await
    }
    async fn delete_task_if_status(&self, task_id: Uuid, status: TaskStatus) -> anyhow::Result<bool> {
        self.inner.delete_task_if_status(task_id, status).await
    }
    async fn insert_activity(&self, activity: &Activity) -> anyhow::Result<()> {
        self.inner.insert_activity(activity).await
    }
    async fn load_activity(&self, activity_id: Uuid) -> anyhow::Result<Option<Activity>> {
        self.inner.load_activity(activity_id).await
    }
    async fn activities_for_execution(&self, execution_id: Uuid) -> anyhow::Result<Vec<Activity>> {
        self.inner.activities_for_execution(execution_id).await
    }
    async fn activities_for_step(&self, execution_id: Uuid, step_index: usize) -> anyhow::Result<Vec<Activity>> {
        self.inner.activities_for_step(execution_id, step_index).await
    }
    async fn complete_activity(&self, activity_id: Uuid, outcome: &ActivityOutcome) -> anyhow::Result<bool> {
        if self.fail_activity_updates.load(Ordering::SeqCst) {
            anyhow::bail!("activity store unavailable");
        }
        self.inner.complete_activity(activity_id, outcome).await
    }
}
