//! Worker - claims queued tasks and runs them
//!
//! The engine only coordinates. Whatever actually performs a synchronisation
//! run plugs in through `TaskRunner`; the worker owns claiming, heartbeats,
//! cooperative cancellation and hand-off back to the engine.

use crate::{
    core::{ActivityOutcome, ActivityStatus, EngineResult, TaskStatus, WorkerTask},
    execution::{advancement::AdvanceOutcome, engine::ScheduleEngine},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How a runner finished a task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskResult {
    Complete,
    /// Finished, but with errors worth surfacing
    CompleteWithError(String),
    Failed {
        message: String,
        stack_trace: Option<String>,
    },
    /// Stopped after observing the cancellation flag
    Cancelled,
}

impl TaskResult {
    fn into_outcome(self, started_at: Option<DateTime<Utc>>) -> ActivityOutcome {
        let outcome = match self {
            TaskResult::Complete => ActivityOutcome::complete(),
            TaskResult::CompleteWithError(message) => {
                ActivityOutcome::new(ActivityStatus::CompleteWithError).with_error(message)
            }
            TaskResult::Failed { message, stack_trace } => {
                let outcome = ActivityOutcome::failed(message);
                match stack_trace {
                    Some(trace) => outcome.with_stack_trace(trace),
                    None => outcome,
                }
            }
            TaskResult::Cancelled => ActivityOutcome::cancelled("Cancelled while running"),
        };
        outcome.started_at(started_at)
    }
}

/// Performs the work a task describes.
///
/// Implementations should check `cancelled` at safe points and return
/// `TaskResult::Cancelled` once it is set.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, task: &WorkerTask, cancelled: Arc<AtomicBool>) -> TaskResult;
}

/// A task this worker saw through to the end
#[derive(Debug, Clone)]
pub struct FinishedTask {
    pub task_id: Uuid,
    pub status: ActivityStatus,
    /// Present for tasks that belong to a schedule execution
    pub advance: Option<AdvanceOutcome>,
}

pub struct Worker<R> {
    engine: Arc<ScheduleEngine>,
    runner: Arc<R>,
    heartbeat_interval: Duration,
}

impl<R: TaskRunner + 'static> Worker<R> {
    pub fn new(engine: Arc<ScheduleEngine>, runner: Arc<R>) -> Self {
        Self {
            engine,
            runner,
            heartbeat_interval: Duration::from_secs(15),
        }
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Claim and run one task. Returns `None` when nothing is queued.
    pub async fn run_once(&self) -> EngineResult<Option<FinishedTask>> {
        let Some(task) = self.engine.store().claim_next_task(Utc::now()).await? else {
            return Ok(None);
        };
        info!(task_id = %task.id, kind = task.kind.name(), "Claimed task");

        let cancelled = Arc::new(AtomicBool::new(false));
        let heartbeat = self.spawn_heartbeat(task.id, cancelled.clone());
        let result = self.runner.run(&task, cancelled).await;
        heartbeat.abort();

        let outcome = result.into_outcome(task.started_at);
        let status = outcome.status;
        if !self.engine.store().complete_activity(task.activity_id, &outcome).await? {
            // Already closed by execution cancellation or stale recovery
            debug!(task_id = %task.id, "Activity was already finished");
        }
        self.engine.store().delete_task(task.id).await?;
        info!(task_id = %task.id, status = status.as_str(), "Finished task");

        let advance = self.engine.on_task_completed(&task).await?;
        Ok(Some(FinishedTask {
            task_id: task.id,
            status,
            advance,
        }))
    }

    /// Run tasks until the queue is empty, returning how many were run
    pub async fn run_until_idle(&self) -> EngineResult<usize> {
        let mut count = 0;
        while self.run_once().await?.is_some() {
            count += 1;
        }
        Ok(count)
    }

    fn spawn_heartbeat(&self, task_id: Uuid, cancelled: Arc<AtomicBool>) -> JoinHandle<()> {
        let engine = self.engine.clone();
        let period = self.heartbeat_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The claim stamped the first heartbeat
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = engine.update_heartbeats(&[task_id]).await {
                    warn!(task_id = %task_id, error = %e, "Failed to record heartbeat");
                }
                match engine.store().load_task(task_id).await {
                    Ok(Some(task)) if task.status == TaskStatus::CancellationRequested => {
                        cancelled.store(true, Ordering::SeqCst);
                    }
                    // Removed from under us, so nobody is waiting for the result
                    Ok(None) => cancelled.store(true, Ordering::SeqCst),
                    Ok(Some(_)) => {}
                    Err(e) => warn!(task_id = %task_id, error = %e, "Failed to check task status"),
                }
            }
        })
    }
}
