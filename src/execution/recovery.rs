//! Stale task recovery

use crate::{
    core::{Activity, ActivityOutcome, EngineResult, ExecutionStatus, Staleness, WorkerTask},
    execution::engine::{ExecutionEvent, ScheduleEngine},
};
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeSet, HashSet};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const ORPHANED_MESSAGE: &str = "The task was removed but its outcome was never recorded. \
     The step is closed as failed so the execution can move on.";

impl ScheduleEngine {
    /// Remove claimed tasks whose worker has stopped heartbeating or whose
    /// run has outlasted its step timeout.
    ///
    /// Heartbeat age is held to `threshold` whatever the step timeout. Outcome
    /// records left open by an earlier failed write are closed afterwards.
    /// Returns the number of tasks removed.
    pub async fn recover_stale_tasks(&self, threshold: Duration) -> EngineResult<usize> {
        let now = Utc::now();
        let stale: Vec<(WorkerTask, Staleness)> = self
            .store()
            .claimed_tasks()
            .await?
            .into_iter()
            .filter_map(|task| task.staleness(now, threshold).map(|reason| (task, reason)))
            .collect();

        if stale.is_empty() {
            debug!("No stale tasks found");
        }

        let mut recovered = 0;
        let mut executions = BTreeSet::new();

        for (task, reason) in &stale {
            if let Err(e) = self.fail_abandoned_activity(task, *reason, now).await {
                warn!(task_id = %task.id, activity_id = %task.activity_id, error = %e, "Failed to record abandoned task outcome");
            }

            match self.store().delete_task(task.id).await {
                Ok(true) => {
                    recovered += 1;
                    info!(
                        task_id = %task.id,
                        kind = task.kind.name(),
                        last_heartbeat = ?task.last_heartbeat,
                        reason = ?reason,
                        "Recovered stale task"
                    );
                    self.emit_event(ExecutionEvent::TaskRecovered {
                        task_id: task.id,
                        execution_id: task.execution_id(),
                    })
                    .await;
                }
                Ok(false) => debug!(task_id = %task.id, "Stale task already removed"),
                Err(e) => error!(task_id = %task.id, error = %e, "Failed to remove stale task"),
            }

            if let Some(execution_id) = task.execution_id() {
                executions.insert(execution_id);
            }
        }

        for execution_id in executions {
            if let Err(e) = self.advance(execution_id).await {
                error!(execution_id = %execution_id, error = %e, "Failed to advance after stale task recovery");
            }
        }

        match self.close_orphaned_outcomes(threshold).await {
            Ok(0) => {}
            Ok(closed) => warn!(closed, "Closed orphaned outcome records"),
            Err(e) => error!(error = %e, "Failed to close orphaned outcome records"),
        }

        Ok(recovered)
    }

    /// Close outcome records left open at an execution's current step after
    /// their task row is already gone.
    ///
    /// That happens when the outcome write fails after a task was withdrawn
    /// or recovered, and it would otherwise hold the step open until the
    /// execution is cancelled. Records younger than `min_age` are skipped
    /// because a task row is written just after its record. Returns the
    /// number of records closed.
    pub async fn close_orphaned_outcomes(&self, min_age: Duration) -> EngineResult<usize> {
        let now = Utc::now();
        let mut closed = 0;

        for execution in self.store().executions_with_status(ExecutionStatus::InProgress).await? {
            let held: HashSet<Uuid> = self
                .store()
                .tasks_for_execution(execution.id)
                .await?
                .iter()
                .map(|task| task.activity_id)
                .collect();
            let orphans: Vec<Activity> = self
                .store()
                .activities_for_step(execution.id, execution.current_step_index)
                .await?
                .into_iter()
                .filter(|a| !a.status.is_terminal() && !held.contains(&a.id) && now - a.created_at >= min_age)
                .collect();

            let mut settled = false;
            for activity in &orphans {
                match self
                    .store()
                    .complete_activity(activity.id, &ActivityOutcome::failed(ORPHANED_MESSAGE))
                    .await
                {
                    Ok(applied) => {
                        settled = true;
                        if applied {
                            closed += 1;
                            warn!(
                                execution_id = %execution.id,
                                activity_id = %activity.id,
                                target = %activity.target_name,
                                "Closed outcome record with no task"
                            );
                        }
                    }
                    Err(e) => warn!(activity_id = %activity.id, error = %e, "Failed to close orphaned outcome record"),
                }
            }

            if settled {
                if let Err(e) = self.advance(execution.id).await {
                    error!(execution_id = %execution.id, error = %e, "Failed to advance after closing orphaned outcomes");
                }
            }
        }

        Ok(closed)
    }

    async fn fail_abandoned_activity(
        &self,
        task: &WorkerTask,
        reason: Staleness,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let Some(activity) = self.store().load_activity(task.activity_id).await? else {
            warn!(task_id = %task.id, activity_id = %task.activity_id, "Abandoned task has no activity");
            return Ok(());
        };
        if activity.status.is_terminal() {
            return Ok(());
        }

        let outcome = ActivityOutcome::failed(abandoned_message(task, reason, now)).started_at(task.started_at);
        self.store().complete_activity(task.activity_id, &outcome).await?;
        Ok(())
    }
}

fn abandoned_message(task: &WorkerTask, reason: Staleness, now: DateTime<Utc>) -> String {
    if reason == Staleness::TimedOut {
        return format!(
            "Task exceeded its step timeout of {}s and was taken back from its worker.",
            task.timeout_secs.unwrap_or_default()
        );
    }
    let since = match task.last_heartbeat {
        Some(heartbeat) => format!("no heartbeat for {}s", (now - heartbeat).num_seconds()),
        None => "no heartbeat ever received".to_string(),
    };
    format!(
        "Task was abandoned by its worker ({}). This is consistent with a worker crash or restart \
         and is not a data-integrity concern; the task can be run again.",
        since
    )
}
