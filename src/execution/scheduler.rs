//! Cron triggering - keeps next run times current and starts due schedules

use crate::{
    core::{EngineResult, ExecutionStatus, Initiator, Schedule, ScheduleExecution},
    execution::{engine::ScheduleEngine, next_run::next_run_after},
};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use tracing::{debug, error, info};

impl ScheduleEngine {
    /// Recompute the next run time of every enabled cron schedule.
    ///
    /// Returns how many schedules changed.
    pub async fn update_next_run_times(&self, now: DateTime<Utc>) -> EngineResult<usize> {
        let mut updated = 0;
        for schedule in self.store().list_schedules().await? {
            let next = if schedule.enabled { next_run_after(&schedule, now) } else { None };
            if next == schedule.next_run_time {
                continue;
            }
            match self.store().set_next_run_time(schedule.id, next).await {
                Ok(()) => {
                    debug!(schedule = %schedule.name, next_run_time = ?next, "Updated next run time");
                    updated += 1;
                }
                Err(e) => error!(schedule = %schedule.name, error = %e, "Failed to update next run time"),
            }
        }
        Ok(updated)
    }

    /// Start every enabled cron schedule whose next run time has passed.
    ///
    /// A schedule with an execution still in progress is skipped for this
    /// occurrence rather than run twice.
    pub async fn start_due_schedules(&self, now: DateTime<Utc>) -> EngineResult<Vec<ScheduleExecution>> {
        let running: HashSet<_> = self
            .store()
            .executions_with_status(ExecutionStatus::InProgress)
            .await?
            .into_iter()
            .map(|e| e.schedule_id)
            .collect();

        let due: Vec<Schedule> = self
            .store()
            .list_schedules()
            .await?
            .into_iter()
            .filter(|s| s.enabled && s.is_cron())
            .filter(|s| s.next_run_time.is_some_and(|at| at <= now))
            .collect();

        let mut started = Vec::new();
        for schedule in due {
            if running.contains(&schedule.id) {
                info!(schedule = %schedule.name, "Previous execution still in progress; skipping this run");
            } else {
                match self.start_execution(&schedule, &Initiator::system()).await {
                    Ok(Some(execution)) => started.push(execution),
                    Ok(None) => {}
                    Err(e) => error!(schedule = %schedule.name, error = %e, "Failed to start due schedule"),
                }
            }

            let next = next_run_after(&schedule, now);
            if let Err(e) = self.store().set_next_run_time(schedule.id, next).await {
                error!(schedule = %schedule.name, error = %e, "Failed to update next run time");
            }
        }

        Ok(started)
    }
}
