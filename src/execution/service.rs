//! Scheduler service - the periodic loops that keep executions moving

use crate::{core::config::EngineSettings, execution::engine::ScheduleEngine};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

/// Runs the due-schedule check, the advancement sweep and stale recovery on
/// their own intervals until told to stop.
pub struct SchedulerService {
    engine: Arc<ScheduleEngine>,
    settings: EngineSettings,
}

impl SchedulerService {
    pub fn new(engine: Arc<ScheduleEngine>, settings: EngineSettings) -> Self {
        Self { engine, settings }
    }

    /// Run until `shutdown` flips to true or its sender is dropped
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut schedule_tick = interval(Duration::from_secs(self.settings.schedule_check_interval_secs));
        let mut sweep_tick = interval(Duration::from_secs(self.settings.sweep_interval_secs));
        let mut recovery_tick = interval(Duration::from_secs(self.settings.heartbeat_interval_secs));
        for ticker in [&mut schedule_tick, &mut sweep_tick, &mut recovery_tick] {
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        info!(
            sweep_interval_secs = self.settings.sweep_interval_secs,
            stale_threshold_secs = self.settings.stale_threshold_secs,
            schedule_check_interval_secs = self.settings.schedule_check_interval_secs,
            "Scheduler service started"
        );

        loop {
            tokio::select! {
                _ = schedule_tick.tick() => self.check_schedules().await,
                _ = sweep_tick.tick() => self.sweep().await,
                _ = recovery_tick.tick() => self.recover().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Scheduler service stopped");
    }

    /// One pass of every loop
    pub async fn run_once(&self) {
        self.check_schedules().await;
        self.recover().await;
        self.sweep().await;
    }

    async fn check_schedules(&self) {
        let now = Utc::now();
        match self.engine.start_due_schedules(now).await {
            Ok(started) if !started.is_empty() => info!(started = started.len(), "Started due schedules"),
            Ok(_) => {}
            Err(e) => error!(error = %e, "Due-schedule check failed"),
        }
        if let Err(e) = self.engine.update_next_run_times(now).await {
            error!(error = %e, "Next run time update failed");
        }
    }

    async fn sweep(&self) {
        if let Err(e) = self.engine.sweep_in_progress().await {
            error!(error = %e, "Advancement sweep failed");
        }
    }

    async fn recover(&self) {
        match self.engine.recover_stale_tasks(self.settings.stale_threshold()).await {
            Ok(0) => {}
            Ok(recovered) => warn!(recovered, "Recovered stale tasks"),
            Err(e) => error!(error = %e, "Stale task recovery failed"),
        }
    }
}
