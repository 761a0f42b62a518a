//! CLI output formatting

use crate::{
    core::{Activity, ActivityStatus, ExecutionStatus, Schedule, ScheduleExecution, TaskStatus, WorkerTask},
    execution::ExecutionEvent,
};
use console::Emoji;
use uuid::Uuid;

// Re-export style
pub use console::style;

// Emojis for output
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static SPINNER: Emoji<'_, '_> = Emoji("⏳ ", "~ ");
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "i ");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "!");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "> ");

fn short_id(id: &Uuid) -> String {
    id.to_string()[..8].to_string()
}

/// Format an execution status for display
pub fn format_status(status: ExecutionStatus) -> String {
    match status {
        ExecutionStatus::Queued => style("QUEUED").dim().to_string(),
        ExecutionStatus::InProgress => style("IN PROGRESS").yellow().to_string(),
        ExecutionStatus::Completed => style("COMPLETED").green().to_string(),
        ExecutionStatus::Failed => style("FAILED").red().to_string(),
        ExecutionStatus::Cancelled => style("CANCELLED").yellow().to_string(),
        ExecutionStatus::Paused => style("PAUSED").blue().to_string(),
    }
}

pub fn format_activity_status(status: ActivityStatus) -> String {
    match status {
        ActivityStatus::InProgress => style("IN PROGRESS").yellow().to_string(),
        ActivityStatus::Complete => style("COMPLETE").green().to_string(),
        ActivityStatus::CompleteWithError => style("COMPLETE WITH ERROR").yellow().to_string(),
        ActivityStatus::FailedWithError => style("FAILED").red().to_string(),
        ActivityStatus::Cancelled => style("CANCELLED").dim().to_string(),
    }
}

pub fn format_task_status(status: TaskStatus) -> String {
    match status {
        TaskStatus::Queued => style("QUEUED").cyan().to_string(),
        TaskStatus::WaitingForPreviousStep => style("WAITING").dim().to_string(),
        TaskStatus::Processing => style("PROCESSING").yellow().to_string(),
        TaskStatus::CancellationRequested => style("CANCELLING").red().to_string(),
    }
}

/// Format an execution for one line of history
pub fn format_execution_summary(execution: &ScheduleExecution) -> String {
    let status_icon = match execution.status {
        ExecutionStatus::Completed => CHECK,
        ExecutionStatus::Failed => CROSS,
        ExecutionStatus::InProgress | ExecutionStatus::Queued => SPINNER,
        _ => INFO,
    };

    format!(
        "{} {} - {} - {} (step {}) - {}",
        status_icon,
        style(short_id(&execution.id)).dim(),
        style(&execution.schedule_name).bold(),
        format_status(execution.status),
        execution.current_step_index,
        style(execution.queued_at.to_rfc3339()).dim()
    )
}

pub fn format_schedule(schedule: &Schedule) -> String {
    let trigger = match (&schedule.cron_expression, schedule.is_cron()) {
        (Some(expr), true) => format!("cron '{}'", expr),
        _ => schedule.trigger_type.as_str().to_string(),
    };
    let next = schedule
        .next_run_time
        .map(|at| at.to_rfc3339())
        .unwrap_or_else(|| "-".to_string());

    format!(
        "{} {} - {} steps - {}{} - next run {}",
        style(schedule.id).dim(),
        style(&schedule.name).bold(),
        style(schedule.steps.len()).cyan(),
        trigger,
        if schedule.enabled { "" } else { " (disabled)" },
        style(next).dim()
    )
}

pub fn format_activity(activity: &Activity) -> String {
    let step = activity
        .step_index
        .map(|i| format!("[{}] ", i))
        .unwrap_or_default();
    let mut line = format!(
        "{}{} ({}) - {}",
        step,
        style(&activity.target_name).bold(),
        activity.target_type,
        format_activity_status(activity.status)
    );
    if let Some(ms) = activity.total_time_ms {
        line.push_str(&format!(" in {}", format_duration(std::time::Duration::from_millis(ms.max(0) as u64))));
    }
    if let Some(message) = &activity.error_message {
        line.push_str(&format!("\n      {}", style(message).dim()));
    }
    line
}

pub fn format_task(task: &WorkerTask) -> String {
    format!(
        "{} {} - {} (step {})",
        style(short_id(&task.id)).dim(),
        task.kind.name(),
        format_task_status(task.status),
        task.step_index().map(|i| i.to_string()).unwrap_or_else(|| "-".to_string())
    )
}

/// Format an engine event for display
pub fn format_execution_event(event: &ExecutionEvent) -> String {
    match event {
        ExecutionEvent::ExecutionStarted {
            execution_id,
            schedule_name,
            tasks_queued,
        } => format!(
            "{} Starting schedule {} ({}) with {} task(s)",
            ROCKET,
            style(schedule_name).bold(),
            style(short_id(execution_id)).dim(),
            tasks_queued
        ),
        ExecutionEvent::StepAdvanced {
            execution_id,
            step_index,
            promoted,
        } => format!(
            "{} {} → step {} ({} task(s) released)",
            INFO,
            style(short_id(execution_id)).dim(),
            style(step_index).cyan(),
            promoted
        ),
        ExecutionEvent::ExecutionCompleted { execution_id } => format!(
            "{} Execution {} completed {}",
            CHECK,
            style(short_id(execution_id)).dim(),
            style("successfully").green()
        ),
        ExecutionEvent::ExecutionFailed { execution_id, message } => format!(
            "{} Execution {} failed: {}",
            CROSS,
            style(short_id(execution_id)).dim(),
            style(message).red()
        ),
        ExecutionEvent::ExecutionCancelled {
            execution_id,
            tasks_removed,
        } => format!(
            "{} Execution {} cancelled ({} task(s) removed)",
            WARN,
            style(short_id(execution_id)).dim(),
            tasks_removed
        ),
        ExecutionEvent::TaskCancellationRequested { task_id } => format!(
            "{} Asked worker to stop task {}",
            WARN,
            style(short_id(task_id)).dim()
        ),
        ExecutionEvent::TaskCancelled { task_id } => {
            format!("{} Task {} cancelled", WARN, style(short_id(task_id)).dim())
        }
        ExecutionEvent::TaskRecovered { task_id, .. } => format!(
            "{} Recovered abandoned task {}",
            WARN,
            style(short_id(task_id)).dim()
        ),
    }
}

pub fn format_duration(duration: std::time::Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
