//! CLI command definitions

use clap::{Args, Subcommand};

/// Manage stored schedules
#[derive(Debug, Args, Clone)]
pub struct ScheduleCommand {
    #[command(subcommand)]
    pub action: ScheduleAction,
}

#[derive(Debug, Subcommand, Clone)]
pub enum ScheduleAction {
    /// Validate a schedule definition and store it
    Add(AddScheduleCommand),

    /// List stored schedules
    List(ListSchedulesCommand),
}

#[derive(Debug, Args, Clone)]
pub struct AddScheduleCommand {
    /// Path to schedule YAML file
    #[arg(short, long)]
    pub file: String,
}

#[derive(Debug, Args, Clone)]
pub struct ListSchedulesCommand {
    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Validate a schedule definition
#[derive(Debug, Args, Clone)]
pub struct ValidateCommand {
    /// Path to schedule YAML file
    #[arg(short, long)]
    pub file: String,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Start a schedule now
#[derive(Debug, Args, Clone)]
pub struct StartCommand {
    /// Schedule ID
    pub schedule_id: String,

    /// Name recorded as the initiating user
    #[arg(long = "as")]
    pub as_user: Option<String>,
}

/// Cancel a running execution
#[derive(Debug, Args, Clone)]
pub struct CancelCommand {
    /// Execution ID
    pub execution_id: String,

    /// Reason recorded on the execution
    #[arg(long)]
    pub reason: Option<String>,

    /// Name recorded as the initiating user
    #[arg(long = "as")]
    pub as_user: Option<String>,
}

/// Cancel a single task
#[derive(Debug, Args, Clone)]
pub struct CancelTaskCommand {
    /// Task ID
    pub task_id: String,

    /// Name recorded as the initiating user
    #[arg(long = "as")]
    pub as_user: Option<String>,
}

/// Show an execution with its tasks and activities
#[derive(Debug, Args, Clone)]
pub struct StatusCommand {
    /// Execution ID
    pub execution_id: String,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Show execution history
#[derive(Debug, Args, Clone)]
pub struct HistoryCommand {
    /// Schedule ID to filter by
    #[arg(short, long)]
    pub schedule: Option<String>,

    /// Number of recent executions to show
    #[arg(short, long, default_value_t = 10)]
    pub limit: usize,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Initiator name for commands run by a person
pub fn user_name(as_user: &Option<String>) -> String {
    as_user
        .clone()
        .or_else(|| std::env::var("USER").ok())
        .unwrap_or_else(|| "unknown".to_string())
}
