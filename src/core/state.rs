//! Execution state models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Overall schedule execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionStatus {
    /// Execution row exists but has not started
    Queued,
    /// Steps are being worked through
    InProgress,
    /// Every step group finished
    Completed,
    /// A step group failed without tolerance, or queuing failed
    Failed,
    /// Cancelled by an operator
    Cancelled,
    /// Reserved; nothing transitions into or out of it
    Paused,
}

impl ExecutionStatus {
    /// Check if the status is terminal
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Queued => "Queued",
            ExecutionStatus::InProgress => "InProgress",
            ExecutionStatus::Completed => "Completed",
            ExecutionStatus::Failed => "Failed",
            ExecutionStatus::Cancelled => "Cancelled",
            ExecutionStatus::Paused => "Paused",
        }
    }
}

impl FromStr for ExecutionStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Queued" => Ok(ExecutionStatus::Queued),
            "InProgress" => Ok(ExecutionStatus::InProgress),
            "Completed" => Ok(ExecutionStatus::Completed),
            "Failed" => Ok(ExecutionStatus::Failed),
            "Cancelled" => Ok(ExecutionStatus::Cancelled),
            "Paused" => Ok(ExecutionStatus::Paused),
            other => anyhow::bail!("Unknown execution status: {}", other),
        }
    }
}

/// Kind of principal that initiated an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum InitiatorType {
    #[default]
    NotSet,
    User,
    System,
    ApiKey,
}

impl InitiatorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InitiatorType::NotSet => "NotSet",
            InitiatorType::User => "User",
            InitiatorType::System => "System",
            InitiatorType::ApiKey => "ApiKey",
        }
    }
}

impl FromStr for InitiatorType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NotSet" => Ok(InitiatorType::NotSet),
            "User" => Ok(InitiatorType::User),
            "System" => Ok(InitiatorType::System),
            "ApiKey" => Ok(InitiatorType::ApiKey),
            other => anyhow::bail!("Unknown initiator type: {}", other),
        }
    }
}

/// Who initiated an operation.
///
/// The name is a snapshot so audit rows stay readable after the principal is deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Initiator {
    pub kind: InitiatorType,
    pub id: Option<Uuid>,
    pub name: String,
}

impl Initiator {
    pub fn user(id: Option<Uuid>, name: impl Into<String>) -> Self {
        Self {
            kind: InitiatorType::User,
            id,
            name: name.into(),
        }
    }

    pub fn api_key(id: Uuid, name: impl Into<String>) -> Self {
        Self {
            kind: InitiatorType::ApiKey,
            id: Some(id),
            name: name.into(),
        }
    }

    pub fn system() -> Self {
        Self {
            kind: InitiatorType::System,
            id: None,
            name: "System".to_string(),
        }
    }
}

/// One run instance of a schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleExecution {
    /// Unique execution ID
    pub id: Uuid,

    /// Schedule this execution was started from
    pub schedule_id: Uuid,

    /// Schedule name at start time
    pub schedule_name: String,

    /// Current execution status
    pub status: ExecutionStatus,

    /// Step index currently being worked
    pub current_step_index: usize,

    /// Number of steps declared on the schedule
    pub total_steps: usize,

    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Who started the execution
    pub initiated_by: Initiator,

    pub error_message: Option<String>,
    pub error_stack_trace: Option<String>,
}

impl ScheduleExecution {
    /// Create a new, not yet started execution
    pub fn new(schedule_id: Uuid, schedule_name: &str, total_steps: usize, initiated_by: Initiator) -> Self {
        Self {
            id: Uuid::new_v4(),
            schedule_id,
            schedule_name: schedule_name.to_string(),
            status: ExecutionStatus::Queued,
            current_step_index: 0,
            total_steps,
            queued_at: Utc::now(),
            started_at: None,
            completed_at: None,
            initiated_by,
            error_message: None,
            error_stack_trace: None,
        }
    }

    /// Mark execution as started at the given step index
    pub fn start(&mut self, first_step_index: usize) {
        self.status = ExecutionStatus::InProgress;
        self.current_step_index = first_step_index;
        self.started_at = Some(Utc::now());
    }

    /// Elapsed wall-clock time, if the execution has finished
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}

/// Terminal update applied to an execution by a conditional transition
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionTransition {
    pub status: ExecutionStatus,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub error_stack_trace: Option<String>,
    /// Apply only while the execution is still at this step index
    pub at_step_index: Option<usize>,
}

impl ExecutionTransition {
    pub fn completed() -> Self {
        Self {
            status: ExecutionStatus::Completed,
            completed_at: Some(Utc::now()),
            error_message: None,
            error_stack_trace: None,
            at_step_index: None,
        }
    }

    pub fn failed(message: impl Into<String>, stack_trace: Option<String>) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            completed_at: Some(Utc::now()),
            error_message: Some(message.into()),
            error_stack_trace: stack_trace,
            at_step_index: None,
        }
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Cancelled,
            completed_at: Some(Utc::now()),
            error_message: Some(reason.into()),
            error_stack_trace: None,
            at_step_index: None,
        }
    }

    pub fn at_step(mut self, step_index: usize) -> Self {
        self.at_step_index = Some(step_index);
        self
    }

    /// Whether the step-index guard (if any) holds for `execution`
    pub fn guard_holds(&self, execution: &ScheduleExecution) -> bool {
        self.at_step_index
            .map_or(true, |index| execution.current_step_index == index)
    }

    /// Apply the transition to an in-memory execution
    pub fn apply(&self, execution: &mut ScheduleExecution) {
        execution.status = self.status;
        execution.completed_at = self.completed_at;
        execution.error_message = self.error_message.clone();
        execution.error_stack_trace = self.error_stack_trace.clone();
    }
}
