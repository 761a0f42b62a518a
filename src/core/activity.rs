//! Activity (outcome record) model
//!
//! One activity exists per worker task. It is created with a non-terminal
//! status when the task is queued and becomes immutable once a terminal
//! status is written. After the task row is deleted it is the only record
//! of how the task ended.

use crate::core::state::Initiator;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActivityStatus {
    /// Queued or running
    InProgress,
    Complete,
    CompleteWithError,
    FailedWithError,
    Cancelled,
}

impl ActivityStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ActivityStatus::InProgress)
    }

    /// Terminal and not a clean success
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            ActivityStatus::CompleteWithError
                | ActivityStatus::FailedWithError
                | ActivityStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityStatus::InProgress => "InProgress",
            ActivityStatus::Complete => "Complete",
            ActivityStatus::CompleteWithError => "CompleteWithError",
            ActivityStatus::FailedWithError => "FailedWithError",
            ActivityStatus::Cancelled => "Cancelled",
        }
    }
}

impl FromStr for ActivityStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "InProgress" => Ok(ActivityStatus::InProgress),
            "Complete" => Ok(ActivityStatus::Complete),
            "CompleteWithError" => Ok(ActivityStatus::CompleteWithError),
            "FailedWithError" => Ok(ActivityStatus::FailedWithError),
            "Cancelled" => Ok(ActivityStatus::Cancelled),
            other => anyhow::bail!("Unknown activity status: {}", other),
        }
    }
}

/// Outcome record of one worker task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activity {
    pub id: Uuid,

    /// Step name or task description
    pub target_name: String,

    /// Task kind name
    pub target_type: String,

    pub status: ActivityStatus,

    pub execution_id: Option<Uuid>,

    pub step_index: Option<usize>,

    /// The step's continue-on-failure setting, copied when the execution started
    #[serde(default)]
    pub continue_on_failure: bool,

    pub initiated_by: Initiator,

    pub created_at: DateTime<Utc>,

    pub completed_at: Option<DateTime<Utc>>,

    /// Time between creation and completion (in milliseconds)
    pub total_time_ms: Option<i64>,

    pub error_message: Option<String>,

    pub error_stack_trace: Option<String>,
}

impl Activity {
    pub fn new(target_name: &str, target_type: &str, initiated_by: Initiator) -> Self {
        Self {
            id: Uuid::new_v4(),
            target_name: target_name.to_string(),
            target_type: target_type.to_string(),
            status: ActivityStatus::InProgress,
            execution_id: None,
            step_index: None,
            continue_on_failure: false,
            initiated_by,
            created_at: Utc::now(),
            completed_at: None,
            total_time_ms: None,
            error_message: None,
            error_stack_trace: None,
        }
    }

    /// Attach the activity to a step of a schedule execution
    pub fn for_step(mut self, execution_id: Uuid, step_index: usize) -> Self {
        self.execution_id = Some(execution_id);
        self.step_index = Some(step_index);
        self
    }

    pub fn tolerating_failure(mut self, continue_on_failure: bool) -> Self {
        self.continue_on_failure = continue_on_failure;
        self
    }
}

/// Terminal outcome written onto an activity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityOutcome {
    pub status: ActivityStatus,
    pub completed_at: DateTime<Utc>,
    /// Measured from this instant when set, otherwise from activity creation
    pub started_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub error_stack_trace: Option<String>,
}

impl ActivityOutcome {
    pub fn new(status: ActivityStatus) -> Self {
        Self {
            status,
            completed_at: Utc::now(),
            started_at: None,
            error_message: None,
            error_stack_trace: None,
        }
    }

    pub fn complete() -> Self {
        Self::new(ActivityStatus::Complete)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ActivityStatus::Cancelled).with_error(message)
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(ActivityStatus::FailedWithError).with_error(message)
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn with_stack_trace(mut self, stack_trace: impl Into<String>) -> Self {
        self.error_stack_trace = Some(stack_trace.into());
        self
    }

    pub fn started_at(mut self, started_at: Option<DateTime<Utc>>) -> Self {
        self.started_at = started_at;
        self
    }

    /// Write the outcome onto an activity
    pub fn apply(&self, activity: &mut Activity) {
        let started = self.started_at.unwrap_or(activity.created_at);
        activity.status = self.status;
        activity.completed_at = Some(self.completed_at);
        activity.total_time_ms = Some((self.completed_at - started).num_milliseconds().max(0));
        activity.error_message = self.error_message.clone();
        activity.error_stack_trace = self.error_stack_trace.clone();
    }
}
