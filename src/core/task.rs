//! Worker task domain model

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Whole seconds as a signed duration, saturating at chrono's range
pub fn seconds(secs: u64) -> Duration {
    let secs = i64::try_from(secs).unwrap_or(i64::MAX).min(i64::MAX / 1000);
    Duration::seconds(secs)
}

/// Status of a queued unit of work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    /// Runnable; workers may claim it
    Queued,
    /// Queued up front but blocked behind an earlier step group
    WaitingForPreviousStep,
    /// Claimed by a worker
    Processing,
    /// Claimed, and asked to stop at the next safe point
    CancellationRequested,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "Queued",
            TaskStatus::WaitingForPreviousStep => "WaitingForPreviousStep",
            TaskStatus::Processing => "Processing",
            TaskStatus::CancellationRequested => "CancellationRequested",
        }
    }

    /// A worker has picked the task up
    pub fn is_claimed(&self) -> bool {
        matches!(self, TaskStatus::Processing | TaskStatus::CancellationRequested)
    }
}

impl FromStr for TaskStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Queued" => Ok(TaskStatus::Queued),
            "WaitingForPreviousStep" => Ok(TaskStatus::WaitingForPreviousStep),
            "Processing" => Ok(TaskStatus::Processing),
            "CancellationRequested" => Ok(TaskStatus::CancellationRequested),
            other => anyhow::bail!("Unknown task status: {}", other),
        }
    }
}

/// Whether a scheduled task runs alone or alongside siblings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskExecutionMode {
    Sequential,
    Parallel,
}

impl TaskExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskExecutionMode::Sequential => "Sequential",
            TaskExecutionMode::Parallel => "Parallel",
        }
    }

    pub fn for_group_size(size: usize) -> Self {
        if size > 1 {
            TaskExecutionMode::Parallel
        } else {
            TaskExecutionMode::Sequential
        }
    }
}

impl FromStr for TaskExecutionMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Sequential" => Ok(TaskExecutionMode::Sequential),
            "Parallel" => Ok(TaskExecutionMode::Parallel),
            other => anyhow::bail!("Unknown task execution mode: {}", other),
        }
    }
}

/// Kind-specific payload of a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskKind {
    /// Execute a run profile against a connected system
    SynchronisationRun {
        connected_system_id: Uuid,
        run_profile_id: Uuid,
    },
    /// Remove a connected system and its data
    DeleteConnectedSystem { connected_system_id: Uuid },
    /// Remove every object held for a connected system
    ClearConnectedSystemObjects { connected_system_id: Uuid },
}

impl TaskKind {
    pub fn name(&self) -> &'static str {
        match self {
            TaskKind::SynchronisationRun { .. } => "SynchronisationRun",
            TaskKind::DeleteConnectedSystem { .. } => "DeleteConnectedSystem",
            TaskKind::ClearConnectedSystemObjects { .. } => "ClearConnectedSystemObjects",
        }
    }
}

/// Position of a task inside a schedule execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleLink {
    pub execution_id: Uuid,
    pub step_index: usize,
    pub execution_mode: TaskExecutionMode,
    pub continue_on_failure: bool,
}

/// One unit of work in the persisted queue.
///
/// Deleting the row is the only durable "finished" signal; how it finished
/// lives on the linked activity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerTask {
    pub id: Uuid,

    pub kind: TaskKind,

    pub status: TaskStatus,

    pub created_at: DateTime<Utc>,

    /// Set when a worker claims the task
    pub started_at: Option<DateTime<Utc>>,

    /// Absent until the first heartbeat
    pub last_heartbeat: Option<DateTime<Utc>>,

    /// Outcome record for this task
    pub activity_id: Uuid,

    /// Present when the task belongs to a schedule execution
    pub schedule: Option<ScheduleLink>,

    /// Per-step timeout (in seconds)
    pub timeout_secs: Option<u64>,
}

impl WorkerTask {
    /// Create a standalone task, runnable immediately
    pub fn new(kind: TaskKind, activity_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            status: TaskStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            last_heartbeat: None,
            activity_id,
            schedule: None,
            timeout_secs: None,
        }
    }

    /// Create a task that belongs to a schedule execution
    pub fn for_schedule(
        kind: TaskKind,
        activity_id: Uuid,
        status: TaskStatus,
        link: ScheduleLink,
        timeout_secs: Option<u64>,
    ) -> Self {
        Self {
            status,
            schedule: Some(link),
            timeout_secs,
            ..Self::new(kind, activity_id)
        }
    }

    pub fn execution_id(&self) -> Option<Uuid> {
        self.schedule.as_ref().map(|s| s.execution_id)
    }

    pub fn step_index(&self) -> Option<usize> {
        self.schedule.as_ref().map(|s| s.step_index)
    }

    /// Why the worker holding this task should be considered gone, if it should.
    ///
    /// Heartbeat age is always held to `heartbeat_threshold`. A step timeout
    /// is an extra limit on run time counted from the claim; it never lets a
    /// silent worker keep its task.
    pub fn staleness(&self, now: DateTime<Utc>, heartbeat_threshold: Duration) -> Option<Staleness> {
        if !self.status.is_claimed() {
            return None;
        }
        let timed_out = match (self.timeout_secs, self.started_at) {
            (Some(timeout), Some(started)) => now - started > seconds(timeout),
            _ => false,
        };

        match self.last_heartbeat {
            None => Some(Staleness::NeverHeartbeat),
            Some(heartbeat) if now - heartbeat > heartbeat_threshold => Some(Staleness::HeartbeatExpired),
            Some(_) if timed_out => Some(Staleness::TimedOut),
            Some(_) => None,
        }
    }

    pub fn is_stale(&self, now: DateTime<Utc>, heartbeat_threshold: Duration) -> bool {
        self.staleness(now, heartbeat_threshold).is_some()
    }
}

/// Reason a claimed task is taken back from its worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Staleness {
    NeverHeartbeat,
    HeartbeatExpired,
    /// Still heartbeating, but running longer than its step timeout allows
    TimedOut,
}
