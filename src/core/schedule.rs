//! Schedule domain model

use crate::core::{error::EngineError, task::TaskKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use uuid::Uuid;

/// How a schedule is triggered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerType {
    /// Runs automatically from a cron expression
    Cron,
    /// Only runs when started by hand
    Manual,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Cron => "cron",
            TriggerType::Manual => "manual",
        }
    }
}

impl FromStr for TriggerType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cron" => Ok(TriggerType::Cron),
            "manual" => Ok(TriggerType::Manual),
            other => anyhow::bail!("Unknown trigger type: {}", other),
        }
    }
}

/// How a step relates to the one declared before it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepExecutionMode {
    /// Starts after the previous group finishes
    #[default]
    Sequential,
    /// Shares the previous step's index and runs alongside it
    ParallelWithPrevious,
}

impl StepExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepExecutionMode::Sequential => "sequential",
            StepExecutionMode::ParallelWithPrevious => "parallel_with_previous",
        }
    }
}

impl FromStr for StepExecutionMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sequential" => Ok(StepExecutionMode::Sequential),
            "parallel_with_previous" => Ok(StepExecutionMode::ParallelWithPrevious),
            other => anyhow::bail!("Unknown step execution mode: {}", other),
        }
    }
}

/// What a step does, with the configuration relevant to that kind only
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepType {
    /// Run a synchronisation run profile against a connected system
    RunProfile {
        #[serde(default)]
        connected_system_id: Option<Uuid>,
        #[serde(default)]
        run_profile_id: Option<Uuid>,
    },
    PowerShell {
        #[serde(default)]
        script_path: Option<String>,
        #[serde(default)]
        arguments: Option<String>,
    },
    Executable {
        #[serde(default)]
        path: Option<String>,
        #[serde(default)]
        arguments: Option<String>,
        #[serde(default)]
        working_directory: Option<String>,
    },
    SqlScript {
        #[serde(default)]
        connection_string: Option<String>,
        #[serde(default)]
        script_path: Option<String>,
    },
}

/// Result of turning a step into runnable work
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Materialization {
    /// The step becomes a worker task of this kind
    Task(TaskKind),
    /// The step kind is declared but not executable yet
    Unsupported(&'static str),
}

impl StepType {
    pub fn name(&self) -> &'static str {
        match self {
            StepType::RunProfile { .. } => "RunProfile",
            StepType::PowerShell { .. } => "PowerShell",
            StepType::Executable { .. } => "Executable",
            StepType::SqlScript { .. } => "SqlScript",
        }
    }

    /// Turn the step configuration into a task payload
    pub fn materialize(&self, step_name: &str) -> Result<Materialization, EngineError> {
        match self {
            StepType::RunProfile {
                connected_system_id,
                run_profile_id,
            } => {
                let connected_system_id = connected_system_id.ok_or_else(|| {
                    EngineError::InvalidStepConfiguration {
                        step: step_name.to_string(),
                        reason: "connected_system_id is required".to_string(),
                    }
                })?;
                let run_profile_id =
                    run_profile_id.ok_or_else(|| EngineError::InvalidStepConfiguration {
                        step: step_name.to_string(),
                        reason: "run_profile_id is required".to_string(),
                    })?;

                Ok(Materialization::Task(TaskKind::SynchronisationRun {
                    connected_system_id,
                    run_profile_id,
                }))
            }
            other => Ok(Materialization::Unsupported(other.name())),
        }
    }
}

/// A single step of a schedule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleStep {
    pub id: Uuid,

    pub schedule_id: Uuid,

    /// 0-based position; steps sharing an index form a parallel group
    pub step_index: usize,

    /// Human-readable step name
    pub name: String,

    pub execution_mode: StepExecutionMode,

    pub step_type: StepType,

    /// Whether a failure of this step lets the schedule carry on
    pub continue_on_failure: bool,

    /// Optional per-step timeout (in seconds)
    pub timeout_secs: Option<u64>,
}

/// A schedule definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: Uuid,

    pub name: String,

    pub enabled: bool,

    pub trigger_type: TriggerType,

    /// Only meaningful for `TriggerType::Cron`
    pub cron_expression: Option<String>,

    pub steps: Vec<ScheduleStep>,

    pub last_run_time: Option<DateTime<Utc>>,

    pub next_run_time: Option<DateTime<Utc>>,
}

impl Schedule {
    /// Steps partitioned by index, lowest index first
    pub fn step_groups(&self) -> BTreeMap<usize, Vec<&ScheduleStep>> {
        let mut groups: BTreeMap<usize, Vec<&ScheduleStep>> = BTreeMap::new();
        for step in &self.steps {
            groups.entry(step.step_index).or_default().push(step);
        }
        groups
    }

    /// All steps sharing the given index
    pub fn steps_at(&self, step_index: usize) -> Vec<&ScheduleStep> {
        self.steps
            .iter()
            .filter(|s| s.step_index == step_index)
            .collect()
    }

    pub fn is_cron(&self) -> bool {
        self.trigger_type == TriggerType::Cron
    }
}
