//! Schedule definitions and engine settings from YAML

use crate::core::schedule::{Schedule, ScheduleStep, StepExecutionMode, StepType, TriggerType};
use crate::execution::next_run::validate_cron;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Top-level schedule definition loaded from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Schedule name
    pub name: String,

    /// Optional description
    #[serde(default)]
    pub description: Option<String>,

    /// How the schedule is triggered
    #[serde(default = "default_trigger")]
    pub trigger: TriggerType,

    /// Standard 5-field cron expression (cron trigger only)
    #[serde(default)]
    pub cron: Option<String>,

    /// Whether the cron trigger is active
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Default timeout for steps (in seconds)
    #[serde(default)]
    pub default_timeout_secs: Option<u64>,

    /// Schedule steps, in declaration order
    pub steps: Vec<StepConfig>,
}

/// Step configuration as defined in YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepConfig {
    /// Human-readable step name
    pub name: String,

    /// Relation to the previous step
    #[serde(default)]
    pub mode: StepExecutionMode,

    /// Step kind and its configuration
    #[serde(flatten)]
    pub step_type: StepType,

    /// Keep going when this step fails
    #[serde(default)]
    pub continue_on_failure: bool,

    /// Timeout for this step (overrides the schedule default)
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

fn default_trigger() -> TriggerType {
    TriggerType::Manual
}

fn default_enabled() -> bool {
    true
}

impl ScheduleConfig {
    /// Load schedule configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read schedule file {}", path.display()))?;
        Self::from_yaml(&content)
    }

    /// Parse schedule configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: ScheduleConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the schedule configuration
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            anyhow::bail!("Schedule name must not be empty");
        }

        let mut seen_names = HashSet::new();
        for step in &self.steps {
            if !seen_names.insert(&step.name) {
                anyhow::bail!("Duplicate step name: {}", step.name);
            }
        }

        if self.default_timeout_secs == Some(0) {
            anyhow::bail!("default_timeout_secs must be greater than zero");
        }
        if let Some(step) = self.steps.iter().find(|s| s.timeout_secs == Some(0)) {
            anyhow::bail!("Step '{}' has a zero timeout_secs", step.name);
        }

        if let Some(first) = self.steps.first() {
            if first.mode == StepExecutionMode::ParallelWithPrevious {
                anyhow::bail!(
                    "Step '{}' is parallel_with_previous but has no previous step",
                    first.name
                );
            }
        }

        if self.trigger == TriggerType::Cron {
            let expression = self
                .cron
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("Cron trigger requires a cron expression"))?;
            validate_cron(expression).map_err(|e| anyhow::anyhow!(e))?;
        }

        Ok(())
    }

    /// Build the schedule, assigning step indices from declaration order and mode
    pub fn to_schedule(&self) -> Schedule {
        let schedule_id = Uuid::new_v4();
        let mut step_index = 0usize;

        let steps = self
            .steps
            .iter()
            .enumerate()
            .map(|(position, step)| {
                if position > 0 && step.mode == StepExecutionMode::Sequential {
                    step_index += 1;
                }
                ScheduleStep {
                    id: Uuid::new_v4(),
                    schedule_id,
                    step_index,
                    name: step.name.clone(),
                    execution_mode: step.mode,
                    step_type: step.step_type.clone(),
                    continue_on_failure: step.continue_on_failure,
                    timeout_secs: step.timeout_secs.or(self.default_timeout_secs),
                }
            })
            .collect();

        Schedule {
            id: schedule_id,
            name: self.name.clone(),
            enabled: self.enabled,
            trigger_type: self.trigger,
            cron_expression: self.cron.clone(),
            steps,
            last_run_time: None,
            next_run_time: None,
        }
    }
}

/// Runtime settings for the engine and its periodic loops
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// SQLite database file
    pub database_path: Option<PathBuf>,

    /// Interval of the advancement safety-net sweep
    pub sweep_interval_secs: u64,

    /// Heartbeat age after which a claimed task counts as abandoned
    pub stale_threshold_secs: u64,

    /// Interval of the due-schedule check and next-run update
    pub schedule_check_interval_secs: u64,

    /// How often a worker heartbeats a task it is processing
    pub heartbeat_interval_secs: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            database_path: None,
            sweep_interval_secs: 30,
            stale_threshold_secs: 300,
            schedule_check_interval_secs: 60,
            heartbeat_interval_secs: 15,
        }
    }
}

impl EngineSettings {
    /// Load settings from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file {}", path.display()))?;
        let settings: EngineSettings = serde_yaml::from_str(&content)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval_secs == 0 {
            anyhow::bail!("heartbeat_interval_secs must be greater than zero");
        }
        if self.stale_threshold_secs <= self.heartbeat_interval_secs {
            anyhow::bail!(
                "stale_threshold_secs ({}) must exceed heartbeat_interval_secs ({})",
                self.stale_threshold_secs,
                self.heartbeat_interval_secs
            );
        }
        if self.sweep_interval_secs == 0 || self.schedule_check_interval_secs == 0 {
            anyhow::bail!("Sweep intervals must be greater than zero");
        }
        Ok(())
    }

    /// Database path, falling back to the user's local data directory
    pub fn database_path(&self) -> PathBuf {
        self.database_path.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("syncsched")
                .join("syncsched.db")
        })
    }

    pub fn stale_threshold(&self) -> chrono::Duration {
        crate::core::task::seconds(self.stale_threshold_secs)
    }
}
