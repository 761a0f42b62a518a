//! Step advancement decision
//!
//! `decide` is a pure function over a fresh read of persisted state. The
//! worker completion hook and the periodic sweep both call it through
//! `ScheduleEngine::advance`, so the two triggers cannot disagree. It never
//! looks past `current_step_index` while tasks at that index are still live.

use crate::core::{Activity, ExecutionStatus, ScheduleExecution, TaskStatus, WorkerTask};
use std::collections::BTreeSet;

/// Persisted state the decision is made from
#[derive(Debug, Clone)]
pub struct StepSnapshot {
    pub execution: ScheduleExecution,
    /// Every task row still linked to the execution
    pub tasks: Vec<WorkerTask>,
    /// Outcome records for the current step index
    pub step_activities: Vec<Activity>,
}

/// Why a step group is not finished yet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pending {
    /// Tasks at the current index are queued or being worked
    ActiveTasks(usize),
    /// Task rows are gone but outcome records are not terminal yet
    AwaitingOutcome(usize),
    /// Tasks past the current index are already released; the snapshot is behind
    LaterTasks(usize),
}

/// What should happen to an execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdvanceDecision {
    /// The execution is not in progress; nothing to do
    NotInProgress(ExecutionStatus),
    StillRunning(Pending),
    /// Move to step `to` and release its waiting tasks
    Promote { from: usize, to: usize },
    /// A failure in a group that does not tolerate it
    Fail { step_index: usize, message: String },
    /// Every group has finished; applies only while the index is still `step_index`
    Complete { step_index: usize },
}

/// Result of applying a decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdvanceOutcome {
    NotInProgress(ExecutionStatus),
    StillRunning(Pending),
    Advanced { step_index: usize, promoted: usize },
    Completed,
    Failed { message: String },
    /// Another caller applied the same decision first
    Superseded,
}

impl AdvanceOutcome {
    /// Whether the execution is still working through its steps
    pub fn in_progress(&self) -> bool {
        matches!(self, AdvanceOutcome::StillRunning(_) | AdvanceOutcome::Advanced { .. })
    }
}

/// Decide how an execution moves on from its current step
pub fn decide(snapshot: &StepSnapshot) -> AdvanceDecision {
    let execution = &snapshot.execution;
    if execution.status != ExecutionStatus::InProgress {
        return AdvanceDecision::NotInProgress(execution.status);
    }

    let current = execution.current_step_index;
    let at_step: Vec<&WorkerTask> = snapshot
        .tasks
        .iter()
        .filter(|t| t.step_index() == Some(current))
        .collect();

    let active = at_step
        .iter()
        .filter(|t| t.status != TaskStatus::WaitingForPreviousStep)
        .count();
    if active > 0 {
        return AdvanceDecision::StillRunning(Pending::ActiveTasks(active));
    }

    // The index moved but its tasks were never released
    if !at_step.is_empty() {
        return AdvanceDecision::Promote {
            from: current,
            to: current,
        };
    }

    let activities = &snapshot.step_activities;
    let unfinished = activities.iter().filter(|a| !a.status.is_terminal()).count();
    if unfinished > 0 {
        return AdvanceDecision::StillRunning(Pending::AwaitingOutcome(unfinished));
    }

    let failed: Vec<&Activity> = activities.iter().filter(|a| a.status.is_failure()).collect();
    if !failed.is_empty() {
        let intolerant: BTreeSet<&str> = activities
            .iter()
            .filter(|a| !a.continue_on_failure)
            .map(|a| a.target_name.as_str())
            .collect();

        if !intolerant.is_empty() {
            let failed_names: BTreeSet<&str> = failed.iter().map(|a| a.target_name.as_str()).collect();
            let message = format!(
                "Step {} failed ({}); step(s) not set to continue on failure: {}",
                current,
                failed_names.into_iter().collect::<Vec<_>>().join(", "),
                intolerant.into_iter().collect::<Vec<_>>().join(", ")
            );
            return AdvanceDecision::Fail {
                step_index: current,
                message,
            };
        }
    }

    let later: Vec<&WorkerTask> = snapshot
        .tasks
        .iter()
        .filter(|t| t.step_index().is_some_and(|index| index > current))
        .collect();

    let next_waiting = later
        .iter()
        .filter(|t| t.status == TaskStatus::WaitingForPreviousStep)
        .filter_map(|t| t.step_index())
        .min();

    match next_waiting {
        Some(to) => AdvanceDecision::Promote { from: current, to },
        None if !later.is_empty() => AdvanceDecision::StillRunning(Pending::LaterTasks(later.len())),
        None => AdvanceDecision::Complete { step_index: current },
    }
}
