//! Engine error types

use crate::core::state::ExecutionStatus;
use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the schedule engine
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Step '{step}' has invalid configuration: {reason}")]
    InvalidStepConfiguration { step: String, reason: String },

    #[error("Schedule not found: {0}")]
    ScheduleNotFound(Uuid),

    #[error("Execution not found: {0}")]
    ExecutionNotFound(Uuid),

    #[error("Execution {id} is {status:?} and cannot be changed")]
    InvalidExecutionState { id: Uuid, status: ExecutionStatus },

    #[error("Store error: {0}")]
    Store(#[from] anyhow::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;
