//! syncsched - schedule execution engine for identity synchronisation runs

pub mod cli;
pub mod core;
pub mod execution;
pub mod persistence;

// Re-export commonly used types
pub use core::{
    Activity, ActivityStatus, EngineError, EngineResult, ExecutionStatus, Initiator, Schedule, ScheduleExecution,
    TaskStatus, WorkerTask,
};
pub use execution::{AdvanceOutcome, ExecutionEvent, ScheduleEngine, SchedulerService, TaskRunner, Worker};
pub use persistence::{InMemoryStore, ScheduleStore};
