//! Schedule execution engine

pub mod advancement;
pub mod cancellation;
pub mod engine;
pub mod next_run;
pub mod recovery;
pub mod scheduler;
pub mod service;
pub mod worker;

pub use advancement::{AdvanceDecision, AdvanceOutcome, Pending, StepSnapshot};
pub use cancellation::TaskCancellation;
pub use engine::{EventHandler, ExecutionDetail, ExecutionEvent, ScheduleEngine, SweepReport};
pub use next_run::{calculate_next_run_time, next_run_after};
pub use service::SchedulerService;
pub use worker::{FinishedTask, TaskResult, TaskRunner, Worker};
