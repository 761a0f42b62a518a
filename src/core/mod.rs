//! Core domain models for schedule execution
//!
//! This module defines the fundamental data structures that represent
//! schedules, their executions, queued worker tasks and outcome records.

pub mod activity;
pub mod config;
pub mod error;
pub mod schedule;
pub mod state;
pub mod task;

pub use activity::*;
pub use error::*;
pub use schedule::*;
pub use state::*;
pub use task::*;
