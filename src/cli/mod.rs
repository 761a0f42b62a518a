//! Command-line interface

pub mod commands;
pub mod output;

use clap::{Parser, Subcommand};
use commands::{
    CancelCommand, CancelTaskCommand, HistoryCommand, ScheduleCommand, StartCommand, StatusCommand,
    ValidateCommand,
};
use std::ffi::OsString;

/// Schedule execution engine for identity synchronisation runs
#[derive(Debug, Parser, Clone)]
#[command(name = "syncsched")]
#[command(version = "0.1.0")]
#[command(about = "Runs synchronisation schedules as ordered groups of worker tasks", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to engine settings file
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Path to the SQLite database (overrides settings)
    #[arg(long, global = true)]
    pub database: Option<String>,
}

/// Available commands
#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Manage stored schedules
    Schedule(ScheduleCommand),

    /// Validate a schedule definition
    Validate(ValidateCommand),

    /// Start a schedule now
    Start(StartCommand),

    /// Cancel a running execution
    Cancel(CancelCommand),

    /// Cancel a single task
    CancelTask(CancelTaskCommand),

    /// Show an execution with its tasks and activities
    Status(StatusCommand),

    /// Show execution history
    History(HistoryCommand),

    /// Run one advancement sweep and one stale recovery pass
    Sweep,

    /// Recompute next run times for cron schedules
    NextRuns,

    /// Run the scheduler loops until interrupted
    Serve,
}

impl Cli {
    /// Parse CLI arguments from environment
    pub fn from_args() -> Self {
        Self::parse()
    }

    /// Parse CLI arguments from a slice
    pub fn try_parse_from<I, T>(itr: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        <Self as Parser>::try_parse_from(itr)
    }
}
