use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;
use syncsched::cli::commands::{
    user_name, CancelCommand, CancelTaskCommand, HistoryCommand, ScheduleAction, StartCommand, StatusCommand,
    ValidateCommand,
};
use syncsched::cli::output::*;
use syncsched::cli::{Cli, Command};
use syncsched::core::config::{EngineSettings, ScheduleConfig};
use syncsched::core::Initiator;
use syncsched::execution::{calculate_next_run_time, ScheduleEngine, SchedulerService, TaskCancellation};
use syncsched::persistence::ScheduleStore;
use tracing::Level;
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::from_args();

    // Initialize logging
    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set logging subscriber")?;

    // Validation needs no store
    if let Command::Validate(cmd) = &cli.command {
        return validate_schedule(cmd);
    }

    let settings = load_settings(&cli)?;
    let store = open_store(&settings).await?;
    let engine = Arc::new(ScheduleEngine::new(store));
    engine
        .add_event_handler(|event| println!("{}", format_execution_event(&event)))
        .await;

    // Execute command
    match &cli.command {
        Command::Schedule(cmd) => match &cmd.action {
            ScheduleAction::Add(add) => add_schedule(&engine, &add.file).await?,
            ScheduleAction::List(list) => list_schedules(&engine, list.json).await?,
        },
        Command::Validate(_) => {}
        Command::Start(cmd) => start_schedule(&engine, cmd).await?,
        Command::Cancel(cmd) => cancel_execution(&engine, cmd).await?,
        Command::CancelTask(cmd) => cancel_task(&engine, cmd).await?,
        Command::Status(cmd) => show_status(&engine, cmd).await?,
        Command::History(cmd) => show_history(&engine, cmd).await?,
        Command::Sweep => sweep(&engine, &settings).await?,
        Command::NextRuns => {
            let updated = engine.update_next_run_times(Utc::now()).await?;
            println!("{} Updated next run time for {} schedule(s)", INFO, style(updated).cyan());
        }
        Command::Serve => serve(engine, settings).await?,
    }

    Ok(())
}

fn load_settings(cli: &Cli) -> Result<EngineSettings> {
    let mut settings = match &cli.config {
        Some(path) => EngineSettings::from_file(path).context("Failed to load engine settings")?,
        None => EngineSettings::default(),
    };
    if let Some(database) = &cli.database {
        settings.database_path = Some(database.into());
    }
    Ok(settings)
}

#[cfg(feature = "sqlite")]
async fn open_store(settings: &EngineSettings) -> Result<Arc<dyn ScheduleStore>> {
    let path = settings.database_path();
    let store = syncsched::persistence::SqliteScheduleStore::at_path(&path)
        .await
        .with_context(|| format!("Failed to open database {}", path.display()))?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "sqlite"))]
async fn open_store(_settings: &EngineSettings) -> Result<Arc<dyn ScheduleStore>> {
    tracing::warn!("Built without the sqlite feature; state will not outlive this process");
    Ok(Arc::new(syncsched::persistence::InMemoryStore::new()))
}

fn parse_id(value: &str, what: &str) -> Result<Uuid> {
    Uuid::parse_str(value).with_context(|| format!("Invalid {} ID format: {}", what, value))
}

fn validate_schedule(cmd: &ValidateCommand) -> Result<()> {
    println!("{} Validating schedule...", INFO);

    match ScheduleConfig::from_file(&cmd.file) {
        Ok(config) => {
            let schedule = config.to_schedule();
            println!("{} Schedule definition is valid!", CHECK);
            println!("  Name: {}", style(&config.name).bold());
            println!("  Steps: {}", style(config.steps.len()).cyan());
            println!("  Step groups: {}", style(schedule.step_groups().len()).cyan());
            if let Some(next) = calculate_next_run_time(&schedule) {
                println!("  Next run: {}", style(next.to_rfc3339()).dim());
            }

            if cmd.json {
                let json = serde_json::to_string_pretty(&config)?;
                println!("\n{}", json);
            }
            Ok(())
        }
        Err(e) => {
            println!("{} Validation failed:", CROSS);
            println!("  {}", style(format!("{:#}", e)).red());
            std::process::exit(1);
        }
    }
}

async fn add_schedule(engine: &ScheduleEngine, file: &str) -> Result<()> {
    let config = ScheduleConfig::from_file(file).context("Failed to load schedule definition")?;
    let mut schedule = config.to_schedule();
    schedule.next_run_time = if schedule.enabled {
        calculate_next_run_time(&schedule)
    } else {
        None
    };
    engine.store().save_schedule(&schedule).await?;

    println!(
        "{} Stored schedule {} ({})",
        CHECK,
        style(&schedule.name).bold(),
        style(schedule.id).cyan()
    );
    Ok(())
}

async fn list_schedules(engine: &ScheduleEngine, json: bool) -> Result<()> {
    let schedules = engine.store().list_schedules().await?;

    if json {
        let data = serde_json::json!({ "schedules": schedules });
        println!("{}", serde_json::to_string_pretty(&data)?);
        return Ok(());
    }

    if schedules.is_empty() {
        println!("{} No schedules stored", INFO);
        return Ok(());
    }

    println!("{} Schedules:", INFO);
    for schedule in &schedules {
        println!("  {}", format_schedule(schedule));
    }
    Ok(())
}

async fn start_schedule(engine: &ScheduleEngine, cmd: &StartCommand) -> Result<()> {
    let schedule_id = parse_id(&cmd.schedule_id, "schedule")?;
    let initiator = Initiator::user(None, user_name(&cmd.as_user));

    match engine.start_schedule(schedule_id, &initiator).await? {
        Some(execution) => println!(
            "\n{} Execution {} is {}",
            INFO,
            style(execution.id).cyan(),
            format_status(execution.status)
        ),
        None => println!("{} Schedule has no steps; nothing was started", WARN),
    }
    Ok(())
}

async fn cancel_execution(engine: &ScheduleEngine, cmd: &CancelCommand) -> Result<()> {
    let execution_id = parse_id(&cmd.execution_id, "execution")?;
    let initiator = Initiator::user(None, user_name(&cmd.as_user));
    engine
        .cancel_execution(execution_id, cmd.reason.as_deref(), &initiator)
        .await?;
    Ok(())
}

async fn cancel_task(engine: &ScheduleEngine, cmd: &CancelTaskCommand) -> Result<()> {
    let task_id = parse_id(&cmd.task_id, "task")?;
    let initiator = Initiator::user(None, user_name(&cmd.as_user));

    match engine.request_task_cancellation(task_id, &initiator).await? {
        TaskCancellation::NotFound => println!("{} Task not found; it may already have finished", WARN),
        TaskCancellation::Requested => println!("{} Worker asked to stop the task", INFO),
        TaskCancellation::Cancelled => println!("{} Task cancelled before it started", CHECK),
    }
    Ok(())
}

async fn show_status(engine: &ScheduleEngine, cmd: &StatusCommand) -> Result<()> {
    let execution_id = parse_id(&cmd.execution_id, "execution")?;
    let detail = engine.execution_detail(execution_id).await?;

    if cmd.json {
        let data = serde_json::json!({
            "execution": detail.execution,
            "tasks": detail.tasks,
            "activities": detail.activities,
        });
        println!("{}", serde_json::to_string_pretty(&data)?);
        return Ok(());
    }

    let execution = &detail.execution;
    println!("{} Execution Details", INFO);
    println!("  ID: {}", style(execution.id).cyan());
    println!("  Schedule: {}", style(&execution.schedule_name).bold());
    println!("  Status: {}", format_status(execution.status));
    println!("  Initiated by: {} ({})", execution.initiated_by.name, execution.initiated_by.kind.as_str());
    println!("  Current step: {}", style(execution.current_step_index).cyan());
    println!("  Queued: {}", style(execution.queued_at.to_rfc3339()).dim());
    if let Some(completed) = execution.completed_at {
        println!("  Completed: {}", style(completed.to_rfc3339()).dim());
    }
    if let Some(duration) = execution.duration().and_then(|d| d.to_std().ok()) {
        println!("  Duration: {}", style(format_duration(duration)).dim());
    }
    if let Some(message) = &execution.error_message {
        println!("  Error: {}", style(message).red());
    }

    if !detail.tasks.is_empty() {
        println!("\n  {}", style("Tasks:").bold());
        for task in &detail.tasks {
            println!("    {}", format_task(task));
        }
    }
    if !detail.activities.is_empty() {
        println!("\n  {}", style("Activities:").bold());
        for activity in &detail.activities {
            println!("    {}", format_activity(activity));
        }
    }
    Ok(())
}

async fn show_history(engine: &ScheduleEngine, cmd: &HistoryCommand) -> Result<()> {
    let schedule_id = cmd
        .schedule
        .as_deref()
        .map(|id| parse_id(id, "schedule"))
        .transpose()?;
    let executions = engine.store().list_executions(schedule_id, cmd.limit).await?;

    if cmd.json {
        let data = serde_json::json!({ "executions": executions });
        println!("{}", serde_json::to_string_pretty(&data)?);
        return Ok(());
    }

    if executions.is_empty() {
        println!("{} No executions found", INFO);
        return Ok(());
    }

    println!("{} Execution history (showing latest {}):", INFO, cmd.limit);
    for execution in &executions {
        println!("  {}", format_execution_summary(execution));
    }
    Ok(())
}

async fn sweep(engine: &ScheduleEngine, settings: &EngineSettings) -> Result<()> {
    let recovered = engine.recover_stale_tasks(settings.stale_threshold()).await?;
    let report = engine.sweep_in_progress().await?;

    println!(
        "{} Checked {} execution(s): {} advanced, {} completed, {} failed, {} still running",
        INFO,
        style(report.checked).cyan(),
        report.advanced,
        style(report.completed).green(),
        style(report.failed).red(),
        report.still_running
    );
    if recovered > 0 {
        println!("{} Recovered {} stale task(s)", WARN, recovered);
    }
    if report.errors > 0 {
        println!("{} {} execution(s) could not be checked; see the log", CROSS, report.errors);
    }
    Ok(())
}

async fn serve(engine: Arc<ScheduleEngine>, settings: EngineSettings) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("\n{} Shutting down...", INFO);
            let _ = shutdown_tx.send(true);
        }
    });

    println!("{} Scheduler running; press Ctrl-C to stop", ROCKET);
    SchedulerService::new(engine, settings).run(shutdown_rx).await;
    Ok(())
}
