//! SQLite-based persistence store
//!
//! Conditional transitions are single `UPDATE ... WHERE status = ?` statements
//! and are judged by `rows_affected()`; SQLite serialises writers, so two
//! callers can never both see their update applied.

use crate::core::{
    Activity, ActivityOutcome, ExecutionStatus, ExecutionTransition, Initiator, Schedule,
    ScheduleExecution, ScheduleLink, ScheduleStep, TaskStatus, WorkerTask,
};
use crate::persistence::ScheduleStore;
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use uuid::Uuid;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS schedules (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1,
    trigger_type TEXT NOT NULL,
    cron_expression TEXT,
    last_run_time TEXT,
    next_run_time TEXT
);

CREATE TABLE IF NOT EXISTS schedule_steps (
    id TEXT PRIMARY KEY,
    schedule_id TEXT NOT NULL,
    position INTEGER NOT NULL,
    step_index INTEGER NOT NULL,
    name TEXT NOT NULL,
    execution_mode TEXT NOT NULL,
    step_type TEXT NOT NULL,
    continue_on_failure INTEGER NOT NULL DEFAULT 0,
    timeout_secs INTEGER
);

CREATE TABLE IF NOT EXISTS schedule_executions (
    id TEXT PRIMARY KEY,
    schedule_id TEXT NOT NULL,
    schedule_name TEXT NOT NULL,
    status TEXT NOT NULL,
    current_step_index INTEGER NOT NULL DEFAULT 0,
    total_steps INTEGER NOT NULL DEFAULT 0,
    queued_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT,
    initiated_by_type TEXT NOT NULL,
    initiated_by_id TEXT,
    initiated_by_name TEXT NOT NULL,
    error_message TEXT,
    error_stack_trace TEXT
);

CREATE TABLE IF NOT EXISTS worker_tasks (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    started_at TEXT,
    last_heartbeat TEXT,
    activity_id TEXT NOT NULL,
    execution_id TEXT,
    step_index INTEGER,
    execution_mode TEXT,
    continue_on_failure INTEGER,
    timeout_secs INTEGER
);

CREATE TABLE IF NOT EXISTS activities (
    id TEXT PRIMARY KEY,
    target_name TEXT NOT NULL,
    target_type TEXT NOT NULL,
    status TEXT NOT NULL,
    execution_id TEXT,
    step_index INTEGER,
    continue_on_failure INTEGER NOT NULL DEFAULT 0,
    initiated_by_type TEXT NOT NULL,
    initiated_by_id TEXT,
    initiated_by_name TEXT NOT NULL,
    created_at TEXT NOT NULL,
    completed_at TEXT,
    total_time_ms INTEGER,
    error_message TEXT,
    error_stack_trace TEXT
);

CREATE INDEX IF NOT EXISTS idx_steps_schedule ON schedule_steps(schedule_id);
CREATE INDEX IF NOT EXISTS idx_executions_status ON schedule_executions(status);
CREATE INDEX IF NOT EXISTS idx_executions_schedule ON schedule_executions(schedule_id);
CREATE INDEX IF NOT EXISTS idx_tasks_status ON worker_tasks(status);
CREATE INDEX IF NOT EXISTS idx_tasks_execution ON worker_tasks(execution_id, step_index);
CREATE INDEX IF NOT EXISTS idx_activities_execution ON activities(execution_id, step_index);
"#;

const EXECUTION_COLUMNS: &str = "id, schedule_id, schedule_name, status, current_step_index, total_steps, \
     queued_at, started_at, completed_at, initiated_by_type, initiated_by_id, initiated_by_name, \
     error_message, error_stack_trace";

const TASK_COLUMNS: &str = "id, kind, status, created_at, started_at, last_heartbeat, activity_id, \
     execution_id, step_index, execution_mode, continue_on_failure, timeout_secs";

const ACTIVITY_COLUMNS: &str = "id, target_name, target_type, status, execution_id, step_index, \
     continue_on_failure, initiated_by_type, initiated_by_id, initiated_by_name, created_at, completed_at, \
     total_time_ms, error_message, error_stack_trace";

/// SQLite schedule store
pub struct SqliteScheduleStore {
    pool: SqlitePool,
}

impl SqliteScheduleStore {
    /// Create a new SQLite store (`:memory:` for a private in-memory database)
    pub async fn new(db_path: &str) -> Result<Self> {
        let in_memory = db_path == ":memory:";
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path))
            .context("Invalid database path")?
            .create_if_missing(true);

        // An in-memory database lives and dies with its single connection
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;

        let store = Self { pool };
        store.init().await?;

        Ok(store)
    }

    /// Create the store at a file path, creating parent directories
    pub async fn at_path(path: &std::path::Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let path = path
            .to_str()
            .ok_or_else(|| anyhow::anyhow!("Database path is not valid UTF-8"))?;
        Self::new(path).await
    }

    /// Initialize database schema
    async fn init(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .context("Failed to initialise schema")?;
        Ok(())
    }

    /// Convert DateTime<Utc> to NaiveDateTime for SQLite
    fn to_naive(dt: DateTime<Utc>) -> NaiveDateTime {
        dt.naive_utc()
    }

    /// Convert NaiveDateTime to DateTime<Utc>
    fn from_naive(dt: NaiveDateTime) -> DateTime<Utc> {
        DateTime::from_naive_utc_and_offset(dt, Utc)
    }

    async fn load_steps(&self, schedule_id: Uuid) -> Result<Vec<ScheduleStep>> {
        let rows = sqlx::query(
            r#"
            SELECT id, schedule_id, step_index, name, execution_mode, step_type, continue_on_failure, timeout_secs
            FROM schedule_steps
            WHERE schedule_id = ?1
            ORDER BY position ASC
            "#,
        )
        .bind(schedule_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context("Failed to load schedule steps")?;

        rows.iter()
            .map(|row| {
                Ok(ScheduleStep {
                    id: parse_uuid(row, "id")?,
                    schedule_id: parse_uuid(row, "schedule_id")?,
                    step_index: to_usize(row.try_get("step_index")?)?,
                    name: row.try_get("name")?,
                    execution_mode: row.try_get::<String, _>("execution_mode")?.parse()?,
                    step_type: serde_json::from_str(&row.try_get::<String, _>("step_type")?)?,
                    continue_on_failure: row.try_get("continue_on_failure")?,
                    timeout_secs: row
                        .try_get::<Option<i64>, _>("timeout_secs")?
                        .map(|v| u64::try_from(v))
                        .transpose()?,
                })
            })
            .collect()
    }

    async fn schedule_from_row(&self, row: &SqliteRow) -> Result<Schedule> {
        let id = parse_uuid(row, "id")?;
        Ok(Schedule {
            id,
            name: row.try_get("name")?,
            enabled: row.try_get("enabled")?,
            trigger_type: row.try_get::<String, _>("trigger_type")?.parse()?,
            cron_expression: row.try_get("cron_expression")?,
            steps: self.load_steps(id).await?,
            last_run_time: row
                .try_get::<Option<NaiveDateTime>, _>("last_run_time")?
                .map(Self::from_naive),
            next_run_time: row
                .try_get::<Option<NaiveDateTime>, _>("next_run_time")?
                .map(Self::from_naive),
        })
    }

    fn execution_from_row(row: &SqliteRow) -> Result<ScheduleExecution> {
        Ok(ScheduleExecution {
            id: parse_uuid(row, "id")?,
            schedule_id: parse_uuid(row, "schedule_id")?,
            schedule_name: row.try_get("schedule_name")?,
            status: row.try_get::<String, _>("status")?.parse()?,
            current_step_index: to_usize(row.try_get("current_step_index")?)?,
            total_steps: to_usize(row.try_get("total_steps")?)?,
            queued_at: Self::from_naive(row.try_get("queued_at")?),
            started_at: row
                .try_get::<Option<NaiveDateTime>, _>("started_at")?
                .map(Self::from_naive),
            completed_at: row
                .try_get::<Option<NaiveDateTime>, _>("completed_at")?
                .map(Self::from_naive),
            initiated_by: initiator_from_row(row)?,
            error_message: row.try_get("error_message")?,
            error_stack_trace: row.try_get("error_stack_trace")?,
        })
    }

    fn task_from_row(row: &SqliteRow) -> Result<WorkerTask> {
        let schedule = match row.try_get::<Option<String>, _>("execution_id")? {
            Some(execution_id) => Some(ScheduleLink {
                execution_id: Uuid::parse_str(&execution_id)?,
                step_index: to_usize(row.try_get::<Option<i64>, _>("step_index")?.unwrap_or(0))?,
                execution_mode: row
                    .try_get::<Option<String>, _>("execution_mode")?
                    .as_deref()
                    .unwrap_or("Sequential")
                    .parse()?,
                continue_on_failure: row
                    .try_get::<Option<bool>, _>("continue_on_failure")?
                    .unwrap_or(false),
            }),
            None => None,
        };

        Ok(WorkerTask {
            id: parse_uuid(row, "id")?,
            kind: serde_json::from_str(&row.try_get::<String, _>("kind")?)?,
            status: row.try_get::<String, _>("status")?.parse()?,
            created_at: Self::from_naive(row.try_get("created_at")?),
            started_at: row
                .try_get::<Option<NaiveDateTime>, _>("started_at")?
                .map(Self::from_naive),
            last_heartbeat: row
                .try_get::<Option<NaiveDateTime>, _>("last_heartbeat")?
                .map(Self::from_naive),
            activity_id: parse_uuid(row, "activity_id")?,
            schedule,
            timeout_secs: row
                .try_get::<Option<i64>, _>("timeout_secs")?
                .map(|v| u64::try_from(v))
                .transpose()?,
        })
    }

    fn activity_from_row(row: &SqliteRow) -> Result<Activity> {
        Ok(Activity {
            id: parse_uuid(row, "id")?,
            target_name: row.try_get("target_name")?,
            target_type: row.try_get("target_type")?,
            status: row.try_get::<String, _>("status")?.parse()?,
            execution_id: row
                .try_get::<Option<String>, _>("execution_id")?
                .map(|s| Uuid::parse_str(&s))
                .transpose()?,
            step_index: row
                .try_get::<Option<i64>, _>("step_index")?
                .map(to_usize)
                .transpose()?,
            continue_on_failure: row.try_get("continue_on_failure")?,
            initiated_by: initiator_from_row(row)?,
            created_at: Self::from_naive(row.try_get("created_at")?),
            completed_at: row
                .try_get::<Option<NaiveDateTime>, _>("completed_at")?
                .map(Self::from_naive),
            total_time_ms: row.try_get("total_time_ms")?,
            error_message: row.try_get("error_message")?,
            error_stack_trace: row.try_get("error_stack_trace")?,
        })
    }
}

fn parse_uuid(row: &SqliteRow, column: &str) -> Result<Uuid> {
    Uuid::parse_str(&row.try_get::<String, _>(column)?)
        .with_context(|| format!("Invalid UUID in column {}", column))
}

fn to_usize(value: i64) -> Result<usize> {
    usize::try_from(value).context("Negative value in unsigned column")
}

fn to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn initiator_from_row(row: &SqliteRow) -> Result<Initiator> {
    Ok(Initiator {
        kind: row.try_get::<String, _>("initiated_by_type")?.parse()?,
        id: row
            .try_get::<Option<String>, _>("initiated_by_id")?
            .map(|s| Uuid::parse_str(&s))
            .transpose()?,
        name: row.try_get("initiated_by_name")?,
    })
}

fn status_list(statuses: &[ExecutionStatus]) -> String {
    statuses
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

#[async_trait::async_trait]
impl ScheduleStore for SqliteScheduleStore {
    async fn save_schedule(&self, schedule: &Schedule) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO schedules
            (id, name, enabled, trigger_type, cron_expression, last_run_time, next_run_time)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(schedule.id.to_string())
        .bind(&schedule.name)
        .bind(schedule.enabled)
        .bind(schedule.trigger_type.as_str())
        .bind(&schedule.cron_expression)
        .bind(schedule.last_run_time.map(Self::to_naive))
        .bind(schedule.next_run_time.map(Self::to_naive))
        .execute(&mut *tx)
        .await
        .context("Failed to save schedule")?;

        sqlx::query("DELETE FROM schedule_steps WHERE schedule_id = ?1")
            .bind(schedule.id.to_string())
            .execute(&mut *tx)
            .await?;

        for (position, step) in schedule.steps.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO schedule_steps
                (id, schedule_id, position, step_index, name, execution_mode, step_type, continue_on_failure, timeout_secs)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                "#,
            )
            .bind(step.id.to_string())
            .bind(schedule.id.to_string())
            .bind(to_i64(position))
            .bind(to_i64(step.step_index))
            .bind(&step.name)
            .bind(step.execution_mode.as_str())
            .bind(serde_json::to_string(&step.step_type)?)
            .bind(step.continue_on_failure)
            .bind(step.timeout_secs.map(|v| i64::try_from(v).unwrap_or(i64::MAX)))
            .execute(&mut *tx)
            .await
            .context("Failed to save schedule step")?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn load_schedule(&self, schedule_id: Uuid) -> Result<Option<Schedule>> {
        let row = sqlx::query("SELECT * FROM schedules WHERE id = ?1")
            .bind(schedule_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load schedule")?;

        match row {
            Some(row) => Ok(Some(self.schedule_from_row(&row).await?)),
            None => Ok(None),
        }
    }

    async fn list_schedules(&self) -> Result<Vec<Schedule>> {
        let rows = sqlx::query("SELECT * FROM schedules ORDER BY name ASC")
            .fetch_all(&self.pool)
            .await
            .context("Failed to list schedules")?;

        let mut schedules = Vec::with_capacity(rows.len());
        for row in &rows {
            schedules.push(self.schedule_from_row(row).await?);
        }
        Ok(schedules)
    }

    async fn delete_schedule(&self, schedule_id: Uuid) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM schedule_steps WHERE schedule_id = ?1")
            .bind(schedule_id.to_string())
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM schedules WHERE id = ?1")
            .bind(schedule_id.to_string())
            .execute(&mut *tx)
            .await
            .context("Failed to delete schedule")?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_last_run_time(&self, schedule_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE schedules SET last_run_time = ?2 WHERE id = ?1")
            .bind(schedule_id.to_string())
            .bind(Self::to_naive(at))
            .execute(&self.pool)
            .await
            .context("Failed to update last run time")?;
        Ok(())
    }

    async fn set_next_run_time(&self, schedule_id: Uuid, at: Option<DateTime<Utc>>) -> Result<()> {
        sqlx::query("UPDATE schedules SET next_run_time = ?2 WHERE id = ?1")
            .bind(schedule_id.to_string())
            .bind(at.map(Self::to_naive))
            .execute(&self.pool)
            .await
            .context("Failed to update next run time")?;
        Ok(())
    }

    async fn insert_execution(&self, execution: &ScheduleExecution) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO schedule_executions ({}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            EXECUTION_COLUMNS
        ))
        .bind(execution.id.to_string())
        .bind(execution.schedule_id.to_string())
        .bind(&execution.schedule_name)
        .bind(execution.status.as_str())
        .bind(to_i64(execution.current_step_index))
        .bind(to_i64(execution.total_steps))
        .bind(Self::to_naive(execution.queued_at))
        .bind(execution.started_at.map(Self::to_naive))
        .bind(execution.completed_at.map(Self::to_naive))
        .bind(execution.initiated_by.kind.as_str())
        .bind(execution.initiated_by.id.map(|id| id.to_string()))
        .bind(&execution.initiated_by.name)
        .bind(&execution.error_message)
        .bind(&execution.error_stack_trace)
        .execute(&self.pool)
        .await
        .context("Failed to insert execution")?;
        Ok(())
    }

    async fn load_execution(&self, execution_id: Uuid) -> Result<Option<ScheduleExecution>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM schedule_executions WHERE id = ?1",
            EXECUTION_COLUMNS
        ))
        .bind(execution_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to load execution")?;

        row.as_ref().map(Self::execution_from_row).transpose()
    }

    async fn list_executions(&self, schedule_id: Option<Uuid>, limit: usize) -> Result<Vec<ScheduleExecution>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM schedule_executions \
             WHERE (?1 IS NULL OR schedule_id = ?1) \
             ORDER BY queued_at DESC LIMIT ?2",
            EXECUTION_COLUMNS
        ))
        .bind(schedule_id.map(|id| id.to_string()))
        .bind(to_i64(limit))
        .fetch_all(&self.pool)
        .await
        .context("Failed to list executions")?;

        rows.iter().map(Self::execution_from_row).collect()
    }

    async fn executions_with_status(&self, status: ExecutionStatus) -> Result<Vec<ScheduleExecution>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM schedule_executions WHERE status = ?1 ORDER BY queued_at ASC",
            EXECUTION_COLUMNS
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await
        .context("Failed to list executions by status")?;

        rows.iter().map(Self::execution_from_row).collect()
    }

    async fn transition_execution(
        &self,
        execution_id: Uuid,
        from: &[ExecutionStatus],
        transition: &ExecutionTransition,
    ) -> Result<bool> {
        if from.is_empty() {
            return Ok(false);
        }
        let result = sqlx::query(&format!(
            "UPDATE schedule_executions \
             SET status = ?2, completed_at = ?3, error_message = ?4, error_stack_trace = ?5 \
             WHERE id = ?1 AND status IN ({}) AND (?6 IS NULL OR current_step_index = ?6)",
            status_list(from)
        ))
        .bind(execution_id.to_string())
        .bind(transition.status.as_str())
        .bind(transition.completed_at.map(Self::to_naive))
        .bind(&transition.error_message)
        .bind(&transition.error_stack_trace)
        .bind(transition.at_step_index.map(to_i64))
        .execute(&self.pool)
        .await
        .context("Failed to transition execution")?;

        Ok(result.rows_affected() == 1)
    }

    async fn advance_step_index(&self, execution_id: Uuid, from: usize, to: usize) -> Result<bool> {
        if to < from {
            return Ok(false);
        }
        let result = sqlx::query(
            r#"
            UPDATE schedule_executions
            SET current_step_index = ?3
            WHERE id = ?1 AND status = 'InProgress' AND current_step_index = ?2
            "#,
        )
        .bind(execution_id.to_string())
        .bind(to_i64(from))
        .bind(to_i64(to))
        .execute(&self.pool)
        .await
        .context("Failed to advance step index")?;

        Ok(result.rows_affected() == 1)
    }

    async fn insert_task(&self, task: &WorkerTask) -> Result<()> {
        let link = task.schedule.as_ref();
        sqlx::query(&format!(
            "INSERT INTO worker_tasks ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            TASK_COLUMNS
        ))
        .bind(task.id.to_string())
        .bind(serde_json::to_string(&task.kind)?)
        .bind(task.status.as_str())
        .bind(Self::to_naive(task.created_at))
        .bind(task.started_at.map(Self::to_naive))
        .bind(task.last_heartbeat.map(Self::to_naive))
        .bind(task.activity_id.to_string())
        .bind(link.map(|l| l.execution_id.to_string()))
        .bind(link.map(|l| to_i64(l.step_index)))
        .bind(link.map(|l| l.execution_mode.as_str()))
        .bind(link.map(|l| l.continue_on_failure))
        .bind(task.timeout_secs.map(|v| i64::try_from(v).unwrap_or(i64::MAX)))
        .execute(&self.pool)
        .await
        .context("Failed to insert task")?;
        Ok(())
    }

    async fn load_task(&self, task_id: Uuid) -> Result<Option<WorkerTask>> {
        let row = sqlx::query(&format!("SELECT {} FROM worker_tasks WHERE id = ?1", TASK_COLUMNS))
            .bind(task_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load task")?;

        row.as_ref().map(Self::task_from_row).transpose()
    }

    async fn tasks_for_execution(&self, execution_id: Uuid) -> Result<Vec<WorkerTask>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM worker_tasks WHERE execution_id = ?1 ORDER BY created_at ASC, id ASC",
            TASK_COLUMNS
        ))
        .bind(execution_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context("Failed to list tasks for execution")?;

        rows.iter().map(Self::task_from_row).collect()
    }

    async fn claimed_tasks(&self) -> Result<Vec<WorkerTask>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM worker_tasks \
             WHERE status IN ('Processing', 'CancellationRequested') \
             ORDER BY created_at ASC, id ASC",
            TASK_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .context("Failed to list claimed tasks")?;

        rows.iter().map(Self::task_from_row).collect()
    }

    async fn update_task_status(&self, task_id: Uuid, from: TaskStatus, to: TaskStatus) -> Result<bool> {
        let result = sqlx::query("UPDATE worker_tasks SET status = ?3 WHERE id = ?1 AND status = ?2")
            .bind(task_id.to_string())
            .bind(from.as_str())
            .bind(to.as_str())
            .execute(&self.pool)
            .await
            .context("Failed to update task status")?;

        Ok(result.rows_affected() == 1)
    }

    async fn claim_next_task(&self, now: DateTime<Utc>) -> Result<Option<WorkerTask>> {
        // Another worker may win the race for a candidate; pick again when it does
        for _ in 0..5 {
            let candidate: Option<String> = sqlx::query_scalar(
                "SELECT id FROM worker_tasks WHERE status = 'Queued' ORDER BY created_at ASC, id ASC LIMIT 1",
            )
            .fetch_optional(&self.pool)
            .await
            .context("Failed to find queued task")?;

            let Some(task_id) = candidate else {
                return Ok(None);
            };

            let result = sqlx::query(
                r#"
                UPDATE worker_tasks
                SET status = 'Processing', started_at = ?2, last_heartbeat = ?2
                WHERE id = ?1 AND status = 'Queued'
                "#,
            )
            .bind(&task_id)
            .bind(Self::to_naive(now))
            .execute(&self.pool)
            .await
            .context("Failed to claim task")?;

            if result.rows_affected() == 1 {
                return self.load_task(Uuid::parse_str(&task_id)?).await;
            }
        }
        Ok(None)
    }

    async fn promote_waiting_tasks(&self, execution_id: Uuid, step_index: usize) -> Result<usize> {
        let result = sqlx::query(
            r#"
            UPDATE worker_tasks
            SET status = 'Queued'
            WHERE execution_id = ?1 AND step_index = ?2 AND status = 'WaitingForPreviousStep'
            "#,
        )
        .bind(execution_id.to_string())
        .bind(to_i64(step_index))
        .execute(&self.pool)
        .await
        .context("Failed to promote waiting tasks")?;

        Ok(usize::try_from(result.rows_affected()).unwrap_or(usize::MAX))
    }

    async fn update_heartbeats(&self, task_ids: &[Uuid], now: DateTime<Utc>) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        let mut touched = 0u64;
        for task_id in task_ids {
            let result = sqlx::query(
                r#"
                UPDATE worker_tasks
                SET last_heartbeat = ?2
                WHERE id = ?1 AND status IN ('Processing', 'CancellationRequested')
                "#,
            )
            .bind(task_id.to_string())
            .bind(Self::to_naive(now))
            .execute(&mut *tx)
            .await
            .context("Failed to update heartbeat")?;
            touched += result.rows_affected();
        }
        tx.commit().await?;
        Ok(usize::try_from(touched).unwrap_or(usize::MAX))
    }

    async fn delete_task(&self, task_id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM worker_tasks WHERE id = ?1")
            .bind(task_id.to_string())
            .execute(&self.pool)
            .await
            .context("Failed to delete task")?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete_task_if_status(&self, task_id: Uuid, status: TaskStatus) -> Result<bool> {
        let result = sqlx::query("DELETE FROM worker_tasks WHERE id = ?1 AND status = ?2")
            .bind(task_id.to_string())
            .bind(status.as_str())
            .execute(&self.pool)
            .await
            .context("Failed to delete task")?;
        Ok(result.rows_affected() == 1)
    }

    async fn insert_activity(&self, activity: &Activity) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO activities ({}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            ACTIVITY_COLUMNS
        ))
        .bind(activity.id.to_string())
        .bind(&activity.target_name)
        .bind(&activity.target_type)
        .bind(activity.status.as_str())
        .bind(activity.execution_id.map(|id| id.to_string()))
        .bind(activity.step_index.map(to_i64))
        .bind(activity.continue_on_failure)
        .bind(activity.initiated_by.kind.as_str())
        .bind(activity.initiated_by.id.map(|id| id.to_string()))
        .bind(&activity.initiated_by.name)
        .bind(Self::to_naive(activity.created_at))
        .bind(activity.completed_at.map(Self::to_naive))
        .bind(activity.total_time_ms)
        .bind(&activity.error_message)
        .bind(&activity.error_stack_trace)
        .execute(&self.pool)
        .await
        .context("Failed to insert activity")?;
        Ok(())
    }

    async fn load_activity(&self, activity_id: Uuid) -> Result<Option<Activity>> {
        let row = sqlx::query(&format!("SELECT {} FROM activities WHERE id = ?1", ACTIVITY_COLUMNS))
            .bind(activity_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load activity")?;

        row.as_ref().map(Self::activity_from_row).transpose()
    }

    async fn activities_for_execution(&self, execution_id: Uuid) -> Result<Vec<Activity>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM activities WHERE execution_id = ?1 ORDER BY step_index ASC, created_at ASC",
            ACTIVITY_COLUMNS
        ))
        .bind(execution_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context("Failed to list activities")?;

        rows.iter().map(Self::activity_from_row).collect()
    }

    async fn activities_for_step(&self, execution_id: Uuid, step_index: usize) -> Result<Vec<Activity>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM activities WHERE execution_id = ?1 AND step_index = ?2",
            ACTIVITY_COLUMNS
        ))
        .bind(execution_id.to_string())
        .bind(to_i64(step_index))
        .fetch_all(&self.pool)
        .await
        .context("Failed to list step activities")?;

        rows.iter().map(Self::activity_from_row).collect()
    }

    async fn complete_activity(&self, activity_id: Uuid, outcome: &ActivityOutcome) -> Result<bool> {
        let mut activity = self
            .load_activity(activity_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Activity {} not found", activity_id))?;
        if activity.status.is_terminal() {
            return Ok(false);
        }
        outcome.apply(&mut activity);

        let result = sqlx::query(
            r#"
            UPDATE activities
            SET status = ?2, completed_at = ?3, total_time_ms = ?4, error_message = ?5, error_stack_trace = ?6
            WHERE id = ?1 AND status = 'InProgress'
            "#,
        )
        .bind(activity_id.to_string())
        .bind(activity.status.as_str())
        .bind(activity.completed_at.map(Self::to_naive))
        .bind(activity.total_time_ms)
        .bind(&activity.error_message)
        .bind(&activity.error_stack_trace)
        .execute(&self.pool)
        .await
        .context("Failed to complete activity")?;

        Ok(result.rows_affected() == 1)
    }
}
