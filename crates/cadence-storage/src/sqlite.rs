//! SQLite-backed task store.
//!
//! Timestamps are stored as unix milliseconds so due-task queries compare
//! integers. Task payloads are stored as JSON.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{Connection, OptionalExtension, Row};
use tokio::sync::Mutex;

use cadence_types::{ScheduledTask, ScheduledTaskExecution, TaskPayload};

use crate::{Result, StorageError, TaskStore};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS scheduled_tasks (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL,
        name TEXT NOT NULL,
        description TEXT,
        cron_expression TEXT NOT NULL,
        timezone TEXT NOT NULL,
        status TEXT NOT NULL,
        payload TEXT NOT NULL,
        next_run_at INTEGER,
        last_run_at INTEGER,
        last_session_id TEXT,
        run_count INTEGER NOT NULL DEFAULT 0,
        failure_count INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        version INTEGER NOT NULL DEFAULT 0
    );

    CREATE INDEX IF NOT EXISTS idx_scheduled_tasks_due
        ON scheduled_tasks(status, next_run_at);
    CREATE INDEX IF NOT EXISTS idx_scheduled_tasks_user
        ON scheduled_tasks(user_id);

    CREATE TABLE IF NOT EXISTS task_executions (
        id TEXT PRIMARY KEY,
        task_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        session_id TEXT,
        status TEXT NOT NULL,
        trigger_kind TEXT NOT NULL,
        scheduled_at INTEGER NOT NULL,
        started_at INTEGER,
        completed_at INTEGER,
        result_summary TEXT,
        error_message TEXT,
        payload TEXT NOT NULL,
        cancel_requested INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        version INTEGER NOT NULL DEFAULT 0,
        handed_off_at INTEGER
    );

    CREATE INDEX IF NOT EXISTS idx_task_executions_task
        ON task_executions(task_id, scheduled_at DESC);
    CREATE INDEX IF NOT EXISTS idx_task_executions_user
        ON task_executions(user_id, scheduled_at DESC);";

const STATUS_INDEX: &str = "CREATE INDEX IF NOT EXISTS idx_task_executions_status
        ON task_executions(status, created_at);";

const TASK_COLUMNS: &str = "id, user_id, name, description, cron_expression, timezone, status, payload,
     next_run_at, last_run_at, last_session_id, run_count, failure_count, created_at, updated_at, version";

const EXECUTION_COLUMNS: &str = "id, task_id, user_id, session_id, status, trigger_kind, scheduled_at,
     started_at, completed_at, result_summary, error_message, payload, cancel_requested,
     created_at, updated_at, version, handed_off_at";

/// [`TaskStore`] persisted in a SQLite database.
pub struct SqliteTaskStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteTaskStore {
    /// Open (or create) the SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrent read performance
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        init_schema(&conn)?;

        tracing::info!("Task store opened: {}", path.display());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            f(&conn)
        })
        .await?
    }
}

/// Create tables and bring databases from older builds up to date.
fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)?;
    let has_handoff = conn
        .prepare(
            "SELECT 1 FROM pragma_table_info('task_executions') WHERE name = 'handed_off_at'",
        )?
        .exists([])?;
    if !has_handoff {
        conn.execute_batch("ALTER TABLE task_executions ADD COLUMN handed_off_at INTEGER;")?;
    }
    conn.execute_batch(STATUS_INDEX)?;
    Ok(())
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn millis_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let ms: i64 = row.get(idx)?;
    DateTime::from_timestamp_millis(ms).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms))
}

fn opt_millis_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<i64>>(idx)? {
        Some(ms) => DateTime::from_timestamp_millis(ms)
            .map(Some)
            .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms)),
        None => Ok(None),
    }
}

fn unsigned_at<T: TryFrom<i64>>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: i64 = row.get(idx)?;
    T::try_from(raw).map_err(|_| rusqlite::Error::IntegralValueOutOfRange(idx, raw))
}

fn parsed_at<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_error(idx, e))
}

fn payload_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<TaskPayload> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e))
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<ScheduledTask> {
    Ok(ScheduledTask {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        cron_expression: row.get(4)?,
        timezone: row.get(5)?,
        status: parsed_at(row, 6)?,
        payload: payload_at(row, 7)?,
        next_run_at: opt_millis_at(row, 8)?,
        last_run_at: opt_millis_at(row, 9)?,
        last_session_id: row.get(10)?,
        run_count: unsigned_at(row, 11)?,
        failure_count: unsigned_at(row, 12)?,
        created_at: millis_at(row, 13)?,
        updated_at: millis_at(row, 14)?,
        version: unsigned_at(row, 15)?,
    })
}

fn execution_from_row(row: &Row<'_>) -> rusqlite::Result<ScheduledTaskExecution> {
    Ok(ScheduledTaskExecution {
        id: row.get(0)?,
        task_id: row.get(1)?,
        user_id: row.get(2)?,
        session_id: row.get(3)?,
        status: parsed_at(row, 4)?,
        trigger: parsed_at(row, 5)?,
        scheduled_at: millis_at(row, 6)?,
        started_at: opt_millis_at(row, 7)?,
        completed_at: opt_millis_at(row, 8)?,
        result_summary: row.get(9)?,
        error_message: row.get(10)?,
        payload: payload_at(row, 11)?,
        cancel_requested: row.get::<_, i32>(12)? != 0,
        created_at: millis_at(row, 13)?,
        updated_at: millis_at(row, 14)?,
        version: unsigned_at(row, 15)?,
        handed_off_at: opt_millis_at(row, 16)?,
    })
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn insert_task(&self, task: &ScheduledTask) -> Result<()> {
        let task = task.clone();
        let payload = serde_json::to_string(&task.payload)?;
        self.with_conn(move |conn| {
            let inserted = conn.execute(
                "INSERT INTO scheduled_tasks
                    (id, user_id, name, description, cron_expression, timezone, status, payload,
                     next_run_at, last_run_at, last_session_id, run_count, failure_count,
                     created_at, updated_at, version)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                rusqlite::params![
                    task.id,
                    task.user_id,
                    task.name,
                    task.description,
                    task.cron_expression,
                    task.timezone,
                    task.status.as_str(),
                    payload,
                    task.next_run_at.map(to_millis),
                    task.last_run_at.map(to_millis),
                    task.last_session_id,
                    task.run_count as i64,
                    task.failure_count as i64,
                    to_millis(task.created_at),
                    to_millis(task.updated_at),
                    task.version as i64,
                ],
            );
            match inserted {
                Ok(_) => Ok(()),
                Err(e) if is_unique_violation(&e) => Err(StorageError::Duplicate(task.id)),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn get_task(&self, id: &str) -> Result<Option<ScheduledTask>> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let task = conn
                .query_row(
                    &format!("SELECT {TASK_COLUMNS} FROM scheduled_tasks WHERE id = ?1"),
                    rusqlite::params![id],
                    task_from_row,
                )
                .optional()?;
            Ok(task)
        })
        .await
    }

    async fn list_tasks(&self, user_id: &str) -> Result<Vec<ScheduledTask>> {
        let user_id = user_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM scheduled_tasks
                 WHERE user_id = ?1 ORDER BY created_at ASC, id ASC"
            ))?;
            let rows = stmt
                .query_map(rusqlite::params![user_id], task_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    async fn find_due_tasks(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledTask>> {
        let now = to_millis(now);
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM scheduled_tasks
                 WHERE status = 'active' AND next_run_at IS NOT NULL AND next_run_at <= ?1
                 ORDER BY next_run_at ASC"
            ))?;
            let rows = stmt
                .query_map(rusqlite::params![now], task_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    async fn update_task(&self, task: &ScheduledTask) -> Result<bool> {
        let task = task.clone();
        let payload = serde_json::to_string(&task.payload)?;
        self.with_conn(move |conn| Ok(update_task_row(conn, &task, &payload)? == 1))
            .await
    }

    async fn claim_occurrence(
        &self,
        task: &ScheduledTask,
        execution: &ScheduledTaskExecution,
    ) -> Result<bool> {
        let task = task.clone();
        let execution = execution.clone();
        let task_payload = serde_json::to_string(&task.payload)?;
        let execution_payload = serde_json::to_string(&execution.payload)?;
        self.with_conn(move |conn| {
            // Dropping the transaction without commit rolls it back.
            let tx = conn.unchecked_transaction()?;
            if update_task_row(&tx, &task, &task_payload)? != 1 {
                return Ok(false);
            }
            insert_execution_row(&tx, &execution, execution_payload)?;
            tx.commit()?;
            Ok(true)
        })
        .await
    }

    async fn delete_task(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let count = conn.execute(
                "DELETE FROM scheduled_tasks WHERE id = ?1",
                rusqlite::params![id],
            )?;
            Ok(count > 0)
        })
        .await
    }

    async fn insert_execution(&self, execution: &ScheduledTaskExecution) -> Result<()> {
        let execution = execution.clone();
        let payload = serde_json::to_string(&execution.payload)?;
        self.with_conn(move |conn| insert_execution_row(conn, &execution, payload))
            .await
    }

    async fn insert_execution_if_idle(&self, execution: &ScheduledTaskExecution) -> Result<bool> {
        let execution = execution.clone();
        let payload = serde_json::to_string(&execution.payload)?;
        self.with_conn(move |conn| {
            let inserted = conn.execute(
                &format!(
                    "INSERT INTO task_executions ({EXECUTION_COLUMNS})
                     SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17
                     WHERE NOT EXISTS (
                         SELECT 1 FROM task_executions
                         WHERE task_id = ?2 AND status IN ('pending', 'running')
                     )"
                ),
                rusqlite::params_from_iter(execution_values(&execution, payload)),
            );
            match inserted {
                Ok(count) => Ok(count == 1),
                Err(e) if is_unique_violation(&e) => Err(StorageError::Duplicate(execution.id)),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn get_execution(&self, id: &str) -> Result<Option<ScheduledTaskExecution>> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let execution = conn
                .query_row(
                    &format!("SELECT {EXECUTION_COLUMNS} FROM task_executions WHERE id = ?1"),
                    rusqlite::params![id],
                    execution_from_row,
                )
                .optional()?;
            Ok(execution)
        })
        .await
    }

    async fn update_execution(&self, execution: &ScheduledTaskExecution) -> Result<bool> {
        let execution = execution.clone();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE task_executions SET
                    session_id = ?3, status = ?4, started_at = ?5, completed_at = ?6,
                    result_summary = ?7, error_message = ?8, cancel_requested = ?9,
                    updated_at = ?10, handed_off_at = ?11, version = version + 1
                 WHERE id = ?1 AND version = ?2",
                rusqlite::params![
                    execution.id,
                    execution.version as i64,
                    execution.session_id,
                    execution.status.as_str(),
                    execution.started_at.map(to_millis),
                    execution.completed_at.map(to_millis),
                    execution.result_summary,
                    execution.error_message,
                    execution.cancel_requested as i32,
                    to_millis(execution.updated_at),
                    execution.handed_off_at.map(to_millis),
                ],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn list_executions(
        &self,
        task_id: &str,
        limit: usize,
    ) -> Result<Vec<ScheduledTaskExecution>> {
        let task_id = task_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {EXECUTION_COLUMNS} FROM task_executions
                 WHERE task_id = ?1
                 ORDER BY scheduled_at DESC, created_at DESC, id DESC
                 LIMIT ?2"
            ))?;
            let rows = stmt
                .query_map(rusqlite::params![task_id, limit as i64], execution_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    async fn list_user_executions(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<ScheduledTaskExecution>> {
        let user_id = user_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {EXECUTION_COLUMNS} FROM task_executions
                 WHERE user_id = ?1
                 ORDER BY scheduled_at DESC, created_at DESC, id DESC
                 LIMIT ?2"
            ))?;
            let rows = stmt
                .query_map(rusqlite::params![user_id, limit as i64], execution_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    async fn list_in_flight_executions(
        &self,
        user_id: &str,
    ) -> Result<Vec<ScheduledTaskExecution>> {
        let user_id = user_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {EXECUTION_COLUMNS} FROM task_executions
                 WHERE user_id = ?1 AND status IN ('pending', 'running')
                 ORDER BY scheduled_at DESC, created_at DESC, id DESC"
            ))?;
            let rows = stmt
                .query_map(rusqlite::params![user_id], execution_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    async fn find_unconfirmed_executions(
        &self,
        created_before: DateTime<Utc>,
    ) -> Result<Vec<ScheduledTaskExecution>> {
        let cutoff = to_millis(created_before);
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {EXECUTION_COLUMNS} FROM task_executions
                 WHERE status = 'pending' AND handed_off_at IS NULL AND created_at <= ?1
                 ORDER BY created_at ASC, id ASC"
            ))?;
            let rows = stmt
                .query_map(rusqlite::params![cutoff], execution_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }
}

fn nullable<T: Into<Value>>(value: Option<T>) -> Value {
    value.map(Into::into).unwrap_or(Value::Null)
}

fn execution_values(execution: &ScheduledTaskExecution, payload: String) -> Vec<Value> {
    vec![
        Value::Text(execution.id.clone()),
        Value::Text(execution.task_id.clone()),
        Value::Text(execution.user_id.clone()),
        nullable(execution.session_id.clone()),
        Value::Text(execution.status.as_str().to_string()),
        Value::Text(execution.trigger.as_str().to_string()),
        Value::Integer(to_millis(execution.scheduled_at)),
        nullable(execution.started_at.map(to_millis)),
        nullable(execution.completed_at.map(to_millis)),
        nullable(execution.result_summary.clone()),
        nullable(execution.error_message.clone()),
        Value::Text(payload),
        Value::Integer(execution.cancel_requested as i64),
        Value::Integer(to_millis(execution.created_at)),
        Value::Integer(to_millis(execution.updated_at)),
        Value::Integer(execution.version as i64),
        nullable(execution.handed_off_at.map(to_millis)),
    ]
}

fn update_task_row(conn: &Connection, task: &ScheduledTask, payload: &str) -> Result<usize> {
    let changed = conn.execute(
        "UPDATE scheduled_tasks SET
            name = ?3, description = ?4, cron_expression = ?5, timezone = ?6,
            status = ?7, payload = ?8, next_run_at = ?9, last_run_at = ?10,
            last_session_id = ?11, run_count = ?12, failure_count = ?13,
            updated_at = ?14, version = version + 1
         WHERE id = ?1 AND version = ?2",
        rusqlite::params![
            task.id,
            task.version as i64,
            task.name,
            task.description,
            task.cron_expression,
            task.timezone,
            task.status.as_str(),
            payload,
            task.next_run_at.map(to_millis),
            task.last_run_at.map(to_millis),
            task.last_session_id,
            task.run_count as i64,
            task.failure_count as i64,
            to_millis(task.updated_at),
        ],
    )?;
    Ok(changed)
}

fn insert_execution_row(
    conn: &Connection,
    execution: &ScheduledTaskExecution,
    payload: String,
) -> Result<()> {
    let inserted = conn.execute(
        &format!(
            "INSERT INTO task_executions ({EXECUTION_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)"
        ),
        rusqlite::params_from_iter(execution_values(execution, payload)),
    );
    match inserted {
        Ok(_) => Ok(()),
        Err(e) if is_unique_violation(&e) => Err(StorageError::Duplicate(execution.id.clone())),
        Err(e) => Err(e.into()),
    }
}
