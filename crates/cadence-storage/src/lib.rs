//! cadence-storage: durable storage for tasks and their executions.
//!
//! Every write is a compare-and-swap on the record's `version`, so
//! concurrent coordinators, controllers and trackers never lose updates.
//! Two implementations are provided: [`InMemoryTaskStore`] and
//! [`SqliteTaskStore`].

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use cadence_types::{ScheduledTask, ScheduledTaskExecution};

pub use memory::InMemoryTaskStore;
pub use sqlite::SqliteTaskStore;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Blocking task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("Payload encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("Record already exists: {0}")]
    Duplicate(String),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl StorageError {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Unavailable(_) => true,
            Self::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Keyed storage for task and execution records.
///
/// `update_*` methods are compare-and-swap operations: the write only lands
/// when the stored record's version equals the `version` field of the record
/// passed in, and the stored copy then carries `version + 1`. They return
/// `Ok(false)` on a version mismatch or when the record no longer exists.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert_task(&self, task: &ScheduledTask) -> Result<()>;

    async fn get_task(&self, id: &str) -> Result<Option<ScheduledTask>>;

    /// All tasks owned by `user_id`, oldest first.
    async fn list_tasks(&self, user_id: &str) -> Result<Vec<ScheduledTask>>;

    /// Active tasks whose `next_run_at` is at or before `now`, earliest first.
    async fn find_due_tasks(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledTask>>;

    async fn update_task(&self, task: &ScheduledTask) -> Result<bool>;

    /// Claim a due occurrence: compare-and-swap `task` and insert the
    /// execution it produced, as one atomic write. Returns `Ok(false)` and
    /// writes nothing when the task's version no longer matches. Any error
    /// also leaves both records untouched.
    async fn claim_occurrence(
        &self,
        task: &ScheduledTask,
        execution: &ScheduledTaskExecution,
    ) -> Result<bool>;

    /// Remove a task. Its executions are kept.
    async fn delete_task(&self, id: &str) -> Result<bool>;

    async fn insert_execution(&self, execution: &ScheduledTaskExecution) -> Result<()>;

    /// Insert `execution` only if its task has no pending or running
    /// execution. The check and the insert are atomic.
    async fn insert_execution_if_idle(&self, execution: &ScheduledTaskExecution) -> Result<bool>;

    async fn get_execution(&self, id: &str) -> Result<Option<ScheduledTaskExecution>>;

    async fn update_execution(&self, execution: &ScheduledTaskExecution) -> Result<bool>;

    /// Executions of one task, most recent occurrence first.
    async fn list_executions(
        &self,
        task_id: &str,
        limit: usize,
    ) -> Result<Vec<ScheduledTaskExecution>>;

    /// Executions across all tasks of one user, most recent occurrence first.
    async fn list_user_executions(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<ScheduledTaskExecution>>;

    /// Every pending or running execution of one user, most recent
    /// occurrence first. Not paged.
    async fn list_in_flight_executions(
        &self,
        user_id: &str,
    ) -> Result<Vec<ScheduledTaskExecution>>;

    /// Pending executions created at or before `created_before` that were
    /// never marked handed off, oldest first.
    async fn find_unconfirmed_executions(
        &self,
        created_before: DateTime<Utc>,
    ) -> Result<Vec<ScheduledTaskExecution>>;
}
