use cadence_storage::StorageError;
use cadence_types::ExecutionStatus;

use crate::recurrence::RecurrenceError;

/// Errors surfaced by the controller, dispatch loop and tracker.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// Bad input. Nothing was persisted.
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    /// The store kept failing transiently after all retries.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("Invalid transition for execution {execution_id}: {from} -> {to}")]
    InvalidTransition {
        execution_id: String,
        from: ExecutionStatus,
        to: ExecutionStatus,
    },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<RecurrenceError> for SchedulerError {
    fn from(e: RecurrenceError) -> Self {
        Self::Validation(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
