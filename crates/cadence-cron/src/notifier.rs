//! Boundary to the external notification service.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use cadence_types::{ExecutionStatus, ScheduledTaskExecution};

#[derive(Debug, Clone, thiserror::Error)]
pub enum NotifyError {
    #[error("notification delivery failed: {0}")]
    Delivery(String),
}

/// What the owner is told when an execution finishes.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TaskNotification {
    pub task_id: String,
    pub task_name: String,
    pub execution_id: String,
    pub recipient: String,
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskNotification {
    /// Build a notification for a finished execution, if its payload asks
    /// for one.
    pub fn for_execution(execution: &ScheduledTaskExecution, task_name: &str) -> Option<Self> {
        let recipient = execution.payload.notification.email_recipient()?;
        Some(Self {
            task_id: execution.task_id.clone(),
            task_name: task_name.to_string(),
            execution_id: execution.id.clone(),
            recipient: recipient.to_string(),
            status: execution.status,
            result_summary: execution.result_summary.clone(),
            error_message: execution.error_message.clone(),
            session_id: execution.session_id.clone(),
            completed_at: execution.completed_at,
        })
    }

    /// One-line subject suitable for an email.
    pub fn subject(&self) -> String {
        match self.status {
            ExecutionStatus::Completed => format!("Task \"{}\" completed", self.task_name),
            ExecutionStatus::Failed => format!("Task \"{}\" failed", self.task_name),
            other => format!("Task \"{}\" {other}", self.task_name),
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &TaskNotification) -> Result<(), NotifyError>;
}

/// Writes notifications to the log instead of delivering them.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &TaskNotification) -> Result<(), NotifyError> {
        info!(
            recipient = %notification.recipient,
            execution_id = %notification.execution_id,
            status = %notification.status,
            "{}",
            notification.subject()
        );
        Ok(())
    }
}
