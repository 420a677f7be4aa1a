//! cadence-types: records shared by the scheduler, its store, and its callers.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Generate a new record identifier (16 hex chars).
pub fn new_record_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(16);
    id
}

/// Error returned when a stored status string is not recognised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant(pub String);

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown variant: {}", self.0)
    }
}

impl std::error::Error for UnknownVariant {}

// ──────────────────── Task Types ────────────────────

/// Scheduling status of a task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Dispatched whenever `next_run_at` comes due.
    Active,
    /// Temporarily skipped; `resume` reactivates it.
    Paused,
    /// Out of rotation until an administrative update reactivates it.
    Disabled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Disabled => "disabled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "disabled" => Ok(Self::Disabled),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// How the owner wants to hear about finished executions.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    #[default]
    None,
    Email,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Email => "email",
        }
    }
}

impl FromStr for NotificationType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "email" => Ok(Self::Email),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Notification preferences carried from a task to its executions.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotificationConfig {
    #[serde(default, rename = "type")]
    pub notification_type: NotificationType,
    /// Recipient address; required when `notification_type` is email.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl NotificationConfig {
    pub fn email(address: impl Into<String>) -> Self {
        Self {
            notification_type: NotificationType::Email,
            email: Some(address.into()),
        }
    }

    /// Recipient to notify, if email notification is configured.
    pub fn email_recipient(&self) -> Option<&str> {
        match self.notification_type {
            NotificationType::Email => self.email.as_deref(),
            NotificationType::None => None,
        }
    }
}

/// The part of a task handed to the executor. Opaque to the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskPayload {
    /// Prompt (or job body) passed to the executor.
    pub prompt: String,
    /// Whether the executor should keep result files.
    #[serde(default = "default_true")]
    pub save_result: bool,
    #[serde(default)]
    pub notification: NotificationConfig,
    /// File references attached to each run.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<String>,
}

impl TaskPayload {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            save_result: true,
            notification: NotificationConfig::default(),
            attachments: Vec::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

/// A recurring task definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduledTask {
    pub id: String,
    /// Owner of this task.
    pub user_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Five-field cron expression, interpreted in `timezone`.
    pub cron_expression: String,
    /// IANA timezone name.
    pub timezone: String,
    pub status: TaskStatus,
    pub payload: TaskPayload,
    /// Next occurrence. Present iff the task is active and its expression parses.
    pub next_run_at: Option<DateTime<Utc>>,
    /// Occurrence instant of the last scheduled dispatch.
    pub last_run_at: Option<DateTime<Utc>>,
    /// Session of the most recently started execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_session_id: Option<String>,
    /// Scheduled dispatches so far; manual runs are not counted.
    pub run_count: u64,
    /// Consecutive failed executions.
    #[serde(default)]
    pub failure_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Optimistic-concurrency token, bumped on every write.
    pub version: u64,
}

impl ScheduledTask {
    /// Whether this task should be dispatched at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Active && self.next_run_at.is_some_and(|next| next <= now)
    }
}

/// Parameters for creating a task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskDraft {
    pub name: String,
    pub cron_expression: String,
    pub prompt: String,
    /// Defaults to the scheduler's configured timezone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save_result: Option<bool>,
    #[serde(default)]
    pub notification: NotificationConfig,
    #[serde(default)]
    pub attachments: Vec<String>,
}

impl TaskDraft {
    pub fn new(
        name: impl Into<String>,
        cron_expression: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            cron_expression: cron_expression.into(),
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = Some(timezone.into());
        self
    }
}

/// Partial update of a task. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron_expression: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save_result: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification: Option<NotificationConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<String>>,
    /// Administrative status change, the only way back from `disabled`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
}

impl TaskUpdate {
    /// Whether the recurrence rule itself changes.
    pub fn changes_schedule(&self) -> bool {
        self.cron_expression.is_some() || self.timezone.is_some()
    }
}

// ──────────────────── Execution Types ────────────────────

/// Lifecycle status of an execution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Completed, failed and cancelled executions never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Pending or running.
    pub fn is_in_flight(&self) -> bool {
        !self.is_terminal()
    }

    /// Legal edges of the execution state machine.
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// What created an execution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionTrigger {
    /// Claimed by the dispatch loop for a scheduled occurrence.
    Schedule,
    /// Explicit run-now request.
    Manual,
}

impl ExecutionTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Schedule => "schedule",
            Self::Manual => "manual",
        }
    }
}

impl FromStr for ExecutionTrigger {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "schedule" => Ok(Self::Schedule),
            "manual" => Ok(Self::Manual),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// One run of a task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduledTaskExecution {
    pub id: String,
    /// Owning task. Kept after the task is deleted.
    pub task_id: String,
    pub user_id: String,
    /// Assigned once the executor accepts the job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub status: ExecutionStatus,
    pub trigger: ExecutionTrigger,
    /// Occurrence this run corresponds to.
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Snapshot of the task payload at dispatch time.
    pub payload: TaskPayload,
    /// Set when a cancel was requested but the executor did not acknowledge.
    #[serde(default)]
    pub cancel_requested: bool,
    /// When the executor accepted the job. A pending execution without it
    /// was never confirmed as handed off.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handed_off_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

impl ScheduledTaskExecution {
    /// A fresh pending execution snapshotting `task`.
    pub fn pending(
        task: &ScheduledTask,
        trigger: ExecutionTrigger,
        scheduled_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: new_record_id(),
            task_id: task.id.clone(),
            user_id: task.user_id.clone(),
            session_id: None,
            status: ExecutionStatus::Pending,
            trigger,
            scheduled_at,
            started_at: None,
            completed_at: None,
            result_summary: None,
            error_message: None,
            payload: task.payload.clone(),
            cancel_requested: false,
            handed_off_at: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    /// The job description handed to the executor.
    pub fn to_request(&self) -> ExecutionRequest {
        ExecutionRequest {
            execution_id: self.id.clone(),
            task_id: self.task_id.clone(),
            user_id: self.user_id.clone(),
            trigger: self.trigger,
            scheduled_at: self.scheduled_at,
            payload: self.payload.clone(),
        }
    }
}

// ──────────────────── Executor Boundary ────────────────────

/// A unit of work handed to the external executor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionRequest {
    pub execution_id: String,
    pub task_id: String,
    pub user_id: String,
    pub trigger: ExecutionTrigger,
    pub scheduled_at: DateTime<Utc>,
    pub payload: TaskPayload,
}

/// Lifecycle report emitted by the executor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    Started {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    Completed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result_summary: Option<String>,
    },
    Failed {
        error: String,
    },
    Cancelled,
}

impl LifecycleEvent {
    /// Status the execution moves to when this event is applied.
    pub fn target_status(&self) -> ExecutionStatus {
        match self {
            Self::Started { .. } => ExecutionStatus::Running,
            Self::Completed { .. } => ExecutionStatus::Completed,
            Self::Failed { .. } => ExecutionStatus::Failed,
            Self::Cancelled => ExecutionStatus::Cancelled,
        }
    }
}

/// A lifecycle event addressed to one execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LifecycleSignal {
    pub execution_id: String,
    #[serde(flatten)]
    pub event: LifecycleEvent,
}

impl LifecycleSignal {
    pub fn new(execution_id: impl Into<String>, event: LifecycleEvent) -> Self {
        Self {
            execution_id: execution_id.into(),
            event,
        }
    }
}
