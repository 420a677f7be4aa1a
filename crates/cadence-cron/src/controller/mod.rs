//! Task lifecycle operations on behalf of a user.
//!
//! Every operation takes the caller's user id; tasks and executions owned by
//! someone else behave as if they did not exist.

pub mod views;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use cadence_config::SchedulerConfig;
use cadence_storage::TaskStore;
use cadence_types::{
    ExecutionTrigger, NotificationConfig, NotificationType, ScheduledTask, ScheduledTaskExecution,
    TaskDraft, TaskPayload, TaskStatus, TaskUpdate, new_record_id,
};

use crate::clock::Clock;
use crate::error::{Result, SchedulerError};
use crate::executor::Executor;
use crate::recurrence::Recurrence;
use crate::retry::RetryPolicy;
use crate::tracker::{fail_handoff, mark_handed_off};

pub use views::TaskOverview;

pub struct TaskController {
    store: Arc<dyn TaskStore>,
    executor: Arc<dyn Executor>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    config: SchedulerConfig,
}

impl TaskController {
    pub fn new(
        store: Arc<dyn TaskStore>,
        executor: Arc<dyn Executor>,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            executor,
            clock,
            retry,
            config,
        }
    }

    /// Create an active task scheduled from the current instant.
    pub async fn create_task(&self, user_id: &str, draft: TaskDraft) -> Result<ScheduledTask> {
        let now = self.clock.now();
        let name = required("name", &draft.name)?;
        let prompt = required("prompt", &draft.prompt)?;
        let cron_expression = required("cron_expression", &draft.cron_expression)?;
        let timezone = match draft.timezone.as_deref().map(str::trim) {
            Some(tz) if !tz.is_empty() => tz.to_string(),
            _ => self.config.default_timezone.clone(),
        };
        validate_notification(&draft.notification)?;
        let next_run_at = next_run(&cron_expression, &timezone, now)?;

        let task = ScheduledTask {
            id: new_record_id(),
            user_id: user_id.to_string(),
            name,
            description: draft.description.as_deref().and_then(optional),
            cron_expression,
            timezone,
            status: TaskStatus::Active,
            payload: TaskPayload {
                prompt,
                save_result: draft.save_result.unwrap_or(true),
                notification: draft.notification,
                attachments: draft.attachments,
            },
            next_run_at: Some(next_run_at),
            last_run_at: None,
            last_session_id: None,
            run_count: 0,
            failure_count: 0,
            created_at: now,
            updated_at: now,
            version: 0,
        };
        self.retry
            .run("insert_task", || self.store.insert_task(&task))
            .await?;
        info!(
            task_id = %task.id,
            user_id,
            cron = %task.cron_expression,
            timezone = %task.timezone,
            next_run_at = %next_run_at,
            "Task created"
        );
        Ok(task)
    }

    /// The user's tasks, oldest first.
    pub async fn list_tasks(&self, user_id: &str) -> Result<Vec<ScheduledTask>> {
        self.retry
            .run("list_tasks", || self.store.list_tasks(user_id))
            .await
    }

    pub async fn get_task(&self, user_id: &str, task_id: &str) -> Result<ScheduledTask> {
        let task = self
            .retry
            .run("get_task", || self.store.get_task(task_id))
            .await?;
        match task {
            Some(task) if task.user_id == user_id => Ok(task),
            _ => Err(not_found(task_id)),
        }
    }

    /// Apply a partial update. A changed cron expression or timezone, or a
    /// reactivation, reschedules from the current instant.
    pub async fn update_task(
        &self,
        user_id: &str,
        task_id: &str,
        update: TaskUpdate,
    ) -> Result<ScheduledTask> {
        let name = update.name.as_deref().map(|n| required("name", n)).transpose()?;
        let prompt = update
            .prompt
            .as_deref()
            .map(|p| required("prompt", p))
            .transpose()?;
        let cron_expression = update
            .cron_expression
            .as_deref()
            .map(|c| required("cron_expression", c))
            .transpose()?;
        let timezone = update
            .timezone
            .as_deref()
            .map(|tz| required("timezone", tz))
            .transpose()?;
        if let Some(notification) = &update.notification {
            validate_notification(notification)?;
        }

        let task = self
            .modify_task(user_id, task_id, |task, now| {
                if let Some(name) = &name {
                    task.name = name.clone();
                }
                if let Some(description) = &update.description {
                    task.description = optional(description);
                }
                if let Some(prompt) = &prompt {
                    task.payload.prompt = prompt.clone();
                }
                if let Some(save_result) = update.save_result {
                    task.payload.save_result = save_result;
                }
                if let Some(notification) = &update.notification {
                    task.payload.notification = notification.clone();
                }
                if let Some(attachments) = &update.attachments {
                    task.payload.attachments = attachments.clone();
                }
                if let Some(cron_expression) = &cron_expression {
                    task.cron_expression = cron_expression.clone();
                }
                if let Some(timezone) = &timezone {
                    task.timezone = timezone.clone();
                }

                let reactivated = update.status == Some(TaskStatus::Active)
                    && task.status != TaskStatus::Active;
                if let Some(status) = update.status {
                    task.status = status;
                }

                // Validate a new rule even when the task is not active.
                let next = if update.changes_schedule() || reactivated {
                    Some(next_run(&task.cron_expression, &task.timezone, now)?)
                } else {
                    None
                };
                if task.status != TaskStatus::Active {
                    task.next_run_at = None;
                } else if next.is_some() {
                    task.next_run_at = next;
                }
                Ok(true)
            })
            .await?;
        info!(task_id, user_id, status = %task.status, next_run_at = ?task.next_run_at, "Task updated");
        Ok(task)
    }

    /// Remove a task. Its executions stay for audit.
    pub async fn delete_task(&self, user_id: &str, task_id: &str) -> Result<()> {
        self.get_task(user_id, task_id).await?;
        let removed = self
            .retry
            .run("delete_task", || self.store.delete_task(task_id))
            .await?;
        if !removed {
            return Err(not_found(task_id));
        }
        info!(task_id, user_id, "Task deleted");
        Ok(())
    }

    /// Stop scheduling an active task. Pausing a paused or disabled task
    /// changes nothing.
    pub async fn pause_task(&self, user_id: &str, task_id: &str) -> Result<ScheduledTask> {
        let task = self
            .modify_task(user_id, task_id, |task, _| {
                if task.status != TaskStatus::Active {
                    return Ok(false);
                }
                task.status = TaskStatus::Paused;
                task.next_run_at = None;
                Ok(true)
            })
            .await?;
        info!(task_id, user_id, status = %task.status, "Task paused");
        Ok(task)
    }

    /// Reactivate a paused task, scheduling from the current instant.
    pub async fn resume_task(&self, user_id: &str, task_id: &str) -> Result<ScheduledTask> {
        let task = self
            .modify_task(user_id, task_id, |task, now| match task.status {
                TaskStatus::Active => Ok(false),
                TaskStatus::Disabled => Err(SchedulerError::Conflict(format!(
                    "task {task_id} is disabled; reactivate it with an update"
                ))),
                TaskStatus::Paused => {
                    task.next_run_at = Some(next_run(&task.cron_expression, &task.timezone, now)?);
                    task.status = TaskStatus::Active;
                    Ok(true)
                }
            })
            .await?;
        info!(task_id, user_id, next_run_at = ?task.next_run_at, "Task resumed");
        Ok(task)
    }

    /// Take a task out of rotation until an update sets it active again.
    pub async fn disable_task(&self, user_id: &str, task_id: &str) -> Result<ScheduledTask> {
        let task = self
            .modify_task(user_id, task_id, |task, _| {
                if task.status == TaskStatus::Disabled {
                    return Ok(false);
                }
                task.status = TaskStatus::Disabled;
                task.next_run_at = None;
                Ok(true)
            })
            .await?;
        info!(task_id, user_id, "Task disabled");
        Ok(task)
    }

    /// Start an execution immediately, outside the schedule.
    ///
    /// Leaves `next_run_at`, `last_run_at` and `run_count` alone. Fails with
    /// [`SchedulerError::Conflict`] while another execution of the task is
    /// pending or running. A failed handoff is recorded on the returned
    /// execution rather than raised.
    pub async fn run_task_now(
        &self,
        user_id: &str,
        task_id: &str,
    ) -> Result<ScheduledTaskExecution> {
        let task = self.get_task(user_id, task_id).await?;
        let now = self.clock.now();
        let execution = ScheduledTaskExecution::pending(&task, ExecutionTrigger::Manual, now, now);

        let inserted = self
            .retry
            .run("insert_execution_if_idle", || {
                self.store.insert_execution_if_idle(&execution)
            })
            .await?;
        if !inserted {
            return Err(SchedulerError::Conflict(format!(
                "task {task_id} already has an execution in flight"
            )));
        }
        info!(task_id, execution_id = %execution.id, user_id, "Manual run requested");

        match self.executor.submit(execution.to_request()).await {
            Ok(()) => {
                let execution_id = execution.id.clone();
                match mark_handed_off(
                    self.store.as_ref(),
                    &self.retry,
                    self.clock.as_ref(),
                    execution.clone(),
                )
                .await
                {
                    Ok(marked) => Ok(marked),
                    Err(e) => {
                        warn!(task_id, execution_id = %execution_id, error = %e, "Could not record handoff");
                        Ok(execution)
                    }
                }
            }
            Err(e) => {
                warn!(task_id, execution_id = %execution.id, error = %e, "Executor handoff failed");
                fail_handoff(
                    self.store.as_ref(),
                    &self.retry,
                    self.clock.as_ref(),
                    execution,
                    &e,
                )
                .await
            }
        }
    }

    /// A task's executions, most recent occurrence first. Defaults to the
    /// configured history limit. History of a deleted task stays readable.
    pub async fn list_executions(
        &self,
        user_id: &str,
        task_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<ScheduledTaskExecution>> {
        let task = self
            .retry
            .run("get_task", || self.store.get_task(task_id))
            .await?;
        if task.is_some_and(|t| t.user_id != user_id) {
            return Err(not_found(task_id));
        }
        let limit = limit.unwrap_or(self.config.execution_history_limit);
        let mut executions = self
            .retry
            .run("list_executions", || self.store.list_executions(task_id, limit))
            .await?;
        executions.retain(|e| e.user_id == user_id);
        Ok(executions)
    }

    /// The user's executions across all tasks, most recent occurrence first.
    pub async fn list_user_executions(
        &self,
        user_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<ScheduledTaskExecution>> {
        let limit = limit.unwrap_or(self.config.user_history_limit);
        self.retry
            .run("list_user_executions", || {
                self.store.list_user_executions(user_id, limit)
            })
            .await
    }

    pub async fn get_execution(
        &self,
        user_id: &str,
        execution_id: &str,
    ) -> Result<ScheduledTaskExecution> {
        let execution = self
            .retry
            .run("get_execution", || self.store.get_execution(execution_id))
            .await?;
        match execution {
            Some(e) if e.user_id == user_id => Ok(e),
            _ => Err(SchedulerError::NotFound(format!("execution {execution_id}"))),
        }
    }

    /// Tasks grouped by status plus in-flight executions, read fresh.
    pub async fn overview(&self, user_id: &str) -> Result<TaskOverview> {
        let tasks = self.list_tasks(user_id).await?;
        let in_flight = self
            .retry
            .run("list_in_flight_executions", || {
                self.store.list_in_flight_executions(user_id)
            })
            .await?;
        Ok(TaskOverview::build(tasks, in_flight))
    }

    /// Read-modify-write a task with optimistic concurrency.
    ///
    /// `apply` returns `Ok(false)` when nothing needs writing. Conflicting
    /// writers cause a fresh read and another attempt, up to the retry limit.
    async fn modify_task<F>(&self, user_id: &str, task_id: &str, mut apply: F) -> Result<ScheduledTask>
    where
        F: FnMut(&mut ScheduledTask, DateTime<Utc>) -> Result<bool>,
    {
        for attempt in 0..self.retry.max_attempts() {
            let mut task = self.get_task(user_id, task_id).await?;
            let now = self.clock.now();
            if !apply(&mut task, now)? {
                return Ok(task);
            }
            task.updated_at = now;
            if self
                .retry
                .run("update_task", || self.store.update_task(&task))
                .await?
            {
                task.version += 1;
                return Ok(task);
            }
            debug!(task_id, attempt, "Task changed concurrently, retrying");
            self.retry.backoff(attempt).await;
        }
        Err(SchedulerError::Conflict(format!(
            "task {task_id} kept changing; try again"
        )))
    }
}

fn not_found(task_id: &str) -> SchedulerError {
    SchedulerError::NotFound(format!("task {task_id}"))
}

fn next_run(cron_expression: &str, timezone: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
    Ok(Recurrence::parse(cron_expression, timezone)?.next_after(after)?)
}

fn required(field: &str, value: &str) -> Result<String> {
    let value = value.trim();
    if value.is_empty() {
        return Err(SchedulerError::Validation(format!("{field} must not be empty")));
    }
    Ok(value.to_string())
}

fn optional(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

fn validate_notification(config: &NotificationConfig) -> Result<()> {
    if config.notification_type != NotificationType::Email {
        return Ok(());
    }
    match config.email.as_deref() {
        Some(address) if plausible_email(address) => Ok(()),
        _ => Err(SchedulerError::Validation(
            "email notification requires a valid email address".into(),
        )),
    }
}

fn plausible_email(address: &str) -> bool {
    if address.chars().any(char::is_whitespace) {
        return false;
    }
    match address.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.contains('@')
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Harness, at};
    use cadence_types::ExecutionStatus;
    use chrono::{Duration, TimeZone};

    fn draft() -> TaskDraft {
        TaskDraft::new("Morning digest", "0 9 * * *", "Summarise my inbox")
    }

    #[tokio::test]
    async fn test_create_task() {
        let h = Harness::new();
        let mut d = draft();
        d.description = Some("  ".into());
        d.attachments = vec!["file://notes.md".into()];
        let task = h.controller.create_task("alice", d).await.unwrap();

        assert_eq!(task.status, TaskStatus::Active);
        assert_eq!(task.run_count, 0);
        assert_eq!(task.timezone, "UTC");
        assert_eq!(task.description, None);
        assert_eq!(task.next_run_at, Some(at(9, 0)));
        assert!(task.payload.save_result);
        assert_eq!(task.payload.attachments, vec!["file://notes.md".to_string()]);

        let stored = h.store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored, task);
    }

    #[tokio::test]
    async fn test_create_in_named_timezone() {
        let h = Harness::new();
        let task = h
            .controller
            .create_task("alice", draft().with_timezone("America/New_York"))
            .await
            .unwrap();
        // 09:00 EST on 2026-03-02.
        assert_eq!(
            task.next_run_at,
            Some(Utc.with_ymd_and_hms(2026, 3, 2, 14, 0, 0).unwrap())
        );
    }

    #[tokio::test]
    async fn test_create_validation() {
        let h = Harness::new();
        let mut cases = vec![
            TaskDraft::new("", "0 9 * * *", "prompt"),
            TaskDraft::new("name", "0 9 * * *", "   "),
            TaskDraft::new("name", "0 9 * *", "prompt"),
            TaskDraft::new("name", "0 25 * * *", "prompt"),
            TaskDraft::new("name", "0 0 31 2 *", "prompt"),
            draft().with_timezone("Nowhere/Special"),
        ];
        let mut bad_email = draft();
        bad_email.notification = NotificationConfig::email("not-an-address");
        cases.push(bad_email);
        let mut missing_email = draft();
        missing_email.notification.notification_type = NotificationType::Email;
        cases.push(missing_email);

        for d in cases {
            let err = h.controller.create_task("alice", d).await.unwrap_err();
            assert!(matches!(err, SchedulerError::Validation(_)), "{err}");
        }
        assert!(h.controller.list_tasks("alice").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_retries_transient_store_errors() {
        let h = Harness::new();
        h.store.inject_transient_failures(2);
        let task = h.controller.create_task("alice", draft()).await.unwrap();
        assert!(h.store.get_task(&task.id).await.unwrap().is_some());

        h.store.inject_transient_failures(10);
        let err = h.controller.create_task("alice", draft()).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_tasks_are_scoped_to_owner() {
        let h = Harness::new();
        let task = h.controller.create_task("alice", draft()).await.unwrap();
        h.controller.create_task("bob", draft()).await.unwrap();

        assert_eq!(h.controller.list_tasks("alice").await.unwrap().len(), 1);
        for result in [
            h.controller.get_task("bob", &task.id).await,
            h.controller.pause_task("bob", &task.id).await,
            h.controller
                .update_task("bob", &task.id, TaskUpdate::default())
                .await,
        ] {
            assert!(matches!(result, Err(SchedulerError::NotFound(_))));
        }
        assert!(matches!(
            h.controller.delete_task("bob", &task.id).await,
            Err(SchedulerError::NotFound(_))
        ));
        assert!(matches!(
            h.controller.run_task_now("bob", &task.id).await,
            Err(SchedulerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_update_without_schedule_change_keeps_next_run() {
        let h = Harness::new();
        let task = h.controller.create_task("alice", draft()).await.unwrap();
        h.clock.advance(Duration::minutes(20));

        let update = TaskUpdate {
            name: Some("Evening digest".into()),
            prompt: Some("Summarise everything".into()),
            save_result: Some(false),
            ..Default::default()
        };
        let updated = h.controller.update_task("alice", &task.id, update).await.unwrap();
        assert_eq!(updated.name, "Evening digest");
        assert_eq!(updated.payload.prompt, "Summarise everything");
        assert!(!updated.payload.save_result);
        assert_eq!(updated.next_run_at, task.next_run_at);
        assert_eq!(updated.version, task.version + 1);
        assert_eq!(updated.updated_at, at(8, 50));
        assert_eq!(updated.created_at, task.created_at);
    }

    #[tokio::test]
    async fn test_update_schedule_recomputes_from_now() {
        let h = Harness::new();
        let task = h.controller.create_task("alice", draft()).await.unwrap();
        h.clock.set(at(10, 5));

        let update = TaskUpdate {
            cron_expression: Some("*/30 * * * *".into()),
            ..Default::default()
        };
        let updated = h.controller.update_task("alice", &task.id, update).await.unwrap();
        assert_eq!(updated.next_run_at, Some(at(10, 30)));

        let update = TaskUpdate {
            timezone: Some("Asia/Tokyo".into()),
            cron_expression: Some("0 9 * * *".into()),
            ..Default::default()
        };
        let updated = h.controller.update_task("alice", &task.id, update).await.unwrap();
        // 09:00 JST on 2026-03-03 is 00:00 UTC.
        assert_eq!(
            updated.next_run_at,
            Some(Utc.with_ymd_and_hms(2026, 3, 3, 0, 0, 0).unwrap())
        );
    }

    #[tokio::test]
    async fn test_update_rejects_bad_input() {
        let h = Harness::new();
        let task = h.controller.create_task("alice", draft()).await.unwrap();

        for update in [
            TaskUpdate {
                cron_expression: Some("every day".into()),
                ..Default::default()
            },
            TaskUpdate {
                timezone: Some("Mars/Base".into()),
                ..Default::default()
            },
            TaskUpdate {
                name: Some(" ".into()),
                ..Default::default()
            },
        ] {
            let err = h.controller.update_task("alice", &task.id, update).await.unwrap_err();
            assert!(matches!(err, SchedulerError::Validation(_)));
        }
        assert_eq!(h.store.get_task(&task.id).await.unwrap().unwrap(), task);

        let err = h
            .controller
            .update_task("alice", "missing", TaskUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_update_schedule_of_paused_task() {
        let h = Harness::new();
        let task = h.controller.create_task("alice", draft()).await.unwrap();
        h.controller.pause_task("alice", &task.id).await.unwrap();

        let update = TaskUpdate {
            cron_expression: Some("0 12 * * *".into()),
            ..Default::default()
        };
        let updated = h.controller.update_task("alice", &task.id, update).await.unwrap();
        assert_eq!(updated.status, TaskStatus::Paused);
        assert_eq!(updated.next_run_at, None);

        let resumed = h.controller.resume_task("alice", &task.id).await.unwrap();
        assert_eq!(resumed.next_run_at, Some(at(12, 0)));
    }

    #[tokio::test]
    async fn test_pause_is_idempotent() {
        let h = Harness::new();
        let task = h.controller.create_task("alice", draft()).await.unwrap();

        let paused = h.controller.pause_task("alice", &task.id).await.unwrap();
        assert_eq!(paused.status, TaskStatus::Paused);
        assert_eq!(paused.next_run_at, None);

        let again = h.controller.pause_task("alice", &task.id).await.unwrap();
        assert_eq!(again, paused);
        assert_eq!(h.store.get_task(&task.id).await.unwrap().unwrap(), paused);
    }

    #[tokio::test]
    async fn test_resume_recomputes_from_now() {
        let h = Harness::new();
        let task = h.controller.create_task("alice", draft()).await.unwrap();
        h.controller.pause_task("alice", &task.id).await.unwrap();

        // The 09:00 occurrence passes while paused.
        h.clock.set(at(9, 30));
        let resumed = h.controller.resume_task("alice", &task.id).await.unwrap();
        assert_eq!(resumed.status, TaskStatus::Active);
        assert_eq!(
            resumed.next_run_at,
            Some(Utc.with_ymd_and_hms(2026, 3, 3, 9, 0, 0).unwrap())
        );

        // Resuming an active task keeps its schedule.
        h.clock.advance(Duration::hours(1));
        let again = h.controller.resume_task("alice", &task.id).await.unwrap();
        assert_eq!(again, resumed);
    }

    #[tokio::test]
    async fn test_disable_and_reactivate() {
        let h = Harness::new();
        let task = h.controller.create_task("alice", draft()).await.unwrap();

        let disabled = h.controller.disable_task("alice", &task.id).await.unwrap();
        assert_eq!(disabled.status, TaskStatus::Disabled);
        assert_eq!(disabled.next_run_at, None);

        let err = h.controller.resume_task("alice", &task.id).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Conflict(_)));

        // Pausing does not sneak a disabled task back into rotation.
        let still = h.controller.pause_task("alice", &task.id).await.unwrap();
        assert_eq!(still.status, TaskStatus::Disabled);

        h.clock.set(at(9, 15));
        let update = TaskUpdate {
            status: Some(TaskStatus::Active),
            ..Default::default()
        };
        let active = h.controller.update_task("alice", &task.id, update).await.unwrap();
        assert_eq!(active.status, TaskStatus::Active);
        assert_eq!(
            active.next_run_at,
            Some(Utc.with_ymd_and_hms(2026, 3, 3, 9, 0, 0).unwrap())
        );
    }

    #[tokio::test]
    async fn test_delete_keeps_execution_history() {
        let h = Harness::new();
        let task = h.controller.create_task("alice", draft()).await.unwrap();
        let execution = h.controller.run_task_now("alice", &task.id).await.unwrap();

        h.controller.delete_task("alice", &task.id).await.unwrap();
        assert!(matches!(
            h.controller.get_task("alice", &task.id).await,
            Err(SchedulerError::NotFound(_))
        ));
        assert!(matches!(
            h.controller.delete_task("alice", &task.id).await,
            Err(SchedulerError::NotFound(_))
        ));

        let history = h
            .controller
            .list_executions("alice", &task.id, None)
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, execution.id);
        assert!(h
            .controller
            .list_executions("bob", &task.id, None)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_run_now_leaves_schedule_alone() {
        let h = Harness::new();
        let task = h.controller.create_task("alice", draft()).await.unwrap();
        h.clock.advance(Duration::minutes(3));

        let execution = h.controller.run_task_now("alice", &task.id).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Pending);
        assert_eq!(execution.trigger, ExecutionTrigger::Manual);
        assert_eq!(execution.scheduled_at, at(8, 33));
        assert_eq!(execution.payload, task.payload);
        assert_eq!(execution.handed_off_at, Some(at(8, 33)));

        let stored = h.store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.next_run_at, task.next_run_at);
        assert_eq!(stored.last_run_at, None);
        assert_eq!(stored.run_count, 0);
        assert_eq!(stored.version, task.version);

        let submitted = h.executor.submitted();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].execution_id, execution.id);
    }

    #[tokio::test]
    async fn test_second_run_now_conflicts() {
        let h = Harness::new();
        let task = h.controller.create_task("alice", draft()).await.unwrap();

        h.controller.run_task_now("alice", &task.id).await.unwrap();
        let err = h.controller.run_task_now("alice", &task.id).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Conflict(_)));
        assert_eq!(h.executor.submitted().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_run_now_admits_one() {
        let h = Harness::new();
        let task = h.controller.create_task("alice", draft()).await.unwrap();

        let results = futures::future::join_all(
            (0..8).map(|_| h.controller.run_task_now("alice", &task.id)),
        )
        .await;
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(h.executor.submitted().len(), 1);
    }

    #[tokio::test]
    async fn test_run_now_handoff_failure() {
        let h = Harness::new();
        let task = h.controller.create_task("alice", draft()).await.unwrap();
        h.executor.fail_submissions(true);

        let execution = h.controller.run_task_now("alice", &task.id).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert!(execution
            .error_message
            .as_deref()
            .unwrap()
            .contains("handoff"));
        assert!(execution.completed_at.is_some());

        // Nothing is in flight afterwards.
        h.executor.fail_submissions(false);
        let retry = h.controller.run_task_now("alice", &task.id).await.unwrap();
        assert_eq!(retry.status, ExecutionStatus::Pending);
    }

    #[tokio::test]
    async fn test_execution_listing_limits() {
        let h = Harness::new();
        let task = h.controller.create_task("alice", draft()).await.unwrap();
        for _ in 0..3 {
            let e = h.controller.run_task_now("alice", &task.id).await.unwrap();
            let mut done = h.store.get_execution(&e.id).await.unwrap().unwrap();
            done.status = ExecutionStatus::Cancelled;
            h.store.update_execution(&done).await.unwrap();
            h.clock.advance(Duration::minutes(1));
        }

        let recent = h
            .controller
            .list_executions("alice", &task.id, Some(2))
            .await
            .unwrap();
        assert_eq!(recent.len(), 2);
        assert!(recent[0].scheduled_at > recent[1].scheduled_at);

        let all = h.controller.list_user_executions("alice", None).await.unwrap();
        assert_eq!(all.len(), 3);
        assert!(h.controller.list_user_executions("bob", None).await.unwrap().is_empty());

        let fetched = h.controller.get_execution("alice", &all[0].id).await.unwrap();
        assert_eq!(fetched.id, all[0].id);
        assert!(h.controller.get_execution("bob", &all[0].id).await.is_err());
    }

    #[test]
    fn test_plausible_email() {
        assert!(plausible_email("a@example.com"));
        assert!(!plausible_email("a@b"));
        assert!(!plausible_email("@example.com"));
        assert!(!plausible_email("a b@example.com"));
        assert!(!plausible_email("a@@example.com"));
    }
}
