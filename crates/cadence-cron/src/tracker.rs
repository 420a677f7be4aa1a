//! Applies executor lifecycle signals to execution records.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use cadence_storage::TaskStore;
use cadence_types::{
    ExecutionStatus, LifecycleEvent, LifecycleSignal, ScheduledTask, ScheduledTaskExecution,
};

use crate::clock::Clock;
use crate::error::{Result, SchedulerError};
use crate::executor::{Executor, HandoffError};
use crate::notifier::{Notifier, TaskNotification};
use crate::retry::RetryPolicy;

/// Result of applying one signal.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalOutcome {
    /// The execution moved to a new status.
    Applied(ScheduledTaskExecution),
    /// The execution was already in the signalled status; nothing changed.
    Duplicate(ScheduledTaskExecution),
}

impl SignalOutcome {
    pub fn execution(&self) -> &ScheduledTaskExecution {
        match self {
            Self::Applied(e) | Self::Duplicate(e) => e,
        }
    }
}

/// Result of a cancel request.
#[derive(Debug, Clone, PartialEq)]
pub struct CancelOutcome {
    pub execution: ScheduledTaskExecution,
    /// Whether the executor confirmed it stopped the job.
    pub acknowledged: bool,
}

pub struct ExecutionTracker {
    store: Arc<dyn TaskStore>,
    executor: Arc<dyn Executor>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl ExecutionTracker {
    pub fn new(
        store: Arc<dyn TaskStore>,
        executor: Arc<dyn Executor>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            executor,
            notifier,
            clock,
            retry,
        }
    }

    /// Validate `signal` against the execution state machine and persist it.
    ///
    /// A signal for the status the execution is already in is a no-op. Any
    /// other illegal transition is rejected and the record left unchanged.
    pub async fn apply(&self, signal: &LifecycleSignal) -> Result<SignalOutcome> {
        let execution_id = signal.execution_id.as_str();
        let target = signal.event.target_status();

        for attempt in 0..self.retry.max_attempts() {
            let mut execution = self.load(execution_id).await?;
            if execution.status == target {
                debug!(execution_id, status = %target, "Duplicate lifecycle signal ignored");
                return Ok(SignalOutcome::Duplicate(execution));
            }
            if !execution.status.can_transition_to(target) {
                warn!(
                    execution_id,
                    from = %execution.status,
                    to = %target,
                    "Rejected lifecycle signal"
                );
                return Err(SchedulerError::InvalidTransition {
                    execution_id: execution_id.to_string(),
                    from: execution.status,
                    to: target,
                });
            }

            apply_event(&mut execution, &signal.event, self.clock.now());
            if self
                .retry
                .run("update_execution", || self.store.update_execution(&execution))
                .await?
            {
                execution.version += 1;
                info!(
                    execution_id,
                    task_id = %execution.task_id,
                    status = %execution.status,
                    "Execution transitioned"
                );
                self.after_transition(&execution).await;
                return Ok(SignalOutcome::Applied(execution));
            }
            debug!(execution_id, attempt, "Execution changed concurrently, retrying");
            self.retry.backoff(attempt).await;
        }

        Err(SchedulerError::Conflict(format!(
            "execution {execution_id} kept changing"
        )))
    }

    /// Ask the executor to stop an execution owned by `user_id`.
    ///
    /// If the executor acknowledges, the execution is cancelled at once.
    /// Otherwise it keeps its status and is marked `cancel_requested`, to be
    /// settled by whatever terminal signal the executor sends later.
    pub async fn request_cancel(&self, user_id: &str, execution_id: &str) -> Result<CancelOutcome> {
        let execution = self.load(execution_id).await?;
        if execution.user_id != user_id {
            return Err(not_found(execution_id));
        }
        if execution.status.is_terminal() {
            return Err(SchedulerError::Conflict(format!(
                "execution {execution_id} is already {}",
                execution.status
            )));
        }

        let acknowledged = match self.executor.cancel(execution_id).await {
            Ok(acknowledged) => acknowledged,
            Err(e) => {
                warn!(execution_id, error = %e, "Cancel request not delivered");
                false
            }
        };

        if acknowledged {
            let signal = LifecycleSignal::new(execution_id, LifecycleEvent::Cancelled);
            let execution = match self.apply(&signal).await {
                Ok(outcome) => outcome.execution().clone(),
                // Finished on its own before the cancel landed.
                Err(SchedulerError::InvalidTransition { .. }) => self.load(execution_id).await?,
                Err(e) => return Err(e),
            };
            return Ok(CancelOutcome {
                execution,
                acknowledged,
            });
        }

        for attempt in 0..self.retry.max_attempts() {
            let mut execution = self.load(execution_id).await?;
            if execution.status.is_terminal() || execution.cancel_requested {
                return Ok(CancelOutcome {
                    execution,
                    acknowledged,
                });
            }
            execution.cancel_requested = true;
            execution.updated_at = self.clock.now();
            if self
                .retry
                .run("update_execution", || self.store.update_execution(&execution))
                .await?
            {
                execution.version += 1;
                info!(execution_id, "Cancel requested; waiting for the executor");
                return Ok(CancelOutcome {
                    execution,
                    acknowledged,
                });
            }
            self.retry.backoff(attempt).await;
        }

        Err(SchedulerError::Conflict(format!(
            "execution {execution_id} kept changing"
        )))
    }

    /// Consume signals until the channel closes or `cancel` fires.
    pub async fn run(&self, mut signals: mpsc::Receiver<LifecycleSignal>, cancel: CancellationToken) {
        info!("Execution tracker started");
        loop {
            let signal = tokio::select! {
                _ = cancel.cancelled() => break,
                signal = signals.recv() => match signal {
                    Some(signal) => signal,
                    None => break,
                },
            };
            match self.apply(&signal).await {
                Ok(_) | Err(SchedulerError::InvalidTransition { .. }) => {}
                Err(e) => warn!(
                    execution_id = %signal.execution_id,
                    error = %e,
                    "Failed to apply lifecycle signal"
                ),
            }
        }
        info!("Execution tracker stopped");
    }

    async fn load(&self, execution_id: &str) -> Result<ScheduledTaskExecution> {
        self.retry
            .run("get_execution", || self.store.get_execution(execution_id))
            .await?
            .ok_or_else(|| not_found(execution_id))
    }

    async fn after_transition(&self, execution: &ScheduledTaskExecution) {
        let task = match execution.status {
            ExecutionStatus::Running => match &execution.session_id {
                Some(session_id) => {
                    self.touch_task(execution, |t| t.last_session_id = Some(session_id.clone()))
                        .await
                }
                None => None,
            },
            ExecutionStatus::Completed => self.touch_task(execution, |t| t.failure_count = 0).await,
            ExecutionStatus::Failed => {
                self.touch_task(execution, |t| t.failure_count = t.failure_count.saturating_add(1))
                    .await
            }
            ExecutionStatus::Pending | ExecutionStatus::Cancelled => None,
        };

        if matches!(
            execution.status,
            ExecutionStatus::Completed | ExecutionStatus::Failed
        ) {
            let name = task.as_ref().map_or(execution.task_id.as_str(), |t| t.name.as_str());
            self.notify(execution, name);
        }
    }

    /// Best-effort bookkeeping on the owning task. A deleted task is skipped.
    async fn touch_task<F>(&self, execution: &ScheduledTaskExecution, mutate: F) -> Option<ScheduledTask>
    where
        F: Fn(&mut ScheduledTask),
    {
        let task_id = execution.task_id.as_str();
        for attempt in 0..self.retry.max_attempts() {
            let mut task = match self.retry.run("get_task", || self.store.get_task(task_id)).await {
                Ok(Some(task)) if task.user_id == execution.user_id => task,
                Ok(_) => return None,
                Err(e) => {
                    warn!(task_id, error = %e, "Could not load task for bookkeeping");
                    return None;
                }
            };
            mutate(&mut task);
            task.updated_at = self.clock.now();
            match self.retry.run("update_task", || self.store.update_task(&task)).await {
                Ok(true) => {
                    task.version += 1;
                    return Some(task);
                }
                Ok(false) => self.retry.backoff(attempt).await,
                Err(e) => {
                    warn!(task_id, error = %e, "Could not update task bookkeeping");
                    return None;
                }
            }
        }
        warn!(task_id, "Gave up on task bookkeeping after repeated conflicts");
        None
    }

    fn notify(&self, execution: &ScheduledTaskExecution, task_name: &str) {
        let Some(notification) = TaskNotification::for_execution(execution, task_name) else {
            return;
        };
        let notifier = Arc::clone(&self.notifier);
        tokio::spawn(async move {
            if let Err(e) = notifier.notify(&notification).await {
                warn!(
                    execution_id = %notification.execution_id,
                    recipient = %notification.recipient,
                    error = %e,
                    "Notification failed"
                );
            }
        });
    }
}

fn not_found(execution_id: &str) -> SchedulerError {
    SchedulerError::NotFound(format!("execution {execution_id}"))
}

/// Keep `scheduled_at <= started_at <= completed_at` under clock skew.
fn start_time(execution: &ScheduledTaskExecution, now: DateTime<Utc>) -> DateTime<Utc> {
    now.max(execution.scheduled_at)
}

fn finish_time(execution: &ScheduledTaskExecution, now: DateTime<Utc>) -> DateTime<Utc> {
    let floor = execution
        .started_at
        .map_or(execution.scheduled_at, |s| s.max(execution.scheduled_at));
    now.max(floor)
}

fn apply_event(execution: &mut ScheduledTaskExecution, event: &LifecycleEvent, now: DateTime<Utc>) {
    match event {
        LifecycleEvent::Started { session_id } => {
            execution.started_at = Some(start_time(execution, now));
            if session_id.is_some() {
                execution.session_id = session_id.clone();
            }
        }
        LifecycleEvent::Completed { result_summary } => {
            execution.completed_at = Some(finish_time(execution, now));
            execution.result_summary = result_summary.clone();
        }
        LifecycleEvent::Failed { error } => {
            execution.completed_at = Some(finish_time(execution, now));
            execution.error_message = Some(error.clone());
        }
        LifecycleEvent::Cancelled => {
            execution.completed_at = Some(finish_time(execution, now));
        }
    }
    execution.status = event.target_status();
    execution.updated_at = now;
}

/// Record that the executor accepted a pending execution.
pub(crate) async fn mark_handed_off(
    store: &dyn TaskStore,
    retry: &RetryPolicy,
    clock: &dyn Clock,
    mut execution: ScheduledTaskExecution,
) -> Result<ScheduledTaskExecution> {
    for attempt in 0..retry.max_attempts() {
        // The executor may already have reported progress.
        if execution.status != ExecutionStatus::Pending || execution.handed_off_at.is_some() {
            return Ok(execution);
        }
        let now = clock.now();
        let mut marked = execution.clone();
        marked.handed_off_at = Some(now);
        marked.updated_at = now;
        if retry
            .run("update_execution", || store.update_execution(&marked))
            .await?
        {
            marked.version += 1;
            return Ok(marked);
        }
        execution = retry
            .run("get_execution", || store.get_execution(&marked.id))
            .await?
            .ok_or_else(|| not_found(&marked.id))?;
        retry.backoff(attempt).await;
    }
    Err(SchedulerError::Conflict(format!(
        "execution {} kept changing",
        execution.id
    )))
}

/// Record a failed handoff on an execution the executor never accepted.
///
/// Executions that moved on, or were marked handed off meanwhile, are
/// returned unchanged.
pub(crate) async fn fail_handoff(
    store: &dyn TaskStore,
    retry: &RetryPolicy,
    clock: &dyn Clock,
    mut execution: ScheduledTaskExecution,
    error: &HandoffError,
) -> Result<ScheduledTaskExecution> {
    for attempt in 0..retry.max_attempts() {
        if execution.status != ExecutionStatus::Pending || execution.handed_off_at.is_some() {
            return Ok(execution);
        }
        let mut failed = execution.clone();
        apply_event(
            &mut failed,
            &LifecycleEvent::Failed {
                error: format!("executor handoff failed: {error}"),
            },
            clock.now(),
        );
        if retry
            .run("update_execution", || store.update_execution(&failed))
            .await?
        {
            failed.version += 1;
            return Ok(failed);
        }
        execution = retry
            .run("get_execution", || store.get_execution(&failed.id))
            .await?
            .ok_or_else(|| not_found(&failed.id))?;
        retry.backoff(attempt).await;
    }
    Err(SchedulerError::Conflict(format!(
        "execution {} kept changing",
        execution.id
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Harness;
    use cadence_types::{ExecutionTrigger, NotificationConfig, TaskDraft};
    use chrono::Duration;

    fn started(id: &str, session: &str) -> LifecycleSignal {
        LifecycleSignal::new(
            id,
            LifecycleEvent::Started {
                session_id: Some(session.into()),
            },
        )
    }

    fn completed(id: &str) -> LifecycleSignal {
        LifecycleSignal::new(
            id,
            LifecycleEvent::Completed {
                result_summary: Some("all good".into()),
            },
        )
    }

    fn failed(id: &str) -> LifecycleSignal {
        LifecycleSignal::new(id, LifecycleEvent::Failed { error: "boom".into() })
    }

    async fn manual_run(h: &Harness) -> (ScheduledTask, ScheduledTaskExecution) {
        let task = h
            .controller
            .create_task("alice", TaskDraft::new("digest", "0 9 * * *", "summarise"))
            .await
            .unwrap();
        let execution = h.controller.run_task_now("alice", &task.id).await.unwrap();
        (task, execution)
    }

    fn assert_ordered(e: &ScheduledTaskExecution) {
        if let Some(started) = e.started_at {
            assert!(e.scheduled_at <= started);
            if let Some(done) = e.completed_at {
                assert!(started <= done);
            }
        }
        if let Some(done) = e.completed_at {
            assert!(e.scheduled_at <= done);
        }
    }

    #[tokio::test]
    async fn test_started_then_completed() {
        let h = Harness::new();
        let (task, execution) = manual_run(&h).await;

        h.clock.advance(Duration::seconds(5));
        let outcome = h.tracker.apply(&started(&execution.id, "s-1")).await.unwrap();
        let running = outcome.execution().clone();
        assert!(matches!(outcome, SignalOutcome::Applied(_)));
        assert_eq!(running.status, ExecutionStatus::Running);
        assert_eq!(running.session_id.as_deref(), Some("s-1"));

        h.clock.advance(Duration::seconds(30));
        let outcome = h.tracker.apply(&completed(&execution.id)).await.unwrap();
        let done = outcome.execution();
        assert_eq!(done.status, ExecutionStatus::Completed);
        assert_eq!(done.result_summary.as_deref(), Some("all good"));
        assert_eq!(done.started_at, Some(execution.scheduled_at + Duration::seconds(5)));
        assert_eq!(done.completed_at, Some(execution.scheduled_at + Duration::seconds(35)));
        assert_ordered(done);

        let stored = h.store.get_execution(&execution.id).await.unwrap().unwrap();
        assert_eq!(&stored, done);

        let task = h.controller.get_task("alice", &task.id).await.unwrap();
        assert_eq!(task.last_session_id.as_deref(), Some("s-1"));
        assert_eq!(task.failure_count, 0);
    }

    #[tokio::test]
    async fn test_duplicate_signal_is_noop() {
        let h = Harness::new();
        let (_, execution) = manual_run(&h).await;

        h.tracker.apply(&started(&execution.id, "s-1")).await.unwrap();
        let before = h.store.get_execution(&execution.id).await.unwrap().unwrap();

        h.clock.advance(Duration::minutes(1));
        let outcome = h.tracker.apply(&started(&execution.id, "s-2")).await.unwrap();
        assert!(matches!(outcome, SignalOutcome::Duplicate(_)));

        let after = h.store.get_execution(&execution.id).await.unwrap().unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_illegal_transitions_are_rejected() {
        let h = Harness::new();
        let (_, execution) = manual_run(&h).await;

        // Pending cannot complete without starting.
        let err = h.tracker.apply(&completed(&execution.id)).await.unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::InvalidTransition {
                from: ExecutionStatus::Pending,
                to: ExecutionStatus::Completed,
                ..
            }
        ));
        let stored = h.store.get_execution(&execution.id).await.unwrap().unwrap();
        assert_eq!(stored, execution);

        h.tracker.apply(&started(&execution.id, "s-1")).await.unwrap();
        h.tracker.apply(&completed(&execution.id)).await.unwrap();
        let settled = h.store.get_execution(&execution.id).await.unwrap().unwrap();

        // Late signals after a terminal state change nothing.
        for late in [started(&execution.id, "s-9"), failed(&execution.id)] {
            assert!(h.tracker.apply(&late).await.is_err());
        }
        assert_eq!(
            h.store.get_execution(&execution.id).await.unwrap().unwrap(),
            settled
        );
    }

    #[tokio::test]
    async fn test_unknown_execution() {
        let h = Harness::new();
        let err = h.tracker.apply(&started("nope", "s")).await.unwrap_err();
        assert!(matches!(err, SchedulerError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_failure_before_start_counts_and_notifies() {
        let h = Harness::new();
        let mut draft = TaskDraft::new("digest", "0 9 * * *", "summarise");
        draft.notification = NotificationConfig::email("alice@example.com");
        let task = h.controller.create_task("alice", draft).await.unwrap();

        let first = h.controller.run_task_now("alice", &task.id).await.unwrap();
        let outcome = h.tracker.apply(&failed(&first.id)).await.unwrap();
        assert_eq!(outcome.execution().status, ExecutionStatus::Failed);
        assert_eq!(outcome.execution().error_message.as_deref(), Some("boom"));
        assert_ordered(outcome.execution());

        let second = h.controller.run_task_now("alice", &task.id).await.unwrap();
        h.tracker.apply(&failed(&second.id)).await.unwrap();
        let reloaded = h.controller.get_task("alice", &task.id).await.unwrap();
        assert_eq!(reloaded.failure_count, 2);

        let sent = h.notifier.wait_for(2).await;
        assert_eq!(sent[0].recipient, "alice@example.com");
        assert_eq!(sent[0].task_name, "digest");
        assert_eq!(sent[0].status, ExecutionStatus::Failed);

        // A success resets the streak.
        let third = h.controller.run_task_now("alice", &task.id).await.unwrap();
        h.tracker.apply(&started(&third.id, "s-3")).await.unwrap();
        h.tracker.apply(&completed(&third.id)).await.unwrap();
        let reloaded = h.controller.get_task("alice", &task.id).await.unwrap();
        assert_eq!(reloaded.failure_count, 0);
        let sent = h.notifier.wait_for(3).await;
        assert_eq!(sent[2].result_summary.as_deref(), Some("all good"));
    }

    #[tokio::test]
    async fn test_notifier_failure_is_not_surfaced() {
        let h = Harness::new();
        h.notifier.fail_deliveries();
        let mut draft = TaskDraft::new("digest", "0 9 * * *", "summarise");
        draft.notification = NotificationConfig::email("alice@example.com");
        let task = h.controller.create_task("alice", draft).await.unwrap();
        let execution = h.controller.run_task_now("alice", &task.id).await.unwrap();

        let outcome = h.tracker.apply(&failed(&execution.id)).await.unwrap();
        assert_eq!(outcome.execution().status, ExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn test_no_notification_without_email() {
        let h = Harness::new();
        let (_, execution) = manual_run(&h).await;
        h.tracker.apply(&failed(&execution.id)).await.unwrap();
        tokio::task::yield_now().await;
        assert!(h.notifier.sent().is_empty());
    }

    #[tokio::test]
    async fn test_timestamps_clamped_under_clock_skew() {
        let h = Harness::new();
        let (_, execution) = manual_run(&h).await;

        // This instance's clock runs behind the one that dispatched.
        h.clock.set(execution.scheduled_at - Duration::minutes(3));
        let running = h.tracker.apply(&started(&execution.id, "s")).await.unwrap();
        assert_eq!(running.execution().started_at, Some(execution.scheduled_at));

        h.clock.set(execution.scheduled_at - Duration::minutes(10));
        let done = h.tracker.apply(&completed(&execution.id)).await.unwrap();
        assert_eq!(done.execution().completed_at, Some(execution.scheduled_at));
        assert_ordered(done.execution());
    }

    #[tokio::test]
    async fn test_signals_apply_after_task_deleted() {
        let h = Harness::new();
        let (task, execution) = manual_run(&h).await;
        h.controller.delete_task("alice", &task.id).await.unwrap();

        h.tracker.apply(&started(&execution.id, "s")).await.unwrap();
        let done = h.tracker.apply(&completed(&execution.id)).await.unwrap();
        assert_eq!(done.execution().status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_cancel_acknowledged() {
        let h = Harness::new();
        let (_, execution) = manual_run(&h).await;
        h.executor.acknowledge_cancels(true);

        let outcome = h.tracker.request_cancel("alice", &execution.id).await.unwrap();
        assert!(outcome.acknowledged);
        assert_eq!(outcome.execution.status, ExecutionStatus::Cancelled);
        assert!(outcome.execution.completed_at.is_some());
        assert_eq!(h.executor.cancelled(), vec![execution.id.clone()]);

        // The executor's own cancelled report arrives afterwards.
        let echo = LifecycleSignal::new(&execution.id, LifecycleEvent::Cancelled);
        let outcome = h.tracker.apply(&echo).await.unwrap();
        assert!(matches!(outcome, SignalOutcome::Duplicate(_)));
    }

    #[tokio::test]
    async fn test_cancel_unacknowledged_sets_marker() {
        let h = Harness::new();
        let (_, execution) = manual_run(&h).await;
        h.tracker.apply(&started(&execution.id, "s")).await.unwrap();

        let outcome = h.tracker.request_cancel("alice", &execution.id).await.unwrap();
        assert!(!outcome.acknowledged);
        assert_eq!(outcome.execution.status, ExecutionStatus::Running);
        assert!(outcome.execution.cancel_requested);

        // Asking again changes nothing.
        let again = h.tracker.request_cancel("alice", &execution.id).await.unwrap();
        assert_eq!(again.execution.version, outcome.execution.version);

        // A later terminal signal settles it.
        let done = h
            .tracker
            .apply(&LifecycleSignal::new(&execution.id, LifecycleEvent::Cancelled))
            .await
            .unwrap();
        assert_eq!(done.execution().status, ExecutionStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_rejections() {
        let h = Harness::new();
        let (_, execution) = manual_run(&h).await;

        let err = h.tracker.request_cancel("bob", &execution.id).await.unwrap_err();
        assert!(matches!(err, SchedulerError::NotFound(_)));

        h.tracker.apply(&failed(&execution.id)).await.unwrap();
        let err = h.tracker.request_cancel("alice", &execution.id).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_signal_loop_consumes_channel() {
        let h = Harness::new();
        let (task, execution) = manual_run(&h).await;
        // Paused tasks keep their in-flight executions.
        h.controller.pause_task("alice", &task.id).await.unwrap();

        let (tx, rx) = mpsc::channel(8);
        tx.send(started(&execution.id, "s")).await.unwrap();
        tx.send(completed(&execution.id)).await.unwrap();
        drop(tx);
        h.tracker.run(rx, CancellationToken::new()).await;

        let stored = h.store.get_execution(&execution.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_fail_handoff_skips_settled_execution() {
        let h = Harness::new();
        let (task, _) = manual_run(&h).await;
        // A stale, unmarked copy of an execution that has since finished.
        let now = h.clock.now();
        let execution = ScheduledTaskExecution::pending(&task, ExecutionTrigger::Schedule, now, now);
        h.store.insert_execution(&execution).await.unwrap();
        h.tracker.apply(&started(&execution.id, "s")).await.unwrap();
        h.tracker.apply(&completed(&execution.id)).await.unwrap();

        let err = HandoffError::Unavailable("down".into());
        let settled = fail_handoff(&*h.store, &h.retry, &*h.clock, execution, &err)
            .await
            .unwrap();
        assert_eq!(settled.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_mark_handed_off() {
        let h = Harness::new();
        let task = h
            .controller
            .create_task("alice", TaskDraft::new("digest", "0 9 * * *", "summarise"))
            .await
            .unwrap();
        let now = h.clock.now();
        let execution = ScheduledTaskExecution::pending(&task, ExecutionTrigger::Manual, now, now);
        h.store.insert_execution(&execution).await.unwrap();

        let marked = mark_handed_off(&*h.store, &h.retry, &*h.clock, execution.clone())
            .await
            .unwrap();
        assert_eq!(marked.handed_off_at, Some(h.clock.now()));

        // Marked executions are not failed by a late handoff error.
        let err = HandoffError::Unavailable("down".into());
        let kept = fail_handoff(&*h.store, &h.retry, &*h.clock, marked, &err)
            .await
            .unwrap();
        assert_eq!(kept.status, ExecutionStatus::Pending);

        // A stale copy re-reads and sees the start.
        h.tracker.apply(&started(&execution.id, "s")).await.unwrap();
        let unchanged = mark_handed_off(&*h.store, &h.retry, &*h.clock, execution)
            .await
            .unwrap();
        assert_eq!(unchanged.status, ExecutionStatus::Running);
    }
}
