//! Periodic coordinator that turns due occurrences into executions.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use cadence_config::SchedulerConfig;
use cadence_storage::TaskStore;
use cadence_types::{ExecutionStatus, ExecutionTrigger, ScheduledTask, ScheduledTaskExecution};

use crate::clock::Clock;
use crate::error::Result;
use crate::executor::{Executor, HandoffError};
use crate::recurrence::Recurrence;
use crate::retry::RetryPolicy;
use crate::tracker::{fail_handoff, mark_handed_off};

/// Counts from one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Tasks the store reported due.
    pub due: usize,
    /// Occurrences this coordinator claimed and recorded.
    pub dispatched: usize,
    /// Claims lost to another writer.
    pub skipped: usize,
    /// Dispatched executions the executor refused.
    pub handoff_failures: usize,
    /// Pending executions failed because their handoff was never recorded.
    pub abandoned: usize,
    /// Tasks that hit a store error.
    pub errors: usize,
}

enum Dispatch {
    Dispatched,
    HandoffFailed,
    Skipped,
}

pub struct DispatchLoop {
    store: Arc<dyn TaskStore>,
    executor: Arc<dyn Executor>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    coordinator_id: String,
    tick_interval: Duration,
    handoff_timeout: Duration,
}

impl DispatchLoop {
    pub fn new(
        store: Arc<dyn TaskStore>,
        executor: Arc<dyn Executor>,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            store,
            executor,
            clock,
            retry,
            coordinator_id: config.coordinator_id.clone(),
            tick_interval: config.tick_interval(),
            handoff_timeout: config.handoff_timeout(),
        }
    }

    pub fn coordinator_id(&self) -> &str {
        &self.coordinator_id
    }

    /// Tick until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            coordinator_id = %self.coordinator_id,
            interval_secs = self.tick_interval.as_secs(),
            "Dispatch loop started"
        );
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    self.tick().await;
                }
            }
        }
        info!(coordinator_id = %self.coordinator_id, "Dispatch loop stopped");
    }

    /// Dispatch every task due now. A failing task never stops the rest.
    pub async fn tick(&self) -> TickReport {
        let now = self.clock.now();
        let mut report = TickReport::default();

        self.fail_unconfirmed(now, &mut report).await;

        let due = match self
            .retry
            .run("find_due_tasks", || self.store.find_due_tasks(now))
            .await
        {
            Ok(due) => due,
            Err(e) => {
                warn!(coordinator_id = %self.coordinator_id, error = %e, "Could not query due tasks");
                report.errors += 1;
                return report;
            }
        };
        report.due = due.len();

        for task in due {
            let task_id = task.id.clone();
            match self.dispatch(task, now).await {
                Ok(Dispatch::Dispatched) => report.dispatched += 1,
                Ok(Dispatch::HandoffFailed) => {
                    report.dispatched += 1;
                    report.handoff_failures += 1;
                }
                Ok(Dispatch::Skipped) => report.skipped += 1,
                Err(e) => {
                    warn!(task_id = %task_id, error = %e, "Dispatch failed");
                    report.errors += 1;
                }
            }
        }

        if report.due > 0 || report.abandoned > 0 {
            info!(
                coordinator_id = %self.coordinator_id,
                due = report.due,
                dispatched = report.dispatched,
                skipped = report.skipped,
                handoff_failures = report.handoff_failures,
                abandoned = report.abandoned,
                errors = report.errors,
                "Dispatch tick finished"
            );
        }
        report
    }

    /// Claim one occurrence of `task`, record its execution and hand it off.
    async fn dispatch(&self, task: ScheduledTask, now: DateTime<Utc>) -> Result<Dispatch> {
        let Some(occurrence) = task.next_run_at else {
            return Ok(Dispatch::Skipped);
        };

        let mut claimed = task.clone();
        claimed.last_run_at = Some(occurrence);
        claimed.run_count += 1;
        // Step from the occurrence itself, not from now, so late ticks do
        // not shift the schedule.
        claimed.next_run_at = match Recurrence::parse(&task.cron_expression, &task.timezone)
            .and_then(|r| r.next_after(occurrence))
        {
            Ok(next) => Some(next),
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Task will not be rescheduled");
                None
            }
        };
        claimed.updated_at = now;

        let execution =
            ScheduledTaskExecution::pending(&task, ExecutionTrigger::Schedule, occurrence, now);
        let won = self
            .retry
            .run("claim_occurrence", || {
                self.store.claim_occurrence(&claimed, &execution)
            })
            .await?;
        if !won {
            debug!(
                task_id = %task.id,
                coordinator_id = %self.coordinator_id,
                "Occurrence already claimed"
            );
            return Ok(Dispatch::Skipped);
        }

        info!(
            task_id = %task.id,
            execution_id = %execution.id,
            scheduled_at = %occurrence,
            next_run_at = ?claimed.next_run_at,
            coordinator_id = %self.coordinator_id,
            "Task dispatched"
        );

        match self.executor.submit(execution.to_request()).await {
            Ok(()) => {
                let execution_id = execution.id.clone();
                if let Err(e) = mark_handed_off(
                    self.store.as_ref(),
                    &self.retry,
                    self.clock.as_ref(),
                    execution,
                )
                .await
                {
                    warn!(task_id = %task.id, execution_id = %execution_id, error = %e, "Could not record handoff");
                }
                Ok(Dispatch::Dispatched)
            }
            Err(e) => {
                warn!(task_id = %task.id, execution_id = %execution.id, error = %e, "Executor handoff failed");
                fail_handoff(
                    self.store.as_ref(),
                    &self.retry,
                    self.clock.as_ref(),
                    execution,
                    &e,
                )
                .await?;
                Ok(Dispatch::HandoffFailed)
            }
        }
    }

    /// Fail pending executions whose handoff was never recorded within the
    /// handoff timeout. These are left behind when a handoff or its failure
    /// could not be written, and would otherwise block run-now forever.
    async fn fail_unconfirmed(&self, now: DateTime<Utc>, report: &mut TickReport) {
        let Some(cutoff) = chrono::Duration::from_std(self.handoff_timeout)
            .ok()
            .and_then(|timeout| now.checked_sub_signed(timeout))
        else {
            return;
        };

        let stale = match self
            .retry
            .run("find_unconfirmed_executions", || {
                self.store.find_unconfirmed_executions(cutoff)
            })
            .await
        {
            Ok(stale) => stale,
            Err(e) => {
                warn!(coordinator_id = %self.coordinator_id, error = %e, "Could not query unconfirmed executions");
                report.errors += 1;
                return;
            }
        };

        let reason = HandoffError::Unavailable(format!(
            "no handoff recorded within {}s",
            self.handoff_timeout.as_secs()
        ));
        for execution in stale {
            let execution_id = execution.id.clone();
            match fail_handoff(
                self.store.as_ref(),
                &self.retry,
                self.clock.as_ref(),
                execution,
                &reason,
            )
            .await
            {
                Ok(settled) if settled.status == ExecutionStatus::Failed => {
                    warn!(
                        execution_id = %execution_id,
                        task_id = %settled.task_id,
                        "Unconfirmed execution marked failed"
                    );
                    report.abandoned += 1;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(execution_id = %execution_id, error = %e, "Could not fail unconfirmed execution");
                    report.errors += 1;
                }
            }
        }
    }
}
