//! Read-only projections over a user's tasks, rebuilt on every request.

use serde::Serialize;

use cadence_types::{ScheduledTask, ScheduledTaskExecution, TaskStatus};

#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskOverview {
    /// Active tasks, soonest `next_run_at` first.
    pub active: Vec<ScheduledTask>,
    pub paused: Vec<ScheduledTask>,
    pub disabled: Vec<ScheduledTask>,
    /// Pending and running executions.
    pub in_flight: Vec<ScheduledTaskExecution>,
}

impl TaskOverview {
    pub fn build(tasks: Vec<ScheduledTask>, executions: Vec<ScheduledTaskExecution>) -> Self {
        let mut overview = Self::default();
        for task in tasks {
            match task.status {
                TaskStatus::Active => overview.active.push(task),
                TaskStatus::Paused => overview.paused.push(task),
                TaskStatus::Disabled => overview.disabled.push(task),
            }
        }
        // Tasks without a next run sort last.
        overview
            .active
            .sort_by_key(|t| (t.next_run_at.is_none(), t.next_run_at));
        overview.in_flight = executions
            .into_iter()
            .filter(|e| e.status.is_in_flight())
            .collect();
        overview
    }

    /// The active task that fires next.
    pub fn next_due(&self) -> Option<&ScheduledTask> {
        self.active.first().filter(|t| t.next_run_at.is_some())
    }

    pub fn task_count(&self) -> usize {
        self.active.len() + self.paused.len() + self.disabled.len()
    }
}

#[cfg(test)]
mod tests {
    use crate::clock::Clock;
    use crate::testing::Harness;
    use cadence_storage::TaskStore;
    use cadence_types::{ExecutionStatus, ExecutionTrigger, ScheduledTaskExecution, TaskDraft};
    use chrono::Duration;

    #[tokio::test]
    async fn test_overview_groups_by_status() {
        let h = Harness::new();
        let c = &h.controller;
        let hourly = c
            .create_task("alice", TaskDraft::new("hourly", "0 * * * *", "ping"))
            .await
            .unwrap();
        let daily = c
            .create_task("alice", TaskDraft::new("daily", "0 12 * * *", "report"))
            .await
            .unwrap();
        let paused = c
            .create_task("alice", TaskDraft::new("paused", "0 8 * * *", "x"))
            .await
            .unwrap();
        let disabled = c
            .create_task("alice", TaskDraft::new("disabled", "0 8 * * *", "x"))
            .await
            .unwrap();
        c.pause_task("alice", &paused.id).await.unwrap();
        c.disable_task("alice", &disabled.id).await.unwrap();
        let running = c.run_task_now("alice", &daily.id).await.unwrap();

        let overview = c.overview("alice").await.unwrap();
        assert_eq!(overview.task_count(), 4);
        let active: Vec<_> = overview.active.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(active, vec![hourly.id.as_str(), daily.id.as_str()]);
        assert_eq!(overview.paused[0].id, paused.id);
        assert_eq!(overview.disabled[0].id, disabled.id);
        assert_eq!(overview.next_due().map(|t| t.id.as_str()), Some(hourly.id.as_str()));
        assert_eq!(overview.in_flight.len(), 1);
        assert_eq!(overview.in_flight[0].id, running.id);

        assert_eq!(c.overview("bob").await.unwrap().task_count(), 0);
    }

    #[tokio::test]
    async fn test_overview_keeps_old_in_flight_executions() {
        let h = Harness::new();
        let c = &h.controller;
        let slow = c
            .create_task("alice", TaskDraft::new("slow", "0 9 * * *", "crunch"))
            .await
            .unwrap();
        let busy = c
            .create_task("alice", TaskDraft::new("busy", "* * * * *", "tick"))
            .await
            .unwrap();
        let running = c.run_task_now("alice", &slow.id).await.unwrap();

        // Push the running execution far out of the default history page.
        for minute in 1..=(h.config.user_history_limit as i64 + 10) {
            let at = h.clock.now() + Duration::minutes(minute);
            let mut done = ScheduledTaskExecution::pending(&busy, ExecutionTrigger::Schedule, at, at);
            done.status = ExecutionStatus::Completed;
            h.store.insert_execution(&done).await.unwrap();
        }
        let recent = c.list_user_executions("alice", None).await.unwrap();
        assert!(recent.iter().all(|e| e.id != running.id));

        let overview = c.overview("alice").await.unwrap();
        assert_eq!(overview.in_flight.len(), 1);
        assert_eq!(overview.in_flight[0].id, running.id);
    }
}
