//! In-memory task store, for tests and single-process deployments.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use cadence_types::{ExecutionStatus, ScheduledTask, ScheduledTaskExecution};

use crate::{Result, StorageError, TaskStore};

#[derive(Default)]
struct Records {
    tasks: HashMap<String, ScheduledTask>,
    executions: HashMap<String, ScheduledTaskExecution>,
}

/// [`TaskStore`] backed by hash maps behind a single lock.
#[derive(Default)]
pub struct InMemoryTaskStore {
    records: RwLock<Records>,
    injected_failures: AtomicU32,
    reject_execution_inserts: AtomicBool,
    reject_execution_updates: AtomicBool,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` operations fail with a transient error.
    pub fn inject_transient_failures(&self, count: u32) {
        self.injected_failures.store(count, Ordering::SeqCst);
    }

    /// Make every execution insert fail with a transient error until reset.
    pub fn fail_execution_inserts(&self, fail: bool) {
        self.reject_execution_inserts.store(fail, Ordering::SeqCst);
    }

    /// Make every execution update fail with a transient error until reset.
    pub fn fail_execution_updates(&self, fail: bool) {
        self.reject_execution_updates.store(fail, Ordering::SeqCst);
    }

    fn check_switch(switch: &AtomicBool, what: &str) -> Result<()> {
        if switch.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable(format!("{what} rejected")));
        }
        Ok(())
    }

    fn check_fault(&self) -> Result<()> {
        let consumed = self
            .injected_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match consumed {
            Ok(_) => Err(StorageError::Unavailable("injected fault".into())),
            Err(_) => Ok(()),
        }
    }
}

fn newest_first(executions: &mut [ScheduledTaskExecution]) {
    executions.sort_by(|a, b| {
        b.scheduled_at
            .cmp(&a.scheduled_at)
            .then_with(|| b.created_at.cmp(&a.created_at))
            .then_with(|| b.id.cmp(&a.id))
    });
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert_task(&self, task: &ScheduledTask) -> Result<()> {
        self.check_fault()?;
        let mut records = self.records.write().await;
        if records.tasks.contains_key(&task.id) {
            return Err(StorageError::Duplicate(task.id.clone()));
        }
        records.tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn get_task(&self, id: &str) -> Result<Option<ScheduledTask>> {
        self.check_fault()?;
        Ok(self.records.read().await.tasks.get(id).cloned())
    }

    async fn list_tasks(&self, user_id: &str) -> Result<Vec<ScheduledTask>> {
        self.check_fault()?;
        let records = self.records.read().await;
        let mut tasks: Vec<_> = records
            .tasks
            .values()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(tasks)
    }

    async fn find_due_tasks(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledTask>> {
        self.check_fault()?;
        let records = self.records.read().await;
        let mut due: Vec<_> = records
            .tasks
            .values()
            .filter(|t| t.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|t| t.next_run_at);
        Ok(due)
    }

    async fn update_task(&self, task: &ScheduledTask) -> Result<bool> {
        self.check_fault()?;
        let mut records = self.records.write().await;
        match records.tasks.get_mut(&task.id) {
            Some(stored) if stored.version == task.version => {
                *stored = task.clone();
                stored.version = task.version + 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_task(&self, id: &str) -> Result<bool> {
        self.check_fault()?;
        Ok(self.records.write().await.tasks.remove(id).is_some())
    }

    async fn claim_occurrence(
        &self,
        task: &ScheduledTask,
        execution: &ScheduledTaskExecution,
    ) -> Result<bool> {
        self.check_fault()?;
        let mut records = self.records.write().await;
        let current = records.tasks.get(&task.id).map(|t| t.version);
        if current != Some(task.version) {
            return Ok(false);
        }
        Self::check_switch(&self.reject_execution_inserts, "execution insert")?;
        if records.executions.contains_key(&execution.id) {
            return Err(StorageError::Duplicate(execution.id.clone()));
        }
        let mut claimed = task.clone();
        claimed.version = task.version + 1;
        records.tasks.insert(claimed.id.clone(), claimed);
        records
            .executions
            .insert(execution.id.clone(), execution.clone());
        Ok(true)
    }

    async fn insert_execution(&self, execution: &ScheduledTaskExecution) -> Result<()> {
        self.check_fault()?;
        Self::check_switch(&self.reject_execution_inserts, "execution insert")?;
        let mut records = self.records.write().await;
        if records.executions.contains_key(&execution.id) {
            return Err(StorageError::Duplicate(execution.id.clone()));
        }
        records
            .executions
            .insert(execution.id.clone(), execution.clone());
        Ok(())
    }

    async fn insert_execution_if_idle(&self, execution: &ScheduledTaskExecution) -> Result<bool> {
        self.check_fault()?;
        Self::check_switch(&self.reject_execution_inserts, "execution insert")?;
        let mut records = self.records.write().await;
        let busy = records
            .executions
            .values()
            .any(|e| e.task_id == execution.task_id && e.status.is_in_flight());
        if busy {
            return Ok(false);
        }
        if records.executions.contains_key(&execution.id) {
            return Err(StorageError::Duplicate(execution.id.clone()));
        }
        records
            .executions
            .insert(execution.id.clone(), execution.clone());
        Ok(true)
    }

    async fn get_execution(&self, id: &str) -> Result<Option<ScheduledTaskExecution>> {
        self.check_fault()?;
        Ok(self.records.read().await.executions.get(id).cloned())
    }

    async fn update_execution(&self, execution: &ScheduledTaskExecution) -> Result<bool> {
        self.check_fault()?;
        Self::check_switch(&self.reject_execution_updates, "execution update")?;
        let mut records = self.records.write().await;
        match records.executions.get_mut(&execution.id) {
            Some(stored) if stored.version == execution.version => {
                *stored = execution.clone();
                stored.version = execution.version + 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_executions(
        &self,
        task_id: &str,
        limit: usize,
    ) -> Result<Vec<ScheduledTaskExecution>> {
        self.check_fault()?;
        let records = self.records.read().await;
        let mut executions: Vec<_> = records
            .executions
            .values()
            .filter(|e| e.task_id == task_id)
            .cloned()
            .collect();
        newest_first(&mut executions);
        executions.truncate(limit);
        Ok(executions)
    }

    async fn list_user_executions(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<ScheduledTaskExecution>> {
        self.check_fault()?;
        let records = self.records.read().await;
        let mut executions: Vec<_> = records
            .executions
            .values()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect();
        newest_first(&mut executions);
        executions.truncate(limit);
        Ok(executions)
    }

    async fn list_in_flight_executions(
        &self,
        user_id: &str,
    ) -> Result<Vec<ScheduledTaskExecution>> {
        self.check_fault()?;
        let records = self.records.read().await;
        let mut executions: Vec<_> = records
            .executions
            .values()
            .filter(|e| e.user_id == user_id && e.status.is_in_flight())
            .cloned()
            .collect();
        newest_first(&mut executions);
        Ok(executions)
    }

    async fn find_unconfirmed_executions(
        &self,
        created_before: DateTime<Utc>,
    ) -> Result<Vec<ScheduledTaskExecution>> {
        self.check_fault()?;
        let records = self.records.read().await;
        let mut executions: Vec<_> = records
            .executions
            .values()
            .filter(|e| {
                e.status == ExecutionStatus::Pending
                    && e.handed_off_at.is_none()
                    && e.created_at <= created_before
            })
            .cloned()
            .collect();
        executions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(executions)
    }
}
