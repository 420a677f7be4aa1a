//! Wires the scheduler components over the SQLite store.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use cadence_config::CadenceConfig;
use cadence_cron::{
    ChannelExecutor, Clock, DispatchLoop, DryRunWorker, ExecutionTracker, LogNotifier,
    RetryPolicy, SystemClock, TaskController,
};
use cadence_storage::{SqliteTaskStore, TaskStore};
use cadence_types::LifecycleSignal;

const JOB_QUEUE_CAPACITY: usize = 64;
const SIGNAL_QUEUE_CAPACITY: usize = 256;
const DRY_RUN_WORK_TIME: Duration = Duration::from_millis(500);

pub struct Runtime {
    pub config: CadenceConfig,
    pub controller: TaskController,
    pub tracker: Arc<ExecutionTracker>,
    pub dispatcher: DispatchLoop,
    worker: Option<DryRunWorker>,
    signals: Option<mpsc::Receiver<LifecycleSignal>>,
}

impl Runtime {
    pub fn open(config: CadenceConfig) -> Result<Self> {
        let db_path = config.db_path()?;
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let store: Arc<dyn TaskStore> = Arc::new(
            SqliteTaskStore::open(&db_path)
                .with_context(|| format!("Failed to open store at {}", db_path.display()))?,
        );
        tracing::debug!(db = %db_path.display(), "Opened task store");

        let (executor, commands) = ChannelExecutor::new(JOB_QUEUE_CAPACITY);
        let executor = Arc::new(executor);
        let (signal_tx, signal_rx) = mpsc::channel(SIGNAL_QUEUE_CAPACITY);
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let retry = RetryPolicy::from(&config.retry);

        let controller = TaskController::new(
            store.clone(),
            executor.clone(),
            clock.clone(),
            retry.clone(),
            config.scheduler.clone(),
        );
        let tracker = Arc::new(ExecutionTracker::new(
            store.clone(),
            executor.clone(),
            Arc::new(LogNotifier),
            clock.clone(),
            retry.clone(),
        ));
        let dispatcher = DispatchLoop::new(store, executor, clock, retry, &config.scheduler);

        Ok(Self {
            config,
            controller,
            tracker,
            dispatcher,
            worker: Some(DryRunWorker::new(commands, signal_tx, DRY_RUN_WORK_TIME)),
            signals: Some(signal_rx),
        })
    }

    /// Start the dry-run worker and the signal consumer.
    pub fn start_background(&mut self, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        if let Some(worker) = self.worker.take() {
            handles.push(tokio::spawn(worker.run(cancel.clone())));
        }
        if let Some(signals) = self.signals.take() {
            let tracker = Arc::clone(&self.tracker);
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move { tracker.run(signals, cancel).await }));
        }
        handles
    }
}
