//! Boundary to the external executor that actually runs a task's prompt.
//!
//! The scheduler hands jobs over with [`Executor::submit`] and hears back
//! through [`LifecycleSignal`]s on a separate channel, consumed by the
//! [`ExecutionTracker`](crate::tracker::ExecutionTracker).

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use cadence_types::{ExecutionRequest, LifecycleEvent, LifecycleSignal};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandoffError {
    #[error("executor unavailable: {0}")]
    Unavailable(String),
    #[error("executor rejected the job: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait Executor: Send + Sync {
    /// Accept a job. An error means the job was not accepted.
    async fn submit(&self, request: ExecutionRequest) -> Result<(), HandoffError>;

    /// Ask the executor to stop a job. `Ok(true)` means it acknowledged and
    /// the job will not run further.
    async fn cancel(&self, execution_id: &str) -> Result<bool, HandoffError>;
}

/// Messages from [`ChannelExecutor`] to a worker.
#[derive(Debug)]
pub enum ExecutorCommand {
    Run(ExecutionRequest),
    Cancel {
        execution_id: String,
        ack: oneshot::Sender<bool>,
    },
}

/// [`Executor`] that forwards jobs to a bounded channel.
#[derive(Debug, Clone)]
pub struct ChannelExecutor {
    tx: mpsc::Sender<ExecutorCommand>,
    cancel_timeout: Duration,
}

impl ChannelExecutor {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ExecutorCommand>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let executor = Self {
            tx,
            cancel_timeout: Duration::from_secs(5),
        };
        (executor, rx)
    }

    /// How long to wait for a worker to acknowledge a cancel.
    pub fn with_cancel_timeout(mut self, timeout: Duration) -> Self {
        self.cancel_timeout = timeout;
        self
    }
}

fn send_error<T>(e: mpsc::error::TrySendError<T>) -> HandoffError {
    match e {
        mpsc::error::TrySendError::Full(_) => HandoffError::Unavailable("job queue is full".into()),
        mpsc::error::TrySendError::Closed(_) => {
            HandoffError::Unavailable("no worker is listening".into())
        }
    }
}

#[async_trait]
impl Executor for ChannelExecutor {
    async fn submit(&self, request: ExecutionRequest) -> Result<(), HandoffError> {
        self.tx
            .try_send(ExecutorCommand::Run(request))
            .map_err(send_error)
    }

    async fn cancel(&self, execution_id: &str) -> Result<bool, HandoffError> {
        let (ack, ack_rx) = oneshot::channel();
        self.tx
            .try_send(ExecutorCommand::Cancel {
                execution_id: execution_id.to_string(),
                ack,
            })
            .map_err(send_error)?;
        match tokio::time::timeout(self.cancel_timeout, ack_rx).await {
            Ok(Ok(acknowledged)) => Ok(acknowledged),
            Ok(Err(_)) => Ok(false),
            Err(_) => {
                warn!(execution_id, "Executor did not answer cancel request in time");
                Ok(false)
            }
        }
    }
}

/// A worker that pretends to run jobs: it reports each one started, waits
/// `work_time`, then reports it completed. Honours cancels for queued and
/// running jobs.
pub struct DryRunWorker {
    commands: mpsc::Receiver<ExecutorCommand>,
    signals: mpsc::Sender<LifecycleSignal>,
    work_time: Duration,
    backlog: VecDeque<ExecutionRequest>,
}

impl DryRunWorker {
    pub fn new(
        commands: mpsc::Receiver<ExecutorCommand>,
        signals: mpsc::Sender<LifecycleSignal>,
        work_time: Duration,
    ) -> Self {
        Self {
            commands,
            signals,
            work_time,
            backlog: VecDeque::new(),
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        info!("Dry-run worker started");
        loop {
            if let Some(request) = self.backlog.pop_front() {
                if !self.perform(request, &cancel).await {
                    break;
                }
                continue;
            }
            let command = tokio::select! {
                _ = cancel.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
            };
            match command {
                ExecutorCommand::Run(request) => self.backlog.push_back(request),
                ExecutorCommand::Cancel { execution_id, ack } => {
                    self.cancel_queued(&execution_id, ack).await;
                }
            }
        }
        info!("Dry-run worker stopped");
    }

    /// Returns false when the worker should stop.
    async fn perform(&mut self, request: ExecutionRequest, cancel: &CancellationToken) -> bool {
        let execution_id = request.execution_id.clone();
        info!(
            execution_id = %execution_id,
            task_id = %request.task_id,
            prompt = %request.payload.prompt,
            "Dry run: starting job"
        );
        self.emit(&execution_id, LifecycleEvent::Started {
            session_id: Some(format!("dry-run-{execution_id}")),
        })
        .await;

        let finished = tokio::time::sleep(self.work_time);
        tokio::pin!(finished);
        loop {
            tokio::select! {
                _ = &mut finished => {
                    let summary = format!("dry run of \"{}\"", request.payload.prompt);
                    self.emit(&execution_id, LifecycleEvent::Completed {
                        result_summary: Some(summary),
                    })
                    .await;
                    return true;
                }
                _ = cancel.cancelled() => return false,
                command = self.commands.recv() => match command {
                    Some(ExecutorCommand::Run(next)) => self.backlog.push_back(next),
                    Some(ExecutorCommand::Cancel { execution_id: target, ack }) => {
                        if target == execution_id {
                            self.emit(&execution_id, LifecycleEvent::Cancelled).await;
                            let _ = ack.send(true);
                            return true;
                        }
                        self.cancel_queued(&target, ack).await;
                    }
                    None => return false,
                },
            }
        }
    }

    async fn cancel_queued(&mut self, execution_id: &str, ack: oneshot::Sender<bool>) {
        let before = self.backlog.len();
        self.backlog.retain(|r| r.execution_id != execution_id);
        let removed = self.backlog.len() != before;
        if removed {
            self.emit(execution_id, LifecycleEvent::Cancelled).await;
        } else {
            debug!(execution_id, "Cancel for a job this worker does not hold");
        }
        let _ = ack.send(removed);
    }

    async fn emit(&self, execution_id: &str, event: LifecycleEvent) {
        if let Err(e) = self
            .signals
            .send(LifecycleSignal::new(execution_id, event))
            .await
        {
            warn!(execution_id, "Failed to report lifecycle signal: {e}");
        }
    }
}
