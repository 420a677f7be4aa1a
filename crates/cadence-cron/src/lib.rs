//! cadence-cron: recurring task scheduling.
//!
//! [`TaskController`] manages task definitions, [`DispatchLoop`] turns due
//! occurrences into executions exactly once, and [`ExecutionTracker`] follows
//! each execution through the executor's lifecycle signals. All state lives
//! in a [`TaskStore`](cadence_storage::TaskStore).

pub mod clock;
pub mod controller;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod notifier;
pub mod recurrence;
pub mod retry;
pub mod tracker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use controller::{TaskController, TaskOverview};
pub use dispatch::{DispatchLoop, TickReport};
pub use error::{Result, SchedulerError};
pub use executor::{ChannelExecutor, DryRunWorker, Executor, ExecutorCommand, HandoffError};
pub use notifier::{LogNotifier, Notifier, NotifyError, TaskNotification};
pub use recurrence::{CronExpr, Recurrence, RecurrenceError, next_occurrence};
pub use retry::RetryPolicy;
pub use tracker::{CancelOutcome, ExecutionTracker, SignalOutcome};
