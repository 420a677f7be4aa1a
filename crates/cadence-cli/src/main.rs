mod runtime;
mod serve;
mod task;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use cadence_types::TaskStatus;

#[derive(Parser)]
#[command(name = "cadence", about = "Recurring task scheduler")]
struct Cli {
    /// Config file (defaults to ~/.cadence/config.json5)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// User the command acts for
    #[arg(long, global = true, env = "CADENCE_USER", default_value = "local")]
    user: String,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the dispatch loop, the lifecycle tracker and a dry-run worker
    Serve,
    /// Manage tasks
    Task {
        #[command(subcommand)]
        command: TaskCommand,
    },
    /// Show tasks grouped by status and in-flight executions
    Overview,
    /// List a task's executions, newest first
    Executions {
        task_id: String,
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// List executions across all of the user's tasks
    History {
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// Cancel a pending or running execution
    Cancel { execution_id: String },
    /// Preview upcoming occurrences of a cron expression
    Next {
        cron: String,
        #[arg(short, long, default_value = "UTC")]
        timezone: String,
        #[arg(short, long, default_value_t = 5)]
        count: usize,
    },
}

#[derive(Subcommand)]
pub enum TaskCommand {
    /// Create a task
    Create {
        #[arg(short, long)]
        name: String,
        /// Five-field cron expression
        #[arg(short, long)]
        cron: String,
        #[arg(short, long)]
        prompt: String,
        /// IANA timezone (defaults to scheduler.default_timezone)
        #[arg(short, long)]
        timezone: Option<String>,
        #[arg(short, long)]
        description: Option<String>,
        /// Do not keep result files
        #[arg(long)]
        no_save_result: bool,
        /// Email address to notify on completion or failure
        #[arg(long)]
        email: Option<String>,
        /// Attachment reference (repeatable)
        #[arg(long = "attach")]
        attachments: Vec<String>,
    },
    /// List tasks
    List {
        #[arg(long)]
        json: bool,
    },
    /// Show one task
    Show {
        id: String,
        #[arg(long)]
        json: bool,
    },
    /// Change a task
    Update {
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        cron: Option<String>,
        #[arg(long)]
        prompt: Option<String>,
        #[arg(long)]
        timezone: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        save_result: Option<bool>,
        #[arg(long, conflicts_with = "no_email")]
        email: Option<String>,
        /// Stop sending notifications
        #[arg(long)]
        no_email: bool,
        /// Administrative status; `active` reactivates a disabled task
        #[arg(long)]
        status: Option<TaskStatus>,
    },
    /// Stop scheduling a task
    Pause { id: String },
    /// Resume a paused task
    Resume { id: String },
    /// Disable a task until it is reactivated with `update --status active`
    Disable { id: String },
    /// Delete a task, keeping its execution history
    Delete { id: String },
    /// Run a task now and wait for it to finish
    Run { id: String },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_writer(std::io::stderr)
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(filter)
            .init();
    }

    let config = match &cli.config {
        Some(path) => cadence_config::load_config_from(path)?,
        None => cadence_config::load_config()?,
    };

    if let Commands::Next {
        cron,
        timezone,
        count,
    } = &cli.command
    {
        return task::preview(cron, timezone, *count);
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let mut runtime = runtime::Runtime::open(config)?;
        match cli.command {
            Commands::Serve => serve::run_serve(runtime).await,
            Commands::Task { command } => task::run_task_command(&mut runtime, &cli.user, command).await,
            Commands::Overview => task::overview(&runtime, &cli.user).await,
            Commands::Executions { task_id, limit } => {
                task::executions(&runtime, &cli.user, &task_id, limit).await
            }
            Commands::History { limit } => task::history(&runtime, &cli.user, limit).await,
            Commands::Cancel { execution_id } => {
                task::cancel(&mut runtime, &cli.user, &execution_id).await
            }
            Commands::Next { .. } => Ok(()),
        }
    })
}
