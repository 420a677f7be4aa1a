use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use cadence_cron::Recurrence;
use cadence_types::{
    NotificationConfig, ScheduledTask, ScheduledTaskExecution, TaskDraft, TaskUpdate,
};

use crate::TaskCommand;
use crate::runtime::Runtime;

/// How long `task run` waits for the execution to finish.
const RUN_WAIT: Duration = Duration::from_secs(30);

pub async fn run_task_command(runtime: &mut Runtime, user: &str, command: TaskCommand) -> Result<()> {
    let controller = &runtime.controller;
    match command {
        TaskCommand::Create {
            name,
            cron,
            prompt,
            timezone,
            description,
            no_save_result,
            email,
            attachments,
        } => {
            let draft = TaskDraft {
                name,
                cron_expression: cron,
                prompt,
                timezone,
                description,
                save_result: Some(!no_save_result),
                notification: email.map(NotificationConfig::email).unwrap_or_default(),
                attachments,
            };
            let task = controller.create_task(user, draft).await?;
            println!("Created task {}", task.id);
            print_task(&task);
        }
        TaskCommand::List { json } => {
            let tasks = controller.list_tasks(user).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&tasks)?);
            } else if tasks.is_empty() {
                println!("No tasks.");
            } else {
                for task in &tasks {
                    print_task_line(task);
                }
            }
        }
        TaskCommand::Show { id, json } => {
            let task = controller.get_task(user, &id).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&task)?);
            } else {
                print_task(&task);
            }
        }
        TaskCommand::Update {
            id,
            name,
            cron,
            prompt,
            timezone,
            description,
            save_result,
            email,
            no_email,
            status,
        } => {
            let notification = match (email, no_email) {
                (Some(address), _) => Some(NotificationConfig::email(address)),
                (None, true) => Some(NotificationConfig::default()),
                (None, false) => None,
            };
            let update = TaskUpdate {
                name,
                description,
                cron_expression: cron,
                timezone,
                prompt,
                save_result,
                notification,
                attachments: None,
                status,
            };
            let task = controller.update_task(user, &id, update).await?;
            print_task(&task);
        }
        TaskCommand::Pause { id } => {
            let task = controller.pause_task(user, &id).await?;
            print_task_line(&task);
        }
        TaskCommand::Resume { id } => {
            let task = controller.resume_task(user, &id).await?;
            print_task_line(&task);
        }
        TaskCommand::Disable { id } => {
            let task = controller.disable_task(user, &id).await?;
            print_task_line(&task);
        }
        TaskCommand::Delete { id } => {
            controller.delete_task(user, &id).await?;
            println!("Deleted task {id}");
        }
        TaskCommand::Run { id } => {
            let cancel = CancellationToken::new();
            let background = runtime.start_background(&cancel);
            let execution = runtime.controller.run_task_now(user, &id).await?;
            let execution = wait_until_settled(runtime, user, execution).await?;
            cancel.cancel();
            for handle in background {
                let _ = handle.await;
            }
            print_execution(&execution);
        }
    }
    Ok(())
}

async fn wait_until_settled(
    runtime: &Runtime,
    user: &str,
    mut execution: ScheduledTaskExecution,
) -> Result<ScheduledTaskExecution> {
    let deadline = tokio::time::Instant::now() + RUN_WAIT;
    while !execution.status.is_terminal() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
        execution = runtime.controller.get_execution(user, &execution.id).await?;
    }
    Ok(execution)
}

pub async fn overview(runtime: &Runtime, user: &str) -> Result<()> {
    let overview = runtime.controller.overview(user).await?;
    for (label, tasks) in [
        ("Active", &overview.active),
        ("Paused", &overview.paused),
        ("Disabled", &overview.disabled),
    ] {
        println!("{label} ({}):", tasks.len());
        for task in tasks {
            print_task_line(task);
        }
    }
    println!("In flight ({}):", overview.in_flight.len());
    for execution in &overview.in_flight {
        print_execution_line(execution);
    }
    if let Some(next) = overview.next_due() {
        println!("Next due: {} ({})", next.name, fmt_opt(next.next_run_at));
    }
    Ok(())
}

pub async fn executions(
    runtime: &Runtime,
    user: &str,
    task_id: &str,
    limit: Option<usize>,
) -> Result<()> {
    let executions = runtime
        .controller
        .list_executions(user, task_id, limit)
        .await?;
    print_executions(&executions);
    Ok(())
}

pub async fn history(runtime: &Runtime, user: &str, limit: Option<usize>) -> Result<()> {
    let executions = runtime.controller.list_user_executions(user, limit).await?;
    print_executions(&executions);
    Ok(())
}

pub async fn cancel(runtime: &mut Runtime, user: &str, execution_id: &str) -> Result<()> {
    // A worker in this process answers the cancel at once; it never holds
    // jobs dispatched by a separate `serve` process.
    let cancel = CancellationToken::new();
    let background = runtime.start_background(&cancel);
    let outcome = runtime.tracker.request_cancel(user, execution_id).await;
    cancel.cancel();
    for handle in background {
        let _ = handle.await;
    }
    let outcome = outcome?;
    if outcome.acknowledged {
        println!("Cancelled execution {execution_id}");
    } else {
        println!(
            "Cancel requested for execution {execution_id}; it stays {} until the executor stops it",
            outcome.execution.status
        );
    }
    Ok(())
}

/// Print the next `count` occurrences of a cron expression.
pub fn preview(cron: &str, timezone: &str, count: usize) -> Result<()> {
    if count == 0 {
        bail!("--count must be at least 1");
    }
    let recurrence = Recurrence::parse(cron, timezone)
        .with_context(|| format!("Invalid schedule \"{cron}\" in {timezone}"))?;
    let tz = recurrence.timezone();
    for instant in recurrence.upcoming(Utc::now(), count)? {
        println!(
            "{}  ({})",
            instant.with_timezone(&tz).format("%Y-%m-%d %H:%M %Z"),
            instant.to_rfc3339()
        );
    }
    Ok(())
}

fn fmt_opt(instant: Option<chrono::DateTime<Utc>>) -> String {
    instant.map_or_else(|| "-".to_string(), |t| t.to_rfc3339())
}

fn print_task_line(task: &ScheduledTask) {
    println!(
        "{:<16}  {:<8}  {:<16}  {:<20}  next: {}",
        task.id,
        task.status,
        task.cron_expression,
        task.name,
        fmt_opt(task.next_run_at)
    );
}

fn print_task(task: &ScheduledTask) {
    println!("id:           {}", task.id);
    println!("name:         {}", task.name);
    if let Some(description) = &task.description {
        println!("description:  {description}");
    }
    println!("status:       {}", task.status);
    println!("schedule:     {} ({})", task.cron_expression, task.timezone);
    println!("next run:     {}", fmt_opt(task.next_run_at));
    println!("last run:     {}", fmt_opt(task.last_run_at));
    println!("runs:         {} ({} consecutive failures)", task.run_count, task.failure_count);
    println!("prompt:       {}", task.payload.prompt);
    if let Some(recipient) = task.payload.notification.email_recipient() {
        println!("notify:       {recipient}");
    }
}

fn print_execution_line(execution: &ScheduledTaskExecution) {
    println!(
        "{:<16}  task {:<16}  {:<9}  {:<8}  scheduled {}",
        execution.id,
        execution.task_id,
        execution.status,
        execution.trigger.as_str(),
        execution.scheduled_at.to_rfc3339()
    );
}

fn print_executions(executions: &[ScheduledTaskExecution]) {
    if executions.is_empty() {
        println!("No executions.");
    }
    for execution in executions {
        print_execution_line(execution);
    }
}

fn print_execution(execution: &ScheduledTaskExecution) {
    print_execution_line(execution);
    if let Some(summary) = &execution.result_summary {
        println!("  result: {summary}");
    }
    if let Some(error) = &execution.error_message {
        println!("  error:  {error}");
    }
    if execution.cancel_requested {
        println!("  cancel requested");
    }
}
