//! CLI execution subcommands.
//!
//! `start` and `retry` run the execution inside this process and print its
//! log events as they happen; Ctrl+C cancels the execution and waits for it
//! to settle. `get`, `list` and `logs` read the persisted state.

use anyhow::{Result, anyhow, bail};
use comfy_table::{Cell, Color};
use console::style;
use uuid::Uuid;

use stepflow_core::repository::Page;
use stepflow_core::workflow::log_bus::{LogFilter, LogSubscription};
use stepflow_types::event::LogLevel;
use stepflow_types::execution::{
    ExecutionDetails, ExecutionFilter, ExecutionStatus, StartExecution, TaskExecution,
};

use crate::cli::output::{
    execution_status_cell, format_log_line, format_time, new_table, parse_id, parse_input,
    print_json, short_id, styled_execution_status, task_status_cell,
};
use crate::state::AppState;

/// Arguments of `stepflow start`.
pub struct StartArgs {
    pub definition_id: String,
    pub input: Option<String>,
    pub params: Vec<String>,
    pub trigger: String,
    pub min_level: String,
}

fn parse_level(raw: &str) -> Result<LogLevel> {
    raw.parse::<LogLevel>().map_err(|e| anyhow!(e))
}

// ---------------------------------------------------------------------------
// Start / Retry
// ---------------------------------------------------------------------------

pub async fn handle_start(args: StartArgs, state: &AppState, json: bool, quiet: bool) -> Result<()> {
    let definition_id = parse_id(&args.definition_id, "definition")?;
    let filter = LogFilter {
        task_id: None,
        min_level: parse_level(&args.min_level)?,
    };
    let request = StartExecution {
        input: parse_input(args.input.as_deref(), &args.params)?,
        trigger_id: Some(args.trigger),
        triggered_by: std::env::var("USER").ok(),
        ..Default::default()
    };

    let (execution, subscription) = state
        .engine
        .start_execution_with_logs(definition_id, request, filter)
        .await?;

    if !json && !quiet {
        println!();
        println!(
            "  {} Started '{}' as {}",
            style("*").green().bold(),
            style(&execution.definition_name).cyan(),
            execution.id
        );
        println!();
    }

    let details = follow(state, execution.id, subscription, json || quiet).await?;
    report_outcome(&details, json)
}

pub async fn handle_retry(
    execution_id: &str,
    from_task: Option<&str>,
    min_level: &str,
    state: &AppState,
    json: bool,
    quiet: bool,
) -> Result<()> {
    let original = parse_id(execution_id, "execution")?;
    let filter = LogFilter {
        task_id: None,
        min_level: parse_level(min_level)?,
    };

    let execution = state.engine.retry_execution(original, from_task).await?;
    let subscription = state.engine.subscribe_logs(execution.id, filter).await?;

    if !json && !quiet {
        println!();
        println!(
            "  {} Retrying {} as {}",
            style("*").green().bold(),
            short_id(&original),
            execution.id
        );
        if let Some(task) = from_task {
            println!("  Resuming from task '{}'", style(task).cyan());
        }
        println!();
    }

    let details = follow(state, execution.id, subscription, json || quiet).await?;
    report_outcome(&details, json)
}

/// Print log events until the execution finishes. Ctrl+C cancels it once.
async fn follow(
    state: &AppState,
    id: Uuid,
    mut subscription: LogSubscription,
    silent: bool,
) -> Result<ExecutionDetails> {
    let mut cancel_requested = false;
    loop {
        tokio::select! {
            event = subscription.recv() => {
                let Some(event) = event else { break };
                if !silent {
                    println!("{}", format_log_line(&event));
                }
            }
            _ = tokio::signal::ctrl_c(), if !cancel_requested => {
                cancel_requested = true;
                if !silent {
                    println!("  {}", style("Interrupted, cancelling execution...").yellow());
                }
                if let Err(e) = state
                    .engine
                    .cancel_execution(id, Some("interrupted from the command line".to_string()))
                    .await
                {
                    tracing::warn!(execution_id = %id, "cancel after interrupt failed: {e}");
                }
            }
        }
    }

    Ok(state.engine.wait_for_execution(id).await?)
}

fn report_outcome(details: &ExecutionDetails, json: bool) -> Result<()> {
    let execution = &details.execution;
    if json {
        print_json(details)?;
    } else {
        println!();
        println!(
            "  Execution {} {}",
            execution.id,
            styled_execution_status(execution.status)
        );
        if let Some(output) = &execution.output {
            println!("  Output: {}", serde_json::to_string(output)?);
        }
        if let Some(err) = &execution.error {
            println!("  Error: {}", style(err).red());
        }
        println!();
    }

    if execution.status != ExecutionStatus::Completed {
        bail!("execution {} finished as {}", execution.id, execution.status);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Get / Logs
// ---------------------------------------------------------------------------

pub async fn handle_get(execution_id: &str, state: &AppState, json: bool) -> Result<()> {
    let id = parse_id(execution_id, "execution")?;
    let details = state.engine.get_execution(id).await?;

    if json {
        return print_json(&details);
    }

    let e = &details.execution;
    println!();
    println!(
        "  {} {}",
        style("Execution").bold(),
        style(e.id).cyan()
    );
    println!(
        "  Definition: {} ({})",
        style(&e.definition_name).cyan(),
        short_id(&e.definition_id)
    );
    println!("  Status: {}", styled_execution_status(e.status));
    if let Some(trigger) = &e.trigger_id {
        println!("  Trigger: {trigger}");
    }
    if let Some(original) = e.retry_of {
        println!("  Retry of: {original}");
    }
    println!("  Created: {}", format_time(Some(e.created_at)));
    println!("  Started: {}", format_time(e.started_at));
    println!("  Completed: {}", format_time(e.completed_at));
    if let Some(err) = &e.error {
        println!("  Error: {}", style(err).red());
    }
    if let Some(task) = &e.failed_task_id {
        println!("  Failed task: {}", style(task).red());
    }
    println!();
    print_tasks(&details.tasks);
    Ok(())
}

pub async fn handle_logs(
    execution_id: &str,
    task: Option<&str>,
    state: &AppState,
    json: bool,
) -> Result<()> {
    let id = parse_id(execution_id, "execution")?;
    let details = state.engine.get_execution(id).await?;
    let tasks: Vec<TaskExecution> = details
        .tasks
        .into_iter()
        .filter(|t| task.is_none_or(|root| within(&t.task_id, root)))
        .collect();

    if json {
        return print_json(&tasks);
    }
    if tasks.is_empty() {
        println!();
        println!("  No task records for execution {}.", short_id(&id));
        println!();
        return Ok(());
    }
    println!();
    print_tasks(&tasks);
    Ok(())
}

/// Whether `task_id` is `root` or nested under it.
fn within(task_id: &str, root: &str) -> bool {
    match task_id.strip_prefix(root) {
        Some(rest) => rest.is_empty() || rest.starts_with('/') || rest.starts_with('['),
        None => false,
    }
}

fn print_tasks(tasks: &[TaskExecution]) {
    let mut table = new_table(vec![
        Cell::new("Task").fg(Color::Cyan),
        Cell::new("Kind"),
        Cell::new("Status"),
        Cell::new("Attempts"),
        Cell::new("Started"),
        Cell::new("Completed"),
        Cell::new("Error"),
    ]);
    for t in tasks {
        table.add_row(vec![
            Cell::new(&t.task_id),
            Cell::new(t.kind.as_str()),
            task_status_cell(t.status),
            Cell::new(t.retry_count + 1),
            Cell::new(format_time(t.started_at)),
            Cell::new(format_time(t.completed_at)),
            Cell::new(t.error.as_deref().unwrap_or("")),
        ]);
    }
    println!("{table}");
    println!();
}

// ---------------------------------------------------------------------------
// List
// ---------------------------------------------------------------------------

pub struct ListArgs {
    pub definition: Option<String>,
    pub tenant: Option<String>,
    pub status: Option<String>,
    pub offset: u32,
    pub limit: Option<u32>,
}

pub async fn handle_list(args: ListArgs, state: &AppState, json: bool) -> Result<()> {
    let filter = ExecutionFilter {
        definition_id: args
            .definition
            .as_deref()
            .map(|d| parse_id(d, "definition"))
            .transpose()?,
        tenant_id: args.tenant,
        status: args
            .status
            .as_deref()
            .map(|s| s.parse::<ExecutionStatus>().map_err(|e| anyhow!(e)))
            .transpose()?,
    };
    let limit = args
        .limit
        .unwrap_or(state.engine.config().default_page_limit);
    let page = state
        .engine
        .list_executions(&filter, Page::new(args.offset, limit))
        .await?;

    if json {
        return print_json(&page);
    }
    if page.items.is_empty() {
        println!();
        println!("  No executions found.");
        println!();
        return Ok(());
    }

    let mut table = new_table(vec![
        Cell::new("ID").fg(Color::Cyan),
        Cell::new("Definition"),
        Cell::new("Status"),
        Cell::new("Trigger"),
        Cell::new("Created"),
        Cell::new("Completed"),
    ]);
    for e in &page.items {
        table.add_row(vec![
            Cell::new(e.id),
            Cell::new(&e.definition_name),
            execution_status_cell(e.status),
            Cell::new(e.trigger_id.as_deref().unwrap_or("-")),
            Cell::new(format_time(Some(e.created_at))),
            Cell::new(format_time(e.completed_at)),
        ]);
    }
    println!();
    println!("{table}");
    println!(
        "  {}",
        style(format!(
            "showing {}-{} of {}",
            page.offset + 1,
            page.offset as usize + page.items.len(),
            page.total
        ))
        .dim()
    );
    println!();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_within_matches_nested_tasks() {
        assert!(within("fanout", "fanout"));
        assert!(within("fanout/check", "fanout"));
        assert!(within("each[2]/notify", "each"));
        assert!(!within("fanout2", "fanout"));
        assert!(!within("other", "fanout"));
    }

    #[test]
    fn test_level_parsing() {
        assert_eq!(parse_level("warn").unwrap(), LogLevel::Warn);
        assert!(parse_level("loud").is_err());
    }
}
