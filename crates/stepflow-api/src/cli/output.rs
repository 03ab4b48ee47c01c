//! Shared CLI formatting and argument parsing helpers.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use stepflow_types::event::{LogEvent, LogLevel};
use stepflow_types::execution::{ExecutionStatus, TaskStatus};

/// Pretty-print any serializable value as JSON on stdout.
pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// A table with the preset used by every listing.
pub fn new_table(header: Vec<Cell>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header);
    table
}

pub fn parse_id(raw: &str, what: &str) -> Result<Uuid> {
    raw.parse::<Uuid>()
        .with_context(|| format!("Invalid {what} ID: '{raw}'"))
}

/// First 8 characters of a UUID, enough to tell rows apart.
pub fn short_id(id: &Uuid) -> String {
    id.to_string().chars().take(8).collect()
}

pub fn format_time(at: Option<DateTime<Utc>>) -> String {
    at.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

pub fn execution_status_cell(status: ExecutionStatus) -> Cell {
    let color = match status {
        ExecutionStatus::Pending => Color::Grey,
        ExecutionStatus::Running => Color::Blue,
        ExecutionStatus::Completed => Color::Green,
        ExecutionStatus::Failed | ExecutionStatus::TimedOut => Color::Red,
        ExecutionStatus::Cancelled => Color::Yellow,
    };
    Cell::new(status.as_str()).fg(color)
}

pub fn task_status_cell(status: TaskStatus) -> Cell {
    let color = match status {
        TaskStatus::Pending => Color::Grey,
        TaskStatus::Running => Color::Blue,
        TaskStatus::Completed => Color::Green,
        TaskStatus::Failed => Color::Red,
        TaskStatus::Skipped | TaskStatus::Cancelled => Color::Yellow,
    };
    Cell::new(status.as_str()).fg(color)
}

pub fn styled_execution_status(status: ExecutionStatus) -> String {
    let text = status.as_str();
    match status {
        ExecutionStatus::Completed => style(text).green().bold().to_string(),
        ExecutionStatus::Failed | ExecutionStatus::TimedOut => style(text).red().bold().to_string(),
        ExecutionStatus::Cancelled => style(text).yellow().bold().to_string(),
        ExecutionStatus::Pending | ExecutionStatus::Running => style(text).cyan().to_string(),
    }
}

/// One log event as a single styled line.
pub fn format_log_line(event: &LogEvent) -> String {
    let time = event.timestamp.format("%H:%M:%S%.3f");
    let level = match event.level {
        LogLevel::Debug => style("DEBUG").dim().to_string(),
        LogLevel::Info => style(" INFO").green().to_string(),
        LogLevel::Warn => style(" WARN").yellow().to_string(),
        LogLevel::Error => style("ERROR").red().bold().to_string(),
    };
    let scope = match &event.task_id {
        Some(task) => style(task.as_str()).cyan().to_string(),
        None => style("execution").dim().to_string(),
    };
    format!("  {} {level} {scope}: {}", style(time).dim(), event.message)
}

/// Build an input map from an optional JSON object plus `key=value` pairs.
///
/// Pair values are parsed as JSON when possible (`limit=10` is a number,
/// `flags=[1,2]` an array) and kept as strings otherwise.
pub fn parse_input(json: Option<&str>, pairs: &[String]) -> Result<Map<String, Value>> {
    let mut input = match json {
        Some(raw) => match serde_json::from_str::<Value>(raw).context("Invalid JSON input")? {
            Value::Object(map) => map,
            other => bail!("Input must be a JSON object, got {other}"),
        },
        None => Map::new(),
    };

    for pair in pairs {
        let Some((key, raw)) = pair.split_once('=') else {
            bail!("Expected KEY=VALUE, got '{pair}'");
        };
        let key = key.trim();
        if key.is_empty() {
            bail!("Empty parameter name in '{pair}'");
        }
        let value = serde_json::from_str::<Value>(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        input.insert(key.to_string(), value);
    }

    Ok(input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_input_merges_pairs_over_json() {
        let input = parse_input(
            Some(r#"{"region": "eu", "limit": 5}"#),
            &["limit=10".to_string(), "label=nightly run".to_string()],
        )
        .unwrap();
        assert_eq!(input["region"], json!("eu"));
        assert_eq!(input["limit"], json!(10));
        assert_eq!(input["label"], json!("nightly run"));
    }

    #[test]
    fn test_parse_input_rejects_bad_shapes() {
        assert!(parse_input(Some("[1, 2]"), &[]).is_err());
        assert!(parse_input(None, &["novalue".to_string()]).is_err());
        assert!(parse_input(None, &["=1".to_string()]).is_err());
    }

    #[test]
    fn test_short_id_is_prefix() {
        let id = Uuid::now_v7();
        assert!(id.to_string().starts_with(&short_id(&id)));
        assert_eq!(short_id(&id).len(), 8);
    }
}
