//! Minimal REST client for commands that act on a running server.
//!
//! Cancellation and human task decisions must reach the process that owns
//! the execution, so these commands talk to `stepflow serve` instead of
//! opening the database.

use anyhow::{Context, Result, bail};
use console::style;
use serde_json::{Value, json};

use crate::cli::output::{parse_id, print_json};

pub struct ServerClient {
    client: reqwest::Client,
    base_url: String,
}

impl ServerClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("stepflow-cli/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1{path}", self.base_url)
    }

    /// POST a JSON body and return the envelope's `data`.
    pub async fn post(&self, path: &str, body: &Value) -> Result<Value> {
        let url = self.url(path);
        let resp = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .with_context(|| format!("Failed to reach {url} (is `stepflow serve` running?)"))?;

        let status = resp.status();
        let envelope: Value = resp
            .json()
            .await
            .with_context(|| format!("Invalid response from {url}"))?;
        unwrap_envelope(status.as_u16(), envelope)
    }
}

/// Extract `data` from a success envelope or the first error message.
fn unwrap_envelope(status: u16, envelope: Value) -> Result<Value> {
    if (200..300).contains(&status) {
        return Ok(envelope.get("data").cloned().unwrap_or(Value::Null));
    }
    let message = envelope["errors"][0]["message"]
        .as_str()
        .unwrap_or("request failed");
    let code = envelope["errors"][0]["code"].as_str().unwrap_or("ERROR");
    bail!("{message} ({code}, HTTP {status})")
}

pub async fn handle_cancel(
    server: &str,
    execution_id: &str,
    reason: Option<String>,
    json: bool,
) -> Result<()> {
    let id = parse_id(execution_id, "execution")?;
    let client = ServerClient::new(server)?;
    let data = client
        .post(&format!("/executions/{id}/cancel"), &json!({ "reason": reason }))
        .await?;

    if json {
        return print_json(&data);
    }
    println!();
    println!(
        "  {} Execution {} is {}",
        style("*").green().bold(),
        id,
        data["status"].as_str().unwrap_or("cancelled")
    );
    println!();
    Ok(())
}

pub async fn handle_signal(
    server: &str,
    execution_id: &str,
    decision: Value,
    json: bool,
) -> Result<()> {
    let id = parse_id(execution_id, "execution")?;
    let client = ServerClient::new(server)?;
    let data = client
        .post(&format!("/executions/{id}/signal"), &decision)
        .await?;

    if json {
        return print_json(&data);
    }
    let verb = match data["decision"].as_str() {
        Some("reject") => "Rejected",
        _ => "Approved",
    };
    println!();
    println!(
        "  {} {verb} task '{}' of execution {}",
        style("*").green().bold(),
        style(data["task_id"].as_str().unwrap_or_default()).cyan(),
        id
    );
    println!();
    Ok(())
}

/// Signal body for an approval.
pub fn approval_body(task_id: &str, output: Option<&str>, actor: Option<String>) -> Result<Value> {
    let output = output
        .map(|raw| serde_json::from_str::<Value>(raw).context("Invalid JSON output"))
        .transpose()?;
    Ok(json!({
        "task_id": task_id,
        "decision": "approve",
        "output": output,
        "actor": actor,
    }))
}

/// Signal body for a rejection.
pub fn rejection_body(task_id: &str, reason: Option<String>, actor: Option<String>) -> Value {
    json!({
        "task_id": task_id,
        "decision": "reject",
        "reason": reason,
        "actor": actor,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_envelope_yields_data() {
        let data = unwrap_envelope(200, json!({ "data": { "status": "cancelled" }, "meta": {} }))
            .unwrap();
        assert_eq!(data["status"], "cancelled");
    }

    #[test]
    fn test_error_envelope_yields_message() {
        let err = unwrap_envelope(
            409,
            json!({ "data": null, "errors": [{ "code": "INVALID_STATE", "message": "invalid state: done" }] }),
        )
        .unwrap_err();
        let text = err.to_string();
        assert!(text.contains("invalid state: done"));
        assert!(text.contains("HTTP 409"));
    }

    #[test]
    fn test_signal_bodies() {
        let approve = approval_body("review", Some(r#"{"ok":true}"#), Some("alice".into())).unwrap();
        assert_eq!(approve["decision"], "approve");
        assert_eq!(approve["output"]["ok"], true);
        assert!(approval_body("review", Some("{nope"), None).is_err());

        let reject = rejection_body("review", Some("too risky".into()), None);
        assert_eq!(reject["decision"], "reject");
        assert_eq!(reject["reason"], "too risky");
    }
}
