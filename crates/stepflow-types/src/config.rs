//! Engine configuration types for Stepflow.
//!
//! `EngineConfig` represents the top-level `config.toml` in the data
//! directory that controls timeouts, log bus sizing, pagination and the
//! HTTP service invoker. All fields have sensible defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration for the orchestrator.
///
/// Loaded from `~/.stepflow/config.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Timeout for Service steps that do not declare one, in milliseconds.
    #[serde(default = "default_service_timeout_ms")]
    pub default_service_timeout_ms: u64,

    /// Timeout for HumanTask steps that do not declare one. Unset = wait forever.
    #[serde(default)]
    pub default_human_task_timeout_ms: Option<u64>,

    /// Capacity of each per-execution log bus channel.
    #[serde(default = "default_log_channel_capacity")]
    pub log_channel_capacity: usize,

    /// Upper bound on executions running at once. Unset = unbounded.
    #[serde(default)]
    pub max_concurrent_executions: Option<usize>,

    /// Page size used when a list request does not specify one.
    #[serde(default = "default_page_limit")]
    pub default_page_limit: u32,

    /// Largest page size a list request may ask for.
    #[serde(default = "default_max_page_limit")]
    pub max_page_limit: u32,

    /// HTTP Service invoker settings.
    #[serde(default)]
    pub http_invoker: HttpInvokerConfig,
}

fn default_service_timeout_ms() -> u64 {
    30_000
}

fn default_log_channel_capacity() -> usize {
    256
}

fn default_page_limit() -> u32 {
    50
}

fn default_max_page_limit() -> u32 {
    500
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_service_timeout_ms: default_service_timeout_ms(),
            default_human_task_timeout_ms: None,
            log_channel_capacity: default_log_channel_capacity(),
            max_concurrent_executions: None,
            default_page_limit: default_page_limit(),
            max_page_limit: default_max_page_limit(),
            http_invoker: HttpInvokerConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn default_service_timeout(&self) -> Duration {
        Duration::from_millis(self.default_service_timeout_ms)
    }

    pub fn default_human_task_timeout(&self) -> Option<Duration> {
        self.default_human_task_timeout_ms.map(Duration::from_millis)
    }

    /// Clamp a requested page size into `1..=max_page_limit`.
    pub fn clamp_limit(&self, requested: Option<u32>) -> u32 {
        requested
            .unwrap_or(self.default_page_limit)
            .clamp(1, self.max_page_limit.max(1))
    }
}

/// Settings for the HTTP-based Service invoker.
///
/// A Service step with `target = "billing"` and `method = "charge"` is sent as
/// `POST {base_url}/billing/charge` with the resolved input as JSON body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpInvokerConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Per-request timeout applied when the step carries no deadline.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_base_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_user_agent() -> String {
    format!("stepflow/{}", env!("CARGO_PKG_VERSION"))
}

impl Default for HttpInvokerConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout_ms: default_request_timeout_ms(),
            user_agent: default_user_agent(),
        }
    }
}
