//! HTTP Service step invoker.
//!
//! A Service step `{ target, method }` is sent as `POST {base}/{target}/{method}`
//! with the resolved step input as JSON body, where `base` is the configured
//! `base_url` unless `target` is itself an absolute `http(s)://` URL. Any 2xx
//! response completes the attempt with the decoded JSON body (`null` when the
//! body is empty, a string when it is not JSON); anything else fails it.

use std::time::Duration;

use serde_json::Value;
use stepflow_core::workflow::invoker::{
    InvocationFuture, InvocationRequest, StepError, StepInvoker,
};
use stepflow_types::config::HttpInvokerConfig;
use stepflow_types::workflow::StepConfig;

/// Header carrying the execution id on every request.
pub const EXECUTION_HEADER: &str = "x-stepflow-execution-id";
/// Header carrying the task instance id on every request.
pub const TASK_HEADER: &str = "x-stepflow-task-id";

/// Longest error body echoed into a task error.
const MAX_ERROR_BODY: usize = 512;

pub struct HttpServiceInvoker {
    client: reqwest::Client,
    base_url: String,
    request_timeout: Duration,
}

impl HttpServiceInvoker {
    pub fn new(config: &HttpInvokerConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            request_timeout: Duration::from_millis(config.request_timeout_ms),
        })
    }

    /// Endpoint for a `target` / `method` pair.
    pub fn endpoint(&self, target: &str, method: &str) -> String {
        let method = method.trim_start_matches('/');
        if target.starts_with("http://") || target.starts_with("https://") {
            format!("{}/{method}", target.trim_end_matches('/'))
        } else {
            format!("{}/{}/{method}", self.base_url, target.trim_matches('/'))
        }
    }

    async fn call(&self, request: InvocationRequest) -> Result<Value, StepError> {
        let StepConfig::Service { target, method, .. } = &request.config else {
            return Err(StepError::Failed(format!(
                "HTTP invoker cannot run {} steps",
                request.config.kind()
            )));
        };
        let url = self.endpoint(target, method);
        let timeout = request
            .remaining()
            .map_or(self.request_timeout, |left| left.min(self.request_timeout));

        let response = self
            .client
            .post(&url)
            .timeout(timeout)
            .header(EXECUTION_HEADER, request.execution_id.to_string())
            .header(TASK_HEADER, request.task_id.as_str())
            .json(&request.input)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    StepError::TimedOut(timeout)
                } else {
                    StepError::Failed(format!("HTTP request to '{url}' failed: {e}"))
                }
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| {
            StepError::Failed(format!("failed to read response from '{url}': {e}"))
        })?;

        tracing::debug!(
            execution_id = %request.execution_id,
            task_id = %request.task_id,
            url = url.as_str(),
            status = status.as_u16(),
            body_len = body.len(),
            "service call finished"
        );

        if !status.is_success() {
            let mut excerpt = body;
            if excerpt.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !excerpt.is_char_boundary(cut) {
                    cut -= 1;
                }
                excerpt.truncate(cut);
            }
            return Err(StepError::Failed(format!(
                "'{url}' returned HTTP {}: {excerpt}",
                status.as_u16()
            )));
        }

        Ok(decode_body(body))
    }
}

fn decode_body(body: String) -> Value {
    if body.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str(&body).unwrap_or(Value::String(body))
}

impl StepInvoker for HttpServiceInvoker {
    fn invoke(&self, request: InvocationRequest) -> InvocationFuture<'_> {
        Box::pin(self.call(request))
    }
}
