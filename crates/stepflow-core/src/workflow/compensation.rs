//! Error/compensation coordinator.
//!
//! Consulted once a task has exhausted its retries. The definition's
//! [`ErrorHandler`] picks the effect:
//!
//! - `Fail` -- the task stays `Failed`; the execution fails once nothing
//!   else can make progress.
//! - `Ignore` -- the task stays `Failed` but counts as satisfied, so its
//!   dependents run with a null output for it.
//! - `Retry` -- a fresh execution of the same definition and input is
//!   started, back-referencing this one. Fires at most once per execution
//!   and never from an execution that is itself such a retry.
//! - `Compensate` -- registered compensation actions run best-effort for
//!   the failed task (first) and then for completed tasks in reverse
//!   dependency order; the execution then fails. Fires at most once.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use stepflow_types::event::{LogEvent, LogLevel};
use stepflow_types::workflow::{CompensationAction, ErrorHandler, ErrorHandlerKind, StepConfig};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::dag::reverse_dependency_order;
use super::invoker::{InvocationRequest, StepError, StepInvoker, invoke_with_deadline};
use super::log_bus::LogBus;

/// What the scheduler must do about a task that gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureEffect {
    Fail,
    Ignore,
    RetryExecution,
    Compensate,
}

#[derive(Debug, thiserror::Error)]
#[error("compensation for task '{task_id}' failed: {source}")]
pub struct CompensationError {
    pub task_id: String,
    #[source]
    pub source: StepError,
}

/// A task eligible for compensation.
#[derive(Debug, Clone)]
pub struct CompensationTarget {
    pub task_id: String,
    pub step_id: String,
    /// Task ids this task depended on (siblings and its parent composite).
    pub depends_on: Vec<String>,
}

/// One compensation to run, with its input already resolved.
#[derive(Debug, Clone)]
pub struct PlannedCompensation {
    pub task_id: String,
    pub action: CompensationAction,
    pub input: Value,
}

#[derive(Debug, Default)]
pub struct CompensationReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<CompensationError>,
}

#[derive(Debug)]
pub struct ErrorCoordinator {
    handler: ErrorHandler,
    allow_execution_retry: bool,
    retry_requested: bool,
    compensation_started: bool,
}

impl ErrorCoordinator {
    pub fn new(handler: ErrorHandler, allow_execution_retry: bool) -> Self {
        Self {
            handler,
            allow_execution_retry,
            retry_requested: false,
            compensation_started: false,
        }
    }

    /// Decide the effect of a task giving up. One-shot effects degrade to
    /// `Fail` once used.
    pub fn handle(&mut self) -> FailureEffect {
        match self.handler.kind {
            ErrorHandlerKind::Fail => FailureEffect::Fail,
            ErrorHandlerKind::Ignore => FailureEffect::Ignore,
            ErrorHandlerKind::Retry => {
                if self.allow_execution_retry && !self.retry_requested {
                    self.retry_requested = true;
                    FailureEffect::RetryExecution
                } else {
                    FailureEffect::Fail
                }
            }
            ErrorHandlerKind::Compensate => {
                if self.compensation_started {
                    FailureEffect::Fail
                } else {
                    self.compensation_started = true;
                    FailureEffect::Compensate
                }
            }
        }
    }

    /// Compensation registered for a step, if any.
    pub fn action_for(&self, step_id: &str) -> Option<&CompensationAction> {
        self.handler
            .compensations
            .iter()
            .find(|c| c.step_id == step_id)
    }

    /// Order compensations: the failed task first, then completed tasks in
    /// reverse dependency order. Tasks without a registered action are dropped.
    pub fn plan(
        &self,
        failed: Option<&CompensationTarget>,
        completed: &[CompensationTarget],
    ) -> Vec<(String, CompensationAction)> {
        let mut plan = Vec::new();
        if let Some(target) = failed {
            if let Some(action) = self.action_for(&target.step_id) {
                plan.push((target.task_id.clone(), action.clone()));
            }
        }

        let nodes: Vec<(String, Vec<String>)> = completed
            .iter()
            .map(|t| (t.task_id.clone(), t.depends_on.clone()))
            .collect();
        let by_task: HashMap<&str, &CompensationTarget> =
            completed.iter().map(|t| (t.task_id.as_str(), t)).collect();
        for task_id in reverse_dependency_order(&nodes) {
            let Some(target) = by_task.get(task_id.as_str()) else {
                continue;
            };
            if let Some(action) = self.action_for(&target.step_id) {
                plan.push((task_id, action.clone()));
            }
        }
        plan
    }
}

/// Run planned compensations one after another through the Service invoker.
/// Failures are logged and collected; they never trigger another round.
pub async fn run_compensations(
    execution_id: Uuid,
    plan: Vec<PlannedCompensation>,
    invoker: Option<Arc<dyn StepInvoker>>,
    timeout: Duration,
    log_bus: Arc<LogBus>,
    cancel: CancellationToken,
) -> CompensationReport {
    let mut report = CompensationReport::default();
    for planned in plan {
        let task_id = planned.task_id.clone();
        let action = &planned.action;
        log_bus.publish(
            LogEvent::new(
                execution_id,
                LogLevel::Info,
                format!("compensating via {}.{}", action.target, action.method),
            )
            .with_task(task_id.as_str())
            .with_status("compensating"),
        );

        let result = match &invoker {
            Some(invoker) => {
                let request = InvocationRequest {
                    execution_id,
                    task_id: format!("compensate:{task_id}"),
                    step_id: action.step_id.clone(),
                    config: StepConfig::Service {
                        target: action.target.clone(),
                        method: action.method.clone(),
                        timeout_ms: Some(timeout.as_millis() as u64),
                    },
                    input: planned.input.clone(),
                    deadline: Some(Instant::now() + timeout),
                    cancel: cancel.child_token(),
                };
                invoke_with_deadline(invoker.as_ref(), request).await
            }
            None => Err(StepError::NoInvoker(stepflow_types::workflow::StepKind::Service)),
        };

        match result {
            Ok(output) => {
                log_bus.publish(
                    LogEvent::new(execution_id, LogLevel::Info, "compensation completed")
                        .with_task(task_id.as_str())
                        .with_status("compensated")
                        .with_data(json!({ "output": output })),
                );
                report.succeeded.push(task_id);
            }
            Err(source) => {
                let error = CompensationError { task_id, source };
                log_bus.publish(
                    LogEvent::new(execution_id, LogLevel::Error, error.to_string())
                        .with_task(error.task_id.as_str())
                        .with_status("compensation_failed"),
                );
                report.failed.push(error);
            }
        }
    }
    report
}
