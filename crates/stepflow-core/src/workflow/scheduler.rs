//! Per-execution scheduler actor.
//!
//! Every live execution is driven by one [`ExecutionActor`] spawned on the
//! Tokio runtime. The actor exclusively owns the execution's [`TaskGraph`];
//! invocations, timers and external requests (cancel, human decisions,
//! snapshots) all reach it as [`SchedulerMsg`]s on a single inbox, so task
//! state is never mutated concurrently and every transition is persisted and
//! published in the order it happened.
//!
//! # Execution flow
//!
//! 1. Wait for an execution slot (when `max_concurrent_executions` is set).
//! 2. Mark the execution `Running` and arm the workflow timeout.
//! 3. Activate every ready task; settle composites whose nested tasks are done.
//! 4. React to inbox messages, re-running step 3 after each one.
//! 5. Finalize once nothing is running or ready: `Completed` when every
//!    top-level task is satisfied, otherwise `Failed`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde_json::{Map, Value, json};
use stepflow_types::error::RepositoryError;
use stepflow_types::event::{LogEvent, LogLevel};
use stepflow_types::execution::{
    Execution, ExecutionDetails, ExecutionStatus, HumanDecision, TaskStatus,
};
use stepflow_types::workflow::{StepConfig, StepKind, WorkflowDefinition};
use tokio::sync::{OwnedSemaphorePermit, mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::repository::workflow::WorkflowRepository;

use super::compensation::{
    CompensationReport, CompensationTarget, ErrorCoordinator, FailureEffect, PlannedCompensation,
    run_compensations,
};
use super::context::ExecutionScope;
use super::engine::{EngineError, Runtime};
use super::invoker::{InvocationRequest, StepError, invoke_with_deadline};
use super::kinds::{Activation, ActivationContext, ChildGroup, ChildOutcome};
use super::retry::{RetryDecision, RetryPolicyEngine};
use super::task_graph::TaskGraph;

/// `trigger_id` of executions started by the `Retry` error handler. Such
/// executions never trigger another execution-level retry.
pub const AUTO_RETRY_TRIGGER: &str = "error-handler:retry";

/// Execution metadata key set while the terminal state exists only in
/// memory because the repository refused it.
pub const UNSAVED_METADATA_KEY: &str = "persist_error";

const FINAL_WRITE_ATTEMPTS: u32 = 3;
const FINAL_WRITE_BACKOFF: Duration = Duration::from_millis(50);

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub(crate) enum TimerPurpose {
    RetryBackoff,
    WaitElapsed,
    HumanTimeout(Duration),
}

pub(crate) enum SchedulerMsg {
    InvocationFinished {
        task: usize,
        token: u64,
        result: Result<Value, StepError>,
    },
    TimerFired {
        task: usize,
        token: u64,
        purpose: TimerPurpose,
    },
    Signal {
        task_id: String,
        decision: HumanDecision,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Cancel {
        reason: Option<String>,
        reply: oneshot::Sender<Result<Execution, EngineError>>,
    },
    Snapshot {
        reply: oneshot::Sender<ExecutionDetails>,
    },
    WorkflowTimeout,
    CompensationFinished(CompensationReport),
}

/// How the engine reaches a live execution.
#[derive(Clone)]
pub(crate) struct ExecutionHandle {
    pub(crate) tx: mpsc::UnboundedSender<SchedulerMsg>,
    pub(crate) status: watch::Receiver<ExecutionStatus>,
}

/// Ask the engine to start a fresh execution after `original` failed.
pub(crate) struct RetryRequest {
    pub(crate) original: Uuid,
    pub(crate) definition: Arc<WorkflowDefinition>,
    pub(crate) input: Map<String, Value>,
    pub(crate) triggered_by: Option<String>,
}

/// Write every task record, then the execution itself.
pub(crate) async fn save_details<R: WorkflowRepository>(
    repo: &R,
    details: &ExecutionDetails,
) -> Result<(), RepositoryError> {
    for task in &details.tasks {
        repo.save_task(task).await?;
    }
    let mut execution = details.execution.clone();
    execution.metadata.remove(UNSAVED_METADATA_KEY);
    repo.save_execution(&execution).await
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

pub(crate) struct ExecutionActor<R: WorkflowRepository + 'static> {
    rt: Arc<Runtime<R>>,
    definition: Arc<WorkflowDefinition>,
    execution: Execution,
    graph: TaskGraph,
    base_scope: ExecutionScope,
    coordinator: ErrorCoordinator,
    tx: mpsc::UnboundedSender<SchedulerMsg>,
    status_tx: watch::Sender<ExecutionStatus>,
    /// Cancelled on finalize: stops timers and in-flight invocations.
    shutdown: CancellationToken,
    /// First task that gave up without being ignored, with its error.
    failure: Option<(String, String)>,
    retry_pending: bool,
    compensating: bool,
    finished: bool,
    /// Set when an intermediate write was lost; the final write then stores
    /// every task again.
    dirty: AtomicBool,
    permit: Option<OwnedSemaphorePermit>,
}

impl<R: WorkflowRepository + 'static> ExecutionActor<R> {
    pub(crate) fn new(
        rt: Arc<Runtime<R>>,
        definition: Arc<WorkflowDefinition>,
        execution: Execution,
        graph: TaskGraph,
        tx: mpsc::UnboundedSender<SchedulerMsg>,
        status_tx: watch::Sender<ExecutionStatus>,
    ) -> Self {
        let mut params = definition.parameters.clone();
        params.extend(execution.input.clone());
        let base_scope = ExecutionScope::new(execution.id, params);
        let allow_execution_retry = execution.trigger_id.as_deref() != Some(AUTO_RETRY_TRIGGER);
        let coordinator =
            ErrorCoordinator::new(definition.effective_error_handler(), allow_execution_retry);
        Self {
            rt,
            definition,
            execution,
            graph,
            base_scope,
            coordinator,
            tx,
            status_tx,
            shutdown: CancellationToken::new(),
            failure: None,
            retry_pending: false,
            compensating: false,
            finished: false,
            dirty: AtomicBool::new(false),
            permit: None,
        }
    }

    pub(crate) async fn run(mut self, mut rx: mpsc::UnboundedReceiver<SchedulerMsg>) {
        if !self.acquire_slot(&mut rx).await {
            return;
        }
        self.start().await;
        while !self.finished {
            let Some(msg) = rx.recv().await else {
                break;
            };
            self.handle(msg).await;
        }
    }

    /// Wait for a concurrency slot while staying responsive to cancel and
    /// snapshot requests. Returns `false` if the execution ended meanwhile.
    async fn acquire_slot(&mut self, rx: &mut mpsc::UnboundedReceiver<SchedulerMsg>) -> bool {
        let Some(slots) = self.rt.slots.clone() else {
            return true;
        };
        if slots.available_permits() == 0 {
            self.emit_execution(LogLevel::Info, "waiting for an execution slot");
        }
        let acquire = slots.acquire_owned();
        tokio::pin!(acquire);
        loop {
            tokio::select! {
                permit = &mut acquire => {
                    self.permit = permit.ok();
                    return true;
                }
                msg = rx.recv() => match msg {
                    Some(SchedulerMsg::Cancel { reason, reply }) => {
                        let result = self.cancel(reason).await;
                        let _ = reply.send(result);
                        return false;
                    }
                    Some(SchedulerMsg::Snapshot { reply }) => {
                        let _ = reply.send(self.details());
                    }
                    Some(SchedulerMsg::Signal { reply, .. }) => {
                        let _ = reply.send(Err(EngineError::InvalidState(
                            "execution has not started yet".to_string(),
                        )));
                    }
                    Some(_) => {}
                    None => return false,
                },
            }
        }
    }

    async fn start(&mut self) {
        self.execution.status = ExecutionStatus::Running;
        self.execution.started_at = Some(Utc::now());
        self.persist_execution().await;
        let _ = self.status_tx.send(ExecutionStatus::Running);
        self.emit_execution(
            LogLevel::Info,
            format!("execution of '{}' started", self.execution.definition_name),
        );
        tracing::info!(
            execution_id = %self.execution.id,
            definition_id = %self.execution.definition_id,
            tasks = self.graph.len(),
            "execution started"
        );
        if let Some(timeout) = self.definition.timeout() {
            self.spawn_timer(timeout, SchedulerMsg::WorkflowTimeout);
        }
        self.schedule().await;
    }

    async fn handle(&mut self, msg: SchedulerMsg) {
        match msg {
            SchedulerMsg::InvocationFinished {
                task,
                token,
                result,
            } => {
                if !self.is_current(task, token) {
                    return;
                }
                self.graph.node_mut(task).cancel = None;
                match result {
                    Ok(output) => self.complete_task(task, output).await,
                    Err(error) => self.attempt_failed(task, error).await,
                }
                self.schedule().await;
            }
            SchedulerMsg::TimerFired {
                task,
                token,
                purpose,
            } => {
                if !self.is_current(task, token) {
                    return;
                }
                match purpose {
                    TimerPurpose::RetryBackoff => self.retry_task(task).await,
                    TimerPurpose::WaitElapsed => {
                        self.complete_task(task, json!({ "resumed_at": Utc::now() }))
                            .await;
                    }
                    TimerPurpose::HumanTimeout(timeout) => self.human_timeout(task, timeout).await,
                }
                self.schedule().await;
            }
            SchedulerMsg::Signal {
                task_id,
                decision,
                reply,
            } => {
                let result = self.signal(&task_id, decision).await;
                let _ = reply.send(result);
                self.schedule().await;
            }
            SchedulerMsg::Cancel { reason, reply } => {
                let result = self.cancel(reason).await;
                let _ = reply.send(result);
            }
            SchedulerMsg::Snapshot { reply } => {
                let _ = reply.send(self.details());
            }
            SchedulerMsg::WorkflowTimeout => self.time_out().await,
            SchedulerMsg::CompensationFinished(report) => self.finish_compensation(report).await,
        }
    }

    fn is_current(&self, task: usize, token: u64) -> bool {
        let node = self.graph.node(task);
        !self.finished && node.status() == TaskStatus::Running && node.token == token
    }

    fn halted(&self) -> bool {
        self.finished || self.compensating
    }

    // -----------------------------------------------------------------------
    // Scheduling
    // -----------------------------------------------------------------------

    /// Start ready tasks and settle composites until nothing changes, then
    /// check whether the execution is done.
    async fn schedule(&mut self) {
        loop {
            if self.halted() {
                return;
            }
            let ready = self.graph.ready();
            let settled = self.graph.settled_composites();
            if ready.is_empty() && settled.is_empty() {
                break;
            }
            for idx in ready {
                if self.halted() {
                    return;
                }
                self.activate(idx).await;
            }
            for idx in settled {
                if self.halted() {
                    return;
                }
                self.settle_composite(idx).await;
            }
        }
        self.check_completion().await;
    }

    async fn activate(&mut self, idx: usize) {
        {
            let record = &mut self.graph.node_mut(idx).record;
            record.status = TaskStatus::Running;
            record.started_at = Some(Utc::now());
            record.error = None;
        }
        self.emit_task(idx, LogLevel::Info, "task running", json!({ "attempt": 1 }));
        self.run_attempt(idx).await;
    }

    /// Backoff elapsed: count the retry and run the next attempt.
    async fn retry_task(&mut self, idx: usize) {
        let attempt = {
            let record = &mut self.graph.node_mut(idx).record;
            record.retry_count += 1;
            record.error = None;
            record.retry_count + 1
        };
        self.emit_task(
            idx,
            LogLevel::Info,
            format!("task running (attempt {attempt})"),
            json!({ "attempt": attempt }),
        );
        self.run_attempt(idx).await;
    }

    async fn run_attempt(&mut self, idx: usize) {
        let step = Arc::clone(&self.graph.node(idx).step);
        let scope = self.graph.scope_for(idx, &self.base_scope);
        let input = scope.resolve_input(&step.input);
        self.graph.node_mut(idx).record.input = Some(input.clone());

        let rt = Arc::clone(&self.rt);
        let activation = match rt.kinds.get(step.kind()) {
            Some(handler) => {
                let ctx = ActivationContext {
                    scope: &scope,
                    evaluator: rt.evaluator.as_ref(),
                    config: &rt.config,
                    now: Utc::now(),
                };
                handler.activate(&step, &ctx)
            }
            None => Err(StepError::Failed(format!(
                "no handler registered for {} steps",
                step.kind()
            ))),
        };
        drop(scope);
        self.persist_task(idx).await;

        match activation {
            Err(error) => self.attempt_failed(idx, error).await,
            Ok(Activation::Invoke { timeout }) => self.dispatch(idx, input, timeout),
            Ok(Activation::Expand {
                groups,
                max_concurrency,
                detail,
            }) => {
                let added = self.graph.expand(idx, &groups, max_concurrency);
                self.emit_task(
                    idx,
                    LogLevel::Debug,
                    format!("expanded into {} nested task(s)", added.len()),
                    detail,
                );
                for child in added {
                    self.persist_task(child).await;
                    if self.graph.node(child).status() == TaskStatus::Skipped {
                        self.emit_task(child, LogLevel::Debug, "task skipped", Value::Null);
                    }
                }
            }
            Ok(Activation::Sleep { duration }) => {
                let token = self.bump(idx);
                self.emit_task(
                    idx,
                    LogLevel::Debug,
                    format!("waiting {}ms", duration.as_millis()),
                    json!({ "duration_ms": duration.as_millis() as u64 }),
                );
                self.spawn_timer(
                    duration,
                    SchedulerMsg::TimerFired {
                        task: idx,
                        token,
                        purpose: TimerPurpose::WaitElapsed,
                    },
                );
            }
            Ok(Activation::AwaitSignal { assignee, timeout }) => {
                let token = self.bump(idx);
                self.graph.node_mut(idx).awaiting_signal = true;
                self.emit_task(
                    idx,
                    LogLevel::Info,
                    format!("awaiting decision from {assignee}"),
                    json!({ "assignee": assignee }),
                );
                self.notify_assignee(idx, &assignee, input);
                if let Some(timeout) = timeout {
                    self.spawn_timer(
                        timeout,
                        SchedulerMsg::TimerFired {
                            task: idx,
                            token,
                            purpose: TimerPurpose::HumanTimeout(timeout),
                        },
                    );
                }
            }
            Ok(Activation::Complete(output)) => self.complete_task(idx, output).await,
        }
    }

    /// Hand one attempt to the kind's invoker on a separate task.
    fn dispatch(&mut self, idx: usize, input: Value, timeout: Option<Duration>) {
        let kind = self.graph.node(idx).step.kind();
        let invoker = self.rt.invokers.get(kind);
        let cancel = self.shutdown.child_token();
        let token = self.bump(idx);
        let node = self.graph.node_mut(idx);
        node.cancel = Some(cancel.clone());
        let request = InvocationRequest {
            execution_id: self.execution.id,
            task_id: node.record.task_id.clone(),
            step_id: node.record.step_id.clone(),
            config: node.step.config.clone(),
            input,
            deadline: timeout.map(|t| Instant::now() + t),
            cancel,
        };

        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = match invoker {
                Some(invoker) => invoke_with_deadline(invoker.as_ref(), request).await,
                None => Err(StepError::NoInvoker(kind)),
            };
            let _ = tx.send(SchedulerMsg::InvocationFinished {
                task: idx,
                token,
                result,
            });
        });
    }

    /// Best-effort notification of a HumanTask assignee through the
    /// HumanTask invoker, when one is registered.
    fn notify_assignee(&self, idx: usize, assignee: &str, input: Value) {
        let Some(invoker) = self.rt.invokers.get(StepKind::HumanTask) else {
            return;
        };
        let node = self.graph.node(idx);
        let timeout = self.rt.config.default_service_timeout();
        let request = InvocationRequest {
            execution_id: self.execution.id,
            task_id: node.record.task_id.clone(),
            step_id: node.record.step_id.clone(),
            config: node.step.config.clone(),
            input: json!({ "assignee": assignee, "input": input }),
            deadline: Some(Instant::now() + timeout),
            cancel: self.shutdown.child_token(),
        };
        tokio::spawn(async move {
            let execution_id = request.execution_id;
            let task_id = request.task_id.clone();
            if let Err(e) = invoke_with_deadline(invoker.as_ref(), request).await {
                tracing::warn!(
                    %execution_id,
                    task_id = %task_id,
                    error = %e,
                    "assignee notification failed"
                );
            }
        });
    }

    fn spawn_timer(&self, delay: Duration, msg: SchedulerMsg) {
        let tx = self.tx.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = tx.send(msg);
                }
            }
        });
    }

    /// Invalidate outstanding completions and timers of a task.
    fn bump(&mut self, idx: usize) -> u64 {
        let node = self.graph.node_mut(idx);
        node.token += 1;
        node.token
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    async fn complete_task(&mut self, idx: usize, output: Value) {
        self.bump(idx);
        let node = self.graph.node_mut(idx);
        node.awaiting_signal = false;
        node.cancel = None;
        node.record.status = TaskStatus::Completed;
        node.record.output = Some(output);
        node.record.error = None;
        node.record.completed_at = Some(Utc::now());
        self.persist_task(idx).await;
        self.emit_task(idx, LogLevel::Info, "task completed", Value::Null);
    }

    async fn mark_failed(&mut self, idx: usize, message: String) {
        self.bump(idx);
        let node = self.graph.node_mut(idx);
        node.awaiting_signal = false;
        node.cancel = None;
        node.record.status = TaskStatus::Failed;
        node.record.error = Some(message.clone());
        node.record.completed_at = Some(Utc::now());
        self.persist_task(idx).await;
        self.emit_task(idx, LogLevel::Error, format!("task failed: {message}"), Value::Null);
    }

    /// A single attempt failed: back off and retry, or give up.
    async fn attempt_failed(&mut self, idx: usize, error: StepError) {
        let node = self.graph.node(idx);
        let decision = RetryPolicyEngine::should_retry(&node.record, node.step.retry.as_ref());
        let attempt = node.record.retry_count + 1;
        match decision {
            RetryDecision::Retry(delay) => {
                let token = self.bump(idx);
                let node = self.graph.node_mut(idx);
                node.awaiting_signal = false;
                node.cancel = None;
                node.record.error = Some(error.to_string());
                self.persist_task(idx).await;
                self.emit_task(
                    idx,
                    LogLevel::Warn,
                    format!(
                        "attempt {attempt} failed: {error}; retrying in {}ms",
                        delay.as_millis()
                    ),
                    json!({ "attempt": attempt, "delay_ms": delay.as_millis() as u64 }),
                );
                self.spawn_timer(
                    delay,
                    SchedulerMsg::TimerFired {
                        task: idx,
                        token,
                        purpose: TimerPurpose::RetryBackoff,
                    },
                );
            }
            RetryDecision::GiveUp => {
                let message = if attempt > 1 {
                    format!("retry exhausted after {attempt} attempts: {error}")
                } else {
                    error.to_string()
                };
                self.give_up(idx, message).await;
            }
        }
    }

    /// Mark a task `Failed` and apply the definition's error handler.
    async fn give_up(&mut self, idx: usize, message: String) {
        self.mark_failed(idx, message.clone()).await;
        match self.coordinator.handle() {
            FailureEffect::Ignore => {
                self.graph.node_mut(idx).ignored = true;
                self.emit_task(
                    idx,
                    LogLevel::Warn,
                    "failure ignored by error handler",
                    Value::Null,
                );
            }
            FailureEffect::Fail => self.record_failure(idx, message),
            FailureEffect::RetryExecution => {
                self.record_failure(idx, message);
                self.retry_pending = true;
            }
            FailureEffect::Compensate => {
                self.record_failure(idx, message);
                self.begin_compensation(idx).await;
            }
        }
    }

    fn record_failure(&mut self, idx: usize, message: String) {
        if self.failure.is_none() {
            self.failure = Some((self.graph.node(idx).task_id().to_string(), message));
        }
    }

    /// A composite whose nested tasks can no longer progress completes with
    /// the handler's aggregated output, or fails if any of them failed.
    async fn settle_composite(&mut self, idx: usize) {
        if !self.graph.is_settled(idx) {
            return;
        }
        if self.graph.children_satisfied(idx) {
            let output = {
                let node = self.graph.node(idx);
                let outcomes: Vec<ChildOutcome<'_>> = node
                    .children
                    .iter()
                    .map(|&c| {
                        let child = self.graph.node(c);
                        ChildOutcome {
                            step_id: &child.record.step_id,
                            iteration: child.record.iteration,
                            status: child.status(),
                            output: child.record.output.as_ref(),
                        }
                    })
                    .collect();
                self.rt
                    .kinds
                    .get(node.step.kind())
                    .map_or(Value::Null, |h| h.collect_output(&outcomes))
            };
            self.complete_task(idx, output).await;
        } else {
            let message = match self.graph.failed_child(idx) {
                Some(child) => format!("nested task '{}' failed", self.graph.node(child).task_id()),
                None => "nested tasks could not complete".to_string(),
            };
            self.mark_failed(idx, message).await;
        }
    }

    async fn check_completion(&mut self) {
        if self.halted() || self.graph.any_running() || !self.graph.ready().is_empty() {
            return;
        }
        if self.graph.roots_satisfied() {
            let output: Map<String, Value> = self
                .graph
                .roots()
                .iter()
                .map(|&r| {
                    let record = &self.graph.node(r).record;
                    (
                        record.step_id.clone(),
                        record.output.clone().unwrap_or(Value::Null),
                    )
                })
                .collect();
            self.execution.output = Some(Value::Object(output));
            self.finalize(ExecutionStatus::Completed).await;
        } else {
            self.annotate_unreached().await;
            self.finalize(ExecutionStatus::Failed).await;
        }
    }

    /// Record on every still-`Pending` task why it never ran.
    async fn annotate_unreached(&mut self) {
        let pending: Vec<usize> = self
            .graph
            .nodes()
            .filter(|(_, n)| n.status() == TaskStatus::Pending)
            .map(|(i, _)| i)
            .collect();
        for idx in pending {
            let reason = match self.graph.blocking_dependency(idx) {
                Some(dep) => format!("dependency unsatisfiable: '{dep}' did not complete"),
                None => match self.graph.node(idx).parent {
                    Some(p) => format!(
                        "dependency unsatisfiable: parent '{}' is {}",
                        self.graph.node(p).task_id(),
                        self.graph.node(p).status()
                    ),
                    None => "not started: execution stopped".to_string(),
                },
            };
            self.graph.node_mut(idx).record.error = Some(reason.clone());
            self.persist_task(idx).await;
            self.emit_task(idx, LogLevel::Warn, reason, Value::Null);
        }
    }

    /// Cancel running tasks (and optionally pending ones) with `message`.
    async fn stop_tasks(&mut self, include_pending: bool, message: &str) {
        let targets: Vec<usize> = self
            .graph
            .nodes()
            .filter(|(_, n)| {
                n.status() == TaskStatus::Running
                    || (include_pending && n.status() == TaskStatus::Pending)
            })
            .map(|(i, _)| i)
            .collect();
        for idx in targets {
            self.bump(idx);
            let node = self.graph.node_mut(idx);
            if let Some(cancel) = node.cancel.take() {
                cancel.cancel();
            }
            node.awaiting_signal = false;
            node.record.status = TaskStatus::Cancelled;
            node.record.error = Some(message.to_string());
            node.record.completed_at = Some(Utc::now());
            self.persist_task(idx).await;
            self.emit_task(idx, LogLevel::Warn, "task cancelled", Value::Null);
        }
    }

    async fn finalize(&mut self, status: ExecutionStatus) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.shutdown.cancel();

        self.execution.status = status;
        self.execution.completed_at = Some(Utc::now());
        if status == ExecutionStatus::Failed {
            if let Some((task_id, message)) = self.failure.clone() {
                self.execution.failed_task_id = Some(task_id);
                self.execution.error = Some(message);
            } else if self.execution.error.is_none() {
                self.execution.error = Some("execution failed".to_string());
            }
        }
        self.persist_final().await;

        let level = match status {
            ExecutionStatus::Completed => LogLevel::Info,
            ExecutionStatus::Cancelled => LogLevel::Warn,
            _ => LogLevel::Error,
        };
        self.emit_execution(level, format!("execution {status}"));
        tracing::info!(
            execution_id = %self.execution.id,
            status = %status,
            failed_task_id = self.execution.failed_task_id.as_deref().unwrap_or("-"),
            "execution finished"
        );

        if status == ExecutionStatus::Failed && self.retry_pending {
            self.request_execution_retry();
        }

        let _ = self.status_tx.send(status);
        self.rt.live.remove(&self.execution.id);
        self.rt.log_bus.close(&self.execution.id);
        drop(self.permit.take());
    }

    fn request_execution_retry(&self) {
        let request = RetryRequest {
            original: self.execution.id,
            definition: Arc::clone(&self.definition),
            input: self.execution.input.clone(),
            triggered_by: self.execution.triggered_by.clone(),
        };
        if self.rt.retry_tx.send(request).is_err() {
            tracing::warn!(
                execution_id = %self.execution.id,
                "engine shut down, execution-level retry dropped"
            );
        }
    }

    // -----------------------------------------------------------------------
    // External requests
    // -----------------------------------------------------------------------

    async fn cancel(&mut self, reason: Option<String>) -> Result<Execution, EngineError> {
        if self.finished {
            return Err(EngineError::InvalidState(format!(
                "execution {} is already {}",
                self.execution.id, self.execution.status
            )));
        }
        let reason = reason.unwrap_or_else(|| "cancelled by request".to_string());
        self.stop_tasks(true, &format!("cancelled: {reason}")).await;
        self.execution
            .metadata
            .insert("cancel_reason".to_string(), Value::String(reason));
        self.finalize(ExecutionStatus::Cancelled).await;
        Ok(self.execution.clone())
    }

    async fn time_out(&mut self) {
        if self.finished {
            return;
        }
        let message = format!(
            "workflow timed out after {}ms",
            self.definition.timeout_ms.unwrap_or_default()
        );
        self.stop_tasks(true, &message).await;
        self.execution.error = Some(message);
        self.finalize(ExecutionStatus::TimedOut).await;
    }

    async fn signal(&mut self, task_id: &str, decision: HumanDecision) -> Result<(), EngineError> {
        if self.halted() {
            return Err(EngineError::InvalidState(format!(
                "execution {} is no longer accepting decisions",
                self.execution.id
            )));
        }
        let idx = self.graph.find(task_id).ok_or_else(|| EngineError::NotFound {
            entity: "task",
            id: task_id.to_string(),
        })?;
        let node = self.graph.node(idx);
        if node.status() != TaskStatus::Running || !node.awaiting_signal {
            return Err(EngineError::InvalidState(format!(
                "task '{task_id}' is not awaiting a decision"
            )));
        }
        self.graph.node_mut(idx).awaiting_signal = false;

        match decision {
            HumanDecision::Approve { output, actor } => {
                let who = actor.as_deref().unwrap_or("unknown");
                self.emit_task(idx, LogLevel::Info, format!("approved by {who}"), Value::Null);
                let output = output.unwrap_or_else(|| json!({ "approved": true, "actor": actor }));
                self.complete_task(idx, output).await;
            }
            HumanDecision::Reject { reason, actor } => {
                let who = actor.as_deref().unwrap_or("unknown");
                self.emit_task(idx, LogLevel::Warn, format!("rejected by {who}"), Value::Null);
                self.attempt_failed(idx, StepError::Rejected(reason)).await;
            }
        }
        Ok(())
    }

    async fn human_timeout(&mut self, idx: usize, timeout: Duration) {
        self.graph.node_mut(idx).awaiting_signal = false;
        let fallback = match &self.graph.node(idx).step.config {
            StepConfig::HumanTask {
                on_timeout: Some(fallback),
                ..
            } => Some((**fallback).clone()),
            _ => None,
        };
        match fallback {
            Some(fallback) => {
                self.bump(idx);
                self.emit_task(
                    idx,
                    LogLevel::Warn,
                    format!(
                        "no decision within {}ms, running fallback '{}'",
                        timeout.as_millis(),
                        fallback.id
                    ),
                    Value::Null,
                );
                let added = self
                    .graph
                    .expand(idx, &[ChildGroup::runnable(vec![fallback])], None);
                for child in added {
                    self.persist_task(child).await;
                }
            }
            None => self.attempt_failed(idx, StepError::TimedOut(timeout)).await,
        }
    }

    // -----------------------------------------------------------------------
    // Compensation
    // -----------------------------------------------------------------------

    fn compensation_target(&self, idx: usize) -> CompensationTarget {
        let node = self.graph.node(idx);
        let depends_on = node
            .deps
            .iter()
            .chain(node.children.iter())
            .map(|&d| self.graph.node(d).task_id().to_string())
            .collect();
        CompensationTarget {
            task_id: node.task_id().to_string(),
            step_id: node.record.step_id.clone(),
            depends_on,
        }
    }

    /// Stop the execution's remaining work and run compensations for the
    /// failed task and every completed task in the background.
    async fn begin_compensation(&mut self, failed: usize) {
        self.compensating = true;
        self.stop_tasks(false, "cancelled: execution is compensating")
            .await;
        self.emit_execution(LogLevel::Warn, "compensating completed tasks");

        let failed_target = self.compensation_target(failed);
        let completed: Vec<CompensationTarget> = self
            .graph
            .nodes()
            .filter(|(_, n)| n.status() == TaskStatus::Completed)
            .map(|(i, _)| self.compensation_target(i))
            .collect();
        let plan = self.coordinator.plan(Some(&failed_target), &completed);

        let planned: Vec<PlannedCompensation> = plan
            .into_iter()
            .filter_map(|(task_id, action)| {
                let idx = self.graph.find(&task_id)?;
                let record = &self.graph.node(idx).record;
                let mut scope = self.graph.scope_for(idx, &self.base_scope);
                scope.bind(
                    "task",
                    json!({
                        "id": record.task_id,
                        "input": record.input,
                        "output": record.output,
                        "error": record.error,
                    }),
                );
                let input = scope.resolve_input(&action.input);
                Some(PlannedCompensation {
                    task_id,
                    action,
                    input,
                })
            })
            .collect();

        let execution_id = self.execution.id;
        let invoker = self.rt.invokers.get(StepKind::Service);
        let timeout = self.rt.config.default_service_timeout();
        let log_bus = Arc::clone(&self.rt.log_bus);
        let cancel = self.shutdown.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let report =
                run_compensations(execution_id, planned, invoker, timeout, log_bus, cancel).await;
            let _ = tx.send(SchedulerMsg::CompensationFinished(report));
        });
    }

    async fn finish_compensation(&mut self, report: CompensationReport) {
        if self.finished {
            return;
        }
        let failed: Vec<Value> = report
            .failed
            .iter()
            .map(|e| json!({ "task_id": e.task_id, "error": e.source.to_string() }))
            .collect();
        if failed.is_empty() {
            self.emit_execution(
                LogLevel::Info,
                format!("compensation finished ({} succeeded)", report.succeeded.len()),
            );
        } else {
            self.emit_execution(
                LogLevel::Warn,
                format!("{} compensation(s) failed", failed.len()),
            );
        }
        self.execution.metadata.insert(
            "compensation".to_string(),
            json!({ "succeeded": report.succeeded, "failed": failed }),
        );
        self.annotate_unreached().await;
        self.finalize(ExecutionStatus::Failed).await;
    }

    // -----------------------------------------------------------------------
    // Persistence and events
    // -----------------------------------------------------------------------

    fn details(&self) -> ExecutionDetails {
        ExecutionDetails {
            execution: self.execution.clone(),
            tasks: self.graph.snapshot(),
        }
    }

    async fn persist_task(&self, idx: usize) {
        let record = &self.graph.node(idx).record;
        if let Err(e) = self.rt.repo.save_task(record).await {
            self.dirty.store(true, Ordering::Relaxed);
            tracing::warn!(
                execution_id = %self.execution.id,
                task_id = %record.task_id,
                error = %e,
                "failed to persist task state"
            );
        }
    }

    async fn persist_execution(&self) {
        if let Err(e) = self.rt.repo.save_execution(&self.execution).await {
            self.dirty.store(true, Ordering::Relaxed);
            tracing::warn!(
                execution_id = %self.execution.id,
                error = %e,
                "failed to persist execution state"
            );
        }
    }

    /// Store the terminal state, retrying a few times. If the repository
    /// keeps refusing, the final snapshot is parked in the runtime so the
    /// engine keeps answering with it and stores it on a later lookup.
    async fn persist_final(&mut self) {
        let full = self.dirty.load(Ordering::Relaxed);
        let mut last_error = String::new();
        for attempt in 0..FINAL_WRITE_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(FINAL_WRITE_BACKOFF * attempt).await;
            }
            let result = if full {
                save_details(self.rt.repo.as_ref(), &self.details()).await
            } else {
                self.rt.repo.save_execution(&self.execution).await
            };
            match result {
                Ok(()) => return,
                Err(e) => {
                    tracing::warn!(
                        execution_id = %self.execution.id,
                        attempt = attempt + 1,
                        error = %e,
                        "failed to persist final execution state"
                    );
                    last_error = e.to_string();
                }
            }
        }

        tracing::error!(
            execution_id = %self.execution.id,
            status = %self.execution.status,
            error = last_error.as_str(),
            "final execution state kept in memory until it can be stored"
        );
        self.execution
            .metadata
            .insert(UNSAVED_METADATA_KEY.to_string(), json!(last_error));
        self.rt.unsaved.insert(self.execution.id, self.details());
    }

    fn emit_execution(&self, level: LogLevel, message: impl Into<String>) {
        self.rt.log_bus.publish(
            LogEvent::new(self.execution.id, level, message)
                .with_status(self.execution.status.as_str()),
        );
    }

    fn emit_task(&self, idx: usize, level: LogLevel, message: impl Into<String>, data: Value) {
        let record = &self.graph.node(idx).record;
        self.rt.log_bus.publish(
            LogEvent::new(self.execution.id, level, message)
                .with_task(record.task_id.as_str())
                .with_status(record.status.as_str())
                .with_data(data),
        );
    }
}
