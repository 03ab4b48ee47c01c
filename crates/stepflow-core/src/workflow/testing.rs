//! Test doubles shared by the scheduler and engine tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde_json::{Map, Value, json};
use stepflow_types::config::EngineConfig;
use stepflow_types::error::RepositoryError;
use stepflow_types::execution::{Execution, ExecutionFilter, TaskExecution};
use stepflow_types::workflow::{
    BackoffKind, CompensationAction, ErrorHandler, ErrorHandlerKind, RetryPolicy, StepConfig,
    StepDefinition, StepKind, WorkflowDefinition,
};
use tokio::time::Instant;
use uuid::Uuid;

use crate::repository::memory::InMemoryWorkflowRepository;
use crate::repository::workflow::WorkflowRepository;
use crate::repository::{Page, Paginated};

use super::engine::WorkflowEngine;
use super::invoker::{InvocationFuture, InvocationRequest, StepError, StepInvoker};

/// What one scripted invocation does.
#[derive(Debug, Clone)]
pub(crate) enum Script {
    Succeed(Value),
    Fail(String),
    Hang,
}

#[derive(Debug, Clone)]
pub(crate) struct Call {
    pub task_id: String,
    pub step_id: String,
    pub method: String,
    pub input: Value,
    pub at: Instant,
}

/// Invoker whose behavior is scripted per step id. Unscripted calls succeed
/// with `{"step": <step_id>, "input": <input>}` after the configured delay.
pub(crate) struct ScriptedInvoker {
    delay: Duration,
    scripts: Mutex<HashMap<String, VecDeque<Script>>>,
    fallbacks: Mutex<HashMap<String, Script>>,
    calls: Mutex<Vec<Call>>,
    events: Mutex<Vec<String>>,
}

impl ScriptedInvoker {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            scripts: Mutex::new(HashMap::new()),
            fallbacks: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            events: Mutex::new(Vec::new()),
        })
    }

    /// Queue behaviors for the next calls of `step_id`.
    pub fn script(&self, step_id: &str, scripts: Vec<Script>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(step_id.to_string())
            .or_default()
            .extend(scripts);
    }

    /// Behavior once the queue of `step_id` is empty.
    pub fn always(&self, step_id: &str, script: Script) {
        self.fallbacks
            .lock()
            .unwrap()
            .insert(step_id.to_string(), script);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, step_id: &str) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| c.step_id == step_id)
            .collect()
    }

    pub fn methods(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.method).collect()
    }

    /// `start:<task_id>` / `end:<task_id>` in the order they happened.
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn position(&self, event: &str) -> usize {
        self.events()
            .iter()
            .position(|e| e == event)
            .unwrap_or_else(|| panic!("event {event} not recorded"))
    }

    fn next_script(&self, step_id: &str) -> Option<Script> {
        if let Some(script) = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(step_id)
            .and_then(|q| q.pop_front())
        {
            return Some(script);
        }
        self.fallbacks.lock().unwrap().get(step_id).cloned()
    }
}

impl StepInvoker for ScriptedInvoker {
    fn invoke(&self, request: InvocationRequest) -> InvocationFuture<'_> {
        Box::pin(async move {
            let method = match &request.config {
                StepConfig::Service { method, .. } => method.clone(),
                other => other.kind().to_string(),
            };
            let script = self.next_script(&request.step_id);
            self.calls.lock().unwrap().push(Call {
                task_id: request.task_id.clone(),
                step_id: request.step_id.clone(),
                method,
                input: request.input.clone(),
                at: Instant::now(),
            });
            self.events
                .lock()
                .unwrap()
                .push(format!("start:{}", request.task_id));

            tokio::time::sleep(self.delay).await;
            let result = match script {
                None => Ok(json!({ "step": request.step_id, "input": request.input })),
                Some(Script::Succeed(value)) => Ok(value),
                Some(Script::Fail(message)) => Err(StepError::Failed(message)),
                Some(Script::Hang) => std::future::pending::<Result<Value, StepError>>().await,
            };

            self.events
                .lock()
                .unwrap()
                .push(format!("end:{}", request.task_id));
            result
        })
    }
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

pub(crate) fn step(id: &str, depends_on: &[&str], config: StepConfig) -> StepDefinition {
    StepDefinition {
        id: id.to_string(),
        name: String::new(),
        depends_on: depends_on.iter().map(|d| d.to_string()).collect(),
        retry: None,
        input: Map::new(),
        config,
    }
}

pub(crate) fn service(id: &str, depends_on: &[&str]) -> StepDefinition {
    step(
        id,
        depends_on,
        StepConfig::Service {
            target: "svc".to_string(),
            method: id.to_string(),
            timeout_ms: None,
        },
    )
}

pub(crate) fn with_input(mut step: StepDefinition, input: Value) -> StepDefinition {
    if let Value::Object(map) = input {
        step.input = map;
    }
    step
}

pub(crate) fn with_retry(
    mut step: StepDefinition,
    max_attempts: u32,
    backoff: BackoffKind,
    initial_delay_ms: u64,
    max_delay_ms: u64,
) -> StepDefinition {
    step.retry = Some(RetryPolicy {
        max_attempts,
        backoff,
        initial_delay_ms,
        max_delay_ms,
    });
    step
}

pub(crate) fn definition(name: &str, steps: Vec<StepDefinition>) -> WorkflowDefinition {
    let now = Utc::now();
    WorkflowDefinition {
        id: Uuid::now_v7(),
        name: name.to_string(),
        description: None,
        version: "1.0.0".to_string(),
        tenant_id: None,
        steps,
        triggers: Vec::new(),
        error_handler: None,
        parameters: Map::new(),
        timeout_ms: None,
        is_template: false,
        template_id: None,
        metadata: Map::new(),
        created_at: now,
        updated_at: now,
    }
}

pub(crate) fn error_handler(kind: ErrorHandlerKind, compensate: &[&str]) -> ErrorHandler {
    ErrorHandler {
        kind,
        compensations: compensate
            .iter()
            .map(|s| CompensationAction {
                step_id: s.to_string(),
                target: "svc".to_string(),
                method: format!("undo-{s}"),
                input: Map::new(),
            })
            .collect(),
    }
}

pub(crate) fn engine(
    invoker: Arc<ScriptedInvoker>,
) -> WorkflowEngine<InMemoryWorkflowRepository> {
    engine_with_config(invoker, EngineConfig::default())
}

pub(crate) fn engine_with_config(
    invoker: Arc<ScriptedInvoker>,
    config: EngineConfig,
) -> WorkflowEngine<InMemoryWorkflowRepository> {
    WorkflowEngine::builder(Arc::new(InMemoryWorkflowRepository::new()))
        .config(config)
        .invoker(StepKind::Service, invoker)
        .build()
}

/// Poll until `task_id` of execution `id` reaches `status`.
pub(crate) async fn wait_for_task(
    engine: &WorkflowEngine<InMemoryWorkflowRepository>,
    id: Uuid,
    task_id: &str,
    status: stepflow_types::execution::TaskStatus,
) {
    let poll = async {
        loop {
            let details = engine.get_execution(id).await.unwrap();
            if details.task(task_id).is_some_and(|t| t.status == status) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), poll)
        .await
        .unwrap_or_else(|_| panic!("task {task_id} never reached {status}"));
}

/// In-memory repository that can be told to refuse terminal execution writes.
#[derive(Default)]
pub(crate) struct FlakyRepository {
    inner: InMemoryWorkflowRepository,
    refuse_terminal: AtomicBool,
}

impl FlakyRepository {
    pub fn refuse_terminal_writes(&self, refuse: bool) {
        self.refuse_terminal.store(refuse, Ordering::SeqCst);
    }

    pub fn inner(&self) -> &InMemoryWorkflowRepository {
        &self.inner
    }
}

impl WorkflowRepository for FlakyRepository {
    async fn save_definition(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        self.inner.save_definition(def).await
    }

    async fn get_definition(
        &self,
        id: &Uuid,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        self.inner.get_definition(id).await
    }

    async fn list_definitions(
        &self,
        tenant_id: Option<&str>,
        page: Page,
    ) -> Result<Paginated<WorkflowDefinition>, RepositoryError> {
        self.inner.list_definitions(tenant_id, page).await
    }

    async fn delete_definition(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        self.inner.delete_definition(id).await
    }

    async fn save_execution(&self, execution: &Execution) -> Result<(), RepositoryError> {
        if execution.status.is_terminal() && self.refuse_terminal.load(Ordering::SeqCst) {
            return Err(RepositoryError::Connection);
        }
        self.inner.save_execution(execution).await
    }

    async fn get_execution(&self, id: &Uuid) -> Result<Option<Execution>, RepositoryError> {
        self.inner.get_execution(id).await
    }

    async fn list_executions(
        &self,
        filter: &ExecutionFilter,
        page: Page,
    ) -> Result<Paginated<Execution>, RepositoryError> {
        self.inner.list_executions(filter, page).await
    }

    async fn count_executions(&self, definition_id: &Uuid) -> Result<u64, RepositoryError> {
        self.inner.count_executions(definition_id).await
    }

    async fn save_task(&self, task: &TaskExecution) -> Result<(), RepositoryError> {
        self.inner.save_task(task).await
    }

    async fn list_tasks(&self, execution_id: &Uuid) -> Result<Vec<TaskExecution>, RepositoryError> {
        self.inner.list_tasks(execution_id).await
    }
}
