//! `WorkflowEngine`: the boundary facade over definitions and executions.
//!
//! The engine validates and stores definitions, launches one scheduler actor
//! per execution and routes control requests (cancel, human decisions,
//! snapshots) to the live actor. Once an execution is terminal its actor is
//! gone and every query is answered from the repository, or from the parked
//! final snapshot while the repository refuses to store it.

use std::sync::{Arc, Weak};

use chrono::Utc;
use dashmap::DashMap;
use serde_json::{Map, Value, json};
use stepflow_types::config::EngineConfig;
use stepflow_types::error::RepositoryError;
use stepflow_types::execution::{
    Execution, ExecutionDetails, ExecutionFilter, ExecutionStatus, HumanDecision, StartExecution,
    TaskExecution, TaskStatus,
};
use stepflow_types::workflow::{StepKind, WorkflowDefinition};
use tokio::sync::{Semaphore, mpsc, oneshot, watch};
use uuid::Uuid;

use crate::repository::workflow::WorkflowRepository;
use crate::repository::{Page, Paginated};

use super::dag::downstream_closure;
use super::definition::{ValidationError, validate_definition};
use super::expression::{ExpressionEvaluator, JexlEvaluator};
use super::invoker::{InvokerRegistry, StepInvoker};
use super::kinds::{KindTable, StepKindHandler};
use super::log_bus::{LogBus, LogFilter, LogSubscription};
use super::scheduler::{
    AUTO_RETRY_TRIGGER, ExecutionActor, ExecutionHandle, RetryRequest, SchedulerMsg, save_details,
};
use super::task_graph::TaskGraph;
use super::template::instantiate_template;

/// `trigger_id` of executions started by [`WorkflowEngine::retry_execution`].
pub const MANUAL_RETRY_TRIGGER: &str = "retry";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("definition {id} is referenced by {executions} execution(s)")]
    DefinitionInUse { id: Uuid, executions: u64 },

    #[error("invalid definition: {0}")]
    Validation(#[from] ValidationError),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
}

impl EngineError {
    fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

/// State shared by the engine facade and every execution actor.
pub(crate) struct Runtime<R: WorkflowRepository + 'static> {
    pub(crate) repo: Arc<R>,
    pub(crate) invokers: InvokerRegistry,
    pub(crate) kinds: KindTable,
    pub(crate) evaluator: Arc<dyn ExpressionEvaluator>,
    pub(crate) config: EngineConfig,
    pub(crate) log_bus: Arc<LogBus>,
    pub(crate) live: DashMap<Uuid, ExecutionHandle>,
    /// Final snapshots whose terminal write has not reached the repository.
    pub(crate) unsaved: DashMap<Uuid, ExecutionDetails>,
    pub(crate) slots: Option<Arc<Semaphore>>,
    pub(crate) retry_tx: mpsc::UnboundedSender<RetryRequest>,
}

pub struct EngineBuilder<R: WorkflowRepository + 'static> {
    repo: Arc<R>,
    invokers: InvokerRegistry,
    kinds: KindTable,
    evaluator: Arc<dyn ExpressionEvaluator>,
    config: EngineConfig,
}

impl<R: WorkflowRepository + 'static> EngineBuilder<R> {
    pub fn new(repo: Arc<R>) -> Self {
        Self {
            repo,
            invokers: InvokerRegistry::new(),
            kinds: KindTable::standard(),
            evaluator: Arc::new(JexlEvaluator::new()),
            config: EngineConfig::default(),
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn invoker(mut self, kind: StepKind, invoker: Arc<dyn StepInvoker>) -> Self {
        self.invokers.register(kind, invoker);
        self
    }

    pub fn invokers(mut self, invokers: InvokerRegistry) -> Self {
        self.invokers = invokers;
        self
    }

    /// Replace the handler of one step kind.
    pub fn kind_handler(mut self, handler: Arc<dyn StepKindHandler>) -> Self {
        self.kinds.register(handler);
        self
    }

    pub fn evaluator(mut self, evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    /// Build the engine. Must be called from within a Tokio runtime.
    pub fn build(self) -> WorkflowEngine<R> {
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();
        let slots = self
            .config
            .max_concurrent_executions
            .map(|n| Arc::new(Semaphore::new(n.max(1))));
        let rt = Arc::new(Runtime {
            repo: self.repo,
            invokers: self.invokers,
            kinds: self.kinds,
            evaluator: self.evaluator,
            log_bus: Arc::new(LogBus::new(self.config.log_channel_capacity)),
            config: self.config,
            live: DashMap::new(),
            unsaved: DashMap::new(),
            slots,
            retry_tx,
        });
        tokio::spawn(retry_dispatcher(Arc::downgrade(&rt), retry_rx));
        WorkflowEngine { rt }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct WorkflowEngine<R: WorkflowRepository + 'static> {
    rt: Arc<Runtime<R>>,
}

impl<R: WorkflowRepository + 'static> Clone for WorkflowEngine<R> {
    fn clone(&self) -> Self {
        Self {
            rt: Arc::clone(&self.rt),
        }
    }
}

impl<R: WorkflowRepository + 'static> WorkflowEngine<R> {
    pub fn builder(repo: Arc<R>) -> EngineBuilder<R> {
        EngineBuilder::new(repo)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.rt.config
    }

    pub fn repository(&self) -> &Arc<R> {
        &self.rt.repo
    }

    pub fn log_bus(&self) -> &Arc<LogBus> {
        &self.rt.log_bus
    }

    /// Number of executions currently driven by an actor.
    pub fn live_executions(&self) -> usize {
        self.rt.live.len()
    }

    fn clamp(&self, page: Page) -> Page {
        Page::new(page.offset, self.rt.config.clamp_limit(Some(page.limit)))
    }

    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    pub async fn create_definition(
        &self,
        mut def: WorkflowDefinition,
    ) -> Result<WorkflowDefinition, EngineError> {
        validate_definition(&def)?;
        if self.rt.repo.get_definition(&def.id).await?.is_some() {
            return Err(EngineError::InvalidState(format!(
                "definition {} already exists",
                def.id
            )));
        }
        let now = Utc::now();
        def.created_at = now;
        def.updated_at = now;
        self.rt.repo.save_definition(&def).await?;
        tracing::info!(
            definition_id = %def.id,
            name = %def.name,
            steps = def.steps.len(),
            template = def.is_template,
            "workflow definition created"
        );
        Ok(def)
    }

    /// Replace a definition. Rejected once any execution references it.
    pub async fn update_definition(
        &self,
        id: Uuid,
        mut def: WorkflowDefinition,
    ) -> Result<WorkflowDefinition, EngineError> {
        let existing = self.get_definition(id).await?;
        self.ensure_unreferenced(id).await?;
        def.id = id;
        validate_definition(&def)?;
        def.created_at = existing.created_at;
        def.updated_at = Utc::now();
        self.rt.repo.save_definition(&def).await?;
        tracing::info!(definition_id = %id, name = %def.name, "workflow definition updated");
        Ok(def)
    }

    /// Delete a definition. Rejected once any execution references it.
    pub async fn delete_definition(&self, id: Uuid) -> Result<(), EngineError> {
        self.get_definition(id).await?;
        self.ensure_unreferenced(id).await?;
        self.rt.repo.delete_definition(&id).await?;
        tracing::info!(definition_id = %id, "workflow definition deleted");
        Ok(())
    }

    async fn ensure_unreferenced(&self, id: Uuid) -> Result<(), EngineError> {
        let executions = self.rt.repo.count_executions(&id).await?;
        if executions > 0 {
            return Err(EngineError::DefinitionInUse { id, executions });
        }
        Ok(())
    }

    pub async fn get_definition(&self, id: Uuid) -> Result<WorkflowDefinition, EngineError> {
        self.rt
            .repo
            .get_definition(&id)
            .await?
            .ok_or_else(|| EngineError::not_found("definition", id))
    }

    pub async fn list_definitions(
        &self,
        tenant_id: Option<&str>,
        page: Page,
    ) -> Result<Paginated<WorkflowDefinition>, EngineError> {
        Ok(self
            .rt
            .repo
            .list_definitions(tenant_id, self.clamp(page))
            .await?)
    }

    /// Create a new definition from a template with parameter overrides.
    pub async fn instantiate_template(
        &self,
        template_id: Uuid,
        name: &str,
        overrides: &Map<String, Value>,
    ) -> Result<WorkflowDefinition, EngineError> {
        let template = self.get_definition(template_id).await?;
        if !template.is_template {
            return Err(EngineError::InvalidState(format!(
                "definition {template_id} is not a template"
            )));
        }
        let def = instantiate_template(&template, name, overrides)?;
        self.create_definition(def).await
    }

    // -----------------------------------------------------------------------
    // Executions
    // -----------------------------------------------------------------------

    pub async fn start_execution(
        &self,
        definition_id: Uuid,
        request: StartExecution,
    ) -> Result<Execution, EngineError> {
        let (execution, _) = self.start(definition_id, request, None).await?;
        Ok(execution)
    }

    /// Start an execution and subscribe to its logs before the first event
    /// is published.
    pub async fn start_execution_with_logs(
        &self,
        definition_id: Uuid,
        request: StartExecution,
        filter: LogFilter,
    ) -> Result<(Execution, LogSubscription), EngineError> {
        let (execution, subscription) = self.start(definition_id, request, Some(filter)).await?;
        let subscription = subscription
            .unwrap_or_else(|| self.rt.log_bus.subscribe(execution.id, LogFilter::default()));
        Ok((execution, subscription))
    }

    async fn start(
        &self,
        definition_id: Uuid,
        request: StartExecution,
        filter: Option<LogFilter>,
    ) -> Result<(Execution, Option<LogSubscription>), EngineError> {
        let def = self.get_definition(definition_id).await?;
        if def.is_template {
            return Err(EngineError::InvalidState(format!(
                "definition {definition_id} is a template; instantiate it first"
            )));
        }
        let execution = new_execution(&def, request, None);
        launch(&self.rt, Arc::new(def), execution, &[], filter).await
    }

    /// Live snapshot while the execution runs, persisted state afterwards.
    pub async fn get_execution(&self, id: Uuid) -> Result<ExecutionDetails, EngineError> {
        if let Some(tx) = self.live_sender(&id) {
            let (reply, rx) = oneshot::channel();
            if tx.send(SchedulerMsg::Snapshot { reply }).is_ok() {
                if let Ok(details) = rx.await {
                    return Ok(details);
                }
            }
        }
        self.stored_details(id).await
    }

    pub async fn list_executions(
        &self,
        filter: &ExecutionFilter,
        page: Page,
    ) -> Result<Paginated<Execution>, EngineError> {
        Ok(self
            .rt
            .repo
            .list_executions(filter, self.clamp(page))
            .await?)
    }

    pub async fn cancel_execution(
        &self,
        id: Uuid,
        reason: Option<String>,
    ) -> Result<Execution, EngineError> {
        if let Some(tx) = self.live_sender(&id) {
            let (reply, rx) = oneshot::channel();
            if tx.send(SchedulerMsg::Cancel { reason, reply }).is_ok() {
                if let Ok(result) = rx.await {
                    return result;
                }
            }
        }
        let execution = self.stored_execution(id).await?;
        Err(EngineError::InvalidState(format!(
            "execution {id} is already {}",
            execution.status
        )))
    }

    /// Start a new execution of the same definition and input.
    ///
    /// With `from_task_id`, top-level tasks that completed in the original
    /// and are not downstream of that task's top-level step are carried over
    /// as `Completed` with their original outputs.
    pub async fn retry_execution(
        &self,
        id: Uuid,
        from_task_id: Option<&str>,
    ) -> Result<Execution, EngineError> {
        let ExecutionDetails {
            execution: original,
            tasks: original_tasks,
        } = self.stored_details(id).await?;
        // A non-terminal execution without an actor was orphaned by a restart.
        if self.rt.live.contains_key(&id) && !original.status.is_terminal() {
            return Err(EngineError::InvalidState(format!(
                "execution {id} is still running"
            )));
        }
        if original.status == ExecutionStatus::Completed {
            return Err(EngineError::InvalidState(format!(
                "execution {id} completed and cannot be retried"
            )));
        }
        let def = self.get_definition(original.definition_id).await?;

        let mut seeds: Vec<TaskExecution> = Vec::new();
        let mut metadata = Map::new();
        if let Some(from) = from_task_id {
            let root_step = from.split(['/', '[']).next().unwrap_or(from);
            if !def.steps.iter().any(|s| s.id == root_step) {
                return Err(EngineError::not_found("task", from));
            }
            let rerun = downstream_closure(root_step, &def.steps);
            seeds = original_tasks
                .into_iter()
                .filter(|t| {
                    t.parent_task_id.is_none()
                        && t.status == TaskStatus::Completed
                        && !rerun.contains(&t.step_id)
                })
                .collect();
            metadata.insert("retry_from_task".to_string(), json!(from));
        }

        let request = StartExecution {
            input: original.input.clone(),
            trigger_id: Some(MANUAL_RETRY_TRIGGER.to_string()),
            triggered_by: original.triggered_by.clone(),
            metadata,
        };
        let execution = new_execution(&def, request, Some(id));
        let (execution, _) = launch(&self.rt, Arc::new(def), execution, &seeds, None).await?;
        Ok(execution)
    }

    /// Deliver an approval or rejection to a waiting HumanTask.
    pub async fn signal_human_task(
        &self,
        id: Uuid,
        task_id: &str,
        decision: HumanDecision,
    ) -> Result<(), EngineError> {
        if let Some(tx) = self.live_sender(&id) {
            let (reply, rx) = oneshot::channel();
            let msg = SchedulerMsg::Signal {
                task_id: task_id.to_string(),
                decision,
                reply,
            };
            if tx.send(msg).is_ok() {
                if let Ok(result) = rx.await {
                    return result;
                }
            }
        }
        let execution = self.stored_execution(id).await?;
        Err(EngineError::InvalidState(format!(
            "execution {id} is {}",
            execution.status
        )))
    }

    /// Subscribe to future log events of an execution. A finished execution
    /// yields an already-ended subscription.
    pub async fn subscribe_logs(
        &self,
        id: Uuid,
        filter: LogFilter,
    ) -> Result<LogSubscription, EngineError> {
        if !self.rt.log_bus.is_open(&id) && self.rt.repo.get_execution(&id).await?.is_none() {
            return Err(EngineError::not_found("execution", id));
        }
        Ok(self.rt.log_bus.subscribe(id, filter))
    }

    /// Wait until the execution is terminal and return its final state.
    pub async fn wait_for_execution(&self, id: Uuid) -> Result<ExecutionDetails, EngineError> {
        let status = self.rt.live.get(&id).map(|h| h.status.clone());
        if let Some(mut status) = status {
            // An error only means the actor is gone; the repository has the rest.
            let _ = status.wait_for(|s| s.is_terminal()).await;
        }
        self.get_execution(id).await
    }

    fn live_sender(&self, id: &Uuid) -> Option<mpsc::UnboundedSender<SchedulerMsg>> {
        self.rt.live.get(id).map(|h| h.tx.clone())
    }

    /// A parked final snapshot, stored again on every lookup. `None` once
    /// the repository holds the final state.
    async fn unsaved_details(&self, id: &Uuid) -> Option<ExecutionDetails> {
        let details = self.rt.unsaved.get(id).map(|d| d.value().clone())?;
        match save_details(self.rt.repo.as_ref(), &details).await {
            Ok(()) => {
                self.rt.unsaved.remove(id);
                tracing::info!(execution_id = %id, "stored deferred final execution state");
                None
            }
            Err(e) => {
                tracing::warn!(
                    execution_id = %id,
                    error = %e,
                    "final execution state still not stored"
                );
                Some(details)
            }
        }
    }

    async fn stored_details(&self, id: Uuid) -> Result<ExecutionDetails, EngineError> {
        if let Some(details) = self.unsaved_details(&id).await {
            return Ok(details);
        }
        let execution = self.stored_execution(id).await?;
        let tasks = self.rt.repo.list_tasks(&id).await?;
        Ok(ExecutionDetails { execution, tasks })
    }

    async fn stored_execution(&self, id: Uuid) -> Result<Execution, EngineError> {
        if let Some(details) = self.unsaved_details(&id).await {
            return Ok(details.execution);
        }
        self.rt
            .repo
            .get_execution(&id)
            .await?
            .ok_or_else(|| EngineError::not_found("execution", id))
    }
}

// ---------------------------------------------------------------------------
// Launching
// ---------------------------------------------------------------------------

fn new_execution(
    def: &WorkflowDefinition,
    request: StartExecution,
    retry_of: Option<Uuid>,
) -> Execution {
    Execution {
        id: Uuid::now_v7(),
        definition_id: def.id,
        definition_name: def.name.clone(),
        tenant_id: def.tenant_id.clone(),
        status: ExecutionStatus::Pending,
        input: request.input,
        output: None,
        error: None,
        failed_task_id: None,
        trigger_id: request.trigger_id,
        triggered_by: request.triggered_by,
        retry_of,
        metadata: request.metadata,
        created_at: Utc::now(),
        started_at: None,
        completed_at: None,
    }
}

/// Persist a new execution with its initial tasks and spawn its actor.
async fn launch<R: WorkflowRepository + 'static>(
    rt: &Arc<Runtime<R>>,
    definition: Arc<WorkflowDefinition>,
    execution: Execution,
    seeds: &[TaskExecution],
    filter: Option<LogFilter>,
) -> Result<(Execution, Option<LogSubscription>), EngineError> {
    let mut graph = TaskGraph::new(execution.id, &definition.steps);
    for seed in seeds {
        graph.seed_completed(seed);
    }

    rt.repo.save_execution(&execution).await?;
    for (_, node) in graph.nodes() {
        rt.repo.save_task(&node.record).await?;
    }

    rt.log_bus.open(execution.id);
    let subscription = filter.map(|f| rt.log_bus.subscribe(execution.id, f));

    let (tx, rx) = mpsc::unbounded_channel();
    let (status_tx, status_rx) = watch::channel(execution.status);
    rt.live.insert(
        execution.id,
        ExecutionHandle {
            tx: tx.clone(),
            status: status_rx,
        },
    );

    tracing::info!(
        execution_id = %execution.id,
        definition_id = %execution.definition_id,
        retry_of = ?execution.retry_of,
        seeded = seeds.len(),
        "execution created"
    );
    let actor = ExecutionActor::new(
        Arc::clone(rt),
        definition,
        execution.clone(),
        graph,
        tx,
        status_tx,
    );
    tokio::spawn(actor.run(rx));
    Ok((execution, subscription))
}

/// Starts the executions requested by the `Retry` error handler.
async fn retry_dispatcher<R: WorkflowRepository + 'static>(
    rt: Weak<Runtime<R>>,
    mut rx: mpsc::UnboundedReceiver<RetryRequest>,
) {
    while let Some(request) = rx.recv().await {
        let Some(rt) = rt.upgrade() else {
            break;
        };
        let start = StartExecution {
            input: request.input,
            trigger_id: Some(AUTO_RETRY_TRIGGER.to_string()),
            triggered_by: request.triggered_by,
            metadata: Map::new(),
        };
        let execution = new_execution(&request.definition, start, Some(request.original));
        match launch(&rt, request.definition, execution, &[], None).await {
            Ok((execution, _)) => tracing::info!(
                execution_id = %execution.id,
                retry_of = %request.original,
                "error handler started a new execution"
            ),
            Err(e) => tracing::warn!(
                retry_of = %request.original,
                error = %e,
                "error handler could not start a new execution"
            ),
        }
    }
}
