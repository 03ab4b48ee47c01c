//! Step invoker port and registry.
//!
//! A [`StepInvoker`] performs the actual work of a step -- for Service steps
//! an external RPC call, for HumanTask steps an optional notification. The
//! scheduler owns deadlines and cancellation: [`invoke_with_deadline`] races
//! the invoker's future against the request's deadline and cancellation
//! token, so an invoker that ignores both is still no longer awaited.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use stepflow_types::workflow::{StepConfig, StepKind};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Why a single attempt of a task failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StepError {
    /// The invoker reported a failure.
    #[error("invocation failed: {0}")]
    Failed(String),

    /// The attempt did not finish before its deadline.
    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    /// The attempt was cancelled by the scheduler.
    #[error("cancelled")]
    Cancelled,

    /// A HumanTask was rejected.
    #[error("rejected{}", .0.as_ref().map(|r| format!(": {r}")).unwrap_or_default())]
    Rejected(Option<String>),

    /// No invoker is registered for the step kind.
    #[error("no invoker registered for {0} steps")]
    NoInvoker(StepKind),

    /// A condition, items or until expression could not be evaluated.
    #[error("expression error: {0}")]
    Expression(String),
}

// ---------------------------------------------------------------------------
// Port
// ---------------------------------------------------------------------------

/// Everything an invoker needs to run one attempt of a task.
#[derive(Debug, Clone)]
pub struct InvocationRequest {
    pub execution_id: Uuid,
    pub task_id: String,
    pub step_id: String,
    pub config: StepConfig,
    pub input: Value,
    /// Instant by which the attempt must finish, if any.
    pub deadline: Option<Instant>,
    /// Cancelled when the scheduler stops awaiting this attempt.
    pub cancel: CancellationToken,
}

impl InvocationRequest {
    /// Time left until the deadline, if one is set.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }
}

/// Boxed future returned by [`StepInvoker::invoke`].
pub type InvocationFuture<'a> = Pin<Box<dyn Future<Output = Result<Value, StepError>> + Send + 'a>>;

/// Executes one step's work and returns its output.
///
/// Uses `Pin<Box<dyn Future>>` (rather than `impl Future`) so invokers can be
/// stored as `Arc<dyn StepInvoker>` in the registry.
pub trait StepInvoker: Send + Sync {
    fn invoke(&self, request: InvocationRequest) -> InvocationFuture<'_>;
}

/// Run an invocation, honouring its deadline and cancellation token.
pub async fn invoke_with_deadline(
    invoker: &dyn StepInvoker,
    request: InvocationRequest,
) -> Result<Value, StepError> {
    let cancel = request.cancel.clone();
    let deadline = request.deadline;
    let budget = request.remaining();
    let call = invoker.invoke(request);

    let timed = async move {
        match deadline {
            Some(at) => tokio::time::timeout_at(at, call)
                .await
                .unwrap_or_else(|_| Err(StepError::TimedOut(budget.unwrap_or_default()))),
            None => call.await,
        }
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(StepError::Cancelled),
        result = timed => result,
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Invokers keyed by step kind. Only kinds that dispatch external work need
/// one: Service (required to run Service steps, also used for compensations)
/// and optionally HumanTask (assignee notification).
#[derive(Clone, Default)]
pub struct InvokerRegistry {
    invokers: HashMap<StepKind, Arc<dyn StepInvoker>>,
}

impl InvokerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, kind: StepKind, invoker: Arc<dyn StepInvoker>) -> Self {
        self.register(kind, invoker);
        self
    }

    pub fn register(&mut self, kind: StepKind, invoker: Arc<dyn StepInvoker>) {
        self.invokers.insert(kind, invoker);
    }

    pub fn get(&self, kind: StepKind) -> Option<Arc<dyn StepInvoker>> {
        self.invokers.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<StepKind> {
        let mut kinds: Vec<StepKind> = self.invokers.keys().copied().collect();
        kinds.sort_by_key(|k| k.as_str());
        kinds
    }
}

impl std::fmt::Debug for InvokerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvokerRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
