//! Step-kind handler table.
//!
//! Each [`StepKind`] maps to a [`StepKindHandler`] that turns a step plus its
//! scope into an [`Activation`]: what the scheduler should do with the task
//! now that it is `Running`. Adding a step kind means adding a handler and a
//! table entry; the scheduler itself only interprets activations.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};
use stepflow_types::config::EngineConfig;
use stepflow_types::execution::TaskStatus;
use stepflow_types::workflow::{StepConfig, StepDefinition, StepKind};

use super::context::ExecutionScope;
use super::expression::{ExpressionError, ExpressionEvaluator};
use super::invoker::StepError;
use super::placeholder::value_to_text;

// ---------------------------------------------------------------------------
// Activation model
// ---------------------------------------------------------------------------

/// A list of nested steps to instantiate under a composite task.
#[derive(Debug, Clone)]
pub struct ChildGroup {
    pub steps: Vec<StepDefinition>,
    /// Loop iteration the group belongs to.
    pub iteration: Option<u32>,
    /// Variables bound for every task in the group (loop item).
    pub bindings: Map<String, Value>,
    /// Create the tasks as `Skipped` (untaken conditional branch).
    pub skipped: bool,
}

impl ChildGroup {
    pub fn runnable(steps: Vec<StepDefinition>) -> Self {
        Self {
            steps,
            iteration: None,
            bindings: Map::new(),
            skipped: false,
        }
    }
}

/// What the scheduler does with a task that has just become `Running`.
#[derive(Debug, Clone)]
pub enum Activation {
    /// Dispatch to the kind's invoker with an optional timeout.
    Invoke { timeout: Option<Duration> },
    /// Instantiate nested tasks; the task completes once they settle.
    Expand {
        groups: Vec<ChildGroup>,
        max_concurrency: Option<u32>,
        detail: Value,
    },
    /// Stay `Running` until the timer fires, then complete.
    Sleep { duration: Duration },
    /// Stay `Running` until an approval/rejection signal or the timeout.
    AwaitSignal {
        assignee: String,
        timeout: Option<Duration>,
    },
    /// Complete immediately with the given output.
    Complete(Value),
}

/// Inputs available to a handler while activating a task.
pub struct ActivationContext<'a> {
    pub scope: &'a ExecutionScope,
    pub evaluator: &'a dyn ExpressionEvaluator,
    pub config: &'a EngineConfig,
    pub now: DateTime<Utc>,
}

/// Terminal state of one nested task, used to build a composite's output.
#[derive(Debug, Clone)]
pub struct ChildOutcome<'a> {
    pub step_id: &'a str,
    pub iteration: Option<u32>,
    pub status: TaskStatus,
    pub output: Option<&'a Value>,
}

pub trait StepKindHandler: Send + Sync {
    fn kind(&self) -> StepKind;

    fn activate(
        &self,
        step: &StepDefinition,
        ctx: &ActivationContext<'_>,
    ) -> Result<Activation, StepError>;

    /// Output of a composite task once all its nested tasks settled. The
    /// default maps each non-skipped nested step id to its output.
    fn collect_output(&self, children: &[ChildOutcome<'_>]) -> Value {
        let mut out = Map::new();
        for child in children.iter().filter(|c| c.status != TaskStatus::Skipped) {
            out.insert(
                child.step_id.to_string(),
                child.output.cloned().unwrap_or(Value::Null),
            );
        }
        Value::Object(out)
    }
}

fn mismatch(step: &StepDefinition, expected: StepKind) -> StepError {
    StepError::Failed(format!(
        "step '{}' is a {} step, handler expects {}",
        step.id,
        step.kind(),
        expected
    ))
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

pub struct ServiceHandler;

impl StepKindHandler for ServiceHandler {
    fn kind(&self) -> StepKind {
        StepKind::Service
    }

    fn activate(
        &self,
        step: &StepDefinition,
        ctx: &ActivationContext<'_>,
    ) -> Result<Activation, StepError> {
        let StepConfig::Service { timeout_ms, .. } = &step.config else {
            return Err(mismatch(step, StepKind::Service));
        };
        let timeout = timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| ctx.config.default_service_timeout());
        Ok(Activation::Invoke {
            timeout: Some(timeout),
        })
    }
}

pub struct ParallelHandler;

impl StepKindHandler for ParallelHandler {
    fn kind(&self) -> StepKind {
        StepKind::Parallel
    }

    fn activate(
        &self,
        step: &StepDefinition,
        _ctx: &ActivationContext<'_>,
    ) -> Result<Activation, StepError> {
        let StepConfig::Parallel {
            steps,
            max_concurrency,
        } = &step.config
        else {
            return Err(mismatch(step, StepKind::Parallel));
        };
        Ok(Activation::Expand {
            groups: vec![ChildGroup::runnable(steps.clone())],
            max_concurrency: *max_concurrency,
            detail: json!({ "tasks": steps.len() }),
        })
    }
}

pub struct ConditionalHandler;

impl StepKindHandler for ConditionalHandler {
    fn kind(&self) -> StepKind {
        StepKind::Conditional
    }

    fn activate(
        &self,
        step: &StepDefinition,
        ctx: &ActivationContext<'_>,
    ) -> Result<Activation, StepError> {
        let StepConfig::Conditional {
            condition,
            if_steps,
            else_steps,
        } = &step.config
        else {
            return Err(mismatch(step, StepKind::Conditional));
        };
        let taken = ctx
            .evaluator
            .evaluate_bool(condition, &ctx.scope.to_value())
            .map_err(|e| StepError::Expression(e.to_string()))?;

        let mut if_group = ChildGroup::runnable(if_steps.clone());
        if_group.skipped = !taken;
        let mut else_group = ChildGroup::runnable(else_steps.clone());
        else_group.skipped = taken;

        Ok(Activation::Expand {
            groups: vec![if_group, else_group],
            max_concurrency: None,
            detail: json!({ "branch": if taken { "if" } else { "else" } }),
        })
    }
}

pub struct LoopHandler;

impl StepKindHandler for LoopHandler {
    fn kind(&self) -> StepKind {
        StepKind::Loop
    }

    fn activate(
        &self,
        step: &StepDefinition,
        ctx: &ActivationContext<'_>,
    ) -> Result<Activation, StepError> {
        let StepConfig::Loop {
            items,
            item_variable,
            steps,
            max_iterations,
            max_concurrency,
        } = &step.config
        else {
            return Err(mismatch(step, StepKind::Loop));
        };
        let value = ctx
            .evaluator
            .evaluate(items, &ctx.scope.to_value())
            .map_err(|e| StepError::Expression(e.to_string()))?;
        let mut values = match value {
            Value::Array(values) => values,
            other => {
                let err = ExpressionError::wrong_type(items, "an array", &other);
                return Err(StepError::Expression(format!("step '{}': {err}", step.id)));
            }
        };
        if let Some(max) = max_iterations {
            values.truncate(*max as usize);
        }

        let total = values.len();
        let groups = values
            .into_iter()
            .enumerate()
            .map(|(i, item)| {
                let mut bindings = Map::new();
                bindings.insert("loop".to_string(), json!({ "index": i, "total": total }));
                bindings.insert(item_variable.trim().to_string(), item);
                ChildGroup {
                    steps: steps.clone(),
                    iteration: Some(i as u32),
                    bindings,
                    skipped: false,
                }
            })
            .collect();

        Ok(Activation::Expand {
            groups,
            max_concurrency: *max_concurrency,
            detail: json!({ "iterations": total }),
        })
    }

    /// One object per iteration, in iteration order.
    fn collect_output(&self, children: &[ChildOutcome<'_>]) -> Value {
        let count = children
            .iter()
            .filter_map(|c| c.iteration)
            .max()
            .map_or(0, |m| m as usize + 1);
        let mut iterations = vec![Map::new(); count];
        for child in children {
            if let Some(i) = child.iteration {
                iterations[i as usize].insert(
                    child.step_id.to_string(),
                    child.output.cloned().unwrap_or(Value::Null),
                );
            }
        }
        Value::Array(iterations.into_iter().map(Value::Object).collect())
    }
}

pub struct WaitHandler;

impl WaitHandler {
    fn deadline(
        &self,
        step: &StepDefinition,
        until: &str,
        ctx: &ActivationContext<'_>,
    ) -> Result<DateTime<Utc>, StepError> {
        if let Ok(at) = DateTime::parse_from_rfc3339(until.trim()) {
            return Ok(at.with_timezone(&Utc));
        }
        let value = ctx
            .evaluator
            .evaluate(until, &ctx.scope.to_value())
            .map_err(|e| StepError::Expression(e.to_string()))?;
        match &value {
            Value::String(s) => DateTime::parse_from_rfc3339(s)
                .map(|at| at.with_timezone(&Utc))
                .map_err(|e| {
                    StepError::Expression(format!(
                        "step '{}': until '{s}' is not RFC 3339: {e}",
                        step.id
                    ))
                }),
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .and_then(DateTime::<Utc>::from_timestamp_millis)
                .ok_or_else(|| {
                    StepError::Expression(format!("step '{}': until {n} is out of range", step.id))
                }),
            other => {
                let err = ExpressionError::wrong_type(
                    until,
                    "an RFC 3339 timestamp or epoch milliseconds",
                    other,
                );
                Err(StepError::Expression(format!("step '{}': {err}", step.id)))
            }
        }
    }
}

impl StepKindHandler for WaitHandler {
    fn kind(&self) -> StepKind {
        StepKind::Wait
    }

    fn activate(
        &self,
        step: &StepDefinition,
        ctx: &ActivationContext<'_>,
    ) -> Result<Activation, StepError> {
        let StepConfig::Wait { duration_ms, until } = &step.config else {
            return Err(mismatch(step, StepKind::Wait));
        };
        let duration = match (duration_ms, until) {
            (Some(ms), _) => Duration::from_millis(*ms),
            (None, Some(until)) => {
                let at = self.deadline(step, until, ctx)?;
                (at - ctx.now).to_std().unwrap_or(Duration::ZERO)
            }
            (None, None) => Duration::ZERO,
        };
        Ok(Activation::Sleep { duration })
    }
}

pub struct HumanTaskHandler;

impl StepKindHandler for HumanTaskHandler {
    fn kind(&self) -> StepKind {
        StepKind::HumanTask
    }

    fn activate(
        &self,
        step: &StepDefinition,
        ctx: &ActivationContext<'_>,
    ) -> Result<Activation, StepError> {
        let StepConfig::HumanTask {
            assignee,
            timeout_ms,
            ..
        } = &step.config
        else {
            return Err(mismatch(step, StepKind::HumanTask));
        };
        let assignee = value_to_text(&ctx.scope.resolve_str(assignee));
        let timeout = timeout_ms
            .map(Duration::from_millis)
            .or_else(|| ctx.config.default_human_task_timeout());
        Ok(Activation::AwaitSignal { assignee, timeout })
    }

    /// A HumanTask only has a nested task when its timeout fallback ran;
    /// the fallback's output becomes the task's output.
    fn collect_output(&self, children: &[ChildOutcome<'_>]) -> Value {
        children
            .first()
            .and_then(|c| c.output.cloned())
            .unwrap_or(Value::Null)
    }
}

// ---------------------------------------------------------------------------
// Table
// ---------------------------------------------------------------------------

/// Kind -> handler lookup used by the scheduler.
#[derive(Clone)]
pub struct KindTable {
    handlers: HashMap<StepKind, Arc<dyn StepKindHandler>>,
}

impl KindTable {
    /// Table with a handler for every built-in kind.
    pub fn standard() -> Self {
        let mut table = Self {
            handlers: HashMap::new(),
        };
        table.register(Arc::new(ServiceHandler));
        table.register(Arc::new(ParallelHandler));
        table.register(Arc::new(ConditionalHandler));
        table.register(Arc::new(LoopHandler));
        table.register(Arc::new(WaitHandler));
        table.register(Arc::new(HumanTaskHandler));
        table
    }

    /// Add or replace the handler for its kind.
    pub fn register(&mut self, handler: Arc<dyn StepKindHandler>) {
        self.handlers.insert(handler.kind(), handler);
    }

    pub fn get(&self, kind: StepKind) -> Option<&dyn StepKindHandler> {
        self.handlers.get(&kind).map(|h| h.as_ref())
    }
}

impl Default for KindTable {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::expression::JexlEvaluator;
    use uuid::Uuid;

    fn step(id: &str, config: StepConfig) -> StepDefinition {
        StepDefinition {
            id: id.to_string(),
            name: String::new(),
            depends_on: vec![],
            retry: None,
            input: Map::new(),
            config,
        }
    }

    fn leaf(id: &str) -> StepDefinition {
        step(
            id,
            StepConfig::Service {
                target: "svc".to_string(),
                method: "run".to_string(),
                timeout_ms: None,
            },
        )
    }

    fn scope() -> ExecutionScope {
        let mut params = Map::new();
        params.insert("amount".to_string(), json!(250));
        params.insert("recipients".to_string(), json!(["a", "b", "c"]));
        params.insert("owner".to_string(), json!("ops"));
        ExecutionScope::new(Uuid::now_v7(), params)
    }

    fn activate(step: &StepDefinition) -> Result<Activation, StepError> {
        let scope = scope();
        let config = EngineConfig::default();
        let evaluator = JexlEvaluator::new();
        let ctx = ActivationContext {
            scope: &scope,
            evaluator: &evaluator,
            config: &config,
            now: Utc::now(),
        };
        KindTable::standard()
            .get(step.kind())
            .unwrap()
            .activate(step, &ctx)
    }

    #[test]
    fn test_service_uses_default_timeout() {
        match activate(&leaf("a")).unwrap() {
            Activation::Invoke { timeout } => assert_eq!(timeout, Some(Duration::from_secs(30))),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_conditional_skips_untaken_branch() {
        let cond = step(
            "gate",
            StepConfig::Conditional {
                condition: "params.amount > 100".to_string(),
                if_steps: vec![leaf("big")],
                else_steps: vec![leaf("small")],
            },
        );
        let Activation::Expand { groups, detail, .. } = activate(&cond).unwrap() else {
            panic!("expected expand");
        };
        assert_eq!(groups.len(), 2);
        assert!(!groups[0].skipped);
        assert!(groups[1].skipped);
        assert_eq!(detail["branch"], "if");
    }

    #[test]
    fn test_loop_binds_items_and_truncates() {
        let each = step(
            "each",
            StepConfig::Loop {
                items: "params.recipients".to_string(),
                item_variable: "recipient".to_string(),
                steps: vec![leaf("send")],
                max_iterations: Some(2),
                max_concurrency: Some(1),
            },
        );
        let Activation::Expand {
            groups,
            max_concurrency,
            ..
        } = activate(&each).unwrap()
        else {
            panic!("expected expand");
        };
        assert_eq!(groups.len(), 2);
        assert_eq!(max_concurrency, Some(1));
        assert_eq!(groups[1].iteration, Some(1));
        assert_eq!(groups[1].bindings["recipient"], json!("b"));
        assert_eq!(groups[1].bindings["loop"]["index"], json!(1));
    }

    #[test]
    fn test_loop_requires_array() {
        let each = step(
            "each",
            StepConfig::Loop {
                items: "params.amount".to_string(),
                item_variable: "x".to_string(),
                steps: vec![leaf("send")],
                max_iterations: None,
                max_concurrency: None,
            },
        );
        let Err(StepError::Expression(message)) = activate(&each) else {
            panic!("expected an expression error");
        };
        assert!(message.contains("produced a number, expected an array"));
    }

    #[test]
    fn test_wait_duration_and_past_until() {
        let pause = step(
            "pause",
            StepConfig::Wait {
                duration_ms: Some(1500),
                until: None,
            },
        );
        assert!(matches!(
            activate(&pause).unwrap(),
            Activation::Sleep { duration } if duration == Duration::from_millis(1500)
        ));

        let past = step(
            "past",
            StepConfig::Wait {
                duration_ms: None,
                until: Some("2001-01-01T00:00:00Z".to_string()),
            },
        );
        assert!(matches!(
            activate(&past).unwrap(),
            Activation::Sleep { duration } if duration == Duration::ZERO
        ));
    }

    #[test]
    fn test_human_task_resolves_assignee() {
        let approve = step(
            "approve",
            StepConfig::HumanTask {
                assignee: "team-{{ params.owner }}".to_string(),
                timeout_ms: Some(60_000),
                on_timeout: None,
            },
        );
        match activate(&approve).unwrap() {
            Activation::AwaitSignal { assignee, timeout } => {
                assert_eq!(assignee, "team-ops");
                assert_eq!(timeout, Some(Duration::from_secs(60)));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_loop_collect_output_groups_by_iteration() {
        let a = json!(1);
        let b = json!(2);
        let children = vec![
            ChildOutcome {
                step_id: "send",
                iteration: Some(1),
                status: TaskStatus::Completed,
                output: Some(&b),
            },
            ChildOutcome {
                step_id: "send",
                iteration: Some(0),
                status: TaskStatus::Completed,
                output: Some(&a),
            },
        ];
        assert_eq!(
            LoopHandler.collect_output(&children),
            json!([{"send": 1}, {"send": 2}])
        );
    }
}
