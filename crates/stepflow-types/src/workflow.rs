//! Workflow definition types for Stepflow.
//!
//! Defines the declarative representation of a workflow: an ordered list of
//! typed steps forming a DAG, optional triggers, an optional error handler and
//! a map of global parameters. Definitions are immutable once an execution
//! references them; the runtime counterparts live in [`crate::execution`].

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// The canonical workflow definition.
///
/// YAML files, the REST API and the CLI all convert to/from this struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// UUIDv7 assigned on creation.
    #[serde(default = "Uuid::now_v7")]
    pub id: Uuid,
    /// Human-readable workflow name.
    pub name: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Free-form version string (e.g. "1.0.0").
    #[serde(default = "default_version")]
    pub version: String,
    /// Owning tenant, if the deployment is multi-tenant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    /// Ordered list of steps forming the workflow DAG.
    pub steps: Vec<StepDefinition>,
    /// Declarative trigger configurations.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub triggers: Vec<TriggerConfig>,
    /// What to do when a step fails for good (default: fail the execution).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_handler: Option<ErrorHandler>,
    /// Global parameter defaults, overridable per execution.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,
    /// Workflow-level timeout in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Whether this definition is a template meant for instantiation.
    #[serde(default)]
    pub is_template: bool,
    /// Template this definition was instantiated from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<Uuid>,
    /// Extensible metadata.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

impl WorkflowDefinition {
    /// The effective error handler (`Fail` when none is configured).
    pub fn effective_error_handler(&self) -> ErrorHandler {
        self.error_handler.clone().unwrap_or_default()
    }

    /// Workflow-level timeout, if configured.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Find a step by id anywhere in the definition, including nested lists.
    pub fn find_step(&self, step_id: &str) -> Option<&StepDefinition> {
        fn search<'a>(steps: &'a [StepDefinition], id: &str) -> Option<&'a StepDefinition> {
            for step in steps {
                if step.id == id {
                    return Some(step);
                }
                for nested in step.config.nested_lists() {
                    if let Some(found) = search(nested, id) {
                        return Some(found);
                    }
                }
                if let StepConfig::HumanTask {
                    on_timeout: Some(fallback),
                    ..
                } = &step.config
                {
                    if let Some(found) = search(std::slice::from_ref(fallback.as_ref()), id) {
                        return Some(found);
                    }
                }
            }
            None
        }
        search(&self.steps, step_id)
    }
}

// ---------------------------------------------------------------------------
// Step Definition
// ---------------------------------------------------------------------------

/// A single step in the workflow DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    /// User-defined step ID (e.g. "charge-card"). Unique within a workflow.
    pub id: String,
    /// Human-readable step name.
    #[serde(default)]
    pub name: String,
    /// Sibling step IDs this step depends on (DAG edges). Empty = eligible at start.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Retry policy applied when the step fails.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Static input; string values may contain `{{ ... }}` placeholders.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub input: Map<String, Value>,
    /// Kind-specific configuration.
    pub config: StepConfig,
}

impl StepDefinition {
    /// The kind of this step.
    pub fn kind(&self) -> StepKind {
        self.config.kind()
    }

    /// Display name, falling back to the id when no name was given.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() { &self.id } else { &self.name }
    }
}

/// The kind of a step, used as the key of the scheduler's handler table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Service,
    Parallel,
    Conditional,
    Loop,
    Wait,
    HumanTask,
}

impl StepKind {
    pub const ALL: [StepKind; 6] = [
        StepKind::Service,
        StepKind::Parallel,
        StepKind::Conditional,
        StepKind::Loop,
        StepKind::Wait,
        StepKind::HumanTask,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Service => "service",
            StepKind::Parallel => "parallel",
            StepKind::Conditional => "conditional",
            StepKind::Loop => "loop",
            StepKind::Wait => "wait",
            StepKind::HumanTask => "human_task",
        }
    }

    /// Kinds whose work is a nested sub-DAG of tasks.
    pub fn is_composite(&self) -> bool {
        matches!(self, StepKind::Parallel | StepKind::Conditional | StepKind::Loop)
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Step-specific configuration payload.
///
/// Internally tagged by `type`:
/// ```yaml
/// config:
///   type: service
///   target: billing
///   method: charge
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepConfig {
    /// Call an external endpoint through the Service invoker.
    Service {
        target: String,
        method: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
    /// Run a nested sub-DAG, optionally bounding how many nested tasks run at once.
    Parallel {
        steps: Vec<StepDefinition>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_concurrency: Option<u32>,
    },
    /// Evaluate a predicate once and run exactly one branch.
    Conditional {
        condition: String,
        #[serde(default)]
        if_steps: Vec<StepDefinition>,
        #[serde(default)]
        else_steps: Vec<StepDefinition>,
    },
    /// Run the nested steps once per item of the evaluated sequence.
    Loop {
        items: String,
        item_variable: String,
        steps: Vec<StepDefinition>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_iterations: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_concurrency: Option<u32>,
    },
    /// Suspend for a fixed duration or until an evaluated instant.
    Wait {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        until: Option<String>,
    },
    /// Wait for an external approval or rejection.
    HumanTask {
        assignee: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        on_timeout: Option<Box<StepDefinition>>,
    },
}

impl StepConfig {
    pub fn kind(&self) -> StepKind {
        match self {
            StepConfig::Service { .. } => StepKind::Service,
            StepConfig::Parallel { .. } => StepKind::Parallel,
            StepConfig::Conditional { .. } => StepKind::Conditional,
            StepConfig::Loop { .. } => StepKind::Loop,
            StepConfig::Wait { .. } => StepKind::Wait,
            StepConfig::HumanTask { .. } => StepKind::HumanTask,
        }
    }

    /// Nested step lists (each list is its own sub-DAG).
    pub fn nested_lists(&self) -> Vec<&[StepDefinition]> {
        match self {
            StepConfig::Parallel { steps, .. } | StepConfig::Loop { steps, .. } => {
                vec![steps.as_slice()]
            }
            StepConfig::Conditional {
                if_steps,
                else_steps,
                ..
            } => vec![if_steps.as_slice(), else_steps.as_slice()],
            _ => Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Retry Policy
// ---------------------------------------------------------------------------

/// Retry policy for a workflow step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one (default 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Backoff strategy between attempts.
    #[serde(default)]
    pub backoff: BackoffKind,
    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Upper bound for any computed delay, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: BackoffKind::default(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Delay growth between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    #[default]
    Fixed,
    Linear,
    Exponential,
}

// ---------------------------------------------------------------------------
// Error Handler
// ---------------------------------------------------------------------------

/// Workflow-level strategy applied once a step has exhausted its retries.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ErrorHandler {
    pub kind: ErrorHandlerKind,
    /// Compensation actions, consulted only for `Compensate`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub compensations: Vec<CompensationAction>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorHandlerKind {
    /// Start a fresh execution of the same definition and input.
    Retry,
    /// Undo completed steps in reverse dependency order, then fail.
    Compensate,
    /// Treat the failed step as satisfied and continue.
    Ignore,
    /// Fail the execution once nothing else can make progress.
    #[default]
    Fail,
}

/// A reversing action registered for a step, invoked through the Service invoker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationAction {
    pub step_id: String,
    pub target: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub input: Map<String, Value>,
}

// ---------------------------------------------------------------------------
// Trigger Configuration
// ---------------------------------------------------------------------------

/// How a workflow can be triggered. Declarative only; the core never fires triggers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerConfig {
    Manual {},
    Cron {
        schedule: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timezone: Option<String>,
    },
    Webhook {
        path: String,
    },
    Event {
        source: String,
        event_type: String,
    },
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const ORDER_YAML: &str = r#"
name: order-fulfilment
parameters:
  region: eu-west-1
error_handler:
  kind: compensate
  compensations:
    - step_id: reserve
      target: inventory
      method: release
steps:
  - id: reserve
    name: Reserve stock
    input:
      sku: "{{ params.sku }}"
    retry:
      max_attempts: 5
      backoff: exponential
      initial_delay_ms: 100
      max_delay_ms: 1000
    config:
      type: service
      target: inventory
      method: reserve
  - id: notify-all
    depends_on: [reserve]
    config:
      type: loop
      items: params.recipients
      item_variable: recipient
      max_concurrency: 2
      steps:
        - id: send
          config:
            type: service
            target: mailer
            method: send
  - id: approve
    depends_on: [reserve]
    config:
      type: human_task
      assignee: "'ops'"
      timeout_ms: 60000
      on_timeout:
        id: auto-approve
        config:
          type: service
          target: approvals
          method: auto
"#;

    #[test]
    fn test_yaml_definition_parses_with_defaults() {
        let def: WorkflowDefinition = serde_yaml_ng::from_str(ORDER_YAML).unwrap();
        assert_eq!(def.name, "order-fulfilment");
        assert_eq!(def.version, "1.0.0");
        assert_eq!(def.steps.len(), 3);
        assert!(!def.is_template);

        let reserve = &def.steps[0];
        assert_eq!(reserve.kind(), StepKind::Service);
        let retry = reserve.retry.as_ref().unwrap();
        assert_eq!(retry.max_attempts, 5);
        assert_eq!(retry.backoff, BackoffKind::Exponential);
        assert_eq!(reserve.input["sku"], json!("{{ params.sku }}"));

        let handler = def.effective_error_handler();
        assert_eq!(handler.kind, ErrorHandlerKind::Compensate);
        assert_eq!(handler.compensations[0].method, "release");
    }

    #[test]
    fn test_find_step_searches_nested_lists() {
        let def: WorkflowDefinition = serde_yaml_ng::from_str(ORDER_YAML).unwrap();
        assert_eq!(def.find_step("send").unwrap().kind(), StepKind::Service);
        assert_eq!(def.find_step("auto-approve").unwrap().id, "auto-approve");
        assert!(def.find_step("missing").is_none());
    }

    #[test]
    fn test_default_error_handler_is_fail() {
        let handler = ErrorHandler::default();
        assert_eq!(handler.kind, ErrorHandlerKind::Fail);
        assert!(handler.compensations.is_empty());
    }

    #[test]
    fn test_step_config_tagged_json() {
        let config = StepConfig::Wait {
            duration_ms: Some(250),
            until: None,
        };
        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["type"], "wait");
        assert_eq!(value["duration_ms"], 250);
        assert!(value.get("until").is_none());
    }

    #[test]
    fn test_step_kind_display_and_composite() {
        assert_eq!(StepKind::HumanTask.to_string(), "human_task");
        assert!(StepKind::Loop.is_composite());
        assert!(!StepKind::Service.is_composite());
    }

    #[test]
    fn test_display_name_falls_back_to_id() {
        let step = StepDefinition {
            id: "charge".to_string(),
            name: String::new(),
            depends_on: vec![],
            retry: None,
            input: Map::new(),
            config: StepConfig::Wait {
                duration_ms: Some(1),
                until: None,
            },
        };
        assert_eq!(step.display_name(), "charge");
    }
}
