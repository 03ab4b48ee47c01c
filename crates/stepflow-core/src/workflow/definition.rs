//! Workflow definition parsing, validation, and filesystem operations.
//!
//! Converts between YAML/JSON documents and the canonical
//! `WorkflowDefinition`, and validates structural constraints before a
//! definition is accepted. The scheduler assumes every definition it runs has
//! passed [`validate_definition`] and performs no cycle checking of its own.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use stepflow_types::workflow::{StepConfig, StepDefinition, StepKind, TriggerConfig, WorkflowDefinition};
use thiserror::Error;

use super::dag;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// A structural problem with a workflow definition. Always names the
/// offending step(s) when one is involved.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("workflow must have at least one step")]
    NoSteps,

    #[error("step list of '{parent}' must have at least one step")]
    EmptyNestedSteps { parent: String },

    #[error("duplicate step id '{0}'")]
    DuplicateStepId(String),

    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error("step '{step}' depends on '{dependency}', which is not in the same step list")]
    NonSiblingDependency { step: String, dependency: String },

    #[error("dependency cycle detected: {}", .steps.join(" -> "))]
    Cycle { steps: Vec<String> },

    #[error("workflow name must not be empty")]
    EmptyName,

    #[error("step id must not be empty")]
    EmptyStepId,

    #[error("step '{step}' has an invalid retry policy: {reason}")]
    InvalidRetryPolicy { step: String, reason: String },

    #[error("step '{step}' is a {kind} step and cannot carry a retry policy")]
    RetryNotAllowed { step: String, kind: StepKind },

    #[error("step '{step}' is invalid: {reason}")]
    InvalidStep { step: String, reason: String },

    #[error("compensation references unknown step '{0}'")]
    UnknownCompensationStep(String),

    #[error("invalid trigger: {0}")]
    InvalidTrigger(String),

    #[error("workflow timeout must be greater than zero")]
    ZeroTimeout,
}

/// Errors that can occur while loading or parsing workflow definitions.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// YAML/JSON parse failure.
    #[error("parse error: {0}")]
    ParseError(String),

    /// Structural validation failure.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a validated `WorkflowDefinition`.
pub fn parse_definition_yaml(yaml: &str) -> Result<WorkflowDefinition, WorkflowError> {
    let def: WorkflowDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| WorkflowError::ParseError(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Parse a JSON string into a validated `WorkflowDefinition`.
pub fn parse_definition_json(json: &str) -> Result<WorkflowDefinition, WorkflowError> {
    let def: WorkflowDefinition =
        serde_json::from_str(json).map_err(|e| WorkflowError::ParseError(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Serialize a `WorkflowDefinition` to a YAML string.
pub fn serialize_definition_yaml(def: &WorkflowDefinition) -> Result<String, WorkflowError> {
    serde_yaml_ng::to_string(def).map_err(|e| WorkflowError::ParseError(e.to_string()))
}

/// Load and validate a definition file. `.json` files are parsed as JSON,
/// everything else as YAML.
pub fn load_definition_file(path: &Path) -> Result<WorkflowDefinition, WorkflowError> {
    let content = std::fs::read_to_string(path)?;
    let is_json = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"));
    if is_json {
        parse_definition_json(&content)
    } else {
        parse_definition_yaml(&content)
    }
}

/// Save a definition to a YAML file, creating parent directories as needed.
pub fn save_definition_file(path: &Path, def: &WorkflowDefinition) -> Result<(), WorkflowError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let yaml = serialize_definition_yaml(def)?;
    std::fs::write(path, yaml)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a `WorkflowDefinition`.
///
/// Checks, in order:
/// - At least one step exists
/// - Step ids are unique across the whole definition, nested lists included
/// - Every `depends_on` entry names an existing sibling step
/// - Each step list is acyclic
///
/// followed by the per-step and definition-level checks: workflow name,
/// retry policies, kind-specific configuration, compensations, triggers
/// and timeout.
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), ValidationError> {
    if def.steps.is_empty() {
        return Err(ValidationError::NoSteps);
    }

    let mut all_ids = HashSet::new();
    collect_unique_ids(&def.steps, &mut all_ids)?;

    check_step_list(&def.steps, &all_ids)?;

    if def.name.trim().is_empty() {
        return Err(ValidationError::EmptyName);
    }

    validate_steps(&def.steps)?;

    if let Some(handler) = &def.error_handler {
        for compensation in &handler.compensations {
            if !all_ids.contains(compensation.step_id.as_str()) {
                return Err(ValidationError::UnknownCompensationStep(
                    compensation.step_id.clone(),
                ));
            }
        }
    }

    for trigger in &def.triggers {
        validate_trigger(trigger)?;
    }

    if def.timeout_ms == Some(0) {
        return Err(ValidationError::ZeroTimeout);
    }

    Ok(())
}

/// Every step list nested inside a step, including a HumanTask fallback.
fn child_lists(step: &StepDefinition) -> Vec<&[StepDefinition]> {
    let mut lists = step.config.nested_lists();
    if let StepConfig::HumanTask {
        on_timeout: Some(fallback),
        ..
    } = &step.config
    {
        lists.push(std::slice::from_ref(fallback.as_ref()));
    }
    lists
}

fn collect_unique_ids<'a>(
    steps: &'a [StepDefinition],
    seen: &mut HashSet<&'a str>,
) -> Result<(), ValidationError> {
    for step in steps {
        if step.id.trim().is_empty() {
            return Err(ValidationError::EmptyStepId);
        }
        if !seen.insert(step.id.as_str()) {
            return Err(ValidationError::DuplicateStepId(step.id.clone()));
        }
        for list in child_lists(step) {
            collect_unique_ids(list, seen)?;
        }
    }
    Ok(())
}

/// Dependency and cycle checks for one step list, then recurse into nested lists.
fn check_step_list(steps: &[StepDefinition], all_ids: &HashSet<&str>) -> Result<(), ValidationError> {
    let siblings: HashSet<&str> = steps.iter().map(|s| s.id.as_str()).collect();
    for step in steps {
        for dep in &step.depends_on {
            if !siblings.contains(dep.as_str()) {
                return Err(if all_ids.contains(dep.as_str()) {
                    ValidationError::NonSiblingDependency {
                        step: step.id.clone(),
                        dependency: dep.clone(),
                    }
                } else {
                    ValidationError::UnknownDependency {
                        step: step.id.clone(),
                        dependency: dep.clone(),
                    }
                });
            }
        }
    }

    if let Some(cycle) = dag::find_cycle(steps) {
        return Err(ValidationError::Cycle { steps: cycle });
    }

    for step in steps {
        for list in child_lists(step) {
            check_step_list(list, all_ids)?;
        }
    }
    Ok(())
}

fn validate_steps(steps: &[StepDefinition]) -> Result<(), ValidationError> {
    for step in steps {
        validate_step(step)?;
        for list in child_lists(step) {
            validate_steps(list)?;
        }
    }
    Ok(())
}

fn invalid(step: &StepDefinition, reason: impl Into<String>) -> ValidationError {
    ValidationError::InvalidStep {
        step: step.id.clone(),
        reason: reason.into(),
    }
}

fn validate_step(step: &StepDefinition) -> Result<(), ValidationError> {
    if let Some(policy) = &step.retry {
        if !matches!(
            step.kind(),
            StepKind::Service | StepKind::HumanTask | StepKind::Wait
        ) {
            return Err(ValidationError::RetryNotAllowed {
                step: step.id.clone(),
                kind: step.kind(),
            });
        }
        if policy.max_attempts < 1 {
            return Err(ValidationError::InvalidRetryPolicy {
                step: step.id.clone(),
                reason: "max_attempts must be at least 1".to_string(),
            });
        }
        if policy.max_delay_ms < policy.initial_delay_ms {
            return Err(ValidationError::InvalidRetryPolicy {
                step: step.id.clone(),
                reason: format!(
                    "max_delay_ms ({}) must be >= initial_delay_ms ({})",
                    policy.max_delay_ms, policy.initial_delay_ms
                ),
            });
        }
    }

    match &step.config {
        StepConfig::Service {
            target,
            method,
            timeout_ms,
        } => {
            if target.trim().is_empty() || method.trim().is_empty() {
                return Err(invalid(step, "service target and method must not be empty"));
            }
            if *timeout_ms == Some(0) {
                return Err(invalid(step, "timeout_ms must be greater than zero"));
            }
        }
        StepConfig::Parallel {
            steps,
            max_concurrency,
        } => {
            if steps.is_empty() {
                return Err(ValidationError::EmptyNestedSteps {
                    parent: step.id.clone(),
                });
            }
            check_concurrency(step, *max_concurrency)?;
        }
        StepConfig::Conditional {
            condition,
            if_steps,
            else_steps,
        } => {
            if condition.trim().is_empty() {
                return Err(invalid(step, "condition must not be empty"));
            }
            if if_steps.is_empty() && else_steps.is_empty() {
                return Err(ValidationError::EmptyNestedSteps {
                    parent: step.id.clone(),
                });
            }
        }
        StepConfig::Loop {
            items,
            item_variable,
            steps,
            max_concurrency,
            ..
        } => {
            if items.trim().is_empty() {
                return Err(invalid(step, "items expression must not be empty"));
            }
            let var = item_variable.trim();
            if var.is_empty() {
                return Err(invalid(step, "item_variable must not be empty"));
            }
            if matches!(var, "params" | "steps" | "vars" | "execution") {
                return Err(invalid(step, format!("item_variable '{var}' is reserved")));
            }
            if steps.is_empty() {
                return Err(ValidationError::EmptyNestedSteps {
                    parent: step.id.clone(),
                });
            }
            check_concurrency(step, *max_concurrency)?;
        }
        StepConfig::Wait { duration_ms, until } => match (duration_ms, until) {
            (Some(_), None) => {}
            (None, Some(expr)) if !expr.trim().is_empty() => {}
            _ => {
                return Err(invalid(
                    step,
                    "wait requires exactly one of duration_ms or until",
                ));
            }
        },
        StepConfig::HumanTask {
            assignee,
            timeout_ms,
            ..
        } => {
            if assignee.trim().is_empty() {
                return Err(invalid(step, "assignee must not be empty"));
            }
            if *timeout_ms == Some(0) {
                return Err(invalid(step, "timeout_ms must be greater than zero"));
            }
        }
    }
    Ok(())
}

fn check_concurrency(step: &StepDefinition, cap: Option<u32>) -> Result<(), ValidationError> {
    if cap == Some(0) {
        return Err(invalid(step, "max_concurrency must be at least 1"));
    }
    Ok(())
}

fn validate_trigger(trigger: &TriggerConfig) -> Result<(), ValidationError> {
    match trigger {
        TriggerConfig::Manual {} => Ok(()),
        TriggerConfig::Cron { schedule, .. } => schedule
            .parse::<croner::Cron>()
            .map(|_| ())
            .map_err(|e| ValidationError::InvalidTrigger(format!("cron '{schedule}': {e}"))),
        TriggerConfig::Webhook { path } => {
            if path.trim().is_empty() {
                Err(ValidationError::InvalidTrigger(
                    "webhook path must not be empty".to_string(),
                ))
            } else {
                Ok(())
            }
        }
        TriggerConfig::Event { source, event_type } => {
            if source.trim().is_empty() || event_type.trim().is_empty() {
                Err(ValidationError::InvalidTrigger(
                    "event trigger requires source and event_type".to_string(),
                ))
            } else {
                Ok(())
            }
        }
    }
}

/// Index every step in the definition (nested ones included) by id.
pub fn index_steps(def: &WorkflowDefinition) -> HashMap<&str, &StepDefinition> {
    fn walk<'a>(steps: &'a [StepDefinition], out: &mut HashMap<&'a str, &'a StepDefinition>) {
        for step in steps {
            out.insert(step.id.as_str(), step);
            for list in child_lists(step) {
                walk(list, out);
            }
        }
    }
    let mut out = HashMap::new();
    walk(&def.steps, &mut out);
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;
    use stepflow_types::workflow::{
        BackoffKind, CompensationAction, ErrorHandler, ErrorHandlerKind, RetryPolicy,
    };

    fn minimal_workflow(steps: Vec<StepDefinition>) -> WorkflowDefinition {
        serde_json::from_value(serde_json::json!({
            "name": "test-workflow",
            "steps": steps,
        }))
        .unwrap()
    }

    fn service(id: &str, depends_on: &[&str]) -> StepDefinition {
        StepDefinition {
            id: id.to_string(),
            name: String::new(),
            depends_on: depends_on.iter().map(|d| d.to_string()).collect(),
            retry: None,
            input: Map::new(),
            config: StepConfig::Service {
                target: "svc".to_string(),
                method: "run".to_string(),
                timeout_ms: None,
            },
        }
    }

    fn parallel(id: &str, steps: Vec<StepDefinition>) -> StepDefinition {
        StepDefinition {
            config: StepConfig::Parallel {
                steps,
                max_concurrency: None,
            },
            ..service(id, &[])
        }
    }

    #[test]
    fn test_valid_diamond_accepted() {
        let def = minimal_workflow(vec![
            service("a", &[]),
            service("b", &["a"]),
            service("c", &["a"]),
            service("d", &["b", "c"]),
        ]);
        validate_definition(&def).unwrap();
    }

    #[test]
    fn test_validation_rejects_empty_workflow() {
        let def = minimal_workflow(vec![]);
        assert_eq!(validate_definition(&def), Err(ValidationError::NoSteps));
    }

    #[test]
    fn test_validation_rejects_duplicate_step_ids() {
        let def = minimal_workflow(vec![service("a", &[]), service("a", &[])]);
        assert_eq!(
            validate_definition(&def),
            Err(ValidationError::DuplicateStepId("a".to_string()))
        );
    }

    #[test]
    fn test_validation_rejects_duplicate_ids_across_nesting() {
        let def = minimal_workflow(vec![
            service("check", &[]),
            parallel("fanout", vec![service("check", &[])]),
        ]);
        assert_eq!(
            validate_definition(&def),
            Err(ValidationError::DuplicateStepId("check".to_string()))
        );
    }

    #[test]
    fn test_validation_rejects_unknown_dependency() {
        let def = minimal_workflow(vec![service("a", &["ghost"])]);
        let err = validate_definition(&def).unwrap_err();
        assert_eq!(
            err,
            ValidationError::UnknownDependency {
                step: "a".to_string(),
                dependency: "ghost".to_string(),
            }
        );
        assert!(err.to_string().contains("'a'"));
        assert!(err.to_string().contains("'ghost'"));
    }

    #[test]
    fn test_validation_rejects_non_sibling_dependency() {
        let def = minimal_workflow(vec![
            service("a", &[]),
            parallel("fanout", vec![service("inner", &["a"])]),
        ]);
        assert!(matches!(
            validate_definition(&def),
            Err(ValidationError::NonSiblingDependency { step, .. }) if step == "inner"
        ));
    }

    #[test]
    fn test_validation_rejects_cycle_naming_steps() {
        let def = minimal_workflow(vec![
            service("a", &["c"]),
            service("b", &["a"]),
            service("c", &["b"]),
        ]);
        match validate_definition(&def) {
            Err(ValidationError::Cycle { steps }) => {
                assert!(steps.contains(&"a".to_string()));
                assert!(steps.contains(&"b".to_string()));
                assert!(steps.contains(&"c".to_string()));
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_validation_rejects_cycle_in_nested_list() {
        let def = minimal_workflow(vec![parallel(
            "fanout",
            vec![service("x", &["y"]), service("y", &["x"])],
        )]);
        assert!(matches!(
            validate_definition(&def),
            Err(ValidationError::Cycle { .. })
        ));
    }

    #[test]
    fn test_validation_rejects_self_dependency() {
        let def = minimal_workflow(vec![service("a", &["a"])]);
        assert_eq!(
            validate_definition(&def),
            Err(ValidationError::Cycle {
                steps: vec!["a".to_string(), "a".to_string()]
            })
        );
    }

    #[test]
    fn test_validation_rejects_empty_name() {
        let mut def = minimal_workflow(vec![service("a", &[])]);
        def.name = "  ".to_string();
        assert_eq!(validate_definition(&def), Err(ValidationError::EmptyName));
    }

    #[test]
    fn test_validation_rejects_bad_retry_policy() {
        let mut step = service("a", &[]);
        step.retry = Some(RetryPolicy {
            max_attempts: 0,
            ..RetryPolicy::default()
        });
        let def = minimal_workflow(vec![step.clone()]);
        assert!(matches!(
            validate_definition(&def),
            Err(ValidationError::InvalidRetryPolicy { .. })
        ));

        step.retry = Some(RetryPolicy {
            max_attempts: 3,
            backoff: BackoffKind::Linear,
            initial_delay_ms: 500,
            max_delay_ms: 100,
        });
        let def = minimal_workflow(vec![step]);
        assert!(matches!(
            validate_definition(&def),
            Err(ValidationError::InvalidRetryPolicy { step, .. }) if step == "a"
        ));
    }

    #[test]
    fn test_validation_rejects_retry_on_composite() {
        let mut step = parallel("fanout", vec![service("x", &[])]);
        step.retry = Some(RetryPolicy::default());
        let def = minimal_workflow(vec![step]);
        assert!(matches!(
            validate_definition(&def),
            Err(ValidationError::RetryNotAllowed { kind: StepKind::Parallel, .. })
        ));
    }

    #[test]
    fn test_validation_rejects_ambiguous_wait() {
        let mut step = service("pause", &[]);
        step.config = StepConfig::Wait {
            duration_ms: Some(10),
            until: Some("params.at".to_string()),
        };
        let def = minimal_workflow(vec![step]);
        assert!(matches!(
            validate_definition(&def),
            Err(ValidationError::InvalidStep { step, .. }) if step == "pause"
        ));
    }

    #[test]
    fn test_validation_rejects_zero_concurrency() {
        let def = minimal_workflow(vec![StepDefinition {
            config: StepConfig::Parallel {
                steps: vec![service("x", &[])],
                max_concurrency: Some(0),
            },
            ..service("fanout", &[])
        }]);
        assert!(matches!(
            validate_definition(&def),
            Err(ValidationError::InvalidStep { .. })
        ));
    }

    #[test]
    fn test_validation_rejects_unknown_compensation_step() {
        let mut def = minimal_workflow(vec![service("a", &[])]);
        def.error_handler = Some(ErrorHandler {
            kind: ErrorHandlerKind::Compensate,
            compensations: vec![CompensationAction {
                step_id: "ghost".to_string(),
                target: "svc".to_string(),
                method: "undo".to_string(),
                input: Map::new(),
            }],
        });
        assert_eq!(
            validate_definition(&def),
            Err(ValidationError::UnknownCompensationStep("ghost".to_string()))
        );
    }

    #[test]
    fn test_validation_rejects_bad_cron() {
        let mut def = minimal_workflow(vec![service("a", &[])]);
        def.triggers = vec![TriggerConfig::Cron {
            schedule: "not a cron".to_string(),
            timezone: None,
        }];
        assert!(matches!(
            validate_definition(&def),
            Err(ValidationError::InvalidTrigger(_))
        ));

        def.triggers = vec![TriggerConfig::Cron {
            schedule: "0 9 * * 1-5".to_string(),
            timezone: None,
        }];
        validate_definition(&def).unwrap();
    }

    #[test]
    fn test_parse_yaml_validates() {
        let yaml = r#"
name: broken
steps:
  - id: a
    depends_on: [b]
    config:
      type: service
      target: svc
      method: run
"#;
        let err = parse_definition_yaml(yaml).unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::Validation(ValidationError::UnknownDependency { .. })
        ));

        assert!(matches!(
            parse_definition_yaml("name: [unclosed"),
            Err(WorkflowError::ParseError(_))
        ));
    }

    #[test]
    fn test_save_and_load_definition_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flows").join("diamond.yaml");
        let def = minimal_workflow(vec![service("a", &[]), service("b", &["a"])]);

        save_definition_file(&path, &def).unwrap();
        let loaded = load_definition_file(&path).unwrap();
        assert_eq!(loaded.id, def.id);
        assert_eq!(loaded.steps, def.steps);

        let json_path = dir.path().join("diamond.json");
        std::fs::write(&json_path, serde_json::to_string(&def).unwrap()).unwrap();
        assert_eq!(load_definition_file(&json_path).unwrap().name, "test-workflow");
    }

    #[test]
    fn test_index_steps_includes_nested() {
        let def = minimal_workflow(vec![parallel("fanout", vec![service("x", &[])])]);
        let index = index_steps(&def);
        assert!(index.contains_key("fanout"));
        assert!(index.contains_key("x"));
    }
}
