//! Template instantiation.
//!
//! A template is an ordinary definition flagged `is_template`. Instantiating
//! it merges caller overrides into the template's parameters and substitutes
//! `{{name}}` placeholders in the parameters and in every step input map
//! (nested steps included). Placeholders that do not name a parameter, such
//! as `{{ steps.fetch.output.id }}`, are left for runtime resolution.

use chrono::Utc;
use serde_json::{Map, Value};
use stepflow_types::workflow::{StepConfig, StepDefinition, WorkflowDefinition};
use uuid::Uuid;

use super::definition::{ValidationError, validate_definition};
use super::placeholder::{lookup_path, substitute};

/// Build a new, validated, non-template definition from `template`.
pub fn instantiate_template(
    template: &WorkflowDefinition,
    name: &str,
    overrides: &Map<String, Value>,
) -> Result<WorkflowDefinition, ValidationError> {
    let mut merged = template.parameters.clone();
    for (key, value) in overrides {
        merged.insert(key.clone(), value.clone());
    }
    let root = Value::Object(merged.clone());
    let lookup = |path: &str| lookup_path(&root, path);

    let parameters = match substitute(&Value::Object(merged), &lookup) {
        Value::Object(map) => map,
        _ => Map::new(),
    };

    let mut steps = template.steps.clone();
    substitute_steps(&mut steps, &lookup);

    let now = Utc::now();
    let def = WorkflowDefinition {
        id: Uuid::now_v7(),
        name: name.to_string(),
        steps,
        parameters,
        is_template: false,
        template_id: Some(template.id),
        created_at: now,
        updated_at: now,
        ..template.clone()
    };
    validate_definition(&def)?;
    Ok(def)
}

fn substitute_steps(steps: &mut [StepDefinition], lookup: &dyn Fn(&str) -> Option<Value>) {
    for step in steps {
        if let Value::Object(input) = substitute(&Value::Object(std::mem::take(&mut step.input)), lookup) {
            step.input = input;
        }
        match &mut step.config {
            StepConfig::Parallel { steps, .. } | StepConfig::Loop { steps, .. } => {
                substitute_steps(steps, lookup);
            }
            StepConfig::Conditional {
                if_steps,
                else_steps,
                ..
            } => {
                substitute_steps(if_steps, lookup);
                substitute_steps(else_steps, lookup);
            }
            StepConfig::HumanTask {
                on_timeout: Some(fallback),
                ..
            } => substitute_steps(std::slice::from_mut(fallback.as_mut()), lookup),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::definition::parse_definition_yaml;
    use serde_json::json;

    const TEMPLATE: &str = r#"
name: regional-report
is_template: true
parameters:
  region: eu
  limit: 10
  label: "report-{{region}}"
steps:
  - id: fetch
    input:
      region: "{{region}}"
      limit: "{{ limit }}"
    config:
      type: service
      target: reports
      method: fetch
  - id: fanout
    depends_on: [fetch]
    config:
      type: parallel
      steps:
        - id: publish
          input:
            id: "{{ steps.fetch.output.id }}"
            where: "s3://{{region}}/{{bucket}}"
          config:
            type: service
            target: reports
            method: publish
"#;

    fn template() -> WorkflowDefinition {
        parse_definition_yaml(TEMPLATE).unwrap()
    }

    #[test]
    fn test_overrides_and_defaults_are_substituted() {
        let template = template();
        let mut overrides = Map::new();
        overrides.insert("region".to_string(), json!("us"));
        overrides.insert("limit".to_string(), json!(25));

        let def = instantiate_template(&template, "us-report", &overrides).unwrap();

        assert_eq!(def.name, "us-report");
        assert!(!def.is_template);
        assert_eq!(def.template_id, Some(template.id));
        assert_ne!(def.id, template.id);
        assert_eq!(def.steps[0].input["region"], json!("us"));
        assert_eq!(def.steps[0].input["limit"], json!(25));
        assert_eq!(def.parameters["label"], json!("report-us"));
    }

    #[test]
    fn test_runtime_and_unknown_placeholders_survive() {
        let def = instantiate_template(&template(), "eu-report", &Map::new()).unwrap();
        let StepConfig::Parallel { steps, .. } = &def.steps[1].config else {
            panic!("expected parallel");
        };
        assert_eq!(steps[0].input["id"], json!("{{ steps.fetch.output.id }}"));
        assert_eq!(steps[0].input["where"], json!("s3://eu/{{bucket}}"));
    }

    #[test]
    fn test_template_is_left_untouched() {
        let template = template();
        let _ = instantiate_template(&template, "copy", &Map::new()).unwrap();
        assert!(template.is_template);
        assert_eq!(template.steps[0].input["region"], json!("{{region}}"));
    }
}
