//! Evaluation scope for step inputs and expressions.
//!
//! A task sees the execution parameters, the outputs of the steps visible to
//! it (its own siblings plus those of every enclosing step list) and any loop
//! variables bound by enclosing loops. The JSON form is:
//!
//! ```json
//! {
//!   "execution": { "id": "..." },
//!   "params": { "region": "eu" },
//!   "steps": { "fetch": { "status": "completed", "output": { ... } } },
//!   "vars": { "recipient": "ops@example.com" },
//!   "recipient": "ops@example.com"
//! }
//! ```
//!
//! Loop variables are also exposed at the top level so that
//! `{{ recipient }}` and `recipient.email` work in inputs and expressions.

use serde_json::{Map, Value, json};
use stepflow_types::execution::TaskStatus;
use uuid::Uuid;

use super::placeholder::{lookup_path, substitute, substitute_str};

const RESERVED: [&str; 4] = ["execution", "params", "steps", "vars"];

#[derive(Debug, Clone, Default)]
pub struct ExecutionScope {
    execution_id: Option<Uuid>,
    params: Map<String, Value>,
    steps: Map<String, Value>,
    vars: Map<String, Value>,
}

impl ExecutionScope {
    pub fn new(execution_id: Uuid, params: Map<String, Value>) -> Self {
        Self {
            execution_id: Some(execution_id),
            params,
            ..Default::default()
        }
    }

    /// Record the visible state of a step. Inner step lists overwrite outer
    /// ones when recorded later.
    pub fn record_step(&mut self, step_id: &str, status: TaskStatus, output: Option<&Value>) {
        self.steps.insert(
            step_id.to_string(),
            json!({
                "status": status.as_str(),
                "output": output.cloned().unwrap_or(Value::Null),
            }),
        );
    }

    /// Bind a loop variable.
    pub fn bind(&mut self, name: &str, value: Value) {
        self.vars.insert(name.to_string(), value);
    }

    pub fn params(&self) -> &Map<String, Value> {
        &self.params
    }

    pub fn step_output(&self, step_id: &str) -> Option<&Value> {
        self.steps.get(step_id).and_then(|s| s.get("output"))
    }

    /// JSON form passed to expressions and placeholder lookups.
    pub fn to_value(&self) -> Value {
        let mut root = Map::new();
        for (name, value) in &self.vars {
            if !RESERVED.contains(&name.as_str()) {
                root.insert(name.clone(), value.clone());
            }
        }
        if let Some(id) = self.execution_id {
            root.insert("execution".to_string(), json!({ "id": id }));
        }
        root.insert("params".to_string(), Value::Object(self.params.clone()));
        root.insert("steps".to_string(), Value::Object(self.steps.clone()));
        root.insert("vars".to_string(), Value::Object(self.vars.clone()));
        Value::Object(root)
    }

    /// Resolve every placeholder in a step's static input map.
    pub fn resolve_input(&self, input: &Map<String, Value>) -> Value {
        let scope = self.to_value();
        substitute(&Value::Object(input.clone()), &|path| lookup_path(&scope, path))
    }

    /// Resolve placeholders in a single string.
    pub fn resolve_str(&self, text: &str) -> Value {
        let scope = self.to_value();
        substitute_str(text, &|path| lookup_path(&scope, path))
    }
}
