//! Expression evaluation for Conditional, Loop and Wait steps.
//!
//! The scheduler treats expressions as opaque: it only needs a value (loop
//! items, wait deadline) or a truthy/falsy answer (conditions) computed
//! against the task's scope. [`ExpressionEvaluator`] is the injection point;
//! [`JexlEvaluator`] is the default, backed by `jexl_eval` with a small set
//! of standard transforms.
//!
//! **Security note:** scope data is always passed as the context object,
//! never interpolated into expression strings.

use serde_json::{Value, json};

use super::placeholder::whole_placeholder;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during expression evaluation.
#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    #[error("expression evaluation failed: {0}")]
    EvalFailed(String),

    #[error("expression '{expression}' produced {found}, expected {expected}")]
    WrongType {
        expression: String,
        expected: &'static str,
        found: String,
    },

    #[error("invalid context: {0}")]
    InvalidContext(String),
}

impl ExpressionError {
    pub fn wrong_type(expression: &str, expected: &'static str, found: &Value) -> Self {
        let found = match found {
            Value::Null => "null",
            Value::Bool(_) => "a boolean",
            Value::Number(_) => "a number",
            Value::String(_) => "a string",
            Value::Array(_) => "an array",
            Value::Object(_) => "an object",
        };
        Self::WrongType {
            expression: expression.to_string(),
            expected,
            found: found.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Port
// ---------------------------------------------------------------------------

/// Evaluates an expression against a JSON scope (see `context::ExecutionScope`).
pub trait ExpressionEvaluator: Send + Sync {
    fn evaluate(&self, expression: &str, scope: &Value) -> Result<Value, ExpressionError>;

    /// Evaluate and coerce the result with JavaScript-like truthiness.
    fn evaluate_bool(&self, expression: &str, scope: &Value) -> Result<bool, ExpressionError> {
        Ok(is_truthy(&self.evaluate(expression, scope)?))
    }
}

/// Coerce a JSON value to boolean using JavaScript-like truthiness.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

// ---------------------------------------------------------------------------
// JexlEvaluator
// ---------------------------------------------------------------------------

/// JEXL evaluator with standard transforms pre-registered.
///
/// Expressions may optionally be wrapped in `{{ ... }}`; the braces are
/// stripped before evaluation. Examples:
/// - `params.amount > 100`
/// - `steps.fetch.output.items|length > 0`
/// - `params.env|lower == 'prod'`
pub struct JexlEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

impl Default for JexlEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl JexlEvaluator {
    pub fn new() -> Self {
        let evaluator = jexl_eval::Evaluator::new()
            .with_transform("lower", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_lowercase()))
            })
            .with_transform("upper", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_uppercase()))
            })
            .with_transform("trim", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.trim()))
            })
            .with_transform("split", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let delimiter = args.get(1).and_then(|v| v.as_str()).unwrap_or(",");
                let parts: Vec<&str> = s.split(delimiter).collect();
                Ok(json!(parts))
            })
            .with_transform("not", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                Ok(json!(!is_truthy(&val)))
            })
            .with_transform("contains", |args: &[Value]| {
                let found = match (args.first(), args.get(1)) {
                    (Some(Value::String(s)), Some(Value::String(needle))) => s.contains(needle.as_str()),
                    (Some(Value::Array(items)), Some(needle)) => items.contains(needle),
                    (Some(Value::Object(map)), Some(Value::String(key))) => map.contains_key(key),
                    _ => false,
                };
                Ok(json!(found))
            })
            .with_transform("startsWith", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let prefix = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.starts_with(prefix)))
            })
            .with_transform("endsWith", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let suffix = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.ends_with(suffix)))
            })
            .with_transform("length", |args: &[Value]| {
                let len = match args.first() {
                    Some(Value::String(s)) => s.chars().count(),
                    Some(Value::Array(a)) => a.len(),
                    Some(Value::Object(o)) => o.len(),
                    _ => 0,
                };
                Ok(json!(len as f64))
            })
            .with_transform("keys", |args: &[Value]| {
                let keys: Vec<String> = match args.first() {
                    Some(Value::Object(o)) => o.keys().cloned().collect(),
                    _ => Vec::new(),
                };
                Ok(json!(keys))
            });
        Self { evaluator }
    }
}

impl ExpressionEvaluator for JexlEvaluator {
    fn evaluate(&self, expression: &str, scope: &Value) -> Result<Value, ExpressionError> {
        if !scope.is_object() {
            return Err(ExpressionError::InvalidContext(
                "scope must be a JSON object".to_string(),
            ));
        }
        let expression = whole_placeholder(expression).unwrap_or(expression.trim());
        self.evaluator
            .eval_in_context(expression, scope)
            .map_err(|e| ExpressionError::EvalFailed(format!("'{expression}': {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope() -> Value {
        json!({
            "params": {"amount": 250, "env": "PROD", "tags": ["a", "b"]},
            "steps": {"fetch": {"status": "completed", "output": {"items": [1, 2, 3]}}},
            "vars": {},
        })
    }

    #[test]
    fn test_comparison() {
        let eval = JexlEvaluator::new();
        assert!(eval.evaluate_bool("params.amount > 100", &scope()).unwrap());
        assert!(!eval.evaluate_bool("params.amount < 100", &scope()).unwrap());
    }

    #[test]
    fn test_braces_are_stripped() {
        let eval = JexlEvaluator::new();
        assert!(eval.evaluate_bool("{{ params.amount > 100 }}", &scope()).unwrap());
    }

    #[test]
    fn test_transforms() {
        let eval = JexlEvaluator::new();
        assert!(eval.evaluate_bool("params.env|lower == 'prod'", &scope()).unwrap());
        assert_eq!(
            eval.evaluate("steps.fetch.output.items|length", &scope()).unwrap(),
            json!(3.0)
        );
        assert!(eval.evaluate_bool("params.tags|contains('b')", &scope()).unwrap());
    }

    #[test]
    fn test_wrong_type_message() {
        let err = ExpressionError::wrong_type("params.amount", "an array", &json!(250));
        assert_eq!(
            err.to_string(),
            "expression 'params.amount' produced a number, expected an array"
        );
    }

    #[test]
    fn test_evaluator_is_reused() {
        let eval = JexlEvaluator::default();
        for env in ["prod", "dev"] {
            let scope = json!({"params": {"env": env}});
            assert_eq!(
                eval.evaluate_bool("params.env|upper == 'PROD'", &scope).unwrap(),
                env == "prod"
            );
        }
    }

    #[test]
    fn test_value_evaluation_returns_raw_json() {
        let eval = JexlEvaluator::new();
        assert_eq!(
            eval.evaluate("steps.fetch.output.items", &scope()).unwrap(),
            json!([1, 2, 3])
        );
    }

    #[test]
    fn test_invalid_expression_errors() {
        let eval = JexlEvaluator::new();
        assert!(matches!(
            eval.evaluate("params.amount >", &scope()),
            Err(ExpressionError::EvalFailed(_))
        ));
    }

    #[test]
    fn test_non_object_scope_rejected() {
        let eval = JexlEvaluator::new();
        assert!(matches!(
            eval.evaluate("1 == 1", &json!([1])),
            Err(ExpressionError::InvalidContext(_))
        ));
    }

    #[test]
    fn test_truthiness() {
        assert!(!is_truthy(&Value::Null));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(is_truthy(&json!([])));
        assert!(is_truthy(&json!("x")));
    }
}
