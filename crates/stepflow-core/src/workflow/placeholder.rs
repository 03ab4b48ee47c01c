//! `{{ ... }}` placeholder substitution over JSON values.
//!
//! Shared by step input resolution (`{{ steps.fetch.output.id }}`) and
//! template instantiation (`{{region}}`). Substitution is best-effort:
//!
//! - A string that is exactly one placeholder is replaced by the raw JSON
//!   value it resolves to (numbers stay numbers, objects stay objects).
//! - Placeholders embedded in longer strings are replaced by the value's
//!   text form (strings verbatim, everything else as compact JSON).
//! - Placeholders that do not resolve are left untouched.

use serde_json::Value;

/// Substitute placeholders in every string found in `value`, recursing into
/// arrays and objects. `lookup` receives the trimmed placeholder body.
pub fn substitute(value: &Value, lookup: &dyn Fn(&str) -> Option<Value>) -> Value {
    match value {
        Value::String(s) => substitute_str(s, lookup),
        Value::Array(items) => Value::Array(items.iter().map(|v| substitute(v, lookup)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute(v, lookup)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Substitute placeholders in a single string.
pub fn substitute_str(input: &str, lookup: &dyn Fn(&str) -> Option<Value>) -> Value {
    if let Some(body) = whole_placeholder(input) {
        return lookup(body).unwrap_or_else(|| Value::String(input.to_string()));
    }

    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("{{") {
        let Some(len) = rest[start + 2..].find("}}") else {
            break;
        };
        let end = start + 2 + len;
        let body = rest[start + 2..end].trim();
        out.push_str(&rest[..start]);
        match lookup(body) {
            Some(value) => out.push_str(&value_to_text(&value)),
            None => out.push_str(&rest[start..end + 2]),
        }
        rest = &rest[end + 2..];
    }
    out.push_str(rest);
    Value::String(out)
}

/// If the whole string (ignoring surrounding whitespace) is one placeholder,
/// return its trimmed body.
pub fn whole_placeholder(input: &str) -> Option<&str> {
    let trimmed = input.trim();
    let body = trimmed.strip_prefix("{{")?.strip_suffix("}}")?;
    if body.contains("{{") || body.contains("}}") {
        return None;
    }
    Some(body.trim())
}

/// Text form used when a value is spliced into a longer string.
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Resolve a dotted path such as `steps.fetch.output.items[0].id` against a
/// JSON value.
pub fn lookup_path(root: &Value, path: &str) -> Option<Value> {
    let mut current = root;
    for segment in path.split('.') {
        let segment = segment.trim();
        if segment.is_empty() {
            return None;
        }
        let (key, indices) = split_indices(segment)?;
        if !key.is_empty() {
            current = current.get(key)?;
        }
        for index in indices {
            current = current.get(index)?;
        }
    }
    Some(current.clone())
}

/// Split `items[0][2]` into `("items", [0, 2])`.
fn split_indices(segment: &str) -> Option<(&str, Vec<usize>)> {
    let Some(open) = segment.find('[') else {
        return Some((segment, Vec::new()));
    };
    let key = &segment[..open];
    let mut indices = Vec::new();
    let mut rest = &segment[open..];
    while !rest.is_empty() {
        let inner = rest.strip_prefix('[')?;
        let close = inner.find(']')?;
        indices.push(inner[..close].trim().parse().ok()?);
        rest = &inner[close + 1..];
    }
    Some((key, indices))
}
