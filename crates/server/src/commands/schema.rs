//! JSON-schema subset validation for command payloads.
//!
//! Supports exactly the keywords command envelopes use: `type` (object,
//! string, boolean, integer, array), `enum`, `const`, `minLength`/
//! `maxLength`, `minimum`/`maximum`, `minItems`/`maxItems`,
//! `properties`, `required`, `additionalProperties`, `items`, `anyOf`.
//! Anything failing validation is rejected before side effects.

use serde_json::Value;

#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub errors: Vec<String>,
}

impl ValidationResult {
    pub fn ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Validate `payload` against `schema`, plus the two extra predicates:
/// every field in `required_non_empty` must be a non-empty string, and
/// at least one field from `required_any_of` (when non-empty) must be a
/// non-empty string.
pub fn validate_payload(
    schema: &Value,
    payload: &Value,
    required_non_empty: &[&str],
    required_any_of: &[&str],
) -> ValidationResult {
    let mut errors = Vec::new();
    walk(schema, payload, "$", &mut errors);

    for field in required_non_empty {
        if !is_non_empty_string(payload.get(*field)) {
            errors.push(format!("$.{field}: must be a non-empty string"));
        }
    }
    if !required_any_of.is_empty()
        && !required_any_of
            .iter()
            .any(|field| is_non_empty_string(payload.get(*field)))
    {
        errors.push(format!(
            "$: at least one of [{}] must be a non-empty string",
            required_any_of.join(", ")
        ));
    }

    ValidationResult { errors }
}

fn is_non_empty_string(value: Option<&Value>) -> bool {
    value
        .and_then(|v| v.as_str())
        .is_some_and(|s| !s.trim().is_empty())
}

fn walk(schema: &Value, value: &Value, path: &str, errors: &mut Vec<String>) {
    // anyOf: at least one branch must fully pass
    if let Some(any_of) = schema.get("anyOf").and_then(|a| a.as_array()) {
        let passed = any_of.iter().any(|branch| {
            let mut branch_errors = Vec::new();
            walk(branch, value, path, &mut branch_errors);
            branch_errors.is_empty()
        });
        if !passed {
            errors.push(format!("{path}: no anyOf branch matched"));
        }
        return;
    }

    if let Some(expected) = schema.get("const") {
        if value != expected {
            errors.push(format!("{path}: must equal {expected}"));
        }
        return;
    }

    if let Some(allowed) = schema.get("enum").and_then(|e| e.as_array()) {
        if !allowed.contains(value) {
            errors.push(format!("{path}: not one of the allowed values"));
        }
        return;
    }

    match schema.get("type").and_then(|t| t.as_str()) {
        Some("object") => walk_object(schema, value, path, errors),
        Some("string") => walk_string(schema, value, path, errors),
        Some("boolean") => {
            if !value.is_boolean() {
                errors.push(format!("{path}: expected boolean"));
            }
        }
        Some("integer") => walk_integer(schema, value, path, errors),
        Some("array") => walk_array(schema, value, path, errors),
        Some(other) => errors.push(format!("{path}: unsupported schema type {other}")),
        None => {}
    }
}

fn walk_object(schema: &Value, value: &Value, path: &str, errors: &mut Vec<String>) {
    let Some(object) = value.as_object() else {
        errors.push(format!("{path}: expected object"));
        return;
    };

    let properties = schema.get("properties").and_then(|p| p.as_object());

    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for key in required.iter().filter_map(|k| k.as_str()) {
            if !object.contains_key(key) {
                errors.push(format!("{path}.{key}: required"));
            }
        }
    }

    if schema.get("additionalProperties").and_then(|a| a.as_bool()) == Some(false) {
        for key in object.keys() {
            if !properties.map_or(false, |p| p.contains_key(key)) {
                errors.push(format!("{path}.{key}: unknown property"));
            }
        }
    }

    if let Some(properties) = properties {
        for (key, prop_schema) in properties {
            if let Some(prop_value) = object.get(key) {
                walk(prop_schema, prop_value, &format!("{path}.{key}"), errors);
            }
        }
    }
}

fn walk_string(schema: &Value, value: &Value, path: &str, errors: &mut Vec<String>) {
    let Some(s) = value.as_str() else {
        errors.push(format!("{path}: expected string"));
        return;
    };
    let len = s.chars().count() as u64;
    if let Some(min) = schema.get("minLength").and_then(|m| m.as_u64()) {
        if len < min {
            errors.push(format!("{path}: shorter than minLength {min}"));
        }
    }
    if let Some(max) = schema.get("maxLength").and_then(|m| m.as_u64()) {
        if len > max {
            errors.push(format!("{path}: longer than maxLength {max}"));
        }
    }
}

fn walk_integer(schema: &Value, value: &Value, path: &str, errors: &mut Vec<String>) {
    let Some(n) = value.as_i64() else {
        errors.push(format!("{path}: expected integer"));
        return;
    };
    if let Some(min) = schema.get("minimum").and_then(|m| m.as_i64()) {
        if n < min {
            errors.push(format!("{path}: below minimum {min}"));
        }
    }
    if let Some(max) = schema.get("maximum").and_then(|m| m.as_i64()) {
        if n > max {
            errors.push(format!("{path}: above maximum {max}"));
        }
    }
}

fn walk_array(schema: &Value, value: &Value, path: &str, errors: &mut Vec<String>) {
    let Some(items) = value.as_array() else {
        errors.push(format!("{path}: expected array"));
        return;
    };
    if let Some(min) = schema.get("minItems").and_then(|m| m.as_u64()) {
        if (items.len() as u64) < min {
            errors.push(format!("{path}: fewer than minItems {min}"));
        }
    }
    if let Some(max) = schema.get("maxItems").and_then(|m| m.as_u64()) {
        if (items.len() as u64) > max {
            errors.push(format!("{path}: more than maxItems {max}"));
        }
    }
    if let Some(item_schema) = schema.get("items") {
        for (idx, item) in items.iter().enumerate() {
            walk(item_schema, item, &format!("{path}[{idx}]"), errors);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope() -> Value {
        json!({
            "type": "object",
            "additionalProperties": false,
            "properties": {
                "target": { "type": "string", "minLength": 1 },
                "task": { "type": "string", "maxLength": 100 },
                "interrupt": { "type": "boolean" },
                "priority": { "enum": ["low", "normal", "high"] },
                "retries": { "type": "integer", "minimum": 0, "maximum": 5 },
                "tags": { "type": "array", "items": { "type": "string" }, "maxItems": 3 },
            },
            "required": ["target"],
        })
    }

    #[test]
    fn accepts_valid_payload() {
        let result = validate_payload(
            &envelope(),
            &json!({"target": "all", "task": "go", "interrupt": false, "priority": "high"}),
            &[],
            &[],
        );
        assert!(result.ok(), "{:?}", result.errors);
    }

    #[test]
    fn rejects_unknown_property() {
        let result = validate_payload(&envelope(), &json!({"target": "all", "nope": 1}), &[], &[]);
        assert!(result.errors.iter().any(|e| e.contains("unknown property")));
    }

    #[test]
    fn rejects_missing_required_and_bad_types() {
        let result = validate_payload(
            &envelope(),
            &json!({"task": 7, "interrupt": "yes", "retries": 9}),
            &[],
            &[],
        );
        assert!(result.errors.iter().any(|e| e.contains("$.target: required")));
        assert!(result.errors.iter().any(|e| e.contains("$.task: expected string")));
        assert!(result.errors.iter().any(|e| e.contains("$.interrupt: expected boolean")));
        assert!(result.errors.iter().any(|e| e.contains("above maximum")));
    }

    #[test]
    fn enforces_enum_and_lengths() {
        let result = validate_payload(
            &envelope(),
            &json!({"target": "", "priority": "urgent"}),
            &[],
            &[],
        );
        assert!(result.errors.iter().any(|e| e.contains("minLength")));
        assert!(result.errors.iter().any(|e| e.contains("allowed values")));
    }

    #[test]
    fn required_non_empty_predicate() {
        let result = validate_payload(
            &envelope(),
            &json!({"target": "all", "task": ""}),
            &["task"],
            &[],
        );
        assert!(result
            .errors
            .iter()
            .any(|e| e.contains("$.task: must be a non-empty string")));
    }

    #[test]
    fn required_any_of_predicate() {
        let schema = json!({ "type": "object" });
        let result = validate_payload(&schema, &json!({}), &[], &["task", "text"]);
        assert!(!result.ok());

        let result = validate_payload(&schema, &json!({"text": "x"}), &[], &["task", "text"]);
        assert!(result.ok());
    }

    #[test]
    fn any_of_branches() {
        let schema = json!({
            "anyOf": [
                { "type": "string" },
                { "type": "integer", "minimum": 10 },
            ]
        });
        assert!(validate_payload(&schema, &json!("hello"), &[], &[]).ok());
        assert!(validate_payload(&schema, &json!(12), &[], &[]).ok());
        assert!(!validate_payload(&schema, &json!(3), &[], &[]).ok());
        assert!(!validate_payload(&schema, &json!(true), &[], &[]).ok());
    }

    #[test]
    fn const_and_arrays() {
        let schema = json!({"const": "fixed"});
        assert!(validate_payload(&schema, &json!("fixed"), &[], &[]).ok());
        assert!(!validate_payload(&schema, &json!("other"), &[], &[]).ok());

        let result = validate_payload(
            &envelope(),
            &json!({"target": "all", "tags": ["a", "b", "c", "d"]}),
            &[],
            &[],
        );
        assert!(result.errors.iter().any(|e| e.contains("maxItems")));
    }
}
