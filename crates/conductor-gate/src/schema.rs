//! A small JSON Schema subset: `type`, `required`, `properties`, `items`,
//! `enum`, `minimum`, `maximum`, `minLength`, `maxLength`, `minItems`.
//! Unsupported keywords are ignored.

use serde_json::Value;

/// Validate `value` against `schema`, returning every issue found.
pub fn validate(schema: &Value, value: &Value) -> Vec<String> {
    let mut issues = Vec::new();
    check(schema, value, "$", &mut issues);
    issues
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn matches_type(expected: &str, value: &Value) -> bool {
    let actual = type_name(value);
    actual == expected || (expected == "number" && actual == "integer")
}

fn check(schema: &Value, value: &Value, path: &str, issues: &mut Vec<String>) {
    let Some(schema) = schema.as_object() else {
        return;
    };

    if let Some(expected) = schema.get("type") {
        let ok = match expected {
            Value::String(t) => matches_type(t, value),
            Value::Array(types) => types
                .iter()
                .filter_map(|t| t.as_str())
                .any(|t| matches_type(t, value)),
            _ => true,
        };
        if !ok {
            issues.push(format!(
                "{}: expected type {}, found {}",
                path,
                expected,
                type_name(value)
            ));
            // Remaining keywords assume the declared type.
            return;
        }
    }

    if let Some(Value::Array(allowed)) = schema.get("enum") {
        if !allowed.contains(value) {
            issues.push(format!(
                "{}: value {} is not one of {}",
                path,
                value,
                Value::Array(allowed.clone())
            ));
        }
    }

    if let Some(n) = value.as_f64() {
        if let Some(min) = schema.get("minimum").and_then(|m| m.as_f64()) {
            if n < min {
                issues.push(format!("{}: {} is below minimum {}", path, n, min));
            }
        }
        if let Some(max) = schema.get("maximum").and_then(|m| m.as_f64()) {
            if n > max {
                issues.push(format!("{}: {} is above maximum {}", path, n, max));
            }
        }
    }

    if let Some(s) = value.as_str() {
        let len = s.chars().count() as u64;
        if let Some(min) = schema.get("minLength").and_then(|m| m.as_u64()) {
            if len < min {
                issues.push(format!("{}: length {} is below minLength {}", path, len, min));
            }
        }
        if let Some(max) = schema.get("maxLength").and_then(|m| m.as_u64()) {
            if len > max {
                issues.push(format!("{}: length {} is above maxLength {}", path, len, max));
            }
        }
    }

    if let Some(obj) = value.as_object() {
        if let Some(Value::Array(required)) = schema.get("required") {
            for key in required.iter().filter_map(|k| k.as_str()) {
                if !obj.contains_key(key) {
                    issues.push(format!("{}: missing required property '{}'", path, key));
                }
            }
        }
        if let Some(Value::Object(properties)) = schema.get("properties") {
            for (key, sub_schema) in properties {
                if let Some(sub_value) = obj.get(key) {
                    check(sub_schema, sub_value, &format!("{}.{}", path, key), issues);
                }
            }
        }
    }

    if let Some(items) = value.as_array() {
        if let Some(min) = schema.get("minItems").and_then(|m| m.as_u64()) {
            if (items.len() as u64) < min {
                issues.push(format!(
                    "{}: {} items is below minItems {}",
                    path,
                    items.len(),
                    min
                ));
            }
        }
        if let Some(item_schema) = schema.get("items") {
            for (i, item) in items.iter().enumerate() {
                check(item_schema, item, &format!("{}[{}]", path, i), issues);
            }
        }
    }
}
