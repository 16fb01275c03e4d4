// Copyright (c) 2024-2026 runa contributors
//
// SPDX-License-Identifier: MIT
//! Minimal JSON-schema validation for tool inputs.
//!
//! Covers the subset tool schemas actually use: a top-level `object` type,
//! `required` keys, and primitive `type` tags on properties.  Anything the
//! subset does not understand is accepted — validation exists to catch the
//! model sending the wrong shape, not to be a full draft validator.

use serde_json::Value;

/// The `required` key names declared by a schema, used to build recovery
/// nudges for the model.
pub fn required_keys(schema: &Value) -> Vec<String> {
    schema
        .get("required")
        .and_then(|r| r.as_array())
        .map(|a| {
            a.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// Validate `input` against `schema`.  Returns a human-readable reason on
/// failure, suitable for surfacing to the model as an error tool result.
pub fn validate_input(schema: &Value, input: &Value) -> Result<(), String> {
    if schema.get("type").and_then(|t| t.as_str()) == Some("object") && !input.is_object() {
        return Err(format!(
            "input must be a JSON object, got {}",
            type_name(input)
        ));
    }

    let missing: Vec<String> = required_keys(schema)
        .into_iter()
        .filter(|key| input.get(key).map(Value::is_null).unwrap_or(true))
        .collect();
    if !missing.is_empty() {
        return Err(format!("missing required keys: {}", missing.join(", ")));
    }

    if let (Some(props), Some(obj)) = (
        schema.get("properties").and_then(|p| p.as_object()),
        input.as_object(),
    ) {
        for (key, prop_schema) in props {
            let Some(value) = obj.get(key) else { continue };
            let Some(expected) = prop_schema.get("type").and_then(|t| t.as_str()) else {
                continue;
            };
            if !matches_type(value, expected) {
                return Err(format!(
                    "key '{key}' must be of type {expected}, got {}",
                    type_name(value)
                ));
            }
        }
    }

    Ok(())
}

fn matches_type(value: &Value, expected: &str) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        // Unknown type tags are accepted.
        _ => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string" },
                "limit": { "type": "integer" }
            },
            "required": ["path"]
        })
    }

    #[test]
    fn valid_input_passes() {
        assert!(validate_input(&schema(), &json!({"path": "a.txt"})).is_ok());
    }

    #[test]
    fn missing_required_key_fails() {
        let err = validate_input(&schema(), &json!({})).unwrap_err();
        assert!(err.contains("path"), "{err}");
    }

    #[test]
    fn null_required_key_counts_as_missing() {
        assert!(validate_input(&schema(), &json!({"path": null})).is_err());
    }

    #[test]
    fn wrong_property_type_fails() {
        let err = validate_input(&schema(), &json!({"path": 42})).unwrap_err();
        assert!(err.contains("string"), "{err}");
    }

    #[test]
    fn non_object_input_fails_for_object_schema() {
        assert!(validate_input(&schema(), &json!("just a string")).is_err());
    }

    #[test]
    fn extra_keys_are_accepted() {
        assert!(validate_input(&schema(), &json!({"path": "a", "extra": true})).is_ok());
    }

    #[test]
    fn empty_schema_accepts_anything() {
        assert!(validate_input(&json!({}), &json!({"whatever": 1})).is_ok());
        assert!(validate_input(&json!({}), &json!(null)).is_ok());
    }

    #[test]
    fn required_keys_lists_declared_names() {
        assert_eq!(required_keys(&schema()), vec!["path"]);
    }
}
