//! Minimal JSON-schema check for ai-step output.
//!
//! Supports the subset workflow authors actually use: `type`, `required`,
//! `properties`, `items` and `enum`. Unknown keywords are ignored.

use serde_json::Value;

use super::error::WorkflowError;

/// Validate `value` against `schema`, reporting the first violation.
pub fn validate_output(value: &Value, schema: &Value) -> Result<(), WorkflowError> {
    check(value, schema, "$").map_err(WorkflowError::SchemaValidation)
}

fn check(value: &Value, schema: &Value, at: &str) -> Result<(), String> {
    let Some(schema) = schema.as_object() else {
        return Ok(());
    };

    if let Some(expected) = schema.get("type") {
        let allowed: Vec<&str> = match expected {
            Value::String(t) => vec![t.as_str()],
            Value::Array(ts) => ts.iter().filter_map(Value::as_str).collect(),
            _ => Vec::new(),
        };
        if !allowed.is_empty() && !allowed.iter().any(|t| has_type(value, t)) {
            return Err(format!(
                "{at}: expected {}, got {}",
                allowed.join(" | "),
                type_name(value)
            ));
        }
    }

    if let Some(Value::Array(options)) = schema.get("enum") {
        if !options.contains(value) {
            return Err(format!("{at}: value {value} is not one of the allowed values"));
        }
    }

    if let Value::Object(map) = value {
        if let Some(Value::Array(required)) = schema.get("required") {
            for key in required.iter().filter_map(Value::as_str) {
                if !map.contains_key(key) {
                    return Err(format!("{at}: missing required property '{key}'"));
                }
            }
        }
        if let Some(Value::Object(properties)) = schema.get("properties") {
            for (key, sub) in properties {
                if let Some(child) = map.get(key) {
                    check(child, sub, &format!("{at}.{key}"))?;
                }
            }
        }
    }

    if let (Value::Array(items), Some(item_schema)) = (value, schema.get("items")) {
        for (i, item) in items.iter().enumerate() {
            check(item, item_schema, &format!("{at}[{i}]"))?;
        }
    }

    Ok(())
}

fn has_type(value: &Value, name: &str) -> bool {
    match name {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        "number" => value.is_number(),
        "integer" => value.as_i64().is_some() || value.as_u64().is_some(),
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

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> Value {
        json!({
            "type": "object",
            "required": ["verdict", "instances"],
            "properties": {
                "verdict": { "type": "string", "enum": ["stop", "keep"] },
                "instances": { "type": "array", "items": { "type": "string" } },
                "confidence": { "type": "number" }
            }
        })
    }

    #[test]
    fn accepts_conforming_output() {
        let out = json!({ "verdict": "stop", "instances": ["i-1"], "confidence": 0.9 });
        assert!(validate_output(&out, &schema()).is_ok());
    }

    #[test]
    fn rejects_missing_required() {
        let err = validate_output(&json!({ "verdict": "stop" }), &schema()).unwrap_err();
        assert!(err.to_string().contains("schema validation"));
        assert!(err.to_string().contains("instances"));
    }

    #[test]
    fn rejects_wrong_nested_type() {
        let out = json!({ "verdict": "keep", "instances": ["i-1", 7] });
        let err = validate_output(&out, &schema()).unwrap_err();
        assert!(err.to_string().contains("$.instances[1]"));
    }

    #[test]
    fn rejects_value_outside_enum() {
        let out = json!({ "verdict": "maybe", "instances": [] });
        assert!(validate_output(&out, &schema()).is_err());
    }

    #[test]
    fn integer_is_stricter_than_number() {
        let s = json!({ "type": "integer" });
        assert!(validate_output(&json!(3), &s).is_ok());
        assert!(validate_output(&json!(3.5), &s).is_err());
    }
}
