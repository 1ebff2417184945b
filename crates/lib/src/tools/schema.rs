//! Parse-or-reject validation of model-supplied tool arguments.
//!
//! Covers the JSON-schema subset tools declare: `type`, `properties`, `required`, `enum`,
//! `minimum`/`maximum`, and array `items` types.

use serde_json::{Map, Value};

use super::ToolError;

/// Validate `raw` against `schema` and return the argument object.
///
/// `raw` may be an object, a JSON-encoded object string, or null/empty (no arguments).
pub fn validate_arguments(schema: &Value, raw: &Value) -> Result<Map<String, Value>, ToolError> {
    let args = match raw {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        Value::String(s) if s.trim().is_empty() => Map::new(),
        Value::String(s) => match serde_json::from_str::<Value>(s) {
            Ok(Value::Object(map)) => map,
            Ok(_) => return Err(invalid("arguments must be a JSON object")),
            Err(e) => return Err(invalid(format!("arguments are not valid JSON: {}", e))),
        },
        _ => return Err(invalid("arguments must be a JSON object")),
    };

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for key in required.iter().filter_map(Value::as_str) {
            match args.get(key) {
                None | Some(Value::Null) => {
                    return Err(invalid(format!("missing required parameter '{}'", key)))
                }
                Some(_) => {}
            }
        }
    }

    if let Some(props) = schema.get("properties").and_then(Value::as_object) {
        for (key, value) in &args {
            if value.is_null() {
                continue;
            }
            if let Some(prop) = props.get(key) {
                check_value(key, prop, value)?;
            }
        }
    }

    Ok(args)
}

fn invalid(msg: impl Into<String>) -> ToolError {
    ToolError::ArgumentInvalid(msg.into())
}

fn check_value(key: &str, prop: &Value, value: &Value) -> Result<(), ToolError> {
    if let Some(ty) = prop.get("type").and_then(Value::as_str) {
        if !type_matches(ty, value) {
            return Err(invalid(format!(
                "parameter '{}' should be {}, got {}",
                key,
                ty,
                type_name(value)
            )));
        }
    }
    if let Some(options) = prop.get("enum").and_then(Value::as_array) {
        if !options.contains(value) {
            let allowed: Vec<String> = options.iter().map(|o| o.to_string()).collect();
            return Err(invalid(format!(
                "parameter '{}' must be one of {}",
                key,
                allowed.join(", ")
            )));
        }
    }
    if let Some(n) = value.as_f64() {
        if let Some(min) = prop.get("minimum").and_then(Value::as_f64) {
            if n < min {
                return Err(invalid(format!("parameter '{}' must be >= {}", key, min)));
            }
        }
        if let Some(max) = prop.get("maximum").and_then(Value::as_f64) {
            if n > max {
                return Err(invalid(format!("parameter '{}' must be <= {}", key, max)));
            }
        }
    }
    if let (Some(items), Some(arr)) = (prop.get("items"), value.as_array()) {
        for (i, item) in arr.iter().enumerate() {
            check_value(&format!("{}[{}]", key, i), items, item)?;
        }
    }
    Ok(())
}

fn type_matches(ty: &str, value: &Value) -> bool {
    match ty {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64() || value.as_f64().is_some_and(|f| f.fract() == 0.0),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
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
            "properties": {
                "action": {"type": "string", "enum": ["add", "list", "remove"]},
                "every_seconds": {"type": "integer", "minimum": 1},
                "deliver": {"type": "boolean"},
                "tags": {"type": "array", "items": {"type": "string"}}
            },
            "required": ["action"]
        })
    }

    #[test]
    fn accepts_object_and_encoded_string() {
        let a = validate_arguments(&schema(), &json!({"action": "list"})).unwrap();
        assert_eq!(a["action"], "list");
        let b = validate_arguments(&schema(), &json!("{\"action\":\"add\",\"every_seconds\":5}")).unwrap();
        assert_eq!(b["every_seconds"], 5);
    }

    #[test]
    fn null_arguments_fail_required_check() {
        let err = validate_arguments(&schema(), &Value::Null).unwrap_err();
        assert_eq!(
            err,
            ToolError::ArgumentInvalid("missing required parameter 'action'".to_string())
        );
    }

    #[test]
    fn rejects_bad_types_and_values() {
        for bad in [
            json!({"action": 3}),
            json!({"action": "explode"}),
            json!({"action": "add", "every_seconds": 0}),
            json!({"action": "add", "every_seconds": "5"}),
            json!({"action": "add", "deliver": "yes"}),
            json!({"action": "add", "tags": ["a", 1]}),
            json!("not json"),
            json!("[1, 2]"),
            json!(42),
        ] {
            assert!(
                matches!(validate_arguments(&schema(), &bad), Err(ToolError::ArgumentInvalid(_))),
                "accepted {}",
                bad
            );
        }
    }

    #[test]
    fn unknown_and_null_properties_pass_through() {
        let a = validate_arguments(&schema(), &json!({"action": "list", "extra": 1, "deliver": null})).unwrap();
        assert_eq!(a["extra"], 1);
    }
}
