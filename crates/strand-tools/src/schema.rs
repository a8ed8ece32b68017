//! Argument validation against a tool's declared JSON schema.

use jsonschema::JSONSchema;
use serde_json::Value;

/// Check `arguments` against `schema`.
///
/// A null or empty-object schema accepts anything. The error string lists
/// every violation, separated by `; `.
pub fn validate_arguments(schema: &Value, arguments: &Value) -> Result<(), String> {
    if is_unconstrained(schema) {
        return Ok(());
    }

    let compiled =
        JSONSchema::compile(schema).map_err(|e| format!("tool schema is invalid: {}", e))?;

    let violations: Vec<String> = match compiled.validate(arguments) {
        Ok(()) => return Ok(()),
        Err(errors) => errors
            .map(|e| {
                let path = e.instance_path.to_string();
                if path.is_empty() {
                    e.to_string()
                } else {
                    format!("{}: {}", path, e)
                }
            })
            .collect(),
    };

    Err(violations.join("; "))
}

fn is_unconstrained(schema: &Value) -> bool {
    match schema {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn expression_schema() -> Value {
        json!({
            "type": "object",
            "properties": { "expression": { "type": "string" } },
            "required": ["expression"]
        })
    }

    #[test]
    fn test_valid_arguments() {
        assert!(validate_arguments(&expression_schema(), &json!({"expression": "2+2"})).is_ok());
    }

    #[test]
    fn test_missing_required_field() {
        let err = validate_arguments(&expression_schema(), &json!({})).unwrap_err();
        assert!(err.contains("expression"));
    }

    #[test]
    fn test_wrong_type_reports_path() {
        let err = validate_arguments(&expression_schema(), &json!({"expression": 4})).unwrap_err();
        assert!(err.contains("/expression"));
    }

    #[test]
    fn test_unconstrained_schema_accepts_anything() {
        assert!(validate_arguments(&Value::Null, &json!([1, 2])).is_ok());
        assert!(validate_arguments(&json!({}), &json!("x")).is_ok());
    }
}
