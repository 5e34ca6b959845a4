//! Schema-lite validation of tool arguments and lenient parsing of
//! streamed argument buffers.
//!
//! Providers deliver tool arguments as partial JSON fragments; the
//! adapters buffer them and parse here, falling back to an empty object
//! rather than ever propagating null or a raw partial string.

use serde_json::Value;

use crate::error::{Error, Result};

/// Validate tool-call arguments against an object-typed JSON Schema.
///
/// Rules:
/// - the schema root must declare `type: object`, else `Unsupported`
/// - the arguments must be a JSON object
/// - every key under `required` must be present
/// - each present property whose schema declares a `type` in
///   {string, number, boolean, object, array} must match that kind;
///   any other declared type fails with `Unsupported`
/// - unknown argument keys are allowed
pub fn validate_tool_args(schema: &Value, args: &Value) -> Result<()> {
    let root_type = schema.get("type").and_then(Value::as_str);
    if root_type != Some("object") {
        return Err(Error::Unsupported(
            "tool parameter schemas must be object-typed".into(),
        ));
    }

    let obj = args.as_object().ok_or_else(|| {
        Error::Decoding("tool arguments must be a JSON object".into())
    })?;

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for key in required.iter().filter_map(Value::as_str) {
            if !obj.contains_key(key) {
                return Err(Error::Decoding(format!(
                    "missing required argument '{key}'"
                )));
            }
        }
    }

    if let Some(props) = schema.get("properties").and_then(Value::as_object) {
        for (key, prop_schema) in props {
            let Some(arg) = obj.get(key) else { continue };
            let Some(expected) = prop_schema.get("type").and_then(Value::as_str) else {
                continue;
            };
            let matches = match expected {
                "string" => arg.is_string(),
                "number" => arg.is_number(),
                "boolean" => arg.is_boolean(),
                "object" => arg.is_object(),
                "array" => arg.is_array(),
                other => {
                    return Err(Error::Unsupported(format!(
                        "unsupported schema type '{other}' for property '{key}'"
                    )))
                }
            };
            if !matches {
                return Err(Error::Decoding(format!(
                    "argument '{key}' does not match schema type '{expected}'"
                )));
            }
        }
    }

    Ok(())
}

/// Parse a possibly-incomplete JSON string without erroring.
///
/// `None` means "use a fallback" -- the buffer was empty or not (yet)
/// valid JSON.
pub fn lenient_parse(s: &str) -> Option<Value> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

/// The canonical tool-argument fallback: lenient-parse the buffer, and
/// default to `{}` when it is empty, malformed, or JSON null.
pub fn arguments_or_empty(buffer: &str) -> Value {
    match lenient_parse(buffer) {
        Some(Value::Null) | None => Value::Object(serde_json::Map::new()),
        Some(value) => value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "text": { "type": "string" },
                "count": { "type": "number" },
                "flags": { "type": "array" },
            },
            "required": ["text"],
        })
    }

    #[test]
    fn accepts_matching_arguments() {
        let args = json!({"text": "hi", "count": 3});
        assert!(validate_tool_args(&echo_schema(), &args).is_ok());
    }

    #[test]
    fn unknown_keys_are_allowed() {
        let args = json!({"text": "hi", "extra": {"nested": true}});
        assert!(validate_tool_args(&echo_schema(), &args).is_ok());
    }

    #[test]
    fn missing_required_key_fails() {
        let args = json!({"count": 3});
        let err = validate_tool_args(&echo_schema(), &args).unwrap_err();
        assert!(matches!(err, Error::Decoding(_)));
        assert!(err.to_string().contains("text"));
    }

    #[test]
    fn kind_mismatch_fails() {
        let args = json!({"text": 42});
        let err = validate_tool_args(&echo_schema(), &args).unwrap_err();
        assert!(matches!(err, Error::Decoding(_)));
    }

    #[test]
    fn non_object_arguments_fail() {
        let err = validate_tool_args(&echo_schema(), &json!([1, 2])).unwrap_err();
        assert!(matches!(err, Error::Decoding(_)));
    }

    #[test]
    fn non_object_root_schema_unsupported() {
        let schema = json!({"type": "string"});
        let err = validate_tool_args(&schema, &json!({})).unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
    }

    #[test]
    fn unknown_schema_type_unsupported() {
        let schema = json!({
            "type": "object",
            "properties": { "when": { "type": "date-time" } },
        });
        let err = validate_tool_args(&schema, &json!({"when": "now"})).unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
    }

    #[test]
    fn property_without_declared_type_is_skipped() {
        let schema = json!({
            "type": "object",
            "properties": { "anything": { "description": "untyped" } },
        });
        assert!(validate_tool_args(&schema, &json!({"anything": [1]})).is_ok());
    }

    #[test]
    fn lenient_parse_complete_json() {
        assert_eq!(lenient_parse(r#"{"a":1}"#), Some(json!({"a": 1})));
    }

    #[test]
    fn lenient_parse_partial_returns_none() {
        assert_eq!(lenient_parse(r#"{"te"#), None);
        assert_eq!(lenient_parse(""), None);
        assert_eq!(lenient_parse("   "), None);
    }

    #[test]
    fn arguments_fallback_is_empty_object() {
        assert_eq!(arguments_or_empty(r#"{"x":"y"}"#), json!({"x": "y"}));
        assert_eq!(arguments_or_empty(r#"{"x":"#), json!({}));
        assert_eq!(arguments_or_empty(""), json!({}));
    }

    #[test]
    fn arguments_fallback_never_propagates_null() {
        assert_eq!(arguments_or_empty("null"), json!({}));
    }
}
