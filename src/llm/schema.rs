//! Structured-output helpers for LLM calls.
//!
//! Dynamic JSON from the model is parsed into typed values at this
//! boundary. Validation failures are retried with the parse error appended
//! to the conversation, up to a bounded number of attempts.

use super::{extract_json_from_response, ChatMessage, CompletionRequest, LlmClient};
use crate::{Error, Result};
use serde::de::DeserializeOwned;

/// How many times a structured call re-prompts after invalid JSON.
pub const MAX_VALIDATION_RETRIES: u32 = 2;

/// Runs a completion whose answer must parse as `T`.
///
/// The request should already instruct the model to answer with JSON
/// matching `T`'s shape. On a parse failure the error is fed back as a
/// user message and the call is retried, up to
/// [`MAX_VALIDATION_RETRIES`] times.
///
/// # Errors
///
/// - [`Error::ValidationFailed`] when every attempt produced unparsable
///   output; the last raw response is included in the cause
/// - Any error from the underlying client, unchanged
pub fn complete_structured<T: DeserializeOwned>(
    client: &dyn LlmClient,
    request: &CompletionRequest,
) -> Result<T> {
    let mut request = request.clone();
    let mut last_error = String::new();

    for attempt in 0..=MAX_VALIDATION_RETRIES {
        let response = client.complete(&request)?;
        let json = extract_json_from_response(&response);
        match serde_json::from_str::<T>(json) {
            Ok(value) => return Ok(value),
            Err(e) => {
                tracing::debug!(
                    scope = request.scope,
                    attempt,
                    "structured response failed to parse: {e}"
                );
                last_error = format!("{e}");
                request.messages.push(ChatMessage::assistant(response));
                request.messages.push(ChatMessage::user(format!(
                    "The previous answer was not valid JSON for the required schema \
                     ({last_error}). Answer again with only the corrected JSON."
                )));
            },
        }
    }

    Err(Error::ValidationFailed {
        operation: request.scope.to_string(),
        cause: last_error,
    })
}

/// Validates a JSON value against a JSON-Schema subset.
///
/// Supports the keywords the reflect surface actually uses: `type`
/// (including type arrays), `properties`, `required`, `items`, and `enum`.
/// Unknown keywords are ignored, matching permissive validator behavior.
///
/// # Errors
///
/// Returns [`Error::ValidationFailed`] naming the offending path.
pub fn validate_against_schema(value: &serde_json::Value, schema: &serde_json::Value) -> Result<()> {
    validate_at(value, schema, "$")
}

fn validate_at(value: &serde_json::Value, schema: &serde_json::Value, path: &str) -> Result<()> {
    let Some(schema_obj) = schema.as_object() else {
        return Ok(());
    };

    if let Some(expected) = schema_obj.get("type") {
        let matches = match expected {
            serde_json::Value::String(t) => type_matches(value, t),
            serde_json::Value::Array(types) => types
                .iter()
                .filter_map(|t| t.as_str())
                .any(|t| type_matches(value, t)),
            _ => true,
        };
        if !matches {
            return Err(Error::ValidationFailed {
                operation: "schema".to_string(),
                cause: format!("{path}: expected type {expected}, got {value}"),
            });
        }
    }

    if let Some(allowed) = schema_obj.get("enum").and_then(|e| e.as_array()) {
        if !allowed.contains(value) {
            return Err(Error::ValidationFailed {
                operation: "schema".to_string(),
                cause: format!("{path}: value not in enum"),
            });
        }
    }

    if let Some(object) = value.as_object() {
        if let Some(required) = schema_obj.get("required").and_then(|r| r.as_array()) {
            for key in required.iter().filter_map(|k| k.as_str()) {
                if !object.contains_key(key) {
                    return Err(Error::ValidationFailed {
                        operation: "schema".to_string(),
                        cause: format!("{path}: missing required property '{key}'"),
                    });
                }
            }
        }
        if let Some(properties) = schema_obj.get("properties").and_then(|p| p.as_object()) {
            for (key, subschema) in properties {
                if let Some(subvalue) = object.get(key) {
                    validate_at(subvalue, subschema, &format!("{path}.{key}"))?;
                }
            }
        }
    }

    if let Some(array) = value.as_array() {
        if let Some(items) = schema_obj.get("items") {
            for (index, item) in array.iter().enumerate() {
                validate_at(item, items, &format!("{path}[{index}]"))?;
            }
        }
    }

    Ok(())
}

fn type_matches(value: &serde_json::Value, type_name: &str) -> bool {
    match type_name {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        _ => true,
    }
}
