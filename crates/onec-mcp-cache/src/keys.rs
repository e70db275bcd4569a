//! Cache key derivation and result classification

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Key prefix for tool dispatch results
pub const TOOL_KEY_PREFIX: &str = "tool";

/// Recursively sort object keys so equal arguments serialize identically
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut pairs: Vec<(&String, &Value)> = map.iter().collect();
            pairs.sort_by(|a, b| a.0.cmp(b.0));
            let mut out = Map::new();
            for (key, val) in pairs {
                out.insert(key.clone(), canonicalize(val));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        _ => value.clone(),
    }
}

/// SHA-256 hex digest of the canonical form of `value`
pub fn digest(value: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonicalize(value).to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Key for a call of `function` with positional and keyword arguments
pub fn call_key(function: &str, positional: &[Value], keyword: &Map<String, Value>) -> String {
    let material = serde_json::json!({
        "args": positional,
        "kwargs": keyword,
    });
    format!("{}:{}", function, digest(&material))
}

/// Key for a call whose arguments were serialized as one value.
///
/// Arrays are treated as positional arguments, objects as keyword
/// arguments and anything else as a single positional argument.
pub fn function_key(function: &str, args: &Value) -> String {
    match args {
        Value::Array(items) => call_key(function, items, &Map::new()),
        Value::Object(map) => call_key(function, &[], map),
        Value::Null => call_key(function, &[], &Map::new()),
        other => call_key(function, std::slice::from_ref(other), &Map::new()),
    }
}

/// Key for an MCP tool result
pub fn tool_key(tool_name: &str, arguments: &Value) -> String {
    format!("{}:{}:{}", TOOL_KEY_PREFIX, tool_name, digest(arguments))
}

/// Whether a payload represents a failed call.
///
/// Recognized markers: MCP `"isError": true`, `"success": false`,
/// `"status": "error"` and a non-null `"error"` member.
pub fn is_failure_result(value: &Value) -> bool {
    let Value::Object(map) = value else {
        return false;
    };

    map.get("isError").and_then(Value::as_bool) == Some(true)
        || map.get("success").and_then(Value::as_bool) == Some(false)
        || map.get("status").and_then(Value::as_str) == Some("error")
        || map.get("error").is_some_and(|error| !error.is_null())
}
