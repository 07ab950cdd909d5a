//! Thin wrapper around `jsonpath-rust` implementing the bridge's specific
//! projection rules: `$` (or any expression yielding zero matches) means
//! "the whole payload", and a single match unwraps to that value directly.

use jsonpath_rust::JsonPathQuery;
use serde_json::Value;

pub fn parses(expr: &str) -> bool {
    serde_json::json!({}).path(expr).is_ok()
}

/// Evaluate `expr` against `value`. Returns `None` (whole-payload fallback)
/// when the expression is `$`, fails to parse, or matches nothing.
pub fn project(expr: &str, value: &Value) -> Option<Value> {
    if expr == "$" {
        return None;
    }
    match value.clone().path(expr) {
        Ok(Value::Array(matches)) if matches.is_empty() => None,
        Ok(Value::Array(mut matches)) if matches.len() == 1 => Some(matches.remove(0)),
        Ok(other) => Some(other),
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn root_path_is_whole_payload() {
        assert_eq!(project("$", &json!({"a": 1})), None);
    }

    #[test]
    fn zero_matches_falls_back_to_whole_payload() {
        assert_eq!(project("$.missing", &json!({"a": 1})), None);
    }

    #[test]
    fn single_match_unwraps() {
        assert_eq!(project("$.data.text", &json!({"data": {"text": "hi"}})), Some(json!("hi")));
    }
}
