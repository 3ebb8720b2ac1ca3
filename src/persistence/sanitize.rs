// src/persistence/sanitize.rs
//! Content sanitization for persisted records
//!
//! Bounds record size: long strings are truncated and nested containers
//! are replaced by a placeholder. A top-level object keeps its keys.

use serde_json::Value;

/// Longest string kept, in characters
pub const MAX_CONTENT_LENGTH: usize = 500;

pub const ARRAY_PLACEHOLDER: &str = "[...]";
pub const OBJECT_PLACEHOLDER: &str = "{...}";

pub fn truncate_and_replace(content: &Value) -> Value {
    match content {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, value)| (key.clone(), replace_value(value)))
                .collect(),
        ),
        other => replace_value(other),
    }
}

fn replace_value(value: &Value) -> Value {
    match value {
        Value::String(s) if s.chars().count() > MAX_CONTENT_LENGTH => {
            Value::String(s.chars().take(MAX_CONTENT_LENGTH).collect())
        }
        Value::Array(items) if !items.is_empty() => Value::String(ARRAY_PLACEHOLDER.to_string()),
        Value::Object(map) if !map.is_empty() => Value::String(OBJECT_PLACEHOLDER.to_string()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_object_values_are_sanitized() {
        let long = "a".repeat(600);
        let content = json!({
            "short": "hi",
            "long": long,
            "list": [1, 2],
            "nested": {"k": "v"},
            "empty_list": [],
            "number": 1.5,
            "flag": true,
            "nothing": null,
        });

        let sanitized = truncate_and_replace(&content);
        assert_eq!(sanitized["short"], json!("hi"));
        assert_eq!(sanitized["long"], json!("a".repeat(500)));
        assert_eq!(sanitized["list"], json!("[...]"));
        assert_eq!(sanitized["nested"], json!("{...}"));
        assert_eq!(sanitized["empty_list"], json!([]));
        assert_eq!(sanitized["number"], json!(1.5));
        assert_eq!(sanitized["flag"], json!(true));
        assert_eq!(sanitized["nothing"], Value::Null);
    }

    #[test]
    fn test_top_level_values() {
        assert_eq!(truncate_and_replace(&json!("a".repeat(600))), json!("a".repeat(500)));
        assert_eq!(truncate_and_replace(&json!([1])), json!("[...]"));
        assert_eq!(truncate_and_replace(&json!({})), json!({}));
        assert_eq!(truncate_and_replace(&json!(7)), json!(7));
        assert_eq!(truncate_and_replace(&Value::Null), Value::Null);
    }

    #[test]
    fn test_truncation_counts_characters() {
        let wide = "é".repeat(501);
        let sanitized = truncate_and_replace(&json!(wide));
        assert_eq!(sanitized.as_str().unwrap().chars().count(), 500);
    }

    proptest! {
        #[test]
        fn prop_strings_never_exceed_limit(s in "\\PC{0,800}") {
            let sanitized = truncate_and_replace(&json!({ "value": s.clone() }));
            let out = sanitized["value"].as_str().unwrap();
            prop_assert!(out.chars().count() <= MAX_CONTENT_LENGTH);
            prop_assert!(s.starts_with(out));
        }

        #[test]
        fn prop_object_keys_survive(keys in proptest::collection::btree_set("[a-z]{1,8}", 0..10)) {
            let content: serde_json::Map<String, Value> = keys
                .iter()
                .map(|k| (k.clone(), json!({ "inner": [k] })))
                .collect();
            let sanitized = truncate_and_replace(&Value::Object(content));
            let object = sanitized.as_object().unwrap();
            prop_assert_eq!(object.len(), keys.len());
            prop_assert!(object.values().all(|v| v == &json!(OBJECT_PLACEHOLDER)));
        }
    }
}
