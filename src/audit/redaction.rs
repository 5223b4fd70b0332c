//! Payload redaction and change detection.
//!
//! Both operations are shallow: only the top-level keys of a snapshot are
//! scanned. Nested objects are passed through (redaction) or compared as a
//! whole value (diffing).

use serde_json::Value;

/// Replacement written over sensitive values before persistence.
pub const REDACTED_MARKER: &str = "[REDACTED]";

/// Return a copy of `payload` with every top-level key named in
/// `sensitive_fields` (case-sensitive) replaced by [`REDACTED_MARKER`].
///
/// Non-object payloads and `None` pass through unchanged.
pub fn redact(payload: Option<&Value>, sensitive_fields: &[String]) -> Option<Value> {
    let payload = payload?;
    let Value::Object(map) = payload else {
        return Some(payload.clone());
    };

    let mut sanitized = map.clone();
    for field in sensitive_fields {
        if let Some(value) = sanitized.get_mut(field.as_str()) {
            *value = Value::String(REDACTED_MARKER.to_string());
        }
    }
    Some(Value::Object(sanitized))
}

/// Names of the top-level keys in `new` whose value differs from `old`,
/// in `new`'s key order. Keys absent from `old` count as changed.
///
/// Empty when either snapshot is missing or not an object: a diff needs
/// both sides.
pub fn diff_fields(old: Option<&Value>, new: Option<&Value>) -> Vec<String> {
    let (Some(Value::Object(old)), Some(Value::Object(new))) = (old, new) else {
        return Vec::new();
    };

    new.iter()
        .filter(|(key, value)| old.get(key.as_str()) != Some(*value))
        .map(|(key, _)| key.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_redact_replaces_sensitive_values() {
        let payload = json!({"nombre": "Test DJ", "password": "hunter2"});
        let redacted = redact(Some(&payload), &fields(&["password"])).unwrap();
        assert_eq!(redacted["password"], REDACTED_MARKER);
        assert_eq!(redacted["nombre"], "Test DJ");
    }

    #[test]
    fn test_redact_leaves_other_keys_untouched() {
        let payload = json!({
            "email": "dj@club.es",
            "cache_total": 12000,
            "extras": {"token": "nested-secret"},
        });
        let redacted = redact(Some(&payload), &fields(&["token"])).unwrap();
        // Shallow scan only: nested keys are not touched.
        assert_eq!(redacted["extras"]["token"], "nested-secret");
        assert_eq!(redacted["email"], "dj@club.es");
        assert_eq!(redacted["cache_total"], 12000);
    }

    #[test]
    fn test_redact_is_case_sensitive() {
        let payload = json!({"apiKey": "k", "apikey": "k2"});
        let redacted = redact(Some(&payload), &fields(&["apiKey"])).unwrap();
        assert_eq!(redacted["apiKey"], REDACTED_MARKER);
        assert_eq!(redacted["apikey"], "k2");
    }

    #[test]
    fn test_redact_none_passes_through() {
        assert_eq!(redact(None, &fields(&["password"])), None);
    }

    #[test]
    fn test_redact_non_object_passes_through() {
        let payload = json!("just a string");
        assert_eq!(redact(Some(&payload), &fields(&["password"])), Some(payload));
    }

    #[test]
    fn test_redact_does_not_mutate_input() {
        let payload = json!({"secret": "value"});
        let _ = redact(Some(&payload), &fields(&["secret"]));
        assert_eq!(payload["secret"], "value");
    }

    #[test]
    fn test_diff_detects_changed_value() {
        let old = json!({"cache_total": 10000});
        let new = json!({"cache_total": 12000});
        assert_eq!(diff_fields(Some(&old), Some(&new)), vec!["cache_total"]);
    }

    #[test]
    fn test_diff_skips_equal_values() {
        let old = json!({"nombre": "Sala Norte", "aforo": 350});
        let new = json!({"nombre": "Sala Norte", "aforo": 400});
        assert_eq!(diff_fields(Some(&old), Some(&new)), vec!["aforo"]);
    }

    #[test]
    fn test_diff_counts_new_keys_as_changed() {
        let old = json!({"nombre": "Sala Norte"});
        let new = json!({"nombre": "Sala Norte", "ciudad": "Madrid"});
        assert_eq!(diff_fields(Some(&old), Some(&new)), vec!["ciudad"]);
    }

    #[test]
    fn test_diff_ignores_keys_removed_from_new() {
        let old = json!({"nombre": "Sala Norte", "ciudad": "Madrid"});
        let new = json!({"nombre": "Sala Norte"});
        assert!(diff_fields(Some(&old), Some(&new)).is_empty());
    }

    #[test]
    fn test_diff_is_shallow_over_nested_objects() {
        let old = json!({"horario": {"apertura": "22:00"}});
        let new = json!({"horario": {"apertura": "23:00"}});
        // The nested object changed as a whole; only the top-level key is
        // reported.
        assert_eq!(diff_fields(Some(&old), Some(&new)), vec!["horario"]);
    }

    #[test]
    fn test_diff_empty_without_both_sides() {
        let snapshot = json!({"nombre": "Sala Norte"});
        assert!(diff_fields(None, Some(&snapshot)).is_empty());
        assert!(diff_fields(Some(&snapshot), None).is_empty());
        assert!(diff_fields(None, None).is_empty());
    }

    #[test]
    fn test_diff_result_is_subset_of_new_keys() {
        let old = json!({"a": 1, "b": 2, "c": 3});
        let new = json!({"b": 5, "d": 7});
        let changed = diff_fields(Some(&old), Some(&new));
        let new_keys: Vec<_> = new.as_object().unwrap().keys().cloned().collect();
        assert!(changed.iter().all(|k| new_keys.contains(k)));
    }
}
