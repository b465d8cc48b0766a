use serde_json::Value;

/// Whether `live` already carries every field of `desired`.
///
/// Objects may have extra keys on the live side (defaults, status, fields
/// owned by other managers); arrays must match element by element. A `null`
/// on the desired side matches a missing field.
pub fn contains(live: &Value, desired: &Value) -> bool {
    match (live, desired) {
        (_, Value::Null) => true,
        (Value::Object(live), Value::Object(desired)) => desired.iter().all(|(key, value)| {
            match live.get(key) {
                Some(field) => contains(field, value),
                None => is_empty(value),
            }
        }),
        (Value::Array(live), Value::Array(desired)) => {
            live.len() == desired.len() && live.iter().zip(desired).all(|(l, d)| contains(l, d))
        }
        (Value::Number(l), Value::Number(d)) => l.as_f64() == d.as_f64(),
        (l, d) => l == d,
    }
}

/// The API server drops empty maps and lists, so they match a missing field.
fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.values().all(is_empty),
        Value::Array(list) => list.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extra_live_fields_are_ignored() {
        let live = json!({
            "metadata": {"name": "a", "resourceVersion": "42", "uid": "x"},
            "spec": {"replicas": 1, "strategy": {"type": "RollingUpdate"}},
            "status": {"availableReplicas": 1}
        });
        let desired = json!({"metadata": {"name": "a"}, "spec": {"replicas": 1}});
        assert!(contains(&live, &desired));
    }

    #[test]
    fn changed_or_missing_fields_are_detected() {
        let live = json!({"spec": {"replicas": 1}});
        assert!(!contains(&live, &json!({"spec": {"replicas": 2}})));
        assert!(!contains(&live, &json!({"spec": {"paused": true}})));
        assert!(contains(&live, &json!({"spec": {"selector": {}}})));
    }

    #[test]
    fn arrays_compare_positionally() {
        let live = json!({"ports": [{"port": 80, "protocol": "TCP"}, {"port": 443, "protocol": "TCP"}]});
        assert!(contains(&live, &json!({"ports": [{"port": 80}, {"port": 443}]})));
        assert!(!contains(&live, &json!({"ports": [{"port": 443}, {"port": 80}]})));
        assert!(!contains(&live, &json!({"ports": [{"port": 80}]})));
    }

    #[test]
    fn numbers_compare_by_value() {
        assert!(contains(&json!({"n": 1.0}), &json!({"n": 1})));
    }
}
