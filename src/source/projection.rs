//! Field-level reads.

use crate::types::{encoded_len, MessageEvent};
use serde_json::{Map, Value};
use std::sync::Arc;

/// Keep only the listed top-level fields of an object message.
///
/// Non-object messages are returned unchanged; listed fields missing from
/// the message are skipped.
pub fn project_fields(message: &Value, fields: &[String]) -> Value {
    match message {
        Value::Object(map) => {
            let mut projected = Map::new();
            for field in fields {
                if let Some(value) = map.get(field) {
                    projected.insert(field.clone(), value.clone());
                }
            }
            Value::Object(projected)
        }
        other => other.clone(),
    }
}

/// Apply a field selection to an event. `None` returns the event untouched.
pub fn project_event(event: MessageEvent, fields: Option<&[String]>) -> MessageEvent {
    let Some(fields) = fields else {
        return event;
    };
    let projected = project_fields(&event.message, fields);
    MessageEvent {
        size_in_bytes: encoded_len(&projected),
        message: Arc::new(projected),
        ..event
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::Time;
    use serde_json::json;

    #[test]
    fn test_project_object() {
        let message = json!({"speed": 3, "rpm": 2000, "gear": "D"});
        let projected = project_fields(&message, &["speed".into(), "missing".into()]);
        assert_eq!(projected, json!({"speed": 3}));
    }

    #[test]
    fn test_project_non_object() {
        let message = json!([1, 2, 3]);
        assert_eq!(project_fields(&message, &["x".into()]), message);
    }

    #[test]
    fn test_project_event_recomputes_size() {
        let event = MessageEvent::new("/a", "json", Time::new(1, 0), json!({"a": 1, "bbbb": 2}));
        let original_size = event.size_in_bytes;
        let projected = project_event(event.clone(), Some(&["a".to_string()]));
        assert!(projected.size_in_bytes < original_size);
        assert_eq!(*projected.message, json!({"a": 1}));

        let untouched = project_event(event.clone(), None);
        assert!(Arc::ptr_eq(&untouched.message, &event.message));
    }
}
