//! Bus event types

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::aggregator::CompositeReading;
use crate::engine::FieldState;
use crate::error::{Result, SyncError};
use crate::recorder::SessionSummary;

/// Separator between namespace and verb in an event type
pub const DELIMITER: char = ':';

/// Verb that marks a namespace-wide subscription (`"<namespace>:*"`)
pub const WILDCARD: &str = "*";

/// A single emission on the bus
///
/// Created at emission time and never mutated afterwards; listeners get a
/// shared reference and the history keeps its own copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Full type, `namespace<delimiter>verb`
    #[serde(rename = "type")]
    pub event_type: String,

    /// Bus-local emission counter
    pub sequence: u64,

    /// Wall-clock emission time
    pub timestamp: DateTime<Utc>,

    /// Typed payload
    pub payload: EventPayload,
}

impl Event {
    /// Namespace part of the type (before the first `:`)
    pub fn namespace(&self) -> &str {
        self.event_type
            .split_once(DELIMITER)
            .map(|(ns, _)| ns)
            .unwrap_or(&self.event_type)
    }

    /// Verb part of the type (after the first `:`)
    pub fn verb(&self) -> &str {
        self.event_type
            .split_once(DELIMITER)
            .map(|(_, verb)| verb)
            .unwrap_or("")
    }

    /// Flatten into one JSON object: `type`, `sequence`, `timestamp` plus the
    /// payload's own fields (a custom object's members are lifted to the top)
    pub fn to_flat_json(&self) -> Value {
        let mut map = serde_json::Map::new();
        map.insert("type".to_string(), Value::String(self.event_type.clone()));
        map.insert("sequence".to_string(), Value::from(self.sequence));
        map.insert(
            "timestamp".to_string(),
            Value::String(self.timestamp.to_rfc3339()),
        );
        if let EventPayload::Custom { data } = &self.payload {
            match data {
                Value::Object(fields) => {
                    for (k, v) in fields {
                        map.entry(k.clone()).or_insert_with(|| v.clone());
                    }
                }
                other => {
                    map.insert("data".to_string(), other.clone());
                }
            }
            return Value::Object(map);
        }
        match serde_json::to_value(&self.payload) {
            Ok(Value::Object(fields)) => {
                for (k, v) in fields {
                    map.entry(k).or_insert(v);
                }
            }
            Ok(other) => {
                map.insert("payload".to_string(), other);
            }
            Err(_) => {}
        }
        Value::Object(map)
    }
}

/// Closed set of payload shapes carried on the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    /// An engine published a new field state
    Field(FieldState),

    /// An engine's phase label changed
    PhaseChange {
        engine: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        to: String,
    },

    /// A level crossed a threshold upward (edge-triggered)
    Threshold {
        source: String,
        level: f64,
        threshold: f64,
    },

    /// The aggregator recombined its inputs
    Composite(CompositeReading),

    /// A recording session began
    SessionStarted { session_id: String },

    /// A recording session was finalized
    SessionComplete(SessionSummary),

    /// Free-form payload from an external producer
    ///
    /// Numeric and string members of an object are picked up by the
    /// recorder as sample fields.
    Custom { data: Value },
}

impl EventPayload {
    /// Wrap arbitrary JSON
    pub fn custom(data: Value) -> Self {
        EventPayload::Custom { data }
    }

    /// Build a custom payload from named scalar values
    pub fn values<I, K>(values: I) -> Self
    where
        I: IntoIterator<Item = (K, f64)>,
        K: Into<String>,
    {
        let map: BTreeMap<String, f64> = values.into_iter().map(|(k, v)| (k.into(), v)).collect();
        EventPayload::custom(serde_json::to_value(map).unwrap_or(Value::Null))
    }

    /// Short name of the variant, for logs
    pub fn kind(&self) -> &'static str {
        match self {
            EventPayload::Field(_) => "field",
            EventPayload::PhaseChange { .. } => "phase_change",
            EventPayload::Threshold { .. } => "threshold",
            EventPayload::Composite(_) => "composite",
            EventPayload::SessionStarted { .. } => "session_started",
            EventPayload::SessionComplete(_) => "session_complete",
            EventPayload::Custom { .. } => "custom",
        }
    }
}

/// Split and validate an event type
///
/// Both halves must be non-empty. The verb may only be [`WILDCARD`] when
/// `allow_wildcard` is set (subscriptions, not emissions).
pub fn split_event_type(event_type: &str, allow_wildcard: bool) -> Result<(&str, &str)> {
    if event_type.is_empty() {
        return Err(SyncError::invalid("event type must not be empty"));
    }
    let (namespace, verb) = event_type.split_once(DELIMITER).ok_or_else(|| {
        SyncError::invalid(format!(
            "event type '{}' has no namespace (expected 'namespace{}verb')",
            event_type, DELIMITER
        ))
    })?;
    if namespace.is_empty() {
        return Err(SyncError::invalid(format!(
            "event type '{}' has an empty namespace",
            event_type
        )));
    }
    if verb.is_empty() {
        return Err(SyncError::invalid(format!(
            "event type '{}' has an empty verb",
            event_type
        )));
    }
    if verb == WILDCARD && !allow_wildcard {
        return Err(SyncError::invalid(format!(
            "cannot emit wildcard type '{}'",
            event_type
        )));
    }
    Ok((namespace, verb))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_split_event_type() {
        assert_eq!(
            split_event_type("consciousness:update", false).unwrap(),
            ("consciousness", "update")
        );
        assert_eq!(
            split_event_type("a:b:c", false).unwrap(),
            ("a", "b:c")
        );
        assert!(split_event_type("", false).is_err());
        assert!(split_event_type("noverb", false).is_err());
        assert!(split_event_type(":update", false).is_err());
        assert!(split_event_type("ns:", false).is_err());
        assert!(split_event_type("ns:*", false).is_err());
        assert!(split_event_type("ns:*", true).is_ok());
    }

    #[test]
    fn test_payload_serialization_is_tagged() {
        let payload = EventPayload::Threshold {
            source: "coherence".to_string(),
            level: 0.97,
            threshold: 0.95,
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["kind"], "threshold");
        assert_eq!(value["source"], "coherence");

        let parsed: EventPayload = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, payload);
    }

    #[test]
    fn test_flat_json_includes_type_and_fields() {
        let event = Event {
            event_type: "consciousness:update".to_string(),
            sequence: 3,
            timestamp: Utc::now(),
            payload: EventPayload::Threshold {
                source: "s".to_string(),
                level: 1.0,
                threshold: 0.5,
            },
        };
        let flat = event.to_flat_json();
        assert_eq!(flat["type"], "consciousness:update");
        assert_eq!(flat["level"], json!(1.0));
        assert_eq!(event.namespace(), "consciousness");
        assert_eq!(event.verb(), "update");
    }

    #[test]
    fn test_values_payload() {
        let payload = EventPayload::values([("v", 1.0)]);
        assert_eq!(payload, EventPayload::custom(json!({"v": 1.0})));
    }
}
