//! Event envelope types and the domain-event codec.
//!
//! This module provides the foundational data types and pure functions that
//! the store, runtime, and saga modules all depend on. No I/O occurs here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::aggregate::Aggregate;
use crate::command::CommandContext;
use crate::error::ValidationError;

/// Separator between the aggregate type and instance id in a stream id.
const STREAM_SEP: char = '/';

/// Compose a stream id from an aggregate type and instance id.
///
/// The same aggregate identity always maps to the same stream id,
/// regardless of which process performs the mapping.
///
/// # Examples
///
/// ```
/// use eventloom::stream_id;
/// assert_eq!(stream_id("order", "o-1"), "order/o-1");
/// ```
pub fn stream_id(aggregate_type: &str, instance_id: &str) -> String {
    format!("{aggregate_type}{STREAM_SEP}{instance_id}")
}

/// Split a stream id back into `(aggregate_type, instance_id)`.
///
/// Returns `None` for ids that were not produced by [`stream_id`]
/// (no separator). The instance id may itself contain the separator;
/// only the first occurrence splits.
pub fn parse_stream_id(stream_id: &str) -> Option<(&str, &str)> {
    stream_id.split_once(STREAM_SEP)
}

/// An event as recorded in a stream.
///
/// Immutable once appended: the store owns appended events, and every
/// other component holds read copies. `version` and `timestamp` are
/// assigned by the store at append time, never by the publisher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    /// The stream this event belongs to.
    pub stream_id: String,
    /// Event type tag (the adjacently-tagged variant name for domain
    /// events).
    pub event_type: String,
    /// JSON payload. Never null: unit-variant domain events carry an
    /// empty object.
    pub payload: Value,
    /// 1-based position within the stream, contiguous, assigned by the
    /// store.
    pub version: u64,
    /// Append time, assigned by the store.
    pub timestamp: DateTime<Utc>,
    /// Correlation id grouping related commands and events into one
    /// logical workflow.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub correlation_id: Option<String>,
    /// Identity of the message that caused this event.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub causation_id: Option<String>,
}

/// Publisher-side shape of an event, before the store assigns a version
/// and timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposedEvent {
    /// Event type tag.
    pub event_type: String,
    /// JSON payload. Never null for events produced by
    /// [`encode_domain_event`].
    pub payload: Value,
    /// Correlation id carried over from the originating command.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub correlation_id: Option<String>,
    /// Causation id carried over from the originating command.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub causation_id: Option<String>,
}

impl ProposedEvent {
    /// Validate this event for append.
    ///
    /// # Arguments
    ///
    /// * `index` - Position within the append batch, reported in the
    ///   error.
    ///
    /// # Errors
    ///
    /// [`ValidationError::MissingEventType`] for an empty type,
    /// [`ValidationError::MissingPayload`] for a null payload.
    pub fn validate(&self, index: usize) -> Result<(), ValidationError> {
        if self.event_type.is_empty() {
            return Err(ValidationError::MissingEventType { index });
        }
        if self.payload.is_null() {
            return Err(ValidationError::MissingPayload { index });
        }
        Ok(())
    }
}

/// Encode a domain event into a [`ProposedEvent`] ready for append.
///
/// The `DomainEvent` must use `#[serde(tag = "type", content = "data")]`
/// adjacently tagged serialization. The `"type"` field becomes
/// [`ProposedEvent::event_type`] and the `"data"` field becomes the
/// payload. Unit variants, which serialize without a `"data"` field,
/// get an empty-object payload so that appended events never carry null.
///
/// # Arguments
///
/// * `event` - Reference to the domain event to encode.
/// * `ctx` - Command context carrying correlation and causation ids.
///
/// # Errors
///
/// Returns `serde_json::Error` if the domain event cannot be serialized
/// or does not follow the adjacently-tagged convention.
pub fn encode_domain_event<A: Aggregate>(
    event: &A::DomainEvent,
    ctx: &CommandContext,
) -> serde_json::Result<ProposedEvent> {
    // Serialize the adjacently-tagged domain event. This produces JSON like:
    //   {"type": "OrderShipped"}                  (unit variant)
    //   {"type": "OrderPlaced", "data": {...}}    (variant with fields)
    let value = serde_json::to_value(event)?;
    let (event_type, payload) = split_tagged(&value)?;

    Ok(ProposedEvent {
        event_type,
        payload,
        correlation_id: ctx.correlation_id.clone(),
        causation_id: ctx.causation_id.clone(),
    })
}

/// Decode a recorded [`EventMessage`] back into a typed domain event.
///
/// Reconstructs the adjacently-tagged JSON object from the envelope's
/// `event_type` and `payload` fields. An empty-object payload is treated
/// as "no data" so unit variants round-trip.
///
/// # Errors
///
/// Returns `serde_json::Error` if the event does not decode as
/// `A::DomainEvent`. Callers replaying history treat this as corrupted
/// history, not as a skippable event.
pub fn decode_domain_event<A: Aggregate>(
    event: &EventMessage,
) -> serde_json::Result<A::DomainEvent> {
    let tagged = if is_empty_payload(&event.payload) {
        serde_json::json!({ "type": event.event_type })
    } else {
        serde_json::json!({
            "type": event.event_type,
            "data": event.payload,
        })
    };
    serde_json::from_value(tagged)
}

/// Extract the `"type"` tag and `"data"` payload from an adjacently
/// tagged JSON value. Absent data becomes an empty object.
pub(crate) fn split_tagged(value: &Value) -> serde_json::Result<(String, Value)> {
    use serde::ser::Error;

    let obj = value
        .as_object()
        .ok_or_else(|| serde_json::Error::custom("adjacently tagged enum must serialize to a JSON object"))?;
    let tag = obj
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| serde_json::Error::custom("adjacently tagged enum must have a string 'type' field"))?
        .to_owned();
    let data = match obj.get("data") {
        Some(Value::Null) | None => serde_json::json!({}),
        Some(data) => data.clone(),
    };
    Ok((tag, data))
}

/// True for payloads that stand in for "no data": null or `{}`.
fn is_empty_payload(payload: &Value) -> bool {
    match payload {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::test_fixtures::{Counter, CounterEvent};

    fn recorded(event_type: &str, payload: Value) -> EventMessage {
        EventMessage {
            stream_id: "counter/c-1".into(),
            event_type: event_type.into(),
            payload,
            version: 1,
            timestamp: Utc::now(),
            correlation_id: None,
            causation_id: None,
        }
    }

    #[test]
    fn stream_id_is_deterministic() {
        assert_eq!(stream_id("order", "o-1"), stream_id("order", "o-1"));
        assert_ne!(stream_id("order", "o-1"), stream_id("order", "o-2"));
    }

    #[test]
    fn parse_stream_id_roundtrip() {
        let id = stream_id("order", "o-1");
        assert_eq!(parse_stream_id(&id), Some(("order", "o-1")));
    }

    #[test]
    fn parse_stream_id_without_separator() {
        assert_eq!(parse_stream_id("order-1"), None);
    }

    #[test]
    fn encode_unit_variant_has_empty_object_payload() {
        let proposed =
            encode_domain_event::<Counter>(&CounterEvent::Incremented, &CommandContext::default())
                .expect("encode should succeed");
        assert_eq!(proposed.event_type, "Incremented");
        assert_eq!(proposed.payload, serde_json::json!({}));
    }

    #[test]
    fn encode_data_variant_carries_fields() {
        let proposed = encode_domain_event::<Counter>(
            &CounterEvent::Added { amount: 5 },
            &CommandContext::default(),
        )
        .expect("encode should succeed");
        assert_eq!(proposed.event_type, "Added");
        assert_eq!(proposed.payload, serde_json::json!({"amount": 5}));
    }

    #[test]
    fn encode_propagates_correlation_and_causation() {
        let ctx = CommandContext::default()
            .with_correlation_id("corr-1")
            .with_causation_id("cause-1");
        let proposed = encode_domain_event::<Counter>(&CounterEvent::Incremented, &ctx)
            .expect("encode should succeed");
        assert_eq!(proposed.correlation_id.as_deref(), Some("corr-1"));
        assert_eq!(proposed.causation_id.as_deref(), Some("cause-1"));
    }

    #[test]
    fn decode_unit_variant_roundtrip() {
        let event = recorded("Incremented", serde_json::json!({}));
        let decoded = decode_domain_event::<Counter>(&event).expect("decode should succeed");
        assert_eq!(decoded, CounterEvent::Incremented);
    }

    #[test]
    fn decode_data_variant_roundtrip() {
        let event = recorded("Added", serde_json::json!({"amount": 7}));
        let decoded = decode_domain_event::<Counter>(&event).expect("decode should succeed");
        assert_eq!(decoded, CounterEvent::Added { amount: 7 });
    }

    #[test]
    fn decode_unknown_type_is_an_error() {
        // An unrecognized event type is corrupted history to a replaying
        // aggregate, never silently skipped.
        let event = recorded("Exploded", serde_json::json!({}));
        assert!(decode_domain_event::<Counter>(&event).is_err());
    }

    #[test]
    fn validate_rejects_empty_event_type() {
        let proposed = ProposedEvent {
            event_type: String::new(),
            payload: serde_json::json!({}),
            correlation_id: None,
            causation_id: None,
        };
        assert!(matches!(
            proposed.validate(2),
            Err(ValidationError::MissingEventType { index: 2 })
        ));
    }

    #[test]
    fn validate_rejects_null_payload() {
        let proposed = ProposedEvent {
            event_type: "OrderPlaced".into(),
            payload: Value::Null,
            correlation_id: None,
            causation_id: None,
        };
        assert!(matches!(
            proposed.validate(0),
            Err(ValidationError::MissingPayload { index: 0 })
        ));
    }

    #[test]
    fn event_message_serde_roundtrip() {
        let event = recorded("Added", serde_json::json!({"amount": 3}));
        let json = serde_json::to_string(&event).expect("serialization should succeed");
        let back: EventMessage =
            serde_json::from_str(&json).expect("deserialization should succeed");
        assert_eq!(back, event);
    }
}
