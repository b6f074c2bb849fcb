//! Command envelope and cross-cutting command metadata.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::aggregate::Aggregate;
use crate::error::ValidationError;
use crate::event::split_tagged;

/// Cross-cutting metadata passed alongside a typed command.
///
/// Carries correlation, causation, and the caller's optional version pin
/// without polluting the `Command` or `DomainEvent` types. Correlation
/// and causation ids are stamped onto every event the command produces.
///
/// # Examples
///
/// ```
/// use eventloom::CommandContext;
///
/// let ctx = CommandContext::default()
///     .with_correlation_id("req-abc-123")
///     .with_causation_id("cmd-7");
///
/// assert_eq!(ctx.correlation_id.as_deref(), Some("req-abc-123"));
/// assert_eq!(ctx.causation_id.as_deref(), Some("cmd-7"));
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandContext {
    /// Correlation id for tracing a workflow across aggregates.
    pub correlation_id: Option<String>,
    /// Identity of the message that caused this command.
    pub causation_id: Option<String>,
    /// Caller-pinned stream version. When set, execution conflicts
    /// immediately if the loaded version differs; the runtime does not
    /// retry, because reloading cannot satisfy a fixed pin.
    pub expected_version: Option<u64>,
}

impl CommandContext {
    /// Set the correlation id.
    ///
    /// # Returns
    ///
    /// The updated `CommandContext` for method chaining.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Set the causation id.
    ///
    /// # Returns
    ///
    /// The updated `CommandContext` for method chaining.
    pub fn with_causation_id(mut self, id: impl Into<String>) -> Self {
        self.causation_id = Some(id.into());
        self
    }

    /// Pin the stream version this command expects to append onto.
    ///
    /// # Returns
    ///
    /// The updated `CommandContext` for method chaining.
    pub fn with_expected_version(mut self, version: u64) -> Self {
        self.expected_version = Some(version);
        self
    }
}

/// A type-erased command envelope.
///
/// Ephemeral: commands exist only in transit and are never persisted.
/// The `payload` is a `serde_json::Value` because the sender does not
/// know the concrete command type of the target aggregate at compile
/// time; the dispatch layer deserializes it into the correct
/// `A::Command` at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandMessage {
    /// Target aggregate instance identifier.
    pub aggregate_id: String,
    /// Command type tag (the adjacently-tagged variant name).
    pub command_type: String,
    /// JSON-serialized command payload.
    pub payload: Value,
    /// Caller-pinned stream version, if any.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub expected_version: Option<u64>,
    /// Correlation id grouping this command into a logical workflow.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub correlation_id: Option<String>,
    /// Identity of the message that caused this command.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub causation_id: Option<String>,
}

impl CommandMessage {
    /// Build an envelope from a typed command.
    ///
    /// The command must use `#[serde(tag = "type", content = "data")]`
    /// adjacently tagged serialization; the tag becomes
    /// [`command_type`](CommandMessage::command_type) and the content
    /// becomes the payload.
    ///
    /// # Arguments
    ///
    /// * `aggregate_id` - Target aggregate instance identifier.
    /// * `command` - The typed command to serialize.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if the command cannot be serialized
    /// or does not follow the adjacently-tagged convention.
    pub fn typed<C: Serialize>(
        aggregate_id: impl Into<String>,
        command: &C,
    ) -> serde_json::Result<Self> {
        let value = serde_json::to_value(command)?;
        let (command_type, payload) = split_tagged(&value)?;
        Ok(Self {
            aggregate_id: aggregate_id.into(),
            command_type,
            payload,
            expected_version: None,
            correlation_id: None,
            causation_id: None,
        })
    }

    /// Set the correlation id.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Set the causation id.
    pub fn with_causation_id(mut self, id: impl Into<String>) -> Self {
        self.causation_id = Some(id.into());
        self
    }

    /// Pin the stream version this command expects to append onto.
    pub fn with_expected_version(mut self, version: u64) -> Self {
        self.expected_version = Some(version);
        self
    }

    /// Validate the envelope's required fields.
    ///
    /// Called at ingress, before routing; a malformed envelope never
    /// reaches a handler.
    ///
    /// # Errors
    ///
    /// [`ValidationError::MissingAggregateId`] or
    /// [`ValidationError::MissingCommandType`] for empty required fields.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.aggregate_id.is_empty() {
            return Err(ValidationError::MissingAggregateId);
        }
        if self.command_type.is_empty() {
            return Err(ValidationError::MissingCommandType);
        }
        Ok(())
    }

    /// Derive the [`CommandContext`] carried by this envelope.
    pub fn context(&self) -> CommandContext {
        CommandContext {
            correlation_id: self.correlation_id.clone(),
            causation_id: self.causation_id.clone(),
            expected_version: self.expected_version,
        }
    }
}

/// Decode an envelope's payload into the target aggregate's command type.
///
/// Reconstructs the adjacently-tagged JSON object from `command_type`
/// and `payload`. An empty-object payload is treated as "no data" so
/// unit variants round-trip.
///
/// # Errors
///
/// [`ValidationError::Payload`] if the payload does not decode as
/// `A::Command`.
pub fn decode_command<A: Aggregate>(
    command: &CommandMessage,
) -> Result<A::Command, ValidationError> {
    let no_data = match &command.payload {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    };
    let tagged = if no_data {
        serde_json::json!({ "type": command.command_type })
    } else {
        serde_json::json!({
            "type": command.command_type,
            "data": command.payload,
        })
    };
    serde_json::from_value(tagged).map_err(|source| ValidationError::Payload {
        command_type: command.command_type.clone(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::test_fixtures::{Counter, CounterCommand};
    use serde_json::json;

    #[test]
    fn default_context_has_no_fields_set() {
        let ctx = CommandContext::default();
        assert_eq!(ctx.correlation_id, None);
        assert_eq!(ctx.causation_id, None);
        assert_eq!(ctx.expected_version, None);
    }

    #[test]
    fn context_builder_chains_all_fields() {
        let ctx = CommandContext::default()
            .with_correlation_id("corr-1")
            .with_causation_id("cause-1")
            .with_expected_version(4);
        assert_eq!(ctx.correlation_id.as_deref(), Some("corr-1"));
        assert_eq!(ctx.causation_id.as_deref(), Some("cause-1"));
        assert_eq!(ctx.expected_version, Some(4));
    }

    #[test]
    fn typed_extracts_tag_and_payload() {
        let cmd = CommandMessage::typed("c-1", &CounterCommand::Add { amount: 5 })
            .expect("typed should succeed");
        assert_eq!(cmd.aggregate_id, "c-1");
        assert_eq!(cmd.command_type, "Add");
        assert_eq!(cmd.payload, json!({"amount": 5}));
    }

    #[test]
    fn typed_unit_variant_has_empty_payload() {
        let cmd = CommandMessage::typed("c-1", &CounterCommand::Increment)
            .expect("typed should succeed");
        assert_eq!(cmd.command_type, "Increment");
        assert_eq!(cmd.payload, json!({}));
    }

    #[test]
    fn validate_accepts_well_formed_envelope() {
        let cmd = CommandMessage::typed("c-1", &CounterCommand::Increment)
            .expect("typed should succeed");
        assert!(cmd.validate().is_ok());
    }

    #[test]
    fn validate_rejects_empty_aggregate_id() {
        let cmd = CommandMessage {
            aggregate_id: String::new(),
            command_type: "Increment".into(),
            payload: json!({}),
            expected_version: None,
            correlation_id: None,
            causation_id: None,
        };
        assert!(matches!(
            cmd.validate(),
            Err(ValidationError::MissingAggregateId)
        ));
    }

    #[test]
    fn validate_rejects_empty_command_type() {
        let cmd = CommandMessage {
            aggregate_id: "c-1".into(),
            command_type: String::new(),
            payload: json!({}),
            expected_version: None,
            correlation_id: None,
            causation_id: None,
        };
        assert!(matches!(
            cmd.validate(),
            Err(ValidationError::MissingCommandType)
        ));
    }

    #[test]
    fn decode_command_roundtrip() {
        let envelope = CommandMessage::typed("c-1", &CounterCommand::Add { amount: 9 })
            .expect("typed should succeed");
        let decoded = decode_command::<Counter>(&envelope).expect("decode should succeed");
        assert!(matches!(decoded, CounterCommand::Add { amount: 9 }));
    }

    #[test]
    fn decode_command_unknown_type_fails() {
        let envelope = CommandMessage {
            aggregate_id: "c-1".into(),
            command_type: "Detonate".into(),
            payload: json!({}),
            expected_version: None,
            correlation_id: None,
            causation_id: None,
        };
        let err = decode_command::<Counter>(&envelope).expect_err("decode should fail");
        assert!(matches!(err, ValidationError::Payload { .. }));
    }

    #[test]
    fn context_carries_envelope_metadata() {
        let cmd = CommandMessage::typed("c-1", &CounterCommand::Increment)
            .expect("typed should succeed")
            .with_correlation_id("corr-9")
            .with_causation_id("cause-9")
            .with_expected_version(2);
        let ctx = cmd.context();
        assert_eq!(ctx.correlation_id.as_deref(), Some("corr-9"));
        assert_eq!(ctx.causation_id.as_deref(), Some("cause-9"));
        assert_eq!(ctx.expected_version, Some(2));
    }

    #[test]
    fn command_message_serde_roundtrip() {
        let cmd = CommandMessage::typed("c-1", &CounterCommand::Add { amount: 2 })
            .expect("typed should succeed")
            .with_correlation_id("corr-1");
        let json = serde_json::to_string(&cmd).expect("serialization should succeed");
        let back: CommandMessage =
            serde_json::from_str(&json).expect("deserialization should succeed");
        assert_eq!(back.aggregate_id, cmd.aggregate_id);
        assert_eq!(back.command_type, cmd.command_type);
        assert_eq!(back.payload, cmd.payload);
        assert_eq!(back.correlation_id, cmd.correlation_id);
    }
}
