//! Crate-level error types, one enum per subsystem.

use crate::store::StoreError;

/// Validation failure on an inbound envelope or a proposed event.
///
/// Raised before any state change: a command that fails validation never
/// reaches dispatch, and an event that fails validation is never appended.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    /// The command envelope has an empty `aggregate_id`.
    #[error("command is missing a non-empty aggregate_id")]
    MissingAggregateId,

    /// The command envelope has an empty `command_type`.
    #[error("command is missing a non-empty command_type")]
    MissingCommandType,

    /// A proposed event has an empty `event_type`.
    #[error("proposed event at index {index} has an empty event_type")]
    MissingEventType {
        /// Position of the offending event within the append batch.
        index: usize,
    },

    /// A proposed event has a null payload.
    #[error("proposed event at index {index} has a null payload")]
    MissingPayload {
        /// Position of the offending event within the append batch.
        index: usize,
    },

    /// The command payload does not decode as the target aggregate's
    /// command type.
    #[error("payload for command '{command_type}' does not decode: {source}")]
    Payload {
        /// The envelope's declared command type.
        command_type: String,
        /// The underlying deserialization error.
        source: serde_json::Error,
    },
}

/// Error returned when executing a command against an aggregate fails.
///
/// Generic over `E`, the domain-specific error type that the aggregate's
/// command handler may produce (e.g., "insufficient funds").
#[derive(Debug, thiserror::Error)]
pub enum ExecuteError<E: std::error::Error + Send + Sync + 'static> {
    /// Command rejected by aggregate logic.
    ///
    /// Wraps the domain-specific error returned from the aggregate's
    /// command handler, forwarding its `Display` and `Error` impls.
    /// No events were appended; the stream is unchanged.
    #[error(transparent)]
    Domain(E),

    /// Optimistic concurrency retries exhausted.
    ///
    /// Every attempt of the load-handle-append cycle encountered a
    /// version conflict with a concurrent writer, or the command pinned
    /// an expected version that the stream has moved past.
    #[error("optimistic concurrency conflict on stream '{stream_id}': retries exhausted")]
    Conflict {
        /// The contended stream.
        stream_id: String,
    },

    /// An appended event could not be decoded during replay.
    ///
    /// Replay must be deterministic, so a decode failure indicates
    /// corrupted history. Fatal to the load operation: never retried,
    /// never skipped.
    #[error("corrupted history in stream '{stream_id}' at version {version}: {source}")]
    Replay {
        /// The stream whose history failed to decode.
        stream_id: String,
        /// Version of the undecodable event.
        version: u64,
        /// The underlying deserialization error.
        source: serde_json::Error,
    },

    /// The event store failed for a reason other than a version conflict.
    #[error(transparent)]
    Store(StoreError),
}

/// Error returned when routing a type-erased envelope to a handler fails.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// No command handler is registered for the envelope's declared type.
    ///
    /// Surfaced immediately and never retried.
    #[error("no command handler registered for '{0}'")]
    Unroutable(String),

    /// The envelope failed schema validation before routing.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Optimistic concurrency retries exhausted inside the runtime.
    #[error("optimistic concurrency conflict: retries exhausted")]
    Conflict,

    /// Command execution failed: a domain rejection, corrupted history,
    /// or a store failure. The source error carries the detail.
    #[error("command execution failed: {0}")]
    Execution(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Error raised while registering handlers, sagas, or dependencies at
/// startup. Any `RegistrationError` is fatal to composition: the process
/// should not start.
#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    /// A saga declared a trigger binding with an empty event-type set.
    ///
    /// Such a binding would match nothing and silently never fire, so
    /// registration fails instead.
    #[error("saga '{saga}' trigger '{binding}' matches no event types")]
    EmptyTriggerSet {
        /// The saga type's registered name.
        saga: &'static str,
        /// The offending binding's name.
        binding: &'static str,
    },

    /// A second command handler was registered for the same command type.
    /// Commands route to exactly one handler.
    #[error("a command handler for '{0}' is already registered")]
    DuplicateCommandHandler(String),

    /// A dependency lookup failed during handler or saga construction.
    #[error(transparent)]
    Resolve(#[from] ResolveError),
}

/// Error raised by the dependency [`Resolver`](crate::resolver::Resolver).
///
/// Resolution happens once per registration at startup; failures are
/// fatal and never retried.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    /// No factory or value is registered under the requested token.
    #[error("no dependency registered for token '{0}'")]
    UnknownToken(String),

    /// The registered instance is not of the requested type.
    #[error("dependency '{0}' is not of the requested type")]
    TypeMismatch(String),
}

/// Error raised by a [`Transport`](crate::transport::Transport)
/// implementation.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The transport (or the subscription backing it) has shut down.
    #[error("transport channel closed")]
    Closed,

    /// Envelope serialization failed before publication.
    #[error("envelope encoding failed: {0}")]
    Codec(#[from] serde_json::Error),
}
