//! Aggregate trait: the pure decision/evolution core of an event-sourced
//! domain type.

use serde::{de::DeserializeOwned, Serialize};

/// A domain aggregate whose state is derived from its event history.
///
/// The implementing type itself serves as the aggregate's state.
/// State is built by folding domain events through the
/// [`apply`](Aggregate::apply) method.
///
/// # Associated Types
///
/// - `Command`: the set of commands this aggregate can handle.
/// - `DomainEvent`: the set of events this aggregate can produce and apply.
/// - `Error`: command rejection / validation error.
///
/// # Contract
///
/// - [`handle`](Aggregate::handle) must be a pure decision function: no
///   I/O, no side effects. It validates a command against the current
///   state and returns zero or more events. Everything the command does
///   to the outside world happens through those events.
/// - [`apply`](Aggregate::apply) must be a pure, total function. It takes
///   ownership of the current state and a reference to a domain event,
///   returning the next state. Given the same event sequence it must
///   produce the same state, regardless of when or where replay occurs.
/// - Both `Command` and `DomainEvent` use adjacently tagged serde
///   (`#[serde(tag = "type", content = "data")]`); the tag is the wire
///   type string used for routing and trigger matching. `Command`
///   additionally derives [`strum::VariantNames`] so the variant names
///   can be enumerated at registration time.
pub trait Aggregate: Default + Clone + Send + Sync + 'static {
    /// Identifies this aggregate type (e.g. "order"). Used as the stream
    /// id prefix.
    const AGGREGATE_TYPE: &'static str;

    /// The set of commands this aggregate can handle.
    type Command: DeserializeOwned + Clone + Send + strum::VariantNames + 'static;

    /// The set of events this aggregate can produce and apply.
    type DomainEvent: Serialize + DeserializeOwned + Clone + Send + Sync + 'static;

    /// Command rejection / validation error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Validate a command against the current state and produce events.
    ///
    /// Returns `Ok(vec![])` if the command is a no-op.
    /// Returns `Err` to reject the command.
    fn handle(&self, cmd: Self::Command) -> Result<Vec<Self::DomainEvent>, Self::Error>;

    /// Apply a single event to produce the next state.
    fn apply(self, event: &Self::DomainEvent) -> Self;
}
