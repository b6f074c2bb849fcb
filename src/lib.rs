//! Event-sourced application framework built around three subsystems:
//! a durable append-only [`EventStore`] with optimistic concurrency, an
//! [`AggregateRuntime`] that bridges commands to event production by
//! replaying history, and a [`SagaEngine`] that reacts to the event
//! stream with follow-up commands.
//!
//! Envelopes move between the pieces over a topic-based [`Transport`];
//! [`AppBuilder`] wires everything together at startup and fails fast
//! on any invalid registration.

mod aggregate;
pub use aggregate::Aggregate;
mod app;
pub use app::{App, AppBuilder, AppHandle};
mod command;
pub use command::{decode_command, CommandContext, CommandMessage};
mod dispatch;
pub use dispatch::{
    AggregateCommandHandler, CommandHandler, CommandRouter, EventHandler, EventRouter,
};
mod error;
pub use error::{
    DispatchError, ExecuteError, RegistrationError, ResolveError, TransportError, ValidationError,
};
mod event;
pub use event::{
    decode_domain_event, encode_domain_event, parse_stream_id, stream_id, EventMessage,
    ProposedEvent,
};
mod resolver;
pub use resolver::Resolver;
mod runtime;
pub use runtime::{AggregateRuntime, RetryConfig};
mod saga;
pub use saga::{Saga, SagaEngine, TriggerBinding, TriggerResult};
mod storage;
pub use storage::{DurableLog, JsonlLog, MemoryLog};
mod store;
pub use store::{EventStore, StoreError};
mod transport;
pub use transport::{MemoryTransport, Subscription, Transport, COMMAND_TOPIC, EVENT_TOPIC};
