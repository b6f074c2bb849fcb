//! Command and event routing: envelope `type` string to handler
//! instances.
//!
//! Commands route to exactly one handler; dispatching a type nobody
//! registered fails with [`DispatchError::Unroutable`]. Events are
//! fire-and-forget broadcast: zero or more handlers per type, and the
//! absence of a subscriber is not an error.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::aggregate::Aggregate;
use crate::command::{decode_command, CommandMessage};
use crate::error::{DispatchError, ExecuteError, RegistrationError};
use crate::event::EventMessage;
use crate::runtime::AggregateRuntime;

/// A registered target for command envelopes of one or more types.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Handle a validated command envelope, returning the events it
    /// appended.
    async fn handle(&self, command: CommandMessage) -> Result<Vec<EventMessage>, DispatchError>;
}

/// A registered observer for event envelopes.
///
/// Handlers run on the event pump after the store has republished an
/// appended event. Delivery is at-least-once; handlers must tolerate
/// re-seeing an event without duplicating externally visible effects.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Observe a single event.
    ///
    /// Errors are logged and isolated; they never affect other handlers
    /// or subsequent events.
    async fn handle(
        &self,
        event: &EventMessage,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Routes command envelopes to exactly one handler per command type.
#[derive(Default)]
pub struct CommandRouter {
    routes: HashMap<String, Arc<dyn CommandHandler>>,
}

impl CommandRouter {
    /// Create an empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a command type.
    ///
    /// # Errors
    ///
    /// [`RegistrationError::DuplicateCommandHandler`] if the type is
    /// already routed; commands go to exactly one handler.
    pub fn register(
        &mut self,
        command_type: impl Into<String>,
        handler: Arc<dyn CommandHandler>,
    ) -> Result<(), RegistrationError> {
        let command_type = command_type.into();
        if self.routes.contains_key(&command_type) {
            return Err(RegistrationError::DuplicateCommandHandler(command_type));
        }
        self.routes.insert(command_type, handler);
        Ok(())
    }

    /// Number of routed command types.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// True if no command types are routed.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Validate an envelope and route it to its handler.
    ///
    /// # Errors
    ///
    /// * [`DispatchError::Validation`] - malformed envelope, rejected
    ///   before routing.
    /// * [`DispatchError::Unroutable`] - no handler registered for the
    ///   declared type; never retried.
    /// * Whatever the handler itself returns.
    pub async fn dispatch(
        &self,
        command: CommandMessage,
    ) -> Result<Vec<EventMessage>, DispatchError> {
        command.validate().map_err(|e| {
            tracing::warn!(error = %e, "rejected malformed command envelope");
            e
        })?;
        let handler = self.routes.get(&command.command_type).ok_or_else(|| {
            tracing::warn!(
                command_type = %command.command_type,
                aggregate_id = %command.aggregate_id,
                "no command handler registered"
            );
            DispatchError::Unroutable(command.command_type.clone())
        })?;
        handler.handle(command).await
    }
}

/// Routes event envelopes to all handlers registered for their type.
#[derive(Default)]
pub struct EventRouter {
    routes: HashMap<String, Vec<Arc<dyn EventHandler>>>,
}

impl EventRouter {
    /// Create an empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a set of event types.
    pub fn register(&mut self, event_types: &[&str], handler: Arc<dyn EventHandler>) {
        for event_type in event_types {
            self.routes
                .entry((*event_type).to_owned())
                .or_default()
                .push(handler.clone());
        }
    }

    /// Broadcast an event to every handler registered for its type.
    ///
    /// An unrouted event is a silent no-op. A failing handler is logged
    /// and does not prevent the remaining handlers from running.
    pub async fn dispatch(&self, event: &EventMessage) {
        let Some(handlers) = self.routes.get(&event.event_type) else {
            return;
        };
        for handler in handlers {
            if let Err(e) = handler.handle(event).await {
                tracing::error!(
                    event_type = %event.event_type,
                    stream_id = %event.stream_id,
                    error = %e,
                    "event handler failed"
                );
            }
        }
    }
}

/// Bridges type-erased command envelopes to a typed
/// [`AggregateRuntime`].
///
/// One instance is registered under every variant name of
/// `A::Command`; the envelope's payload is deserialized into the
/// concrete command type at dispatch time.
pub struct AggregateCommandHandler<A: Aggregate> {
    runtime: AggregateRuntime<A>,
}

impl<A: Aggregate> AggregateCommandHandler<A> {
    /// Wrap a runtime for registration with a [`CommandRouter`].
    pub fn new(runtime: AggregateRuntime<A>) -> Self {
        Self { runtime }
    }
}

#[async_trait]
impl<A: Aggregate> CommandHandler for AggregateCommandHandler<A> {
    async fn handle(&self, command: CommandMessage) -> Result<Vec<EventMessage>, DispatchError> {
        let cmd = decode_command::<A>(&command)?;
        let ctx = command.context();
        self.runtime
            .execute(&command.aggregate_id, cmd, ctx)
            .await
            .map_err(|e| match e {
                ExecuteError::Domain(domain) => DispatchError::Execution(Box::new(domain)),
                ExecuteError::Conflict { .. } => DispatchError::Conflict,
                other => DispatchError::Execution(Box::new(other)),
            })
    }
}
