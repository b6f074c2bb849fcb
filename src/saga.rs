//! Saga trigger engine: reactive, event-driven orchestration.
//!
//! A saga reacts to events from one or more streams and produces
//! [`CommandMessage`]s that are dispatched back into the command path.
//! Each saga type declares its interest as a set of trigger bindings,
//! each binding pairing a handler function with a non-empty set of
//! event type names. The engine keeps the bindings in a side-table
//! built at registration time and consults it for every delivered
//! event; saga state itself carries no routing metadata.
//!
//! Delivery is at-least-once: a crash between event append and saga
//! processing causes redelivery, and the engine does not deduplicate.
//! Keeping handlers idempotent (or consulting saga state to detect
//! replays) is the saga author's contract.

use std::collections::HashMap;

use crate::command::CommandMessage;
use crate::error::RegistrationError;
use crate::event::EventMessage;

/// A stateful process reacting to events to coordinate multi-step
/// workflows via follow-up commands.
///
/// The implementing type itself serves as the per-instance saga state;
/// one instance exists per correlation key, created on the first
/// matching event for a new key.
///
/// # Contract
///
/// - Trigger handlers must be deterministic given (state, event) and
///   must tolerate re-processing the same event: delivery is
///   at-least-once and the engine never deduplicates.
/// - [`triggers`](Saga::triggers) is consulted once at registration;
///   every binding must name at least one event type or registration
///   fails.
pub trait Saga: Default + Send + Sync + 'static {
    /// Identifies this saga type in logs and errors.
    const NAME: &'static str;

    /// Error type a trigger handler may produce. Handler failures are
    /// logged and isolated per binding; they never halt the engine.
    type Error: std::error::Error + Send + Sync + 'static;

    /// The trigger bindings for this saga type, in firing order.
    fn triggers() -> Vec<TriggerBinding<Self>>
    where
        Self: Sized;

    /// Derive the correlation key grouping events into one saga
    /// instance.
    ///
    /// Defaults to the event's correlation id, falling back to its
    /// stream id so uncorrelated events still land somewhere
    /// deterministic. Returning `None` skips delivery to this saga.
    fn correlation(event: &EventMessage) -> Option<String>
    where
        Self: Sized,
    {
        Some(
            event
                .correlation_id
                .clone()
                .unwrap_or_else(|| event.stream_id.clone()),
        )
    }

    /// True once this instance's workflow has finished.
    ///
    /// The engine sweeps completed instances after delivery; when and
    /// whether a saga completes is policy, not engine behaviour, so the
    /// default is to never complete.
    fn is_complete(&self) -> bool {
        false
    }
}

/// Result of one trigger invocation: follow-up commands, or a handler
/// error.
pub type TriggerResult<S> = Result<Vec<CommandMessage>, <S as Saga>::Error>;

/// Associates a named handler with the event types that fire it.
///
/// Built by [`Saga::triggers`] at startup and immutable afterwards.
pub struct TriggerBinding<S: Saga> {
    name: &'static str,
    event_types: Vec<String>,
    handler: fn(&mut S, &EventMessage) -> TriggerResult<S>,
}

impl<S: Saga> TriggerBinding<S> {
    /// Bind a handler to a set of event types.
    ///
    /// An empty `event_types` slice is accepted here and rejected at
    /// registration, so the failure carries the saga and binding names.
    ///
    /// # Arguments
    ///
    /// * `name` - Handler name, used in logs and registration errors.
    /// * `event_types` - Event type tags that fire this binding.
    /// * `handler` - The handler function, invoked with the resolved
    ///   instance state and the event.
    pub fn new(
        name: &'static str,
        event_types: &[&str],
        handler: fn(&mut S, &EventMessage) -> TriggerResult<S>,
    ) -> Self {
        Self {
            name,
            event_types: event_types.iter().map(|t| (*t).to_owned()).collect(),
            handler,
        }
    }

    /// True if this binding fires for the given event type.
    fn matches(&self, event_type: &str) -> bool {
        self.event_types.iter().any(|t| t == event_type)
    }
}

/// Type-erased interface over [`SagaRunner`] instances of different
/// saga types.
trait ErasedRunner: Send + Sync {
    /// Deliver one event, returning the follow-up commands it produced.
    fn deliver(&mut self, event: &EventMessage) -> Vec<CommandMessage>;

    /// The saga type's name.
    fn saga_name(&self) -> &'static str;

    /// Number of live (not yet swept) instances.
    fn active_instances(&self) -> usize;
}

/// Holds one saga type's binding table and its live instances.
struct SagaRunner<S: Saga> {
    bindings: Vec<TriggerBinding<S>>,
    instances: HashMap<String, S>,
}

impl<S: Saga> SagaRunner<S> {
    /// Build the runner, validating every binding.
    fn new() -> Result<Self, RegistrationError> {
        let bindings = S::triggers();
        for binding in &bindings {
            if binding.event_types.is_empty() {
                return Err(RegistrationError::EmptyTriggerSet {
                    saga: S::NAME,
                    binding: binding.name,
                });
            }
        }
        Ok(Self {
            bindings,
            instances: HashMap::new(),
        })
    }
}

impl<S: Saga> ErasedRunner for SagaRunner<S> {
    fn deliver(&mut self, event: &EventMessage) -> Vec<CommandMessage> {
        let matching: Vec<&TriggerBinding<S>> = self
            .bindings
            .iter()
            .filter(|b| b.matches(&event.event_type))
            .collect();
        if matching.is_empty() {
            return Vec::new();
        }

        let Some(key) = S::correlation(event) else {
            return Vec::new();
        };
        let instance = self.instances.entry(key.clone()).or_default();

        let mut commands = Vec::new();
        for binding in matching {
            match (binding.handler)(instance, event) {
                Ok(produced) => commands.extend(produced),
                // One failing binding must not prevent the others from
                // running for the same event.
                Err(e) => {
                    tracing::error!(
                        saga = S::NAME,
                        binding = binding.name,
                        event_type = %event.event_type,
                        correlation = %key,
                        error = %e,
                        "saga trigger failed"
                    );
                }
            }
        }

        if instance.is_complete() {
            self.instances.remove(&key);
            tracing::debug!(saga = S::NAME, correlation = %key, "saga instance completed");
        }

        commands
    }

    fn saga_name(&self) -> &'static str {
        S::NAME
    }

    fn active_instances(&self) -> usize {
        self.instances.len()
    }
}

/// Dispatches events to every registered saga's matching bindings.
///
/// Sagas fire in registration order and bindings within a saga in
/// declaration order; that order carries no semantics and saga logic
/// must not rely on it.
#[derive(Default)]
pub struct SagaEngine {
    runners: Vec<Box<dyn ErasedRunner>>,
}

impl SagaEngine {
    /// Create an engine with no sagas.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a saga type, validating its trigger bindings.
    ///
    /// # Errors
    ///
    /// [`RegistrationError::EmptyTriggerSet`] if any binding names no
    /// event types. Registration failures are fatal to startup.
    pub fn register<S: Saga>(&mut self) -> Result<(), RegistrationError> {
        let runner = SagaRunner::<S>::new()?;
        tracing::debug!(saga = S::NAME, "registered saga");
        self.runners.push(Box::new(runner));
        Ok(())
    }

    /// Deliver an event to every matching binding of every saga.
    ///
    /// Returns the follow-up commands produced by all invoked handlers,
    /// in firing order. The caller submits them to the command dispatch
    /// path.
    pub fn deliver(&mut self, event: &EventMessage) -> Vec<CommandMessage> {
        let mut commands = Vec::new();
        for runner in &mut self.runners {
            commands.extend(runner.deliver(event));
        }
        commands
    }

    /// Names of the registered sagas, in registration order.
    pub fn saga_names(&self) -> Vec<&'static str> {
        self.runners.iter().map(|r| r.saga_name()).collect()
    }

    /// Total live saga instances across all types.
    pub fn active_instances(&self) -> usize {
        self.runners.iter().map(|r| r.active_instances()).sum()
    }
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use super::*;
    use serde_json::json;

    /// Infallible error type for fixtures whose handlers cannot fail.
    #[derive(Debug)]
    pub(crate) enum Never {}

    impl std::fmt::Display for Never {
        fn fmt(&self, _: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match *self {}
        }
    }

    impl std::error::Error for Never {}

    /// Counts deliveries and echoes each matched event as a command.
    #[derive(Debug, Default)]
    pub(crate) struct EchoSaga {
        pub events_seen: u64,
    }

    impl Saga for EchoSaga {
        const NAME: &'static str = "echo";
        type Error = Never;

        fn triggers() -> Vec<TriggerBinding<Self>> {
            vec![TriggerBinding::new(
                "echo_all",
                &["OrderPlaced", "OrderCancelled"],
                |saga, event| {
                    saga.events_seen += 1;
                    Ok(vec![CommandMessage {
                        aggregate_id: event.stream_id.clone(),
                        command_type: "Echo".into(),
                        payload: json!({"source": event.event_type}),
                        expected_version: None,
                        correlation_id: event.correlation_id.clone(),
                        causation_id: None,
                    }])
                },
            )]
        }
    }
}
