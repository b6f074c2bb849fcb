//! Composition root: wires the store, transport, routers, and saga
//! engine into a running application.
//!
//! [`AppBuilder`] collects registrations and validates everything up
//! front in [`build`](AppBuilder::build) (fail fast: a bad registration
//! means the process does not start). [`App::start`] then spawns the two
//! background pumps:
//!
//! - the command pump subscribes to the command topic, validates and
//!   dispatches each envelope;
//! - the event pump subscribes to the event topic, fans each event out
//!   to the event handlers, then to the saga engine, and publishes any
//!   follow-up commands back onto the command topic.
//!
//! A handler error aborts only that envelope's processing; the pumps
//! keep draining subsequent messages.

use std::io;
use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use uuid::Uuid;

use crate::aggregate::Aggregate;
use crate::command::CommandMessage;
use crate::dispatch::{
    AggregateCommandHandler, CommandHandler, CommandRouter, EventHandler, EventRouter,
};
use crate::error::{DispatchError, RegistrationError, TransportError};
use crate::event::EventMessage;
use crate::resolver::Resolver;
use crate::runtime::{AggregateRuntime, RetryConfig};
use crate::saga::{Saga, SagaEngine};
use crate::storage::{DurableLog, MemoryLog};
use crate::store::EventStore;
use crate::transport::{MemoryTransport, Subscription, Transport, COMMAND_TOPIC, EVENT_TOPIC};

/// Deferred registration of one aggregate type's command routes.
type AggregateFactory =
    Box<dyn FnOnce(&EventStore, &RetryConfig, &mut CommandRouter) -> Result<(), RegistrationError>>;

/// Deferred registration of one saga type.
type SagaFactory = Box<dyn FnOnce(&mut SagaEngine) -> Result<(), RegistrationError>>;

/// Builder for configuring and wiring an [`App`].
///
/// # Examples
///
/// ```no_run
/// use eventloom::AppBuilder;
///
/// # #[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
/// # struct Order;
/// # // (Aggregate impl elided)
/// # fn main() -> Result<(), eventloom::RegistrationError> {
/// let app = AppBuilder::new()
///     // .aggregate::<Order>()
///     // .saga::<Shipping>()
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct AppBuilder {
    log: Option<Arc<dyn DurableLog>>,
    transport: Option<Arc<dyn Transport>>,
    retry: RetryConfig,
    resolver: Resolver,
    aggregate_factories: Vec<AggregateFactory>,
    event_handlers: Vec<(Vec<String>, Arc<dyn EventHandler>)>,
    saga_factories: Vec<SagaFactory>,
}

impl AppBuilder {
    /// Create a builder with defaults: in-memory log, in-memory
    /// transport, default retry policy, nothing registered.
    pub fn new() -> Self {
        Self {
            log: None,
            transport: None,
            retry: RetryConfig::default(),
            resolver: Resolver::new(),
            aggregate_factories: Vec::new(),
            event_handlers: Vec::new(),
            saga_factories: Vec::new(),
        }
    }

    /// Use a specific durable-log backend. Defaults to [`MemoryLog`].
    pub fn log(mut self, log: Arc<dyn DurableLog>) -> Self {
        self.log = Some(log);
        self
    }

    /// Use a specific transport. Defaults to [`MemoryTransport`].
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Set the optimistic-concurrency retry policy for all aggregates.
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Register a dependency value for handlers and sagas to resolve at
    /// composition time.
    pub fn provide_value<T: Send + Sync + 'static>(
        mut self,
        token: impl Into<String>,
        value: T,
    ) -> Self {
        self.resolver.provide_value(token, value);
        self
    }

    /// Register an aggregate type.
    ///
    /// Routes every variant name of `A::Command` to a shared
    /// [`AggregateCommandHandler`] over this aggregate's runtime.
    pub fn aggregate<A: Aggregate>(mut self) -> Self {
        self.aggregate_factories.push(Box::new(|store, retry, router| {
            let runtime = AggregateRuntime::<A>::with_retry(store.clone(), retry.clone());
            let handler: Arc<dyn CommandHandler> =
                Arc::new(AggregateCommandHandler::new(runtime));
            for variant in <A::Command as strum::VariantNames>::VARIANTS {
                router.register(*variant, handler.clone())?;
            }
            Ok(())
        }));
        self
    }

    /// Register an event handler for a set of event types.
    pub fn event_handler(
        mut self,
        event_types: &[&str],
        handler: Arc<dyn EventHandler>,
    ) -> Self {
        self.event_handlers.push((
            event_types.iter().map(|t| (*t).to_owned()).collect(),
            handler,
        ));
        self
    }

    /// Register a saga type. Trigger bindings are validated in
    /// [`build`](AppBuilder::build).
    pub fn saga<S: Saga>(mut self) -> Self {
        self.saga_factories
            .push(Box::new(|engine| engine.register::<S>()));
        self
    }

    /// Validate every registration and wire the application.
    ///
    /// # Errors
    ///
    /// Any [`RegistrationError`] — duplicate command route, empty saga
    /// trigger set, failed dependency resolution — is fatal: the caller
    /// should not start the process.
    pub fn build(self) -> Result<App, RegistrationError> {
        let log = self.log.unwrap_or_else(|| Arc::new(MemoryLog::new()));
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(MemoryTransport::new()));
        let store = EventStore::new(log, transport.clone());

        let mut command_router = CommandRouter::new();
        for factory in self.aggregate_factories {
            factory(&store, &self.retry, &mut command_router)?;
        }

        let mut event_router = EventRouter::new();
        for (event_types, handler) in self.event_handlers {
            let types: Vec<&str> = event_types.iter().map(String::as_str).collect();
            event_router.register(&types, handler);
        }

        let mut saga_engine = SagaEngine::new();
        for factory in self.saga_factories {
            factory(&mut saga_engine)?;
        }

        Ok(App {
            store,
            transport,
            command_router: Arc::new(command_router),
            event_router: Arc::new(event_router),
            saga_engine: Arc::new(Mutex::new(saga_engine)),
            resolver: Arc::new(self.resolver),
            pumps: Arc::new(Mutex::new(None)),
        })
    }
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A wired application: store, routers, saga engine, and the pumps that
/// connect them through the transport.
///
/// `Clone` is cheap: all internal state is `Arc`-wrapped.
#[derive(Clone)]
pub struct App {
    store: EventStore,
    transport: Arc<dyn Transport>,
    command_router: Arc<CommandRouter>,
    event_router: Arc<EventRouter>,
    saga_engine: Arc<Mutex<SagaEngine>>,
    resolver: Arc<Resolver>,
    // Set once start() has spawned the pumps; guards double-start.
    pumps: Arc<Mutex<Option<AppHandle>>>,
}

impl App {
    /// The application's event store.
    pub fn store(&self) -> &EventStore {
        &self.store
    }

    /// The application's dependency resolver.
    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    /// Validate and dispatch a command locally, returning the events it
    /// appended.
    ///
    /// A command without a correlation id is assigned a fresh one at
    /// ingress, so every event it produces — and every saga instance it
    /// touches — shares a workflow key.
    ///
    /// # Errors
    ///
    /// See [`CommandRouter::dispatch`].
    pub async fn submit(
        &self,
        command: CommandMessage,
    ) -> Result<Vec<EventMessage>, DispatchError> {
        self.command_router.dispatch(correlated(command)).await
    }

    /// Publish a command onto the transport's command topic instead of
    /// dispatching locally. The command pump of whichever process is
    /// subscribed will pick it up.
    ///
    /// # Errors
    ///
    /// [`TransportError`] if encoding or publication fails.
    pub async fn publish_command(&self, command: CommandMessage) -> Result<(), TransportError> {
        let payload = serde_json::to_vec(&correlated(command))?;
        self.transport.publish(COMMAND_TOPIC, payload).await
    }

    /// Start the command and event pumps in the background.
    ///
    /// Can only be called once per `App`; a second call returns
    /// [`io::ErrorKind::AlreadyExists`] without spawning more pumps.
    ///
    /// # Returns
    ///
    /// An [`AppHandle`] for shutting the pumps down.
    pub async fn start(&self) -> io::Result<AppHandle> {
        let mut guard = self.pumps.lock().await;
        if guard.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "application pumps already started",
            ));
        }

        let command_sub = self
            .transport
            .subscribe(COMMAND_TOPIC)
            .await
            .map_err(io::Error::other)?;
        let event_sub = self
            .transport
            .subscribe(EVENT_TOPIC)
            .await
            .map_err(io::Error::other)?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let command_task = tokio::spawn(command_pump(
            self.command_router.clone(),
            command_sub,
            shutdown_rx.clone(),
        ));
        let event_task = tokio::spawn(event_pump(
            self.event_router.clone(),
            self.saga_engine.clone(),
            self.transport.clone(),
            event_sub,
            shutdown_rx,
        ));

        let handle = AppHandle {
            shutdown_tx,
            tasks: Arc::new(Mutex::new(vec![command_task, event_task])),
        };
        *guard = Some(handle.clone());
        Ok(handle)
    }
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App").finish_non_exhaustive()
    }
}

/// Assign a fresh correlation id if the envelope has none.
fn correlated(mut command: CommandMessage) -> CommandMessage {
    if command.correlation_id.is_none() {
        command.correlation_id = Some(Uuid::new_v4().to_string());
    }
    command
}

/// Handle for controlling the running pumps.
///
/// `Clone` is cheap: all fields are `Arc`-wrapped. Dropping the handle
/// does **not** stop the pumps — call [`shutdown`](AppHandle::shutdown)
/// for graceful termination.
#[derive(Clone, Debug)]
pub struct AppHandle {
    shutdown_tx: watch::Sender<bool>,
    tasks: Arc<Mutex<Vec<tokio::task::JoinHandle<()>>>>,
}

impl AppHandle {
    /// Signal both pumps to stop and wait for them to finish their
    /// in-flight message.
    ///
    /// Calling `shutdown` more than once is safe; subsequent calls
    /// return immediately.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "pump task panicked");
            }
        }
    }
}

/// Drain the command topic: decode, validate, dispatch.
///
/// A malformed or failing envelope aborts only itself; the pump
/// continues with the next message.
async fn command_pump(
    router: Arc<CommandRouter>,
    mut sub: Subscription,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            received = sub.recv() => {
                let Some(payload) = received else { break };
                let command: CommandMessage = match serde_json::from_slice(&payload) {
                    Ok(command) => command,
                    Err(e) => {
                        tracing::error!(error = %e, "dropping undecodable command envelope");
                        continue;
                    }
                };
                let command_type = command.command_type.clone();
                if let Err(e) = router.dispatch(command).await {
                    tracing::warn!(
                        command_type = %command_type,
                        error = %e,
                        "command dispatch failed"
                    );
                }
            }
        }
    }
    tracing::debug!("command pump stopped");
}

/// Drain the event topic: broadcast to event handlers, deliver to
/// sagas, publish follow-up commands.
async fn event_pump(
    event_router: Arc<EventRouter>,
    saga_engine: Arc<Mutex<SagaEngine>>,
    transport: Arc<dyn Transport>,
    mut sub: Subscription,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            received = sub.recv() => {
                let Some(payload) = received else { break };
                let event: EventMessage = match serde_json::from_slice(&payload) {
                    Ok(event) => event,
                    Err(e) => {
                        tracing::error!(error = %e, "dropping undecodable event envelope");
                        continue;
                    }
                };

                event_router.dispatch(&event).await;

                let follow_ups = saga_engine.lock().await.deliver(&event);
                for command in follow_ups {
                    match serde_json::to_vec(&command) {
                        Ok(bytes) => {
                            if let Err(e) = transport.publish(COMMAND_TOPIC, bytes).await {
                                tracing::error!(
                                    command_type = %command.command_type,
                                    error = %e,
                                    "failed to publish saga follow-up command"
                                );
                            }
                        }
                        Err(e) => {
                            tracing::error!(
                                command_type = %command.command_type,
                                error = %e,
                                "failed to encode saga follow-up command"
                            );
                        }
                    }
                }
            }
        }
    }
    tracing::debug!("event pump stopped");
}
