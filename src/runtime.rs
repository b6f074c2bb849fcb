//! Aggregate runtime: bridges commands to event production with
//! consistency guarantees.
//!
//! The load-handle-append cycle is the unit of atomicity. Each
//! [`execute`](AggregateRuntime::execute) call replays the aggregate's
//! stream to current state, runs the pure command handler, and appends
//! the produced events guarded by the version it observed. On a version
//! conflict the whole cycle is retried, a bounded number of times, then
//! the conflict surfaces to the caller. A conflict is never silently
//! swallowed or merged.

use std::marker::PhantomData;

use crate::aggregate::Aggregate;
use crate::command::CommandContext;
use crate::error::ExecuteError;
use crate::event::{decode_domain_event, encode_domain_event, stream_id, EventMessage};
use crate::store::{EventStore, StoreError};

/// Retry policy for the optimistic-concurrency loop.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retries after the initial attempt. With the
    /// default of 3 a command gets four attempts before the conflict
    /// surfaces.
    pub max_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_retries: 3 }
    }
}

/// Replay a stream's events into aggregate state.
///
/// Deterministic and pure: no I/O, no clock, no randomness. An event
/// that fails to decode is corrupted history and fails the whole load;
/// it is never skipped.
fn replay<A: Aggregate>(
    stream: &str,
    events: &[EventMessage],
) -> Result<A, ExecuteError<A::Error>> {
    let mut state = A::default();
    for event in events {
        let domain_event =
            decode_domain_event::<A>(event).map_err(|source| ExecuteError::Replay {
                stream_id: stream.to_owned(),
                version: event.version,
                source,
            })?;
        state = state.apply(&domain_event);
    }
    Ok(state)
}

/// Executes commands against one aggregate type.
///
/// Stateless apart from its configuration: all durable state lives in
/// the [`EventStore`], so runtimes are cheap to create and clone.
pub struct AggregateRuntime<A: Aggregate> {
    store: EventStore,
    retry: RetryConfig,
    _marker: PhantomData<A>,
}

impl<A: Aggregate> Clone for AggregateRuntime<A> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            retry: self.retry.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A: Aggregate> AggregateRuntime<A> {
    /// Create a runtime with the default retry policy.
    pub fn new(store: EventStore) -> Self {
        Self::with_retry(store, RetryConfig::default())
    }

    /// Create a runtime with an explicit retry policy.
    pub fn with_retry(store: EventStore, retry: RetryConfig) -> Self {
        Self {
            store,
            retry,
            _marker: PhantomData,
        }
    }

    /// The stream id for an instance of this aggregate type.
    pub fn stream_id(instance_id: &str) -> String {
        stream_id(A::AGGREGATE_TYPE, instance_id)
    }

    /// Load an aggregate instance's current state and version.
    ///
    /// Replays the full stream through [`Aggregate::apply`]; a missing
    /// stream loads as `(A::default(), 0)`.
    ///
    /// # Errors
    ///
    /// * [`ExecuteError::Replay`] - an event in the stream failed to
    ///   decode (corrupted history; fatal, not retried).
    /// * [`ExecuteError::Store`] - the store failed to read.
    pub async fn load(&self, instance_id: &str) -> Result<(A, u64), ExecuteError<A::Error>> {
        let stream = Self::stream_id(instance_id);
        let events = self
            .store
            .get_events(&stream, 1, u64::MAX)
            .await
            .map_err(ExecuteError::Store)?;
        let version = events.last().map(|e| e.version).unwrap_or(0);
        let state = replay::<A>(&stream, &events)?;
        Ok((state, version))
    }

    /// Execute a command: load, handle, append.
    ///
    /// Runs the full cycle described in the module docs. Zero produced
    /// events mean the command was a no-op; nothing is appended and an
    /// empty vec is returned.
    ///
    /// # Arguments
    ///
    /// * `instance_id` - The aggregate instance to execute against.
    /// * `cmd` - The domain command.
    /// * `ctx` - Correlation/causation metadata stamped onto produced
    ///   events, plus the caller's optional version pin.
    ///
    /// # Returns
    ///
    /// The appended events, with store-assigned versions.
    ///
    /// # Errors
    ///
    /// * [`ExecuteError::Domain`] - the aggregate rejected the command;
    ///   the stream is unchanged.
    /// * [`ExecuteError::Conflict`] - retries exhausted, or the context
    ///   pinned an expected version the stream has moved past.
    /// * [`ExecuteError::Replay`] - corrupted history during load.
    /// * [`ExecuteError::Store`] - the store failed.
    pub async fn execute(
        &self,
        instance_id: &str,
        cmd: A::Command,
        ctx: CommandContext,
    ) -> Result<Vec<EventMessage>, ExecuteError<A::Error>> {
        let stream = Self::stream_id(instance_id);
        let mut attempt: u32 = 0;
        loop {
            let (state, version) = self.load(instance_id).await?;

            // A caller-pinned version cannot be satisfied by reloading,
            // so a mismatch conflicts without burning retries.
            if let Some(pinned) = ctx.expected_version {
                if pinned != version {
                    tracing::warn!(
                        stream_id = %stream,
                        pinned,
                        current = version,
                        "pinned expected version does not match stream"
                    );
                    return Err(ExecuteError::Conflict { stream_id: stream });
                }
            }

            // The handler itself is synchronous and pure; the span guard
            // is dropped before the next suspension point.
            let domain_events = {
                let _span = tracing::info_span!(
                    "execute",
                    aggregate_type = A::AGGREGATE_TYPE,
                    instance_id
                )
                .entered();
                state.handle(cmd.clone())
            }
            .map_err(ExecuteError::Domain)?;
            if domain_events.is_empty() {
                return Ok(Vec::new());
            }

            let proposed = domain_events
                .iter()
                .map(|event| encode_domain_event::<A>(event, &ctx))
                .collect::<serde_json::Result<Vec<_>>>()
                .map_err(|e| ExecuteError::Store(StoreError::Codec(e)))?;

            match self.store.append(&stream, version, proposed).await {
                Ok(appended) => {
                    tracing::debug!(
                        stream_id = %stream,
                        count = appended.len(),
                        "events appended"
                    );
                    return Ok(appended);
                }
                Err(StoreError::Conflict {
                    expected, current, ..
                }) => {
                    attempt += 1;
                    if attempt > self.retry.max_retries {
                        tracing::warn!(
                            stream_id = %stream,
                            attempts = attempt,
                            "concurrency conflict: retries exhausted"
                        );
                        return Err(ExecuteError::Conflict { stream_id: stream });
                    }
                    tracing::warn!(
                        stream_id = %stream,
                        attempt,
                        expected,
                        current,
                        "concurrency conflict, reloading and retrying"
                    );
                }
                Err(e) => return Err(ExecuteError::Store(e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;

    use super::*;
    use crate::aggregate::test_fixtures::{Counter, CounterCommand, CounterError};
    use crate::storage::{DurableLog, MemoryLog};
    use crate::transport::MemoryTransport;

    fn test_store() -> EventStore {
        EventStore::new(Arc::new(MemoryLog::new()), Arc::new(MemoryTransport::new()))
    }

    #[tokio::test]
    async fn execute_appends_and_returns_events() {
        let runtime = AggregateRuntime::<Counter>::new(test_store());

        let events = runtime
            .execute("c-1", CounterCommand::Increment, CommandContext::default())
            .await
            .expect("execute should succeed");

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "Incremented");
        assert_eq!(events[0].version, 1);
        assert_eq!(events[0].stream_id, "counter/c-1");
    }

    #[tokio::test]
    async fn state_is_replayed_from_history() {
        let runtime = AggregateRuntime::<Counter>::new(test_store());
        let ctx = CommandContext::default();

        runtime
            .execute("c-1", CounterCommand::Increment, ctx.clone())
            .await
            .expect("increment should succeed");
        runtime
            .execute("c-1", CounterCommand::Add { amount: 10 }, ctx)
            .await
            .expect("add should succeed");

        let (state, version) = runtime.load("c-1").await.expect("load should succeed");
        assert_eq!(state.value, 11);
        assert_eq!(version, 2);
    }

    #[tokio::test]
    async fn replay_is_deterministic_across_runtimes() {
        let store = test_store();
        let runtime = AggregateRuntime::<Counter>::new(store.clone());
        let ctx = CommandContext::default();

        for _ in 0..3 {
            runtime
                .execute("c-1", CounterCommand::Increment, ctx.clone())
                .await
                .expect("execute should succeed");
        }
        let (state_here, _) = runtime.load("c-1").await.expect("load should succeed");

        // A fresh runtime over the same store must fold to the same state.
        let other = AggregateRuntime::<Counter>::new(store);
        let (state_there, _) = other.load("c-1").await.expect("load should succeed");
        assert_eq!(state_here, state_there);
        assert_eq!(state_there.value, 3);
    }

    #[tokio::test]
    async fn domain_error_surfaces_and_appends_nothing() {
        let store = test_store();
        let runtime = AggregateRuntime::<Counter>::new(store.clone());

        let result = runtime
            .execute("c-1", CounterCommand::Decrement, CommandContext::default())
            .await;

        assert!(
            matches!(result, Err(ExecuteError::Domain(CounterError::AlreadyZero))),
            "expected Domain(AlreadyZero), got: {result:?}"
        );
        assert_eq!(store.current_version("counter/c-1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn corrupted_history_fails_the_load() {
        let store = test_store();

        // Plant an event that does not decode as a CounterEvent.
        store
            .append(
                "counter/c-1",
                0,
                vec![crate::event::ProposedEvent {
                    event_type: "NotACounterEvent".into(),
                    payload: json!({}),
                    correlation_id: None,
                    causation_id: None,
                }],
            )
            .await
            .expect("raw append should succeed");

        let runtime = AggregateRuntime::<Counter>::new(store);
        let err = runtime.load("c-1").await.expect_err("load should fail");
        assert!(
            matches!(err, ExecuteError::Replay { version: 1, .. }),
            "expected Replay, got: {err:?}"
        );
    }

    #[tokio::test]
    async fn pinned_expected_version_conflicts_without_retry() {
        let runtime = AggregateRuntime::<Counter>::new(test_store());
        let ctx = CommandContext::default();
        runtime
            .execute("c-1", CounterCommand::Increment, ctx.clone())
            .await
            .expect("setup increment should succeed");

        // The stream is at version 1; pin version 3.
        let result = runtime
            .execute(
                "c-1",
                CounterCommand::Increment,
                ctx.with_expected_version(3),
            )
            .await;
        assert!(matches!(result, Err(ExecuteError::Conflict { .. })));
    }

    /// Log decorator that simulates a concurrent writer: each read also
    /// sneaks an extra event into the underlying log, so the version the
    /// runtime observed is stale by the time it appends.
    struct ContendedLog {
        inner: MemoryLog,
        /// How many more reads should trigger a sneak append.
        remaining_sneaks: AtomicU32,
    }

    impl ContendedLog {
        fn new(sneaks: u32) -> Self {
            Self {
                inner: MemoryLog::new(),
                remaining_sneaks: AtomicU32::new(sneaks),
            }
        }
    }

    #[async_trait]
    impl DurableLog for ContendedLog {
        async fn append(
            &self,
            stream_id: &str,
            events: &[EventMessage],
        ) -> Result<(), StoreError> {
            self.inner.append(stream_id, events).await
        }

        async fn read(
            &self,
            stream_id: &str,
            from_version: u64,
            to_version: u64,
        ) -> Result<Vec<EventMessage>, StoreError> {
            let events = self.inner.read(stream_id, from_version, to_version).await?;
            let sneaks = self.remaining_sneaks.load(Ordering::SeqCst);
            if sneaks > 0
                && self
                    .remaining_sneaks
                    .compare_exchange(sneaks, sneaks - 1, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
            {
                let version = self.inner.version(stream_id).await? + 1;
                let rival = EventMessage {
                    stream_id: stream_id.to_owned(),
                    event_type: "Incremented".into(),
                    payload: json!({}),
                    version,
                    timestamp: Utc::now(),
                    correlation_id: None,
                    causation_id: None,
                };
                self.inner.append(stream_id, &[rival]).await?;
            }
            Ok(events)
        }

        async fn version(&self, stream_id: &str) -> Result<u64, StoreError> {
            self.inner.version(stream_id).await
        }
    }

    #[tokio::test]
    async fn transient_conflict_is_retried_to_success() {
        // One sneak: the first attempt conflicts, the retry lands.
        let log = Arc::new(ContendedLog::new(1));
        let store = EventStore::new(log, Arc::new(MemoryTransport::new()));
        let runtime = AggregateRuntime::<Counter>::new(store.clone());

        let events = runtime
            .execute("c-1", CounterCommand::Increment, CommandContext::default())
            .await
            .expect("retry should recover from a transient conflict");

        // The rival's event took version 1; ours landed at 2.
        assert_eq!(events[0].version, 2);
        assert_eq!(store.current_version("counter/c-1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn persistent_conflict_exhausts_retries() {
        // More sneaks than attempts: every reload is stale again.
        let log = Arc::new(ContendedLog::new(u32::MAX));
        let store = EventStore::new(log, Arc::new(MemoryTransport::new()));
        let runtime = AggregateRuntime::<Counter>::with_retry(
            store,
            RetryConfig { max_retries: 2 },
        );

        let result = runtime
            .execute("c-1", CounterCommand::Increment, CommandContext::default())
            .await;
        assert!(
            matches!(result, Err(ExecuteError::Conflict { .. })),
            "expected Conflict after exhausting retries, got: {result:?}"
        );
    }

    #[tokio::test]
    async fn events_carry_context_correlation() {
        let runtime = AggregateRuntime::<Counter>::new(test_store());
        let ctx = CommandContext::default()
            .with_correlation_id("corr-1")
            .with_causation_id("cause-1");

        let events = runtime
            .execute("c-1", CounterCommand::Increment, ctx)
            .await
            .expect("execute should succeed");

        assert_eq!(events[0].correlation_id.as_deref(), Some("corr-1"));
        assert_eq!(events[0].causation_id.as_deref(), Some("cause-1"));
    }
}
