//! Event store: durable, ordered, per-stream log with optimistic
//! concurrency.
//!
//! The store owns a [`DurableLog`] backend for persistence and a
//! [`Transport`] for republishing appended events. Appends to one stream
//! are linearized behind a per-stream mutex (single-writer-per-stream);
//! appends to different streams proceed concurrently. Events are
//! published only after durable persistence succeeds, so an observer can
//! never see an event the store could still roll back.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;

use crate::error::ValidationError;
use crate::event::{EventMessage, ProposedEvent};
use crate::storage::DurableLog;
use crate::transport::{Transport, EVENT_TOPIC};

/// Error returned by [`EventStore`] operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The stream's current version did not match the expected version.
    ///
    /// The caller must reload and retry; the stream was not mutated.
    #[error("concurrency conflict on stream '{stream_id}': expected version {expected}, found {current}")]
    Conflict {
        /// The contended stream.
        stream_id: String,
        /// The version the caller expected.
        expected: u64,
        /// The version the stream actually has.
        current: u64,
    },

    /// A proposed event failed validation; nothing was appended.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The log backend failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Event encoding or decoding failed.
    #[error("event codec failed: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Durable, ordered, per-aggregate-stream event log.
///
/// `Clone` is cheap: all internal state is `Arc`-wrapped and clones
/// share the same log, transport, and per-stream locks.
#[derive(Clone)]
pub struct EventStore {
    log: Arc<dyn DurableLog>,
    transport: Arc<dyn Transport>,
    // Per-stream append locks, created on first touch. The map lock is
    // held only long enough to fetch or insert the stream's entry.
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl std::fmt::Debug for EventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStore").finish_non_exhaustive()
    }
}

impl EventStore {
    /// Create a store over a log backend and a transport.
    pub fn new(log: Arc<dyn DurableLog>, transport: Arc<dyn Transport>) -> Self {
        Self {
            log,
            transport,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Append events to a stream, guarded by an expected version.
    ///
    /// `expected_version` is the version the caller observed before
    /// deciding to append; `0` means "the stream must not yet exist".
    /// On success the events receive contiguous versions starting at
    /// `expected_version + 1`, a store-assigned timestamp, and are
    /// published to the transport's event topic in append order, exactly
    /// once, after durable persistence.
    ///
    /// # Arguments
    ///
    /// * `stream_id` - The stream to append to.
    /// * `expected_version` - The stream version the caller observed.
    /// * `proposed` - Events to append, in order.
    ///
    /// # Returns
    ///
    /// The appended events with their assigned versions.
    ///
    /// # Errors
    ///
    /// * [`StoreError::Validation`] - an event has an empty type or a
    ///   null payload; nothing was appended.
    /// * [`StoreError::Conflict`] - the stream's current version is not
    ///   `expected_version`; nothing was appended.
    /// * [`StoreError::Io`] / [`StoreError::Codec`] - the log backend
    ///   failed.
    pub async fn append(
        &self,
        stream_id: &str,
        expected_version: u64,
        proposed: Vec<ProposedEvent>,
    ) -> Result<Vec<EventMessage>, StoreError> {
        for (index, event) in proposed.iter().enumerate() {
            event.validate(index)?;
        }

        let stream_lock = self.stream_lock(stream_id).await;
        let _guard = stream_lock.lock().await;

        let current = self.log.version(stream_id).await?;
        if current != expected_version {
            tracing::warn!(
                stream_id,
                expected = expected_version,
                current,
                "append rejected: version conflict"
            );
            return Err(StoreError::Conflict {
                stream_id: stream_id.to_owned(),
                expected: expected_version,
                current,
            });
        }

        let now = Utc::now();
        let events: Vec<EventMessage> = proposed
            .into_iter()
            .enumerate()
            .map(|(i, p)| EventMessage {
                stream_id: stream_id.to_owned(),
                event_type: p.event_type,
                payload: p.payload,
                version: expected_version + 1 + i as u64,
                timestamp: now,
                correlation_id: p.correlation_id,
                causation_id: p.causation_id,
            })
            .collect();

        self.log.append(stream_id, &events).await?;
        tracing::debug!(stream_id, count = events.len(), "events persisted");

        // Persist-then-publish, still under the stream lock so the
        // per-stream publication order matches the append order.
        for event in &events {
            let payload = serde_json::to_vec(event)?;
            if let Err(e) = self.transport.publish(EVENT_TOPIC, payload).await {
                // The events are durable; observers will see them on the
                // next catch-up read even though this publication was lost.
                tracing::error!(
                    stream_id,
                    version = event.version,
                    error = %e,
                    "event persisted but publication failed"
                );
            }
        }

        Ok(events)
    }

    /// Read events of a stream in ascending version order.
    ///
    /// # Arguments
    ///
    /// * `stream_id` - The stream to read.
    /// * `from_version` - First version to include (1 reads from the
    ///   start).
    /// * `to_version` - Last version to include (`u64::MAX` reads to the
    ///   end).
    ///
    /// # Returns
    ///
    /// The matching events; an empty vec (not an error) if the stream
    /// does not exist or the range is empty.
    pub async fn get_events(
        &self,
        stream_id: &str,
        from_version: u64,
        to_version: u64,
    ) -> Result<Vec<EventMessage>, StoreError> {
        self.log.read(stream_id, from_version, to_version).await
    }

    /// Current version of a stream; 0 if it does not exist.
    pub async fn current_version(&self, stream_id: &str) -> Result<u64, StoreError> {
        self.log.version(stream_id).await
    }

    /// Fetch or create the append lock for a stream.
    async fn stream_lock(&self, stream_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(stream_id.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
