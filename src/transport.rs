//! Transport capability: topic-based publish/subscribe between
//! components.
//!
//! The framework's own traffic runs over two well-known topics:
//! [`COMMAND_TOPIC`] for inbound command envelopes and [`EVENT_TOPIC`]
//! for events republished by the store. Delivery is at-least-once and
//! ordering is preserved only within a single topic; a networked
//! implementation (e.g. a NATS client) implements the same trait.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::error::TransportError;

/// Topic carrying serialized [`CommandMessage`](crate::CommandMessage)
/// envelopes.
pub const COMMAND_TOPIC: &str = "commands";

/// Topic carrying serialized [`EventMessage`](crate::EventMessage)
/// envelopes, published by the store after durable persistence.
pub const EVENT_TOPIC: &str = "events";

/// Publish/subscribe primitive the rest of the framework builds on.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Publish a raw envelope to a topic.
    ///
    /// Publishing to a topic with no subscribers is not an error; the
    /// envelope is simply dropped.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Open a subscription to a topic.
    ///
    /// Each subscription receives its own copy of every envelope
    /// published after the subscription was opened.
    async fn subscribe(&self, topic: &str) -> Result<Subscription, TransportError>;
}

/// Receiving end of a topic subscription.
#[derive(Debug)]
pub struct Subscription {
    receiver: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl Subscription {
    /// Wait for the next envelope.
    ///
    /// Returns `None` once the transport side has shut down and the
    /// buffered envelopes are drained.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.receiver.recv().await
    }
}

/// In-process transport backed by per-topic unbounded channels.
///
/// Publication fans out to every live subscriber in subscription order;
/// subscribers whose receiving end has been dropped are pruned on the
/// next publish.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    topics: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Vec<u8>>>>>,
}

impl MemoryTransport {
    /// Create a transport with no topics or subscribers.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        let mut topics = self.topics.lock().await;
        if let Some(senders) = topics.get_mut(topic) {
            senders.retain(|sender| sender.send(payload.clone()).is_ok());
        }
        tracing::debug!(topic, bytes = payload.len(), "published envelope");
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut topics = self.topics.lock().await;
        topics.entry(topic.to_owned()).or_default().push(tx);
        tracing::debug!(topic, "opened subscription");
        Ok(Subscription { receiver: rx })
    }
}
