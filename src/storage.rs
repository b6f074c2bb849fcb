//! Durable-log contract and built-in backends.
//!
//! The event store is written against [`DurableLog`], an abstract
//! append-only log keyed by stream id. Two reference backends ship with
//! the crate: [`MemoryLog`] for tests and single-process use, and
//! [`JsonlLog`], which keeps one append-only JSONL file per stream under
//! a base directory. A database-backed log implements the same trait.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::event::EventMessage;
use crate::store::StoreError;

/// Abstract append-only event log.
///
/// # Contract
///
/// - [`append`](DurableLog::append) persists the batch all-or-nothing;
///   a partially visible batch is a broken implementation.
/// - [`read`](DurableLog::read) returns events in ascending version
///   order; a missing stream reads as empty, never as an error.
/// - [`version`](DurableLog::version) is the version of the last event
///   in the stream, or 0 for a stream that does not exist.
///
/// The log does not check expected versions; optimistic concurrency is
/// enforced by the [`EventStore`](crate::store::EventStore), which
/// serializes appends per stream before calling in here.
#[async_trait]
pub trait DurableLog: Send + Sync {
    /// Persist a batch of events at the end of a stream.
    async fn append(&self, stream_id: &str, events: &[EventMessage]) -> Result<(), StoreError>;

    /// Read events with versions in `[from_version, to_version]`,
    /// ascending.
    async fn read(
        &self,
        stream_id: &str,
        from_version: u64,
        to_version: u64,
    ) -> Result<Vec<EventMessage>, StoreError>;

    /// Current version of the stream; 0 if it does not exist.
    async fn version(&self, stream_id: &str) -> Result<u64, StoreError>;
}

/// In-memory log backend.
///
/// Streams live in a `HashMap` behind an async `RwLock`. Suitable for
/// tests and for processes whose history fits in memory and does not
/// need to survive restarts.
#[derive(Debug, Default)]
pub struct MemoryLog {
    streams: RwLock<HashMap<String, Vec<EventMessage>>>,
}

impl MemoryLog {
    /// Create an empty in-memory log.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DurableLog for MemoryLog {
    async fn append(&self, stream_id: &str, events: &[EventMessage]) -> Result<(), StoreError> {
        let mut streams = self.streams.write().await;
        streams
            .entry(stream_id.to_owned())
            .or_default()
            .extend_from_slice(events);
        Ok(())
    }

    async fn read(
        &self,
        stream_id: &str,
        from_version: u64,
        to_version: u64,
    ) -> Result<Vec<EventMessage>, StoreError> {
        let streams = self.streams.read().await;
        Ok(streams
            .get(stream_id)
            .map(|events| {
                events
                    .iter()
                    .filter(|e| e.version >= from_version && e.version <= to_version)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn version(&self, stream_id: &str) -> Result<u64, StoreError> {
        let streams = self.streams.read().await;
        Ok(streams
            .get(stream_id)
            .and_then(|events| events.last())
            .map(|e| e.version)
            .unwrap_or(0))
    }
}

/// File-backed log: one append-only `.jsonl` file per stream.
///
/// The layout follows this structure:
/// ```text
/// <base_dir>/
///     streams/
///         <aggregate_type>/
///             <instance_id>.jsonl
/// ```
/// (one path segment per stream-id segment; each line is one
/// JSON-serialized [`EventMessage`]).
///
/// Stream ids come from registered aggregates, not from untrusted input,
/// so they are mapped onto the filesystem without further escaping.
#[derive(Debug, Clone)]
pub struct JsonlLog {
    base_dir: PathBuf,
}

impl JsonlLog {
    /// Create a log rooted at the given base directory.
    ///
    /// The directory does not need to exist yet; it is created lazily on
    /// first append.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Path of the JSONL file backing a stream.
    fn stream_path(&self, stream_id: &str) -> PathBuf {
        let mut path = self.base_dir.join("streams");
        let mut segments = stream_id.split('/').peekable();
        while let Some(segment) = segments.next() {
            if segments.peek().is_none() {
                path.push(format!("{segment}.jsonl"));
            } else {
                path.push(segment);
            }
        }
        path
    }

    /// Read and decode every event of a stream. Missing file reads as
    /// empty.
    fn read_all(&self, stream_id: &str) -> Result<Vec<EventMessage>, StoreError> {
        let path = self.stream_path(stream_id);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::Io(e)),
        };
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(StoreError::Codec))
            .collect()
    }
}

#[async_trait]
impl DurableLog for JsonlLog {
    async fn append(&self, stream_id: &str, events: &[EventMessage]) -> Result<(), StoreError> {
        if events.is_empty() {
            return Ok(());
        }
        let path = self.stream_path(stream_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        // Serialize the whole batch up front, then write it with a single
        // call, so a serialization failure never leaves a partial batch.
        let mut buf = String::new();
        for event in events {
            buf.push_str(&serde_json::to_string(event)?);
            buf.push('\n');
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(buf.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    async fn read(
        &self,
        stream_id: &str,
        from_version: u64,
        to_version: u64,
    ) -> Result<Vec<EventMessage>, StoreError> {
        let events = self.read_all(stream_id)?;
        Ok(events
            .into_iter()
            .filter(|e| e.version >= from_version && e.version <= to_version)
            .collect())
    }

    async fn version(&self, stream_id: &str) -> Result<u64, StoreError> {
        let events = self.read_all(stream_id)?;
        Ok(events.last().map(|e| e.version).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn event(stream_id: &str, version: u64) -> EventMessage {
        EventMessage {
            stream_id: stream_id.into(),
            event_type: "Incremented".into(),
            payload: serde_json::json!({}),
            version,
            timestamp: Utc::now(),
            correlation_id: None,
            causation_id: None,
        }
    }

    #[tokio::test]
    async fn memory_log_append_and_read_back() {
        let log = MemoryLog::new();
        log.append("counter/c-1", &[event("counter/c-1", 1), event("counter/c-1", 2)])
            .await
            .expect("append should succeed");

        let events = log
            .read("counter/c-1", 1, u64::MAX)
            .await
            .expect("read should succeed");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].version, 1);
        assert_eq!(events[1].version, 2);
    }

    #[tokio::test]
    async fn memory_log_missing_stream_reads_empty() {
        let log = MemoryLog::new();
        let events = log
            .read("counter/absent", 1, u64::MAX)
            .await
            .expect("read should succeed");
        assert!(events.is_empty());
        assert_eq!(log.version("counter/absent").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn memory_log_version_tracks_last_event() {
        let log = MemoryLog::new();
        log.append("s", &[event("s", 1)]).await.unwrap();
        assert_eq!(log.version("s").await.unwrap(), 1);
        log.append("s", &[event("s", 2), event("s", 3)]).await.unwrap();
        assert_eq!(log.version("s").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn memory_log_read_range() {
        let log = MemoryLog::new();
        log.append("s", &[event("s", 1), event("s", 2), event("s", 3)])
            .await
            .unwrap();

        let mid = log.read("s", 2, 2).await.unwrap();
        assert_eq!(mid.len(), 1);
        assert_eq!(mid[0].version, 2);

        let empty = log.read("s", 4, u64::MAX).await.unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn jsonl_log_append_and_read_back() {
        let tmp = tempfile::tempdir().expect("failed to create tmpdir");
        let log = JsonlLog::new(tmp.path());

        log.append("counter/c-1", &[event("counter/c-1", 1), event("counter/c-1", 2)])
            .await
            .expect("append should succeed");

        let events = log
            .read("counter/c-1", 1, u64::MAX)
            .await
            .expect("read should succeed");
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].version, 2);
        assert_eq!(log.version("counter/c-1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn jsonl_log_survives_reopen() {
        let tmp = tempfile::tempdir().expect("failed to create tmpdir");
        {
            let log = JsonlLog::new(tmp.path());
            log.append("order/o-1", &[event("order/o-1", 1)])
                .await
                .expect("append should succeed");
        }

        // A fresh instance over the same directory sees the history.
        let log = JsonlLog::new(tmp.path());
        let events = log.read("order/o-1", 1, u64::MAX).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(log.version("order/o-1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn jsonl_log_missing_stream_reads_empty() {
        let tmp = tempfile::tempdir().expect("failed to create tmpdir");
        let log = JsonlLog::new(tmp.path());
        let events = log.read("order/none", 1, u64::MAX).await.unwrap();
        assert!(events.is_empty());
        assert_eq!(log.version("order/none").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn jsonl_log_streams_are_isolated() {
        let tmp = tempfile::tempdir().expect("failed to create tmpdir");
        let log = JsonlLog::new(tmp.path());
        log.append("order/o-1", &[event("order/o-1", 1)]).await.unwrap();
        log.append("order/o-2", &[event("order/o-2", 1)]).await.unwrap();

        let o1 = log.read("order/o-1", 1, u64::MAX).await.unwrap();
        assert_eq!(o1.len(), 1);
        assert_eq!(o1[0].stream_id, "order/o-1");
    }
}
