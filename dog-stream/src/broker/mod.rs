pub mod memory;

#[cfg(feature = "redis")]
pub mod redis;

use async_trait::async_trait;
use futures_core::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::{
    types::{ChannelMessage, LogRecord, PendingEntry, PendingSummary, RecordId},
    StreamResult,
};

pub use memory::MemoryBroker;

#[cfg(feature = "redis")]
pub use self::redis::RedisBroker;

/// Type alias for boxed streams (stable Rust compatible)
pub type BoxStream<T> = Pin<Box<dyn Stream<Item = T> + Send + 'static>>;

/// One broker connection shared by the producer, every read loop and both jobs
pub type SharedBroker = Arc<dyn StreamBroker>;

/// Broker primitives the messaging layer is built on
///
/// Implementations must be safe for concurrent use by independent logical
/// operations; callers never serialize access.
#[async_trait]
pub trait StreamBroker: Send + Sync {
    /// Append a record to a stream, returning the broker-assigned id
    async fn append(&self, stream_key: &str, body: &str) -> StreamResult<RecordId>;

    /// Create a consumer group positioned at the end of the stream
    ///
    /// Creates the stream if needed. Returns `false` when the group already
    /// existed; that is not an error.
    async fn create_group(&self, stream_key: &str, group: &str) -> StreamResult<bool>;

    /// Read records never delivered to this group, waiting up to `block`
    ///
    /// Returned records become pending for `consumer` until acknowledged.
    async fn read_group(
        &self,
        stream_key: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> StreamResult<Vec<LogRecord>>;

    /// Acknowledge records for a group; unknown or already-acked ids are ignored
    async fn ack(&self, stream_key: &str, group: &str, ids: &[RecordId]) -> StreamResult<u64>;

    /// Pending-entry totals per consumer
    async fn pending_summary(&self, stream_key: &str, group: &str) -> StreamResult<PendingSummary>;

    /// Pending-entry details for one consumer, oldest first
    async fn pending_entries(
        &self,
        stream_key: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> StreamResult<Vec<PendingEntry>>;

    /// Read a single record by id; `None` if it was trimmed
    async fn read_record(&self, stream_key: &str, id: &RecordId) -> StreamResult<Option<LogRecord>>;

    /// Approximately trim a stream to `max_len`, returning how many records went
    async fn trim_approx(&self, stream_key: &str, max_len: usize) -> StreamResult<u64>;

    /// Number of records currently retained in a stream
    async fn stream_len(&self, stream_key: &str) -> StreamResult<u64>;

    /// Fire-and-forget publish; returns the number of subscribers reached
    async fn publish(&self, channel: &str, body: &str) -> StreamResult<u64>;

    /// Subscribe to a broadcast channel
    async fn subscribe(&self, channel: &str) -> StreamResult<BoxStream<ChannelMessage>>;

    /// Version string reported by the broker, if it reports one
    async fn server_version(&self) -> StreamResult<Option<String>>;
}
