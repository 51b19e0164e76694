use std::time::Duration;

use super::RecordId;

/// A record read back from a stream: broker id plus the stored wire text
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub id: RecordId,
    pub stream_key: String,
    /// Serialized envelope exactly as it was appended
    pub body: String,
}

impl LogRecord {
    pub fn new(id: RecordId, stream_key: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id,
            stream_key: stream_key.into(),
            body: body.into(),
        }
    }
}

/// A message received from a broadcast channel
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelMessage {
    pub channel: String,
    pub body: String,
}

/// Pending count for one consumer of a group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerPending {
    pub name: String,
    pub pending: u64,
}

/// Summary form of the pending-entries list of a group
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingSummary {
    pub total: u64,
    pub consumers: Vec<ConsumerPending>,
}

impl PendingSummary {
    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Pending count for one consumer (0 if it holds nothing)
    pub fn pending_for(&self, consumer: &str) -> u64 {
        self.consumers
            .iter()
            .find(|c| c.name == consumer)
            .map(|c| c.pending)
            .unwrap_or(0)
    }
}

/// A record delivered to a consumer but not yet acknowledged
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub id: RecordId,
    pub consumer: String,
    /// Time since the record was last delivered
    pub idle: Duration,
    pub delivery_count: u64,
}

impl PendingEntry {
    /// True once the entry has been idle for at least `threshold`
    pub fn is_expired(&self, threshold: Duration) -> bool {
        self.idle >= threshold
    }
}
