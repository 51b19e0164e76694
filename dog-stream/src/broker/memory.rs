use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::{broadcast, Notify};
use tokio::time::Instant;
use tokio_stream::{wrappers::BroadcastStream, StreamExt};
use tracing::warn;

use crate::{
    broker::{BoxStream, StreamBroker},
    types::{ChannelMessage, ConsumerPending, LogRecord, PendingEntry, PendingSummary, RecordId},
    StreamError, StreamResult,
};

/// Records removed per approximate-trim step
pub const TRIM_NODE_SIZE: usize = 16;

const CHANNEL_CAPACITY: usize = 1024;
const DEFAULT_VERSION: &str = "7.2.4";
/// Upper bound for a blocking read; longer timeouts are clamped to it
const MAX_BLOCK: Duration = Duration::from_secs(60 * 60 * 24 * 365);

#[derive(Debug, Clone)]
struct PendingState {
    consumer: String,
    delivered_at: Instant,
    /// Extra idle time injected by tests
    idle_bias: Duration,
    delivery_count: u64,
}

#[derive(Debug, Default)]
struct GroupState {
    /// Last id handed out to this group
    cursor: (u64, u64),
    pending: BTreeMap<RecordId, PendingState>,
}

#[derive(Debug, Default)]
struct StreamState {
    records: VecDeque<(RecordId, String)>,
    last_id: (u64, u64),
    groups: HashMap<String, GroupState>,
}

impl StreamState {
    fn next_id(&mut self) -> RecordId {
        let now = Utc::now().timestamp_millis().max(0) as u64;
        let (last_ms, last_seq) = self.last_id;
        self.last_id = if now > last_ms { (now, 0) } else { (last_ms, last_seq + 1) };
        RecordId::new(self.last_id.0, self.last_id.1)
    }
}

/// In-process broker for tests, development and single-node deployments
///
/// Models consumer-group cursors, pending lists with idle times, approximate
/// trimming and broadcast channels. Clones share the same state.
#[derive(Clone)]
pub struct MemoryBroker {
    streams: Arc<RwLock<HashMap<String, StreamState>>>,
    channels: Arc<RwLock<HashMap<String, broadcast::Sender<ChannelMessage>>>>,
    appended: Arc<Notify>,
    version: Arc<RwLock<Option<String>>>,
    operations: Arc<AtomicU64>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            streams: Arc::new(RwLock::new(HashMap::new())),
            channels: Arc::new(RwLock::new(HashMap::new())),
            appended: Arc::new(Notify::new()),
            version: Arc::new(RwLock::new(Some(DEFAULT_VERSION.to_string()))),
            operations: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Report a different server version (`None` = version unknown)
    pub fn with_version(self, version: Option<&str>) -> Self {
        *self.version.write() = version.map(|v| v.to_string());
        self
    }

    fn touch(&self) {
        self.operations.fetch_add(1, Ordering::Relaxed);
    }

    /// Try a non-blocking group read
    fn read_available(
        &self,
        stream_key: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> StreamResult<Vec<LogRecord>> {
        let mut streams = self.streams.write();
        let state = streams
            .get_mut(stream_key)
            .ok_or_else(|| no_group(stream_key, group))?;
        let StreamState { records, groups, .. } = state;
        let group_state = groups
            .get_mut(group)
            .ok_or_else(|| no_group(stream_key, group))?;

        let now = Instant::now();
        let mut delivered = Vec::new();
        for (id, body) in records.iter() {
            if delivered.len() >= count {
                break;
            }
            let Some(parts) = id.parts() else { continue };
            if parts <= group_state.cursor {
                continue;
            }

            group_state.cursor = parts;
            group_state.pending.insert(
                id.clone(),
                PendingState {
                    consumer: consumer.to_string(),
                    delivered_at: now,
                    idle_bias: Duration::ZERO,
                    delivery_count: 1,
                },
            );
            delivered.push(LogRecord::new(id.clone(), stream_key, body.clone()));
        }

        Ok(delivered)
    }
}

fn no_group(stream_key: &str, group: &str) -> StreamError {
    StreamError::transport(format!(
        "NOGROUP No such key '{}' or consumer group '{}'",
        stream_key, group
    ))
}

#[async_trait]
impl StreamBroker for MemoryBroker {
    async fn append(&self, stream_key: &str, body: &str) -> StreamResult<RecordId> {
        self.touch();
        let id = {
            let mut streams = self.streams.write();
            let state = streams.entry(stream_key.to_string()).or_default();
            let id = state.next_id();
            state.records.push_back((id.clone(), body.to_string()));
            id
        };
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn create_group(&self, stream_key: &str, group: &str) -> StreamResult<bool> {
        self.touch();
        let mut streams = self.streams.write();
        let state = streams.entry(stream_key.to_string()).or_default();
        if state.groups.contains_key(group) {
            return Ok(false);
        }
        let cursor = state.last_id;
        state.groups.insert(
            group.to_string(),
            GroupState {
                cursor,
                pending: BTreeMap::new(),
            },
        );
        Ok(true)
    }

    async fn read_group(
        &self,
        stream_key: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> StreamResult<Vec<LogRecord>> {
        self.touch();
        let now = Instant::now();
        let deadline = now.checked_add(block).unwrap_or(now + MAX_BLOCK);

        loop {
            // Register interest before checking so an append in between is not missed
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let records = self.read_available(stream_key, group, consumer, count)?;
            if !records.is_empty() || block.is_zero() {
                return Ok(records);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, stream_key: &str, group: &str, ids: &[RecordId]) -> StreamResult<u64> {
        self.touch();
        let mut streams = self.streams.write();
        let Some(group_state) = streams
            .get_mut(stream_key)
            .and_then(|s| s.groups.get_mut(group))
        else {
            return Ok(0);
        };

        let removed = ids
            .iter()
            .filter(|id| group_state.pending.remove(*id).is_some())
            .count();
        Ok(removed as u64)
    }

    async fn pending_summary(&self, stream_key: &str, group: &str) -> StreamResult<PendingSummary> {
        self.touch();
        let streams = self.streams.read();
        let group_state = streams
            .get(stream_key)
            .and_then(|s| s.groups.get(group))
            .ok_or_else(|| no_group(stream_key, group))?;

        let mut per_consumer: BTreeMap<&str, u64> = BTreeMap::new();
        for state in group_state.pending.values() {
            *per_consumer.entry(state.consumer.as_str()).or_default() += 1;
        }

        Ok(PendingSummary {
            total: group_state.pending.len() as u64,
            consumers: per_consumer
                .into_iter()
                .map(|(name, pending)| ConsumerPending {
                    name: name.to_string(),
                    pending,
                })
                .collect(),
        })
    }

    async fn pending_entries(
        &self,
        stream_key: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> StreamResult<Vec<PendingEntry>> {
        self.touch();
        let streams = self.streams.read();
        let group_state = streams
            .get(stream_key)
            .and_then(|s| s.groups.get(group))
            .ok_or_else(|| no_group(stream_key, group))?;

        let now = Instant::now();
        Ok(group_state
            .pending
            .iter()
            .filter(|(_, state)| state.consumer == consumer)
            .take(count)
            .map(|(id, state)| PendingEntry {
                id: id.clone(),
                consumer: state.consumer.clone(),
                idle: now.saturating_duration_since(state.delivered_at) + state.idle_bias,
                delivery_count: state.delivery_count,
            })
            .collect())
    }

    async fn read_record(&self, stream_key: &str, id: &RecordId) -> StreamResult<Option<LogRecord>> {
        self.touch();
        let streams = self.streams.read();
        Ok(streams.get(stream_key).and_then(|state| {
            state
                .records
                .iter()
                .find(|(record_id, _)| record_id == id)
                .map(|(record_id, body)| LogRecord::new(record_id.clone(), stream_key, body.clone()))
        }))
    }

    async fn trim_approx(&self, stream_key: &str, max_len: usize) -> StreamResult<u64> {
        self.touch();
        let mut streams = self.streams.write();
        let Some(state) = streams.get_mut(stream_key) else {
            return Ok(0);
        };

        // Only whole nodes are dropped, so up to TRIM_NODE_SIZE - 1 extra records may remain
        let excess = state.records.len().saturating_sub(max_len);
        let removable = (excess / TRIM_NODE_SIZE) * TRIM_NODE_SIZE;
        state.records.drain(..removable);
        Ok(removable as u64)
    }

    async fn stream_len(&self, stream_key: &str) -> StreamResult<u64> {
        self.touch();
        let streams = self.streams.read();
        Ok(streams
            .get(stream_key)
            .map(|s| s.records.len() as u64)
            .unwrap_or(0))
    }

    async fn publish(&self, channel: &str, body: &str) -> StreamResult<u64> {
        self.touch();
        let channels = self.channels.read();
        let Some(sender) = channels.get(channel) else {
            return Ok(0);
        };

        let message = ChannelMessage {
            channel: channel.to_string(),
            body: body.to_string(),
        };
        // No receivers is not an error for fire-and-forget channels
        Ok(sender.send(message).unwrap_or(0) as u64)
    }

    async fn subscribe(&self, channel: &str) -> StreamResult<BoxStream<ChannelMessage>> {
        self.touch();
        let receiver = {
            let mut channels = self.channels.write();
            channels
                .entry(channel.to_string())
                .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
                .subscribe()
        };

        let channel = channel.to_string();
        let stream = BroadcastStream::new(receiver).filter_map(move |item| match item {
            Ok(message) => Some(message),
            Err(err) => {
                warn!(channel = %channel, "Broadcast subscriber lagged: {}", err);
                None
            }
        });
        Ok(Box::pin(stream))
    }

    async fn server_version(&self) -> StreamResult<Option<String>> {
        self.touch();
        Ok(self.version.read().clone())
    }
}

/// Test helpers for deterministic testing
impl MemoryBroker {
    /// Make a pending entry look idle for `idle` (test helper)
    pub fn age_pending(&self, stream_key: &str, group: &str, id: &RecordId, idle: Duration) -> bool {
        let mut streams = self.streams.write();
        let Some(state) = streams
            .get_mut(stream_key)
            .and_then(|s| s.groups.get_mut(group))
            .and_then(|g| g.pending.get_mut(id))
        else {
            return false;
        };
        state.delivered_at = Instant::now();
        state.idle_bias = idle;
        true
    }

    /// Make every pending entry of a group look idle for `idle` (test helper)
    pub fn age_all_pending(&self, stream_key: &str, group: &str, idle: Duration) -> usize {
        let mut streams = self.streams.write();
        let Some(group_state) = streams
            .get_mut(stream_key)
            .and_then(|s| s.groups.get_mut(group))
        else {
            return 0;
        };
        let now = Instant::now();
        for state in group_state.pending.values_mut() {
            state.delivered_at = now;
            state.idle_bias = idle;
        }
        group_state.pending.len()
    }

    /// All retained records of a stream, oldest first
    pub fn records(&self, stream_key: &str) -> Vec<LogRecord> {
        self.streams
            .read()
            .get(stream_key)
            .map(|state| {
                state
                    .records
                    .iter()
                    .map(|(id, body)| LogRecord::new(id.clone(), stream_key, body.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of consumer groups on a stream
    pub fn group_count(&self, stream_key: &str) -> usize {
        self.streams
            .read()
            .get(stream_key)
            .map(|s| s.groups.len())
            .unwrap_or(0)
    }

    /// Total broker operations served so far
    pub fn operation_count(&self) -> u64 {
        self.operations.load(Ordering::Relaxed)
    }
}
