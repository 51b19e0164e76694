use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::streams::{
    StreamId, StreamMaxlen, StreamPendingCountReply, StreamPendingReply, StreamRangeReply,
    StreamReadOptions, StreamReadReply,
};
use redis::{AsyncCommands, Client, InfoDict, RedisError};
use tracing::{debug, warn};

use crate::{
    broker::{BoxStream, StreamBroker},
    types::{ChannelMessage, ConsumerPending, LogRecord, PendingEntry, PendingSummary, RecordId},
    StreamResult,
};

/// Field name the serialized envelope is stored under in each stream entry
pub const BODY_FIELD: &str = "payload";

/// Redis Streams + Pub/Sub broker
///
/// Non-blocking commands share one auto-reconnecting connection. Blocking
/// group reads get a dedicated connection per `(stream, group, consumer)` so a
/// parked `XREADGROUP` never stalls publishes or acknowledgments.
pub struct RedisBroker {
    client: Client,
    conn: ConnectionManager,
    readers: ReaderPool<MultiplexedConnection>,
}

/// Dedicated reader connections keyed by `stream|group|consumer`
///
/// A multiplexed connection never reconnects on its own, so a reader that hit
/// a connection-level error is evicted and the next read dials a fresh one.
struct ReaderPool<C> {
    conns: Mutex<HashMap<String, C>>,
}

impl<C: Clone> ReaderPool<C> {
    fn new() -> Self {
        Self {
            conns: Mutex::new(HashMap::new()),
        }
    }

    fn get(&self, key: &str) -> Option<C> {
        self.conns.lock().get(key).cloned()
    }

    fn insert(&self, key: &str, conn: C) {
        self.conns.lock().insert(key.to_string(), conn);
    }

    fn evict(&self, key: &str) -> bool {
        self.conns.lock().remove(key).is_some()
    }

    fn len(&self) -> usize {
        self.conns.lock().len()
    }
}

/// Errors after which a connection cannot be trusted for further commands
fn is_connection_error(err: &RedisError) -> bool {
    err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout()
}

impl RedisBroker {
    /// Connect to a Redis server, e.g. `redis://127.0.0.1:6379`
    pub async fn connect(url: &str) -> StreamResult<Self> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        debug!("Connected to redis broker at {}", url);
        Ok(Self {
            client,
            conn,
            readers: ReaderPool::new(),
        })
    }

    async fn reader(&self, key: &str) -> StreamResult<MultiplexedConnection> {
        if let Some(conn) = self.readers.get(key) {
            return Ok(conn);
        }
        let conn = self.client.get_multiplexed_async_connection().await?;
        self.readers.insert(key, conn.clone());
        debug!(reader = %key, open_readers = self.readers.len(), "Opened reader connection");
        Ok(conn)
    }

    fn to_record(stream_key: &str, entry: StreamId) -> LogRecord {
        let body = entry.get::<String>(BODY_FIELD).unwrap_or_else(|| {
            warn!(stream = %stream_key, record_id = %entry.id, "Stream entry has no '{}' field", BODY_FIELD);
            String::new()
        });
        LogRecord::new(RecordId::from(entry.id), stream_key, body)
    }
}

#[async_trait]
impl StreamBroker for RedisBroker {
    async fn append(&self, stream_key: &str, body: &str) -> StreamResult<RecordId> {
        let mut conn = self.conn.clone();
        let id: String = conn.xadd(stream_key, "*", &[(BODY_FIELD, body)]).await?;
        Ok(RecordId::from(id))
    }

    async fn create_group(&self, stream_key: &str, group: &str) -> StreamResult<bool> {
        let mut conn = self.conn.clone();
        let created: redis::RedisResult<()> = conn.xgroup_create_mkstream(stream_key, group, "$").await;
        match created {
            Ok(()) => Ok(true),
            Err(err) if err.code() == Some("BUSYGROUP") => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn read_group(
        &self,
        stream_key: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> StreamResult<Vec<LogRecord>> {
        let reader_key = format!("{}|{}|{}", stream_key, group, consumer);
        let mut conn = self.reader(&reader_key).await?;

        let mut options = StreamReadOptions::default().group(group, consumer).count(count);
        if !block.is_zero() {
            options = options.block(block.as_millis() as usize);
        }

        let reply: Option<StreamReadReply> = match conn.xread_options(&[stream_key], &[">"], &options).await {
            Ok(reply) => reply,
            Err(err) => {
                if is_connection_error(&err) && self.readers.evict(&reader_key) {
                    warn!(reader = %reader_key, "Dropped broken reader connection: {}", err);
                }
                return Err(err.into());
            }
        };

        Ok(reply
            .map(|reply| {
                reply
                    .keys
                    .into_iter()
                    .flat_map(|key| key.ids)
                    .map(|entry| Self::to_record(stream_key, entry))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn ack(&self, stream_key: &str, group: &str, ids: &[RecordId]) -> StreamResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let ids: Vec<&str> = ids.iter().map(|id| id.as_str()).collect();
        let acked: u64 = conn.xack(stream_key, group, &ids).await?;
        Ok(acked)
    }

    async fn pending_summary(&self, stream_key: &str, group: &str) -> StreamResult<PendingSummary> {
        let mut conn = self.conn.clone();
        let reply: StreamPendingReply = conn.xpending(stream_key, group).await?;
        Ok(match reply {
            StreamPendingReply::Empty => PendingSummary::default(),
            StreamPendingReply::Data(data) => PendingSummary {
                total: data.count as u64,
                consumers: data
                    .consumers
                    .into_iter()
                    .map(|c| ConsumerPending {
                        name: c.name,
                        pending: c.pending as u64,
                    })
                    .collect(),
            },
        })
    }

    async fn pending_entries(
        &self,
        stream_key: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> StreamResult<Vec<PendingEntry>> {
        let mut conn = self.conn.clone();
        let reply: StreamPendingCountReply = conn
            .xpending_consumer_count(stream_key, group, "-", "+", count, consumer)
            .await?;

        Ok(reply
            .ids
            .into_iter()
            .map(|p| PendingEntry {
                id: RecordId::from(p.id),
                consumer: p.consumer,
                idle: Duration::from_millis(p.last_delivered_ms as u64),
                delivery_count: p.times_delivered as u64,
            })
            .collect())
    }

    async fn read_record(&self, stream_key: &str, id: &RecordId) -> StreamResult<Option<LogRecord>> {
        let mut conn = self.conn.clone();
        let reply: StreamRangeReply = conn.xrange(stream_key, id.as_str(), id.as_str()).await?;
        Ok(reply
            .ids
            .into_iter()
            .next()
            .map(|entry| Self::to_record(stream_key, entry)))
    }

    async fn trim_approx(&self, stream_key: &str, max_len: usize) -> StreamResult<u64> {
        let mut conn = self.conn.clone();
        let removed: u64 = conn.xtrim(stream_key, StreamMaxlen::Approx(max_len)).await?;
        Ok(removed)
    }

    async fn stream_len(&self, stream_key: &str) -> StreamResult<u64> {
        let mut conn = self.conn.clone();
        let len: u64 = conn.xlen(stream_key).await?;
        Ok(len)
    }

    async fn publish(&self, channel: &str, body: &str) -> StreamResult<u64> {
        let mut conn = self.conn.clone();
        let receivers: u64 = conn.publish(channel, body).await?;
        Ok(receivers)
    }

    async fn subscribe(&self, channel: &str) -> StreamResult<BoxStream<ChannelMessage>> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let channel = msg.get_channel_name().to_string();
            match msg.get_payload::<String>() {
                Ok(body) => Some(ChannelMessage { channel, body }),
                Err(err) => {
                    warn!(channel = %channel, "Dropping non-text channel message: {}", err);
                    None
                }
            }
        });
        Ok(Box::pin(stream))
    }

    async fn server_version(&self) -> StreamResult<Option<String>> {
        let mut conn = self.conn.clone();
        let info: InfoDict = redis::cmd("INFO").arg("server").query_async(&mut conn).await?;
        Ok(info.get::<String>("redis_version"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redis::ErrorKind;
    use std::io;

    #[test]
    fn test_evicted_reader_is_not_reused() {
        let pool = ReaderPool::new();
        pool.insert("orders|svc-a|node-1", 1u32);
        pool.insert("orders|svc-b|node-1", 2u32);

        assert!(pool.evict("orders|svc-a|node-1"));
        assert!(!pool.evict("orders|svc-a|node-1"));
        assert_eq!(pool.get("orders|svc-a|node-1"), None);
        assert_eq!(pool.get("orders|svc-b|node-1"), Some(2));

        pool.insert("orders|svc-a|node-1", 3u32);
        assert_eq!(pool.get("orders|svc-a|node-1"), Some(3));
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_dropped_connection_is_a_connection_error() {
        let reset = RedisError::from(io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer"));
        assert!(is_connection_error(&reset));

        let broken = RedisError::from(io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe"));
        assert!(is_connection_error(&broken));
    }

    #[test]
    fn test_server_error_keeps_connection() {
        let nogroup = RedisError::from((ErrorKind::ResponseError, "NOGROUP No such key or consumer group"));
        assert!(!is_connection_error(&nogroup));
    }
}
