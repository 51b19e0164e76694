#![allow(dead_code)]

use std::time::Duration;

use async_trait::async_trait;
use dog_stream::{
    broker::BoxStream,
    codec::{json::JsonCodec, MessageCodec},
    types::{ChannelMessage, Headers, LogRecord, PendingEntry, PendingSummary},
    MemoryBroker, RecordId, StreamBroker, StreamResult,
};

/// Memory broker that stalls the calls the maintenance jobs start with
pub struct DelayedBroker {
    pub inner: MemoryBroker,
    pub delay: Duration,
}

#[async_trait]
impl StreamBroker for DelayedBroker {
    async fn append(&self, stream_key: &str, body: &str) -> StreamResult<RecordId> {
        self.inner.append(stream_key, body).await
    }

    async fn create_group(&self, stream_key: &str, group: &str) -> StreamResult<bool> {
        self.inner.create_group(stream_key, group).await
    }

    async fn read_group(
        &self,
        stream_key: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> StreamResult<Vec<LogRecord>> {
        self.inner.read_group(stream_key, group, consumer, count, block).await
    }

    async fn ack(&self, stream_key: &str, group: &str, ids: &[RecordId]) -> StreamResult<u64> {
        self.inner.ack(stream_key, group, ids).await
    }

    async fn pending_summary(&self, stream_key: &str, group: &str) -> StreamResult<PendingSummary> {
        tokio::time::sleep(self.delay).await;
        self.inner.pending_summary(stream_key, group).await
    }

    async fn pending_entries(
        &self,
        stream_key: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> StreamResult<Vec<PendingEntry>> {
        self.inner.pending_entries(stream_key, group, consumer, count).await
    }

    async fn read_record(&self, stream_key: &str, id: &RecordId) -> StreamResult<Option<LogRecord>> {
        self.inner.read_record(stream_key, id).await
    }

    async fn trim_approx(&self, stream_key: &str, max_len: usize) -> StreamResult<u64> {
        tokio::time::sleep(self.delay).await;
        self.inner.trim_approx(stream_key, max_len).await
    }

    async fn stream_len(&self, stream_key: &str) -> StreamResult<u64> {
        self.inner.stream_len(stream_key).await
    }

    async fn publish(&self, channel: &str, body: &str) -> StreamResult<u64> {
        self.inner.publish(channel, body).await
    }

    async fn subscribe(&self, channel: &str) -> StreamResult<BoxStream<ChannelMessage>> {
        self.inner.subscribe(channel).await
    }

    async fn server_version(&self) -> StreamResult<Option<String>> {
        self.inner.server_version().await
    }
}

/// Wire text for a JSON payload, as the producer would write it
pub fn wire(payload: &serde_json::Value) -> String {
    JsonCodec
        .encode(&Headers::new(), payload.to_string().as_bytes())
        .expect("encode wire frame")
}

/// Payload of a stored record
pub fn payload_of(record: &LogRecord) -> serde_json::Value {
    let message = JsonCodec.decode(&record.body).expect("decode wire frame");
    serde_json::from_slice(&message.payload).expect("payload is json")
}

/// Poll `check` until it holds or a second has passed
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
