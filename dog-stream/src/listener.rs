//! Listener definitions and the registry the dispatch container reads.
//!
//! Collaborators register their listeners explicitly at startup; the registry
//! is then frozen behind an `Arc` and only read.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::{
    broker::SharedBroker,
    observability::MessagingMetrics,
    types::{Headers, RecordId},
    HandlerError, HandlerResult, StreamError, StreamResult,
};

/// Handles records delivered through a consumer group
///
/// Call [`Delivery::ack`] once processing succeeded. Returning an error (or
/// simply not acking) leaves the record pending for the resend job.
#[async_trait]
pub trait StreamHandler: Send + Sync {
    async fn handle(&self, delivery: Delivery) -> HandlerResult;
}

#[async_trait]
impl<F, Fut> StreamHandler for F
where
    F: Fn(Delivery) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    async fn handle(&self, delivery: Delivery) -> HandlerResult {
        (self)(delivery).await
    }
}

/// Handles broadcast messages; errors are logged and nothing is replayed
#[async_trait]
pub trait BroadcastHandler: Send + Sync {
    async fn handle(&self, message: BroadcastDelivery) -> HandlerResult;
}

#[async_trait]
impl<F, Fut> BroadcastHandler for F
where
    F: Fn(BroadcastDelivery) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    async fn handle(&self, message: BroadcastDelivery) -> HandlerResult {
        (self)(message).await
    }
}

/// `(stream key, group)` pair a log listener consumes from
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamTarget {
    pub stream_key: String,
    pub group: String,
}

/// Consumer-group listener on a stream
#[derive(Clone)]
pub struct StreamListener {
    pub stream_key: String,
    pub group: String,
    /// Overrides the container-wide batch size
    pub batch_size: Option<usize>,
    pub handler: Arc<dyn StreamHandler>,
}

impl StreamListener {
    pub fn new(
        stream_key: impl Into<String>,
        group: impl Into<String>,
        handler: impl StreamHandler + 'static,
    ) -> Self {
        Self {
            stream_key: stream_key.into(),
            group: group.into(),
            batch_size: None,
            handler: Arc::new(handler),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    pub fn target(&self) -> StreamTarget {
        StreamTarget {
            stream_key: self.stream_key.clone(),
            group: self.group.clone(),
        }
    }
}

/// Plain subscription listener on a broadcast channel
#[derive(Clone)]
pub struct BroadcastListener {
    pub channel: String,
    pub handler: Arc<dyn BroadcastHandler>,
}

impl BroadcastListener {
    pub fn new(channel: impl Into<String>, handler: impl BroadcastHandler + 'static) -> Self {
        Self {
            channel: channel.into(),
            handler: Arc::new(handler),
        }
    }
}

/// Either listener flavor
#[derive(Clone)]
pub enum ListenerDefinition {
    Stream(StreamListener),
    Broadcast(BroadcastListener),
}

impl From<StreamListener> for ListenerDefinition {
    fn from(listener: StreamListener) -> Self {
        Self::Stream(listener)
    }
}

impl From<BroadcastListener> for ListenerDefinition {
    fn from(listener: BroadcastListener) -> Self {
        Self::Broadcast(listener)
    }
}

/// Every listener known to this process
#[derive(Clone, Default)]
pub struct ListenerRegistry {
    streams: Vec<StreamListener>,
    broadcasts: Vec<BroadcastListener>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener definition
    ///
    /// A `(stream, group)` pair may only be bound once per process; channels
    /// accept any number of handlers.
    pub fn register(&mut self, definition: impl Into<ListenerDefinition>) -> StreamResult<()> {
        match definition.into() {
            ListenerDefinition::Stream(listener) => {
                if self.streams.iter().any(|l| l.target() == listener.target()) {
                    return Err(StreamError::invalid_config(
                        format!("{}/{}", listener.stream_key, listener.group),
                        "stream listener already registered for this group",
                    ));
                }
                debug!(stream = %listener.stream_key, group = %listener.group, "Registered stream listener");
                self.streams.push(listener);
            }
            ListenerDefinition::Broadcast(listener) => self.push_broadcast(listener),
        }
        Ok(())
    }

    fn push_broadcast(&mut self, listener: BroadcastListener) {
        debug!(channel = %listener.channel, "Registered broadcast listener");
        self.broadcasts.push(listener);
    }

    /// Register a consumer-group handler
    pub fn register_stream(
        &mut self,
        stream_key: impl Into<String>,
        group: impl Into<String>,
        handler: impl StreamHandler + 'static,
    ) -> StreamResult<()> {
        self.register(StreamListener::new(stream_key, group, handler))
    }

    /// Register a broadcast handler
    pub fn register_broadcast(&mut self, channel: impl Into<String>, handler: impl BroadcastHandler + 'static) {
        self.push_broadcast(BroadcastListener::new(channel, handler));
    }

    pub fn stream_listeners(&self) -> &[StreamListener] {
        &self.streams
    }

    pub fn broadcast_listeners(&self) -> &[BroadcastListener] {
        &self.broadcasts
    }

    /// Distinct `(stream, group)` pairs, in registration order
    pub fn stream_targets(&self) -> Vec<StreamTarget> {
        self.streams.iter().map(StreamListener::target).collect()
    }

    /// Distinct stream keys, in registration order
    pub fn stream_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = Vec::new();
        for listener in &self.streams {
            if !keys.contains(&listener.stream_key) {
                keys.push(listener.stream_key.clone());
            }
        }
        keys
    }

    /// Broadcast handlers grouped by channel
    pub fn broadcast_channels(&self) -> BTreeMap<String, Vec<Arc<dyn BroadcastHandler>>> {
        let mut channels: BTreeMap<String, Vec<Arc<dyn BroadcastHandler>>> = BTreeMap::new();
        for listener in &self.broadcasts {
            channels
                .entry(listener.channel.clone())
                .or_default()
                .push(listener.handler.clone());
        }
        channels
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty() && self.broadcasts.is_empty()
    }
}

/// A stream record handed to a [`StreamHandler`]
#[derive(Clone)]
pub struct Delivery {
    pub record_id: RecordId,
    pub stream_key: String,
    pub group: String,
    pub consumer: String,
    pub headers: Headers,
    payload: Vec<u8>,
    broker: SharedBroker,
    metrics: Arc<MessagingMetrics>,
}

impl Delivery {
    pub(crate) fn new(
        record_id: RecordId,
        target: &StreamTarget,
        consumer: &str,
        headers: Headers,
        payload: Vec<u8>,
        broker: SharedBroker,
        metrics: Arc<MessagingMetrics>,
    ) -> Self {
        Self {
            record_id,
            stream_key: target.stream_key.clone(),
            group: target.group.clone(),
            consumer: consumer.to_string(),
            headers,
            payload,
            broker,
            metrics,
        }
    }

    pub fn id(&self) -> &RecordId {
        &self.record_id
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(|v| v.as_str())
    }

    /// Raw payload JSON
    pub fn payload_bytes(&self) -> &[u8] {
        &self.payload
    }

    /// Decode the payload into an application type
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Acknowledge this record for its group; acking twice is harmless
    pub async fn ack(&self) -> StreamResult<()> {
        let acked = self
            .broker
            .ack(&self.stream_key, &self.group, std::slice::from_ref(&self.record_id))
            .await?;
        if acked > 0 {
            self.metrics.record_acknowledged();
        }
        debug!(
            stream = %self.stream_key,
            group = %self.group,
            record_id = %self.record_id,
            "Acknowledged record"
        );
        Ok(())
    }
}

/// A broadcast message handed to a [`BroadcastHandler`]
#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastDelivery {
    pub channel: String,
    pub headers: Headers,
    payload: Vec<u8>,
}

impl BroadcastDelivery {
    pub(crate) fn new(channel: impl Into<String>, headers: Headers, payload: Vec<u8>) -> Self {
        Self {
            channel: channel.into(),
            headers,
            payload,
        }
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(|v| v.as_str())
    }

    pub fn payload_bytes(&self) -> &[u8] {
        &self.payload
    }

    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}
