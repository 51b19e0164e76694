//! Drives registered listeners against the broker.
//!
//! One task per stream listener runs a consumer-group read loop; one task per
//! broadcast channel fans every message out to the channel's handlers.
//! Closing the container stops new reads and lets running handlers finish.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    broker::{BoxStream, SharedBroker},
    codec::{json::JsonCodec, MessageCodec},
    config::StreamSettings,
    listener::{BroadcastDelivery, BroadcastHandler, Delivery, ListenerRegistry, StreamListener, StreamTarget},
    observability::MessagingMetrics,
    types::{consumer_name, ChannelMessage, LogRecord},
    version::{ensure_consumer_group_support, MIN_CONSUMER_GROUP_MAJOR},
    StreamError, StreamResult,
};

pub struct DispatchContainer {
    broker: SharedBroker,
    registry: Arc<ListenerRegistry>,
    settings: StreamSettings,
    consumer: String,
    codec: Arc<dyn MessageCodec>,
    metrics: Arc<MessagingMetrics>,
}

impl DispatchContainer {
    pub fn new(broker: SharedBroker, registry: Arc<ListenerRegistry>, settings: StreamSettings) -> Self {
        Self {
            broker,
            registry,
            settings,
            consumer: consumer_name().to_string(),
            codec: Arc::new(JsonCodec),
            metrics: Arc::new(MessagingMetrics::new()),
        }
    }

    /// Override the broker-visible consumer name (defaults to `host@pid`)
    pub fn with_consumer_name(mut self, consumer: impl Into<String>) -> Self {
        self.consumer = consumer.into();
        self
    }

    pub fn with_codec(mut self, codec: Arc<dyn MessageCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MessagingMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn consumer_name(&self) -> &str {
        &self.consumer
    }

    /// Check the broker, create groups and subscriptions, then spawn the loops
    ///
    /// Fails without spawning anything if the broker is too old for consumer
    /// groups or a group/subscription cannot be set up.
    #[instrument(skip(self), fields(consumer = %self.consumer))]
    pub async fn start(&self) -> StreamResult<ContainerHandle> {
        let listeners = self.registry.stream_listeners();

        if !listeners.is_empty() {
            ensure_consumer_group_support(self.broker.as_ref(), MIN_CONSUMER_GROUP_MAJOR).await?;
        }

        for target in self.registry.stream_targets() {
            let created = self.broker.create_group(&target.stream_key, &target.group).await?;
            if created {
                info!(stream = %target.stream_key, group = %target.group, "Created consumer group");
            } else {
                debug!(stream = %target.stream_key, group = %target.group, "Consumer group already exists");
            }
        }

        let mut subscriptions = Vec::new();
        for (channel, handlers) in self.registry.broadcast_channels() {
            let messages = self.broker.subscribe(&channel).await?;
            info!(channel = %channel, handlers = handlers.len(), "Subscribed to broadcast channel");
            subscriptions.push((channel, handlers, messages));
        }

        let (shutdown, _) = watch::channel(false);
        let mut tasks = Vec::with_capacity(listeners.len() + subscriptions.len());

        for listener in listeners {
            let read_loop = ReadLoop {
                broker: self.broker.clone(),
                target: listener.target(),
                batch_size: listener.batch_size.unwrap_or(self.settings.batch_size).max(1),
                consumer: self.consumer.clone(),
                listener: listener.clone(),
                settings: self.settings.clone(),
                codec: self.codec.clone(),
                metrics: self.metrics.clone(),
            };
            tasks.push(tokio::spawn(read_loop.run(shutdown.subscribe())));
        }

        for (channel, handlers, messages) in subscriptions {
            let fan_out = FanOut {
                channel,
                handlers,
                codec: self.codec.clone(),
                metrics: self.metrics.clone(),
            };
            tasks.push(tokio::spawn(fan_out.run(messages, shutdown.subscribe())));
        }

        info!(
            stream_listeners = listeners.len(),
            broadcast_channels = tasks.len() - listeners.len(),
            "Dispatch container started"
        );
        Ok(ContainerHandle { shutdown, tasks })
    }
}

/// Running container
///
/// Dropping the handle stops every loop just like `close`, but without
/// waiting for in-flight handlers.
#[derive(Debug)]
#[must_use = "dropping the handle stops all consumption"]
pub struct ContainerHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl ContainerHandle {
    /// Stop issuing reads and wait for in-flight handlers to finish
    pub async fn close(self) -> StreamResult<()> {
        let _ = self.shutdown.send(true);

        let mut failures = Vec::new();
        for task in self.tasks {
            if let Err(err) = task.await {
                failures.push(err.to_string());
            }
        }

        if failures.is_empty() {
            info!("Dispatch container closed");
            Ok(())
        } else {
            Err(StreamError::ShutdownFailed(failures.join("; ")))
        }
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }
}

struct ReadLoop {
    broker: SharedBroker,
    target: StreamTarget,
    batch_size: usize,
    consumer: String,
    listener: StreamListener,
    settings: StreamSettings,
    codec: Arc<dyn MessageCodec>,
    metrics: Arc<MessagingMetrics>,
}

impl ReadLoop {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        debug!(stream = %self.target.stream_key, group = %self.target.group, "Read loop started");

        'reading: loop {
            if *shutdown.borrow() {
                break;
            }

            let read = tokio::select! {
                _ = shutdown.changed() => break,
                read = self.broker.read_group(
                    &self.target.stream_key,
                    &self.target.group,
                    &self.consumer,
                    self.batch_size,
                    self.settings.block_timeout,
                ) => read,
            };

            match read {
                Ok(records) => {
                    for record in records {
                        // Records left undispatched stay pending and are resent later
                        if *shutdown.borrow() {
                            break 'reading;
                        }
                        self.dispatch(record).await;
                    }
                }
                Err(err) => {
                    warn!(
                        stream = %self.target.stream_key,
                        group = %self.target.group,
                        "Group read failed: {}",
                        err
                    );
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(self.settings.error_backoff) => {}
                    }
                }
            }
        }

        debug!(stream = %self.target.stream_key, group = %self.target.group, "Read loop stopped");
    }

    async fn dispatch(&self, record: LogRecord) {
        let message = match self.codec.decode(&record.body) {
            Ok(message) => message,
            Err(err) => {
                // Redelivery cannot fix an undecodable record
                error!(
                    stream = %record.stream_key,
                    record_id = %record.id,
                    "Dropping undecodable record: {}",
                    err
                );
                if let Err(err) = self
                    .broker
                    .ack(&self.target.stream_key, &self.target.group, std::slice::from_ref(&record.id))
                    .await
                {
                    warn!(record_id = %record.id, "Failed to ack undecodable record: {}", err);
                }
                return;
            }
        };

        let delivery = Delivery::new(
            record.id.clone(),
            &self.target,
            &self.consumer,
            message.headers,
            message.payload,
            self.broker.clone(),
            self.metrics.clone(),
        );
        self.metrics.record_delivered();

        match AssertUnwindSafe(self.listener.handler.handle(delivery)).catch_unwind().await {
            Ok(Ok(())) => {
                debug!(stream = %self.target.stream_key, record_id = %record.id, "Handled record");
            }
            Ok(Err(err)) => {
                self.metrics.record_handler_failed();
                warn!(
                    stream = %self.target.stream_key,
                    group = %self.target.group,
                    record_id = %record.id,
                    retryable = err.is_retryable(),
                    "Handler failed, record left pending: {}",
                    err
                );
            }
            Err(_) => {
                self.metrics.record_handler_failed();
                error!(
                    stream = %self.target.stream_key,
                    group = %self.target.group,
                    record_id = %record.id,
                    "Handler panicked, record left pending"
                );
            }
        }
    }
}

struct FanOut {
    channel: String,
    handlers: Vec<Arc<dyn BroadcastHandler>>,
    codec: Arc<dyn MessageCodec>,
    metrics: Arc<MessagingMetrics>,
}

impl FanOut {
    async fn run(self, mut messages: BoxStream<ChannelMessage>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                next = messages.next() => match next {
                    Some(message) => self.deliver(message).await,
                    None => {
                        warn!(channel = %self.channel, "Broadcast subscription ended");
                        break;
                    }
                },
            }
        }
        debug!(channel = %self.channel, "Broadcast loop stopped");
    }

    async fn deliver(&self, message: ChannelMessage) {
        let decoded = match self.codec.decode(&message.body) {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!(channel = %self.channel, "Dropping undecodable broadcast: {}", err);
                return;
            }
        };

        for (index, handler) in self.handlers.iter().enumerate() {
            let delivery = BroadcastDelivery::new(&self.channel, decoded.headers.clone(), decoded.payload.clone());
            self.metrics.record_delivered();
            match AssertUnwindSafe(handler.handle(delivery)).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    self.metrics.record_handler_failed();
                    warn!(channel = %self.channel, handler = index, "Broadcast handler failed: {}", err);
                }
                Err(_) => {
                    self.metrics.record_handler_failed();
                    error!(channel = %self.channel, handler = index, "Broadcast handler panicked");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{MemoryBroker, StreamBroker};
    use crate::HandlerError;
    use parking_lot::Mutex;
    use std::time::Duration;

    fn settings() -> StreamSettings {
        StreamSettings {
            block_timeout: Duration::from_millis(50),
            ..StreamSettings::default()
        }
    }

    async fn wait_for(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_failed_handler_leaves_record_pending_and_loop_continues() {
        let broker = MemoryBroker::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let mut registry = ListenerRegistry::new();
        let sink = seen.clone();
        registry
            .register_stream("orders", "svc-a", move |delivery: Delivery| {
                let sink = sink.clone();
                async move {
                    let body: serde_json::Value = delivery.payload()?;
                    sink.lock().push(body["n"].as_u64().unwrap_or_default());
                    if body["n"] == 1 {
                        return Err(HandlerError::retryable("first one fails"));
                    }
                    delivery.ack().await?;
                    Ok(())
                }
            })
            .unwrap();

        let container = DispatchContainer::new(Arc::new(broker.clone()), Arc::new(registry), settings())
            .with_consumer_name("node-1");
        let handle = container.start().await.unwrap();
        assert_eq!(handle.task_count(), 1);

        let codec = JsonCodec;
        for n in 1..=2 {
            let body = codec.encode(&Default::default(), format!(r#"{{"n":{}}}"#, n).as_bytes()).unwrap();
            broker.append("orders", &body).await.unwrap();
        }

        wait_for(|| seen.lock().len() == 2).await;
        handle.close().await.unwrap();

        let summary = broker.pending_summary("orders", "svc-a").await.unwrap();
        assert_eq!(summary.total, 1);
        assert_eq!(summary.pending_for("node-1"), 1);
    }

    #[tokio::test]
    async fn test_panicking_handler_leaves_record_pending_and_loop_continues() {
        let broker = MemoryBroker::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let mut registry = ListenerRegistry::new();
        let sink = seen.clone();
        registry
            .register_stream("orders", "svc-a", move |delivery: Delivery| {
                let sink = sink.clone();
                async move {
                    let body: serde_json::Value = delivery.payload()?;
                    let n = body["n"].as_u64().unwrap_or_default();
                    sink.lock().push(n);
                    if n == 1 {
                        panic!("handler blew up on {}", n);
                    }
                    delivery.ack().await?;
                    Ok(())
                }
            })
            .unwrap();

        let metrics = Arc::new(MessagingMetrics::new());
        let container = DispatchContainer::new(Arc::new(broker.clone()), Arc::new(registry), settings())
            .with_consumer_name("node-1")
            .with_metrics(metrics.clone());
        let handle = container.start().await.unwrap();

        let codec = JsonCodec;
        for n in 1..=2 {
            let body = codec.encode(&Default::default(), format!(r#"{{"n":{}}}"#, n).as_bytes()).unwrap();
            broker.append("orders", &body).await.unwrap();
        }

        wait_for(|| seen.lock().len() == 2).await;
        handle.close().await.unwrap();

        assert_eq!(*seen.lock(), vec![1, 2]);
        let summary = broker.pending_summary("orders", "svc-a").await.unwrap();
        assert_eq!(summary.total, 1);
        assert_eq!(summary.pending_for("node-1"), 1);
        assert_eq!(metrics.snapshot().handler_failed, 1);
    }

    #[tokio::test]
    async fn test_dropping_handle_stops_reading() {
        let broker = MemoryBroker::new();
        let handled = Arc::new(Mutex::new(0usize));

        let mut registry = ListenerRegistry::new();
        let count = handled.clone();
        registry
            .register_stream("orders", "svc-a", move |delivery: Delivery| {
                let count = count.clone();
                async move {
                    *count.lock() += 1;
                    delivery.ack().await?;
                    Ok(())
                }
            })
            .unwrap();

        let container = DispatchContainer::new(Arc::new(broker.clone()), Arc::new(registry), settings());
        let handle = container.start().await.unwrap();
        drop(handle);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let body = JsonCodec.encode(&Default::default(), br#"{"n":1}"#).unwrap();
        broker.append("orders", &body).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(*handled.lock(), 0);
        assert!(broker.pending_summary("orders", "svc-a").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_old_broker_fails_start() {
        let broker = MemoryBroker::new().with_version(Some("4.0.0"));
        let mut registry = ListenerRegistry::new();
        registry
            .register_stream("orders", "svc-a", |_d: Delivery| async { Ok(()) })
            .unwrap();

        let container = DispatchContainer::new(Arc::new(broker.clone()), Arc::new(registry), settings());
        let result = container.start().await;

        assert!(matches!(result, Err(StreamError::IncompatibleBroker { .. })));
        assert_eq!(broker.group_count("orders"), 0);
    }

    #[tokio::test]
    async fn test_broadcast_only_container_skips_version_check() {
        let broker = MemoryBroker::new().with_version(Some("2.8.0"));
        let mut registry = ListenerRegistry::new();
        registry.register_broadcast("cache.evict", |_m: BroadcastDelivery| async { Ok(()) });

        let container = DispatchContainer::new(Arc::new(broker), Arc::new(registry), settings());
        let handle = container.start().await.unwrap();
        handle.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_undecodable_record_is_dropped() {
        let broker = MemoryBroker::new();
        let mut registry = ListenerRegistry::new();
        registry
            .register_stream("orders", "svc-a", |_d: Delivery| async {
                Err(HandlerError::permanent("should not be called"))
            })
            .unwrap();

        let container = DispatchContainer::new(Arc::new(broker.clone()), Arc::new(registry), settings());
        let handle = container.start().await.unwrap();

        broker.append("orders", "not a wire frame").await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.close().await.unwrap();

        assert!(broker.pending_summary("orders", "svc-a").await.unwrap().is_empty());
    }
}
