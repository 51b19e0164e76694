use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::{
    broker::SharedBroker,
    codec::{json::JsonCodec, MessageCodec},
    interceptor::{InterceptorChain, MessageInterceptor, PublishOutcome},
    observability::MessagingMetrics,
    types::{BroadcastEnvelope, Envelope, LogEnvelope},
    RecordId, StreamError, StreamResult,
};

/// Single entry point for publishing broadcast and log envelopes
///
/// Owns the interceptor chain and the wire codec. Interceptors are added
/// during startup, before the producer is shared; afterwards it is used
/// through `&self` only.
pub struct MessageProducer {
    broker: SharedBroker,
    codec: Arc<dyn MessageCodec>,
    interceptors: InterceptorChain,
    metrics: Arc<MessagingMetrics>,
}

impl MessageProducer {
    /// Create a producer using the JSON codec
    pub fn new(broker: SharedBroker) -> Self {
        Self {
            broker,
            codec: Arc::new(JsonCodec),
            interceptors: InterceptorChain::new(),
            metrics: Arc::new(MessagingMetrics::new()),
        }
    }

    /// Use a custom wire codec
    pub fn with_codec(mut self, codec: Arc<dyn MessageCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Report into shared metrics
    pub fn with_metrics(mut self, metrics: Arc<MessagingMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Append an interceptor to the chain
    pub fn add_interceptor(&mut self, hook: Arc<dyn MessageInterceptor>) {
        debug!(interceptor = hook.name(), "Registered publish interceptor");
        self.interceptors.push(hook);
    }

    /// Publish to a broadcast channel
    ///
    /// Success means the broker accepted the message, not that anyone received it.
    #[instrument(skip_all, fields(channel = %envelope.channel))]
    pub async fn publish_broadcast(&self, envelope: BroadcastEnvelope) -> StreamResult<()> {
        self.publish(envelope.into()).await.map(|_| ())
    }

    /// Append to a stream, returning the broker-assigned record id
    #[instrument(skip_all, fields(stream = %envelope.stream_key))]
    pub async fn publish_log(&self, envelope: LogEnvelope) -> StreamResult<RecordId> {
        self.publish(envelope.into())
            .await?
            .ok_or_else(|| StreamError::Internal("log publish returned no record id".to_string()))
    }

    /// Publish either flavor through the interceptor chain
    ///
    /// `after` hooks run whether the publish succeeded or not.
    pub async fn publish(&self, mut envelope: Envelope) -> StreamResult<Option<RecordId>> {
        let result = match self.interceptors.run_before(&mut envelope).await {
            Ok(()) => self.write(&envelope).await,
            Err(err) => Err(err),
        };

        let outcome = PublishOutcome::from_result(&result);
        self.interceptors.run_after(&envelope, &outcome).await;

        match &result {
            Ok(id) => {
                self.metrics.record_published();
                debug!(
                    kind = envelope.kind().as_str(),
                    destination = envelope.destination(),
                    record_id = ?id,
                    "Published message"
                );
            }
            Err(err) => {
                self.metrics.record_publish_failed();
                warn!(
                    kind = envelope.kind().as_str(),
                    destination = envelope.destination(),
                    "Publish failed: {}",
                    err
                );
            }
        }

        result
    }

    async fn write(&self, envelope: &Envelope) -> StreamResult<Option<RecordId>> {
        let body = self.codec.encode(envelope.headers(), envelope.payload())?;
        match envelope {
            Envelope::Broadcast(env) => {
                self.broker.publish(&env.channel, &body).await?;
                Ok(None)
            }
            Envelope::Log(env) => Ok(Some(self.broker.append(&env.stream_key, &body).await?)),
        }
    }

    pub fn interceptors(&self) -> &InterceptorChain {
        &self.interceptors
    }

    pub fn codec(&self) -> &Arc<dyn MessageCodec> {
        &self.codec
    }

    pub fn broker(&self) -> &SharedBroker {
        &self.broker
    }

    pub fn metrics(&self) -> &Arc<MessagingMetrics> {
        &self.metrics
    }
}
