//! Explicit wiring of producer, dispatch container and maintenance jobs.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::{
    broker::SharedBroker,
    codec::{json::JsonCodec, MessageCodec},
    config::MessagingConfig,
    container::{ContainerHandle, DispatchContainer},
    interceptor::MessageInterceptor,
    jobs::{PendingMessageResendJob, StreamCleanupJob},
    listener::ListenerRegistry,
    lock::{MemoryLockProvider, SharedLockProvider},
    observability::MessagingMetrics,
    producer::MessageProducer,
    schedule::{spawn_scheduled, CronSchedule},
    StreamError, StreamResult,
};

/// Collects everything the messaging layer needs before it is started
pub struct MessagingBuilder {
    broker: SharedBroker,
    config: MessagingConfig,
    registry: ListenerRegistry,
    interceptors: Vec<Arc<dyn MessageInterceptor>>,
    locks: Option<SharedLockProvider>,
    codec: Arc<dyn MessageCodec>,
    consumer: Option<String>,
}

impl MessagingBuilder {
    pub fn new(broker: SharedBroker) -> Self {
        Self {
            broker,
            config: MessagingConfig::default(),
            registry: ListenerRegistry::new(),
            interceptors: Vec::new(),
            locks: None,
            codec: Arc::new(JsonCodec),
            consumer: None,
        }
    }

    pub fn config(mut self, config: MessagingConfig) -> Self {
        self.config = config;
        self
    }

    pub fn listeners(mut self, registry: ListenerRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Add a publish interceptor; hooks run in the order they are added
    pub fn interceptor(mut self, hook: Arc<dyn MessageInterceptor>) -> Self {
        self.interceptors.push(hook);
        self
    }

    /// Cluster lock used by the jobs; defaults to a process-local provider
    pub fn lock_provider(mut self, locks: SharedLockProvider) -> Self {
        self.locks = Some(locks);
        self
    }

    pub fn codec(mut self, codec: Arc<dyn MessageCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn consumer_name(mut self, consumer: impl Into<String>) -> Self {
        self.consumer = Some(consumer.into());
        self
    }

    pub fn build(self) -> StreamResult<Messaging> {
        self.config.validate()?;

        let metrics = Arc::new(MessagingMetrics::new());
        let registry = Arc::new(self.registry);
        let locks = self.locks.unwrap_or_else(|| {
            warn!("No lock provider configured, maintenance jobs only exclude each other within this process");
            Arc::new(MemoryLockProvider::new())
        });

        let mut producer = MessageProducer::new(self.broker.clone())
            .with_codec(self.codec.clone())
            .with_metrics(metrics.clone());
        for hook in self.interceptors {
            producer.add_interceptor(hook);
        }

        let mut container = DispatchContainer::new(self.broker.clone(), registry.clone(), self.config.stream.clone())
            .with_codec(self.codec)
            .with_metrics(metrics.clone());
        if let Some(consumer) = self.consumer {
            container = container.with_consumer_name(consumer);
        }

        let resend = PendingMessageResendJob::new(
            self.broker.clone(),
            &registry,
            locks.clone(),
            self.config.pending_message.clone(),
        )
        .with_metrics(metrics.clone());

        let cleanup = StreamCleanupJob::new(self.broker, &registry, locks, self.config.cleanup.clone())
            .with_metrics(metrics.clone());

        Ok(Messaging {
            config: self.config,
            registry,
            producer: Arc::new(producer),
            container,
            resend: Arc::new(resend),
            cleanup: Arc::new(cleanup),
            metrics,
        })
    }
}

/// The assembled messaging layer
pub struct Messaging {
    config: MessagingConfig,
    registry: Arc<ListenerRegistry>,
    producer: Arc<MessageProducer>,
    container: DispatchContainer,
    resend: Arc<PendingMessageResendJob>,
    cleanup: Arc<StreamCleanupJob>,
    metrics: Arc<MessagingMetrics>,
}

impl Messaging {
    pub fn builder(broker: SharedBroker) -> MessagingBuilder {
        MessagingBuilder::new(broker)
    }

    pub fn producer(&self) -> Arc<MessageProducer> {
        self.producer.clone()
    }

    pub fn resend_job(&self) -> Arc<PendingMessageResendJob> {
        self.resend.clone()
    }

    pub fn cleanup_job(&self) -> Arc<StreamCleanupJob> {
        self.cleanup.clone()
    }

    pub fn registry(&self) -> &ListenerRegistry {
        &self.registry
    }

    pub fn config(&self) -> &MessagingConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<MessagingMetrics> {
        self.metrics.clone()
    }

    /// Start dispatching and schedule the enabled jobs
    ///
    /// Fails before anything is spawned if the broker cannot support consumer
    /// groups.
    pub async fn start(&self) -> StreamResult<MessagingHandle> {
        let resend_schedule = self
            .config
            .pending_message
            .enabled
            .then(|| CronSchedule::parse(&self.config.pending_message.cron))
            .transpose()?;
        let cleanup_schedule = self
            .config
            .cleanup
            .enabled
            .then(|| CronSchedule::parse(&self.config.cleanup.cron))
            .transpose()?;

        let container = self.container.start().await?;

        let (shutdown, _) = watch::channel(false);
        let mut jobs = Vec::new();
        if let Some(schedule) = resend_schedule {
            jobs.push(spawn_scheduled(self.resend.clone(), schedule, shutdown.subscribe()));
        }
        if let Some(schedule) = cleanup_schedule {
            jobs.push(spawn_scheduled(self.cleanup.clone(), schedule, shutdown.subscribe()));
        }

        info!(
            consumer = self.container.consumer_name(),
            scheduled_jobs = jobs.len(),
            "Messaging started"
        );
        Ok(MessagingHandle {
            container,
            shutdown,
            jobs,
        })
    }
}

/// Single shutdown handle for everything [`Messaging::start`] spawned
///
/// Dropping it stops the schedules and the container without waiting.
#[derive(Debug)]
#[must_use = "dropping the handle stops consumption and the scheduled jobs"]
pub struct MessagingHandle {
    container: ContainerHandle,
    shutdown: watch::Sender<bool>,
    jobs: Vec<JoinHandle<()>>,
}

impl MessagingHandle {
    pub fn scheduled_jobs(&self) -> usize {
        self.jobs.len()
    }

    pub fn container(&self) -> &ContainerHandle {
        &self.container
    }

    /// Stop the job schedules, then close the container
    pub async fn shutdown(self) -> StreamResult<()> {
        let _ = self.shutdown.send(true);
        let mut failures = Vec::new();
        for job in self.jobs {
            if let Err(err) = job.await {
                failures.push(err.to_string());
            }
        }

        self.container.close().await?;

        if failures.is_empty() {
            info!("Messaging stopped");
            Ok(())
        } else {
            Err(StreamError::ShutdownFailed(failures.join("; ")))
        }
    }
}
