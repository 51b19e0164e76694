//! # dog-stream: Reliable messaging over an append-only log broker
//!
//! dog-stream is the messaging layer DogRS services publish domain events
//! through and consume them from:
//!
//! - **Interceptable publishing**: one producer for ephemeral broadcast
//!   channels and durable stream keys, with `before`/`after` hooks around
//!   every write
//! - **Consumer-group dispatch**: one read loop per registered listener,
//!   manual acknowledgment, failed records stay pending
//! - **Pending-entry redelivery**: a cron-scheduled job re-publishes records
//!   that stayed unacknowledged for too long
//! - **Log trimming**: a cron-scheduled job keeps every stream bounded
//!
//! Both jobs take a cluster lock first, so only one node acts per tick.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use dog_stream::prelude::*;
//! use serde_json::json;
//!
//! # async fn run() -> StreamResult<()> {
//! let broker: SharedBroker = Arc::new(MemoryBroker::new());
//!
//! let mut listeners = ListenerRegistry::new();
//! listeners.register_stream("orders", "billing", |delivery: Delivery| async move {
//!     let order: serde_json::Value = delivery.payload()?;
//!     println!("billing order {}", order["orderId"]);
//!     delivery.ack().await?;
//!     Ok(())
//! })?;
//!
//! let messaging = Messaging::builder(broker)
//!     .listeners(listeners)
//!     .interceptor(Arc::new(TraceInterceptor))
//!     .build()?;
//! let handle = messaging.start().await?;
//!
//! let id = messaging
//!     .producer()
//!     .publish_log(LogEnvelope::json("orders", &json!({"orderId": 1001}))?)
//!     .await?;
//! println!("published {}", id);
//!
//! handle.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! Handlers must be idempotent: a redelivered record looks exactly like a
//! first delivery.

pub mod broker;
pub mod codec;
pub mod config;
pub mod container;
pub mod error;
pub mod interceptor;
pub mod jobs;
pub mod listener;
pub mod lock;
pub mod observability;
pub mod producer;
pub mod runtime;
pub mod schedule;
pub mod types;
pub mod version;

pub use error::{HandlerError, HandlerResult, StreamError, StreamResult};
pub use types::RecordId;

pub use broker::{MemoryBroker, SharedBroker, StreamBroker};
pub use config::{CleanupConfig, ConfigMap, MessagingConfig, PendingMessageConfig, StreamSettings};
pub use container::{ContainerHandle, DispatchContainer};
pub use interceptor::{InterceptorChain, MessageInterceptor, PublishOutcome, TenantInterceptor, TraceInterceptor};
pub use jobs::{CleanupReport, JobOutcome, PendingMessageResendJob, ResendReport, StreamCleanupJob};
pub use listener::{
    BroadcastDelivery, BroadcastHandler, BroadcastListener, Delivery, ListenerDefinition, ListenerRegistry,
    StreamHandler, StreamListener,
};
pub use lock::{LockHandle, LockProvider, MemoryLockProvider};
pub use observability::{MessagingMetrics, MetricsSnapshot};
pub use producer::MessageProducer;
pub use runtime::{Messaging, MessagingBuilder, MessagingHandle};
pub use types::{BroadcastEnvelope, Envelope, LogEnvelope};

#[cfg(feature = "redis")]
pub use broker::RedisBroker;
#[cfg(feature = "redis")]
pub use lock::RedisLockProvider;

/// Convenient imports for application code
pub mod prelude {
    pub use crate::{
        BroadcastDelivery, BroadcastEnvelope, Delivery, HandlerError, HandlerResult, JobOutcome,
        ListenerRegistry, LogEnvelope, MemoryBroker, MessageInterceptor, MessageProducer, Messaging,
        MessagingConfig, RecordId, SharedBroker, StreamBroker, StreamError, StreamResult, StreamListener,
        TenantInterceptor, TraceInterceptor,
    };

    #[cfg(feature = "redis")]
    pub use crate::{RedisBroker, RedisLockProvider};
}
