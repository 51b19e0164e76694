//! Publish interceptors.
//!
//! Every publish runs through the chain in this order:
//!
//! ```text
//! before(A) → before(B) → transport write → after(B) → after(A)
//! ```
//!
//! A failing `before` stops the chain and aborts the write. The `after` phase
//! always runs, in reverse registration order, for every hook, whatever
//! happened before it. `after` failures are logged and swallowed per hook.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{types::Envelope, RecordId, StreamError, StreamResult};

pub const TENANT_HEADER: &str = "tenant-id";
pub const TRACE_HEADER: &str = "trace-id";

/// What happened to the envelope, as reported to `after` hooks
#[derive(Debug, Clone, PartialEq)]
pub enum PublishOutcome {
    /// Written to the broker; log publishes carry the new record id
    Published(Option<RecordId>),
    /// Aborted by a hook, the codec or the transport
    Failed(String),
}

impl PublishOutcome {
    pub fn from_result(result: &StreamResult<Option<RecordId>>) -> Self {
        match result {
            Ok(id) => Self::Published(id.clone()),
            Err(err) => Self::Failed(err.to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Published(_))
    }
}

/// Cross-cutting hook around every publish
#[async_trait]
pub trait MessageInterceptor: Send + Sync {
    /// Name used in logs and in `StreamError::Interceptor`
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// May mutate headers; an error aborts the publish
    async fn before(&self, _envelope: &mut Envelope) -> StreamResult<()> {
        Ok(())
    }

    /// Side effects only; errors are logged and ignored
    async fn after(&self, _envelope: &Envelope, _outcome: &PublishOutcome) -> StreamResult<()> {
        Ok(())
    }
}

/// Ordered interceptor list, filled at startup and read-only afterwards
#[derive(Clone, Default)]
pub struct InterceptorChain {
    hooks: Vec<Arc<dyn MessageInterceptor>>,
}

impl InterceptorChain {
    pub fn new() -> Self {
        Self { hooks: Vec::new() }
    }

    /// Append a hook to the end of the chain
    pub fn push(&mut self, hook: Arc<dyn MessageInterceptor>) {
        self.hooks.push(hook);
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Run `before` hooks in registration order, stopping at the first failure
    pub async fn run_before(&self, envelope: &mut Envelope) -> StreamResult<()> {
        for hook in &self.hooks {
            if let Err(err) = hook.before(envelope).await {
                warn!(
                    interceptor = hook.name(),
                    destination = envelope.destination(),
                    "Interceptor aborted publish: {}",
                    err
                );
                return Err(match err {
                    err @ StreamError::Interceptor { .. } => err,
                    other => StreamError::interceptor(hook.name(), other.to_string()),
                });
            }
        }
        Ok(())
    }

    /// Run every `after` hook in reverse registration order
    pub async fn run_after(&self, envelope: &Envelope, outcome: &PublishOutcome) {
        for hook in self.hooks.iter().rev() {
            if let Err(err) = hook.after(envelope, outcome).await {
                warn!(
                    interceptor = hook.name(),
                    destination = envelope.destination(),
                    "After-publish interceptor failed: {}",
                    err
                );
            }
        }
    }
}

type TenantResolver = Arc<dyn Fn() -> Option<String> + Send + Sync>;

/// Stamps the current tenant onto outgoing envelopes
///
/// The resolver is called per publish; an existing `tenant-id` header wins.
pub struct TenantInterceptor {
    resolver: TenantResolver,
    required: bool,
}

impl TenantInterceptor {
    pub fn new<F>(resolver: F) -> Self
    where
        F: Fn() -> Option<String> + Send + Sync + 'static,
    {
        Self {
            resolver: Arc::new(resolver),
            required: false,
        }
    }

    /// Abort publishes for which no tenant can be resolved
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

#[async_trait]
impl MessageInterceptor for TenantInterceptor {
    fn name(&self) -> &str {
        "tenant"
    }

    async fn before(&self, envelope: &mut Envelope) -> StreamResult<()> {
        if envelope.header(TENANT_HEADER).is_some() {
            return Ok(());
        }
        match (self.resolver)() {
            Some(tenant) => {
                envelope.set_header(TENANT_HEADER, tenant);
                Ok(())
            }
            None if self.required => Err(StreamError::interceptor(
                self.name(),
                "no tenant in scope for publish",
            )),
            None => Ok(()),
        }
    }
}

/// Gives every envelope a `trace-id` header and logs the publish outcome
#[derive(Debug, Default)]
pub struct TraceInterceptor;

#[async_trait]
impl MessageInterceptor for TraceInterceptor {
    fn name(&self) -> &str {
        "trace"
    }

    async fn before(&self, envelope: &mut Envelope) -> StreamResult<()> {
        if envelope.header(TRACE_HEADER).is_none() {
            envelope.set_header(TRACE_HEADER, Uuid::new_v4().to_string());
        }
        Ok(())
    }

    async fn after(&self, envelope: &Envelope, outcome: &PublishOutcome) -> StreamResult<()> {
        debug!(
            kind = envelope.kind().as_str(),
            destination = envelope.destination(),
            trace_id = envelope.header(TRACE_HEADER).unwrap_or_default(),
            ?outcome,
            "Publish finished"
        );
        Ok(())
    }
}
