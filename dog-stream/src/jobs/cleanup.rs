use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, error, info, instrument};

use super::{lock_holder, JobOutcome};
use crate::{
    broker::SharedBroker,
    config::CleanupConfig,
    listener::ListenerRegistry,
    lock::{run_exclusive, SharedLockProvider},
    observability::MessagingMetrics,
    schedule::ScheduledTask,
    StreamResult,
};

/// Cluster lock guarding the trim job
pub const CLEANUP_LOCK_KEY: &str = "redis:stream:cleanup:lock";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrimFailure {
    pub stream_key: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CleanupReport {
    /// Streams trimmed successfully
    pub streams: usize,
    /// Records removed across all streams
    pub trimmed: u64,
    pub failures: Vec<TrimFailure>,
}

/// Bounds every registered stream to roughly `max_length` records
///
/// Trimming is approximate and ignores pending entries: a consumer group
/// lagging by more than `max_length` loses records it never processed.
pub struct StreamCleanupJob {
    broker: SharedBroker,
    stream_keys: Vec<String>,
    locks: SharedLockProvider,
    config: CleanupConfig,
    holder: String,
    metrics: Arc<MessagingMetrics>,
}

impl StreamCleanupJob {
    pub fn new(
        broker: SharedBroker,
        registry: &ListenerRegistry,
        locks: SharedLockProvider,
        config: CleanupConfig,
    ) -> Self {
        Self {
            broker,
            stream_keys: registry.stream_keys(),
            locks,
            config,
            holder: lock_holder(),
            metrics: Arc::new(MessagingMetrics::new()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MessagingMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn config(&self) -> &CleanupConfig {
        &self.config
    }

    #[instrument(skip(self), fields(holder = %self.holder))]
    pub async fn execute(&self) -> StreamResult<JobOutcome<CleanupReport>> {
        let run = run_exclusive(
            self.locks.as_ref(),
            CLEANUP_LOCK_KEY,
            &self.holder,
            self.config.lock_timeout,
            || async { Ok(self.trim_streams().await) },
        )
        .await?;

        Ok(match run {
            Some(report) => {
                self.metrics.record_job_run();
                JobOutcome::Ran(report)
            }
            None => {
                self.metrics.record_job_skipped();
                JobOutcome::Skipped
            }
        })
    }

    /// Trim each stream once; a failing stream does not stop the others
    pub async fn trim_streams(&self) -> CleanupReport {
        let mut report = CleanupReport::default();

        for stream in &self.stream_keys {
            match self.broker.trim_approx(stream, self.config.max_length).await {
                Ok(removed) => {
                    report.streams += 1;
                    report.trimmed += removed;
                    self.metrics.record_trimmed(removed);
                    debug!(stream = %stream, removed, max_length = self.config.max_length, "Trimmed stream");
                }
                Err(err) => {
                    error!(stream = %stream, "Failed to trim stream: {}", err);
                    report.failures.push(TrimFailure {
                        stream_key: stream.clone(),
                        reason: err.to_string(),
                    });
                }
            }
        }

        info!(
            streams = report.streams,
            trimmed = report.trimmed,
            failures = report.failures.len(),
            "Stream cleanup finished"
        );
        report
    }
}

#[async_trait]
impl ScheduledTask for StreamCleanupJob {
    fn name(&self) -> &str {
        "stream-cleanup"
    }

    async fn run(&self) -> StreamResult<()> {
        if let JobOutcome::Skipped = self.execute().await? {
            debug!("Cleanup lock held by another node, skipped this tick");
        }
        Ok(())
    }
}
