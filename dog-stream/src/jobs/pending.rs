use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use super::{lock_holder, JobOutcome};
use crate::{
    broker::SharedBroker,
    config::PendingMessageConfig,
    listener::{ListenerRegistry, StreamTarget},
    lock::{run_exclusive, SharedLockProvider},
    observability::MessagingMetrics,
    schedule::ScheduledTask,
    types::{PendingEntry, RecordId},
    StreamResult,
};

/// Cluster lock guarding the resend job
pub const RESEND_LOCK_KEY: &str = "redis:stream:pending-message-resend:lock";

/// One redelivered record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResendMapping {
    pub stream_key: String,
    pub group: String,
    pub consumer: String,
    pub original: RecordId,
    pub resent: RecordId,
    pub delivery_count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResendReport {
    /// Pending entries inspected
    pub scanned: usize,
    pub resent: usize,
    /// Entries whose record was already trimmed; acknowledged and dropped
    pub stale_acked: usize,
    /// Entries not yet idle long enough
    pub skipped_fresh: usize,
    pub mappings: Vec<ResendMapping>,
}

/// Redelivers records that were delivered but never acknowledged
///
/// An entry idle for at least `expire_time` is re-appended to its stream as
/// a new record and the original is acknowledged. The new record flows
/// through normal dispatch, so handlers must be idempotent.
pub struct PendingMessageResendJob {
    broker: SharedBroker,
    targets: Vec<StreamTarget>,
    locks: SharedLockProvider,
    config: PendingMessageConfig,
    holder: String,
    metrics: Arc<MessagingMetrics>,
}

impl PendingMessageResendJob {
    pub fn new(
        broker: SharedBroker,
        registry: &ListenerRegistry,
        locks: SharedLockProvider,
        config: PendingMessageConfig,
    ) -> Self {
        Self {
            broker,
            targets: registry.stream_targets(),
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

    pub fn config(&self) -> &PendingMessageConfig {
        &self.config
    }

    /// Take the cluster lock and resend, or skip if another node holds it
    #[instrument(skip(self), fields(holder = %self.holder))]
    pub async fn execute(&self) -> StreamResult<JobOutcome<ResendReport>> {
        let run = run_exclusive(
            self.locks.as_ref(),
            RESEND_LOCK_KEY,
            &self.holder,
            self.config.lock_timeout,
            || self.resend_pending(),
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

    /// One scan-and-resend pass over every registered group, without locking
    pub async fn resend_pending(&self) -> StreamResult<ResendReport> {
        let mut report = ResendReport::default();

        for target in &self.targets {
            let summary = self
                .broker
                .pending_summary(&target.stream_key, &target.group)
                .await?;
            if summary.is_empty() {
                continue;
            }

            for consumer in summary.consumers.iter().filter(|c| c.pending > 0) {
                let entries = self
                    .broker
                    .pending_entries(
                        &target.stream_key,
                        &target.group,
                        &consumer.name,
                        consumer.pending as usize,
                    )
                    .await?;

                for entry in entries {
                    report.scanned += 1;
                    if !entry.is_expired(self.config.expire_time) {
                        report.skipped_fresh += 1;
                        continue;
                    }
                    self.redeliver(target, entry, &mut report).await?;
                }
            }
        }

        if report.resent > 0 || report.stale_acked > 0 {
            info!(
                scanned = report.scanned,
                resent = report.resent,
                stale_acked = report.stale_acked,
                "Pending message resend finished"
            );
        } else {
            debug!(scanned = report.scanned, "No pending messages to resend");
        }
        Ok(report)
    }

    async fn redeliver(
        &self,
        target: &StreamTarget,
        entry: PendingEntry,
        report: &mut ResendReport,
    ) -> StreamResult<()> {
        let stream = target.stream_key.as_str();
        let group = target.group.as_str();

        let Some(record) = self.broker.read_record(stream, &entry.id).await? else {
            self.broker.ack(stream, group, std::slice::from_ref(&entry.id)).await?;
            report.stale_acked += 1;
            self.metrics.record_stale_acked();
            warn!(
                stream = %stream,
                group = %group,
                record_id = %entry.id,
                "Pending record no longer exists, acknowledged stale entry"
            );
            return Ok(());
        };

        let resent = self.broker.append(stream, &record.body).await?;
        self.broker.ack(stream, group, std::slice::from_ref(&entry.id)).await?;
        self.metrics.record_resent();

        info!(
            stream = %stream,
            group = %group,
            consumer = %entry.consumer,
            record_id = %entry.id,
            resent_id = %resent,
            idle_ms = entry.idle.as_millis() as u64,
            "Resent pending record {} as {}",
            entry.id,
            resent
        );

        report.resent += 1;
        report.mappings.push(ResendMapping {
            stream_key: target.stream_key.clone(),
            group: target.group.clone(),
            consumer: entry.consumer,
            original: entry.id,
            resent,
            delivery_count: entry.delivery_count,
        });
        Ok(())
    }
}

#[async_trait]
impl ScheduledTask for PendingMessageResendJob {
    fn name(&self) -> &str {
        "pending-message-resend"
    }

    async fn run(&self) -> StreamResult<()> {
        if let JobOutcome::Skipped = self.execute().await? {
            debug!("Resend lock held by another node, skipped this tick");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{MemoryBroker, StreamBroker};
    use crate::listener::Delivery;
    use crate::lock::MemoryLockProvider;
    use std::time::Duration;

    const EXPIRE: Duration = Duration::from_secs(300);

    async fn setup() -> (MemoryBroker, PendingMessageResendJob) {
        let broker = MemoryBroker::new();
        broker.create_group("orders", "svc-a").await.unwrap();

        let mut registry = ListenerRegistry::new();
        registry
            .register_stream("orders", "svc-a", |_d: Delivery| async { Ok(()) })
            .unwrap();

        let job = PendingMessageResendJob::new(
            Arc::new(broker.clone()),
            &registry,
            Arc::new(MemoryLockProvider::new()),
            PendingMessageConfig {
                expire_time: EXPIRE,
                ..PendingMessageConfig::default()
            },
        );
        (broker, job)
    }

    async fn deliver(broker: &MemoryBroker, body: &str) -> RecordId {
        let id = broker.append("orders", body).await.unwrap();
        broker
            .read_group("orders", "svc-a", "crashed@1", 10, Duration::ZERO)
            .await
            .unwrap();
        id
    }

    #[tokio::test]
    async fn test_nothing_pending_is_a_noop() {
        let (broker, job) = setup().await;
        let report = job.resend_pending().await.unwrap();
        assert_eq!(report, ResendReport::default());
        assert_eq!(broker.stream_len("orders").await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trimmed_record_is_acked_not_resent() {
        let (broker, job) = setup().await;
        deliver(&broker, r#"{"payload":1}"#).await;
        for _ in 0..40 {
            broker.append("orders", "{}").await.unwrap();
        }
        broker.trim_approx("orders", 0).await.unwrap();
        broker.age_all_pending("orders", "svc-a", EXPIRE);

        let len_before = broker.stream_len("orders").await.unwrap();
        let report = job.resend_pending().await.unwrap();

        assert_eq!(report.stale_acked, 1);
        assert_eq!(report.resent, 0);
        assert_eq!(broker.stream_len("orders").await.unwrap(), len_before);
        assert!(broker.pending_summary("orders", "svc-a").await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resent_record_keeps_body_and_gets_newer_id() {
        let (broker, job) = setup().await;
        let original = deliver(&broker, r#"{"payload":{"orderId":1001}}"#).await;
        broker.age_pending("orders", "svc-a", &original, EXPIRE + Duration::from_secs(1));

        let outcome = job.execute().await.unwrap();
        let report = outcome.into_report().unwrap();

        assert_eq!(report.resent, 1);
        let mapping = &report.mappings[0];
        assert_eq!(mapping.original, original);
        assert_eq!(mapping.consumer, "crashed@1");
        assert!(mapping.resent > original);

        let records = broker.records("orders");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].body, records[1].body);
    }

    #[tokio::test(start_paused = true)]
    #[tracing_test::traced_test]
    async fn test_resend_logs_id_mapping() {
        let (broker, job) = setup().await;
        let original = deliver(&broker, r#"{"payload":2}"#).await;
        broker.age_all_pending("orders", "svc-a", EXPIRE);

        let report = job.resend_pending().await.unwrap();
        let resent = &report.mappings[0].resent;

        assert!(logs_contain(&format!("Resent pending record {} as {}", original, resent)));
    }
}
