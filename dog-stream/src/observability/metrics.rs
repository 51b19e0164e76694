use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Live counters for the messaging layer
///
/// Shared by the producer, the dispatch container and both jobs.
#[derive(Debug, Default)]
pub struct MessagingMetrics {
    published: AtomicU64,
    publish_failed: AtomicU64,
    delivered: AtomicU64,
    handler_failed: AtomicU64,
    acknowledged: AtomicU64,
    resent: AtomicU64,
    stale_acked: AtomicU64,
    trimmed: AtomicU64,
    job_runs: AtomicU64,
    job_skips: AtomicU64,
}

/// Point-in-time copy of [`MessagingMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub published: u64,
    pub publish_failed: u64,
    pub delivered: u64,
    pub handler_failed: u64,
    pub acknowledged: u64,
    pub resent: u64,
    pub stale_acked: u64,
    pub trimmed: u64,
    pub job_runs: u64,
    pub job_skips: u64,
    pub taken_at: Option<DateTime<Utc>>,
}

impl MessagingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_publish_failed(&self) {
        self.publish_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_handler_failed(&self) {
        self.handler_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_acknowledged(&self) {
        self.acknowledged.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_resent(&self) {
        self.resent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_acked(&self) {
        self.stale_acked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_trimmed(&self, count: u64) {
        self.trimmed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_job_run(&self) {
        self.job_runs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_job_skipped(&self) {
        self.job_skips.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            publish_failed: self.publish_failed.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            handler_failed: self.handler_failed.load(Ordering::Relaxed),
            acknowledged: self.acknowledged.load(Ordering::Relaxed),
            resent: self.resent.load(Ordering::Relaxed),
            stale_acked: self.stale_acked.load(Ordering::Relaxed),
            trimmed: self.trimmed.load(Ordering::Relaxed),
            job_runs: self.job_runs.load(Ordering::Relaxed),
            job_skips: self.job_skips.load(Ordering::Relaxed),
            taken_at: Some(Utc::now()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let metrics = MessagingMetrics::new();
        metrics.record_published();
        metrics.record_published();
        metrics.record_trimmed(32);
        metrics.record_job_skipped();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.published, 2);
        assert_eq!(snapshot.trimmed, 32);
        assert_eq!(snapshot.job_skips, 1);
        assert_eq!(snapshot.delivered, 0);

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["trimmed"], 32);
    }
}
