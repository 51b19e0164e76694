use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cron::Schedule;
use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::{StreamError, StreamResult};

/// A parsed six-field cron expression (`sec min hour day month weekday`)
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    schedule: Schedule,
}

impl CronSchedule {
    /// Parse a cron expression; `?` is accepted as "any" in the day fields
    pub fn parse(expression: &str) -> StreamResult<Self> {
        let normalized = expression.trim().replace('?', "*");
        let schedule = Schedule::from_str(&normalized).map_err(|e| StreamError::InvalidCron {
            expression: expression.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            expression: expression.trim().to_string(),
            schedule,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Next fire time strictly after `after`
    pub fn next_after(&self, after: &DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(after).next()
    }

    /// Time to wait from `now` until the next fire time
    pub fn until_next(&self, now: &DateTime<Utc>) -> Option<Duration> {
        let next = self.next_after(now)?;
        Some((next - *now).to_std().unwrap_or(Duration::ZERO))
    }
}

/// Work run on every tick of a schedule
#[async_trait]
pub trait ScheduledTask: Send + Sync {
    fn name(&self) -> &str;

    /// One scheduled run; errors are logged by the runner and the next tick proceeds
    async fn run(&self) -> StreamResult<()>;
}

/// Run `task` on `schedule` until `shutdown` flips to `true`
pub fn spawn_scheduled(
    task: Arc<dyn ScheduledTask>,
    schedule: CronSchedule,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(task = task.name(), cron = schedule.expression(), "Scheduled task started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            let Some(wait) = schedule.until_next(&Utc::now()) else {
                warn!(task = task.name(), cron = schedule.expression(), "Schedule has no future fire times");
                break;
            };

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(wait) => {}
            }

            debug!(task = task.name(), "Scheduled task tick");
            match AssertUnwindSafe(task.run()).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => error!(task = task.name(), "Scheduled run failed: {}", err),
                Err(_) => error!(task = task.name(), "Scheduled run panicked"),
            }
        }

        info!(task = task.name(), "Scheduled task stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_parse_accepts_question_mark() {
        let schedule = CronSchedule::parse("0 0 * * * ?").unwrap();
        assert_eq!(schedule.expression(), "0 0 * * * ?");

        let from = Utc.with_ymd_and_hms(2024, 3, 1, 10, 15, 0).unwrap();
        let next = schedule.next_after(&from).unwrap();
        assert_eq!((next.hour(), next.minute(), next.second()), (11, 0, 0));
    }

    #[test]
    fn test_default_resend_cron_fires_at_second_35() {
        let schedule = CronSchedule::parse("35 * * * * *").unwrap();
        let from = Utc.with_ymd_and_hms(2024, 3, 1, 10, 15, 40).unwrap();
        let wait = schedule.until_next(&from).unwrap();
        assert_eq!(wait, Duration::from_secs(55));
    }

    #[test]
    fn test_invalid_cron_is_rejected() {
        let err = CronSchedule::parse("every five minutes").unwrap_err();
        assert!(matches!(err, StreamError::InvalidCron { .. }));
    }

    struct Counting {
        runs: AtomicUsize,
    }

    #[async_trait]
    impl ScheduledTask for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        async fn run(&self) -> StreamResult<()> {
            let n = self.runs.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                return Err(StreamError::transport("first run fails"));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_runner_survives_failing_runs_and_stops_on_shutdown() {
        let task = Arc::new(Counting {
            runs: AtomicUsize::new(0),
        });
        let (tx, rx) = watch::channel(false);
        let handle = spawn_scheduled(task.clone(), CronSchedule::parse("* * * * * *").unwrap(), rx);

        tokio::time::sleep(Duration::from_millis(2500)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert!(task.runs.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_runner_stops_when_shutdown_sender_is_dropped() {
        let task = Arc::new(Counting {
            runs: AtomicUsize::new(0),
        });
        let (tx, rx) = watch::channel(false);
        let handle = spawn_scheduled(task.clone(), CronSchedule::parse("0 0 0 1 1 *").unwrap(), rx);

        drop(tx);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("runner should stop once the sender is gone")
            .unwrap();
        assert_eq!(task.runs.load(Ordering::SeqCst), 0);
    }
}
