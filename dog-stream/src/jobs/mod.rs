//! Scheduled maintenance jobs.
//!
//! Both jobs take a cluster lock before touching the broker, so only one
//! node acts per tick.

pub mod cleanup;
pub mod pending;

use uuid::Uuid;

use crate::types::consumer_name;

pub use cleanup::{CleanupReport, StreamCleanupJob, TrimFailure, CLEANUP_LOCK_KEY};
pub use pending::{PendingMessageResendJob, ResendMapping, ResendReport, RESEND_LOCK_KEY};

/// Result of one job execution
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome<R> {
    /// The lock was ours and the job ran
    Ran(R),
    /// Another node held the lock; nothing was done
    Skipped,
}

impl<R> JobOutcome<R> {
    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped)
    }

    pub fn report(&self) -> Option<&R> {
        match self {
            Self::Ran(report) => Some(report),
            Self::Skipped => None,
        }
    }

    pub fn into_report(self) -> Option<R> {
        match self {
            Self::Ran(report) => Some(report),
            Self::Skipped => None,
        }
    }
}

/// Unique lock token for one job instance
pub(crate) fn lock_holder() -> String {
    format!("{}#{}", consumer_name(), Uuid::new_v4())
}
