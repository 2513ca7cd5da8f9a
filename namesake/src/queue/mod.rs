//! Durable async lookup queue over `enrichment_requests`.
//!
//! Rows move `pending -> processing -> done`, or back to `pending` with a
//! bounded exponential backoff on failure, or to terminal `failed` after
//! [`MAX_RETRY_ATTEMPTS`]. Concurrency safety comes from the database: the
//! dequeue is a single CTE with `FOR UPDATE SKIP LOCKED`, and a partial
//! unique index keeps at most one in-flight row per normalised name.

use chrono::Duration;
use serde::Serialize;
use thiserror::Error;

use crate::store::StoreError;

#[cfg(feature = "postgres")]
mod dao;
#[cfg(feature = "postgres")]
pub mod worker;

#[cfg(feature = "postgres")]
pub use dao::LookupQueue;
#[cfg(feature = "postgres")]
pub use worker::{QueueWorker, WorkerConfig, WorkerTick};

/// Attempts after which a request is permanently failed.
pub const MAX_RETRY_ATTEMPTS: i32 = 3;

/// Backoff schedule in minutes for attempts 1, 2, 3; clamped at the last
/// entry.
pub const BACKOFF_SCHEDULE_MINUTES: [i64; 3] = [1, 5, 15];

/// Default threshold after which a `processing` row counts as orphaned.
pub const DEFAULT_STALE_PROCESSING_MINUTES: i32 = 15;

/// Delay before the retry following failure number `attempts` (1-based).
pub fn next_retry_delay(attempts: i32) -> Duration {
    let idx = (attempts - 1).clamp(0, BACKOFF_SCHEDULE_MINUTES.len() as i32 - 1) as usize;
    Duration::minutes(BACKOFF_SCHEDULE_MINUTES[idx])
}

/// Whether failure number `attempts` exhausts the retry budget.
pub fn is_terminal_attempt(attempts: i32) -> bool {
    attempts >= MAX_RETRY_ATTEMPTS
}

/// Per-status row counts for monitoring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub done: i64,
    pub failed: i64,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("batch size must be positive")]
    InvalidBatchSize,

    #[error("name cannot be empty")]
    EmptyName,

    /// The partial unique index already holds an in-flight row for this
    /// normalised name.
    #[error("a request for this name is already in flight")]
    DuplicateInFlight,

    /// mark_done / mark_failed found no row in `processing`.
    #[error("request {0} not found or not in processing state")]
    NotProcessing(i64),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for QueueError {
    fn from(err: sqlx::Error) -> Self {
        QueueError::Store(StoreError::from(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, 1)]
    #[case(1, 1)]
    #[case(2, 5)]
    #[case(3, 15)]
    #[case(4, 15)]
    #[case(100, 15)]
    fn backoff_schedule_is_bounded(#[case] attempts: i32, #[case] expected_minutes: i64) {
        assert_eq!(
            next_retry_delay(attempts),
            Duration::minutes(expected_minutes)
        );
    }

    #[test]
    fn third_failure_is_terminal() {
        assert!(!is_terminal_attempt(1));
        assert!(!is_terminal_attempt(2));
        assert!(is_terminal_attempt(3));
        assert!(is_terminal_attempt(4));
    }
}
