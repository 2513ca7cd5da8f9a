//! Postgres DAO for `enrichment_requests`.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgConnection};
use tracing::{debug, info, instrument, warn};

use super::{QueueError, QueueStats, is_terminal_attempt, next_retry_delay};
use crate::normalize::normalize_company_name;
use crate::types::{LookupRequest, RequestStatus};

const REQUEST_COLUMNS: &str = "id, raw_name, normalized_name, temp_id, status, attempts, \
     last_error, next_retry_at, created_at, updated_at";

#[derive(Debug, FromRow)]
struct RequestRow {
    id: i64,
    raw_name: String,
    normalized_name: String,
    temp_id: Option<String>,
    status: String,
    attempts: i32,
    last_error: Option<String>,
    next_retry_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl RequestRow {
    fn into_request(self) -> Result<LookupRequest, QueueError> {
        let status = RequestStatus::from_db_str(&self.status).ok_or_else(|| {
            QueueError::Store(crate::store::StoreError::Other(anyhow::anyhow!(
                "unknown queue status {:?} for request {}",
                self.status,
                self.id,
            )))
        })?;
        Ok(LookupRequest {
            id: self.id,
            raw_name: self.raw_name,
            normalized_name: self.normalized_name,
            temp_id: self.temp_id,
            status,
            attempts: self.attempts,
            last_error: self.last_error,
            next_retry_at: self.next_retry_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Queue DAO over the caller's connection. Dequeue and the mark operations
/// each want their own short transaction (or autocommit); holding dequeued
/// row locks across provider calls would defeat `SKIP LOCKED`.
pub struct LookupQueue<'c> {
    conn: &'c mut PgConnection,
}

impl<'c> LookupQueue<'c> {
    pub fn new(conn: &'c mut PgConnection) -> Self {
        Self { conn }
    }

    /// Enqueue one lookup request. Returns [`QueueError::DuplicateInFlight`]
    /// when the partial unique index already holds this name.
    #[instrument(skip_all, err)]
    pub async fn enqueue(
        &mut self,
        raw_name: &str,
        normalized_name: Option<&str>,
    ) -> Result<LookupRequest, QueueError> {
        let raw_name = raw_name.trim();
        if raw_name.is_empty() {
            return Err(QueueError::EmptyName);
        }
        let normalized = match normalized_name {
            Some(n) if !n.is_empty() => n.to_string(),
            _ => normalize_company_name(raw_name),
        };

        let row = sqlx::query_as::<_, RequestRow>(&format!(
            "INSERT INTO enrichment_requests \
                 (raw_name, normalized_name, status, attempts, next_retry_at, \
                  created_at, updated_at) \
             VALUES ($1, $2, 'pending', 0, NOW(), NOW(), NOW()) \
             ON CONFLICT DO NOTHING \
             RETURNING {REQUEST_COLUMNS}"
        ))
        .bind(raw_name)
        .bind(&normalized)
        .fetch_optional(&mut *self.conn)
        .await?;

        match row {
            Some(row) => {
                let request = row.into_request()?;
                info!(request_id = request.id, "lookup request enqueued");
                Ok(request)
            }
            None => Err(QueueError::DuplicateInFlight),
        }
    }

    /// Atomically claim up to `batch_size` ready requests, oldest first.
    ///
    /// The CTE takes row locks with `SKIP LOCKED`, so concurrent workers
    /// never double-claim and never wait on each other; the outer UPDATE
    /// flips the claimed rows to `processing`.
    #[instrument(skip(self), err)]
    pub async fn dequeue(&mut self, batch_size: i64) -> Result<Vec<LookupRequest>, QueueError> {
        if batch_size <= 0 {
            return Err(QueueError::InvalidBatchSize);
        }

        let rows = sqlx::query_as::<_, RequestRow>(&format!(
            "WITH ready AS ( \
                 SELECT id FROM enrichment_requests \
                 WHERE status = 'pending' \
                   AND (next_retry_at IS NULL OR next_retry_at <= NOW()) \
                 ORDER BY created_at ASC \
                 LIMIT $1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             UPDATE enrichment_requests AS q \
             SET status = 'processing', updated_at = NOW() \
             FROM ready \
             WHERE q.id = ready.id \
             RETURNING {REQUEST_COLUMNS}"
        ))
        .bind(batch_size)
        .fetch_all(&mut *self.conn)
        .await?;

        let requests = rows
            .into_iter()
            .map(RequestRow::into_request)
            .collect::<Result<Vec<_>, _>>()?;
        info!(
            dequeued_count = requests.len(),
            batch_size, "requests dequeued"
        );
        Ok(requests)
    }

    /// Mark a processing request as successfully resolved.
    #[instrument(skip(self), err)]
    pub async fn mark_done(&mut self, request_id: i64) -> Result<(), QueueError> {
        let result = sqlx::query(
            "UPDATE enrichment_requests \
             SET status = 'done', updated_at = NOW() \
             WHERE id = $1 AND status = 'processing'",
        )
        .bind(request_id)
        .execute(&mut *self.conn)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::NotProcessing(request_id));
        }
        info!(request_id, "request marked done");
        Ok(())
    }

    /// Record failure number `attempts` for a processing request: back to
    /// `pending` with the scheduled retry delay, or terminally `failed` once
    /// the retry budget is spent.
    #[instrument(skip(self, error_message), err)]
    pub async fn mark_failed(
        &mut self,
        request_id: i64,
        error_message: &str,
        attempts: i32,
    ) -> Result<(), QueueError> {
        let error_message = if error_message.is_empty() {
            "unknown error"
        } else {
            error_message
        };

        let result = if is_terminal_attempt(attempts) {
            sqlx::query(
                "UPDATE enrichment_requests \
                 SET status = 'failed', last_error = $1, attempts = $2, \
                     next_retry_at = NULL, updated_at = NOW() \
                 WHERE id = $3 AND status = 'processing'",
            )
            .bind(error_message)
            .bind(attempts)
            .bind(request_id)
            .execute(&mut *self.conn)
            .await?
        } else {
            let next_retry_at = Utc::now() + next_retry_delay(attempts);
            sqlx::query(
                "UPDATE enrichment_requests \
                 SET status = 'pending', last_error = $1, attempts = $2, \
                     next_retry_at = $3, updated_at = NOW() \
                 WHERE id = $4 AND status = 'processing'",
            )
            .bind(error_message)
            .bind(attempts)
            .bind(next_retry_at)
            .bind(request_id)
            .execute(&mut *self.conn)
            .await?
        };

        if result.rows_affected() == 0 {
            return Err(QueueError::NotProcessing(request_id));
        }
        info!(
            request_id,
            attempts,
            will_retry = !is_terminal_attempt(attempts),
            "request marked failed"
        );
        Ok(())
    }

    /// Reset orphaned `processing` rows (worker crashes) back to `pending`,
    /// counting the interruption as a failed attempt with the matching
    /// backoff.
    #[instrument(skip(self), err)]
    pub async fn reset_stale_processing(&mut self, stale_minutes: i32) -> Result<u64, QueueError> {
        let result = sqlx::query(
            "UPDATE enrichment_requests \
             SET status = 'pending', \
                 attempts = attempts + 1, \
                 next_retry_at = NOW() + CASE \
                     WHEN attempts + 1 >= 3 THEN INTERVAL '15 minutes' \
                     WHEN attempts + 1 = 2 THEN INTERVAL '5 minutes' \
                     ELSE INTERVAL '1 minute' \
                 END, \
                 updated_at = NOW() \
             WHERE status = 'processing' \
               AND updated_at < NOW() - make_interval(mins => $1)",
        )
        .bind(stale_minutes)
        .execute(&mut *self.conn)
        .await?;

        let reset_count = result.rows_affected();
        if reset_count > 0 {
            warn!(
                reset_count,
                stale_minutes, "reset stale processing rows to pending"
            );
        } else {
            debug!(stale_minutes, "no stale processing rows");
        }
        Ok(reset_count)
    }

    /// Row counts per status.
    #[instrument(skip(self), err)]
    pub async fn stats(&mut self) -> Result<QueueStats, QueueError> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT status, COUNT(*) FROM enrichment_requests GROUP BY status",
        )
        .fetch_all(&mut *self.conn)
        .await?;

        let mut stats = QueueStats::default();
        for (status, count) in rows {
            match RequestStatus::from_db_str(&status) {
                Some(RequestStatus::Pending) => stats.pending = count,
                Some(RequestStatus::Processing) => stats.processing = count,
                Some(RequestStatus::Done) => stats.done = count,
                Some(RequestStatus::Failed) => stats.failed = count,
                None => warn!(status = %status, "unknown queue status in stats"),
            }
        }
        Ok(stats)
    }

    /// Count of rows in `status`; with `ready_only`, pending rows still
    /// inside their backoff window are excluded. The ready-only pending depth
    /// is the scheduler signal for waking workers.
    #[instrument(skip(self), err)]
    pub async fn depth(
        &mut self,
        status: RequestStatus,
        ready_only: bool,
    ) -> Result<i64, QueueError> {
        let backoff_clause = if status == RequestStatus::Pending && ready_only {
            " AND (next_retry_at IS NULL OR next_retry_at <= NOW())"
        } else {
            ""
        };

        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM enrichment_requests WHERE status = $1{backoff_clause}"
        ))
        .bind(status.as_str())
        .fetch_one(&mut *self.conn)
        .await?;

        Ok(count)
    }
}
