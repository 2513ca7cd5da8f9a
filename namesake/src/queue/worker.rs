//! Background worker that drains the async lookup queue.
//!
//! Each tick runs stale recovery, claims a batch, and resolves every claimed
//! request against the external provider. Successful lookups are written to
//! the enrichment cache before the row is marked done, so the next batch of
//! the pipeline hits the cache instead of the provider. Multiple workers can
//! run concurrently; the dequeue's row locks keep them out of each other's
//! way.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tracing::{debug, error, info, instrument, warn};

use super::{LookupQueue, QueueError};
use crate::provider::{LookupProvider, ProviderError};
use crate::resolver::external::eqc_confidence;
use crate::store::{MappingStore, PgMappingStore, StoreError};
use crate::types::{IndexUpsert, LookupType, SourceType};

/// Worker tuning knobs.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum requests claimed per tick.
    pub batch_size: i64,
    /// Sleep between ticks.
    pub poll_interval: Duration,
    /// Age on `updated_at` after which a `processing` row is recovered.
    pub stale_after_minutes: i32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            poll_interval: Duration::from_secs(30),
            stale_after_minutes: super::DEFAULT_STALE_PROCESSING_MINUTES,
        }
    }
}

/// Counts from one worker tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerTick {
    pub recovered: u64,
    pub dequeued: usize,
    pub done: usize,
    pub retried: usize,
    pub failed: usize,
}

/// Queue drainer bound to a pool and a shared provider.
pub struct QueueWorker<P: LookupProvider> {
    pool: PgPool,
    provider: Arc<P>,
    config: WorkerConfig,
}

impl<P: LookupProvider> QueueWorker<P> {
    pub fn new(pool: PgPool, provider: Arc<P>) -> Self {
        Self {
            pool,
            provider,
            config: WorkerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// One recovery + claim + drain pass.
    #[instrument(skip(self), err)]
    pub async fn run_once(&self) -> Result<WorkerTick, QueueError> {
        let mut conn = self.pool.acquire().await.map_err(StoreError::from)?;
        let mut tick = WorkerTick::default();

        tick.recovered = LookupQueue::new(&mut conn)
            .reset_stale_processing(self.config.stale_after_minutes)
            .await?;

        let requests = LookupQueue::new(&mut conn)
            .dequeue(self.config.batch_size)
            .await?;
        tick.dequeued = requests.len();

        for request in requests {
            let outcome = if self.provider.is_available() {
                self.provider.lookup(&request.raw_name).await
            } else {
                Err(ProviderError::BudgetExhausted)
            };

            match outcome {
                Ok(Some(hit)) => {
                    let upsert = IndexUpsert::new(
                        request.normalized_name.clone(),
                        LookupType::CustomerName,
                        hit.company_id,
                        eqc_confidence(),
                        SourceType::Eqc,
                    );
                    // Cache write is best-effort: a resolved row must still be
                    // marked done even if the cache insert fails.
                    if let Err(err) = PgMappingStore::new(&mut conn)
                        .upsert_index_batch(&[upsert])
                        .await
                    {
                        warn!(request_id = request.id, error = %err, "cache write for resolved request failed");
                    }
                    match LookupQueue::new(&mut conn).mark_done(request.id).await {
                        Ok(()) => tick.done += 1,
                        Err(err) => {
                            error!(request_id = request.id, error = %err, "mark_done failed");
                        }
                    }
                }
                Ok(None) => {
                    self.fail_request(
                        &mut conn,
                        &request,
                        "provider returned no results",
                        &mut tick,
                    )
                    .await;
                }
                Err(err) => {
                    self.fail_request(&mut conn, &request, &err.to_string(), &mut tick)
                        .await;
                }
            }
        }

        info!(
            recovered = tick.recovered,
            dequeued = tick.dequeued,
            done = tick.done,
            retried = tick.retried,
            failed = tick.failed,
            "queue worker tick"
        );
        Ok(tick)
    }

    async fn fail_request(
        &self,
        conn: &mut sqlx::PgConnection,
        request: &crate::types::LookupRequest,
        reason: &str,
        tick: &mut WorkerTick,
    ) {
        let attempts = request.attempts + 1;
        // A mark_failed that itself fails is swallowed so the original
        // provider error is not lost; stale recovery will pick the row up.
        match LookupQueue::new(conn)
            .mark_failed(request.id, reason, attempts)
            .await
        {
            Ok(()) => {
                if super::is_terminal_attempt(attempts) {
                    tick.failed += 1;
                } else {
                    tick.retried += 1;
                }
            }
            Err(err) => {
                warn!(request_id = request.id, error = %err, "mark_failed itself failed");
            }
        }
    }

    /// Drain on an interval until `shutdown` resolves.
    pub async fn run(self, shutdown: impl Future<Output = ()> + Send) {
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("queue worker shutting down");
                    return;
                }
                _ = interval.tick() => {
                    match self.run_once().await {
                        Ok(tick) if tick.dequeued == 0 => {
                            debug!("queue empty");
                        }
                        Ok(_) => {}
                        Err(err) => {
                            error!(error = %err, "queue worker tick failed");
                        }
                    }
                }
            }
        }
    }
}
