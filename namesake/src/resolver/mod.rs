//! The batch resolver.
//!
//! Applies five strategies in strict priority order to every row of a batch,
//! touching only rows the earlier layers left unresolved:
//!
//! 1. in-memory override layers (plan, account, hardcode, name, account name)
//! 2. the persistent `enrichment_index` cache, five lookup types per row
//! 3. passthrough of an existing company-id column, with back-flow of the
//!    observed mappings into the cache
//! 4. budgeted synchronous external lookup, grouped per unique customer name
//! 5. deterministic temp-id assignment plus async-queue enqueue
//!
//! All I/O (cache warmer, batch lookup, back-flow, external calls, enqueue)
//! happens on the caller's task and inside the caller's transaction; the
//! resolver never commits. Dependencies are injected, so a resolver with no
//! store and no provider degrades to overrides + temp ids.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, info};

use crate::config::{EqcLookupConfig, LearningConfig};
use crate::error::ResolutionError;
use crate::normalize::normalize_company_name;
use crate::observer::EnrichmentObserver;
use crate::provider::LookupProvider;
use crate::store::MappingStore;
use crate::table::RowTable;
use crate::temp_id::temp_id_for;
use crate::types::EnqueueRequest;

pub mod db_cache;
pub mod external;
pub mod overrides;
pub mod passthrough;
pub mod warming;

#[cfg(test)]
mod tests;

pub use overrides::{OverrideLayer, OverrideMap};

/// Column names and feature flags for one resolution run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolutionStrategy {
    pub plan_code_column: String,
    pub account_number_column: String,
    pub account_name_column: String,
    pub customer_name_column: String,
    /// Column that may already carry a company id worth preserving.
    pub company_id_column: String,
    /// Output column; initialised to NULL and written in place.
    pub output_column: String,
    pub generate_temp_ids: bool,
    pub enable_backflow: bool,
    pub enable_async_queue: bool,
}

impl Default for ResolutionStrategy {
    fn default() -> Self {
        Self {
            plan_code_column: "计划代码".to_string(),
            account_number_column: "年金账户号".to_string(),
            account_name_column: "年金账户名".to_string(),
            customer_name_column: "客户名称".to_string(),
            company_id_column: "公司代码".to_string(),
            output_column: "company_id".to_string(),
            generate_temp_ids: true,
            enable_backflow: true,
            enable_async_queue: true,
        }
    }
}

/// Back-flow insert counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BackflowStats {
    pub inserted: u64,
    pub skipped: u64,
}

/// Counters describing how one batch resolved.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResolutionStatistics {
    pub total_rows: usize,
    /// Override hits per sub-layer label.
    pub yaml_hits: BTreeMap<String, usize>,
    /// DB cache hits per lookup-type label.
    pub db_cache_hits: BTreeMap<String, usize>,
    /// Full decision-path strings and how many rows took each.
    pub db_decision_paths: BTreeMap<String, usize>,
    pub existing_column_hits: usize,
    pub backflow: BackflowStats,
    pub eqc_sync_hits: usize,
    pub budget_consumed: u32,
    pub budget_remaining: u32,
    pub temp_ids_generated: usize,
    pub async_queued: u64,
    pub unresolved: usize,
}

impl ResolutionStatistics {
    pub fn yaml_hits_total(&self) -> usize {
        self.yaml_hits.values().sum()
    }

    pub fn db_cache_hits_total(&self) -> usize {
        self.db_cache_hits.values().sum()
    }
}

/// The orchestrator. Construct with the run's external-lookup config and
/// temp-id salt, then inject whichever collaborators the run has.
pub struct Resolver<'a> {
    eqc: EqcLookupConfig,
    salt: String,
    overrides: OverrideMap,
    learning: LearningConfig,
    store: Option<&'a mut dyn MappingStore>,
    provider: Option<&'a dyn LookupProvider>,
    observer: Option<&'a EnrichmentObserver>,
}

impl<'a> Resolver<'a> {
    pub fn new(eqc: EqcLookupConfig, salt: impl Into<String>) -> Self {
        Self {
            eqc,
            salt: salt.into(),
            overrides: OverrideMap::default(),
            learning: LearningConfig::default(),
            store: None,
            provider: None,
            observer: None,
        }
    }

    pub fn with_overrides(mut self, overrides: OverrideMap) -> Self {
        self.overrides = overrides;
        self
    }

    /// Confidence defaults used for back-flow cache writes.
    pub fn with_learning(mut self, learning: LearningConfig) -> Self {
        self.learning = learning;
        self
    }

    pub fn with_store(mut self, store: &'a mut dyn MappingStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_provider(mut self, provider: &'a dyn LookupProvider) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_observer(mut self, observer: &'a EnrichmentObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Resolve the whole batch in place: the output column is initialised to
    /// NULL and filled layer by layer. Returns the run's statistics.
    pub async fn resolve_batch(
        &mut self,
        table: &mut RowTable,
        strategy: &ResolutionStrategy,
    ) -> Result<ResolutionStatistics, ResolutionError> {
        if !table.has_column(&strategy.customer_name_column) {
            return Err(ResolutionError::MissingColumns {
                missing: vec![strategy.customer_name_column.clone()],
            });
        }

        table.clear_column(&strategy.output_column);

        let mut stats = ResolutionStatistics {
            total_rows: table.len(),
            budget_remaining: self.eqc.sync_budget,
            ..Default::default()
        };

        if let Some(observer) = self.observer {
            for _ in 0..table.len() {
                observer.record_lookup();
            }
        }

        // Pre-batch cache warming: one round-trip for every unique customer
        // name, consulted by the P4 step instead of further I/O.
        let warmed = match self.store.as_deref_mut() {
            Some(store) => warming::warm_cache(table, &strategy.customer_name_column, store).await,
            None => None,
        };

        // Step 1: override layers.
        overrides::apply(table, strategy, &self.overrides, &mut stats, self.observer);
        info!(hits = stats.yaml_hits_total(), "override lookup complete");

        // Step 2: DB cache. A failed batch lookup here is fatal for the
        // batch; everything later in the pipeline is best-effort.
        if table.count_missing(&strategy.output_column) > 0
            && let Some(store) = self.store.as_deref_mut()
        {
            db_cache::apply(
                table,
                strategy,
                store,
                warmed.as_ref(),
                &mut stats,
                self.observer,
            )
            .await?;
            info!(
                hits = stats.db_cache_hits_total(),
                "db cache lookup complete"
            );
        }

        // Step 3: existing-column passthrough, then back-flow what we saw.
        let passthrough_rows = passthrough::apply(table, strategy, &mut stats);
        info!(
            hits = stats.existing_column_hits,
            "existing-column passthrough complete"
        );

        if strategy.enable_backflow
            && !passthrough_rows.is_empty()
            && let Some(store) = self.store.as_deref_mut()
        {
            passthrough::backflow(
                table,
                &passthrough_rows,
                strategy,
                store,
                &self.learning,
                &mut stats,
            )
            .await;
            info!(
                inserted = stats.backflow.inserted,
                skipped = stats.backflow.skipped,
                "back-flow complete"
            );
        }

        // Step 4: budgeted sync lookup.
        if self.eqc.enabled
            && self.eqc.sync_budget > 0
            && table.count_missing(&strategy.output_column) > 0
        {
            if let Some(provider) = self.provider {
                if let Some(store_ref) = self.store.as_deref_mut() {
                    external::apply(
                        table,
                        strategy,
                        &self.eqc,
                        provider,
                        Some(store_ref),
                        &mut stats,
                        self.observer,
                    )
                    .await;
                } else {
                    external::apply(
                        table,
                        strategy,
                        &self.eqc,
                        provider,
                        None,
                        &mut stats,
                        self.observer,
                    )
                    .await;
                }
                info!(
                    hits = stats.eqc_sync_hits,
                    budget_consumed = stats.budget_consumed,
                    budget_remaining = stats.budget_remaining,
                    "external sync lookup complete"
                );
            }
        }

        // Step 5: temp ids for everything still unresolved, then hand the
        // names to the async queue.
        let enqueue_candidates =
            Self::assign_temp_ids(&self.salt, self.observer, table, strategy, &mut stats);
        if strategy.enable_async_queue && !enqueue_candidates.is_empty() {
            if let Some(store) = self.store.as_deref_mut() {
                Self::enqueue_async(store, &enqueue_candidates, &mut stats, self.observer).await;
            }
        }

        stats.unresolved = table.count_missing(&strategy.output_column);
        info!(
            total_rows = stats.total_rows,
            yaml_hits = stats.yaml_hits_total(),
            db_cache_hits = stats.db_cache_hits_total(),
            existing_column_hits = stats.existing_column_hits,
            eqc_sync_hits = stats.eqc_sync_hits,
            temp_ids_generated = stats.temp_ids_generated,
            async_queued = stats.async_queued,
            unresolved = stats.unresolved,
            "batch resolution complete"
        );

        Ok(stats)
    }

    /// Assign temp ids to still-unresolved rows. Rows whose customer name is
    /// NULL, blank, or a known placeholder stay NULL. Returns the enqueue
    /// candidates, deduplicated by normalised name within the batch.
    fn assign_temp_ids(
        salt: &str,
        observer: Option<&EnrichmentObserver>,
        table: &mut RowTable,
        strategy: &ResolutionStrategy,
        stats: &mut ResolutionStatistics,
    ) -> Vec<EnqueueRequest> {
        if !strategy.generate_temp_ids {
            return Vec::new();
        }

        let mut candidates: Vec<EnqueueRequest> = Vec::new();
        let mut seen_normalized: std::collections::BTreeSet<String> =
            std::collections::BTreeSet::new();

        for row in table.rows_missing(&strategy.output_column) {
            let raw_name = table
                .text(row, &strategy.customer_name_column)
                .map(str::to_string);
            let Some(temp_id) = temp_id_for(raw_name.as_deref(), salt) else {
                continue;
            };
            let raw_name = raw_name.unwrap_or_default();

            table.set_value(row, &strategy.output_column, temp_id.clone());
            stats.temp_ids_generated += 1;
            if let Some(observer) = observer {
                observer.record_temp_id(&raw_name, &temp_id);
            }
            debug!(row, "assigned temp id");

            let normalized = normalize_company_name(&raw_name);
            if normalized.is_empty() || !seen_normalized.insert(normalized.clone()) {
                continue;
            }
            candidates.push(EnqueueRequest {
                raw_name,
                normalized_name: normalized,
                temp_id: Some(temp_id),
            });
        }

        candidates
    }

    /// Hand deduplicated unresolved names to the durable queue. Failures are
    /// logged and swallowed; the batch must not fail because the queue is
    /// unavailable.
    async fn enqueue_async(
        store: &mut dyn MappingStore,
        candidates: &[EnqueueRequest],
        stats: &mut ResolutionStatistics,
        observer: Option<&EnrichmentObserver>,
    ) {
        match store.enqueue_for_enrichment(candidates).await {
            Ok(outcome) => {
                stats.async_queued = outcome.queued;
                if let Some(observer) = observer {
                    for _ in 0..outcome.queued {
                        observer.record_async_queued();
                    }
                }
                info!(
                    queued = outcome.queued,
                    skipped = outcome.skipped,
                    "async enqueue complete"
                );
            }
            Err(err) => {
                tracing::warn!(error = %err, count = candidates.len(), "async enqueue failed");
            }
        }
    }
}
