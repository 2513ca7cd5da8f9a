//! Step 4 — budgeted synchronous external lookup.
//!
//! Unresolved rows are grouped by normalised customer name so the budget is
//! spent per unique name, never per row; a successful lookup resolves every
//! row in its group. The provider's own atomic budget counter is
//! authoritative: this step reads it back for the statistics and never keeps
//! a parallel count. Results are staged and written to the cache in one
//! conflict-aware batch after the loop.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use tracing::{debug, warn};

use super::{ResolutionStatistics, ResolutionStrategy};
use crate::config::EqcLookupConfig;
use crate::normalize::normalize_company_name;
use crate::observer::EnrichmentObserver;
use crate::provider::{LookupProvider, ProviderError};
use crate::store::MappingStore;
use crate::table::RowTable;
use crate::types::{IndexUpsert, LookupType, SourceType};

/// Confidence attached to externally confirmed mappings; above the learning
/// and back-flow defaults so an external answer can overwrite them.
pub fn eqc_confidence() -> Decimal {
    Decimal::new(95, 2)
}

/// One group of unresolved rows sharing a normalised customer name.
struct NameGroup {
    exemplar_raw: String,
    rows: Vec<usize>,
}

pub(crate) async fn apply(
    table: &mut RowTable,
    strategy: &ResolutionStrategy,
    eqc: &EqcLookupConfig,
    provider: &dyn LookupProvider,
    store: Option<&mut dyn MappingStore>,
    stats: &mut ResolutionStatistics,
    observer: Option<&EnrichmentObserver>,
) {
    // Align the provider budget with this run's configured budget.
    if provider.budget() != eqc.sync_budget {
        provider.set_budget(eqc.sync_budget);
    }

    let mut groups: BTreeMap<String, NameGroup> = BTreeMap::new();
    for row in table.rows_missing(&strategy.output_column) {
        let Some(raw_name) = table.text(row, &strategy.customer_name_column) else {
            continue;
        };
        let normalized = {
            let normalized = normalize_company_name(raw_name);
            if normalized.is_empty() {
                raw_name.to_string()
            } else {
                normalized
            }
        };
        groups
            .entry(normalized)
            .or_insert_with(|| NameGroup {
                exemplar_raw: raw_name.to_string(),
                rows: Vec::new(),
            })
            .rows
            .push(row);
    }

    let mut staged: Vec<IndexUpsert> = Vec::new();

    for (normalized, group) in &groups {
        if !provider.is_available() {
            debug!("provider unavailable, stopping external lookups");
            break;
        }

        match provider.lookup(&group.exemplar_raw).await {
            Ok(Some(hit)) => {
                if let Some(observer) = observer {
                    observer.record_api_call();
                }
                for &row in &group.rows {
                    table.set_value(row, &strategy.output_column, hit.company_id.clone());
                }
                stats.eqc_sync_hits += group.rows.len();
                staged.push(IndexUpsert::new(
                    normalized.clone(),
                    LookupType::CustomerName,
                    hit.company_id,
                    eqc_confidence(),
                    SourceType::Eqc,
                ));
            }
            Ok(None) => {
                if let Some(observer) = observer {
                    observer.record_api_call();
                }
                debug!("provider had no match for group");
            }
            Err(ProviderError::BudgetExhausted) => {
                debug!("provider budget exhausted mid-loop");
                break;
            }
            Err(err) => {
                if let Some(observer) = observer {
                    observer.record_api_call();
                }
                // Local to this group; the rows fall through to temp ids.
                warn!(error_kind = %error_kind(&err), "external lookup failed");
            }
        }
    }

    stats.budget_remaining = provider.remaining_budget();
    stats.budget_consumed = eqc.sync_budget.saturating_sub(provider.remaining_budget());

    // Cache what the provider confirmed; duplicates within the batch are
    // deduplicated by the store. Best-effort.
    if !staged.is_empty()
        && let Some(store) = store
        && let Err(err) = store.upsert_index_batch(&staged).await
    {
        warn!(error = %err, count = staged.len(), "caching external results failed");
    }
}

fn error_kind(err: &ProviderError) -> &'static str {
    match err {
        ProviderError::BudgetExhausted => "budget_exhausted",
        ProviderError::Transport(_) => "transport",
        ProviderError::InvalidResponse(_) => "invalid_response",
    }
}
