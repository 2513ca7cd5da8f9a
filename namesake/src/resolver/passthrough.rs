//! Step 3 — existing-column passthrough and back-flow.
//!
//! Rows sometimes arrive with a usable company id already in them. Those ids
//! are copied to the output column, and — because an observed `(alias -> id)`
//! pair is exactly what the cache exists to remember — the surrounding weak
//! keys are written back into `enrichment_index` so the next month's batch
//! resolves from cache instead.

use tracing::{debug, warn};

use super::{BackflowStats, ResolutionStatistics, ResolutionStrategy};
use crate::config::LearningConfig;
use crate::normalize::normalize_company_name;
use crate::store::MappingStore;
use crate::table::RowTable;
use crate::types::{IndexUpsert, LookupType, SourceType, is_temp_company_id, is_valid_company_id};

/// Copy valid existing ids into the output column for still-unresolved rows.
/// Returns the indices of rows resolved here, for back-flow.
pub(crate) fn apply(
    table: &mut RowTable,
    strategy: &ResolutionStrategy,
    stats: &mut ResolutionStatistics,
) -> Vec<usize> {
    if !table.has_column(&strategy.company_id_column) {
        return Vec::new();
    }

    let mut resolved_rows = Vec::new();
    for row in table.rows_missing(&strategy.output_column) {
        let Some(existing) = table
            .text(row, &strategy.company_id_column)
            .map(str::to_string)
        else {
            continue;
        };
        if !is_valid_company_id(&existing) {
            continue;
        }
        table.set_value(row, &strategy.output_column, existing);
        stats.existing_column_hits += 1;
        resolved_rows.push(row);
    }

    debug!(
        hits = stats.existing_column_hits,
        "existing-column passthrough"
    );
    resolved_rows
}

/// The weak-key fields written back per resolved row. Only the customer name
/// is normalised; the other keys are stored raw.
const BACKFLOW_FIELDS: [(LookupType, bool); 4] = [
    (LookupType::PlanCode, false),
    (LookupType::AccountNumber, false),
    (LookupType::CustomerName, true),
    (LookupType::AccountName, false),
];

/// Write observed mappings back into the cache. Best-effort: failures are
/// logged and the batch continues.
pub(crate) async fn backflow(
    table: &RowTable,
    resolved_rows: &[usize],
    strategy: &ResolutionStrategy,
    store: &mut dyn MappingStore,
    learning: &LearningConfig,
    stats: &mut ResolutionStatistics,
) {
    let mut upserts: Vec<IndexUpsert> = Vec::new();

    for &row in resolved_rows {
        let Some(company_id) = table.text(row, &strategy.output_column) else {
            continue;
        };
        // Temp ids are placeholders, not knowledge; never learn them.
        if is_temp_company_id(company_id) {
            continue;
        }
        let company_id = company_id.to_string();

        for (lookup_type, needs_normalization) in BACKFLOW_FIELDS {
            let column = match lookup_type {
                LookupType::PlanCode => &strategy.plan_code_column,
                LookupType::AccountNumber => &strategy.account_number_column,
                LookupType::CustomerName => &strategy.customer_name_column,
                LookupType::AccountName => &strategy.account_name_column,
                LookupType::PlanCustomer => continue,
            };
            let Some(alias) = table.text(row, column) else {
                continue;
            };
            let alias = if needs_normalization {
                let normalized = normalize_company_name(alias);
                if normalized.is_empty() {
                    continue;
                }
                normalized
            } else {
                alias.to_string()
            };

            upserts.push(IndexUpsert::new(
                alias,
                lookup_type,
                company_id.clone(),
                learning.confidence_for(lookup_type),
                SourceType::PipelineBackflow,
            ));
        }
    }

    if upserts.is_empty() {
        return;
    }

    match store.upsert_index_batch(&upserts).await {
        Ok(outcome) => {
            stats.backflow = BackflowStats {
                inserted: outcome.inserted,
                skipped: outcome.skipped,
            };
        }
        Err(err) => {
            warn!(error = %err, count = upserts.len(), "back-flow insert failed");
        }
    }
}
