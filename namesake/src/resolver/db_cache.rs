//! Step 2 — the persistent cache layer.
//!
//! Collects candidate keys for every unresolved row across the five lookup
//! types, fetches them in one batched round-trip, then walks each row through
//! the fixed priority order `plan_code -> account_name -> account_number ->
//! customer_name -> plan_customer`, taking the first key whose cached id is
//! non-empty and not a sentinel. Every row's walk is recorded as a decision
//! path like `DB-P1:MISS→DB-P2:HIT` for debugging.

use std::collections::{BTreeSet, HashMap};

use tracing::{debug, info, warn};

use super::{ResolutionStatistics, ResolutionStrategy};
use crate::error::ResolutionError;
use crate::normalize::normalize_company_name;
use crate::observer::EnrichmentObserver;
use crate::store::{KeysByType, MappingStore};
use crate::table::RowTable;
use crate::types::{LookupType, is_valid_company_id};

/// Candidate keys for one row, in priority order slots.
struct RowCandidates {
    plan_code: Option<String>,
    account_name: Option<String>,
    account_number: Option<String>,
    customer_name: Option<String>,
    plan_customer: Option<String>,
}

impl RowCandidates {
    fn collect(table: &RowTable, row: usize, strategy: &ResolutionStrategy) -> Self {
        let plan_code = table
            .text(row, &strategy.plan_code_column)
            .map(str::to_string);
        let account_name = table
            .text(row, &strategy.account_name_column)
            .map(str::to_string);
        let account_number = table
            .text(row, &strategy.account_number_column)
            .map(str::to_string);
        let customer_name = table
            .text(row, &strategy.customer_name_column)
            .map(normalize_company_name)
            .filter(|name| !name.is_empty());
        let plan_customer = match (&plan_code, &customer_name) {
            (Some(plan), Some(customer)) => Some(format!("{plan}|{customer}")),
            _ => None,
        };
        Self {
            plan_code,
            account_name,
            account_number,
            customer_name,
            plan_customer,
        }
    }

    fn get(&self, lookup_type: LookupType) -> Option<&str> {
        match lookup_type {
            LookupType::PlanCode => self.plan_code.as_deref(),
            LookupType::AccountName => self.account_name.as_deref(),
            LookupType::AccountNumber => self.account_number.as_deref(),
            LookupType::CustomerName => self.customer_name.as_deref(),
            LookupType::PlanCustomer => self.plan_customer.as_deref(),
        }
    }
}

/// Resolve unresolved rows against `enrichment_index`.
///
/// When the cache warmer already fetched the customer-name dimension, its hit
/// map is consulted for P4 instead of re-querying those keys.
pub(crate) async fn apply(
    table: &mut RowTable,
    strategy: &ResolutionStrategy,
    store: &mut dyn MappingStore,
    warmed: Option<&HashMap<String, String>>,
    stats: &mut ResolutionStatistics,
    observer: Option<&EnrichmentObserver>,
) -> Result<(), ResolutionError> {
    for lookup_type in LookupType::PRIORITY_ORDER {
        stats
            .db_cache_hits
            .insert(lookup_type.as_str().to_string(), 0);
    }

    let missing = table.rows_missing(&strategy.output_column);
    if missing.is_empty() {
        return Ok(());
    }

    let candidates: Vec<(usize, RowCandidates)> = missing
        .iter()
        .map(|&row| (row, RowCandidates::collect(table, row, strategy)))
        .collect();

    // One batched lookup for every candidate key. The customer-name dimension
    // is omitted when the warmer already holds it.
    let mut keys_by_type: KeysByType = KeysByType::new();
    for (_, row_candidates) in &candidates {
        for lookup_type in LookupType::PRIORITY_ORDER {
            if lookup_type == LookupType::CustomerName && warmed.is_some() {
                continue;
            }
            if let Some(key) = row_candidates.get(lookup_type) {
                keys_by_type
                    .entry(lookup_type)
                    .or_insert_with(BTreeSet::new)
                    .insert(key.to_string());
            }
        }
    }
    keys_by_type.retain(|_, keys| !keys.is_empty());

    let hits = if keys_by_type.is_empty() {
        Default::default()
    } else {
        store
            .lookup_index_batch(&keys_by_type)
            .await
            .map_err(ResolutionError::RepositoryFatal)?
    };

    let mut used_keys: Vec<(LookupType, String)> = Vec::new();

    for (row, row_candidates) in &candidates {
        let mut path_segments: Vec<String> = Vec::new();
        let mut resolved: Option<(String, LookupType, String)> = None;

        for lookup_type in LookupType::PRIORITY_ORDER {
            let label = lookup_type.path_label();
            let Some(key) = row_candidates.get(lookup_type) else {
                path_segments.push(format!("{label}:MISS"));
                continue;
            };

            let company_id = if lookup_type == LookupType::CustomerName
                && let Some(warmed) = warmed
            {
                warmed.get(key).cloned()
            } else {
                hits.get(&(lookup_type, key.to_string()))
                    .map(|record| record.company_id.clone())
            };

            match company_id {
                Some(company_id) => {
                    let company_id = company_id.trim().to_string();
                    if !is_valid_company_id(&company_id) {
                        path_segments.push(format!("{label}:INVALID"));
                        continue;
                    }
                    path_segments.push(format!("{label}:HIT"));
                    resolved = Some((company_id, lookup_type, key.to_string()));
                    break;
                }
                None => path_segments.push(format!("{label}:MISS")),
            }
        }

        let path = path_segments.join("→");
        debug!(row, path = %path, "db cache decision path");
        *stats.db_decision_paths.entry(path).or_default() += 1;

        if let Some((company_id, lookup_type, key)) = resolved {
            table.set_value(*row, &strategy.output_column, company_id);
            *stats
                .db_cache_hits
                .entry(lookup_type.as_str().to_string())
                .or_default() += 1;
            if let Some(observer) = observer {
                observer.record_cache_hit(lookup_type.as_str());
            }
            used_keys.push((lookup_type, key));
        }
    }

    info!(
        total_hits = stats.db_cache_hits_total(),
        probed_rows = candidates.len(),
        "db cache priority summary"
    );

    // Touch hit counts on matched records. Best-effort: a failed touch must
    // never fail the batch.
    for (lookup_type, key) in used_keys {
        if let Err(err) = store.update_hit_count(&key, lookup_type).await {
            warn!(lookup_type = %lookup_type, error = %err, "hit count update failed");
        }
    }

    Ok(())
}
