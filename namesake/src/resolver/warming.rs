//! Pre-batch cache warming.
//!
//! Extracts the unique customer names of the batch, normalises and
//! deduplicates them, and fetches the whole customer-name dimension of the
//! cache in one round-trip. The resulting hit map is consulted by the P4
//! step without further I/O, which is what keeps a 10^5-row batch at a
//! handful of queries instead of 10^5 probes.

use std::collections::{BTreeSet, HashMap};

use tracing::{debug, info, warn};

use crate::normalize::normalize_company_name;
use crate::store::{KeysByType, MappingStore};
use crate::table::RowTable;
use crate::types::LookupType;

/// Warm the customer-name dimension for this batch.
///
/// Returns `Some(map)` of `normalised name -> company id` on success (the
/// map may be empty), or `None` when the lookup failed — in which case the
/// DB cache step falls back to querying customer-name keys itself.
pub(crate) async fn warm_cache(
    table: &RowTable,
    customer_name_column: &str,
    store: &mut dyn MappingStore,
) -> Option<HashMap<String, String>> {
    let mut unique_names: BTreeSet<String> = BTreeSet::new();
    for row in 0..table.len() {
        if let Some(name) = table.text(row, customer_name_column) {
            let normalized = normalize_company_name(name);
            if !normalized.is_empty() {
                unique_names.insert(normalized);
            }
        }
    }

    if unique_names.is_empty() {
        debug!("cache warming skipped, no customer names");
        return Some(HashMap::new());
    }

    let total_names = unique_names.len();
    let mut keys_by_type = KeysByType::new();
    keys_by_type.insert(LookupType::CustomerName, unique_names);

    match store.lookup_index_batch(&keys_by_type).await {
        Ok(hits) => {
            let cache: HashMap<String, String> = hits
                .into_values()
                .filter(|record| record.lookup_type == LookupType::CustomerName)
                .map(|record| (record.lookup_key, record.company_id))
                .collect();
            info!(
                total_names,
                cache_hits = cache.len(),
                cache_misses = total_names - cache.len(),
                "cache warming complete"
            );
            Some(cache)
        }
        Err(err) => {
            warn!(error = %err, "cache warming failed, falling back to on-demand lookups");
            None
        }
    }
}
