//! Persistence seam for the enrichment cache and the async queue's enqueue
//! side.
//!
//! The trait gives the resolver and learning service a single injectable
//! dependency; the Postgres implementation borrows the caller's connection so
//! transaction boundaries stay with the caller. No method here commits.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;

use crate::normalize::normalize_company_name;
use crate::types::{
    EnqueueOutcome, EnqueueRequest, EnrichmentIndexRecord, IndexUpsert, InsertOutcome, LookupType,
};

pub mod errors;
#[cfg(any(test, feature = "test-utils"))]
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use errors::{Result, StoreError};
#[cfg(any(test, feature = "test-utils"))]
pub use memory::InMemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PgMappingStore;

/// Keys to look up, grouped by lookup type. `BTreeSet` keeps the batch
/// deterministic, which matters for stable query plans and tests.
pub type KeysByType = HashMap<LookupType, BTreeSet<String>>;

/// Batch lookup result, keyed the way callers probe it.
pub type IndexHits = HashMap<(LookupType, String), EnrichmentIndexRecord>;

/// All persistence the core needs: batched cache reads, conflict-aware cache
/// writes, hit-count touches, and queue enqueues.
///
/// Implementations must apply [`normalize_lookup_key`] to every key that
/// crosses their boundary so the normalisation invariant on `customer_name`
/// and `plan_customer` keys cannot be bypassed by a caller.
#[async_trait]
pub trait MappingStore: Send {
    /// Single-key cache lookup.
    async fn lookup_index(
        &mut self,
        lookup_key: &str,
        lookup_type: LookupType,
    ) -> Result<Option<EnrichmentIndexRecord>>;

    /// Batched cache lookup in one round-trip. Missing keys are simply absent
    /// from the result.
    async fn lookup_index_batch(&mut self, keys_by_type: &KeysByType) -> Result<IndexHits>;

    /// Conflict-aware upsert. On conflict the cache is confidence-monotonic:
    /// confidence takes the maximum, identity fields are replaced only by a
    /// strictly higher confidence, and the hit count is bumped because an
    /// upsert is itself a cache-touch event.
    async fn upsert_index_batch(&mut self, records: &[IndexUpsert]) -> Result<InsertOutcome>;

    /// Increment `hit_count` and touch timestamps. Returns false when the row
    /// does not exist.
    async fn update_hit_count(&mut self, lookup_key: &str, lookup_type: LookupType)
    -> Result<bool>;

    /// Batch enqueue for async enrichment. Conflicts with the partial unique
    /// index on in-flight `normalized_name` are skipped, not errors.
    async fn enqueue_for_enrichment(
        &mut self,
        requests: &[EnqueueRequest],
    ) -> Result<EnqueueOutcome>;
}

/// Canonicalise a lookup key for its type: `customer_name` keys and the
/// customer half of `plan_customer` keys are normalised, everything else
/// passes through trimmed.
pub fn normalize_lookup_key(lookup_key: &str, lookup_type: LookupType) -> String {
    match lookup_type {
        LookupType::CustomerName => normalize_company_name(lookup_key),
        LookupType::PlanCustomer => match lookup_key.split_once('|') {
            Some((plan_code, customer)) => {
                format!("{}|{}", plan_code, normalize_company_name(customer))
            }
            // Malformed composite key: normalise the whole thing rather than
            // silently missing cache hits.
            None => normalize_company_name(lookup_key),
        },
        _ => lookup_key.trim().to_string(),
    }
}

/// Drop duplicate `(lookup_key, lookup_type)` entries before an upsert,
/// keeping the highest-confidence record. A single statement cannot touch the
/// same row twice, and callers stage writes from per-row loops that can
/// repeat keys.
pub(crate) fn dedupe_upserts(records: &[IndexUpsert]) -> Vec<IndexUpsert> {
    let mut by_key: HashMap<(LookupType, String), IndexUpsert> = HashMap::new();
    for record in records {
        let key = (
            record.lookup_type,
            normalize_lookup_key(&record.lookup_key, record.lookup_type),
        );
        match by_key.get(&key) {
            Some(existing) if existing.confidence >= record.confidence => {}
            _ => {
                by_key.insert(key, record.clone());
            }
        }
    }
    let mut deduped: Vec<_> = by_key.into_values().collect();
    deduped.sort_by(|a, b| (a.lookup_type, &a.lookup_key).cmp(&(b.lookup_type, &b.lookup_key)));
    deduped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SourceType;
    use rust_decimal::Decimal;

    #[test]
    fn customer_name_keys_are_normalised() {
        assert_eq!(
            normalize_lookup_key("  中国平安-已转出 ", LookupType::CustomerName),
            "中国平安"
        );
        assert_eq!(
            normalize_lookup_key(" FP0001 ", LookupType::PlanCode),
            "FP0001"
        );
    }

    #[test]
    fn plan_customer_keys_normalise_only_the_customer_half() {
        assert_eq!(
            normalize_lookup_key("FP0001|中国平安-已转出", LookupType::PlanCustomer),
            "FP0001|中国平安"
        );
        // Plan codes are raw; latin letters in them must not be lower-cased.
        assert_eq!(
            normalize_lookup_key("AN001|测试企业", LookupType::PlanCustomer),
            "AN001|测试企业"
        );
    }

    #[test]
    fn dedupe_keeps_the_highest_confidence_record() {
        let records = vec![
            IndexUpsert::new(
                "中国平安",
                LookupType::CustomerName,
                "111",
                Decimal::new(85, 2),
                SourceType::PipelineBackflow,
            ),
            IndexUpsert::new(
                "中国平安",
                LookupType::CustomerName,
                "222",
                Decimal::new(95, 2),
                SourceType::Eqc,
            ),
            IndexUpsert::new(
                "FP0001",
                LookupType::PlanCode,
                "111",
                Decimal::new(85, 2),
                SourceType::PipelineBackflow,
            ),
        ];
        let deduped = dedupe_upserts(&records);
        assert_eq!(deduped.len(), 2);
        let customer = deduped
            .iter()
            .find(|r| r.lookup_type == LookupType::CustomerName)
            .unwrap();
        assert_eq!(customer.company_id, "222");
    }
}
