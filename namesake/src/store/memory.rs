//! In-memory mapping store for tests.
//!
//! Reproduces the Postgres implementation's observable semantics — key
//! normalisation, confidence-monotonic upserts, hit-count touches, and the
//! partial-unique enqueue — without a database. Failure injection flags let
//! tests exercise the best-effort and fatal error paths.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;

use super::errors::{Result, StoreError};
use super::{IndexHits, KeysByType, MappingStore, dedupe_upserts, normalize_lookup_key};
use crate::types::{
    EnqueueOutcome, EnqueueRequest, EnrichmentIndexRecord, IndexUpsert, InsertOutcome,
    LookupRequest, LookupType, RequestStatus,
};

/// In-memory stand-in for the Postgres store.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    records: HashMap<(LookupType, String), EnrichmentIndexRecord>,
    queue: Vec<LookupRequest>,
    next_queue_id: i64,
    pub fail_batch_lookup: bool,
    pub fail_upserts: bool,
    pub fail_hit_count: bool,
    pub fail_enqueue: bool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            next_queue_id: 1,
            ..Self::default()
        }
    }

    /// Seed a cache row directly, bypassing conflict semantics.
    pub fn seed(&mut self, upsert: IndexUpsert) {
        let key = normalize_lookup_key(&upsert.lookup_key, upsert.lookup_type);
        let now = Utc::now();
        self.records.insert(
            (upsert.lookup_type, key.clone()),
            EnrichmentIndexRecord {
                lookup_key: key,
                lookup_type: upsert.lookup_type,
                company_id: upsert.company_id,
                confidence: upsert.confidence,
                source: upsert.source.as_str().to_string(),
                source_domain: upsert.source_domain,
                source_table: upsert.source_table,
                hit_count: 0,
                last_hit_at: None,
                created_at: now,
                updated_at: now,
            },
        );
    }

    pub fn record(&self, lookup_type: LookupType, key: &str) -> Option<&EnrichmentIndexRecord> {
        self.records
            .get(&(lookup_type, normalize_lookup_key(key, lookup_type)))
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    pub fn queued(&self) -> &[LookupRequest] {
        &self.queue
    }

    fn has_in_flight(&self, normalized_name: &str) -> bool {
        self.queue.iter().any(|r| {
            r.normalized_name == normalized_name
                && matches!(r.status, RequestStatus::Pending | RequestStatus::Processing)
        })
    }
}

#[async_trait]
impl MappingStore for InMemoryStore {
    async fn lookup_index(
        &mut self,
        lookup_key: &str,
        lookup_type: LookupType,
    ) -> Result<Option<EnrichmentIndexRecord>> {
        if self.fail_batch_lookup {
            return Err(StoreError::Other(anyhow::anyhow!(
                "injected lookup failure"
            )));
        }
        Ok(self.record(lookup_type, lookup_key).cloned())
    }

    async fn lookup_index_batch(&mut self, keys_by_type: &KeysByType) -> Result<IndexHits> {
        if self.fail_batch_lookup {
            return Err(StoreError::Other(anyhow::anyhow!(
                "injected batch lookup failure"
            )));
        }
        let mut hits = IndexHits::new();
        for (&lookup_type, keys) in keys_by_type {
            for key in keys {
                let normalized = normalize_lookup_key(key, lookup_type);
                if let Some(record) = self.records.get(&(lookup_type, normalized.clone())) {
                    hits.insert((lookup_type, normalized), record.clone());
                }
            }
        }
        Ok(hits)
    }

    async fn upsert_index_batch(&mut self, records: &[IndexUpsert]) -> Result<InsertOutcome> {
        if self.fail_upserts {
            return Err(StoreError::Other(anyhow::anyhow!(
                "injected upsert failure"
            )));
        }
        let deduped = dedupe_upserts(records);
        let now = Utc::now();
        let mut outcome = InsertOutcome::default();

        for upsert in deduped {
            let key = normalize_lookup_key(&upsert.lookup_key, upsert.lookup_type);
            match self.records.get_mut(&(upsert.lookup_type, key.clone())) {
                Some(existing) => {
                    if upsert.confidence > existing.confidence {
                        existing.company_id = upsert.company_id;
                        existing.source = upsert.source.as_str().to_string();
                        existing.source_domain = upsert.source_domain;
                        existing.source_table = upsert.source_table;
                        existing.confidence = upsert.confidence;
                    }
                    existing.hit_count += 1;
                    existing.last_hit_at = Some(now);
                    existing.updated_at = now;
                }
                None => {
                    self.records.insert(
                        (upsert.lookup_type, key.clone()),
                        EnrichmentIndexRecord {
                            lookup_key: key,
                            lookup_type: upsert.lookup_type,
                            company_id: upsert.company_id,
                            confidence: upsert.confidence,
                            source: upsert.source.as_str().to_string(),
                            source_domain: upsert.source_domain,
                            source_table: upsert.source_table,
                            hit_count: 0,
                            last_hit_at: None,
                            created_at: now,
                            updated_at: now,
                        },
                    );
                }
            }
            outcome.inserted += 1;
        }
        Ok(outcome)
    }

    async fn update_hit_count(
        &mut self,
        lookup_key: &str,
        lookup_type: LookupType,
    ) -> Result<bool> {
        if self.fail_hit_count {
            return Err(StoreError::Other(anyhow::anyhow!(
                "injected hit-count failure"
            )));
        }
        let key = normalize_lookup_key(lookup_key, lookup_type);
        match self.records.get_mut(&(lookup_type, key)) {
            Some(record) => {
                record.hit_count += 1;
                record.last_hit_at = Some(Utc::now());
                record.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn enqueue_for_enrichment(
        &mut self,
        requests: &[EnqueueRequest],
    ) -> Result<EnqueueOutcome> {
        if self.fail_enqueue {
            return Err(StoreError::Other(anyhow::anyhow!(
                "injected enqueue failure"
            )));
        }
        let mut outcome = EnqueueOutcome::default();
        for request in requests {
            if request.raw_name.trim().is_empty() || request.normalized_name.is_empty() {
                continue;
            }
            if self.has_in_flight(&request.normalized_name) {
                outcome.skipped += 1;
                continue;
            }
            let now = Utc::now();
            self.queue.push(LookupRequest {
                id: self.next_queue_id,
                raw_name: request.raw_name.trim().to_string(),
                normalized_name: request.normalized_name.clone(),
                temp_id: request.temp_id.clone(),
                status: RequestStatus::Pending,
                attempts: 0,
                last_error: None,
                next_retry_at: Some(now),
                created_at: now,
                updated_at: now,
            });
            self.next_queue_id += 1;
            outcome.queued += 1;
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SourceType;
    use rust_decimal::Decimal;

    fn upsert(key: &str, id: &str, confidence: Decimal) -> IndexUpsert {
        IndexUpsert::new(
            key,
            LookupType::CustomerName,
            id,
            confidence,
            SourceType::Eqc,
        )
    }

    #[tokio::test]
    async fn upsert_never_demotes_confidence() {
        let mut store = InMemoryStore::new();
        store
            .upsert_index_batch(&[upsert("中国平安", "111", Decimal::new(95, 2))])
            .await
            .unwrap();
        store
            .upsert_index_batch(&[upsert("中国平安", "222", Decimal::new(85, 2))])
            .await
            .unwrap();

        let record = store.record(LookupType::CustomerName, "中国平安").unwrap();
        assert_eq!(record.company_id, "111");
        assert_eq!(record.confidence, Decimal::new(95, 2));
        // Both upserts touched the row.
        assert_eq!(record.hit_count, 1);
    }

    #[tokio::test]
    async fn higher_confidence_replaces_identity_fields() {
        let mut store = InMemoryStore::new();
        store
            .upsert_index_batch(&[upsert("中国平安", "111", Decimal::new(85, 2))])
            .await
            .unwrap();
        store
            .upsert_index_batch(&[upsert("中国平安", "222", Decimal::new(95, 2))])
            .await
            .unwrap();

        let record = store.record(LookupType::CustomerName, "中国平安").unwrap();
        assert_eq!(record.company_id, "222");
        assert_eq!(record.confidence, Decimal::new(95, 2));
    }

    #[tokio::test]
    async fn repeated_equal_upserts_only_grow_the_hit_count() {
        let mut store = InMemoryStore::new();
        let record = upsert("中国平安", "111", Decimal::new(85, 2));
        store
            .upsert_index_batch(std::slice::from_ref(&record))
            .await
            .unwrap();
        let before = store
            .record(LookupType::CustomerName, "中国平安")
            .unwrap()
            .clone();

        store
            .upsert_index_batch(std::slice::from_ref(&record))
            .await
            .unwrap();
        let after = store.record(LookupType::CustomerName, "中国平安").unwrap();

        assert_eq!(after.company_id, before.company_id);
        assert_eq!(after.confidence, before.confidence);
        assert_eq!(after.source, before.source);
        assert_eq!(after.hit_count, before.hit_count + 1);
    }

    #[tokio::test]
    async fn enqueue_skips_in_flight_duplicates() {
        let mut store = InMemoryStore::new();
        let request = EnqueueRequest {
            raw_name: "甲公司".to_string(),
            normalized_name: "甲公司".to_string(),
            temp_id: Some("IN_AAAA2222BBBB3333".to_string()),
        };
        let first = store
            .enqueue_for_enrichment(std::slice::from_ref(&request))
            .await
            .unwrap();
        assert_eq!(first.queued, 1);

        let second = store
            .enqueue_for_enrichment(std::slice::from_ref(&request))
            .await
            .unwrap();
        assert_eq!(second.queued, 0);
        assert_eq!(second.skipped, 1);
        assert_eq!(store.queued().len(), 1);
    }
}
