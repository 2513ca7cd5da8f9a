//! PostgreSQL implementation of the mapping store.
//!
//! The store borrows the caller's `PgConnection`, so every statement runs in
//! whatever transaction the caller has open; nothing here commits. All batch
//! operations are single statements built on `unnest` so a 10^5-row batch
//! costs one round-trip, not 10^5.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{FromRow, PgConnection};
use tracing::{debug, info, instrument, warn};

use super::errors::Result;
use super::{IndexHits, KeysByType, MappingStore, dedupe_upserts, normalize_lookup_key};
use crate::types::{
    EnqueueOutcome, EnqueueRequest, EnrichmentIndexRecord, IndexUpsert, InsertOutcome, LookupType,
};

const INDEX_COLUMNS: &str = "lookup_key, lookup_type, company_id, confidence, source, \
     source_domain, source_table, hit_count, last_hit_at, created_at, updated_at";

// Database row for enrichment_index; lookup_type arrives as text and is
// narrowed during conversion.
#[derive(Debug, FromRow)]
struct IndexRow {
    lookup_key: String,
    lookup_type: String,
    company_id: String,
    confidence: Decimal,
    source: String,
    source_domain: Option<String>,
    source_table: Option<String>,
    hit_count: i64,
    last_hit_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl IndexRow {
    fn into_record(self) -> Option<EnrichmentIndexRecord> {
        let Some(lookup_type) = LookupType::from_db_str(&self.lookup_type) else {
            warn!(lookup_type = %self.lookup_type, "skipping cache row with unknown lookup type");
            return None;
        };
        Some(EnrichmentIndexRecord {
            lookup_key: self.lookup_key,
            lookup_type,
            company_id: self.company_id,
            confidence: self.confidence,
            source: self.source,
            source_domain: self.source_domain,
            source_table: self.source_table,
            hit_count: self.hit_count,
            last_hit_at: self.last_hit_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Mapping store backed by the caller's Postgres connection.
pub struct PgMappingStore<'c> {
    conn: &'c mut PgConnection,
}

impl<'c> PgMappingStore<'c> {
    pub fn new(conn: &'c mut PgConnection) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl MappingStore for PgMappingStore<'_> {
    #[instrument(skip_all, fields(lookup_type = %lookup_type), err)]
    async fn lookup_index(
        &mut self,
        lookup_key: &str,
        lookup_type: LookupType,
    ) -> Result<Option<EnrichmentIndexRecord>> {
        let key = normalize_lookup_key(lookup_key, lookup_type);
        let row = sqlx::query_as::<_, IndexRow>(&format!(
            "SELECT {INDEX_COLUMNS} FROM enrichment_index \
             WHERE lookup_key = $1 AND lookup_type = $2"
        ))
        .bind(&key)
        .bind(lookup_type.as_str())
        .fetch_optional(&mut *self.conn)
        .await?;

        Ok(row.and_then(IndexRow::into_record))
    }

    #[instrument(skip_all, fields(input_count = tracing::field::Empty), err)]
    async fn lookup_index_batch(&mut self, keys_by_type: &KeysByType) -> Result<IndexHits> {
        // Flatten into two positionally paired arrays for the UNNEST join.
        let mut lookup_keys: Vec<String> = Vec::new();
        let mut lookup_types: Vec<String> = Vec::new();
        for lookup_type in LookupType::PRIORITY_ORDER {
            let Some(keys) = keys_by_type.get(&lookup_type) else {
                continue;
            };
            for key in keys {
                lookup_keys.push(normalize_lookup_key(key, lookup_type));
                lookup_types.push(lookup_type.as_str().to_string());
            }
        }
        tracing::Span::current().record("input_count", lookup_keys.len());

        if lookup_keys.is_empty() {
            return Ok(HashMap::new());
        }

        let rows = sqlx::query_as::<_, IndexRow>(&format!(
            "WITH input_pairs AS ( \
                 SELECT k.key AS lookup_key, t.kind AS lookup_type \
                 FROM unnest($1::text[]) WITH ORDINALITY AS k(key, idx) \
                 JOIN unnest($2::text[]) WITH ORDINALITY AS t(kind, idx) ON k.idx = t.idx \
             ) \
             SELECT {INDEX_COLUMNS} \
             FROM enrichment_index AS ei \
             JOIN input_pairs AS ip \
               ON ei.lookup_key = ip.lookup_key AND ei.lookup_type = ip.lookup_type"
        ))
        .bind(&lookup_keys)
        .bind(&lookup_types)
        .fetch_all(&mut *self.conn)
        .await?;

        let mut hits: IndexHits = HashMap::with_capacity(rows.len());
        for row in rows {
            if let Some(record) = row.into_record() {
                hits.insert((record.lookup_type, record.lookup_key.clone()), record);
            }
        }

        info!(
            input_count = lookup_keys.len(),
            found_count = hits.len(),
            "batch cache lookup"
        );
        Ok(hits)
    }

    #[instrument(skip_all, fields(input_count = records.len()), err)]
    async fn upsert_index_batch(&mut self, records: &[IndexUpsert]) -> Result<InsertOutcome> {
        if records.is_empty() {
            debug!("empty upsert batch");
            return Ok(InsertOutcome::default());
        }

        let deduped = dedupe_upserts(records);
        let lookup_keys: Vec<String> = deduped
            .iter()
            .map(|r| normalize_lookup_key(&r.lookup_key, r.lookup_type))
            .collect();
        let lookup_types: Vec<String> = deduped
            .iter()
            .map(|r| r.lookup_type.as_str().to_string())
            .collect();
        let company_ids: Vec<String> = deduped.iter().map(|r| r.company_id.clone()).collect();
        let confidences: Vec<Decimal> = deduped.iter().map(|r| r.confidence).collect();
        let sources: Vec<String> = deduped
            .iter()
            .map(|r| r.source.as_str().to_string())
            .collect();
        let source_domains: Vec<Option<String>> =
            deduped.iter().map(|r| r.source_domain.clone()).collect();
        let source_tables: Vec<Option<String>> =
            deduped.iter().map(|r| r.source_table.clone()).collect();

        // Upserting is itself a cache-touch event: the hit count always grows
        // and identity fields are only replaced by strictly higher confidence,
        // keeping the cache confidence-monotonic.
        let result = sqlx::query(
            "INSERT INTO enrichment_index \
                 (lookup_key, lookup_type, company_id, confidence, source, \
                  source_domain, source_table, hit_count, created_at, updated_at) \
             SELECT lookup_key, lookup_type, company_id, confidence, source, \
                    source_domain, source_table, 0, NOW(), NOW() \
             FROM unnest($1::text[], $2::text[], $3::text[], $4::numeric[], \
                         $5::text[], $6::text[], $7::text[]) \
                  AS t(lookup_key, lookup_type, company_id, confidence, source, \
                       source_domain, source_table) \
             ON CONFLICT (lookup_key, lookup_type) DO UPDATE SET \
                 confidence = GREATEST(enrichment_index.confidence, EXCLUDED.confidence), \
                 company_id = CASE \
                     WHEN EXCLUDED.confidence > enrichment_index.confidence \
                     THEN EXCLUDED.company_id ELSE enrichment_index.company_id END, \
                 source = CASE \
                     WHEN EXCLUDED.confidence > enrichment_index.confidence \
                     THEN EXCLUDED.source ELSE enrichment_index.source END, \
                 source_domain = CASE \
                     WHEN EXCLUDED.confidence > enrichment_index.confidence \
                     THEN EXCLUDED.source_domain ELSE enrichment_index.source_domain END, \
                 source_table = CASE \
                     WHEN EXCLUDED.confidence > enrichment_index.confidence \
                     THEN EXCLUDED.source_table ELSE enrichment_index.source_table END, \
                 hit_count = enrichment_index.hit_count + 1, \
                 last_hit_at = NOW(), \
                 updated_at = NOW()",
        )
        .bind(&lookup_keys)
        .bind(&lookup_types)
        .bind(&company_ids)
        .bind(&confidences)
        .bind(&sources)
        .bind(&source_domains)
        .bind(&source_tables)
        .execute(&mut *self.conn)
        .await?;

        let affected = result.rows_affected();
        info!(
            input_count = records.len(),
            affected_count = affected,
            "cache upsert batch completed"
        );
        Ok(InsertOutcome {
            inserted: affected,
            skipped: (deduped.len() as u64).saturating_sub(affected),
        })
    }

    #[instrument(skip_all, fields(lookup_type = %lookup_type), err)]
    async fn update_hit_count(
        &mut self,
        lookup_key: &str,
        lookup_type: LookupType,
    ) -> Result<bool> {
        let key = normalize_lookup_key(lookup_key, lookup_type);
        let result = sqlx::query(
            "UPDATE enrichment_index \
             SET hit_count = hit_count + 1, last_hit_at = NOW(), updated_at = NOW() \
             WHERE lookup_key = $1 AND lookup_type = $2",
        )
        .bind(&key)
        .bind(lookup_type.as_str())
        .execute(&mut *self.conn)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip_all, fields(input_count = requests.len()), err)]
    async fn enqueue_for_enrichment(
        &mut self,
        requests: &[EnqueueRequest],
    ) -> Result<EnqueueOutcome> {
        let valid: Vec<&EnqueueRequest> = requests
            .iter()
            .filter(|r| !r.raw_name.trim().is_empty() && !r.normalized_name.is_empty())
            .collect();
        if valid.is_empty() {
            debug!("empty enqueue batch");
            return Ok(EnqueueOutcome::default());
        }

        let raw_names: Vec<String> = valid
            .iter()
            .map(|r| r.raw_name.trim().to_string())
            .collect();
        let normalized_names: Vec<String> =
            valid.iter().map(|r| r.normalized_name.clone()).collect();
        let temp_ids: Vec<Option<String>> = valid.iter().map(|r| r.temp_id.clone()).collect();

        // ON CONFLICT DO NOTHING honours the partial unique index on
        // normalized_name for in-flight rows; the index is the dedup
        // mechanism, not application-side checks.
        let result = sqlx::query(
            "INSERT INTO enrichment_requests \
                 (raw_name, normalized_name, temp_id, status, attempts, \
                  next_retry_at, created_at, updated_at) \
             SELECT raw_name, normalized_name, temp_id, 'pending', 0, NOW(), NOW(), NOW() \
             FROM unnest($1::text[], $2::text[], $3::text[]) \
                  AS t(raw_name, normalized_name, temp_id) \
             ON CONFLICT DO NOTHING",
        )
        .bind(&raw_names)
        .bind(&normalized_names)
        .bind(&temp_ids)
        .execute(&mut *self.conn)
        .await?;

        let queued = result.rows_affected();
        let skipped = (valid.len() as u64).saturating_sub(queued);
        info!(
            input_count = requests.len(),
            queued, skipped, "async enqueue completed"
        );
        Ok(EnqueueOutcome { queued, skipped })
    }
}
