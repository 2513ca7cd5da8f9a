//! Domain learning: feeding resolved batches back into the cache.
//!
//! After a domain's downstream load has been validated, the annotated table
//! still holds every `(weak key -> canonical id)` pair the run proved out.
//! This service extracts those pairs for each enabled lookup type and
//! upserts them with a per-type confidence, so next month's batch starts
//! from a warmer cache. Learning is strictly non-blocking for the pipeline:
//! use [`DomainLearningService::learn_from_domain_safely`] at the pipeline
//! boundary.

use std::collections::BTreeMap;

use tracing::{info, instrument, warn};

use crate::config::{DomainColumns, LearningConfig};
use crate::error::LearningError;
use crate::normalize::normalize_company_name;
use crate::store::MappingStore;
use crate::table::RowTable;
use crate::types::{IndexUpsert, LookupType, SourceType, is_temp_company_id};

/// Extraction and insertion counts for one learning pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DomainLearningResult {
    pub domain_name: String,
    pub table_name: String,
    pub total_records: usize,
    /// Rows whose company id is canonical (all digits, not a temp id).
    pub valid_records: usize,
    /// Distinct pairs extracted per lookup-type label.
    pub extracted: BTreeMap<String, usize>,
    pub inserted: u64,
    pub updated: u64,
    pub skipped_by_reason: BTreeMap<String, usize>,
}

impl DomainLearningResult {
    fn skipped(mut self, reason: &str, count: usize) -> Self {
        self.skipped_by_reason.insert(reason.to_string(), count);
        self
    }
}

/// Learns company-id mappings from processed domain tables.
pub struct DomainLearningService<'a> {
    store: &'a mut dyn MappingStore,
    config: LearningConfig,
}

impl<'a> DomainLearningService<'a> {
    pub fn new(store: &'a mut dyn MappingStore, config: LearningConfig) -> Self {
        Self { store, config }
    }

    /// Extract and upsert mappings from one processed domain table.
    #[instrument(skip(self, table), err)]
    pub async fn learn_from_domain(
        &mut self,
        domain_name: &str,
        table_name: &str,
        table: &RowTable,
    ) -> Result<DomainLearningResult, LearningError> {
        let result = DomainLearningResult {
            domain_name: domain_name.to_string(),
            table_name: table_name.to_string(),
            total_records: table.len(),
            ..Default::default()
        };

        if !self.config.enabled_domains.iter().any(|d| d == domain_name) {
            warn!("learning skipped, domain not enabled");
            return Ok(result.skipped("domain_disabled", table.len()));
        }

        let Some(columns) = self.config.column_mappings.get(domain_name).cloned() else {
            warn!("learning skipped, no column mapping for domain");
            return Ok(result.skipped("no_column_mapping", table.len()));
        };

        if !table.has_column(&columns.company_id) {
            warn!(column = %columns.company_id, "learning skipped, company id column missing");
            return Ok(result.skipped("missing_columns", table.len()));
        }

        // Only canonical ids teach the cache anything: numeric, not a temp
        // id, not null.
        let mut valid_rows: Vec<usize> = Vec::new();
        let mut temp_id_rows = 0usize;
        let mut null_rows = 0usize;
        for row in 0..table.len() {
            match table.text(row, &columns.company_id) {
                None => null_rows += 1,
                Some(id) if is_temp_company_id(id) => temp_id_rows += 1,
                Some(id) if id.chars().all(|c| c.is_ascii_digit()) => valid_rows.push(row),
                Some(_) => {}
            }
        }

        let mut result = result;
        result.valid_records = valid_rows.len();
        if null_rows > 0 {
            result
                .skipped_by_reason
                .insert("null_company_id".to_string(), null_rows);
        }
        if temp_id_rows > 0 {
            result
                .skipped_by_reason
                .insert("temp_id".to_string(), temp_id_rows);
        }

        if valid_rows.len() < self.config.min_records_for_learning {
            info!(
                valid_records = valid_rows.len(),
                min_records = self.config.min_records_for_learning,
                "learning skipped, below record threshold"
            );
            result
                .skipped_by_reason
                .insert("below_threshold".to_string(), table.len());
            return Ok(result);
        }

        // Enumerate distinct (key -> id) pairs per enabled, sufficiently
        // trusted lookup type. First observation wins within the batch.
        let mut upserts: Vec<IndexUpsert> = Vec::new();
        for &lookup_type in &self.config.enabled_lookup_types {
            let confidence = self.config.confidence_for(lookup_type);
            let mut pairs: BTreeMap<String, String> = BTreeMap::new();

            for &row in &valid_rows {
                let Some(key) = extract_key(table, row, lookup_type, &columns) else {
                    continue;
                };
                let Some(company_id) = table.text(row, &columns.company_id) else {
                    continue;
                };
                pairs.entry(key).or_insert_with(|| company_id.to_string());
            }

            if pairs.is_empty() {
                continue;
            }

            if confidence < self.config.min_confidence_for_cache {
                result.skipped_by_reason.insert(
                    format!("{}_low_confidence", lookup_type.as_str()),
                    pairs.len(),
                );
                continue;
            }

            result
                .extracted
                .insert(lookup_type.as_str().to_string(), pairs.len());
            upserts.extend(pairs.into_iter().map(|(key, company_id)| {
                IndexUpsert::new(
                    key,
                    lookup_type,
                    company_id,
                    confidence,
                    SourceType::DomainLearning,
                )
                .with_origin(domain_name, table_name)
            }));
        }

        if upserts.is_empty() {
            info!("learning found nothing new to cache");
            return Ok(result);
        }

        let outcome = self.store.upsert_index_batch(&upserts).await?;
        result.inserted = outcome.inserted;
        result.updated = outcome.skipped;

        info!(
            total_records = result.total_records,
            valid_records = result.valid_records,
            inserted = result.inserted,
            updated = result.updated,
            "domain learning complete"
        );
        Ok(result)
    }

    /// Non-blocking wrapper: any failure is logged and an empty result is
    /// returned so the pipeline never fails because learning did.
    pub async fn learn_from_domain_safely(
        &mut self,
        domain_name: &str,
        table_name: &str,
        table: &RowTable,
    ) -> DomainLearningResult {
        match self.learn_from_domain(domain_name, table_name, table).await {
            Ok(result) => result,
            Err(err) => {
                warn!(error = %err, "domain learning failed, continuing pipeline");
                DomainLearningResult {
                    domain_name: domain_name.to_string(),
                    table_name: table_name.to_string(),
                    total_records: table.len(),
                    ..Default::default()
                }
                .skipped("error", table.len())
            }
        }
    }
}

fn extract_key(
    table: &RowTable,
    row: usize,
    lookup_type: LookupType,
    columns: &DomainColumns,
) -> Option<String> {
    match lookup_type {
        LookupType::PlanCode => table.text(row, &columns.plan_code).map(str::to_string),
        LookupType::AccountName => table.text(row, &columns.account_name).map(str::to_string),
        LookupType::AccountNumber => table.text(row, &columns.account_number).map(str::to_string),
        LookupType::CustomerName => {
            let normalized = normalize_company_name(table.text(row, &columns.customer_name)?);
            (!normalized.is_empty()).then_some(normalized)
        }
        LookupType::PlanCustomer => {
            let plan = table.text(row, &columns.plan_code)?;
            let normalized = normalize_company_name(table.text(row, &columns.customer_name)?);
            (!normalized.is_empty()).then(|| format!("{plan}|{normalized}"))
        }
    }
}
