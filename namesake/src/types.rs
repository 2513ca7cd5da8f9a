//! Core record and outcome types shared across the cache, queue, and resolver.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// The five dimensions of the `enrichment_index` cache.
///
/// Keys for [`LookupType::CustomerName`] and the customer half of
/// [`LookupType::PlanCustomer`] are stored normalised; the other three types
/// store raw keys. The store enforces this on both lookup and insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupType {
    PlanCode,
    AccountName,
    AccountNumber,
    CustomerName,
    PlanCustomer,
}

impl LookupType {
    /// Resolution priority order used by the DB cache layer (DB-P1..DB-P5).
    pub const PRIORITY_ORDER: [LookupType; 5] = [
        LookupType::PlanCode,
        LookupType::AccountName,
        LookupType::AccountNumber,
        LookupType::CustomerName,
        LookupType::PlanCustomer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LookupType::PlanCode => "plan_code",
            LookupType::AccountName => "account_name",
            LookupType::AccountNumber => "account_number",
            LookupType::CustomerName => "customer_name",
            LookupType::PlanCustomer => "plan_customer",
        }
    }

    pub fn from_db_str(value: &str) -> Option<Self> {
        match value {
            "plan_code" => Some(LookupType::PlanCode),
            "account_name" => Some(LookupType::AccountName),
            "account_number" => Some(LookupType::AccountNumber),
            "customer_name" => Some(LookupType::CustomerName),
            "plan_customer" => Some(LookupType::PlanCustomer),
            _ => None,
        }
    }

    /// Label used in per-row decision paths, e.g. `DB-P4:HIT`.
    pub fn path_label(&self) -> &'static str {
        match self {
            LookupType::PlanCode => "DB-P1",
            LookupType::AccountName => "DB-P2",
            LookupType::AccountNumber => "DB-P3",
            LookupType::CustomerName => "DB-P4",
            LookupType::PlanCustomer => "DB-P5",
        }
    }
}

impl std::fmt::Display for LookupType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provenance of a cache write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Internal,
    Eqc,
    PipelineBackflow,
    DomainLearning,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Internal => "internal",
            SourceType::Eqc => "eqc",
            SourceType::PipelineBackflow => "pipeline_backflow",
            SourceType::DomainLearning => "domain_learning",
        }
    }
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A row of the persistent `enrichment_index` cache.
///
/// `source` is kept as free text on read: the table accumulates writers over
/// time and an unknown source string must not make a cached mapping unusable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentIndexRecord {
    pub lookup_key: String,
    pub lookup_type: LookupType,
    pub company_id: String,
    pub confidence: Decimal,
    pub source: String,
    pub source_domain: Option<String>,
    pub source_table: Option<String>,
    pub hit_count: i64,
    pub last_hit_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for a conflict-aware cache upsert.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexUpsert {
    pub lookup_key: String,
    pub lookup_type: LookupType,
    pub company_id: String,
    pub confidence: Decimal,
    pub source: SourceType,
    pub source_domain: Option<String>,
    pub source_table: Option<String>,
}

impl IndexUpsert {
    pub fn new(
        lookup_key: impl Into<String>,
        lookup_type: LookupType,
        company_id: impl Into<String>,
        confidence: Decimal,
        source: SourceType,
    ) -> Self {
        Self {
            lookup_key: lookup_key.into(),
            lookup_type,
            company_id: company_id.into(),
            confidence,
            source,
            source_domain: None,
            source_table: None,
        }
    }

    pub fn with_origin(
        mut self,
        source_domain: impl Into<String>,
        source_table: impl Into<String>,
    ) -> Self {
        self.source_domain = Some(source_domain.into());
        self.source_table = Some(source_table.into());
        self
    }
}

/// Lifecycle state of an `enrichment_requests` row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Processing,
    Done,
    Failed,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Processing => "processing",
            RequestStatus::Done => "done",
            RequestStatus::Failed => "failed",
        }
    }

    pub fn from_db_str(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(RequestStatus::Pending),
            "processing" => Some(RequestStatus::Processing),
            "done" => Some(RequestStatus::Done),
            "failed" => Some(RequestStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A row of the durable async lookup queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LookupRequest {
    pub id: i64,
    pub raw_name: String,
    pub normalized_name: String,
    pub temp_id: Option<String>,
    pub status: RequestStatus,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for a queue enqueue; one entry per unresolved name.
#[derive(Debug, Clone, PartialEq)]
pub struct EnqueueRequest {
    pub raw_name: String,
    pub normalized_name: String,
    pub temp_id: Option<String>,
}

/// Outcome of a batch cache upsert. Postgres reports inserts and updates
/// together, so `inserted` counts affected rows and `skipped` the remainder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsertOutcome {
    pub inserted: u64,
    pub skipped: u64,
}

/// Outcome of a batch enqueue; `skipped` rows lost to the partial unique
/// index on in-flight `normalized_name`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnqueueOutcome {
    pub queued: u64,
    pub skipped: u64,
}

/// Id values that must be treated as "no id" even though they are non-empty.
pub const INVALID_ID_SENTINELS: [&str; 6] = ["N", "NA", "N/A", "NONE", "NULL", "NAN"];

/// True when `value` is usable as a company id: non-empty after trimming and
/// not one of the known placeholder sentinels.
pub fn is_valid_company_id(value: &str) -> bool {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return false;
    }
    let upper = trimmed.to_uppercase();
    !INVALID_ID_SENTINELS.contains(&upper.as_str())
}

/// True when `value` looks like a temporary id rather than a canonical one.
/// Consumers rely on the two-character `IN` prefix.
pub fn is_temp_company_id(value: &str) -> bool {
    value.trim().to_uppercase().starts_with("IN")
}
