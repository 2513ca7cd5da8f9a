//! # namesake: company identity resolution for enterprise-annuity pipelines
//!
//! `namesake` is the identity-resolution core of a monthly spreadsheet
//! pipeline. Every input row carries some mix of weak keys — a plan code, an
//! account number, an account name, a customer name — and the job is to
//! stamp each row with a canonical company id, cheaply, deterministically,
//! and without ever stalling the batch on an external service.
//!
//! ## How a batch resolves
//!
//! The [`resolver::Resolver`] applies five layers in strict priority order,
//! each touching only the rows the previous layers left unresolved:
//!
//! 1. **Override layers** — in-memory maps (usually YAML-maintained) across
//!    five sub-priorities: plan, account, hardcode, name, account name.
//! 2. **Persistent cache** — a single batched round-trip against
//!    `enrichment_index`, probing five lookup types per row and recording a
//!    per-row decision path.
//! 3. **Existing-column passthrough** — ids already present in the row are
//!    kept, and the observed mappings flow back into the cache.
//! 4. **External lookup** — a budgeted, synchronous path through a
//!    [`provider::LookupProvider`]; the budget is spent per unique customer
//!    name, and confirmed answers are cached.
//! 5. **Temp ids** — everything still unresolved gets a deterministic
//!    `IN_`-prefixed placeholder ([`temp_id`]) and is enqueued on the durable
//!    retry queue for asynchronous resolution.
//!
//! ## The cache and the queue
//!
//! Both live in PostgreSQL and are reached through seams the caller injects:
//! the [`store::MappingStore`] trait (cache reads/writes and enqueues, run
//! inside the caller's transaction) and the [`queue::LookupQueue`] DAO
//! (atomic `FOR UPDATE SKIP LOCKED` dequeue, bounded exponential backoff,
//! stale-row recovery). A [`queue::QueueWorker`] drains the queue in the
//! background; several workers can run at once because the database, not the
//! process, provides the locking.
//!
//! Cache writes are *confidence-monotonic*: an upsert can raise a row's
//! confidence and replace its id, but never downgrade trust — and every
//! upsert bumps the row's hit count, because being written again is itself
//! evidence the mapping is alive.
//!
//! ## Closing the loop
//!
//! After a domain's downstream load succeeds, the
//! [`learning::DomainLearningService`] scans the annotated table and upserts
//! the proven `(weak key -> id)` pairs, so the cache gets warmer every month.
//! Run-scoped metrics and the unknown-company export come from
//! [`observer::EnrichmentObserver`].

pub mod config;
pub mod error;
pub mod learning;
pub mod normalize;
pub mod observer;
pub mod provider;
pub mod queue;
pub mod resolver;
pub mod store;
pub mod table;
pub mod temp_id;
pub mod types;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use config::{EnrichmentConfig, EqcLookupConfig, LearningConfig};
pub use error::{LearningError, ResolutionError};
pub use learning::{DomainLearningResult, DomainLearningService};
pub use normalize::normalize_company_name;
pub use observer::{EnrichmentObserver, EnrichmentStats, UnknownCompanyRecord};
pub use provider::{LookupHit, LookupProvider, ProviderError};
pub use queue::{QueueError, QueueStats};
pub use resolver::{
    OverrideLayer, OverrideMap, ResolutionStatistics, ResolutionStrategy, Resolver,
};
pub use store::{MappingStore, StoreError};
pub use table::RowTable;
pub use temp_id::{temp_company_id, temp_id_for};
pub use types::{
    EnqueueRequest, EnrichmentIndexRecord, IndexUpsert, LookupRequest, LookupType, RequestStatus,
    SourceType,
};
