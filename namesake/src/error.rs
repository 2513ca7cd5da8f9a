//! Error types raised at the resolver and learning boundaries.
//!
//! The taxonomy follows one rule: configuration problems and the Step-2 batch
//! lookup are fatal for the batch; everything else (hit-count touches,
//! back-flow, external-result caching, async enqueues) is best-effort and is
//! logged and swallowed where it happens. Error messages carry counts and
//! reason codes, never names or ids.

use thiserror::Error;

use crate::store::StoreError;

/// Fatal errors from a batch resolution.
#[derive(Debug, Error)]
pub enum ResolutionError {
    /// The input table lacks columns the strategy requires.
    #[error("input table is missing required columns: {missing:?}")]
    MissingColumns { missing: Vec<String> },

    /// The required enrichment-cache batch lookup failed; the caller should
    /// roll back the batch.
    #[error("enrichment cache batch lookup failed")]
    RepositoryFatal(#[source] StoreError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the domain learning service. Learning is non-blocking at the
/// pipeline boundary; use `learn_from_domain_safely` to swallow these.
#[derive(Debug, Error)]
pub enum LearningError {
    #[error(transparent)]
    Store(#[from] StoreError),
}
