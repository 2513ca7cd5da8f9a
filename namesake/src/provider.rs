//! External lookup adapter contract and the bundled HTTP implementation.
//!
//! The core sees only this contract: availability, a request budget, and a
//! name lookup that may return nothing. The budget lives inside the adapter
//! and is enforced atomically there, so adapters may be shared across the
//! resolver and queue workers; the resolver reads `remaining_budget` back
//! instead of keeping its own count.

use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;
use url::Url;

/// A successful external lookup: the canonical id and, when the provider
/// knows it, the official registered name.
#[derive(Debug, Clone, PartialEq)]
pub struct LookupHit {
    pub company_id: String,
    pub official_name: Option<String>,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    /// The request budget is exhausted; the caller should stop issuing calls.
    #[error("lookup budget exhausted")]
    BudgetExhausted,

    /// Transport-level failure (connection, timeout, TLS, non-success
    /// status). Treated like any other failed call by the core.
    #[error("lookup request failed: {0}")]
    Transport(String),

    /// The provider answered with something the adapter cannot interpret.
    #[error("invalid provider response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        ProviderError::Transport(err.to_string())
    }
}

/// Contract between the core and an external company-data provider.
#[async_trait]
pub trait LookupProvider: Send + Sync {
    /// Whether the provider is configured and still has budget.
    fn is_available(&self) -> bool;

    /// Configured per-run budget.
    fn budget(&self) -> u32;

    /// Budget remaining. Authoritative: the resolver derives its
    /// budget-consumed statistic from this and never counts on its own.
    fn remaining_budget(&self) -> u32;

    /// Reset both the configured and the remaining budget, typically to match
    /// the run's configured sync budget before the first call.
    fn set_budget(&self, budget: u32);

    /// Look up a raw company name. `Ok(None)` means the provider has no
    /// match; any other failure is an error the caller must survive.
    async fn lookup(&self, raw_name: &str) -> Result<Option<LookupHit>, ProviderError>;
}

/// Shared budget state for adapter implementations.
#[derive(Debug)]
pub struct LookupBudget {
    budget: AtomicU32,
    remaining: AtomicU32,
}

impl LookupBudget {
    pub fn new(budget: u32) -> Self {
        Self {
            budget: AtomicU32::new(budget),
            remaining: AtomicU32::new(budget),
        }
    }

    pub fn budget(&self) -> u32 {
        self.budget.load(Ordering::SeqCst)
    }

    pub fn remaining(&self) -> u32 {
        self.remaining.load(Ordering::SeqCst)
    }

    pub fn reset(&self, budget: u32) {
        self.budget.store(budget, Ordering::SeqCst);
        self.remaining.store(budget, Ordering::SeqCst);
    }

    /// Atomically reserve one unit. A reserved unit is consumed whether or
    /// not the call that follows succeeds.
    pub fn try_reserve(&self) -> bool {
        self.remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok()
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchResult>,
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    company_id: String,
    #[serde(default)]
    official_name: Option<String>,
}

/// HTTP adapter for an EQC-style company search gateway.
///
/// Issues `GET {base_url}/api/v1/companies/search?keyword=<name>` with bearer
/// auth and expects a JSON body of `{"results": [{"company_id", "official_name"}]}`.
/// Timeouts are enforced here via the underlying client; the core treats them
/// as plain failures.
pub struct HttpLookupProvider {
    client: reqwest::Client,
    base_url: Url,
    token: String,
    budget: LookupBudget,
}

impl HttpLookupProvider {
    pub fn new(base_url: Url, token: impl Into<String>, budget: u32) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url,
            token: token.into(),
            budget: LookupBudget::new(budget),
        }
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    fn search_url(&self) -> Result<Url, ProviderError> {
        self.base_url
            .join("api/v1/companies/search")
            .map_err(|e| ProviderError::InvalidResponse(format!("bad base url: {e}")))
    }
}

#[async_trait]
impl LookupProvider for HttpLookupProvider {
    fn is_available(&self) -> bool {
        !self.token.is_empty() && self.budget.remaining() > 0
    }

    fn budget(&self) -> u32 {
        self.budget.budget()
    }

    fn remaining_budget(&self) -> u32 {
        self.budget.remaining()
    }

    fn set_budget(&self, budget: u32) {
        self.budget.reset(budget);
    }

    async fn lookup(&self, raw_name: &str) -> Result<Option<LookupHit>, ProviderError> {
        if !self.budget.try_reserve() {
            return Err(ProviderError::BudgetExhausted);
        }

        let url = self.search_url()?;
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .query(&[("keyword", raw_name)])
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(ProviderError::Transport(format!(
                "provider returned {status}"
            )));
        }

        let body: SearchResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        let hit = body.results.into_iter().next().map(|result| LookupHit {
            company_id: result.company_id,
            official_name: result.official_name,
        });
        debug!(
            found = hit.is_some(),
            remaining = self.budget.remaining(),
            "external lookup"
        );
        Ok(hit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_reserves_down_to_zero_and_no_further() {
        let budget = LookupBudget::new(2);
        assert!(budget.try_reserve());
        assert!(budget.try_reserve());
        assert!(!budget.try_reserve());
        assert_eq!(budget.remaining(), 0);
        assert_eq!(budget.budget(), 2);
    }

    #[test]
    fn reset_restores_both_counters() {
        let budget = LookupBudget::new(1);
        assert!(budget.try_reserve());
        budget.reset(5);
        assert_eq!(budget.budget(), 5);
        assert_eq!(budget.remaining(), 5);
    }

    #[test]
    fn provider_without_token_is_unavailable() {
        let base = Url::parse("https://eqc.example.com").unwrap();
        let provider = HttpLookupProvider::new(base.clone(), "", 5);
        assert!(!provider.is_available());

        let provider = HttpLookupProvider::new(base, "token", 0);
        assert!(!provider.is_available());
    }
}
