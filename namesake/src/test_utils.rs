//! Test utilities (available with the `test-utils` feature).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;

use crate::provider::{LookupBudget, LookupHit, LookupProvider, ProviderError};

/// Scripted external provider: fixed answers per raw name, an atomic budget,
/// and an optional always-fail mode for exercising the failure paths.
pub struct ScriptedProvider {
    budget: LookupBudget,
    responses: HashMap<String, LookupHit>,
    fail_all: bool,
    calls: AtomicU32,
}

impl ScriptedProvider {
    pub fn new(budget: u32) -> Self {
        Self {
            budget: LookupBudget::new(budget),
            responses: HashMap::new(),
            fail_all: false,
            calls: AtomicU32::new(0),
        }
    }

    /// A provider whose every call fails with a transport error (timeout).
    pub fn failing(budget: u32) -> Self {
        Self {
            fail_all: true,
            ..Self::new(budget)
        }
    }

    pub fn with_hit(mut self, raw_name: &str, company_id: &str) -> Self {
        self.responses.insert(
            raw_name.to_string(),
            LookupHit {
                company_id: company_id.to_string(),
                official_name: None,
            },
        );
        self
    }

    /// Number of lookup calls that consumed budget.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LookupProvider for ScriptedProvider {
    fn is_available(&self) -> bool {
        self.budget.remaining() > 0
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
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_all {
            return Err(ProviderError::Transport("scripted timeout".to_string()));
        }
        Ok(self.responses.get(raw_name).cloned())
    }
}
