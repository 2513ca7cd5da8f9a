//! Configuration for the enrichment core.
//!
//! Configuration is loaded from a YAML file with environment variable
//! overrides: variables prefixed with `WDH_` override file values, with
//! double underscores for nesting (`WDH_EQC__SYNC_BUDGET=10` sets
//! `eqc.sync_budget`). The keyed-hash salt is special-cased: it normally
//! arrives via `WDH_ALIAS_SALT`, and a development default is substituted
//! (with a logged warning) when it is absent.

use std::collections::BTreeMap;

use figment::{
    Figment,
    providers::{Data, Env, Format, Yaml},
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::types::LookupType;

/// Environment variable carrying the temp-id salt.
pub const SALT_ENV_VAR: &str = "WDH_ALIAS_SALT";

/// Development fallback salt. Must be overridden in production.
pub const DEFAULT_DEV_SALT: &str = "default_dev_salt_change_in_prod";

/// Root configuration. All fields default, so an empty file is valid.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EnrichmentConfig {
    /// Keyed-hash salt for temp-id generation. Usually supplied via
    /// `WDH_ALIAS_SALT`; see [`EnrichmentConfig::alias_salt`].
    pub alias_salt: Option<String>,
    /// Deployment environment name ("development", "staging", "production").
    /// Controls how loudly a missing salt is reported.
    pub environment: String,
    pub eqc: EqcLookupConfig,
    pub learning: LearningConfig,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            alias_salt: None,
            environment: "development".to_string(),
            eqc: EqcLookupConfig::default(),
            learning: LearningConfig::default(),
        }
    }
}

impl EnrichmentConfig {
    /// Load from `enrichment.yaml` (if present) merged with `WDH_`-prefixed
    /// environment variables.
    pub fn load() -> Result<Self, figment::Error> {
        Self::figment(Yaml::file("enrichment.yaml")).extract()
    }

    /// Load from an explicit YAML file merged with the environment.
    pub fn load_from(path: impl AsRef<std::path::Path>) -> Result<Self, figment::Error> {
        Self::figment(Yaml::file(path.as_ref())).extract()
    }

    fn figment(file: Data<Yaml>) -> Figment {
        Figment::new()
            .merge(file)
            .merge(Env::prefixed("WDH_").split("__"))
    }

    /// Resolve the temp-id salt.
    ///
    /// Order: explicit config / `WDH_ALIAS_SALT`, then the process
    /// environment, then the development default. Falling back to the default
    /// logs a warning, promoted to an error in production-like environments.
    pub fn alias_salt(&self) -> String {
        if let Some(salt) = self.alias_salt.as_deref()
            && !salt.is_empty()
        {
            return salt.to_string();
        }
        if let Ok(salt) = std::env::var(SALT_ENV_VAR)
            && !salt.is_empty()
        {
            return salt;
        }

        if self.is_production_like() {
            error!(
                env = %self.environment,
                "{SALT_ENV_VAR} is not set; using the development salt in a production-like environment"
            );
        } else {
            warn!("{SALT_ENV_VAR} is not set; using the development salt");
        }
        DEFAULT_DEV_SALT.to_string()
    }

    fn is_production_like(&self) -> bool {
        matches!(
            self.environment.to_lowercase().as_str(),
            "production" | "prod" | "staging" | "stage"
        )
    }
}

/// Configuration for the external (EQC) lookup path.
///
/// `enabled` is the master switch: when it is off, every external-lookup
/// feature is off regardless of the other fields.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct EqcLookupConfig {
    /// Master switch for external lookups.
    pub enabled: bool,
    /// Maximum synchronous external calls per batch; 0 disables the sync path.
    pub sync_budget: u32,
    /// Whether the caller may construct a provider automatically when one was
    /// not injected.
    pub auto_create_provider: bool,
    /// Whether unresolved names are retained for export.
    pub export_unknown_names: bool,
    /// Whether the provider may refresh its token on validation failure.
    pub auto_refresh_token: bool,
}

impl Default for EqcLookupConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            sync_budget: 0,
            auto_create_provider: false,
            export_unknown_names: true,
            auto_refresh_token: true,
        }
    }
}

impl EqcLookupConfig {
    /// Fully disabled state: the master switch also turns off export and
    /// token refresh so that "no enrichment" means no side effects at all.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            sync_budget: 0,
            auto_create_provider: false,
            export_unknown_names: false,
            auto_refresh_token: false,
        }
    }

    /// Enabled with an explicit sync budget.
    pub fn with_budget(sync_budget: u32) -> Self {
        Self {
            enabled: true,
            sync_budget,
            ..Self::default()
        }
    }
}

/// Per-domain column names consumed by the learning service.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DomainColumns {
    pub company_id: String,
    pub plan_code: String,
    pub customer_name: String,
    pub account_name: String,
    pub account_number: String,
}

impl Default for DomainColumns {
    fn default() -> Self {
        Self {
            company_id: "company_id".to_string(),
            plan_code: "计划代码".to_string(),
            customer_name: "客户名称".to_string(),
            account_name: "年金账户名".to_string(),
            account_number: "年金账户号".to_string(),
        }
    }
}

/// Configuration for the domain learning service.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LearningConfig {
    /// Domains the learning step may run for.
    pub enabled_domains: Vec<String>,
    /// Lookup types learned from resolved rows.
    pub enabled_lookup_types: Vec<LookupType>,
    /// Per-type confidence overrides; see [`LearningConfig::confidence_for`]
    /// for the defaults.
    pub confidence_levels: BTreeMap<LookupType, Decimal>,
    /// Minimum count of valid (canonical-id) rows before learning runs.
    pub min_records_for_learning: usize,
    /// Types whose configured confidence falls below this are not cached.
    pub min_confidence_for_cache: Decimal,
    /// Column names per domain.
    pub column_mappings: BTreeMap<String, DomainColumns>,
}

impl Default for LearningConfig {
    fn default() -> Self {
        let domains = ["annuity_performance", "annuity_income"];
        Self {
            enabled_domains: domains.iter().map(|d| d.to_string()).collect(),
            enabled_lookup_types: LookupType::PRIORITY_ORDER.to_vec(),
            confidence_levels: BTreeMap::new(),
            min_records_for_learning: 10,
            min_confidence_for_cache: Decimal::new(80, 2),
            column_mappings: domains
                .iter()
                .map(|d| (d.to_string(), DomainColumns::default()))
                .collect(),
        }
    }
}

impl LearningConfig {
    /// Configured confidence for a lookup type. Defaults are 0.85 across the
    /// board except `plan_customer`, whose composite key earns 0.90.
    pub fn confidence_for(&self, lookup_type: LookupType) -> Decimal {
        if let Some(confidence) = self.confidence_levels.get(&lookup_type) {
            return *confidence;
        }
        match lookup_type {
            LookupType::PlanCustomer => Decimal::new(90, 2),
            _ => Decimal::new(85, 2),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_safe() {
        let config = EnrichmentConfig::default();
        assert!(!config.eqc.enabled);
        assert_eq!(config.eqc.sync_budget, 0);
        assert_eq!(config.environment, "development");
        assert_eq!(config.learning.min_records_for_learning, 10);
    }

    #[test]
    fn disabled_eqc_turns_every_feature_off() {
        let config = EqcLookupConfig::disabled();
        assert!(!config.enabled);
        assert_eq!(config.sync_budget, 0);
        assert!(!config.export_unknown_names);
        assert!(!config.auto_refresh_token);
    }

    #[test]
    fn confidence_defaults_favor_the_composite_key() {
        let learning = LearningConfig::default();
        assert_eq!(
            learning.confidence_for(LookupType::CustomerName),
            Decimal::new(85, 2)
        );
        assert_eq!(
            learning.confidence_for(LookupType::PlanCustomer),
            Decimal::new(90, 2)
        );

        let mut overridden = LearningConfig::default();
        overridden
            .confidence_levels
            .insert(LookupType::PlanCode, Decimal::new(99, 2));
        assert_eq!(
            overridden.confidence_for(LookupType::PlanCode),
            Decimal::new(99, 2)
        );
    }

    #[test]
    fn yaml_and_defaults_merge() {
        let config: EnrichmentConfig = Figment::new()
            .merge(Yaml::string(
                r#"
                environment: staging
                eqc:
                  enabled: true
                  sync_budget: 10
                "#,
            ))
            .extract()
            .unwrap();
        assert!(config.eqc.enabled);
        assert_eq!(config.eqc.sync_budget, 10);
        assert!(config.eqc.export_unknown_names);
        assert_eq!(config.environment, "staging");
    }

    #[test]
    fn explicit_salt_wins_over_the_dev_default() {
        let config = EnrichmentConfig {
            alias_salt: Some("pipeline_salt".to_string()),
            ..EnrichmentConfig::default()
        };
        assert_eq!(config.alias_salt(), "pipeline_salt");
    }
}
