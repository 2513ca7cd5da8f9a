//! Step 1 — the in-memory override layer.
//!
//! Five priority sub-layers, each a map lookup on one column. Later layers
//! only see rows the earlier ones left unresolved, so ties cannot happen.
//! The maps are usually loaded from a YAML overrides file maintained by the
//! data team.

use std::collections::{BTreeMap, HashMap};

use figment::{
    Figment,
    providers::{Format, Yaml},
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{ResolutionStatistics, ResolutionStrategy};
use crate::observer::EnrichmentObserver;
use crate::table::RowTable;

/// The five override sub-layers, in resolution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideLayer {
    Plan,
    Account,
    Hardcode,
    Name,
    AccountName,
}

impl OverrideLayer {
    pub const ORDER: [OverrideLayer; 5] = [
        OverrideLayer::Plan,
        OverrideLayer::Account,
        OverrideLayer::Hardcode,
        OverrideLayer::Name,
        OverrideLayer::AccountName,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OverrideLayer::Plan => "plan",
            OverrideLayer::Account => "account",
            OverrideLayer::Hardcode => "hardcode",
            OverrideLayer::Name => "name",
            OverrideLayer::AccountName => "account_name",
        }
    }

    /// The input column this layer matches against. `Hardcode` is a second
    /// pass over plan codes.
    pub fn column<'s>(&self, strategy: &'s ResolutionStrategy) -> &'s str {
        match self {
            OverrideLayer::Plan | OverrideLayer::Hardcode => &strategy.plan_code_column,
            OverrideLayer::Account => &strategy.account_number_column,
            OverrideLayer::Name => &strategy.customer_name_column,
            OverrideLayer::AccountName => &strategy.account_name_column,
        }
    }
}

impl std::fmt::Display for OverrideLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Alias-to-canonical-id maps per layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OverrideMap {
    layers: BTreeMap<OverrideLayer, HashMap<String, String>>,
}

impl OverrideMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        layer: OverrideLayer,
        alias: impl Into<String>,
        company_id: impl Into<String>,
    ) {
        self.layers
            .entry(layer)
            .or_default()
            .insert(alias.into(), company_id.into());
    }

    pub fn layer(&self, layer: OverrideLayer) -> Option<&HashMap<String, String>> {
        self.layers.get(&layer)
    }

    pub fn is_empty(&self) -> bool {
        self.layers.values().all(HashMap::is_empty)
    }

    /// Parse an overrides document, e.g.
    ///
    /// ```yaml
    /// plan:
    ///   FP0001: "614810477"
    /// name:
    ///   中国平安: "614810477"
    /// ```
    pub fn from_yaml(document: &str) -> Result<Self, figment::Error> {
        Figment::new().merge(Yaml::string(document)).extract()
    }

    /// Load overrides from a YAML file on disk.
    pub fn from_yaml_file(path: impl AsRef<std::path::Path>) -> Result<Self, figment::Error> {
        Figment::new().merge(Yaml::file(path.as_ref())).extract()
    }
}

/// Apply the override layers to all still-unresolved rows.
pub(crate) fn apply(
    table: &mut RowTable,
    strategy: &ResolutionStrategy,
    overrides: &OverrideMap,
    stats: &mut ResolutionStatistics,
    observer: Option<&EnrichmentObserver>,
) {
    for layer in OverrideLayer::ORDER {
        let mut hits = 0usize;
        let column = layer.column(strategy);
        if let Some(mappings) = overrides.layer(layer)
            && !mappings.is_empty()
            && table.has_column(column)
        {
            for row in table.rows_missing(&strategy.output_column) {
                let Some(company_id) = table
                    .text(row, column)
                    .and_then(|key| mappings.get(key))
                    .cloned()
                else {
                    continue;
                };
                table.set_value(row, &strategy.output_column, company_id);
                hits += 1;
                if let Some(observer) = observer {
                    observer.record_cache_hit(layer.as_str());
                }
            }
        }
        stats.yaml_hits.insert(layer.as_str().to_string(), hits);
        debug!(layer = %layer, hits, "override layer applied");
    }
}
