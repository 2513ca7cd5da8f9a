//! Run-scoped enrichment metrics and unknown-company tracking.
//!
//! The observer is the only process-local shared state in the core: one
//! instance is created per pipeline run, mutated from the resolver (and any
//! queue workers attached to the run), drained at the end, and discarded.
//! All mutation goes through a single mutex.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

/// Aggregated counters for one pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EnrichmentStats {
    pub total_lookups: u64,
    pub cache_hits: u64,
    pub temp_ids_generated: u64,
    pub api_calls: u64,
    pub sync_budget_used: u64,
    pub async_queued: u64,
    pub queue_depth_after: i64,
    pub hit_type_counts: BTreeMap<String, u64>,
}

impl EnrichmentStats {
    /// Cache hit rate in `[0, 1]`; 0 when nothing was looked up.
    pub fn cache_hit_rate(&self) -> f64 {
        if self.total_lookups == 0 {
            0.0
        } else {
            self.cache_hits as f64 / self.total_lookups as f64
        }
    }

    /// Temp-id rate in `[0, 1]`; 0 when nothing was looked up.
    pub fn temp_id_rate(&self) -> f64 {
        if self.total_lookups == 0 {
            0.0
        } else {
            self.temp_ids_generated as f64 / self.total_lookups as f64
        }
    }

    /// Combine with stats from another run. Counters add; the queue depth
    /// takes the latest observation.
    pub fn merge(&self, other: &EnrichmentStats) -> EnrichmentStats {
        let mut hit_type_counts = self.hit_type_counts.clone();
        for (kind, count) in &other.hit_type_counts {
            *hit_type_counts.entry(kind.clone()).or_default() += count;
        }
        EnrichmentStats {
            total_lookups: self.total_lookups + other.total_lookups,
            cache_hits: self.cache_hits + other.cache_hits,
            temp_ids_generated: self.temp_ids_generated + other.temp_ids_generated,
            api_calls: self.api_calls + other.api_calls,
            sync_budget_used: self.sync_budget_used + other.sync_budget_used,
            async_queued: self.async_queued + other.async_queued,
            queue_depth_after: other.queue_depth_after,
            hit_type_counts,
        }
    }
}

/// One unresolved company, retained for export and manual backfill review.
///
/// Keyed by the raw (not normalised) name; repeated occurrences bump the
/// counter but keep the first-seen timestamp and the originally assigned
/// temp id.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnknownCompanyRecord {
    pub company_name: String,
    pub temporary_id: String,
    pub first_seen: DateTime<Utc>,
    pub occurrence_count: u64,
}

impl UnknownCompanyRecord {
    pub fn csv_headers() -> [&'static str; 4] {
        [
            "company_name",
            "temporary_id",
            "first_seen",
            "occurrence_count",
        ]
    }

    pub fn to_csv_row(&self) -> [String; 4] {
        [
            self.company_name.clone(),
            self.temporary_id.clone(),
            self.first_seen.to_rfc3339(),
            self.occurrence_count.to_string(),
        ]
    }
}

#[derive(Debug, Default)]
struct ObserverState {
    stats: EnrichmentStats,
    unknown_companies: BTreeMap<String, UnknownCompanyRecord>,
}

/// Thread-safe, run-scoped metrics collector.
#[derive(Debug, Default)]
pub struct EnrichmentObserver {
    state: Mutex<ObserverState>,
}

impl EnrichmentObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one resolution attempt (one input row).
    pub fn record_lookup(&self) {
        self.state.lock().stats.total_lookups += 1;
    }

    /// Record a cache hit, bucketed by match type (lookup type or override
    /// layer label).
    pub fn record_cache_hit(&self, match_type: &str) {
        let mut state = self.state.lock();
        state.stats.cache_hits += 1;
        *state
            .stats
            .hit_type_counts
            .entry(match_type.to_string())
            .or_default() += 1;
    }

    /// Record a generated temp id and remember the unknown company behind it.
    pub fn record_temp_id(&self, company_name: &str, temp_id: &str) {
        let mut state = self.state.lock();
        state.stats.temp_ids_generated += 1;
        state
            .unknown_companies
            .entry(company_name.to_string())
            .and_modify(|record| record.occurrence_count += 1)
            .or_insert_with(|| UnknownCompanyRecord {
                company_name: company_name.to_string(),
                temporary_id: temp_id.to_string(),
                first_seen: Utc::now(),
                occurrence_count: 1,
            });
    }

    /// Record one external API call; this also consumes sync budget.
    pub fn record_api_call(&self) {
        let mut state = self.state.lock();
        state.stats.api_calls += 1;
        state.stats.sync_budget_used += 1;
    }

    pub fn record_async_queued(&self) {
        self.state.lock().stats.async_queued += 1;
    }

    pub fn set_queue_depth(&self, depth: i64) {
        self.state.lock().stats.queue_depth_after = depth;
    }

    pub fn get_stats(&self) -> EnrichmentStats {
        self.state.lock().stats.clone()
    }

    /// Unknown companies, most frequent first.
    pub fn get_unknown_companies(&self) -> Vec<UnknownCompanyRecord> {
        let state = self.state.lock();
        let mut records: Vec<_> = state.unknown_companies.values().cloned().collect();
        records.sort_by(|a, b| b.occurrence_count.cmp(&a.occurrence_count));
        records
    }

    /// Export rows (no file I/O here), most frequent first.
    pub fn get_unknown_company_rows(&self) -> Vec<[String; 4]> {
        self.get_unknown_companies()
            .iter()
            .map(UnknownCompanyRecord::to_csv_row)
            .collect()
    }

    pub fn has_unknown_companies(&self) -> bool {
        !self.state.lock().unknown_companies.is_empty()
    }

    /// Discard everything, ready for a new run.
    pub fn reset(&self) {
        *self.state.lock() = ObserverState::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rates_handle_the_empty_run() {
        let stats = EnrichmentStats::default();
        assert_eq!(stats.cache_hit_rate(), 0.0);
        assert_eq!(stats.temp_id_rate(), 0.0);
    }

    #[test]
    fn hit_rate_reflects_recorded_events() {
        let observer = EnrichmentObserver::new();
        for _ in 0..4 {
            observer.record_lookup();
        }
        observer.record_cache_hit("plan_code");
        observer.record_cache_hit("plan_code");
        observer.record_cache_hit("customer_name");

        let stats = observer.get_stats();
        assert_eq!(stats.total_lookups, 4);
        assert_eq!(stats.cache_hits, 3);
        assert_eq!(stats.cache_hit_rate(), 0.75);
        assert_eq!(stats.hit_type_counts["plan_code"], 2);
        assert_eq!(stats.hit_type_counts["customer_name"], 1);
    }

    #[test]
    fn unknown_companies_aggregate_without_replacing_first_seen() {
        let observer = EnrichmentObserver::new();
        observer.record_temp_id("甲公司", "IN_AAAA2222BBBB3333");
        observer.record_temp_id("乙公司", "IN_CCCC4444DDDD5555");
        observer.record_temp_id("甲公司", "IN_SHOULD_NOT_REPLACE");
        observer.record_temp_id("甲公司", "IN_SHOULD_NOT_REPLACE");

        let unknown = observer.get_unknown_companies();
        assert_eq!(unknown.len(), 2);
        // Sorted by occurrence count, descending.
        assert_eq!(unknown[0].company_name, "甲公司");
        assert_eq!(unknown[0].occurrence_count, 3);
        assert_eq!(unknown[0].temporary_id, "IN_AAAA2222BBBB3333");
        assert_eq!(unknown[1].occurrence_count, 1);
    }

    #[test]
    fn api_calls_consume_budget_in_lockstep() {
        let observer = EnrichmentObserver::new();
        observer.record_api_call();
        observer.record_api_call();
        let stats = observer.get_stats();
        assert_eq!(stats.api_calls, 2);
        assert_eq!(stats.sync_budget_used, 2);
    }

    #[test]
    fn merge_adds_counters_and_takes_latest_depth() {
        let mut a = EnrichmentStats {
            total_lookups: 10,
            cache_hits: 4,
            ..Default::default()
        };
        a.hit_type_counts.insert("plan_code".to_string(), 4);
        a.queue_depth_after = 7;

        let mut b = EnrichmentStats {
            total_lookups: 5,
            cache_hits: 1,
            ..Default::default()
        };
        b.hit_type_counts.insert("plan_code".to_string(), 1);
        b.queue_depth_after = 2;

        let merged = a.merge(&b);
        assert_eq!(merged.total_lookups, 15);
        assert_eq!(merged.cache_hits, 5);
        assert_eq!(merged.hit_type_counts["plan_code"], 5);
        assert_eq!(merged.queue_depth_after, 2);
    }

    #[test]
    fn reset_clears_everything() {
        let observer = EnrichmentObserver::new();
        observer.record_lookup();
        observer.record_temp_id("甲公司", "IN_AAAA2222BBBB3333");
        observer.reset();
        assert_eq!(observer.get_stats(), EnrichmentStats::default());
        assert!(!observer.has_unknown_companies());
    }
}
