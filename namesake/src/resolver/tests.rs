//! End-to-end resolver scenarios over the in-memory store and scripted
//! provider.

use rust_decimal::Decimal;

use super::*;
use crate::config::EqcLookupConfig;
use crate::observer::EnrichmentObserver;
use crate::store::InMemoryStore;
use crate::test_utils::ScriptedProvider;
use crate::types::{IndexUpsert, LookupType, RequestStatus, SourceType};

const SALT: &str = "test_salt";

fn strategy() -> ResolutionStrategy {
    ResolutionStrategy::default()
}

fn seed(store: &mut InMemoryStore, key: &str, lookup_type: LookupType, company_id: &str) {
    store.seed(IndexUpsert::new(
        key,
        lookup_type,
        company_id,
        Decimal::new(85, 2),
        SourceType::DomainLearning,
    ));
}

#[tokio::test]
async fn override_layer_wins_over_db_cache() {
    let mut store = InMemoryStore::new();
    seed(&mut store, "FP0001", LookupType::PlanCode, "999999999");

    let mut overrides = OverrideMap::new();
    overrides.insert(OverrideLayer::Plan, "FP0001", "614810477");

    let mut table = RowTable::from(vec![[("计划代码", "FP0001"), ("客户名称", "公司A")]]);
    let strategy = strategy();

    let stats = {
        let mut resolver = Resolver::new(EqcLookupConfig::disabled(), SALT)
            .with_overrides(overrides)
            .with_store(&mut store);
        resolver.resolve_batch(&mut table, &strategy).await.unwrap()
    };

    assert_eq!(table.text(0, &strategy.output_column), Some("614810477"));
    assert_eq!(stats.yaml_hits["plan"], 1);
    assert_eq!(stats.db_cache_hits_total(), 0);
    // Resolved before Step 2, so no decision path was recorded for the row.
    assert!(stats.db_decision_paths.is_empty());
}

#[tokio::test]
async fn db_cache_hits_on_normalised_customer_name() {
    let mut store = InMemoryStore::new();
    seed(
        &mut store,
        "中国平安",
        LookupType::CustomerName,
        "614810477",
    );

    let mut table = RowTable::from(vec![[("客户名称", "  中国平安  ")]]);
    let strategy = strategy();

    let stats = {
        let mut resolver = Resolver::new(EqcLookupConfig::disabled(), SALT).with_store(&mut store);
        resolver.resolve_batch(&mut table, &strategy).await.unwrap()
    };

    assert_eq!(table.text(0, &strategy.output_column), Some("614810477"));
    assert_eq!(stats.db_cache_hits["customer_name"], 1);
    assert_eq!(
        stats.db_decision_paths["DB-P1:MISS→DB-P2:MISS→DB-P3:MISS→DB-P4:HIT"],
        1
    );
    // The matched record's hit count was touched.
    assert_eq!(
        store
            .record(LookupType::CustomerName, "中国平安")
            .unwrap()
            .hit_count,
        1
    );
}

#[tokio::test]
async fn sentinel_cache_entries_are_skipped_for_the_next_priority() {
    let mut store = InMemoryStore::new();
    seed(&mut store, "FP0001", LookupType::PlanCode, "N/A");
    seed(
        &mut store,
        "中国平安",
        LookupType::CustomerName,
        "614810477",
    );

    let mut table = RowTable::from(vec![[("计划代码", "FP0001"), ("客户名称", "中国平安")]]);
    let strategy = strategy();

    let stats = {
        let mut resolver = Resolver::new(EqcLookupConfig::disabled(), SALT).with_store(&mut store);
        resolver.resolve_batch(&mut table, &strategy).await.unwrap()
    };

    assert_eq!(table.text(0, &strategy.output_column), Some("614810477"));
    assert_eq!(stats.db_cache_hits["customer_name"], 1);
    // P5 exists for this row (plan|customer), but P4 already hit.
    assert_eq!(
        stats.db_decision_paths["DB-P1:INVALID→DB-P2:MISS→DB-P3:MISS→DB-P4:HIT"],
        1
    );
}

#[tokio::test]
async fn passthrough_backflows_only_the_present_weak_keys() {
    let mut store = InMemoryStore::new();
    let mut table = RowTable::from(vec![[
        ("计划代码", "AN001"),
        ("客户名称", "测试企业A"),
        ("公司代码", "608349737"),
    ]]);
    let strategy = strategy();

    let stats = {
        let mut resolver = Resolver::new(EqcLookupConfig::disabled(), SALT).with_store(&mut store);
        resolver.resolve_batch(&mut table, &strategy).await.unwrap()
    };

    assert_eq!(table.text(0, &strategy.output_column), Some("608349737"));
    assert_eq!(stats.existing_column_hits, 1);
    assert_eq!(stats.backflow.inserted, 2);

    // Plan code raw, customer name normalised; nothing for the absent
    // account columns.
    let plan = store.record(LookupType::PlanCode, "AN001").unwrap();
    assert_eq!(plan.company_id, "608349737");
    assert_eq!(plan.source, "pipeline_backflow");
    let name = store.record(LookupType::CustomerName, "测试企业A").unwrap();
    assert_eq!(name.company_id, "608349737");
    assert_eq!(store.record_count(), 2);
}

#[tokio::test]
async fn passthrough_keeps_temp_ids_out_of_backflow() {
    let mut store = InMemoryStore::new();
    let mut table = RowTable::from(vec![[
        ("计划代码", "AN001"),
        ("客户名称", "测试企业A"),
        ("公司代码", "IN_AAAA2222BBBB3333"),
    ]]);
    let strategy = strategy();

    let stats = {
        let mut resolver = Resolver::new(EqcLookupConfig::disabled(), SALT).with_store(&mut store);
        resolver.resolve_batch(&mut table, &strategy).await.unwrap()
    };

    // The id passes through, but teaches the cache nothing.
    assert_eq!(
        table.text(0, &strategy.output_column),
        Some("IN_AAAA2222BBBB3333")
    );
    assert_eq!(stats.existing_column_hits, 1);
    assert_eq!(store.record_count(), 0);
}

#[tokio::test]
async fn sentinel_existing_ids_fall_through() {
    let mut store = InMemoryStore::new();
    let mut table = RowTable::from(vec![[("客户名称", "测试企业B"), ("公司代码", "NA")]]);
    let strategy = strategy();

    let stats = {
        let mut resolver = Resolver::new(EqcLookupConfig::disabled(), SALT).with_store(&mut store);
        resolver.resolve_batch(&mut table, &strategy).await.unwrap()
    };

    assert_eq!(stats.existing_column_hits, 0);
    assert_eq!(stats.temp_ids_generated, 1);
    assert!(
        table
            .text(0, &strategy.output_column)
            .unwrap()
            .starts_with("IN_")
    );
}

#[test_log::test(tokio::test)]
async fn external_budget_is_spent_per_unique_name() {
    let mut store = InMemoryStore::new();
    let provider = ScriptedProvider::new(5).with_hit("中国平安", "614810477");
    let observer = EnrichmentObserver::new();

    let rows: Vec<_> = (0..10).map(|_| [("客户名称", "中国平安")]).collect();
    let mut table = RowTable::from(rows);
    let strategy = strategy();

    let stats = {
        let mut resolver = Resolver::new(EqcLookupConfig::with_budget(5), SALT)
            .with_store(&mut store)
            .with_provider(&provider)
            .with_observer(&observer);
        resolver.resolve_batch(&mut table, &strategy).await.unwrap()
    };

    // Ten identical rows, one call.
    assert_eq!(provider.calls(), 1);
    assert_eq!(stats.eqc_sync_hits, 10);
    assert_eq!(stats.budget_consumed, 1);
    assert_eq!(stats.budget_remaining, 4);
    for row in 0..10 {
        assert_eq!(table.text(row, &strategy.output_column), Some("614810477"));
    }

    // The confirmed answer was cached with the external source.
    let cached = store.record(LookupType::CustomerName, "中国平安").unwrap();
    assert_eq!(cached.source, "eqc");
    assert_eq!(cached.confidence, Decimal::new(95, 2));

    assert_eq!(observer.get_stats().api_calls, 1);
    assert_eq!(stats.unresolved, 0);
}

#[test_log::test(tokio::test)]
async fn exhausted_budget_falls_through_to_temp_ids_and_the_queue() {
    let mut store = InMemoryStore::new();
    let provider = ScriptedProvider::failing(3);

    let rows: Vec<_> = (0..20)
        .map(|i| [("客户名称", format!("未知公司{i:02}"))])
        .collect();
    let mut table = RowTable::from_rows(
        rows.into_iter()
            .map(|pairs| pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
            .collect(),
    );
    let strategy = strategy();

    let stats = {
        let mut resolver = Resolver::new(EqcLookupConfig::with_budget(3), SALT)
            .with_store(&mut store)
            .with_provider(&provider);
        resolver.resolve_batch(&mut table, &strategy).await.unwrap()
    };

    // At most three calls were made before the adapter went unavailable.
    assert_eq!(provider.calls(), 3);
    assert_eq!(stats.budget_consumed, 3);
    assert_eq!(stats.budget_remaining, 0);
    assert_eq!(stats.eqc_sync_hits, 0);

    // Every row got a well-formed temp id and a queue entry.
    assert_eq!(stats.temp_ids_generated, 20);
    assert_eq!(stats.async_queued, 20);
    assert_eq!(store.queued().len(), 20);
    for row in 0..20 {
        let id = table.text(row, &strategy.output_column).unwrap();
        assert!(id.starts_with("IN_"));
        assert_eq!(id.len(), 19);
    }
    for request in store.queued() {
        assert_eq!(request.status, RequestStatus::Pending);
        assert!(request.next_retry_at.is_some());
        assert!(request.temp_id.as_deref().unwrap().starts_with("IN_"));
    }
    assert_eq!(stats.unresolved, 0);
}

#[tokio::test]
async fn placeholder_names_get_no_temp_id_and_no_queue_entry() {
    let mut store = InMemoryStore::new();
    let mut table = RowTable::from(vec![
        [("客户名称", "0")],
        [("客户名称", "空白")],
        [("客户名称", "   ")],
        [("客户名称", "真实公司")],
    ]);
    let strategy = strategy();

    let stats = {
        let mut resolver = Resolver::new(EqcLookupConfig::disabled(), SALT).with_store(&mut store);
        resolver.resolve_batch(&mut table, &strategy).await.unwrap()
    };

    assert_eq!(stats.temp_ids_generated, 1);
    assert_eq!(stats.async_queued, 1);
    assert_eq!(stats.unresolved, 3);
    for row in 0..3 {
        assert_eq!(table.text(row, &strategy.output_column), None);
    }
    assert!(
        table
            .text(3, &strategy.output_column)
            .unwrap()
            .starts_with("IN_")
    );
}

#[tokio::test]
async fn duplicate_names_enqueue_once_but_each_get_temp_ids() {
    let mut store = InMemoryStore::new();
    let mut table = RowTable::from(vec![
        [("客户名称", "同一家公司")],
        [("客户名称", "同一家公司 ")],
        [("客户名称", "另一家公司")],
    ]);
    let strategy = strategy();

    let stats = {
        let mut resolver = Resolver::new(EqcLookupConfig::disabled(), SALT).with_store(&mut store);
        resolver.resolve_batch(&mut table, &strategy).await.unwrap()
    };

    assert_eq!(stats.temp_ids_generated, 3);
    // Deduplicated by normalised name within the batch.
    assert_eq!(stats.async_queued, 2);
    // Name variants collide on the same deterministic id.
    assert_eq!(
        table.text(0, &strategy.output_column),
        table.text(1, &strategy.output_column)
    );
}

#[tokio::test]
async fn second_run_resolves_from_backflowed_cache() {
    let mut store = InMemoryStore::new();
    let strategy = strategy();
    let rows = vec![[
        ("计划代码", "AN001"),
        ("客户名称", "测试企业A"),
        ("公司代码", "608349737"),
    ]];

    let mut first_table = RowTable::from(rows.clone());
    let first = {
        let mut resolver = Resolver::new(EqcLookupConfig::disabled(), SALT).with_store(&mut store);
        resolver
            .resolve_batch(&mut first_table, &strategy)
            .await
            .unwrap()
    };
    assert_eq!(first.existing_column_hits, 1);
    assert_eq!(first.db_cache_hits_total(), 0);

    // Same input again, minus the existing id: the back-flowed mappings now
    // answer from the cache at the highest priority.
    let mut second_table = RowTable::from(vec![[("计划代码", "AN001"), ("客户名称", "测试企业A")]]);
    let second = {
        let mut resolver = Resolver::new(EqcLookupConfig::disabled(), SALT).with_store(&mut store);
        resolver
            .resolve_batch(&mut second_table, &strategy)
            .await
            .unwrap()
    };

    assert_eq!(
        second_table.text(0, &strategy.output_column),
        Some("608349737")
    );
    assert_eq!(second.db_cache_hits["plan_code"], 1);
    assert_eq!(second.existing_column_hits, 0);
}

#[tokio::test]
async fn missing_customer_column_is_fatal() {
    let mut table = RowTable::from(vec![[("计划代码", "FP0001")]]);
    let mut resolver = Resolver::new(EqcLookupConfig::disabled(), SALT);
    let err = resolver
        .resolve_batch(&mut table, &strategy())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        crate::error::ResolutionError::MissingColumns { .. }
    ));
}

#[tokio::test]
async fn failed_batch_lookup_is_fatal() {
    let mut store = InMemoryStore::new();
    store.fail_batch_lookup = true;

    let mut table = RowTable::from(vec![[("客户名称", "中国平安")]]);
    let err = {
        let mut resolver = Resolver::new(EqcLookupConfig::disabled(), SALT).with_store(&mut store);
        resolver
            .resolve_batch(&mut table, &strategy())
            .await
            .unwrap_err()
    };
    assert!(matches!(
        err,
        crate::error::ResolutionError::RepositoryFatal(_)
    ));
}

#[tokio::test]
async fn backflow_and_enqueue_failures_do_not_fail_the_batch() {
    let mut store = InMemoryStore::new();
    store.fail_upserts = true;
    store.fail_enqueue = true;

    let mut table = RowTable::from(vec![
        [("客户名称", "测试企业A"), ("公司代码", "608349737")],
        [("客户名称", "没见过的公司"), ("公司代码", "")],
    ]);
    let strategy = strategy();

    let stats = {
        let mut resolver = Resolver::new(EqcLookupConfig::disabled(), SALT).with_store(&mut store);
        resolver.resolve_batch(&mut table, &strategy).await.unwrap()
    };

    assert_eq!(stats.existing_column_hits, 1);
    assert_eq!(stats.backflow, BackflowStats::default());
    assert_eq!(stats.temp_ids_generated, 1);
    assert_eq!(stats.async_queued, 0);
    assert_eq!(store.record_count(), 0);
}

#[tokio::test]
async fn resolver_without_collaborators_still_assigns_temp_ids() {
    let mut table = RowTable::from(vec![[("客户名称", "孤儿公司")]]);
    let strategy = strategy();
    let stats = Resolver::new(EqcLookupConfig::disabled(), SALT)
        .resolve_batch(&mut table, &strategy)
        .await
        .unwrap();

    assert_eq!(stats.temp_ids_generated, 1);
    assert_eq!(stats.async_queued, 0);
    assert_eq!(stats.unresolved, 0);
}

#[tokio::test]
async fn temp_id_generation_can_be_disabled() {
    let mut table = RowTable::from(vec![[("客户名称", "孤儿公司")]]);
    let strategy = ResolutionStrategy {
        generate_temp_ids: false,
        ..ResolutionStrategy::default()
    };
    let stats = Resolver::new(EqcLookupConfig::disabled(), SALT)
        .resolve_batch(&mut table, &strategy)
        .await
        .unwrap();

    assert_eq!(stats.temp_ids_generated, 0);
    assert_eq!(stats.unresolved, 1);
}

#[tokio::test]
async fn observer_sees_the_whole_run() {
    let mut store = InMemoryStore::new();
    seed(&mut store, "FP0001", LookupType::PlanCode, "614810477");
    let observer = EnrichmentObserver::new();

    let mut table = RowTable::from(vec![
        [("计划代码", "FP0001"), ("客户名称", "公司A")],
        [("计划代码", ""), ("客户名称", "没见过的公司")],
    ]);
    let strategy = strategy();

    {
        let mut resolver = Resolver::new(EqcLookupConfig::disabled(), SALT)
            .with_store(&mut store)
            .with_observer(&observer);
        resolver.resolve_batch(&mut table, &strategy).await.unwrap();
    }

    let stats = observer.get_stats();
    assert_eq!(stats.total_lookups, 2);
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(stats.hit_type_counts["plan_code"], 1);
    assert_eq!(stats.temp_ids_generated, 1);
    assert_eq!(stats.async_queued, 1);

    let unknown = observer.get_unknown_companies();
    assert_eq!(unknown.len(), 1);
    assert_eq!(unknown[0].company_name, "没见过的公司");
}
