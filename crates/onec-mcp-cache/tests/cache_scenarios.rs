//! End-to-end scenarios for the tool cache

use std::{path::Path, thread, time::Duration};

use onec_mcp_cache::{
    CacheConfig, DataClass, InvalidationService, McpToolsCache, StrategyKind,
};
use serde_json::json;
use tempfile::TempDir;

fn payload_files(dir: &Path) -> Vec<std::path::PathBuf> {
    std::fs::read_dir(dir.join("payloads"))
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect()
}

#[test]
fn set_then_get_returns_stored_value() {
    let cache = McpToolsCache::new(CacheConfig::default()).unwrap();

    assert!(cache.set(
        "catalog:users",
        json!({"type": "справочник"}),
        Some(300),
        Some("stable".parse::<DataClass>().unwrap()),
    ));

    assert_eq!(
        cache.get("catalog:users", None),
        Some(json!({"type": "справочник"}))
    );
    assert_eq!(cache.stats().hits, 1);
}

#[test]
fn pattern_invalidation_leaves_other_prefixes() {
    let cache = McpToolsCache::new(CacheConfig::default()).unwrap();
    cache.set("metadata:catalogs", json!(["users"]), None, Some(DataClass::Metadata));
    cache.set("metadata:documents", json!(["invoice"]), None, Some(DataClass::Metadata));
    cache.set("metadata:registers", json!(["stock"]), None, Some(DataClass::Metadata));
    cache.set("aggregates:sales", json!(1_000), None, Some(DataClass::Aggregates));

    let removed = InvalidationService::invalidate_by_pattern(&cache, "metadata:*").unwrap();

    assert_eq!(removed, 3);
    assert_eq!(cache.size(), 1);
    assert_eq!(cache.get("aggregates:sales", None), Some(json!(1_000)));
}

#[test]
fn touched_entry_survives_lru_eviction() {
    let config = CacheConfig::new().max_size_mb(1).strategy(StrategyKind::Lru);
    let cache = McpToolsCache::new(config).unwrap();
    let blob = json!("x".repeat(100_000));

    for i in 0..10 {
        assert!(cache.set(&format!("k{}", i), blob.clone(), None, None));
    }
    assert_eq!(cache.stats().evictions, 0);

    assert!(cache.get("k0", None).is_some());
    cache.set("k10", blob, None, None);

    let stats = cache.stats();
    assert!(stats.evictions > 0);
    assert!(stats.memory_bytes <= cache.config().max_size_bytes());
    assert!(cache.has("k0"), "recently touched entry was evicted");
    assert!(!cache.has("k1"), "least recently used entry survived");
    assert!(cache.has("k10"));
}

#[test]
fn demoted_entry_is_read_back_from_disk_once() {
    let temp_dir = TempDir::new().unwrap();
    let cache =
        McpToolsCache::new(CacheConfig::new().persistent_cache_dir(temp_dir.path())).unwrap();
    let value = json!({
        "attributes": ["Код", "Наименование"],
        "nested": {"depth": [1, 2, 3]}
    });

    cache.set("metadata:catalog:items", value.clone(), None, Some(DataClass::Metadata));
    assert!(cache.demote("metadata:catalog:items"));
    assert_eq!(cache.size(), 0);

    assert_eq!(cache.get("metadata:catalog:items", None), Some(value.clone()));
    assert_eq!(cache.size(), 1);
    assert_eq!(cache.stats().persistent_reads, 1);

    assert_eq!(cache.get("metadata:catalog:items", None), Some(value));
    assert_eq!(cache.stats().persistent_reads, 1);
}

#[test]
fn missing_payload_is_a_miss_and_heals() {
    let temp_dir = TempDir::new().unwrap();
    let cache =
        McpToolsCache::new(CacheConfig::new().persistent_cache_dir(temp_dir.path())).unwrap();

    cache.set("tool_config:search", json!({"limit": 10}), None, Some(DataClass::ToolConfig));
    cache.demote("tool_config:search");
    for file in payload_files(temp_dir.path()) {
        std::fs::remove_file(file).unwrap();
    }

    assert!(cache.get("tool_config:search", None).is_none());
    let stats = cache.stats();
    assert_eq!(stats.errors, 1);
    assert_eq!(stats.persistent_entries, 0);
    assert!(!cache.has("tool_config:search"));

    let refreshed = json!({"limit": 20});
    assert!(cache.set("tool_config:search", refreshed, None, Some(DataClass::ToolConfig)));
    cache.demote("tool_config:search");
    assert_eq!(cache.get("tool_config:search", None), Some(json!({"limit": 20})));
}

#[test]
fn corrupt_payload_is_a_miss_and_heals() {
    let temp_dir = TempDir::new().unwrap();
    let cache =
        McpToolsCache::new(CacheConfig::new().persistent_cache_dir(temp_dir.path())).unwrap();

    cache.set("metadata:x", json!("v"), None, Some(DataClass::Metadata));
    cache.demote("metadata:x");
    for file in payload_files(temp_dir.path()) {
        std::fs::write(file, b"garbage").unwrap();
    }

    assert!(cache.get("metadata:x", None).is_none());
    assert!(payload_files(temp_dir.path()).is_empty());
    assert_eq!(cache.stats().errors, 1);
}

#[test]
fn entries_expire_in_both_tiers() {
    let temp_dir = TempDir::new().unwrap();
    let cache =
        McpToolsCache::new(CacheConfig::new().persistent_cache_dir(temp_dir.path())).unwrap();

    cache.set("stable:short", json!(1), Some(1), Some(DataClass::Stable));
    cache.set("stable:long", json!(2), Some(3600), Some(DataClass::Stable));
    assert!(cache.get("stable:short", None).is_some());

    thread::sleep(Duration::from_millis(1_100));

    assert!(cache.get("stable:short", None).is_none());
    assert!(!cache.has("stable:short"));
    assert_eq!(cache.stats().persistent_entries, 1);
    assert_eq!(cache.get("stable:long", None), Some(json!(2)));
}

#[test]
fn purge_expired_sweeps_write_once_keys() {
    let temp_dir = TempDir::new().unwrap();
    let cache =
        McpToolsCache::new(CacheConfig::new().persistent_cache_dir(temp_dir.path())).unwrap();

    cache.set("metadata:once", json!(1), Some(1), Some(DataClass::Metadata));
    cache.demote("metadata:once");
    cache.set("dynamic:once", json!(2), Some(1), None);
    cache.set("metadata:kept", json!(3), None, Some(DataClass::Metadata));

    thread::sleep(Duration::from_millis(1_100));

    assert_eq!(cache.purge_expired(), 2);
    assert_eq!(cache.keys(), vec!["metadata:kept".to_string()]);
    assert_eq!(payload_files(temp_dir.path()).len(), 1);
}

#[test]
fn persistence_failure_does_not_block_set() {
    let temp_dir = TempDir::new().unwrap();
    let cache =
        McpToolsCache::new(CacheConfig::new().persistent_cache_dir(temp_dir.path())).unwrap();
    assert!(cache.set("metadata:x", json!(1), None, Some(DataClass::Metadata)));
    std::fs::remove_dir_all(temp_dir.path().join("payloads")).unwrap();

    assert!(cache.set("metadata:x", json!(2), None, Some(DataClass::Metadata)));
    assert_eq!(cache.get("metadata:x", None), Some(json!(2)));

    let stats = cache.stats();
    assert_eq!(stats.errors, 1);
    assert_eq!(stats.persistent_writes, 1);
    assert_eq!(stats.persistent_entries, 0);

    // The earlier disk copy was dropped along with the failed write
    cache.demote("metadata:x");
    assert!(cache.get("metadata:x", None).is_none());
}

#[tokio::test]
async fn async_read_through_and_invalidation() {
    let temp_dir = TempDir::new().unwrap();
    let cache =
        McpToolsCache::new(CacheConfig::new().persistent_cache_dir(temp_dir.path())).unwrap();

    for name in ["users", "items"] {
        let key = format!("metadata:catalog:{}", name);
        assert!(cache.set_async(&key, json!(name), None, Some(DataClass::Metadata)).await);
    }
    cache.demote("metadata:catalog:users");
    assert_eq!(
        cache.get_async("metadata:catalog:users", None).await,
        Some(json!("users"))
    );

    assert_eq!(
        InvalidationService::invalidate_by_entity(&cache, "catalog", "items"),
        1
    );
    assert!(cache.get_async("metadata:catalog:items", None).await.is_none());
    assert_eq!(cache.stats().persistent_entries, 1);
}
