//! Integration tests for application wiring: layered configuration and the
//! process-lifetime cache holder

use onec_mcp_cache::{
    get_cache, init_cache, shutdown_cache, CacheConfig, CacheError, DataClass, StrategyKind,
};
use serde_json::json;
use serial_test::serial;
use tempfile::tempdir;

#[test]
#[serial]
fn test_file_config_drives_global_cache() {
    let dir = tempdir().unwrap();
    let config_path = dir.path().join("cache.toml");
    let store_dir = dir.path().join("store");
    std::fs::write(
        &config_path,
        format!(
            "max_size_mb = 16\nstrategy = \"ttl\"\ndefault_ttl_stable = 3600\n\
             persistent_cache_dir = {:?}\n",
            store_dir.to_string_lossy()
        ),
    )
    .unwrap();

    let config = CacheConfig::load(Some(&config_path)).unwrap();
    assert_eq!(config.max_size_mb, 16);
    assert_eq!(config.strategy, StrategyKind::Ttl);
    assert_eq!(config.default_ttl_dynamic, 300);

    let cache = init_cache(config).unwrap();
    assert!(cache.is_persistent());
    assert_eq!(cache.strategy_name(), "ttl");
    cache.set("metadata:catalogs", json!(["users"]), None, Some(DataClass::Metadata));

    let shared = get_cache().unwrap();
    assert_eq!(shared.get("metadata:catalogs", None), Some(json!(["users"])));

    shutdown_cache();
    assert!(get_cache().is_none());

    // A fresh process-level cache sees what the previous one persisted
    let reopened = init_cache(CacheConfig::load(Some(&config_path)).unwrap()).unwrap();
    assert_eq!(reopened.get("metadata:catalogs", None), Some(json!(["users"])));
    shutdown_cache();
}

#[test]
#[serial]
fn test_environment_overrides_and_validation() {
    std::env::set_var("ONEC_MCP_CACHE_DEFAULT_TTL_DYNAMIC", "60");
    let loaded = CacheConfig::load(None);
    std::env::remove_var("ONEC_MCP_CACHE_DEFAULT_TTL_DYNAMIC");
    assert_eq!(loaded.unwrap().default_ttl_dynamic, 60);

    std::env::set_var("ONEC_MCP_CACHE_MAX_SIZE_MB", "0");
    let rejected = CacheConfig::load(None);
    std::env::remove_var("ONEC_MCP_CACHE_MAX_SIZE_MB");
    assert!(matches!(rejected, Err(CacheError::InvalidConfig { .. })));
}

#[test]
#[serial]
fn test_failed_init_leaves_no_global() {
    shutdown_cache();
    let dir = tempdir().unwrap();
    let blocker = dir.path().join("file");
    std::fs::write(&blocker, b"not a directory").unwrap();

    let result = init_cache(CacheConfig::new().persistent_cache_dir(&blocker));
    assert!(result.is_err());
    assert!(get_cache().is_none());
}

#[test]
#[serial]
fn test_saved_config_roundtrip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("nested").join("cache.toml");
    let config = CacheConfig::new()
        .max_size_mb(8)
        .low_water_ratio(0.75)
        .compress_payloads(false);

    config.save(&path).unwrap();
    assert_eq!(CacheConfig::load(Some(&path)).unwrap(), config);
}
