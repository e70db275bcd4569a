//! Integration tests for the MCP tool dispatch boundary
//!
//! Tool handlers only ever see `cache_tool_result` / `get_cached_tool_result`
//! and the memoization wrappers; these tests drive the cache through that
//! surface the way a proxy server would.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use onec_mcp_cache::{
    cached_async, CacheConfig, CachedOptions, DataClass, InvalidationService, McpToolsCache,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tempfile::tempdir;
use tokio::time::{sleep, Duration};

/// Stand-in for the 1C backend: counts calls, fails on request
struct MockBackend {
    calls: AtomicUsize,
}

impl MockBackend {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }

    fn call(&self, tool: &str, arguments: &Value) -> Value {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if arguments.get("fail").and_then(Value::as_bool) == Some(true) {
            return json!({"isError": true, "content": [{"type": "text", "text": "backend error"}]});
        }
        json!({
            "content": [{"type": "text", "text": format!("{} ok", tool)}],
            "arguments": arguments
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

/// What a proxy tool handler does around a backend call
fn dispatch(cache: &McpToolsCache, backend: &MockBackend, tool: &str, arguments: &Value) -> Value {
    if let Some(hit) = cache.get_cached_tool_result(tool, arguments) {
        return hit;
    }
    let result = backend.call(tool, arguments);
    cache.cache_tool_result(tool, arguments, result.clone());
    result
}

#[test]
fn test_repeated_tool_calls_hit_backend_once() {
    let cache = McpToolsCache::new(CacheConfig::default()).unwrap();
    let backend = MockBackend::new();

    let forward = json!({"name": "Контрагенты", "limit": 5});
    let reverse = json!({"limit": 5, "name": "Контрагенты"});
    let first = dispatch(&cache, &backend, "get_catalog", &forward);
    let second = dispatch(&cache, &backend, "get_catalog", &reverse);

    assert_eq!(first, second);
    assert_eq!(backend.calls(), 1);

    let stats = cache.stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
    assert!((stats.hit_ratio - 0.5).abs() < f64::EPSILON);
}

#[test]
fn test_error_results_are_recomputed() {
    let cache = McpToolsCache::new(CacheConfig::default()).unwrap();
    let backend = MockBackend::new();
    let arguments = json!({"query": "ВЫБРАТЬ 1", "fail": true});

    dispatch(&cache, &backend, "execute_query", &arguments);
    dispatch(&cache, &backend, "execute_query", &arguments);

    assert_eq!(backend.calls(), 2);
    assert_eq!(cache.size(), 0);
}

#[test]
fn test_invalidate_tool_forces_refresh() {
    let cache = McpToolsCache::new(CacheConfig::default()).unwrap();
    let backend = MockBackend::new();

    dispatch(&cache, &backend, "get_metadata", &json!({"type": "catalog"}));
    dispatch(&cache, &backend, "get_metadata", &json!({"type": "document"}));
    dispatch(&cache, &backend, "list_tools", &json!({}));
    assert_eq!(backend.calls(), 3);

    assert_eq!(cache.invalidate_tool("get_metadata"), 2);
    dispatch(&cache, &backend, "get_metadata", &json!({"type": "catalog"}));
    dispatch(&cache, &backend, "list_tools", &json!({}));
    assert_eq!(backend.calls(), 4);

    assert_eq!(
        InvalidationService::invalidate_by_pattern(&cache, "tool:*").unwrap(),
        2
    );
}

#[test]
fn test_tool_config_results_survive_restart() {
    let dir = tempdir().unwrap();
    let config = CacheConfig::new().persistent_cache_dir(dir.path());
    let backend = MockBackend::new();

    {
        let cache = McpToolsCache::new(config.clone()).unwrap();
        cache.set_tool_data_class("list_tools", DataClass::ToolConfig);
        dispatch(&cache, &backend, "list_tools", &json!({}));
        dispatch(&cache, &backend, "get_catalog", &json!({"name": "Номенклатура"}));
    }

    let cache = McpToolsCache::new(config).unwrap();
    cache.set_tool_data_class("list_tools", DataClass::ToolConfig);
    dispatch(&cache, &backend, "list_tools", &json!({}));
    dispatch(&cache, &backend, "get_catalog", &json!({"name": "Номенклатура"}));

    // api_response results are memory-only and had to be fetched again
    assert_eq!(backend.calls(), 3);
    assert_eq!(cache.stats().persistent_reads, 1);
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CatalogPage {
    catalog: String,
    page: u32,
    items: Vec<String>,
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_memoized_async_handler_under_concurrency() {
    let cache = Arc::new(McpToolsCache::new(CacheConfig::default()).unwrap());
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);

    let fetch_page = cached_async(
        Arc::clone(&cache),
        "backend::fetch_page",
        CachedOptions::new()
            .data_class(DataClass::Aggregates)
            .single_flight(true),
        move |(catalog, page): (String, u32)| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                sleep(Duration::from_millis(100)).await;
                Ok::<_, String>(CatalogPage {
                    items: vec![format!("{}-{}", catalog, page)],
                    catalog,
                    page,
                })
            }
        },
    );
    let fetch_page = Arc::new(fetch_page);

    let tasks: Vec<_> = (0..8)
        .map(|i| {
            let fetch_page = Arc::clone(&fetch_page);
            tokio::spawn(async move {
                fetch_page(("Номенклатура".to_string(), i % 2)).await
            })
        })
        .collect();

    for result in futures::future::join_all(tasks).await {
        let page = result.unwrap().unwrap();
        assert_eq!(page.catalog, "Номенклатура");
    }

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(cache.size(), 2);
    assert_eq!(cache.stats().lookups(), 8);
}
