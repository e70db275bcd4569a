//! Property-based tests for cache invariants
//! **Covers: metrics consistency, pattern exactness, budget, failure exclusion**

use onec_mcp_cache::{keys, CacheConfig, InvalidationService, McpToolsCache};
use proptest::prelude::*;
use serde_json::{json, Map, Value};

#[derive(Debug, Clone)]
enum Op {
    Set(u8),
    Get(u8),
    Delete(u8),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..8).prop_map(Op::Set),
        (0u8..8).prop_map(Op::Get),
        (0u8..8).prop_map(Op::Delete),
    ]
}

fn key_strategy() -> impl Strategy<Value = String> {
    (
        prop_oneof![Just("metadata"), Just("aggregates"), Just("metadatax"), Just("tool")],
        r"[a-z0-9_]{1,12}",
    )
        .prop_map(|(prefix, rest)| format!("{}:{}", prefix, rest))
}

fn memory_cache() -> McpToolsCache {
    McpToolsCache::new(CacheConfig::default()).expect("default config is valid")
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// hits + misses always equals the number of gets, and the ratio stays in range
    #[test]
    fn prop_lookups_equal_gets(ops in prop::collection::vec(op_strategy(), 0..60)) {
        let cache = memory_cache();
        let mut gets = 0u64;
        let mut expected_hits = 0u64;
        let mut present = std::collections::HashSet::new();

        for op in ops {
            match op {
                Op::Set(k) => {
                    let stored = cache.set(&format!("k{}", k), json!(k), None, None);
                    prop_assert!(stored);
                    present.insert(k);
                }
                Op::Get(k) => {
                    gets += 1;
                    let found = cache.get(&format!("k{}", k), None);
                    prop_assert_eq!(found.is_some(), present.contains(&k));
                    if found.is_some() {
                        expected_hits += 1;
                    }
                }
                Op::Delete(k) => {
                    prop_assert_eq!(cache.delete(&format!("k{}", k)), present.remove(&k));
                }
            }
        }

        let stats = cache.stats();
        prop_assert_eq!(stats.hits + stats.misses, gets);
        prop_assert_eq!(stats.hits, expected_hits);
        prop_assert!((0.0..=1.0).contains(&stats.hit_ratio));
        if gets == 0 {
            prop_assert_eq!(stats.hit_ratio, 0.0);
        }
    }

    /// Pattern invalidation removes exactly the matching keys
    #[test]
    fn prop_pattern_removes_exactly_matches(
        keys in prop::collection::hash_set(key_strategy(), 0..40)
    ) {
        let cache = memory_cache();
        for key in &keys {
            cache.set(key, json!(key), None, None);
        }
        let expected = keys.iter().filter(|k| k.starts_with("metadata:")).count();

        let removed = InvalidationService::invalidate_by_pattern(&cache, "metadata:*").unwrap();

        prop_assert_eq!(removed, expected);
        prop_assert_eq!(cache.size(), keys.len() - expected);
        for key in &keys {
            prop_assert_eq!(cache.has(key), !key.starts_with("metadata:"));
        }
    }

    /// The memory tier never ends a `set` above its budget
    #[test]
    fn prop_memory_stays_within_budget(sizes in prop::collection::vec(1usize..400_000, 1..30)) {
        let cache = McpToolsCache::new(CacheConfig::new().max_size_mb(1)).unwrap();
        for (i, size) in sizes.into_iter().enumerate() {
            let stored = cache.set(&format!("blob:{}", i), json!("x".repeat(size)), None, None);
            prop_assert!(stored);
            prop_assert!(cache.memory_usage_bytes() <= cache.config().max_size_bytes());
        }
    }

    /// Results flagged as failures are never retrievable
    #[test]
    fn prop_failures_never_cached(key in key_strategy(), message in ".{0,40}") {
        let cache = memory_cache();
        let flagged = json!({"isError": true, "content": [message.clone()]});
        prop_assert!(!cache.set(&key, flagged, None, None));
        let error_value = json!({"error": message});
        prop_assert!(!cache.set(&key, error_value, None, None));
        prop_assert!(cache.get(&key, None).is_none());
    }

    /// Tool keys do not depend on argument order
    #[test]
    fn prop_tool_key_ignores_argument_order(
        pairs in prop::collection::btree_map(r"[a-z]{1,8}", any::<i64>(), 0..8)
    ) {
        let forward: Map<String, Value> =
            pairs.iter().map(|(k, v)| (k.clone(), json!(v))).collect();
        let reverse: Map<String, Value> =
            pairs.iter().rev().map(|(k, v)| (k.clone(), json!(v))).collect();
        let (forward, reverse) = (Value::Object(forward), Value::Object(reverse));
        if pairs.len() > 1 {
            prop_assert_ne!(forward.to_string(), reverse.to_string());
        }

        prop_assert_eq!(
            keys::tool_key("query", &forward),
            keys::tool_key("query", &reverse)
        );
    }
}
