//! Bulk invalidation across both tiers
//!
//! All operations are synchronous: once a call returns, `get` for any of
//! the removed keys is a miss.

use glob::Pattern;
use tracing::info;

use crate::cache::McpToolsCache;
use crate::error::Result;

/// Stateless invalidation operations over a [`McpToolsCache`]
#[derive(Debug, Clone, Copy, Default)]
pub struct InvalidationService;

impl InvalidationService {
    /// Remove one key from both tiers
    pub fn invalidate_key(cache: &McpToolsCache, key: &str) -> bool {
        cache.delete(key)
    }

    /// Remove every key matching a glob pattern such as `"metadata:*"`.
    ///
    /// Matching looks at the key string only. Returns the number removed.
    pub fn invalidate_by_pattern(cache: &McpToolsCache, pattern: &str) -> Result<usize> {
        let pattern = Pattern::new(pattern)?;
        let removed = cache.remove_matching(|key| pattern.matches(key));
        info!("Invalidated {} entries matching {}", removed, pattern);
        Ok(removed)
    }

    /// Remove every key variant cached for one domain entity.
    ///
    /// An entity `(catalog, users)` matches `catalog:users`, any key with
    /// a prefix before it (`metadata:catalog:users`) and any key with extra
    /// argument segments after it (`catalog:users:fields`).
    pub fn invalidate_by_entity(
        cache: &McpToolsCache,
        entity_type: &str,
        entity_id: &str,
    ) -> usize {
        let patterns = entity_patterns(entity_type, entity_id);
        let removed = cache.remove_matching(|key| patterns.iter().any(|p| p.matches(key)));
        info!(
            "Invalidated {} entries for entity {}:{}",
            removed, entity_type, entity_id
        );
        removed
    }

    /// Empty both tiers, returning how many keys were held
    pub fn invalidate_all(cache: &McpToolsCache) -> usize {
        cache.clear_counting()
    }
}

/// Globs covering every key variant of an entity.
///
/// Both parts are escaped, so the patterns always parse.
pub fn entity_patterns(entity_type: &str, entity_id: &str) -> Vec<Pattern> {
    let stem = format!(
        "{}:{}",
        Pattern::escape(entity_type),
        Pattern::escape(entity_id)
    );

    [
        stem.clone(),
        format!("{}:*", stem),
        format!("*:{}", stem),
        format!("*:{}:*", stem),
    ]
    .iter()
    .filter_map(|p| Pattern::new(p).ok())
    .collect()
}
