//! Process-lifetime cache holder
//!
//! For top-level wiring only: build the cache once at startup, then pass the
//! `Arc<McpToolsCache>` to whatever needs it. Library code should take the
//! cache as a parameter rather than call [`get_cache`].

use std::sync::Arc;

use parking_lot::{const_rwlock, RwLock};
use tracing::{info, warn};

use crate::cache::McpToolsCache;
use crate::config::CacheConfig;
use crate::error::Result;

static GLOBAL_CACHE: RwLock<Option<Arc<McpToolsCache>>> = const_rwlock(None);

/// Build the global cache, replacing any previous one
pub fn init_cache(config: CacheConfig) -> Result<Arc<McpToolsCache>> {
    let cache = Arc::new(McpToolsCache::new(config)?);
    if GLOBAL_CACHE.write().replace(Arc::clone(&cache)).is_some() {
        warn!("Global cache was already initialized; replaced it");
    }
    Ok(cache)
}

/// The global cache, if initialized
pub fn get_cache() -> Option<Arc<McpToolsCache>> {
    GLOBAL_CACHE.read().clone()
}

/// Detach the global cache. Holders of earlier handles keep a working cache.
pub fn shutdown_cache() -> Option<Arc<McpToolsCache>> {
    let cache = GLOBAL_CACHE.write().take();
    if let Some(cache) = &cache {
        info!("Global cache shut down: {}", cache.metrics().summary());
    }
    cache
}
