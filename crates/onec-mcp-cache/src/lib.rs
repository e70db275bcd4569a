//! # 1C MCP Tools Cache
//!
//! Two-tier caching engine for the results of expensive calls an MCP proxy
//! makes to a 1C:Enterprise backend.
//!
//! ## Features
//!
//! - **Two tiers**: a recency-ordered memory tier with a byte budget, and an
//!   optional on-disk tier for metadata, tool configuration and other stable data
//! - **Data classes**: per-class default TTLs and persistence eligibility
//! - **Eviction strategies**: LRU or soonest-expiry, batched to a low-water mark
//! - **Invalidation**: by key, glob pattern, domain entity or everything
//! - **Metrics**: hit/miss/eviction/error counters with shareable snapshots
//! - **Memoization**: `cached` / `cached_async` wrappers with optional single-flight
//!
//! ```no_run
//! use onec_mcp_cache::{CacheConfig, DataClass, McpToolsCache};
//! use serde_json::json;
//!
//! # fn main() -> onec_mcp_cache::Result<()> {
//! let config = CacheConfig::new().persistent_cache_dir("/var/cache/onec-mcp");
//! let cache = McpToolsCache::new(config)?;
//! cache.set("catalog:users", json!({"type": "справочник"}), None, Some(DataClass::Metadata));
//! assert!(cache.get("catalog:users", None).is_some());
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod entry;
pub mod error;
pub mod global;
pub mod invalidation;
pub mod keys;
pub mod memoize;
pub mod metrics;
pub mod persistent;
pub mod store;
pub mod strategy;

pub use cache::{McpToolsCache, DEFAULT_TOOL_DATA_CLASS};
pub use config::{CacheConfig, StrategyKind};
pub use entry::{CacheEntry, DataClass};
pub use error::{CacheError, Result};
pub use global::{get_cache, init_cache, shutdown_cache};
pub use invalidation::InvalidationService;
pub use memoize::{cached, cached_async, CachedOptions};
pub use metrics::{CacheMetrics, CacheStats};
pub use persistent::{IndexRecord, PersistentStore};
pub use strategy::{EvictionCandidate, EvictionStrategy, LruStrategy, TtlStrategy};
