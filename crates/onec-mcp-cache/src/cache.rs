//! Two-tier cache orchestrator

use std::collections::{BTreeSet, HashMap};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::entry::{CacheEntry, DataClass};
use crate::error::Result;
use crate::keys::{is_failure_result, tool_key, TOOL_KEY_PREFIX};
use crate::metrics::{CacheMetrics, CacheStats};
use crate::persistent::PersistentStore;
use crate::store::MemoryStore;
use crate::strategy::{self, EvictionStrategy};

/// Data class tool results are stored under unless overridden per tool
pub const DEFAULT_TOOL_DATA_CLASS: DataClass = DataClass::ApiResponse;

/// Cache for MCP tool results and other expensive backend calls.
///
/// The memory tier is a single recency-ordered map behind one lock. Entries
/// of persistent data classes are written through to an optional
/// [`PersistentStore`] and read back through it on a memory miss. Tier
/// failures never reach callers of `get`/`set`: they are logged, counted in
/// [`CacheMetrics`] and degrade to memory-only behaviour.
///
/// Share it with `Arc<McpToolsCache>`; every method takes `&self`.
pub struct McpToolsCache {
    config: CacheConfig,
    memory: Mutex<MemoryStore>,
    persistent: Option<PersistentStore>,
    strategy: Box<dyn EvictionStrategy>,
    metrics: CacheMetrics,
    tool_classes: RwLock<HashMap<String, DataClass>>,
}

impl McpToolsCache {
    /// Build a cache, opening the persistent tier if one is configured.
    ///
    /// Invalid configuration or an unusable persistent directory is fatal.
    pub fn new(config: CacheConfig) -> Result<Self> {
        config.validate()?;

        let persistent = match &config.persistent_cache_dir {
            Some(dir) => Some(PersistentStore::open(dir, config.compress_payloads)?),
            None => None,
        };
        let strategy = strategy::from_kind(config.strategy);

        info!(
            "Initialized MCP tools cache: max {} MB, {} eviction, persistence {}",
            config.max_size_mb,
            strategy.name(),
            if persistent.is_some() { "enabled" } else { "disabled" }
        );

        let cache = Self {
            config,
            memory: Mutex::new(MemoryStore::new()),
            persistent,
            strategy,
            metrics: CacheMetrics::new(),
            tool_classes: RwLock::new(HashMap::new()),
        };
        cache.refresh_persistent_gauge();
        Ok(cache)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Shared handle to the metrics; clones observe the same counters
    pub fn metrics(&self) -> CacheMetrics {
        self.metrics.clone()
    }

    /// Current statistics snapshot
    pub fn stats(&self) -> CacheStats {
        {
            let memory = self.memory.lock();
            self.metrics
                .set_memory_usage(memory.len(), memory.total_bytes());
        }
        self.refresh_persistent_gauge();
        self.metrics.snapshot()
    }

    /// Number of entries in the memory tier
    pub fn size(&self) -> usize {
        self.memory.lock().len()
    }

    /// Approximate bytes held by the memory tier
    pub fn memory_usage_bytes(&self) -> u64 {
        self.memory.lock().total_bytes()
    }

    /// Whether a persistent tier is attached
    pub fn is_persistent(&self) -> bool {
        self.persistent.is_some()
    }

    /// Name of the active eviction strategy
    pub fn strategy_name(&self) -> &str {
        self.strategy.name()
    }

    /// Store a value.
    ///
    /// TTL resolution: explicit `ttl` (seconds), else the default of
    /// `data_class`; with no class given the entry is `dynamic`. Returns
    /// `false` without storing anything when the value is a failure result,
    /// the TTL is zero or the entry alone exceeds the memory budget.
    pub fn set(
        &self,
        key: &str,
        value: Value,
        ttl: Option<u64>,
        data_class: Option<DataClass>,
    ) -> bool {
        let Some(entry) = self.prepare(key, value, ttl, data_class) else {
            return false;
        };

        if let Some(store) = &self.persistent {
            let outcome = if entry.persistent {
                store.write(&entry).map(|_| true)
            } else {
                store.remove(key).map(|_| false)
            };
            self.settle_write(key, outcome);
        }

        let stale = self.admit(entry);
        self.purge_persistent(&stale);
        true
    }

    /// Async twin of [`McpToolsCache::set`]; suspends only on disk I/O
    pub async fn set_async(
        &self,
        key: &str,
        value: Value,
        ttl: Option<u64>,
        data_class: Option<DataClass>,
    ) -> bool {
        let Some(entry) = self.prepare(key, value, ttl, data_class) else {
            return false;
        };

        if let Some(store) = &self.persistent {
            let outcome = if entry.persistent {
                store.write_async(&entry).await.map(|_| true)
            } else {
                store.remove_async(key).await.map(|_| false)
            };
            self.settle_write(key, outcome);
        }

        let stale = self.admit(entry);
        self.purge_persistent_async(&stale).await;
        true
    }

    /// Look up a value, reading through the persistent tier on a memory miss.
    ///
    /// `data_class`, when given, limits read-through to persistent classes.
    pub fn get(&self, key: &str, data_class: Option<DataClass>) -> Option<Value> {
        let found = self.get_untracked(key, data_class);
        self.record_lookup(key, found.is_some());
        found
    }

    /// Async twin of [`McpToolsCache::get`]
    pub async fn get_async(&self, key: &str, data_class: Option<DataClass>) -> Option<Value> {
        let found = self.get_untracked_async(key, data_class).await;
        self.record_lookup(key, found.is_some());
        found
    }

    /// Lookup that leaves hit/miss counters alone
    pub(crate) fn get_untracked(&self, key: &str, data_class: Option<DataClass>) -> Option<Value> {
        if let Some(value) = self.get_memory(key) {
            return Some(value);
        }
        let store = self.read_through_store(data_class)?;
        let entry = self.settle_load(key, store.load(key))?;
        let (value, stale) = self.promote(entry);
        self.purge_persistent(&stale);
        Some(value)
    }

    pub(crate) async fn get_untracked_async(
        &self,
        key: &str,
        data_class: Option<DataClass>,
    ) -> Option<Value> {
        if let Some(value) = self.get_memory(key) {
            return Some(value);
        }
        let store = self.read_through_store(data_class)?;
        let entry = self.settle_load(key, store.load_async(key).await)?;
        let (value, stale) = self.promote(entry);
        self.purge_persistent_async(&stale).await;
        Some(value)
    }

    /// Typed lookup; a payload that does not deserialize into `T` is a miss
    pub fn get_as<T: DeserializeOwned>(
        &self,
        key: &str,
        data_class: Option<DataClass>,
    ) -> Option<T> {
        let value = self.get(key, data_class)?;
        self.decode(key, value)
    }

    /// Async twin of [`McpToolsCache::get_as`]
    pub async fn get_as_async<T: DeserializeOwned>(
        &self,
        key: &str,
        data_class: Option<DataClass>,
    ) -> Option<T> {
        let value = self.get_async(key, data_class).await?;
        self.decode(key, value)
    }

    /// Typed store; values that cannot be serialized are rejected
    pub fn set_serialized<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<u64>,
        data_class: Option<DataClass>,
    ) -> bool {
        match self.encode(key, value) {
            Some(value) => self.set(key, value, ttl, data_class),
            None => false,
        }
    }

    /// Async twin of [`McpToolsCache::set_serialized`]
    pub async fn set_serialized_async<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<u64>,
        data_class: Option<DataClass>,
    ) -> bool {
        match self.encode(key, value) {
            Some(value) => self.set_async(key, value, ttl, data_class).await,
            None => false,
        }
    }

    pub(crate) fn decode<T: DeserializeOwned>(&self, key: &str, value: Value) -> Option<T> {
        match serde_json::from_value(value) {
            Ok(typed) => Some(typed),
            Err(e) => {
                warn!("Cached value for {} has an unexpected shape: {}", key, e);
                self.metrics.record_error();
                None
            }
        }
    }

    fn encode<T: Serialize>(&self, key: &str, value: &T) -> Option<Value> {
        match serde_json::to_value(value) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Failed to serialize value for {}: {}", key, e);
                self.metrics.record_error();
                None
            }
        }
    }

    /// Whether a live entry exists in either tier.
    ///
    /// Recency is not updated and no payload is read.
    pub fn has(&self, key: &str) -> bool {
        let now = Utc::now();
        let in_memory = self
            .memory
            .lock()
            .peek(key)
            .is_some_and(|entry| !entry.is_expired_at(now));

        in_memory
            || self
                .persistent
                .as_ref()
                .is_some_and(|store| store.contains_live(key, now))
    }

    /// Async twin of [`McpToolsCache::has`]; answered from memory and the
    /// in-memory index, so it never suspends
    pub async fn has_async(&self, key: &str) -> bool {
        self.has(key)
    }

    /// Remove a key from both tiers. Returns whether either tier held it.
    pub fn delete(&self, key: &str) -> bool {
        let in_memory = self.remove_memory(key);
        let on_disk = match &self.persistent {
            Some(store) => self.settle_remove(key, store.remove(key)),
            None => false,
        };
        in_memory || on_disk
    }

    /// Async twin of [`McpToolsCache::delete`]
    pub async fn delete_async(&self, key: &str) -> bool {
        let in_memory = self.remove_memory(key);
        let on_disk = match &self.persistent {
            Some(store) => self.settle_remove(key, store.remove_async(key).await),
            None => false,
        };
        in_memory || on_disk
    }

    /// Drop a key from the memory tier only, keeping any persistent copy
    pub fn demote(&self, key: &str) -> bool {
        let demoted = self.remove_memory(key);
        if demoted {
            debug!("Demoted cache entry to persistent tier: {}", key);
        }
        demoted
    }

    /// Empty both tiers. Metrics are kept.
    pub fn clear(&self) {
        self.clear_counting();
    }

    /// Async twin of [`McpToolsCache::clear`]
    pub async fn clear_async(&self) {
        let keys = self.all_keys();
        self.clear_memory();
        if let Some(store) = &self.persistent {
            if let Err(e) = store.clear_async().await {
                warn!("Failed to clear persistent cache: {}", e);
                self.metrics.record_error();
            }
            self.refresh_persistent_gauge();
        }
        info!("Cleared cache ({} keys)", keys.len());
    }

    /// Empty both tiers, returning how many distinct keys were held
    pub(crate) fn clear_counting(&self) -> usize {
        let keys = self.all_keys();
        self.clear_memory();
        if let Some(store) = &self.persistent {
            if let Err(e) = store.clear() {
                warn!("Failed to clear persistent cache: {}", e);
                self.metrics.record_error();
            }
            self.refresh_persistent_gauge();
        }
        info!("Cleared cache ({} keys)", keys.len());
        keys.len()
    }

    /// Remove every expired entry from both tiers.
    ///
    /// Meant for a periodic sweep scheduled by the host. Returns the number
    /// of distinct keys removed.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut purged = self.purge_expired_memory(now);
        if let Some(store) = &self.persistent {
            match store.purge_expired(now) {
                Ok(keys) => purged.extend(keys),
                Err(e) => {
                    warn!("Failed to purge expired persistent entries: {}", e);
                    self.metrics.record_error();
                }
            }
            self.refresh_persistent_gauge();
        }
        info!("Purged {} expired cache entries", purged.len());
        purged.len()
    }

    /// Async twin of [`McpToolsCache::purge_expired`]
    pub async fn purge_expired_async(&self) -> usize {
        let now = Utc::now();
        let mut purged = self.purge_expired_memory(now);
        if let Some(store) = &self.persistent {
            match store.purge_expired_async(now).await {
                Ok(keys) => purged.extend(keys),
                Err(e) => {
                    warn!("Failed to purge expired persistent entries: {}", e);
                    self.metrics.record_error();
                }
            }
            self.refresh_persistent_gauge();
        }
        info!("Purged {} expired cache entries", purged.len());
        purged.len()
    }

    /// Every key held by either tier, sorted
    pub fn keys(&self) -> Vec<String> {
        self.all_keys().into_iter().collect()
    }

    /// Remove every key matching `predicate` from both tiers.
    ///
    /// The persistent index is rewritten once for the whole batch.
    pub(crate) fn remove_matching<F>(&self, predicate: F) -> usize
    where
        F: Fn(&str) -> bool,
    {
        let matched: Vec<String> = self
            .all_keys()
            .into_iter()
            .filter(|key| predicate(key))
            .collect();
        if matched.is_empty() {
            return 0;
        }

        let mut removed: BTreeSet<String> = {
            let mut memory = self.memory.lock();
            let removed = matched
                .iter()
                .filter(|key| memory.remove(key).is_some())
                .cloned()
                .collect();
            self.metrics
                .set_memory_usage(memory.len(), memory.total_bytes());
            removed
        };

        if let Some(store) = &self.persistent {
            match store.remove_many(&matched) {
                Ok(keys) => removed.extend(keys),
                Err(e) => {
                    warn!("Persistent cache index not rewritten after bulk removal: {}", e);
                    self.metrics.record_error();
                    // Unindexed regardless; none of them can be read back
                    removed.extend(matched);
                }
            }
            self.refresh_persistent_gauge();
        }
        removed.len()
    }

    // Tool dispatch helpers

    /// Override the data class results of `tool_name` are cached under
    pub fn set_tool_data_class(&self, tool_name: &str, data_class: DataClass) {
        self.tool_classes
            .write()
            .insert(tool_name.to_string(), data_class);
    }

    /// Data class results of `tool_name` are cached under
    pub fn tool_data_class(&self, tool_name: &str) -> DataClass {
        self.tool_classes
            .read()
            .get(tool_name)
            .copied()
            .unwrap_or(DEFAULT_TOOL_DATA_CLASS)
    }

    /// Cache the result of a tool call. Failed results are never stored.
    pub fn cache_tool_result(&self, tool_name: &str, arguments: &Value, result: Value) -> bool {
        let key = tool_key(tool_name, arguments);
        self.set(&key, result, None, Some(self.tool_data_class(tool_name)))
    }

    /// Cached result of an earlier identical tool call
    pub fn get_cached_tool_result(&self, tool_name: &str, arguments: &Value) -> Option<Value> {
        let key = tool_key(tool_name, arguments);
        self.get(&key, Some(self.tool_data_class(tool_name)))
    }

    /// Async twin of [`McpToolsCache::cache_tool_result`]
    pub async fn cache_tool_result_async(
        &self,
        tool_name: &str,
        arguments: &Value,
        result: Value,
    ) -> bool {
        let key = tool_key(tool_name, arguments);
        let data_class = self.tool_data_class(tool_name);
        self.set_async(&key, result, None, Some(data_class)).await
    }

    /// Async twin of [`McpToolsCache::get_cached_tool_result`]
    pub async fn get_cached_tool_result_async(
        &self,
        tool_name: &str,
        arguments: &Value,
    ) -> Option<Value> {
        let key = tool_key(tool_name, arguments);
        let data_class = self.tool_data_class(tool_name);
        self.get_async(&key, Some(data_class)).await
    }

    /// Drop every cached result of `tool_name`
    pub fn invalidate_tool(&self, tool_name: &str) -> usize {
        let prefix = format!("{}:{}:", TOOL_KEY_PREFIX, tool_name);
        let removed = self.remove_matching(|key| key.starts_with(&prefix));
        info!("Invalidated {} cached results of tool {}", removed, tool_name);
        removed
    }

    // Internals

    /// Build the entry `set` would store, or `None` if it must be rejected
    fn prepare(
        &self,
        key: &str,
        value: Value,
        ttl: Option<u64>,
        data_class: Option<DataClass>,
    ) -> Option<CacheEntry> {
        if is_failure_result(&value) {
            debug!("Refusing to cache failure result: {}", key);
            return None;
        }

        let data_class = data_class.unwrap_or(DataClass::Dynamic);
        let ttl = ttl.unwrap_or_else(|| self.config.default_ttl_for(data_class));
        if ttl == 0 {
            warn!("Refusing to cache {} with a zero TTL", key);
            return None;
        }

        let mut entry = CacheEntry::new(key, value, data_class, ttl);
        match estimate_size(key, &entry.value) {
            Ok(size) => entry.size_bytes = size,
            Err(e) => {
                warn!("Cannot estimate size of {}, storing without accounting: {}", key, e);
                self.metrics.record_error();
            }
        }

        if entry.size_bytes > self.config.max_size_bytes() {
            warn!(
                "Refusing to cache {}: {} bytes exceeds the {} byte budget",
                key,
                entry.size_bytes,
                self.config.max_size_bytes()
            );
            return None;
        }
        Some(entry)
    }

    /// Insert into memory and enforce the budget.
    ///
    /// Returns keys of expired evictees whose persistent copy must go too.
    fn admit(&self, entry: CacheEntry) -> Vec<String> {
        let key = entry.key.clone();
        let now = Utc::now();
        let mut memory = self.memory.lock();
        memory.insert(entry);

        let mut stale = Vec::new();
        let budget = self.config.max_size_bytes();
        if memory.total_bytes() > budget {
            let bytes_to_free = memory.total_bytes() - self.config.low_water_bytes();
            let candidates = memory.candidates(now, Some(&key));
            let victims = self.strategy.select_victims(&candidates, bytes_to_free);

            let mut evicted = 0;
            for victim in &victims {
                if let Some(entry) = memory.remove(victim) {
                    evicted += 1;
                    if entry.persistent && entry.is_expired_at(now) {
                        stale.push(entry.key);
                    }
                }
            }
            self.metrics.record_evictions(evicted);
            debug!(
                "Evicted {} entries ({} strategy), memory now {} of {} bytes",
                evicted,
                self.strategy.name(),
                memory.total_bytes(),
                budget
            );
        }

        self.metrics
            .set_memory_usage(memory.len(), memory.total_bytes());
        stale
    }

    /// Re-populate memory from a persistent read.
    ///
    /// Returns the value and, as `admit` does, the keys whose persistent
    /// copy must be purged.
    fn promote(&self, mut entry: CacheEntry) -> (Value, Vec<String>) {
        match estimate_size(&entry.key, &entry.value) {
            Ok(size) => entry.size_bytes = size,
            Err(e) => {
                warn!("Cannot estimate size of {}: {}", entry.key, e);
                self.metrics.record_error();
            }
        }
        entry.touch();
        debug!("Promoted persistent entry to memory: {}", entry.key);

        let value = entry.value.clone();
        (value, self.admit(entry))
    }

    fn get_memory(&self, key: &str) -> Option<Value> {
        let now = Utc::now();
        let mut memory = self.memory.lock();
        match memory.get_mut(key) {
            Some(entry) if !entry.is_expired_at(now) => {
                entry.touch();
                return Some(entry.value.clone());
            }
            Some(_) => {}
            None => return None,
        }

        memory.remove(key);
        self.metrics
            .set_memory_usage(memory.len(), memory.total_bytes());
        debug!("Cache entry expired: {}", key);
        None
    }

    fn read_through_store(&self, data_class: Option<DataClass>) -> Option<&PersistentStore> {
        if data_class.is_some_and(|class| !class.is_persistent()) {
            return None;
        }
        self.persistent.as_ref()
    }

    fn record_lookup(&self, key: &str, hit: bool) {
        if hit {
            self.metrics.record_hit();
            debug!("Cache hit: {}", key);
        } else {
            self.metrics.record_miss();
            debug!("Cache miss: {}", key);
        }
    }

    fn remove_memory(&self, key: &str) -> bool {
        let mut memory = self.memory.lock();
        let removed = memory.remove(key).is_some();
        self.metrics
            .set_memory_usage(memory.len(), memory.total_bytes());
        removed
    }

    fn clear_memory(&self) {
        let mut memory = self.memory.lock();
        memory.clear();
        self.metrics.set_memory_usage(0, 0);
    }

    fn purge_expired_memory(&self, now: chrono::DateTime<Utc>) -> BTreeSet<String> {
        let mut memory = self.memory.lock();
        let drained = memory.drain_expired(now);
        self.metrics
            .set_memory_usage(memory.len(), memory.total_bytes());
        drained.into_iter().map(|entry| entry.key).collect()
    }

    fn all_keys(&self) -> BTreeSet<String> {
        let mut keys: BTreeSet<String> = self.memory.lock().keys().into_iter().collect();
        if let Some(store) = &self.persistent {
            keys.extend(store.keys());
        }
        keys
    }

    fn settle_load(&self, key: &str, loaded: Result<Option<CacheEntry>>) -> Option<CacheEntry> {
        let outcome = match loaded {
            Ok(Some(entry)) => {
                self.metrics.record_persistent_read();
                Some(entry)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Persistent cache read failed for {}: {}", key, e);
                self.metrics.record_error();
                None
            }
        };
        self.refresh_persistent_gauge();
        outcome
    }

    fn settle_write(&self, key: &str, outcome: Result<bool>) {
        match outcome {
            Ok(true) => self.metrics.record_persistent_write(),
            Ok(false) => {}
            Err(e) => {
                warn!("Persistent cache write failed for {}: {}", key, e);
                self.metrics.record_error();
            }
        }
        self.refresh_persistent_gauge();
    }

    fn settle_remove(&self, key: &str, outcome: Result<bool>) -> bool {
        let removed = match outcome {
            Ok(removed) => removed,
            // The record is unindexed even though the index file was not rewritten
            Err(e) => {
                warn!("Persistent cache delete failed for {}: {}", key, e);
                self.metrics.record_error();
                true
            }
        };
        self.refresh_persistent_gauge();
        removed
    }

    fn purge_persistent(&self, keys: &[String]) {
        if keys.is_empty() {
            return;
        }
        if let Some(store) = &self.persistent {
            let outcome = store.remove_many(keys);
            self.settle_purge(keys, outcome);
        }
    }

    async fn purge_persistent_async(&self, keys: &[String]) {
        if keys.is_empty() {
            return;
        }
        if let Some(store) = &self.persistent {
            let outcome = store.remove_many_async(keys).await;
            self.settle_purge(keys, outcome);
        }
    }

    fn settle_purge(&self, keys: &[String], outcome: Result<Vec<String>>) {
        match outcome {
            Ok(purged) => debug!("Purged {} expired persistent evictees", purged.len()),
            Err(e) => {
                warn!("Failed to purge {} expired persistent evictees: {}", keys.len(), e);
                self.metrics.record_error();
            }
        }
        self.refresh_persistent_gauge();
    }

    fn refresh_persistent_gauge(&self) {
        let count = self.persistent.as_ref().map_or(0, PersistentStore::len);
        self.metrics.set_persistent_entries(count);
    }

    #[cfg(test)]
    pub(crate) fn backdate(&self, key: &str, seconds: i64) {
        if let Some(entry) = self.memory.lock().get_mut(key) {
            entry.created_at -= chrono::Duration::seconds(seconds);
        }
    }
}

/// Approximate footprint of an entry: serialized payload plus key
fn estimate_size(key: &str, value: &Value) -> Result<u64> {
    let payload = serde_json::to_vec(value)?;
    Ok((payload.len() + key.len()) as u64)
}
