//! Cache performance monitoring and metrics

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::SystemTime,
};

use serde::{Deserialize, Serialize};

/// Point-in-time view of the cache, safe to hand to a monitoring layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Total number of cache hits
    pub hits: u64,
    /// Total number of cache misses
    pub misses: u64,
    /// Entries removed to satisfy the memory budget
    pub evictions: u64,
    /// Non-fatal failures (size estimation, persistent I/O, corrupt entries)
    pub errors: u64,
    /// `hits / (hits + misses)`, zero before the first lookup
    pub hit_ratio: f64,
    /// Entries in the memory tier
    pub entry_count: usize,
    /// Approximate bytes held by the memory tier
    pub memory_bytes: u64,
    /// Entries in the persistent tier index
    pub persistent_entries: usize,
    /// Payload files read from the persistent tier
    pub persistent_reads: u64,
    /// Payload files written to the persistent tier
    pub persistent_writes: u64,
    /// When the metrics were created (or last reset)
    pub created_at: SystemTime,
}

impl CacheStats {
    /// Total lookups observed
    pub fn lookups(&self) -> u64 {
        self.hits + self.misses
    }

    /// Miss ratio in `[0.0, 1.0]`
    pub fn miss_ratio(&self) -> f64 {
        if self.lookups() == 0 {
            0.0
        } else {
            1.0 - self.hit_ratio
        }
    }
}

/// Thread-safe cache metrics tracker.
///
/// Cloning shares the underlying counters, so a monitoring layer can hold a
/// clone and read it without touching the cache.
#[derive(Debug, Clone)]
pub struct CacheMetrics {
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
    evictions: Arc<AtomicU64>,
    errors: Arc<AtomicU64>,
    persistent_reads: Arc<AtomicU64>,
    persistent_writes: Arc<AtomicU64>,
    entry_count: Arc<AtomicU64>,
    memory_bytes: Arc<AtomicU64>,
    persistent_entries: Arc<AtomicU64>,
    created_at: Arc<parking_lot::Mutex<SystemTime>>,
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self {
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
            evictions: Arc::new(AtomicU64::new(0)),
            errors: Arc::new(AtomicU64::new(0)),
            persistent_reads: Arc::new(AtomicU64::new(0)),
            persistent_writes: Arc::new(AtomicU64::new(0)),
            entry_count: Arc::new(AtomicU64::new(0)),
            memory_bytes: Arc::new(AtomicU64::new(0)),
            persistent_entries: Arc::new(AtomicU64::new(0)),
            created_at: Arc::new(parking_lot::Mutex::new(SystemTime::now())),
        }
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evictions(&self, count: u64) {
        self.evictions.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_persistent_read(&self) {
        self.persistent_reads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_persistent_write(&self) {
        self.persistent_writes.fetch_add(1, Ordering::Relaxed);
    }

    /// Update the memory tier gauges
    pub fn set_memory_usage(&self, entry_count: usize, memory_bytes: u64) {
        self.entry_count.store(entry_count as u64, Ordering::Relaxed);
        self.memory_bytes.store(memory_bytes, Ordering::Relaxed);
    }

    /// Update the persistent tier gauge
    pub fn set_persistent_entries(&self, count: usize) {
        self.persistent_entries.store(count as u64, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn persistent_reads(&self) -> u64 {
        self.persistent_reads.load(Ordering::Relaxed)
    }

    /// `hits / (hits + misses)`, or zero when nothing was looked up yet
    pub fn hit_ratio(&self) -> f64 {
        hit_ratio(self.hits(), self.misses())
    }

    /// Get current statistics snapshot
    pub fn snapshot(&self) -> CacheStats {
        let hits = self.hits();
        let misses = self.misses();

        CacheStats {
            hits,
            misses,
            evictions: self.evictions(),
            errors: self.errors(),
            hit_ratio: hit_ratio(hits, misses),
            entry_count: self.entry_count.load(Ordering::Relaxed) as usize,
            memory_bytes: self.memory_bytes.load(Ordering::Relaxed),
            persistent_entries: self.persistent_entries.load(Ordering::Relaxed) as usize,
            persistent_reads: self.persistent_reads(),
            persistent_writes: self.persistent_writes.load(Ordering::Relaxed),
            created_at: *self.created_at.lock(),
        }
    }

    /// Zero every counter. Gauges are left alone; they describe live state.
    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
        self.persistent_reads.store(0, Ordering::Relaxed);
        self.persistent_writes.store(0, Ordering::Relaxed);
        *self.created_at.lock() = SystemTime::now();
    }

    /// Get a formatted summary of cache metrics
    pub fn summary(&self) -> String {
        let stats = self.snapshot();
        format!(
            "Cache Metrics:\n  Hits: {}\n  Misses: {}\n  Hit Ratio: {:.2}%\n  Evictions: {}\n  \
             Errors: {}\n  Entries: {}\n  Memory: {} bytes\n  Persistent Entries: {}",
            stats.hits,
            stats.misses,
            stats.hit_ratio * 100.0,
            stats.evictions,
            stats.errors,
            stats.entry_count,
            stats.memory_bytes,
            stats.persistent_entries
        )
    }
}

impl Default for CacheMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn hit_ratio(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}
