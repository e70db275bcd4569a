//! In-memory tier

use chrono::{DateTime, Utc};
use lru::LruCache;

use crate::entry::CacheEntry;
use crate::strategy::EvictionCandidate;

/// Recency-ordered map of live entries.
///
/// Not synchronized on its own; the orchestrator keeps it behind a single
/// lock so the recency order is never observed half-updated.
pub struct MemoryStore {
    entries: LruCache<String, CacheEntry>,
    total_bytes: u64,
    next_sequence: u64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entries: LruCache::unbounded(),
            total_bytes: 0,
            next_sequence: 0,
        }
    }

    /// Insert or overwrite an entry, making it the most recent one.
    ///
    /// Returns the entry it replaced, if any.
    pub fn insert(&mut self, mut entry: CacheEntry) -> Option<CacheEntry> {
        entry.sequence = self.next_sequence;
        self.next_sequence += 1;
        self.total_bytes += entry.size_bytes;

        let previous = self.entries.put(entry.key.clone(), entry);
        if let Some(old) = &previous {
            self.total_bytes = self.total_bytes.saturating_sub(old.size_bytes);
        }
        previous
    }

    /// Look up an entry and mark it most recently used
    pub fn get_mut(&mut self, key: &str) -> Option<&mut CacheEntry> {
        self.entries.get_mut(key)
    }

    /// Look up an entry without touching recency
    pub fn peek(&self, key: &str) -> Option<&CacheEntry> {
        self.entries.peek(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let removed = self.entries.pop(key);
        if let Some(entry) = &removed {
            self.total_bytes = self.total_bytes.saturating_sub(entry.size_bytes);
        }
        removed
    }

    /// Remove every entry, returning how many there were
    pub fn clear(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        self.total_bytes = 0;
        count
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Approximate bytes held
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Keys from least to most recently used
    pub fn keys(&self) -> Vec<String> {
        self.entries.iter().rev().map(|(key, _)| key.clone()).collect()
    }

    /// Eviction view of every entry except `exclude`, least recently used first
    pub fn candidates(&self, now: DateTime<Utc>, exclude: Option<&str>) -> Vec<EvictionCandidate> {
        self.entries
            .iter()
            .rev()
            .filter(|(key, _)| Some(key.as_str()) != exclude)
            .map(|(_, entry)| EvictionCandidate::from_entry(entry, now))
            .collect()
    }

    /// Remove and return every entry expired at `now`
    pub fn drain_expired(&mut self, now: DateTime<Utc>) -> Vec<CacheEntry> {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired_at(now))
            .map(|(key, _)| key.clone())
            .collect();

        expired
            .iter()
            .filter_map(|key| self.remove(key))
            .collect()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}
