//! Eviction strategies
//!
//! A strategy only decides *which* keys to drop. It never holds entry data:
//! the memory store hands it a snapshot of [`EvictionCandidate`]s ordered
//! least recently used first, and the orchestrator removes what it picks.

use chrono::{DateTime, Utc};

use crate::config::StrategyKind;
use crate::entry::CacheEntry;

/// What a strategy gets to see about one entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionCandidate {
    pub key: String,
    pub size_bytes: u64,
    /// Insertion sequence; lower was written earlier
    pub sequence: u64,
    pub expired: bool,
    pub remaining_ttl_ms: u64,
}

impl EvictionCandidate {
    pub fn from_entry(entry: &CacheEntry, now: DateTime<Utc>) -> Self {
        Self {
            key: entry.key.clone(),
            size_bytes: entry.size_bytes,
            sequence: entry.sequence,
            expired: entry.is_expired_at(now),
            remaining_ttl_ms: entry.remaining_ttl_millis(now),
        }
    }
}

/// Picks eviction victims
pub trait EvictionStrategy: Send + Sync {
    /// Choose keys to evict so that at least `bytes_to_free` bytes are
    /// released. `candidates` is ordered least recently used first.
    fn select_victims(&self, candidates: &[EvictionCandidate], bytes_to_free: u64) -> Vec<String>;

    /// Get strategy name for debugging
    fn name(&self) -> &str;
}

/// Build the strategy named in the configuration
pub fn from_kind(kind: StrategyKind) -> Box<dyn EvictionStrategy> {
    match kind {
        StrategyKind::Lru => Box::new(LruStrategy),
        StrategyKind::Ttl => Box::new(TtlStrategy),
    }
}

/// Least Recently Used (LRU) eviction strategy.
///
/// Ignores TTL entirely; an unused entry far from expiry still goes first.
#[derive(Debug, Clone, Copy, Default)]
pub struct LruStrategy;

impl EvictionStrategy for LruStrategy {
    fn select_victims(&self, candidates: &[EvictionCandidate], bytes_to_free: u64) -> Vec<String> {
        take_until_freed(candidates.iter(), bytes_to_free, Vec::new(), 0)
    }

    fn name(&self) -> &str {
        "lru"
    }
}

/// Time-to-live (TTL) based eviction strategy.
///
/// Every expired entry is selected, whatever the pressure. Live entries
/// follow by soonest expiry, ties broken by insertion order.
#[derive(Debug, Clone, Copy, Default)]
pub struct TtlStrategy;

impl EvictionStrategy for TtlStrategy {
    fn select_victims(&self, candidates: &[EvictionCandidate], bytes_to_free: u64) -> Vec<String> {
        let (expired, mut live): (Vec<_>, Vec<_>) =
            candidates.iter().partition(|candidate| candidate.expired);

        let freed: u64 = expired.iter().map(|c| c.size_bytes).sum();
        let victims: Vec<String> = expired.iter().map(|c| c.key.clone()).collect();

        live.sort_by_key(|c| (c.remaining_ttl_ms, c.sequence));
        take_until_freed(live.into_iter(), bytes_to_free, victims, freed)
    }

    fn name(&self) -> &str {
        "ttl"
    }
}

fn take_until_freed<'a>(
    candidates: impl Iterator<Item = &'a EvictionCandidate>,
    bytes_to_free: u64,
    mut victims: Vec<String>,
    mut freed: u64,
) -> Vec<String> {
    for candidate in candidates {
        if freed >= bytes_to_free {
            break;
        }
        freed += candidate.size_bytes;
        victims.push(candidate.key.clone());
    }
    victims
}
