//! Cache entries and data classes

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CacheError;

/// Category of cached data. Selects the default TTL and whether the entry
/// may be written through to the persistent tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataClass {
    /// Configuration metadata (catalogs, documents, registers)
    Metadata,
    /// Aggregated query results
    Aggregates,
    /// Tool definitions and settings
    ToolConfig,
    /// Raw backend API responses
    ApiResponse,
    /// Anything that rarely changes
    Stable,
    /// Anything that changes often
    Dynamic,
}

impl DataClass {
    /// All data classes, in declaration order
    pub const ALL: [DataClass; 6] = [
        DataClass::Metadata,
        DataClass::Aggregates,
        DataClass::ToolConfig,
        DataClass::ApiResponse,
        DataClass::Stable,
        DataClass::Dynamic,
    ];

    /// Whether entries of this class are eligible for the on-disk tier
    pub fn is_persistent(self) -> bool {
        matches!(
            self,
            DataClass::Metadata | DataClass::ToolConfig | DataClass::Stable
        )
    }

    /// Whether this class inherits the stable (long) default TTL.
    ///
    /// Persistence eligibility and the long TTL coincide for every class.
    pub fn uses_stable_ttl(self) -> bool {
        self.is_persistent()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DataClass::Metadata => "metadata",
            DataClass::Aggregates => "aggregates",
            DataClass::ToolConfig => "tool_config",
            DataClass::ApiResponse => "api_response",
            DataClass::Stable => "stable",
            DataClass::Dynamic => "dynamic",
        }
    }
}

impl fmt::Display for DataClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataClass {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DataClass::ALL
            .into_iter()
            .find(|class| class.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| CacheError::invalid_config(format!("unknown data class '{}'", s)))
    }
}

/// A single cached value with its bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Canonical cache key
    pub key: String,
    /// The cached payload
    pub value: Value,
    /// Data class the entry was stored under
    pub data_class: DataClass,
    /// When the entry was created (or last overwritten)
    pub created_at: DateTime<Utc>,
    /// When the entry was last read
    pub last_accessed_at: DateTime<Utc>,
    /// Lifetime in seconds, counted from `created_at`
    pub ttl_seconds: u64,
    /// Number of hits served from this entry
    pub access_count: u64,
    /// Whether the entry is eligible for the persistent tier
    pub persistent: bool,
    /// Estimated in-memory footprint; zero when estimation failed
    pub size_bytes: u64,
    /// Insertion sequence, assigned by the memory store
    #[serde(skip)]
    pub(crate) sequence: u64,
}

impl CacheEntry {
    /// Create a new entry stamped with the current time
    pub fn new(
        key: impl Into<String>,
        value: Value,
        data_class: DataClass,
        ttl_seconds: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            key: key.into(),
            value,
            data_class,
            created_at: now,
            last_accessed_at: now,
            ttl_seconds,
            access_count: 0,
            persistent: data_class.is_persistent(),
            size_bytes: 0,
            sequence: 0,
        }
    }

    /// Check if the entry has expired
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Expiry check against an explicit clock reading.
    ///
    /// `(now - created_at) > ttl_seconds`, at millisecond resolution.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        let elapsed = elapsed_millis(self.created_at, now);
        elapsed > self.ttl_seconds.saturating_mul(1000)
    }

    /// Milliseconds left before expiry, zero once expired
    pub fn remaining_ttl_millis(&self, now: DateTime<Utc>) -> u64 {
        self.ttl_seconds
            .saturating_mul(1000)
            .saturating_sub(elapsed_millis(self.created_at, now))
    }

    /// Record a hit
    pub fn touch(&mut self) {
        self.last_accessed_at = Utc::now();
        self.access_count += 1;
    }
}

/// Non-negative milliseconds between two instants.
pub(crate) fn elapsed_millis(from: DateTime<Utc>, to: DateTime<Utc>) -> u64 {
    to.signed_duration_since(from).num_milliseconds().max(0) as u64
}
