//! Cache configuration

use std::path::{Path, PathBuf};

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::entry::DataClass;
use crate::error::{CacheError, Result};

/// Environment variable prefix read by [`CacheConfig::load`]
pub const ENV_PREFIX: &str = "ONEC_MCP_CACHE";

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Which eviction strategy the cache runs under capacity pressure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    /// Least recently used entries go first
    #[default]
    Lru,
    /// Expired entries first, then the ones closest to expiry
    Ttl,
}

/// Cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Memory budget for the in-memory tier
    pub max_size_mb: u64,
    /// Default TTL (seconds) for metadata, tool_config and stable entries
    pub default_ttl_stable: u64,
    /// Default TTL (seconds) for aggregates, api_response and dynamic entries
    pub default_ttl_dynamic: u64,
    /// Directory for the persistent tier; `None` disables persistence
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persistent_cache_dir: Option<PathBuf>,
    /// Eviction strategy
    pub strategy: StrategyKind,
    /// Fraction of the budget eviction brings usage back down to
    pub low_water_ratio: f64,
    /// Gzip persisted payloads
    pub compress_payloads: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size_mb: 100,
            default_ttl_stable: 1800,  // 30 minutes
            default_ttl_dynamic: 300, // 5 minutes
            persistent_cache_dir: None,
            strategy: StrategyKind::Lru,
            low_water_ratio: 0.9,
            compress_payloads: true,
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_size_mb(mut self, mb: u64) -> Self {
        self.max_size_mb = mb;
        self
    }

    pub fn default_ttl_stable(mut self, seconds: u64) -> Self {
        self.default_ttl_stable = seconds;
        self
    }

    pub fn default_ttl_dynamic(mut self, seconds: u64) -> Self {
        self.default_ttl_dynamic = seconds;
        self
    }

    /// Enable the persistent tier rooted at `dir`
    pub fn persistent_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.persistent_cache_dir = Some(dir.into());
        self
    }

    /// Run memory-only
    pub fn without_persistence(mut self) -> Self {
        self.persistent_cache_dir = None;
        self
    }

    pub fn strategy(mut self, strategy: StrategyKind) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn low_water_ratio(mut self, ratio: f64) -> Self {
        self.low_water_ratio = ratio;
        self
    }

    pub fn compress_payloads(mut self, enabled: bool) -> Self {
        self.compress_payloads = enabled;
        self
    }

    /// Memory budget in bytes
    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_mb.saturating_mul(BYTES_PER_MB)
    }

    /// Usage eviction aims for once the budget is exceeded
    pub fn low_water_bytes(&self) -> u64 {
        (self.max_size_bytes() as f64 * self.low_water_ratio) as u64
    }

    /// Default TTL for a data class
    pub fn default_ttl_for(&self, class: DataClass) -> u64 {
        if class.uses_stable_ttl() {
            self.default_ttl_stable
        } else {
            self.default_ttl_dynamic
        }
    }

    /// Reject configurations the cache cannot run correctly with
    pub fn validate(&self) -> Result<()> {
        if self.max_size_mb == 0 {
            return Err(CacheError::invalid_config(
                "max_size_mb must be greater than 0",
            ));
        }
        if self.default_ttl_stable == 0 {
            return Err(CacheError::invalid_config(
                "default_ttl_stable must be greater than 0",
            ));
        }
        if self.default_ttl_dynamic == 0 {
            return Err(CacheError::invalid_config(
                "default_ttl_dynamic must be greater than 0",
            ));
        }
        if !(self.low_water_ratio > 0.0 && self.low_water_ratio <= 1.0) {
            return Err(CacheError::invalid_config(format!(
                "low_water_ratio must be in (0, 1], got {}",
                self.low_water_ratio
            )));
        }
        if let Some(dir) = &self.persistent_cache_dir {
            if dir.as_os_str().is_empty() {
                return Err(CacheError::invalid_config(
                    "persistent_cache_dir must not be empty",
                ));
            }
        }
        Ok(())
    }

    /// Load configuration from an optional file, then `ONEC_MCP_CACHE_*`
    /// environment variables, and validate the result.
    ///
    /// Missing files are not an error; unset fields keep their defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path.to_path_buf()).required(false));
        }
        let config = builder
            .add_source(Environment::with_prefix(ENV_PREFIX))
            .build()?;

        let loaded: CacheConfig = config.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Write the configuration as TOML
    pub fn save(&self, path: &Path) -> Result<()> {
        let toml = toml::to_string(self).map_err(|e| CacheError::Serialization {
            message: e.to_string(),
        })?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml)?;
        Ok(())
    }
}
