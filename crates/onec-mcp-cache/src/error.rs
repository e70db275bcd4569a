//! Cache-related error types

use thiserror::Error;

/// Cache operation errors
///
/// Only construction and pattern parsing surface these to callers. Tier
/// failures during `get`/`set` are logged, counted and turned into misses.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Invalid cache configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Serialization error: {message}")]
    Serialization { message: String },

    #[error("Compression error: {message}")]
    Compression { message: String },

    #[error("Corrupt persistent entry for key '{key}': {reason}")]
    CorruptEntry { key: String, reason: String },

    #[error("Background task error: {message}")]
    Background { message: String },

    #[error("Invalid invalidation pattern: {0}")]
    InvalidPattern(#[from] glob::PatternError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration source error: {0}")]
    Config(#[from] config::ConfigError),
}

impl CacheError {
    pub(crate) fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    pub(crate) fn corrupt(key: &str, reason: impl Into<String>) -> Self {
        Self::CorruptEntry {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

/// Re-export commonly used Result type
pub type Result<T> = std::result::Result<T, CacheError>;
