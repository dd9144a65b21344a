//! Error types for cachet operations

use thiserror::Error;

use crate::key::ItemKey;

/// Failures reported by a cache's remote operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("Remote unavailable during {operation}: {reason}")]
    Unavailable { operation: String, reason: String },

    #[error("Item not found: {key}")]
    NotFound { key: ItemKey },

    #[error("Remote rejected {operation}: {reason}")]
    Rejected { operation: String, reason: String },

    #[error("Remote {operation} timed out after {elapsed_ms}ms")]
    Timeout { operation: String, elapsed_ms: u64 },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to parse configuration: {reason}")]
    Parse { reason: String },
}

/// Master error type for all cachet errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl CacheError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CacheError::Remote(RemoteError::Unavailable { .. })
                | CacheError::Remote(RemoteError::Timeout { .. })
        )
    }
}

/// Result type alias for cachet operations.
pub type CacheResult<T> = Result<T, CacheError>;

// =============================================================================
// TESTS
// =============================================================================
