//! Observer configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{CacheResult, ConfigError};
use crate::logging::Logger;

/// Configuration shared by item and query observers.
///
/// Every field has a default, so an empty TOML table is a valid config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Coalesce event bursts; delivered after this many idle milliseconds.
    pub debounce_ms: Option<u64>,
    /// Refetch remotely on `query_invalidated` instead of re-filtering locally.
    pub refetch_on_query_invalidated: bool,
    /// Refetch remotely on `location_invalidated` covering the observer's locations.
    pub refetch_on_location_invalidated: bool,
    #[serde(skip)]
    pub logger: Logger,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce_ms: None,
            refetch_on_query_invalidated: true,
            refetch_on_location_invalidated: true,
            logger: Logger::none(),
        }
    }
}

impl SyncConfig {
    /// Create a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a TOML fragment and validate it.
    ///
    /// ```ignore
    /// let config = SyncConfig::from_toml_str("debounce_ms = 50")?;
    /// ```
    pub fn from_toml_str(source: &str) -> CacheResult<Self> {
        let config: SyncConfig = toml::from_str(source).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> CacheResult<()> {
        if self.debounce_ms == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: "debounce_ms".to_string(),
                value: "0".to_string(),
                reason: "omit the field to disable debouncing".to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// Debounce window, `None` when disabled. A zero window disables it.
    pub fn debounce(&self) -> Option<Duration> {
        self.debounce_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    /// Set the debounce window, rounded up to whole milliseconds.
    ///
    /// A zero duration disables debouncing.
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce_ms = if debounce.is_zero() {
            None
        } else {
            let millis = debounce.as_millis().max(1);
            Some(u64::try_from(millis).unwrap_or(u64::MAX))
        };
        self
    }

    pub fn with_refetch_on_query_invalidated(mut self, enabled: bool) -> Self {
        self.refetch_on_query_invalidated = enabled;
        self
    }

    pub fn with_refetch_on_location_invalidated(mut self, enabled: bool) -> Self {
        self.refetch_on_location_invalidated = enabled;
        self
    }

    /// Inject the logger observers will report through.
    pub fn with_logger(mut self, logger: Logger) -> Self {
        self.logger = logger;
        self
    }
}
