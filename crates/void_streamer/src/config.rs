//! Streamer configuration
//!
//! Loaded from TOML:
//!
//! ```toml
//! recycle_bin_prewarm = 64
//! extended_profiling = true
//! statistics_window = 256
//! thread_name = "io-streamer"
//! idle_timeout_ms = 100
//! ```
//!
//! Every key is optional and falls back to `StreamerConfig::default()`.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from loading a configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Validation error: {0}")]
    Validation(String),
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Configuration of a streamer context and its processing thread
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamerConfig {
    /// Requests allocated the first time a recycle bin is found empty
    pub recycle_bin_prewarm: usize,
    /// Track prediction accuracy, missed deadlines and callback durations
    pub extended_profiling: bool,
    /// Samples kept by the profiling rolling averages
    pub statistics_window: usize,
    /// Name of the processing thread
    pub thread_name: String,
    /// Upper bound on how long the idle processing thread sleeps
    pub idle_timeout_ms: Option<u64>,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            recycle_bin_prewarm: 1,
            extended_profiling: false,
            statistics_window: 128,
            thread_name: "void-streamer".to_string(),
            idle_timeout_ms: None,
        }
    }
}

impl StreamerConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(source: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    /// Serialize back to TOML
    pub fn to_toml_string(&self) -> ConfigResult<String> {
        Ok(toml::to_string(self)?)
    }

    /// Check the values are usable
    pub fn validate(&self) -> ConfigResult<()> {
        if self.recycle_bin_prewarm == 0 {
            return Err(ConfigError::Validation(
                "recycle_bin_prewarm must be at least 1".to_string(),
            ));
        }
        if self.statistics_window == 0 {
            return Err(ConfigError::Validation(
                "statistics_window must be at least 1".to_string(),
            ));
        }
        if self.thread_name.is_empty() {
            return Err(ConfigError::Validation("thread_name can't be empty".to_string()));
        }
        Ok(())
    }

    /// Enable extended profiling
    pub fn with_extended_profiling(mut self, enabled: bool) -> Self {
        self.extended_profiling = enabled;
        self
    }

    /// Set the pre-warm batch size
    pub fn with_prewarm(mut self, count: usize) -> Self {
        self.recycle_bin_prewarm = count;
        self
    }

    /// Idle timeout as a duration
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_ms.map(Duration::from_millis)
    }
}
