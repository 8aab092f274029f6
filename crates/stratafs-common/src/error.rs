//! Configuration error types

use thiserror::Error;

/// Result type for configuration validation
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Error raised when a configuration is rejected
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("hard cap ({hard_cap} bytes) is below the soft threshold ({soft_threshold} bytes)")]
    HardCapBelowSoftThreshold { soft_threshold: u64, hard_cap: u64 },

    #[error("invalid configuration value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

impl ConfigError {
    /// Create an invalid value error
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field,
            reason: reason.into(),
        }
    }
}
