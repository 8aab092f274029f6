//! Configuration types for stratafs
//!
//! This module defines the configuration structures for the dirty block cache
//! and the local block store.

use crate::error::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Dirty block cache configuration
    pub dirty_cache: DirtyCacheConfig,
    /// Local block store configuration
    pub block_store: BlockStoreConfig,
}

impl Config {
    /// Validate every section
    pub fn validate(&self) -> ConfigResult<()> {
        self.dirty_cache.validate()?;
        self.block_store.validate()
    }
}

/// Dirty block cache admission limits
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirtyCacheConfig {
    /// Unsynced bytes at which a sync should be forced and backpressure starts
    pub soft_threshold_bytes: u64,
    /// Total buffered bytes at which new writers are queued
    pub hard_cap_bytes: u64,
    /// Portion of a writer's deadline reserved for the flush itself (milliseconds)
    pub backpressure_reserve_ms: u64,
}

impl Default for DirtyCacheConfig {
    fn default() -> Self {
        Self {
            soft_threshold_bytes: 256 * 1024 * 1024, // 256 MB
            hard_cap_bytes: 512 * 1024 * 1024,       // 512 MB
            backpressure_reserve_ms: 1000,
        }
    }
}

impl DirtyCacheConfig {
    /// Build a config with the given limits and the default reserve
    #[must_use]
    pub fn with_limits(soft_threshold_bytes: u64, hard_cap_bytes: u64) -> Self {
        Self {
            soft_threshold_bytes,
            hard_cap_bytes,
            ..Self::default()
        }
    }

    /// Backpressure reserve as a duration
    #[must_use]
    pub const fn backpressure_reserve(&self) -> Duration {
        Duration::from_millis(self.backpressure_reserve_ms)
    }

    /// Check the limits are coherent
    pub fn validate(&self) -> ConfigResult<()> {
        if self.hard_cap_bytes == 0 {
            return Err(ConfigError::invalid("hard_cap_bytes", "must be non-zero"));
        }
        if self.hard_cap_bytes < self.soft_threshold_bytes {
            return Err(ConfigError::HardCapBelowSoftThreshold {
                soft_threshold: self.soft_threshold_bytes,
                hard_cap: self.hard_cap_bytes,
            });
        }
        Ok(())
    }
}

/// Local block store configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockStoreConfig {
    /// Directory holding one subdirectory per volume
    pub root_dir: PathBuf,
    /// Journal size that triggers compaction
    pub max_journal_bytes: u64,
    /// fsync the journal after every record
    pub sync_on_write: bool,
}

impl Default for BlockStoreConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("/var/lib/stratafs/blocks"),
            max_journal_bytes: 64 * 1024 * 1024, // 64 MB
            sync_on_write: false,
        }
    }
}

impl BlockStoreConfig {
    /// Default settings rooted at `root_dir`
    pub fn at(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            ..Self::default()
        }
    }

    /// Check the settings are usable
    pub fn validate(&self) -> ConfigResult<()> {
        if self.root_dir.as_os_str().is_empty() {
            return Err(ConfigError::invalid("root_dir", "must not be empty"));
        }
        if self.max_journal_bytes == 0 {
            return Err(ConfigError::invalid("max_journal_bytes", "must be non-zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        Config::default().validate().unwrap();
        assert_eq!(
            DirtyCacheConfig::default().backpressure_reserve(),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn test_hard_cap_below_soft_threshold() {
        let config = DirtyCacheConfig::with_limits(20, 10);
        assert_eq!(
            config.validate(),
            Err(ConfigError::HardCapBelowSoftThreshold {
                soft_threshold: 20,
                hard_cap: 10
            })
        );
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"dirty_cache": {"hard_cap_bytes": 1048576}}"#).unwrap();
        assert_eq!(config.dirty_cache.hard_cap_bytes, 1024 * 1024);
        assert_eq!(config.dirty_cache.backpressure_reserve_ms, 1000);
        assert_eq!(config.block_store, BlockStoreConfig::default());
    }
}
