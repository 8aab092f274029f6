//! stratafs Common - Shared identifiers and configuration
//!
//! This crate provides the block, reference and volume identifiers and the
//! configuration types used by the stratafs block layer.

pub mod config;
pub mod error;
pub mod types;

pub use config::{BlockStoreConfig, Config, DirtyCacheConfig};
pub use error::{ConfigError, ConfigResult};
pub use types::*;
