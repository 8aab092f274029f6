//! Block layer error types

use stratafs_common::{BlockId, ConfigError};
use thiserror::Error;

/// Block layer error
#[derive(Error, Debug)]
pub enum BlockError {
    /// No live block or reference at the given key
    #[error("Block not found: {block_id}")]
    NotFound { block_id: BlockId },

    /// Caller violated an operation precondition
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The named component has been shut down
    #[error("{0} is shut down")]
    Shutdown(&'static str),

    /// A queued admission request was cancelled before being granted
    #[error("Request cancelled")]
    Cancelled,

    /// Every reference to the block is archived; no new references accepted
    #[error("Block is archived: {block_id}")]
    BlockArchived { block_id: BlockId },

    /// Journal error
    #[error("Journal error: {0}")]
    Journal(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Rejected configuration
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl BlockError {
    /// Create a not found error for a block
    #[must_use]
    pub const fn not_found(block_id: BlockId) -> Self {
        Self::NotFound { block_id }
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Check if this is a not found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Check if this error comes from a torn-down component
    #[must_use]
    pub const fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown(_))
    }
}

/// Result type for block operations
pub type BlockResult<T> = Result<T, BlockError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let id = BlockId::from_payload(b"a");
        assert!(BlockError::not_found(id).is_not_found());
        assert!(!BlockError::Cancelled.is_not_found());
        assert!(BlockError::Shutdown("LocalBlockStore").is_shutdown());
        assert_eq!(
            BlockError::Shutdown("DirtyBlockCache").to_string(),
            "DirtyBlockCache is shut down"
        );
    }
}
