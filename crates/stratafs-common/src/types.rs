//! Core type definitions for stratafs
//!
//! This module defines the identifiers shared by the dirty block cache and the
//! local block store: block hashes, reference nonces and contexts, block
//! pointers, branches and volumes.

use derive_more::{Display, From, Into};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

/// Length of a block identifier in bytes
pub const BLOCK_ID_LEN: usize = 32;

/// Length of a block key half in bytes
pub const BLOCK_KEY_HALF_LEN: usize = 32;

/// Content hash identifying a block's payload
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId([u8; BLOCK_ID_LEN]);

impl BlockId {
    /// Compute the identifier for a payload (SHA-256)
    #[must_use]
    pub fn from_payload(payload: &[u8]) -> Self {
        Self(Sha256::digest(payload).into())
    }

    /// Create from raw hash bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; BLOCK_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse a lowercase or uppercase hex string
    pub fn from_hex(s: &str) -> Result<Self, BlockIdError> {
        let bytes = hex::decode(s).map_err(|_| BlockIdError::InvalidHex)?;
        let bytes: [u8; BLOCK_ID_LEN] = bytes
            .try_into()
            .map_err(|v: Vec<u8>| BlockIdError::InvalidLength(v.len()))?;
        Ok(Self(bytes))
    }

    /// Get as bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; BLOCK_ID_LEN] {
        &self.0
    }

    /// Hex encoding used for on-disk paths and logs
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockId({})", self.to_hex())
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Errors that can occur when parsing a block identifier
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BlockIdError {
    #[error("block id is not valid hex")]
    InvalidHex,
    #[error("block id must be {BLOCK_ID_LEN} bytes, got {0}")]
    InvalidLength(usize),
}

/// Distinguishes independent references (aliases) to the same block
///
/// The zero nonce is the primary reference created when the block is first
/// written.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct RefNonce([u8; 8]);

impl RefNonce {
    /// The primary reference
    pub const ZERO: Self = Self([0; 8]);

    /// Create from raw bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    /// Generate a fresh, non-zero alias nonce
    #[must_use]
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        loop {
            let mut bytes = [0u8; 8];
            rng.fill_bytes(&mut bytes);
            let nonce = Self(bytes);
            if !nonce.is_zero() {
                return nonce;
            }
        }
    }

    /// Whether this is the primary reference
    #[must_use]
    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// Get as bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }
}

impl fmt::Debug for RefNonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RefNonce({})", hex::encode(self.0))
    }
}

impl fmt::Display for RefNonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Identity of a block's creator or writer
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize, Display, From, Into)]
#[display("{_0}")]
pub struct UserId(String);

impl UserId {
    /// Create a new user identity
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the identity as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Reference context: who created a reference, who last wrote it, and which
/// alias of the block it is
#[derive(Clone, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct BlockContext {
    /// User that created the block
    pub creator: UserId,
    /// User that wrote this reference (same as the creator for primaries)
    pub writer: UserId,
    /// Alias discriminator
    pub ref_nonce: RefNonce,
}

impl BlockContext {
    /// Context for the primary reference of a freshly written block
    pub fn primary(creator: impl Into<UserId>) -> Self {
        let creator = creator.into();
        Self {
            writer: creator.clone(),
            creator,
            ref_nonce: RefNonce::ZERO,
        }
    }

    /// Derive an alias of this context written by `writer`
    #[must_use]
    pub fn alias(&self, writer: impl Into<UserId>, ref_nonce: RefNonce) -> Self {
        Self {
            creator: self.creator.clone(),
            writer: writer.into(),
            ref_nonce,
        }
    }
}

impl fmt::Display for BlockContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "creator={} writer={} nonce={}",
            self.creator, self.writer, self.ref_nonce
        )
    }
}

/// One logical reference to a block
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockPointer {
    /// Content hash of the payload
    pub id: BlockId,
    /// Reference context
    pub context: BlockContext,
}

impl BlockPointer {
    /// Create a pointer from its parts
    #[must_use]
    pub const fn new(id: BlockId, context: BlockContext) -> Self {
        Self { id, context }
    }

    /// Primary-reference pointer with an empty identity, convenient for caches
    /// keyed purely by block id
    #[must_use]
    pub fn from_id(id: BlockId) -> Self {
        Self {
            id,
            context: BlockContext::default(),
        }
    }
}

impl fmt::Display for BlockPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.id, self.context)
    }
}

/// A line of unsynced history
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct BranchName(String);

impl BranchName {
    /// Name of the main line
    pub const MASTER: &'static str = "master";

    /// Create a branch name
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The main line
    #[must_use]
    pub fn master() -> Self {
        Self(Self::MASTER.to_string())
    }

    /// Get the branch name as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this is the main line
    #[must_use]
    pub fn is_master(&self) -> bool {
        self.0 == Self::MASTER
    }
}

impl Default for BranchName {
    fn default() -> Self {
        Self::master()
    }
}

/// Unique identifier for a volume (an isolated collaboration namespace)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, From, Into)]
pub struct VolumeId(Uuid);

impl VolumeId {
    /// Generate a new random volume ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from existing UUID
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for VolumeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VolumeId({})", self.0)
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Server-side half of a block's encryption key
#[derive(Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BlockKeyHalf([u8; BLOCK_KEY_HALF_LEN]);

impl BlockKeyHalf {
    /// Create from raw bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; BLOCK_KEY_HALF_LEN]) -> Self {
        Self(bytes)
    }

    /// Generate random key material
    #[must_use]
    pub fn random() -> Self {
        let mut bytes = [0u8; BLOCK_KEY_HALF_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Get as bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; BLOCK_KEY_HALF_LEN] {
        &self.0
    }
}

// Key material stays out of logs.
impl fmt::Debug for BlockKeyHalf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BlockKeyHalf(..)")
    }
}

/// Quota report for a user
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaInfo {
    /// Maximum bytes the user may store
    pub limit: i64,
    /// Bytes currently stored
    pub usage: i64,
}

impl QuotaInfo {
    /// Limit reported when no quota system is wired in
    pub const UNLIMITED: i64 = i64::MAX;
}
