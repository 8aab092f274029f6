//! Dirty block cache
//!
//! Buffers modified-but-unsynced blocks in memory, keyed by block pointer and
//! branch, and owns the [`AdmissionController`] that bounds how many bytes may
//! be buffered at once. Entries are discarded, never flushed, on shutdown:
//! callers that need durability must finish their syncs first.

use crate::admission::{AdmissionController, AdmissionStats, PermissionToken};
use crate::clock::{Clock, WallClock};
use crate::error::{BlockError, BlockResult};

use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use stratafs_common::{BlockPointer, BranchName, DirtyCacheConfig};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const COMPONENT: &str = "DirtyBlockCache";

/// Cache key: the full pointer (nonce and identities included) plus branch
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DirtyKey {
    pointer: BlockPointer,
    branch: BranchName,
}

/// A buffered block; clean once the flush driver has persisted it
#[derive(Debug, Clone)]
struct DirtyEntry {
    payload: Bytes,
    dirty: bool,
}

/// Cache statistics
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DirtyCacheStats {
    /// Number of buffered entries
    pub entries: usize,
    /// Total payload bytes buffered
    pub buffered_bytes: u64,
    /// Admission counters
    pub admission: AdmissionStats,
}

/// In-memory staging area for dirty blocks with admission control
pub struct DirtyBlockCache {
    /// `None` once the cache has been shut down
    entries: RwLock<Option<HashMap<DirtyKey, DirtyEntry>>>,
    admission: AdmissionController,
}

impl DirtyBlockCache {
    /// Create a cache using the wall clock
    pub fn new(config: &DirtyCacheConfig) -> BlockResult<Self> {
        Self::with_clock(config, Arc::new(WallClock))
    }

    /// Create a cache whose backpressure is measured against `clock`
    pub fn with_clock(config: &DirtyCacheConfig, clock: Arc<dyn Clock>) -> BlockResult<Self> {
        let admission = AdmissionController::new(config, clock)?;
        debug!(
            "Dirty block cache initialized: soft threshold {} bytes, hard cap {} bytes",
            config.soft_threshold_bytes, config.hard_cap_bytes
        );
        Ok(Self {
            entries: RwLock::new(Some(HashMap::new())),
            admission,
        })
    }

    /// Buffer a block; a later put for the same pointer and branch replaces it
    pub fn put(&self, pointer: &BlockPointer, branch: &BranchName, payload: Bytes) -> BlockResult<()> {
        debug!(
            block_id = %pointer.id,
            nonce = %pointer.context.ref_nonce,
            %branch,
            bytes = payload.len(),
            "DirtyBlockCache.put"
        );
        let mut entries = self.entries.write();
        let entries = entries.as_mut().ok_or(BlockError::Shutdown(COMPONENT))?;
        entries.insert(
            DirtyKey {
                pointer: pointer.clone(),
                branch: branch.clone(),
            },
            DirtyEntry {
                payload,
                dirty: true,
            },
        );
        Ok(())
    }

    /// Fetch a buffered payload
    pub fn get(&self, pointer: &BlockPointer, branch: &BranchName) -> BlockResult<Bytes> {
        let entries = self.entries.read();
        let entries = entries.as_ref().ok_or(BlockError::Shutdown(COMPONENT))?;
        entries
            .get(&Self::key(pointer, branch))
            .map(|entry| entry.payload.clone())
            .ok_or_else(|| BlockError::not_found(pointer.id))
    }

    /// Whether the pointer has unsynced changes on `branch`
    pub fn is_dirty(&self, pointer: &BlockPointer, branch: &BranchName) -> bool {
        self.entries
            .read()
            .as_ref()
            .and_then(|entries| entries.get(&Self::key(pointer, branch)).map(|e| e.dirty))
            .unwrap_or(false)
    }

    /// Remove the entry for one pointer on one branch
    ///
    /// Other branches' entries for the same pointer are left alone.
    pub fn delete(&self, pointer: &BlockPointer, branch: &BranchName) {
        debug!(block_id = %pointer.id, %branch, "DirtyBlockCache.delete");
        if let Some(entries) = self.entries.write().as_mut() {
            entries.remove(&Self::key(pointer, branch));
        }
    }

    /// Mark entries persisted; they stay readable until deleted
    ///
    /// A put that replaced an entry after it was snapshotted is still marked,
    /// so callers should only pass pointers whose payloads they persisted.
    pub fn mark_flushed(&self, branch: &BranchName, pointers: &[BlockPointer]) {
        debug!(%branch, count = pointers.len(), "DirtyBlockCache.mark_flushed");
        if let Some(entries) = self.entries.write().as_mut() {
            for pointer in pointers {
                if let Some(entry) = entries.get_mut(&Self::key(pointer, branch)) {
                    entry.dirty = false;
                }
            }
        }
    }

    /// Snapshot of every dirty entry on a branch, for the flush driver
    pub fn dirty_entries(&self, branch: &BranchName) -> Vec<(BlockPointer, Bytes)> {
        self.entries
            .read()
            .as_ref()
            .map(|entries| {
                entries
                    .iter()
                    .filter(|(key, entry)| key.branch == *branch && entry.dirty)
                    .map(|(key, entry)| (key.pointer.clone(), entry.payload.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of buffered entries
    pub fn len(&self) -> usize {
        self.entries.read().as_ref().map_or(0, HashMap::len)
    }

    /// Whether no entries are buffered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get cache statistics
    pub fn stats(&self) -> DirtyCacheStats {
        let entries = self.entries.read();
        let (count, bytes) = entries.as_ref().map_or((0, 0), |entries| {
            (
                entries.len(),
                entries.values().map(|e| e.payload.len() as u64).sum(),
            )
        });
        DirtyCacheStats {
            entries: count,
            buffered_bytes: bytes,
            admission: self.admission.stats(),
        }
    }

    /// See [`AdmissionController::request_permission_to_dirty`]
    pub fn request_permission_to_dirty(
        &self,
        cancel: &CancellationToken,
        bytes: u64,
    ) -> BlockResult<PermissionToken> {
        if self.entries.read().is_none() {
            return Err(BlockError::Shutdown(COMPONENT));
        }
        self.admission.request_permission_to_dirty(cancel, bytes)
    }

    /// See [`AdmissionController::update_unsynced_bytes`]
    pub fn update_unsynced_bytes(&self, delta: i64, is_syncing: bool) {
        self.admission.update_unsynced_bytes(delta, is_syncing);
    }

    /// See [`AdmissionController::block_sync_finished`]
    pub fn block_sync_finished(&self, size: u64) {
        self.admission.block_sync_finished(size);
    }

    /// See [`AdmissionController::sync_finished`]
    pub fn sync_finished(&self, size: u64) {
        self.admission.sync_finished(size);
    }

    /// See [`AdmissionController::should_force_sync`]
    pub fn should_force_sync(&self) -> bool {
        self.admission.should_force_sync()
    }

    /// See [`AdmissionController::calc_backpressure`]
    pub fn calc_backpressure(&self, reference: Instant, deadline: Instant) -> Duration {
        self.admission.calc_backpressure(reference, deadline)
    }

    /// Sleep for the backpressure delay a writer with `deadline` should observe
    pub async fn throttle(&self, cancel: &CancellationToken, deadline: Instant) -> BlockResult<()> {
        let now = self.admission.clock().now();
        let delay = self.admission.calc_backpressure(now, deadline);
        if delay.is_zero() {
            return Ok(());
        }
        debug!("Applying {:?} of backpressure", delay);
        tokio::select! {
            () = tokio::time::sleep(delay) => Ok(()),
            () = cancel.cancelled() => Err(BlockError::Cancelled),
        }
    }

    /// Discard every entry and all admission state
    pub fn shutdown(&self) {
        let discarded = self.entries.write().take().map_or(0, |e| e.len());
        self.admission.shutdown();
        debug!("Dirty block cache shut down, discarded {} entries", discarded);
    }

    fn key(pointer: &BlockPointer, branch: &BranchName) -> DirtyKey {
        DirtyKey {
            pointer: pointer.clone(),
            branch: branch.clone(),
        }
    }
}
