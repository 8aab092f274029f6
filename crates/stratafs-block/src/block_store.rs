//! Local block store
//!
//! Routes block operations to the per-volume [`VolumeStorage`] held by a
//! [`VolumeStoreRegistry`], opening stores lazily on first use.

use crate::error::{BlockError, BlockResult};
use crate::registry::{JournalStoreFactory, VolumeStoreFactory, VolumeStoreRegistry};
use crate::volume_store::{RefSnapshot, VolumeStorage};

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use stratafs_common::{
    BlockContext, BlockId, BlockKeyHalf, BlockStoreConfig, QuotaInfo, VolumeId,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Action run once after the store has shut down
pub type Cleanup = Box<dyn FnOnce() + Send>;

/// Content-addressed, reference-counted block store on local disk
pub struct LocalBlockStore {
    registry: VolumeStoreRegistry,
    root_dir: Option<PathBuf>,
    cleanup: Mutex<Option<Cleanup>>,
}

impl LocalBlockStore {
    /// Journal-backed stores under `config.root_dir/<volume id>`
    pub fn open(config: BlockStoreConfig) -> BlockResult<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.root_dir)?;
        info!("Local block store opened at {:?}", config.root_dir);
        let root_dir = config.root_dir.clone();
        let mut store = Self::with_factory(JournalStoreFactory::new(config), None);
        store.root_dir = Some(root_dir);
        Ok(store)
    }

    /// Stores in a fresh directory under the OS temp dir, removed on shutdown
    ///
    /// `config.root_dir` is ignored.
    pub fn temp(config: BlockStoreConfig) -> BlockResult<Self> {
        let root_dir = std::env::temp_dir().join(format!("stratafs-blocks-{}", Uuid::new_v4()));
        let mut store = Self::open(BlockStoreConfig {
            root_dir: root_dir.clone(),
            ..config
        })?;
        store.cleanup = Mutex::new(Some(Box::new(move || {
            if let Err(e) = std::fs::remove_dir_all(&root_dir) {
                warn!("Failed to remove temporary block store {:?}: {}", root_dir, e);
            }
        })));
        Ok(store)
    }

    /// Stores built by `factory`; `cleanup` runs once after shutdown
    pub fn with_factory(factory: impl VolumeStoreFactory + 'static, cleanup: Option<Cleanup>) -> Self {
        Self {
            registry: VolumeStoreRegistry::new(factory),
            root_dir: None,
            cleanup: Mutex::new(cleanup),
        }
    }

    /// Directory holding the volume stores, if disk-backed
    pub fn root_dir(&self) -> Option<&Path> {
        self.root_dir.as_deref()
    }

    fn volume(&self, volume_id: &VolumeId) -> BlockResult<Arc<dyn VolumeStorage>> {
        self.registry.get_or_open(volume_id)
    }

    /// Read a block through a live reference
    pub fn get(
        &self,
        id: &BlockId,
        volume_id: &VolumeId,
        context: &BlockContext,
    ) -> BlockResult<(Bytes, BlockKeyHalf)> {
        debug!(block_id = %id, volume_id = %volume_id, context = %context, "get");
        self.volume(volume_id)?.get_data(id, context)
    }

    /// Store a block under its primary reference
    pub fn put(
        &self,
        id: &BlockId,
        volume_id: &VolumeId,
        context: &BlockContext,
        payload: &[u8],
        key_half: &BlockKeyHalf,
    ) -> BlockResult<()> {
        debug!(
            block_id = %id,
            volume_id = %volume_id,
            context = %context,
            size = payload.len(),
            "put"
        );
        if !context.ref_nonce.is_zero() {
            return Err(BlockError::invalid_argument(format!(
                "put of block {id} with non-zero nonce {}",
                context.ref_nonce
            )));
        }
        self.volume(volume_id)?.put_data(id, context, payload, key_half)
    }

    /// Add a live holder of an alias to an existing block
    pub fn add_block_reference(
        &self,
        id: &BlockId,
        volume_id: &VolumeId,
        context: &BlockContext,
    ) -> BlockResult<()> {
        debug!(block_id = %id, volume_id = %volume_id, context = %context, "add reference");
        self.volume(volume_id)?.add_reference(id, context)
    }

    /// Drop references; returns each block's remaining live count
    pub fn remove_block_reference(
        &self,
        volume_id: &VolumeId,
        contexts: &HashMap<BlockId, Vec<BlockContext>>,
    ) -> BlockResult<HashMap<BlockId, u64>> {
        debug!(volume_id = %volume_id, blocks = contexts.len(), "remove references");
        let store = self.volume(volume_id)?;
        let mut live_counts = HashMap::with_capacity(contexts.len());
        for (id, block_contexts) in contexts {
            let live = store.remove_references(id, block_contexts)?;
            live_counts.insert(*id, live);
        }
        Ok(live_counts)
    }

    /// Archive references; live counts are unchanged
    pub fn archive_block_references(
        &self,
        volume_id: &VolumeId,
        contexts: &HashMap<BlockId, Vec<BlockContext>>,
    ) -> BlockResult<()> {
        debug!(volume_id = %volume_id, blocks = contexts.len(), "archive references");
        let store = self.volume(volume_id)?;
        for (id, block_contexts) in contexts {
            store.archive_references(id, block_contexts)?;
        }
        Ok(())
    }

    /// Every reference in the volume
    pub fn get_all(&self, volume_id: &VolumeId) -> BlockResult<RefSnapshot> {
        debug!(volume_id = %volume_id, "get all");
        self.volume(volume_id)?.get_all()
    }

    /// Unlimited quota; usage is the payload bytes held by open volumes
    pub fn get_user_quota_info(&self) -> BlockResult<QuotaInfo> {
        let usage = self
            .registry
            .stores()?
            .iter()
            .map(|store| store.usage_bytes())
            .sum::<BlockResult<u64>>()?;
        Ok(QuotaInfo {
            limit: QuotaInfo::UNLIMITED,
            usage: i64::try_from(usage).unwrap_or(i64::MAX),
        })
    }

    /// Shut down every volume store, then run the cleanup action
    ///
    /// Later operations fail with [`BlockError::Shutdown`]. Repeated calls
    /// do nothing.
    pub fn shutdown(&self) {
        if !self.registry.shutdown() {
            return;
        }
        if let Some(cleanup) = self.cleanup.lock().take() {
            cleanup();
        }
        info!("Local block store shut down");
    }
}

impl Drop for LocalBlockStore {
    fn drop(&mut self) {
        self.shutdown();
    }
}
