//! Reference-counted, content-addressed block store for one volume
//!
//! Payloads are stored once per block id. Each block carries a ledger of
//! references keyed by nonce; every reference has its own live count and an
//! archived flag. When the live counts of all of a block's references reach
//! zero, the block is garbage collected and its payload files are deleted.
//!
//! ```text
//! <volume dir>/
//!   refs.journal            reference ledger mutations
//!   blocks/<hex id>/data     payload
//!   blocks/<hex id>/key_half server-side key material
//! ```

use crate::error::{BlockError, BlockResult};
use crate::journal::{JournalOp, RefJournal};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use stratafs_common::{
    BLOCK_KEY_HALF_LEN, BlockContext, BlockId, BlockKeyHalf, BlockStoreConfig, RefNonce, VolumeId,
};
use tracing::{debug, info, warn};

const COMPONENT: &str = "Volume store";
const JOURNAL_FILE: &str = "refs.journal";
const BLOCKS_DIR: &str = "blocks";
const DATA_FILE: &str = "data";
const KEY_HALF_FILE: &str = "key_half";

/// Persisted status of one reference (one nonce of one block)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefRecord {
    /// Context that created the reference
    pub context: BlockContext,
    /// Number of live holders of this reference
    pub live_count: u32,
    /// Soft-deleted: readable, but accepts no new references
    pub archived: bool,
}

/// All references of every block in a volume, keyed by block id then nonce
pub type RefSnapshot = HashMap<BlockId, HashMap<RefNonce, RefRecord>>;

/// Durable storage for one volume's blocks
///
/// This is the seam between the [`LocalBlockStore`](crate::LocalBlockStore)
/// façade and whatever actually persists blocks.
pub trait VolumeStorage: Send + Sync {
    /// Read a payload through a live reference
    fn get_data(&self, id: &BlockId, context: &BlockContext) -> BlockResult<(Bytes, BlockKeyHalf)>;

    /// Store a payload under its primary reference
    fn put_data(
        &self,
        id: &BlockId,
        context: &BlockContext,
        payload: &[u8],
        key_half: &BlockKeyHalf,
    ) -> BlockResult<()>;

    /// Add one live holder of `context` to an existing block
    fn add_reference(&self, id: &BlockId, context: &BlockContext) -> BlockResult<()>;

    /// Drop one live holder of each context; returns the block's remaining live count
    fn remove_references(&self, id: &BlockId, contexts: &[BlockContext]) -> BlockResult<u64>;

    /// Mark references archived
    fn archive_references(&self, id: &BlockId, contexts: &[BlockContext]) -> BlockResult<()>;

    /// Every reference known to the store
    fn get_all(&self) -> BlockResult<RefSnapshot>;

    /// Payload bytes held by the store
    fn usage_bytes(&self) -> BlockResult<u64>;

    /// Flush and close; later calls fail with `Shutdown`
    fn shutdown(&self);
}

#[derive(Debug, Clone)]
struct BlockEntry {
    size: u64,
    refs: HashMap<RefNonce, RefRecord>,
}

impl BlockEntry {
    fn live_count(&self) -> u64 {
        self.refs.values().map(|r| u64::from(r.live_count)).sum()
    }
}

/// In-memory reference ledger, rebuilt from the journal on open
#[derive(Debug, Default)]
struct Ledger {
    blocks: HashMap<BlockId, BlockEntry>,
}

impl Ledger {
    /// Apply a validated operation; returns the block's remaining live count
    fn apply(&mut self, op: &JournalOp) -> u64 {
        match op {
            JournalOp::Put { id, context, size } => {
                let entry = self.blocks.entry(*id).or_insert_with(|| BlockEntry {
                    size: *size,
                    refs: HashMap::new(),
                });
                entry
                    .refs
                    .entry(context.ref_nonce)
                    .or_insert_with(|| RefRecord {
                        context: context.clone(),
                        live_count: 1,
                        archived: false,
                    });
                entry.live_count()
            }
            JournalOp::AddReference { id, context } => {
                let Some(entry) = self.blocks.get_mut(id) else {
                    return 0;
                };
                let record = entry
                    .refs
                    .entry(context.ref_nonce)
                    .or_insert_with(|| RefRecord {
                        context: context.clone(),
                        live_count: 0,
                        archived: false,
                    });
                record.live_count = record.live_count.saturating_add(1);
                entry.live_count()
            }
            JournalOp::RemoveReferences { id, contexts } => {
                let Some(entry) = self.blocks.get_mut(id) else {
                    return 0;
                };
                for context in contexts {
                    if let Some(record) = entry.refs.get_mut(&context.ref_nonce) {
                        record.live_count = record.live_count.saturating_sub(1);
                        if record.live_count == 0 {
                            entry.refs.remove(&context.ref_nonce);
                        }
                    }
                }
                let live = entry.live_count();
                if live == 0 {
                    self.blocks.remove(id);
                }
                live
            }
            JournalOp::ArchiveReferences { id, contexts } => {
                let Some(entry) = self.blocks.get_mut(id) else {
                    return 0;
                };
                for context in contexts {
                    if let Some(record) = entry.refs.get_mut(&context.ref_nonce) {
                        record.archived = true;
                    }
                }
                entry.live_count()
            }
            JournalOp::Restore { id, size, refs } => {
                let entry = BlockEntry {
                    size: *size,
                    refs: refs
                        .iter()
                        .map(|r| (r.context.ref_nonce, r.clone()))
                        .collect(),
                };
                let live = entry.live_count();
                self.blocks.insert(*id, entry);
                live
            }
        }
    }

    /// One `Restore` per block, in a stable order
    fn snapshot_ops(&self) -> Vec<JournalOp> {
        let mut ids: Vec<_> = self.blocks.keys().copied().collect();
        ids.sort();
        ids.into_iter()
            .filter_map(|id| {
                let entry = self.blocks.get(&id)?;
                let mut refs: Vec<_> = entry.refs.values().cloned().collect();
                refs.sort_by_key(|r| r.context.ref_nonce);
                Some(JournalOp::Restore {
                    id,
                    size: entry.size,
                    refs,
                })
            })
            .collect()
    }
}

struct Inner {
    ledger: Ledger,
    journal: RefJournal,
}

impl Inner {
    /// Journal then apply
    ///
    /// Once the op is journaled the mutation has happened; a failed
    /// compaction afterwards is only logged.
    fn commit(&mut self, op: &JournalOp) -> BlockResult<u64> {
        self.journal.append(op)?;
        let live = self.ledger.apply(op);
        if self.journal.needs_compaction() {
            let snapshot = self.ledger.snapshot_ops();
            if let Err(e) = self.journal.compact(snapshot) {
                warn!("Journal compaction failed, keeping the current journal: {}", e);
            }
        }
        Ok(live)
    }
}

/// Journal-backed [`VolumeStorage`] rooted at one directory
pub struct JournalVolumeStore {
    volume_id: VolumeId,
    dir: PathBuf,
    /// `None` after shutdown
    inner: Mutex<Option<Inner>>,
}

impl JournalVolumeStore {
    /// Open (or create) the store in `dir`, replaying its journal
    pub fn open(
        volume_id: VolumeId,
        dir: impl Into<PathBuf>,
        config: &BlockStoreConfig,
    ) -> BlockResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(dir.join(BLOCKS_DIR))?;

        let (journal, entries) = RefJournal::open(
            dir.join(JOURNAL_FILE),
            config.max_journal_bytes,
            config.sync_on_write,
        )?;
        let mut ledger = Ledger::default();
        for entry in &entries {
            ledger.apply(&entry.op);
        }

        info!(
            "Opened volume store {} at {:?}: {} blocks from {} journal entries",
            volume_id,
            dir,
            ledger.blocks.len(),
            entries.len()
        );

        Ok(Self {
            volume_id,
            dir,
            inner: Mutex::new(Some(Inner { ledger, journal })),
        })
    }

    fn block_dir(&self, id: &BlockId) -> PathBuf {
        self.dir.join(BLOCKS_DIR).join(id.to_hex())
    }

    fn write_block_files(&self, id: &BlockId, payload: &[u8], key_half: &BlockKeyHalf) -> BlockResult<()> {
        let dir = self.block_dir(id);
        std::fs::create_dir_all(&dir)?;
        write_atomic(&dir.join(DATA_FILE), payload)?;
        write_atomic(&dir.join(KEY_HALF_FILE), key_half.as_bytes())?;
        Ok(())
    }

    fn read_block_files(&self, id: &BlockId) -> BlockResult<(Bytes, BlockKeyHalf)> {
        let dir = self.block_dir(id);
        let map_missing = |e: std::io::Error| {
            if e.kind() == ErrorKind::NotFound {
                BlockError::not_found(*id)
            } else {
                BlockError::Io(e)
            }
        };
        let data = std::fs::read(dir.join(DATA_FILE)).map_err(map_missing)?;
        let key = std::fs::read(dir.join(KEY_HALF_FILE)).map_err(map_missing)?;
        let key: [u8; BLOCK_KEY_HALF_LEN] = key.try_into().map_err(|v: Vec<u8>| {
            BlockError::Journal(format!("key half for {id} has {} bytes", v.len()))
        })?;
        Ok((Bytes::from(data), BlockKeyHalf::from_bytes(key)))
    }

    fn delete_block_files(&self, id: &BlockId) {
        if let Err(e) = std::fs::remove_dir_all(self.block_dir(id)) {
            if e.kind() != ErrorKind::NotFound {
                warn!("Failed to remove payload of unreferenced block {}: {}", id, e);
            }
        }
    }

    fn with_inner<T>(&self, f: impl FnOnce(&mut Inner) -> BlockResult<T>) -> BlockResult<T> {
        let mut guard = self.inner.lock();
        let inner = guard.as_mut().ok_or(BlockError::Shutdown(COMPONENT))?;
        f(inner)
    }
}

impl VolumeStorage for JournalVolumeStore {
    fn get_data(&self, id: &BlockId, context: &BlockContext) -> BlockResult<(Bytes, BlockKeyHalf)> {
        self.with_inner(|inner| {
            let live = inner
                .ledger
                .blocks
                .get(id)
                .and_then(|entry| entry.refs.get(&context.ref_nonce))
                .is_some_and(|record| record.live_count > 0);
            if !live {
                return Err(BlockError::not_found(*id));
            }
            self.read_block_files(id)
        })
    }

    fn put_data(
        &self,
        id: &BlockId,
        context: &BlockContext,
        payload: &[u8],
        key_half: &BlockKeyHalf,
    ) -> BlockResult<()> {
        self.with_inner(|inner| {
            if let Some(entry) = inner.ledger.blocks.get(id) {
                let (existing, _) = self.read_block_files(id)?;
                if existing.as_ref() != payload {
                    return Err(BlockError::invalid_argument(format!(
                        "block {id} already stored with different contents"
                    )));
                }
                if entry.refs.contains_key(&context.ref_nonce) {
                    debug!("Block {} already stored, put is a no-op", id);
                    return Ok(());
                }
            } else {
                self.write_block_files(id, payload, key_half)?;
            }

            inner.commit(&JournalOp::Put {
                id: *id,
                context: context.clone(),
                size: payload.len() as u64,
            })?;
            Ok(())
        })
    }

    fn add_reference(&self, id: &BlockId, context: &BlockContext) -> BlockResult<()> {
        self.with_inner(|inner| {
            let entry = inner
                .ledger
                .blocks
                .get(id)
                .ok_or_else(|| BlockError::not_found(*id))?;
            let target_archived = entry
                .refs
                .get(&context.ref_nonce)
                .is_some_and(|record| record.archived);
            let all_archived = !entry.refs.is_empty() && entry.refs.values().all(|r| r.archived);
            if target_archived || all_archived {
                return Err(BlockError::BlockArchived { block_id: *id });
            }

            inner.commit(&JournalOp::AddReference {
                id: *id,
                context: context.clone(),
            })?;
            Ok(())
        })
    }

    fn remove_references(&self, id: &BlockId, contexts: &[BlockContext]) -> BlockResult<u64> {
        self.with_inner(|inner| {
            if !inner.ledger.blocks.contains_key(id) {
                return Ok(0);
            }
            let live = inner.commit(&JournalOp::RemoveReferences {
                id: *id,
                contexts: contexts.to_vec(),
            })?;
            // Still under the lock, so a concurrent put of the same id
            // cannot land its files in between.
            if live == 0 {
                debug!("Block {} has no live references, deleting payload", id);
                self.delete_block_files(id);
            }
            Ok(live)
        })
    }

    fn archive_references(&self, id: &BlockId, contexts: &[BlockContext]) -> BlockResult<()> {
        self.with_inner(|inner| {
            let entry = inner
                .ledger
                .blocks
                .get(id)
                .ok_or_else(|| BlockError::not_found(*id))?;
            if contexts
                .iter()
                .any(|context| !entry.refs.contains_key(&context.ref_nonce))
            {
                return Err(BlockError::not_found(*id));
            }
            if contexts
                .iter()
                .all(|context| entry.refs[&context.ref_nonce].archived)
            {
                return Ok(());
            }

            inner.commit(&JournalOp::ArchiveReferences {
                id: *id,
                contexts: contexts.to_vec(),
            })?;
            Ok(())
        })
    }

    fn get_all(&self) -> BlockResult<RefSnapshot> {
        self.with_inner(|inner| {
            Ok(inner
                .ledger
                .blocks
                .iter()
                .map(|(id, entry)| (*id, entry.refs.clone()))
                .collect())
        })
    }

    fn usage_bytes(&self) -> BlockResult<u64> {
        self.with_inner(|inner| Ok(inner.ledger.blocks.values().map(|e| e.size).sum()))
    }

    fn shutdown(&self) {
        let Some(mut inner) = self.inner.lock().take() else {
            return;
        };
        if let Err(e) = inner.journal.close() {
            warn!("Failed to close journal for volume {}: {}", self.volume_id, e);
        }
        debug!("Volume store {} shut down", self.volume_id);
    }
}

/// Write through a temp file and rename into place
fn write_atomic(path: &Path, contents: &[u8]) -> BlockResult<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;
    use stratafs_common::UserId;
    use tempfile::{TempDir, tempdir};

    fn open_store(dir: &TempDir) -> JournalVolumeStore {
        let config = BlockStoreConfig::at(dir.path());
        JournalVolumeStore::open(VolumeId::new(), dir.path().join("vol"), &config).unwrap()
    }

    fn stored_block(store: &JournalVolumeStore, payload: &[u8]) -> (BlockId, BlockContext) {
        let id = BlockId::from_payload(payload);
        let context = BlockContext::primary("alice");
        store
            .put_data(&id, &context, payload, &BlockKeyHalf::random())
            .unwrap();
        (id, context)
    }

    #[test]
    fn test_put_then_get() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        let id = BlockId::from_payload(b"hello");
        let context = BlockContext::primary("alice");
        let key = BlockKeyHalf::random();

        store.put_data(&id, &context, b"hello", &key).unwrap();
        let (data, key_half) = store.get_data(&id, &context).unwrap();
        assert_eq!(data.as_ref(), b"hello");
        assert_eq!(key_half, key);
        assert_eq!(store.usage_bytes().unwrap(), 5);
    }

    #[test]
    fn test_get_unknown_reference() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        let (id, context) = stored_block(&store, b"hello");

        let alias = context.alias("bob", RefNonce::random());
        assert!(store.get_data(&id, &alias).unwrap_err().is_not_found());
        let missing = BlockId::from_payload(b"missing");
        assert!(store.get_data(&missing, &context).unwrap_err().is_not_found());
    }

    #[test]
    fn test_put_is_idempotent_but_rejects_different_data() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        let (id, context) = stored_block(&store, b"hello");

        store
            .put_data(&id, &context, b"hello", &BlockKeyHalf::random())
            .unwrap();
        assert_eq!(store.get_all().unwrap()[&id][&RefNonce::ZERO].live_count, 1);

        let err = store
            .put_data(&id, &context, b"goodbye", &BlockKeyHalf::random())
            .unwrap_err();
        assert!(matches!(err, BlockError::InvalidArgument(_)));
    }

    #[test]
    fn test_aliases_are_counted_independently() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        let (id, context) = stored_block(&store, b"shared");
        let alias = context.alias("bob", RefNonce::random());

        store.add_reference(&id, &alias).unwrap();
        store.add_reference(&id, &alias).unwrap();
        let refs = &store.get_all().unwrap()[&id];
        assert_eq!(refs[&RefNonce::ZERO].live_count, 1);
        assert_eq!(refs[&alias.ref_nonce].live_count, 2);
        assert_eq!(refs[&alias.ref_nonce].context.writer, UserId::from("bob"));

        // Dropping the primary leaves the alias readable.
        assert_eq!(store.remove_references(&id, &[context.clone()]).unwrap(), 2);
        assert!(store.get_data(&id, &context).unwrap_err().is_not_found());
        assert_eq!(store.get_data(&id, &alias).unwrap().0.as_ref(), b"shared");
    }

    #[test]
    fn test_add_reference_requires_existing_block() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        let id = BlockId::from_payload(b"never stored");
        let err = store
            .add_reference(&id, &BlockContext::primary("alice").alias("bob", RefNonce::random()))
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_remove_all_references_collects_garbage() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        let (id, context) = stored_block(&store, b"garbage");
        let alias = context.alias("bob", RefNonce::random());
        store.add_reference(&id, &alias).unwrap();
        let block_dir = store.block_dir(&id);
        assert!(block_dir.exists());

        assert_eq!(
            store
                .remove_references(&id, &[context.clone(), alias.clone()])
                .unwrap(),
            0
        );
        assert!(!block_dir.exists());
        assert!(store.get_all().unwrap().is_empty());
        assert_eq!(store.usage_bytes().unwrap(), 0);

        // Removing again is harmless.
        assert_eq!(store.remove_references(&id, &[context]).unwrap(), 0);
    }

    #[test]
    fn test_archive_keeps_counts_and_blocks_new_references() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        let (id, context) = stored_block(&store, b"archived");

        store.archive_references(&id, &[context.clone()]).unwrap();
        store.archive_references(&id, &[context.clone()]).unwrap();
        let record = &store.get_all().unwrap()[&id][&RefNonce::ZERO];
        assert!(record.archived);
        assert_eq!(record.live_count, 1);

        // Archived references stay readable.
        assert_eq!(store.get_data(&id, &context).unwrap().0.as_ref(), b"archived");

        let alias = context.alias("bob", RefNonce::random());
        assert!(matches!(
            store.add_reference(&id, &alias),
            Err(BlockError::BlockArchived { .. })
        ));
        assert!(matches!(
            store.add_reference(&id, &context),
            Err(BlockError::BlockArchived { .. })
        ));
    }

    #[test]
    fn test_archive_unknown_reference() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        let (id, context) = stored_block(&store, b"data");
        let alias = context.alias("bob", RefNonce::random());
        assert!(store.archive_references(&id, &[alias]).unwrap_err().is_not_found());
    }

    #[test]
    fn test_ledger_survives_reopen() {
        let dir = tempdir().unwrap();
        let config = BlockStoreConfig::at(dir.path());
        let volume_id = VolumeId::new();
        let vol_dir = dir.path().join("vol");

        let (id, context, alias) = {
            let store = JournalVolumeStore::open(volume_id, &vol_dir, &config).unwrap();
            let (id, context) = stored_block(&store, b"durable");
            let alias = context.alias("bob", RefNonce::random());
            store.add_reference(&id, &alias).unwrap();
            store.archive_references(&id, &[alias.clone()]).unwrap();
            let (gone, _) = stored_block(&store, b"short lived");
            store
                .remove_references(&gone, &[BlockContext::primary("alice")])
                .unwrap();
            store.shutdown();
            (id, context, alias)
        };

        let store = JournalVolumeStore::open(volume_id, &vol_dir, &config).unwrap();
        let all = store.get_all().unwrap();
        assert_eq!(all.len(), 1);
        assert!(all[&id][&alias.ref_nonce].archived);
        assert_eq!(all[&id][&RefNonce::ZERO].live_count, 1);
        assert_eq!(store.get_data(&id, &context).unwrap().0.as_ref(), b"durable");
        assert_eq!(store.usage_bytes().unwrap(), 7);
    }

    #[test]
    fn test_compaction_preserves_ledger() {
        let dir = tempdir().unwrap();
        let config = BlockStoreConfig {
            max_journal_bytes: 256,
            ..BlockStoreConfig::at(dir.path())
        };
        let volume_id = VolumeId::new();
        let vol_dir = dir.path().join("vol");

        let expected = {
            let store = JournalVolumeStore::open(volume_id, &vol_dir, &config).unwrap();
            for n in 0..20u8 {
                let (id, context) = stored_block(&store, &[n; 16]);
                if n % 2 == 0 {
                    store.remove_references(&id, &[context]).unwrap();
                }
            }
            let snapshot = store.get_all().unwrap();
            store.shutdown();
            snapshot
        };
        let journal_len = std::fs::metadata(vol_dir.join(JOURNAL_FILE)).unwrap().len();
        assert!(journal_len < 20 * 200);

        let store = JournalVolumeStore::open(volume_id, &vol_dir, &config).unwrap();
        assert_eq!(store.get_all().unwrap(), expected);
        assert_eq!(expected.len(), 10);
    }

    #[test]
    fn test_failed_compaction_does_not_fail_the_mutation() {
        let dir = tempdir().unwrap();
        let config = BlockStoreConfig {
            max_journal_bytes: 64,
            ..BlockStoreConfig::at(dir.path())
        };
        let volume_id = VolumeId::new();
        let vol_dir = dir.path().join("vol");
        let blocker = vol_dir.join("refs.compact");
        std::fs::create_dir_all(&blocker).unwrap();
        std::fs::write(blocker.join("keep"), b"x").unwrap();

        let (id, alias) = {
            let store = JournalVolumeStore::open(volume_id, &vol_dir, &config).unwrap();
            let (id, context) = stored_block(&store, b"payload");
            let alias = context.alias("bob", RefNonce::random());
            store.add_reference(&id, &alias).unwrap();
            store.add_reference(&id, &alias).unwrap();
            assert_eq!(store.get_all().unwrap()[&id][&alias.ref_nonce].live_count, 2);
            store.shutdown();
            (id, alias)
        };

        let store = JournalVolumeStore::open(volume_id, &vol_dir, &config).unwrap();
        let all = store.get_all().unwrap();
        assert_eq!(all[&id][&alias.ref_nonce].live_count, 2);
        assert_eq!(all[&id][&RefNonce::ZERO].live_count, 1);
    }

    #[test]
    fn test_concurrent_reference_updates_are_atomic() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        let (id, context) = stored_block(&store, b"contended");
        let alias = context.alias("bob", RefNonce::random());
        let barrier = Barrier::new(8);

        thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    barrier.wait();
                    for _ in 0..25 {
                        store.add_reference(&id, &alias).unwrap();
                    }
                });
            }
        });
        assert_eq!(store.get_all().unwrap()[&id][&alias.ref_nonce].live_count, 200);

        // Half the threads add while the other half remove.
        thread::scope(|s| {
            for n in 0..8 {
                let (store, barrier, alias) = (&store, &barrier, &alias);
                s.spawn(move || {
                    barrier.wait();
                    for _ in 0..25 {
                        if n % 2 == 0 {
                            store.add_reference(&id, alias).unwrap();
                        } else {
                            store.remove_references(&id, &[alias.clone()]).unwrap();
                        }
                    }
                });
            }
        });
        let refs = &store.get_all().unwrap()[&id];
        assert_eq!(refs[&alias.ref_nonce].live_count, 200);
        assert_eq!(refs[&RefNonce::ZERO].live_count, 1);
    }

    #[test]
    fn test_remove_racing_reput_leaves_readable_block() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        let payload = b"collected and stored again";
        let id = BlockId::from_payload(payload);
        let context = BlockContext::primary("alice");
        let barrier = Barrier::new(2);

        for _ in 0..200 {
            store
                .put_data(&id, &context, payload, &BlockKeyHalf::random())
                .unwrap();
            thread::scope(|s| {
                s.spawn(|| {
                    barrier.wait();
                    store.remove_references(&id, &[context.clone()]).unwrap();
                });
                s.spawn(|| {
                    barrier.wait();
                    store
                        .put_data(&id, &context, payload, &BlockKeyHalf::random())
                        .unwrap();
                });
            });

            let all = store.get_all().unwrap();
            match all.get(&id) {
                Some(refs) => {
                    assert_eq!(refs[&RefNonce::ZERO].live_count, 1);
                    assert_eq!(store.get_data(&id, &context).unwrap().0.as_ref(), payload);
                    store.remove_references(&id, &[context.clone()]).unwrap();
                }
                None => assert!(!store.block_dir(&id).exists()),
            }
        }
    }

    #[test]
    fn test_shutdown_rejects_operations() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        let (id, context) = stored_block(&store, b"data");
        store.shutdown();
        store.shutdown();
        assert!(store.get_data(&id, &context).unwrap_err().is_shutdown());
        assert!(store.get_all().unwrap_err().is_shutdown());
    }
}
