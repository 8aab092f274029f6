//! Lazily opened per-volume stores

use crate::error::{BlockError, BlockResult};
use crate::volume_store::{JournalVolumeStore, VolumeStorage};

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use stratafs_common::{BlockStoreConfig, VolumeId};
use tracing::{debug, info};

const COMPONENT: &str = "Volume registry";

/// Opens the store for a volume the first time it is used
pub trait VolumeStoreFactory: Send + Sync {
    fn open(&self, volume_id: &VolumeId) -> BlockResult<Arc<dyn VolumeStorage>>;
}

impl<F> VolumeStoreFactory for F
where
    F: Fn(&VolumeId) -> BlockResult<Arc<dyn VolumeStorage>> + Send + Sync,
{
    fn open(&self, volume_id: &VolumeId) -> BlockResult<Arc<dyn VolumeStorage>> {
        self(volume_id)
    }
}

/// Factory placing each volume's [`JournalVolumeStore`] under `root_dir/<volume id>`
#[derive(Debug, Clone)]
pub struct JournalStoreFactory {
    config: BlockStoreConfig,
}

impl JournalStoreFactory {
    #[must_use]
    pub const fn new(config: BlockStoreConfig) -> Self {
        Self { config }
    }
}

impl VolumeStoreFactory for JournalStoreFactory {
    fn open(&self, volume_id: &VolumeId) -> BlockResult<Arc<dyn VolumeStorage>> {
        let dir = self.config.root_dir.join(volume_id.to_string());
        let store = JournalVolumeStore::open(*volume_id, dir, &self.config)?;
        Ok(Arc::new(store))
    }
}

/// Map of open volume stores
///
/// Lookups take the read lock; only a miss takes the write lock, and the map
/// is checked again under it so each volume is opened at most once.
pub struct VolumeStoreRegistry {
    factory: Box<dyn VolumeStoreFactory>,
    /// `None` after shutdown
    stores: RwLock<Option<HashMap<VolumeId, Arc<dyn VolumeStorage>>>>,
}

impl VolumeStoreRegistry {
    pub fn new(factory: impl VolumeStoreFactory + 'static) -> Self {
        Self {
            factory: Box::new(factory),
            stores: RwLock::new(Some(HashMap::new())),
        }
    }

    /// Get the store for `volume_id`, opening it if needed
    pub fn get_or_open(&self, volume_id: &VolumeId) -> BlockResult<Arc<dyn VolumeStorage>> {
        {
            let stores = self.stores.read();
            let stores = stores.as_ref().ok_or(BlockError::Shutdown(COMPONENT))?;
            if let Some(store) = stores.get(volume_id) {
                return Ok(Arc::clone(store));
            }
        }

        let mut stores = self.stores.write();
        let stores = stores.as_mut().ok_or(BlockError::Shutdown(COMPONENT))?;
        if let Some(store) = stores.get(volume_id) {
            return Ok(Arc::clone(store));
        }

        let store = self.factory.open(volume_id)?;
        debug!("Opened store for volume {}", volume_id);
        stores.insert(*volume_id, Arc::clone(&store));
        Ok(store)
    }

    /// Snapshot of the open stores
    pub fn stores(&self) -> BlockResult<Vec<Arc<dyn VolumeStorage>>> {
        let stores = self.stores.read();
        let stores = stores.as_ref().ok_or(BlockError::Shutdown(COMPONENT))?;
        Ok(stores.values().cloned().collect())
    }

    /// Number of open stores
    pub fn len(&self) -> usize {
        self.stores.read().as_ref().map_or(0, HashMap::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shut down every open store; returns false if already shut down
    pub fn shutdown(&self) -> bool {
        let Some(stores) = self.stores.write().take() else {
            return false;
        };
        info!("Shutting down {} volume stores", stores.len());
        for store in stores.values() {
            store.shutdown();
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use tempfile::tempdir;

    fn counting_factory(
        config: BlockStoreConfig,
        opened: Arc<AtomicUsize>,
    ) -> impl VolumeStoreFactory + 'static {
        let inner = JournalStoreFactory::new(config);
        move |volume_id: &VolumeId| {
            opened.fetch_add(1, Ordering::SeqCst);
            inner.open(volume_id)
        }
    }

    #[test]
    fn test_same_volume_returns_same_store() {
        let dir = tempdir().unwrap();
        let opened = Arc::new(AtomicUsize::new(0));
        let registry = VolumeStoreRegistry::new(counting_factory(
            BlockStoreConfig::at(dir.path()),
            Arc::clone(&opened),
        ));
        let volume = VolumeId::new();

        let a = registry.get_or_open(&volume).unwrap();
        let b = registry.get_or_open(&volume).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(opened.load(Ordering::SeqCst), 1);

        registry.get_or_open(&VolumeId::new()).unwrap();
        assert_eq!(registry.len(), 2);
        assert!(dir.path().join(volume.to_string()).is_dir());
    }

    #[test]
    fn test_concurrent_open_runs_factory_once() {
        let dir = tempdir().unwrap();
        let opened = Arc::new(AtomicUsize::new(0));
        let registry = VolumeStoreRegistry::new(counting_factory(
            BlockStoreConfig::at(dir.path()),
            Arc::clone(&opened),
        ));
        let volume = VolumeId::new();
        let barrier = Barrier::new(8);

        let stores: Vec<_> = thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        registry.get_or_open(&volume).unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(opened.load(Ordering::SeqCst), 1);
        assert!(stores.iter().all(|s| Arc::ptr_eq(s, &stores[0])));
    }

    #[test]
    fn test_factory_error_is_not_cached() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let registry = VolumeStoreRegistry::new(move |_: &VolumeId| -> BlockResult<Arc<dyn VolumeStorage>> {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(BlockError::invalid_argument("no such volume"))
        });
        let volume = VolumeId::new();

        assert!(registry.get_or_open(&volume).is_err());
        assert!(registry.get_or_open(&volume).is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_shutdown() {
        let dir = tempdir().unwrap();
        let registry = VolumeStoreRegistry::new(JournalStoreFactory::new(BlockStoreConfig::at(
            dir.path(),
        )));
        let store = registry.get_or_open(&VolumeId::new()).unwrap();

        assert!(registry.shutdown());
        assert!(!registry.shutdown());
        assert!(matches!(
            registry.get_or_open(&VolumeId::new()),
            Err(e) if e.is_shutdown()
        ));
        assert!(store.get_all().unwrap_err().is_shutdown());
        assert_eq!(registry.len(), 0);
    }
}
