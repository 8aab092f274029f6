//! stratafs Block Layer
//!
//! Write buffering and local persistence for a content-addressed,
//! reference-counted block store.
//!
//! # Components
//!
//! - **Dirty block cache**: in-memory staging for modified blocks, with an
//!   admission controller bounding how many bytes may be buffered
//! - **Local block store**: per-volume payload storage with aliasing,
//!   archival and reference-count driven garbage collection
//!
//! # Data flow
//!
//! ```text
//!  writer ──request_permission_to_dirty──► AdmissionController
//!    │                                          ▲
//!    └── put ──► DirtyBlockCache                │ block_sync_finished /
//!                     │                         │ sync_finished
//!                     ▼                         │
//!               flush driver ──put──► LocalBlockStore
//!                                          │
//!                                   VolumeStoreRegistry
//!                                          │
//!                                   JournalVolumeStore (per volume)
//! ```

pub mod admission;
pub mod block_store;
pub mod clock;
pub mod dirty_cache;
pub mod error;
pub mod journal;
pub mod registry;
pub mod volume_store;

pub use admission::{AdmissionController, AdmissionStats, PermissionToken};
pub use block_store::{Cleanup, LocalBlockStore};
pub use clock::{Clock, ManualClock, WallClock};
pub use dirty_cache::{DirtyBlockCache, DirtyCacheStats};
pub use error::{BlockError, BlockResult};
pub use journal::{JournalEntry, JournalOp, RefJournal};
pub use registry::{JournalStoreFactory, VolumeStoreFactory, VolumeStoreRegistry};
pub use volume_store::{JournalVolumeStore, RefRecord, RefSnapshot, VolumeStorage};
