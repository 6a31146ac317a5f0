//! Shadow-paged storage: disk arrays, free space, checkpoints and recovery.
//!
//! Every mutation of a page that is already durable lands in a shadow copy.
//! A checkpoint makes the shadow file and a WAL CHECKPOINT record durable,
//! then copies the shadow pages into the data file.

/// Disk arrays registered as checkpointed storage state.
pub mod array_store;

/// The five-step checkpoint protocol and its collaborator traits.
pub mod checkpoint;

/// Growable fixed-element arrays addressed through page index pages.
pub mod disk_array;

/// Size-class free lists of page ranges.
pub mod free_space;

/// The database header at page 0.
pub mod header;

/// Owner of the files, buffer pool and allocator of one database.
pub mod manager;

/// Storage configuration.
pub mod options;

/// Page allocation on top of the free-space manager.
pub mod page_manager;

/// Page-spanning serialization sinks and sources.
pub mod paged_io;

/// Copy-on-write side file and its page helpers.
pub mod shadow;

/// Transaction kinds as seen by storage.
pub mod txn;

pub use array_store::ArrayStore;
pub use checkpoint::{
    can_auto_checkpoint, BlobCatalog, CatalogState, CheckpointReport, Checkpointer, StorageState,
};
pub use disk_array::{ArrayElement, DiskArray, DiskArrayCollection, DiskArrayHeader, WriteIterator};
pub use free_space::FreeSpaceManager;
pub use header::DatabaseHeader;
pub use manager::{recover, RecoveryReport, StorageManager};
pub use options::StorageOptions;
pub use page_manager::{PageAllocator, PageManager};
pub use shadow::ShadowFile;
pub use txn::{Transaction, TxnKind};
