//! The checkpoint protocol.
//!
//! A checkpoint runs five steps: flush pending storage changes, serialize
//! the catalog and metadata into fresh page ranges, write the new header
//! through a shadow page, make the shadow file and a WAL CHECKPOINT record
//! durable and apply the shadow pages, then finalize in-memory state. The data
//! file is only modified after the CHECKPOINT record is durable; a failure
//! before that leaves it untouched and the caller calls
//! [`Checkpointer::rollback`].

use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use crate::primitives::bytes::{Deserializer, Serializer, SliceSource};
use crate::storage::header::{DatabaseHeader, DB_HEADER_PAGE};
use crate::storage::manager::StorageManager;
use crate::storage::page_manager::PageAllocator;
use crate::storage::paged_io::{InMemFileWriter, PagedReader};
use crate::storage::shadow::utils;
use crate::storage::txn::{Transaction, TxnKind};
use crate::types::{Result, UmbraError, PAGE_SIZE};

/// Schema state persisted in the catalog range.
pub trait CatalogState: Send + Sync {
    /// Writes the catalog.
    fn serialize(&self, ser: &mut Serializer<'_>) -> Result<()>;
    /// Replaces the catalog with one read from `de`.
    fn deserialize(&self, de: &mut Deserializer<'_>) -> Result<()>;
    /// Returns true if the catalog changed since the last checkpoint.
    fn changed_since_last_checkpoint(&self) -> bool;
    /// Marks the catalog as checkpointed.
    fn reset_version(&self);
}

/// Structures that keep in-memory deltas until a checkpoint lands.
pub trait StorageState: Send + Sync {
    /// Writes pending changes to pages through shadow paging. Returns true
    /// if anything changed.
    fn checkpoint(&self, storage: &StorageManager) -> Result<bool>;
    /// Writes the metadata needed to reopen the structures.
    fn serialize(&self, ser: &mut Serializer<'_>) -> Result<()>;
    /// Reopens the structures from metadata written by `serialize`.
    fn deserialize(&self, storage: &StorageManager, de: &mut Deserializer<'_>) -> Result<()>;
    /// Promotes pending changes to the committed view.
    fn finalize_checkpoint(&self, storage: &StorageManager) -> Result<()>;
    /// Discards pending changes.
    fn rollback_checkpoint(&self, storage: &StorageManager) -> Result<()>;
}

/// Outcome of one checkpoint.
#[derive(Clone, Debug, Default, Serialize)]
pub struct CheckpointReport {
    /// Whether the storage layer had changes to write.
    pub storage_changed: bool,
    /// Whether the catalog was rewritten.
    pub catalog_written: bool,
    /// Whether the metadata range was rewritten.
    pub metadata_written: bool,
    /// Shadow pages copied into the data file.
    pub shadow_pages_applied: u64,
    /// Pages that became free when the checkpoint landed.
    pub pages_freed: u64,
    /// Pages cut from the end of the data file.
    pub pages_truncated: u64,
    /// WAL bytes dropped.
    pub wal_bytes_reclaimed: u64,
    /// Wall-clock duration in milliseconds.
    pub elapsed_ms: u64,
}

/// Runs checkpoints and rollbacks for one storage manager.
pub struct Checkpointer<'a> {
    storage: &'a StorageManager,
    catalog: &'a dyn CatalogState,
    state: &'a dyn StorageState,
}

impl<'a> Checkpointer<'a> {
    /// Creates a checkpointer over `storage` persisting `catalog` and `state`.
    pub fn new(storage: &'a StorageManager, catalog: &'a dyn CatalogState, state: &'a dyn StorageState) -> Self {
        Self {
            storage,
            catalog,
            state,
        }
    }

    /// Runs a full checkpoint. In-memory databases skip it.
    pub fn write_checkpoint(&self) -> Result<CheckpointReport> {
        if self.storage.is_in_memory() {
            return Ok(CheckpointReport::default());
        }
        if self.storage.is_read_only() {
            return Err(UmbraError::ReadOnly("cannot checkpoint"));
        }
        let started = Instant::now();
        let mut report = CheckpointReport {
            wal_bytes_reclaimed: self.storage.wal().size()?,
            ..CheckpointReport::default()
        };

        report.storage_changed = self.checkpoint_storage()?;
        let mut header = self.storage.database_header();
        let (catalog_written, metadata_written) =
            self.serialize_catalog_and_metadata(&mut header, report.storage_changed)?;
        report.catalog_written = catalog_written;
        report.metadata_written = metadata_written;
        self.write_database_header(&header)?;
        report.shadow_pages_applied = self.log_checkpoint_and_apply_shadow_pages(&header)?;
        report.pages_freed = self
            .storage
            .page_manager()
            .pending_free_entries()
            .iter()
            .map(|range| range.num_pages)
            .sum();
        report.pages_truncated = self.finalize_checkpoint(header)?;
        report.elapsed_ms = started.elapsed().as_millis() as u64;

        info!(
            applied = report.shadow_pages_applied,
            freed = report.pages_freed,
            truncated = report.pages_truncated,
            catalog = report.catalog_written,
            metadata = report.metadata_written,
            elapsed_ms = report.elapsed_ms,
            "storage.checkpoint.applied"
        );
        Ok(report)
    }

    /// Step 1: flushes pending in-memory mutations into on-disk structures.
    pub fn checkpoint_storage(&self) -> Result<bool> {
        self.state.checkpoint(self.storage)
    }

    /// Step 2: writes the catalog and the metadata range when they changed,
    /// freeing the ranges they replace. Returns which of the two were
    /// written.
    ///
    /// The metadata range holds the storage state followed by the free
    /// list. The free list is measured before its own pages are allocated;
    /// allocation never adds entries, so the measurement is an upper bound.
    pub fn serialize_catalog_and_metadata(
        &self,
        header: &mut DatabaseHeader,
        has_changes: bool,
    ) -> Result<(bool, bool)> {
        let pm = self.storage.page_manager();
        let alloc = self.storage.allocator();
        let shadow = self.storage.shadow();

        let catalog_written =
            self.catalog.changed_since_last_checkpoint() || header.catalog_range.is_none();
        if catalog_written {
            let mut writer = InMemFileWriter::new();
            let mut ser = Serializer::new(&mut writer);
            ser.write_debugging_info("catalog")?;
            self.catalog.serialize(&mut ser)?;
            let range = writer.flush_new(alloc, shadow)?;
            header.update_catalog_range(alloc, range);
            debug!(%range, "storage.checkpoint.catalog");
        }

        let metadata_written =
            has_changes || pm.changed_since_last_checkpoint() || header.metadata_range.is_none();
        if metadata_written {
            header.free_metadata_range(alloc);
            let mut state_bytes = Vec::new();
            self.state.serialize(&mut Serializer::new(&mut state_bytes))?;

            let mut writer = InMemFileWriter::new();
            let mut ser = Serializer::new(&mut writer);
            ser.write_debugging_info("storage_metadata")?;
            ser.write_blob(&state_bytes)?;
            let fsm_bytes = pm.max_bytes_for_serialization()?;
            let num_pages = (writer.len() + fsm_bytes).div_ceil(PAGE_SIZE as u64).max(1);
            let range = alloc.allocate_page_range(num_pages)?;
            pm.serialize(&mut Serializer::new(&mut writer))?;
            writer.flush(range, alloc.data_fh(), shadow)?;
            header.metadata_range = Some(range);
            debug!(%range, "storage.checkpoint.metadata");
        }
        Ok((catalog_written, metadata_written))
    }

    /// Step 3: writes `header` into the shadow copy of the header page.
    pub fn write_database_header(&self, header: &DatabaseHeader) -> Result<()> {
        let bytes = header.encode_page()?;
        utils::update_page(
            self.storage.data_fh(),
            DB_HEADER_PAGE,
            true,
            self.storage.shadow(),
            |page| page.copy_from_slice(&bytes),
        )
    }

    /// Step 4: makes the shadow file and a CHECKPOINT record durable, then
    /// copies the shadow pages into the data file. Returns the number of
    /// pages applied.
    pub fn log_checkpoint_and_apply_shadow_pages(&self, header: &DatabaseHeader) -> Result<u64> {
        let data_fh = self.storage.data_fh();
        data_fh.flush_dirty_pages()?;
        data_fh.sync()?;
        let shadow = self.storage.shadow();
        shadow.flush_all(header.database_id)?;
        self.storage.wal().log_and_flush_checkpoint()?;
        shadow.apply_shadow_pages(data_fh)
    }

    /// Step 5: drops the WAL and shadow file, merges pending frees and
    /// promotes in-memory state. The WAL is gone before the data file is
    /// truncated so that recovery never replays past the new end. Returns
    /// the number of pages truncated.
    pub fn finalize_checkpoint(&self, header: DatabaseHeader) -> Result<u64> {
        self.storage.wal().reset()?;
        self.storage.shadow().reset()?;
        let pm = self.storage.page_manager();
        let truncated = pm.finalize_checkpoint()?;
        self.state.finalize_checkpoint(self.storage)?;
        self.storage.set_database_header(header);
        self.catalog.reset_version();
        pm.reset_version();
        Ok(truncated)
    }

    /// Undoes a checkpoint that failed before step 4 completed: pending
    /// frees are forgotten, pages allocated since the last checkpoint are
    /// returned, storage deltas are dropped and the shadow file is deleted.
    pub fn rollback(&self) -> Result<()> {
        self.state.rollback_checkpoint(self.storage)?;
        self.storage.page_manager().rollback_checkpoint()?;
        self.storage.shadow().reset()?;
        info!("storage.checkpoint.rolled_back");
        Ok(())
    }

    /// Reads the catalog and storage state of the last checkpoint.
    pub fn read_checkpoint(&self) -> Result<()> {
        let header = self.storage.database_header();
        if let Some(range) = header.catalog_range {
            let io = self.storage.data_fh().io();
            let mut reader = PagedReader::new(io.as_ref(), range);
            let mut de = Deserializer::new(&mut reader);
            de.validate_debugging_info("catalog")?;
            self.catalog.deserialize(&mut de)?;
        }
        if let Some(bytes) = self.storage.take_persisted_storage_state() {
            let mut src = SliceSource::new(&bytes);
            self.state
                .deserialize(self.storage, &mut Deserializer::new(&mut src))?;
        }
        Ok(())
    }
}

/// Returns true if `txn` should trigger a checkpoint: never for in-memory or
/// read-only storage, with auto-checkpoint disabled, or during recovery;
/// otherwise once local plus persistent WAL bytes exceed the threshold.
pub fn can_auto_checkpoint(storage: &StorageManager, txn: &Transaction) -> Result<bool> {
    let options = storage.options();
    if options.in_memory || options.read_only || !options.auto_checkpoint {
        return Ok(false);
    }
    if txn.kind() == TxnKind::Recovery {
        return Ok(false);
    }
    Ok(txn.local_wal_bytes() + storage.wal().size()? > options.checkpoint_threshold)
}

/// Catalog kept as one opaque byte string.
#[derive(Debug, Default)]
pub struct BlobCatalog {
    inner: Mutex<(Vec<u8>, u64)>,
}

impl BlobCatalog {
    /// Current catalog bytes.
    pub fn get(&self) -> Vec<u8> {
        self.inner.lock().0.clone()
    }

    /// Replaces the catalog bytes.
    pub fn set(&self, bytes: impl Into<Vec<u8>>) {
        let mut inner = self.inner.lock();
        inner.0 = bytes.into();
        inner.1 += 1;
    }
}

impl CatalogState for BlobCatalog {
    fn serialize(&self, ser: &mut Serializer<'_>) -> Result<()> {
        ser.write_blob(&self.inner.lock().0)
    }

    fn deserialize(&self, de: &mut Deserializer<'_>) -> Result<()> {
        let bytes = de.read_blob(u32::MAX as u64)?;
        *self.inner.lock() = (bytes, 0);
        Ok(())
    }

    fn changed_since_last_checkpoint(&self) -> bool {
        self.inner.lock().1 > 0
    }

    fn reset_version(&self) {
        self.inner.lock().1 = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::wal::wal_path_for;
    use crate::storage::array_store::ArrayStore;
    use crate::storage::options::StorageOptions;
    use crate::storage::shadow::{shadow_path_for, ShadowFile};
    use std::fs;
    use std::path::Path;
    use tempfile::tempdir;

    fn copy_files(from: &Path, to: &Path) -> Result<()> {
        fs::copy(from, to)?;
        fs::copy(shadow_path_for(from), shadow_path_for(to))?;
        fs::copy(wal_path_for(from), wal_path_for(to))?;
        Ok(())
    }

    #[test]
    fn replay_after_crash_matches_applied_checkpoint() -> Result<()> {
        crate::init_tracing();
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");
        let crashed = dir.path().join("crashed");
        let storage = StorageManager::open(&path, StorageOptions::default())?;
        let catalog = BlobCatalog::default();
        let store = ArrayStore::new(true);
        let checkpointer = Checkpointer::new(&storage, &catalog, &store);
        checkpointer.write_checkpoint()?;

        let (_, array) = store.create_array::<u64>(&storage)?;
        array.resize(storage.allocator(), TxnKind::Write, 2000, 3)?;
        checkpointer.write_checkpoint()?;
        array.update(TxnKind::Write, 1999, 42)?;
        catalog.set(b"schema v2".to_vec());

        let changed = checkpointer.checkpoint_storage()?;
        let mut header = storage.database_header();
        checkpointer.serialize_catalog_and_metadata(&mut header, changed)?;
        checkpointer.write_database_header(&header)?;
        let data_fh = storage.data_fh();
        data_fh.flush_dirty_pages()?;
        storage.shadow().flush_all(header.database_id)?;
        storage.wal().log_and_flush_checkpoint()?;
        copy_files(&path, &crashed)?;

        storage.shadow().apply_shadow_pages(data_fh)?;
        let applied = fs::read(&path)?;

        ShadowFile::replay_shadow_page_records(storage.vfs().as_ref(), &crashed, false)?;
        let once = fs::read(&crashed)?;
        ShadowFile::replay_shadow_page_records(storage.vfs().as_ref(), &crashed, false)?;
        let twice = fs::read(&crashed)?;
        assert_eq!(once, applied);
        assert_eq!(twice, once);
        Ok(())
    }

    #[test]
    fn rollback_leaves_data_file_untouched() -> Result<()> {
        crate::init_tracing();
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");
        let storage = StorageManager::open(&path, StorageOptions::default())?;
        let catalog = BlobCatalog::default();
        let store = ArrayStore::new(true);
        let checkpointer = Checkpointer::new(&storage, &catalog, &store);
        let (_, array) = store.create_array::<u32>(&storage)?;
        array.resize(storage.allocator(), TxnKind::Write, 100, 1)?;
        checkpointer.write_checkpoint()?;
        let before = fs::read(&path)?;
        let pages_before = storage.data_fh().num_pages();

        array.update(TxnKind::Write, 5, 9)?;
        array.resize(storage.allocator(), TxnKind::Write, 20_000, 2)?;
        catalog.set(b"changed".to_vec());
        let changed = checkpointer.checkpoint_storage()?;
        let mut header = storage.database_header();
        checkpointer.serialize_catalog_and_metadata(&mut header, changed)?;
        checkpointer.write_database_header(&header)?;
        checkpointer.rollback()?;

        assert_eq!(storage.data_fh().num_pages(), pages_before);
        assert_eq!(fs::read(&path)?, before);
        assert_eq!(array.num_elements(TxnKind::Write), 100);
        assert_eq!(array.get(5, TxnKind::Write)?, 1);
        assert!(!shadow_path_for(&path).exists());
        assert_eq!(storage.pool().pinned_pages(), 0);
        Ok(())
    }

    #[test]
    fn auto_checkpoint_gate() -> Result<()> {
        let dir = tempdir().unwrap();
        let options = StorageOptions {
            checkpoint_threshold: 100,
            ..StorageOptions::default()
        };
        let storage = StorageManager::open(dir.path().join("db"), options)?;
        let mut txn = Transaction::new(TxnKind::Write);
        assert!(!can_auto_checkpoint(&storage, &txn)?);
        txn.add_local_wal_bytes(60);
        storage.wal().log_record(&[0u8; 64])?;
        assert!(can_auto_checkpoint(&storage, &txn)?);

        let mut recovery = Transaction::new(TxnKind::Recovery);
        recovery.add_local_wal_bytes(1000);
        assert!(!can_auto_checkpoint(&storage, &recovery)?);

        let mem = StorageManager::open(
            dir.path().join("mem"),
            StorageOptions {
                in_memory: true,
                ..StorageOptions::default()
            },
        )?;
        assert!(!can_auto_checkpoint(&mem, &txn)?);
        Ok(())
    }
}
