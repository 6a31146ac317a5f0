//! Owner of every storage component of one open database.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{info, warn};

use crate::primitives::buffer::{BufferManager, FileHandle};
use crate::primitives::bytes::Deserializer;
use crate::primitives::io::{MemVfs, OpenMode, StdVfs, Vfs};
use crate::primitives::wal::{wal_path_for, Wal};
use crate::storage::header::DatabaseHeader;
use crate::storage::options::StorageOptions;
use crate::storage::paged_io::PagedReader;
use crate::storage::page_manager::{PageAllocator, PageManager};
use crate::storage::shadow::{shadow_path_for, ShadowFile, DATA_FILE_IDX};
use crate::types::{DatabaseId, Result, UmbraError, PAGE_SIZE};

/// What recovery did when the database was opened.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct RecoveryReport {
    /// Shadow pages copied into the data file.
    pub replayed_pages: u64,
    /// A shadow file from an unfinished checkpoint was deleted.
    pub discarded_shadow: bool,
    /// The WAL was deleted after a completed replay.
    pub wal_removed: bool,
}

/// Data file, shadow file, WAL, buffer pool and allocator of one database.
pub struct StorageManager {
    db_path: PathBuf,
    options: StorageOptions,
    vfs: Arc<dyn Vfs>,
    pool: Arc<BufferManager>,
    data_fh: Arc<FileHandle>,
    page_manager: Arc<PageManager>,
    shadow: Arc<ShadowFile>,
    wal: Wal,
    header: RwLock<DatabaseHeader>,
    persisted_storage_state: Mutex<Option<Vec<u8>>>,
    recovery: RecoveryReport,
}

impl StorageManager {
    /// Opens or creates the database at `path`, on disk or in memory
    /// depending on `options.in_memory`.
    pub fn open(path: impl AsRef<Path>, options: StorageOptions) -> Result<Self> {
        let vfs: Arc<dyn Vfs> = if options.in_memory {
            Arc::new(MemVfs::default())
        } else {
            Arc::new(StdVfs)
        };
        Self::open_with_vfs(path, options, vfs)
    }

    /// Opens or creates the database at `path` through `vfs`. Recovery runs
    /// before anything else reads the data file.
    pub fn open_with_vfs(path: impl AsRef<Path>, options: StorageOptions, vfs: Arc<dyn Vfs>) -> Result<Self> {
        let db_path = path.as_ref().to_path_buf();
        let read_only = options.read_only;
        let recovery = if options.in_memory {
            RecoveryReport::default()
        } else {
            recover(&vfs, &db_path, &options)?
        };

        let mode = if read_only {
            OpenMode::ReadOnly
        } else {
            OpenMode::ReadWriteCreate
        };
        let io = vfs.open_file(&db_path, mode)?;
        let header = match DatabaseHeader::read(io.as_ref())? {
            Some(header) => header,
            None if read_only => {
                return Err(UmbraError::ReadOnly("database has no header and cannot be created"))
            }
            None => {
                let header = DatabaseHeader::new(DatabaseId::random());
                header.write_initial(io.as_ref())?;
                info!(path = %db_path.display(), id = %header.database_id, "storage.create");
                header
            }
        };

        let pool = BufferManager::new(options.buffer_pool_pages);
        let data_fh = FileHandle::open(DATA_FILE_IDX, &db_path, io, pool.clone(), read_only)?;
        let shadow = Arc::new(ShadowFile::new(&db_path, vfs.clone(), pool.clone(), read_only));
        let wal = Wal::open(vfs.clone(), wal_path_for(&db_path), read_only)?;
        let page_manager = Arc::new(PageManager::new(data_fh.clone()));

        let mut persisted_storage_state = None;
        if let Some(range) = header.metadata_range {
            let mut reader = PagedReader::new(data_fh.io().as_ref(), range);
            let mut de = Deserializer::new(&mut reader);
            de.validate_debugging_info("storage_metadata")?;
            persisted_storage_state = Some(de.read_blob(range.num_pages * PAGE_SIZE as u64)?);
            page_manager.deserialize(&mut de)?;
        }
        info!(
            path = %db_path.display(),
            pages = data_fh.num_pages(),
            free_entries = page_manager.free_entries().len(),
            read_only,
            "storage.open"
        );

        Ok(Self {
            db_path,
            options,
            vfs,
            pool,
            data_fh,
            page_manager,
            shadow,
            wal,
            header: RwLock::new(header),
            persisted_storage_state: Mutex::new(persisted_storage_state),
            recovery,
        })
    }

    /// Path of the data file.
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Options the database was opened with.
    pub fn options(&self) -> &StorageOptions {
        &self.options
    }

    /// File system every file is opened through.
    pub fn vfs(&self) -> &Arc<dyn Vfs> {
        &self.vfs
    }

    /// Buffer pool shared by the data and shadow files.
    pub fn pool(&self) -> &Arc<BufferManager> {
        &self.pool
    }

    /// Handle of the data file.
    pub fn data_fh(&self) -> &Arc<FileHandle> {
        &self.data_fh
    }

    /// Page allocator of the data file.
    pub fn page_manager(&self) -> &Arc<PageManager> {
        &self.page_manager
    }

    /// The page manager as the allocator handed to on-disk structures.
    pub fn allocator(&self) -> &dyn PageAllocator {
        &*self.page_manager
    }

    /// Shadow file of the running transaction.
    pub fn shadow(&self) -> &Arc<ShadowFile> {
        &self.shadow
    }

    /// Write-ahead log.
    pub fn wal(&self) -> &Wal {
        &self.wal
    }

    /// Returns true if opened without write access.
    pub fn is_read_only(&self) -> bool {
        self.options.read_only
    }

    /// Returns true if every file lives in memory.
    pub fn is_in_memory(&self) -> bool {
        self.options.in_memory
    }

    /// Header of the last completed checkpoint.
    pub fn database_header(&self) -> DatabaseHeader {
        *self.header.read()
    }

    /// Replaces the in-memory header once a checkpoint has landed.
    pub fn set_database_header(&self, header: DatabaseHeader) {
        *self.header.write() = header;
    }

    /// Storage-state bytes read from the metadata range at open; handed out
    /// once.
    pub fn take_persisted_storage_state(&self) -> Option<Vec<u8>> {
        self.persisted_storage_state.lock().take()
    }

    /// Outcome of recovery at open.
    pub fn recovery(&self) -> RecoveryReport {
        self.recovery
    }
}

/// Brings the data file to the state of the last durable checkpoint.
///
/// * no WAL: a leftover shadow file never reached its CHECKPOINT record and
///   is deleted;
/// * WAL ending in CHECKPOINT: shadow pages are replayed, then WAL and
///   shadow file are deleted;
/// * otherwise the shadow file is deleted and the WAL left for the layer
///   above.
pub fn recover(vfs: &Arc<dyn Vfs>, db_path: &Path, options: &StorageOptions) -> Result<RecoveryReport> {
    let mut report = RecoveryReport::default();
    let wal_path = wal_path_for(db_path);
    let shadow_path = shadow_path_for(db_path);
    let shadow_exists = vfs.file_exists(&shadow_path);

    let checkpoint_pending = vfs.file_exists(&wal_path)
        && Wal::open(vfs.clone(), &wal_path, true)?.last_record_is_checkpoint()?;

    if checkpoint_pending {
        if options.read_only {
            return Err(UmbraError::ReadOnly("database needs recovery before a read-only open"));
        }
        match ShadowFile::replay_shadow_page_records(vfs.as_ref(), db_path, false) {
            Ok(replayed) => report.replayed_pages = replayed,
            Err(err) if !options.throw_on_wal_replay_failure => {
                warn!(error = %err, "storage.recovery.replay_failed");
                report.discarded_shadow = shadow_exists;
            }
            Err(err) => return Err(err),
        }
        vfs.remove_file_if_exists(&shadow_path)?;
        vfs.remove_file_if_exists(&wal_path)?;
        report.wal_removed = true;
        info!(replayed = report.replayed_pages, "storage.recovery.replayed");
    } else if shadow_exists {
        if options.read_only {
            warn!(path = %shadow_path.display(), "storage.recovery.stale_shadow_kept");
        } else {
            vfs.remove_file_if_exists(&shadow_path)?;
            report.discarded_shadow = true;
            info!(path = %shadow_path.display(), "storage.recovery.shadow_discarded");
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::header::DB_HEADER_PAGE;
    use tempfile::tempdir;

    #[test]
    fn create_writes_header_and_reopen_keeps_id() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");
        let id = {
            let storage = StorageManager::open(&path, StorageOptions::default())?;
            assert_eq!(storage.data_fh().num_pages(), 1);
            assert!(storage.database_header().catalog_range.is_none());
            storage.database_header().database_id
        };
        let storage = StorageManager::open(&path, StorageOptions::default())?;
        assert_eq!(storage.database_header().database_id, id);
        assert_eq!(storage.recovery(), RecoveryReport::default());
        let on_disk = storage
            .data_fh()
            .read_page(DB_HEADER_PAGE, DatabaseHeader::decode_page)??;
        assert_eq!(on_disk.map(|h| h.database_id), Some(id));
        Ok(())
    }

    #[test]
    fn read_only_open_never_creates() {
        let dir = tempdir().unwrap();
        let options = StorageOptions {
            read_only: true,
            ..StorageOptions::default()
        };
        assert!(StorageManager::open(dir.path().join("missing"), options).is_err());
        assert!(!dir.path().join("missing").exists());
    }

    #[test]
    fn stale_shadow_file_is_discarded() -> Result<()> {
        crate::init_tracing();
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");
        drop(StorageManager::open(&path, StorageOptions::default())?);
        std::fs::write(shadow_path_for(&path), vec![1u8; PAGE_SIZE])?;
        let storage = StorageManager::open(&path, StorageOptions::default())?;
        assert!(storage.recovery().discarded_shadow);
        assert!(!shadow_path_for(&path).exists());
        Ok(())
    }

    #[test]
    fn in_memory_storage_touches_no_files() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");
        let options = StorageOptions {
            in_memory: true,
            ..StorageOptions::default()
        };
        let storage = StorageManager::open(&path, options)?;
        assert!(storage.is_in_memory());
        assert!(!path.exists());
        Ok(())
    }
}
