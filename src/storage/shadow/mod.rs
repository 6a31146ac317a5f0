//! Shadow paging.
//!
//! Every mutation of a page that belongs to the last checkpoint lands in a
//! copy inside `<db>.shadow` instead of the data file. The checkpoint copies
//! those pages over their originals only after the shadow file and the WAL
//! CHECKPOINT record are durable.
//!
//! Shadow file layout: page 0 holds a [`ShadowFileHeader`], pages
//! `1..=n` hold page bodies, and the record log starts right after them.
//! Record `i` describes shadow page `i + 1`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::primitives::buffer::{BufferManager, FileHandle};
use crate::primitives::bytes::{Deserializer, Serializer, SliceSource};
use crate::primitives::io::{FileIo, OpenMode, Vfs};
use crate::storage::header::{DatabaseHeader, DB_HEADER_PAGE};
use crate::types::{DatabaseId, FileIdx, PageId, Result, UmbraError, PAGE_SIZE};

/// Shadow-paging helpers shared by structures that mutate committed pages.
pub mod utils;

/// Buffer-manager index of the data file.
pub const DATA_FILE_IDX: FileIdx = FileIdx(0);

/// Buffer-manager index of the shadow file.
pub const SHADOW_FILE_IDX: FileIdx = FileIdx(1);

const MAX_SHADOW_RECORDS: u64 = 1 << 32;

/// Path of the shadow file belonging to `db_path`.
pub fn shadow_path_for(db_path: &Path) -> PathBuf {
    let mut name = db_path.as_os_str().to_os_string();
    name.push(".shadow");
    PathBuf::from(name)
}

/// Identifies the page a shadow page stands in for. A `None` page marks a
/// shadow page discarded by rollback.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct ShadowPageRecord {
    /// File holding the original page.
    pub original_file: FileIdx,
    /// Original page, or `None` once discarded.
    pub original_page: Option<PageId>,
}

impl ShadowPageRecord {
    fn serialize(&self, ser: &mut Serializer<'_>) -> Result<()> {
        ser.write_u32(self.original_file.0)?;
        ser.write_page_opt(self.original_page)
    }

    fn deserialize(de: &mut Deserializer<'_>) -> Result<Self> {
        Ok(Self {
            original_file: FileIdx(de.read_u32()?),
            original_page: de.read_page_opt()?,
        })
    }
}

/// Contents of page 0 of the shadow file.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct ShadowFileHeader {
    /// Database the shadow file was written for.
    pub database_id: DatabaseId,
    /// Number of page bodies following the header page.
    pub num_shadow_pages: u64,
}

impl ShadowFileHeader {
    fn encode(&self) -> Result<Vec<u8>> {
        let mut page = Vec::with_capacity(PAGE_SIZE);
        let mut ser = Serializer::new(&mut page);
        ser.write_debugging_info("database_id")?;
        ser.write_bytes(&self.database_id.0)?;
        ser.write_debugging_info("num_shadow_pages")?;
        ser.write_u64(self.num_shadow_pages)?;
        page.resize(PAGE_SIZE, 0);
        Ok(page)
    }

    fn decode(page: &[u8]) -> Result<Self> {
        let mut src = SliceSource::new(page);
        let mut de = Deserializer::new(&mut src);
        de.validate_debugging_info("database_id")?;
        let database_id = DatabaseId(de.read_array::<16>()?);
        de.validate_debugging_info("num_shadow_pages")?;
        let num_shadow_pages = de.read_u64()?;
        Ok(Self {
            database_id,
            num_shadow_pages,
        })
    }
}

fn read_header_page(io: &dyn FileIo) -> Result<ShadowFileHeader> {
    if io.len()? < PAGE_SIZE as u64 {
        return Err(UmbraError::Corruption("shadow file shorter than its header page"));
    }
    let mut page = vec![0u8; PAGE_SIZE];
    io.read_at(0, &mut page)?;
    ShadowFileHeader::decode(&page)
}

fn read_records(io: &dyn FileIo, header: &ShadowFileHeader) -> Result<Vec<ShadowPageRecord>> {
    let offset = (header.num_shadow_pages + 1) * PAGE_SIZE as u64;
    let len = io.len()?;
    if len < offset {
        return Err(UmbraError::Corruption("shadow file missing page bodies"));
    }
    let mut buf = vec![0u8; (len - offset) as usize];
    io.read_at(offset, &mut buf)?;
    let mut src = SliceSource::new(&buf);
    let mut de = Deserializer::new(&mut src);
    de.validate_debugging_info("shadow_records")?;
    let count = de.read_u64()?;
    if count != header.num_shadow_pages || count > MAX_SHADOW_RECORDS {
        return Err(UmbraError::Corruption("shadow record count mismatch"));
    }
    (0..count).map(|_| ShadowPageRecord::deserialize(&mut de)).collect()
}

/// Reads the header of the shadow file next to `db_path`, if one exists.
pub fn read_shadow_file_header(vfs: &dyn Vfs, db_path: &Path) -> Result<Option<ShadowFileHeader>> {
    let path = shadow_path_for(db_path);
    if !vfs.file_exists(&path) {
        return Ok(None);
    }
    let io = vfs.open_file(&path, OpenMode::ReadOnly)?;
    if io.is_empty()? {
        return Ok(None);
    }
    read_header_page(io.as_ref()).map(Some)
}

#[derive(Default)]
struct ShadowState {
    fh: Option<Arc<FileHandle>>,
    pages: HashMap<FileIdx, HashMap<PageId, PageId>>,
    records: Vec<ShadowPageRecord>,
}

/// Copy-on-write side file for one open database.
pub struct ShadowFile {
    path: PathBuf,
    vfs: Arc<dyn Vfs>,
    pool: Arc<BufferManager>,
    read_only: bool,
    state: Mutex<ShadowState>,
}

impl ShadowFile {
    /// Creates the shadow state for the database at `db_path`. No file is
    /// touched until the first shadow page is requested.
    pub fn new(db_path: &Path, vfs: Arc<dyn Vfs>, pool: Arc<BufferManager>, read_only: bool) -> Self {
        Self {
            path: shadow_path_for(db_path),
            vfs,
            pool,
            read_only,
            state: Mutex::new(ShadowState::default()),
        }
    }

    /// Path of the shadow file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_fh(&self, state: &mut ShadowState) -> Result<Arc<FileHandle>> {
        if let Some(fh) = &state.fh {
            return Ok(fh.clone());
        }
        if self.read_only {
            return Err(UmbraError::ReadOnly("cannot create a shadow file"));
        }
        let io = self.vfs.open_file(&self.path, OpenMode::ReadWriteCreate)?;
        io.truncate(0)?;
        let fh = FileHandle::open(SHADOW_FILE_IDX, &self.path, io, self.pool.clone(), false)?;
        fh.add_new_page()?;
        debug!(path = %self.path.display(), "shadow.file.create");
        state.fh = Some(fh.clone());
        Ok(fh)
    }

    /// Handle of the shadow file, creating the file if needed.
    pub fn shadowing_fh(&self) -> Result<Arc<FileHandle>> {
        let mut state = self.state.lock();
        self.ensure_fh(&mut state)
    }

    /// Returns true if `page` of `file` has a live shadow copy.
    pub fn has_shadow_page(&self, file: FileIdx, page: PageId) -> bool {
        self.shadow_page(file, page).is_some()
    }

    /// Shadow page standing in for `page` of `file`.
    pub fn shadow_page(&self, file: FileIdx, page: PageId) -> Option<PageId> {
        self.state
            .lock()
            .pages
            .get(&file)
            .and_then(|pages| pages.get(&page))
            .copied()
    }

    /// Returns the shadow page for `page` of `file`, allocating one and
    /// appending its record on first use.
    pub fn get_or_create_shadow_page(&self, file: FileIdx, page: PageId) -> Result<PageId> {
        let mut state = self.state.lock();
        if let Some(shadow) = state.pages.get(&file).and_then(|pages| pages.get(&page)) {
            return Ok(*shadow);
        }
        let fh = self.ensure_fh(&mut state)?;
        let shadow = fh.add_new_page()?;
        debug_assert_eq!(shadow.0, state.records.len() as u64 + 1);
        state.records.push(ShadowPageRecord {
            original_file: file,
            original_page: Some(page),
        });
        state.pages.entry(file).or_default().insert(page, shadow);
        debug!(file = file.0, page = page.0, shadow = shadow.0, "shadow.page.create");
        Ok(shadow)
    }

    /// Discards the shadow copy of `page`; its record becomes a tombstone.
    pub fn clear_shadow_page(&self, file: FileIdx, page: PageId) {
        let mut state = self.state.lock();
        let Some(shadow) = state.pages.get_mut(&file).and_then(|pages| pages.remove(&page)) else {
            return;
        };
        if let Some(record) = state.records.get_mut(shadow.0 as usize - 1) {
            record.original_page = None;
        }
        self.pool.remove_page_from_frame(SHADOW_FILE_IDX, shadow);
    }

    /// Number of shadow pages allocated in this generation, tombstones
    /// included.
    pub fn num_shadow_pages(&self) -> u64 {
        self.state.lock().records.len() as u64
    }

    /// Records of this generation in allocation order.
    pub fn records(&self) -> Vec<ShadowPageRecord> {
        self.state.lock().records.clone()
    }

    /// Persists the shadow pages, the header and the record log, then syncs.
    pub fn flush_all(&self, database_id: DatabaseId) -> Result<()> {
        let state = self.state.lock();
        let Some(fh) = state.fh.clone() else {
            return Ok(());
        };
        fh.flush_dirty_pages()?;
        let header = ShadowFileHeader {
            database_id,
            num_shadow_pages: state.records.len() as u64,
        };
        fh.write_page_to_file(PageId(0), &header.encode()?)?;

        let mut log = Vec::new();
        let mut ser = Serializer::new(&mut log);
        ser.write_debugging_info("shadow_records")?;
        ser.write_u64(state.records.len() as u64)?;
        for record in &state.records {
            record.serialize(&mut ser)?;
        }
        let offset = (header.num_shadow_pages + 1) * PAGE_SIZE as u64;
        fh.io().truncate(offset)?;
        fh.io().write_at(offset, &log)?;
        fh.sync()?;
        debug!(pages = header.num_shadow_pages, "shadow.flush_all");
        Ok(())
    }

    /// Copies every live shadow page over its original in `data_fh`,
    /// refreshing resident frames, and syncs the data file. Returns the
    /// number of pages applied.
    pub fn apply_shadow_pages(&self, data_fh: &FileHandle) -> Result<u64> {
        let state = self.state.lock();
        let Some(fh) = state.fh.clone() else {
            return Ok(0);
        };
        let mut applied = 0;
        for (i, record) in state.records.iter().enumerate() {
            let Some(original) = record.original_page else {
                continue;
            };
            if record.original_file != data_fh.file_idx() {
                return Err(UmbraError::Invalid("shadow record targets an unknown file"));
            }
            let mut page = vec![0u8; PAGE_SIZE];
            fh.read_page(PageId(i as u64 + 1), |bytes| page.copy_from_slice(bytes))?;
            data_fh.write_page_to_file(original, &page)?;
            data_fh
                .pool()
                .update_frame_if_resident(data_fh.file_idx(), original, &page)?;
            applied += 1;
        }
        data_fh.sync()?;
        info!(applied, "shadow.apply");
        Ok(applied)
    }

    /// Forgets every shadow page and truncates the file to its header page.
    pub fn clear(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.pages.clear();
        state.records.clear();
        if let Some(fh) = &state.fh {
            fh.reset_to_pages(1)?;
        }
        Ok(())
    }

    /// Closes and deletes the shadow file.
    pub fn reset(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.fh = None;
        state.pages.clear();
        state.records.clear();
        if !self.read_only {
            self.vfs.remove_file_if_exists(&self.path)?;
        }
        Ok(())
    }

    /// Database id the shadow file must match. A torn data header falls back
    /// to the shadowed copy of page 0, which replay is about to write back.
    fn replay_database_id(
        shadow_io: &dyn FileIo,
        data_io: &dyn FileIo,
        records: &[ShadowPageRecord],
    ) -> Result<DatabaseId> {
        let err = match DatabaseHeader::read(data_io) {
            Ok(Some(db_header)) => return Ok(db_header.database_id),
            Ok(None) => UmbraError::Corruption("shadow file found but the database has no header"),
            Err(err) => err,
        };
        let Some(slot) = records.iter().position(|record| {
            record.original_file == DATA_FILE_IDX && record.original_page == Some(DB_HEADER_PAGE)
        }) else {
            return Err(err);
        };
        let mut page = vec![0u8; PAGE_SIZE];
        shadow_io.read_at((slot as u64 + 1) * PAGE_SIZE as u64, &mut page)?;
        let shadowed = DatabaseHeader::decode_page(&page)?.ok_or(err)?;
        warn!(database_id = %shadowed.database_id, "shadow.replay.torn_header");
        Ok(shadowed.database_id)
    }

    /// Copies every page recorded in the shadow file next to `db_path` into
    /// the data file. The shadow file must carry the data file's database
    /// id. Running it again yields the same bytes. Returns the number of
    /// pages copied.
    pub fn replay_shadow_page_records(vfs: &dyn Vfs, db_path: &Path, read_only: bool) -> Result<u64> {
        let path = shadow_path_for(db_path);
        if !vfs.file_exists(&path) {
            return Ok(0);
        }
        if read_only {
            return Err(UmbraError::ReadOnly("shadow pages must be replayed before a read-only open"));
        }
        let shadow_io = vfs.open_file(&path, OpenMode::ReadOnly)?;
        let data_io = vfs.open_file(db_path, OpenMode::ReadWriteCreate)?;
        let header = read_header_page(shadow_io.as_ref())?;
        let records = read_records(shadow_io.as_ref(), &header)?;
        let expected = Self::replay_database_id(shadow_io.as_ref(), data_io.as_ref(), &records)?;
        if expected != header.database_id {
            warn!(
                expected = %expected,
                found = %header.database_id,
                "shadow.replay.foreign_file"
            );
            return Err(UmbraError::DatabaseIdMismatch {
                expected,
                found: header.database_id,
            });
        }
        let mut page = vec![0u8; PAGE_SIZE];
        let mut replayed = 0;
        for (i, record) in records.iter().enumerate() {
            let Some(original) = record.original_page else {
                continue;
            };
            shadow_io.read_at((i as u64 + 1) * PAGE_SIZE as u64, &mut page)?;
            data_io.write_at(original.offset(), &page)?;
            debug!(page = original.0, shadow = i + 1, "shadow.replay.page");
            replayed += 1;
        }
        data_io.sync_all()?;
        info!(replayed, path = %path.display(), "shadow.replay");
        Ok(replayed)
    }
}
