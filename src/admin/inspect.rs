use std::path::Path;

use serde::Serialize;

use crate::admin::error::{AdminError, Result};
use crate::primitives::bytes::Deserializer;
use crate::primitives::io::{FileIo, OpenMode, StdVfs, Vfs};
use crate::primitives::wal::{wal_path_for, Wal, WalRecordKind};
use crate::storage::free_space::FreeSpaceManager;
use crate::storage::header::{DatabaseHeader, STORAGE_VERSION};
use crate::storage::paged_io::PagedReader;
use crate::storage::shadow::{read_shadow_file_header, shadow_path_for};
use crate::types::{PageRange, PAGE_SIZE};

/// Everything `umbra-inspect` prints about one database.
#[derive(Debug, Clone, Serialize)]
pub struct InspectReport {
    /// The data file.
    pub data: FileSection,
    /// Decoded header page; `None` for a file that was never initialised.
    pub header: Option<HeaderSection>,
    /// Shadow file left behind by an unfinished checkpoint, if any.
    pub shadow: ShadowSection,
    /// Write-ahead log.
    pub wal: WalSection,
    /// Free list persisted by the last checkpoint.
    pub free_space: FreeSpaceSection,
}

/// Path and size of one file.
#[derive(Debug, Clone, Serialize)]
pub struct FileSection {
    /// Path of the file.
    pub path: String,
    /// Whether the file exists.
    pub exists: bool,
    /// Length in bytes.
    pub size_bytes: u64,
    /// Length in pages, rounded up.
    pub num_pages: u64,
}

/// Fields of the database header page.
#[derive(Debug, Clone, Serialize)]
pub struct HeaderSection {
    /// Storage format version.
    pub storage_version: u64,
    /// Database UUID.
    pub database_id: String,
    /// Pages holding the catalog.
    pub catalog_range: Option<PageRange>,
    /// Pages holding storage metadata and the free list.
    pub metadata_range: Option<PageRange>,
}

/// State of the shadow file.
#[derive(Debug, Clone, Serialize)]
pub struct ShadowSection {
    /// The shadow file.
    pub file: FileSection,
    /// Database the shadow file was written for.
    pub database_id: Option<String>,
    /// Number of shadow pages it announces.
    pub num_shadow_pages: Option<u64>,
    /// Whether its database id matches the header; `None` when either is missing.
    pub matches_database: Option<bool>,
}

/// State of the write-ahead log.
#[derive(Debug, Clone, Serialize)]
pub struct WalSection {
    /// The log file.
    pub file: FileSection,
    /// Valid records before the first torn one.
    pub num_records: usize,
    /// Kind of the last valid record.
    pub last_record: Option<WalRecordKind>,
}

/// Persisted free list.
#[derive(Debug, Clone, Serialize)]
pub struct FreeSpaceSection {
    /// Free ranges ordered by start page.
    pub entries: Vec<PageRange>,
    /// Sum of the range lengths.
    pub free_pages: u64,
}

fn file_section(vfs: &dyn Vfs, path: &Path) -> Result<(FileSection, Option<std::sync::Arc<dyn FileIo>>)> {
    let exists = vfs.file_exists(path);
    let io = if exists {
        Some(vfs.open_file(path, OpenMode::ReadOnly)?)
    } else {
        None
    };
    let size_bytes = match &io {
        Some(io) => io.len()?,
        None => 0,
    };
    let section = FileSection {
        path: path.display().to_string(),
        exists,
        size_bytes,
        num_pages: size_bytes.div_ceil(PAGE_SIZE as u64),
    };
    Ok((section, io))
}

fn read_free_space(io: &dyn FileIo, range: PageRange, file_pages: u64) -> Result<FreeSpaceManager> {
    let mut reader = PagedReader::new(io, range);
    let mut de = Deserializer::new(&mut reader);
    de.validate_debugging_info("storage_metadata")?;
    de.read_blob(range.num_pages * PAGE_SIZE as u64)?;
    Ok(FreeSpaceManager::deserialize(&mut de, file_pages)?)
}

/// Reads the database at `path` without modifying any file.
///
/// # Errors
///
/// Returns [`AdminError::MissingDatabase`] when the data file does not exist,
/// and storage errors when the header or the free list fails validation.
pub fn inspect(path: impl AsRef<Path>) -> Result<InspectReport> {
    let path = path.as_ref();
    let vfs = StdVfs;
    let (data, io) = file_section(&vfs, path)?;
    let io = io.ok_or_else(|| AdminError::MissingDatabase(path.to_path_buf()))?;

    let header = DatabaseHeader::read(io.as_ref())?;
    let free = match header.and_then(|h| h.metadata_range) {
        Some(range) => read_free_space(io.as_ref(), range, data.num_pages)?,
        None => FreeSpaceManager::new(),
    };

    let (shadow_file, _) = file_section(&vfs, &shadow_path_for(path))?;
    let shadow_header = if shadow_file.exists {
        read_shadow_file_header(&vfs, path)?
    } else {
        None
    };

    let wal_path = wal_path_for(path);
    let (wal_file, _) = file_section(&vfs, &wal_path)?;
    let records = Wal::open(std::sync::Arc::new(StdVfs), &wal_path, true)?.records()?;

    Ok(InspectReport {
        data,
        header: header.map(|h| HeaderSection {
            storage_version: STORAGE_VERSION,
            database_id: h.database_id.to_string(),
            catalog_range: h.catalog_range,
            metadata_range: h.metadata_range,
        }),
        shadow: ShadowSection {
            file: shadow_file,
            database_id: shadow_header.map(|s| s.database_id.to_string()),
            num_shadow_pages: shadow_header.map(|s| s.num_shadow_pages),
            matches_database: shadow_header
                .zip(header)
                .map(|(s, h)| s.database_id == h.database_id),
        },
        wal: WalSection {
            file: wal_file,
            num_records: records.len(),
            last_record: records.last().map(|record| record.kind),
        },
        free_space: FreeSpaceSection {
            free_pages: free.num_free_pages(),
            entries: free.entries(),
        },
    })
}
