//! The database header stored at page 0 of the data file.

use serde::Serialize;

use crate::primitives::bytes::{Deserializer, Serializer, SliceSource};
use crate::primitives::io::FileIo;
use crate::storage::page_manager::PageAllocator;
use crate::types::{crc32, DatabaseId, PageId, PageRange, Result, UmbraError, PAGE_SIZE};

/// Page holding the database header.
pub const DB_HEADER_PAGE: PageId = PageId(0);

/// Storage format version written by this build.
pub const STORAGE_VERSION: u64 = 1;

const MAGIC: &[u8; 5] = b"UMBRA";
const CRC_OFFSET: usize = PAGE_SIZE - 4;

/// Root of the last completed checkpoint.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct DatabaseHeader {
    /// Pages holding the serialized catalog.
    pub catalog_range: Option<PageRange>,
    /// Pages holding storage metadata followed by the free list.
    pub metadata_range: Option<PageRange>,
    /// Identifier binding the data file to its shadow file.
    pub database_id: DatabaseId,
}

impl DatabaseHeader {
    /// Header of a database with no catalog or metadata yet.
    pub fn new(database_id: DatabaseId) -> Self {
        Self {
            catalog_range: None,
            metadata_range: None,
            database_id,
        }
    }

    /// Serializes the header into a full page carrying a trailing CRC32.
    pub fn encode_page(&self) -> Result<Vec<u8>> {
        let mut page = Vec::with_capacity(PAGE_SIZE);
        let mut ser = Serializer::new(&mut page);
        ser.write_debugging_info("magic")?;
        ser.write_bytes(MAGIC)?;
        ser.write_debugging_info("storage_version")?;
        ser.write_u64(STORAGE_VERSION)?;
        ser.write_debugging_info("catalog")?;
        ser.write_page_range_opt(self.catalog_range)?;
        ser.write_debugging_info("metadata")?;
        ser.write_page_range_opt(self.metadata_range)?;
        ser.write_debugging_info("database_id")?;
        ser.write_bytes(&self.database_id.0)?;
        if page.len() > CRC_OFFSET {
            return Err(UmbraError::Invalid("database header exceeds one page"));
        }
        page.resize(PAGE_SIZE, 0);
        let crc = crc32(&[&page[..CRC_OFFSET]]);
        page[CRC_OFFSET..].copy_from_slice(&crc.to_be_bytes());
        Ok(page)
    }

    /// Parses a header page. An all-zero page means no header was ever
    /// written and yields `None`.
    pub fn decode_page(page: &[u8]) -> Result<Option<Self>> {
        if page.len() < PAGE_SIZE {
            return Err(UmbraError::Corruption("database header page truncated"));
        }
        if page.iter().all(|&b| b == 0) {
            return Ok(None);
        }
        let mut src = SliceSource::new(&page[..CRC_OFFSET]);
        let mut de = Deserializer::new(&mut src);
        if de.validate_debugging_info("magic").is_err() {
            return Err(UmbraError::WrongFile("magic bytes do not match"));
        }
        if de.read_array::<5>()? != *MAGIC {
            return Err(UmbraError::WrongFile("magic bytes do not match"));
        }
        de.validate_debugging_info("storage_version")?;
        let version = de.read_u64()?;
        if version != STORAGE_VERSION {
            return Err(UmbraError::VersionMismatch {
                found: version,
                expected: STORAGE_VERSION,
            });
        }
        let stored = u32::from_be_bytes([
            page[CRC_OFFSET],
            page[CRC_OFFSET + 1],
            page[CRC_OFFSET + 2],
            page[CRC_OFFSET + 3],
        ]);
        if crc32(&[&page[..CRC_OFFSET]]) != stored {
            return Err(UmbraError::Corruption("database header checksum mismatch"));
        }
        de.validate_debugging_info("catalog")?;
        let catalog_range = de.read_page_range_opt()?;
        de.validate_debugging_info("metadata")?;
        let metadata_range = de.read_page_range_opt()?;
        de.validate_debugging_info("database_id")?;
        let database_id = DatabaseId(de.read_array::<16>()?);
        Ok(Some(Self {
            catalog_range,
            metadata_range,
            database_id,
        }))
    }

    /// Reads the header from page 0 of `io`. An empty file has no header.
    pub fn read(io: &dyn FileIo) -> Result<Option<Self>> {
        let len = io.len()?;
        if len == 0 {
            return Ok(None);
        }
        if len < PAGE_SIZE as u64 {
            return Err(UmbraError::Corruption("data file shorter than its header page"));
        }
        let mut page = vec![0u8; PAGE_SIZE];
        io.read_at(DB_HEADER_PAGE.offset(), &mut page)?;
        Self::decode_page(&page)
    }

    /// Writes the header straight to page 0 and syncs. Only used when a
    /// database is created, before any shadow file can exist.
    pub fn write_initial(&self, io: &dyn FileIo) -> Result<()> {
        io.write_at(DB_HEADER_PAGE.offset(), &self.encode_page()?)?;
        io.sync_all()
    }

    /// Points the catalog at `range`, freeing the range it replaces.
    pub fn update_catalog_range(&mut self, alloc: &dyn PageAllocator, range: PageRange) {
        if let Some(old) = self.catalog_range.replace(range) {
            alloc.free_page_range(old);
        }
    }

    /// Frees the metadata range and clears it.
    pub fn free_metadata_range(&mut self, alloc: &dyn PageAllocator) {
        if let Some(old) = self.metadata_range.take() {
            alloc.free_page_range(old);
        }
    }
}
