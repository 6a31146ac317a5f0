#![forbid(unsafe_code)]
//! Page identifiers, page ranges and the crate-wide error type.

use std::fmt;

use rand::{rngs::OsRng, RngCore};
use serde::Serialize;

/// Checksum helpers for headers and log records.
pub mod checksum;

pub use checksum::crc32;

/// Size in bytes of every page in the data file and the shadow file.
pub const PAGE_SIZE: usize = 4096;

/// On-disk encoding of an absent page index.
pub const NULL_PAGE_IDX: u64 = u64::MAX;

/// Physical page index within one file.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Serialize)]
#[serde(transparent)]
pub struct PageId(pub u64);

/// Index of a file registered with the buffer manager.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Serialize)]
#[serde(transparent)]
pub struct FileIdx(pub u32);

impl PageId {
    /// Byte offset of this page inside its file.
    pub fn offset(self) -> u64 {
        self.0 * PAGE_SIZE as u64
    }

    /// Encodes an optional page index, mapping `None` to [`NULL_PAGE_IDX`].
    pub fn encode_opt(page: Option<PageId>) -> u64 {
        page.map_or(NULL_PAGE_IDX, |p| p.0)
    }

    /// Decodes a raw page index, mapping [`NULL_PAGE_IDX`] to `None`.
    pub fn decode_opt(raw: u64) -> Option<PageId> {
        (raw != NULL_PAGE_IDX).then_some(PageId(raw))
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for FileIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A contiguous span of physical pages: the unit of allocation and freeing.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Serialize)]
pub struct PageRange {
    /// First page of the span.
    pub start: PageId,
    /// Number of pages in the span.
    pub num_pages: u64,
}

impl PageRange {
    /// Creates a range starting at `start` covering `num_pages` pages.
    pub fn new(start: PageId, num_pages: u64) -> Self {
        Self { start, num_pages }
    }

    /// One past the last page of the range.
    pub fn end(&self) -> u64 {
        self.start.0 + self.num_pages
    }

    /// Returns true if `page` lies inside the range.
    pub fn contains(&self, page: PageId) -> bool {
        page.0 >= self.start.0 && page.0 < self.end()
    }

    /// Extends `self` by `other` when `other` starts exactly where `self` ends.
    pub fn coalesce_with(&mut self, other: &PageRange) -> bool {
        if self.end() == other.start.0 {
            self.num_pages += other.num_pages;
            true
        } else {
            false
        }
    }

    /// Iterates every page of the range in ascending order.
    pub fn iter_pages(&self) -> impl Iterator<Item = PageId> + '_ {
        (self.start.0..self.end()).map(PageId)
    }
}

impl fmt::Display for PageRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, +{})", self.start.0, self.num_pages)
    }
}

/// Per-database UUID binding the data file to its shadow file.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
pub struct DatabaseId(pub [u8; 16]);

impl DatabaseId {
    /// Generates a random version-4 UUID.
    pub fn random() -> Self {
        let mut bytes = [0u8; 16];
        OsRng.fill_bytes(&mut bytes);
        bytes[6] = (bytes[6] & 0x0f) | 0x40;
        bytes[8] = (bytes[8] & 0x3f) | 0x80;
        Self(bytes)
    }
}

impl fmt::Display for DatabaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = hex::encode(self.0);
        write!(
            f,
            "{}-{}-{}-{}-{}",
            &hex[0..8],
            &hex[8..12],
            &hex[12..16],
            &hex[16..20],
            &hex[20..32]
        )
    }
}

impl Serialize for DatabaseId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Errors surfaced by the storage core.
#[derive(thiserror::Error, Debug)]
pub enum UmbraError {
    /// Filesystem failure, propagated unchanged.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// Persisted bytes failed validation.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Caller supplied an argument the operation cannot honour.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Requested item does not exist.
    #[error("not found")]
    NotFound,
    /// The file is not a database of this format.
    #[error("not an umbra database file: {0}")]
    WrongFile(&'static str),
    /// The file was written by an incompatible storage version.
    #[error("storage version mismatch: file has version {found}, this build reads {expected}")]
    VersionMismatch {
        /// Version recorded in the file.
        found: u64,
        /// Version this build understands.
        expected: u64,
    },
    /// The shadow file was written for another database.
    #[error("shadow file belongs to database {found}, expected {expected}")]
    DatabaseIdMismatch {
        /// Identifier stored in the data file header.
        expected: DatabaseId,
        /// Identifier stored in the shadow file header.
        found: DatabaseId,
    },
    /// Disk array access beyond the visible element count.
    #[error("index {idx} out of bounds for disk array of {len} elements")]
    OutOfBounds {
        /// Requested element index.
        idx: u64,
        /// Visible element count.
        len: u64,
    },
    /// A write was attempted on a read-only database.
    #[error("read-only database: {0}")]
    ReadOnly(&'static str),
    /// Configuration could not be loaded.
    #[error("config: {0}")]
    Config(String),
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, UmbraError>;
