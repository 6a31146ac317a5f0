//! Byte streams spanning whole page ranges of the data file.

use crate::primitives::buffer::FileHandle;
use crate::primitives::bytes::{ByteSink, ByteSource};
use crate::primitives::io::FileIo;
use crate::storage::page_manager::PageAllocator;
use crate::storage::shadow::{utils, ShadowFile};
use crate::types::{PageId, PageRange, Result, UmbraError, PAGE_SIZE};

/// Collects serialized bytes in memory and writes them to a page range
/// through shadow pages.
#[derive(Debug, Default)]
pub struct InMemFileWriter {
    buf: Vec<u8>,
}

impl InMemFileWriter {
    /// Creates an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes written so far.
    pub fn len(&self) -> u64 {
        self.buf.len() as u64
    }

    /// Returns true if nothing was written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Pages needed to hold the written bytes; at least one.
    pub fn num_pages(&self) -> u64 {
        (self.buf.len() as u64).div_ceil(PAGE_SIZE as u64).max(1)
    }

    /// Writes the buffered bytes to `range`, zero-padding the last page.
    pub fn flush(&self, range: PageRange, fh: &FileHandle, shadow: &ShadowFile) -> Result<()> {
        if range.num_pages < self.num_pages() {
            return Err(UmbraError::Invalid("page range too small for buffered bytes"));
        }
        for (i, page) in range.iter_pages().enumerate() {
            let start = (i * PAGE_SIZE).min(self.buf.len());
            let end = ((i + 1) * PAGE_SIZE).min(self.buf.len());
            let chunk = &self.buf[start..end];
            utils::update_page(fh, page, true, shadow, |bytes| {
                bytes[..chunk.len()].copy_from_slice(chunk);
                bytes[chunk.len()..].fill(0);
            })?;
        }
        Ok(())
    }

    /// Allocates exactly enough pages, writes the bytes there and returns
    /// the range.
    pub fn flush_new(&self, alloc: &dyn PageAllocator, shadow: &ShadowFile) -> Result<PageRange> {
        let range = alloc.allocate_page_range(self.num_pages())?;
        self.flush(range, alloc.data_fh(), shadow)?;
        Ok(range)
    }
}

impl ByteSink for InMemFileWriter {
    fn write_bytes(&mut self, src: &[u8]) -> Result<()> {
        self.buf.extend_from_slice(src);
        Ok(())
    }
}

/// Sequential reader confined to one page range of a file.
pub struct PagedReader<'a> {
    io: &'a dyn FileIo,
    offset: u64,
    end: u64,
}

impl<'a> PagedReader<'a> {
    /// Positions the reader at the first byte of `range`.
    pub fn new(io: &'a dyn FileIo, range: PageRange) -> Self {
        Self {
            io,
            offset: range.start.offset(),
            end: PageId(range.end()).offset(),
        }
    }

    /// Bytes consumed so far.
    pub fn position(&self, range: PageRange) -> u64 {
        self.offset - range.start.offset()
    }
}

impl ByteSource for PagedReader<'_> {
    fn read_bytes(&mut self, dst: &mut [u8]) -> Result<()> {
        let len = dst.len() as u64;
        if self.offset + len > self.end {
            return Err(UmbraError::Corruption("read past the end of a page range"));
        }
        self.io.read_at(self.offset, dst)?;
        self.offset += len;
        Ok(())
    }
}
