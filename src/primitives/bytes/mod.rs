#![forbid(unsafe_code)]
//! Binary serialization shared by every persisted structure.
//!
//! Integers are written big-endian at fixed width. In debug builds each field
//! may be preceded by a length-prefixed string tag that the reader validates;
//! release builds write and expect nothing in its place.

use tracing::warn;

use crate::types::{PageId, PageRange, Result, UmbraError, PAGE_SIZE};

/// Whether debug field tags are written and validated by this build.
pub const DEBUG_TAGS: bool = cfg!(debug_assertions);

const MAX_TAG_LEN: u64 = 256;

/// Destination for serialized bytes.
pub trait ByteSink {
    /// Appends `src` to the sink.
    fn write_bytes(&mut self, src: &[u8]) -> Result<()>;
}

impl ByteSink for Vec<u8> {
    fn write_bytes(&mut self, src: &[u8]) -> Result<()> {
        self.extend_from_slice(src);
        Ok(())
    }
}

/// Sink that only measures how many bytes would be written.
#[derive(Clone, Copy, Debug, Default)]
pub struct ByteCounter {
    bytes: u64,
}

impl ByteCounter {
    /// Bytes observed so far.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Pages needed to hold the observed bytes.
    pub fn pages(&self) -> u64 {
        self.bytes.div_ceil(PAGE_SIZE as u64)
    }
}

impl ByteSink for ByteCounter {
    fn write_bytes(&mut self, src: &[u8]) -> Result<()> {
        self.bytes += src.len() as u64;
        Ok(())
    }
}

/// Source of serialized bytes.
pub trait ByteSource {
    /// Fills `dst` completely or fails.
    fn read_bytes(&mut self, dst: &mut [u8]) -> Result<()>;
}

/// Reads from an in-memory slice, tracking the offset.
#[derive(Debug)]
pub struct SliceSource<'a> {
    buf: &'a [u8],
    off: usize,
}

impl<'a> SliceSource<'a> {
    /// Creates a source positioned at the start of `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, off: 0 }
    }

    /// Bytes consumed so far.
    pub fn offset(&self) -> usize {
        self.off
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.off)
    }
}

impl ByteSource for SliceSource<'_> {
    fn read_bytes(&mut self, dst: &mut [u8]) -> Result<()> {
        if dst.len() > self.remaining() {
            return Err(UmbraError::Corruption("serialized data truncated"));
        }
        dst.copy_from_slice(&self.buf[self.off..self.off + dst.len()]);
        self.off += dst.len();
        Ok(())
    }
}

/// Writes typed values into a [`ByteSink`].
pub struct Serializer<'a> {
    sink: &'a mut dyn ByteSink,
}

impl<'a> Serializer<'a> {
    /// Wraps a sink.
    pub fn new(sink: &'a mut dyn ByteSink) -> Self {
        Self { sink }
    }

    /// Writes raw bytes without a length prefix.
    pub fn write_bytes(&mut self, src: &[u8]) -> Result<()> {
        self.sink.write_bytes(src)
    }

    /// Writes a single byte.
    pub fn write_u8(&mut self, v: u8) -> Result<()> {
        self.sink.write_bytes(&[v])
    }

    /// Writes a big-endian u32.
    pub fn write_u32(&mut self, v: u32) -> Result<()> {
        self.sink.write_bytes(&v.to_be_bytes())
    }

    /// Writes a big-endian u64.
    pub fn write_u64(&mut self, v: u64) -> Result<()> {
        self.sink.write_bytes(&v.to_be_bytes())
    }

    /// Writes an optional page index using the null sentinel.
    pub fn write_page_opt(&mut self, page: Option<PageId>) -> Result<()> {
        self.write_u64(PageId::encode_opt(page))
    }

    /// Writes a page range as `(start, num_pages)`.
    pub fn write_page_range(&mut self, range: PageRange) -> Result<()> {
        self.write_u64(range.start.0)?;
        self.write_u64(range.num_pages)
    }

    /// Writes an optional page range; `None` is encoded as a null start page.
    pub fn write_page_range_opt(&mut self, range: Option<PageRange>) -> Result<()> {
        match range {
            Some(range) => self.write_page_range(range),
            None => {
                self.write_page_opt(None)?;
                self.write_u64(0)
            }
        }
    }

    /// Writes a length-prefixed byte string.
    pub fn write_blob(&mut self, bytes: &[u8]) -> Result<()> {
        self.write_u64(bytes.len() as u64)?;
        self.write_bytes(bytes)
    }

    /// Writes a debug field tag when [`DEBUG_TAGS`] is enabled.
    pub fn write_debugging_info(&mut self, tag: &str) -> Result<()> {
        if DEBUG_TAGS {
            self.write_blob(tag.as_bytes())?;
        }
        Ok(())
    }
}

/// Reads typed values from a [`ByteSource`].
pub struct Deserializer<'a> {
    src: &'a mut dyn ByteSource,
}

impl<'a> Deserializer<'a> {
    /// Wraps a source.
    pub fn new(src: &'a mut dyn ByteSource) -> Self {
        Self { src }
    }

    /// Fills `dst` from the source.
    pub fn read_bytes(&mut self, dst: &mut [u8]) -> Result<()> {
        self.src.read_bytes(dst)
    }

    /// Reads a fixed-size byte array.
    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        self.src.read_bytes(&mut buf)?;
        Ok(buf)
    }

    /// Reads a single byte.
    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_array::<1>()?[0])
    }

    /// Reads a big-endian u32.
    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.read_array()?))
    }

    /// Reads a big-endian u64.
    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.read_array()?))
    }

    /// Reads an optional page index.
    pub fn read_page_opt(&mut self) -> Result<Option<PageId>> {
        Ok(PageId::decode_opt(self.read_u64()?))
    }

    /// Reads a page range written by [`Serializer::write_page_range`].
    pub fn read_page_range(&mut self) -> Result<PageRange> {
        let start = PageId(self.read_u64()?);
        let num_pages = self.read_u64()?;
        Ok(PageRange::new(start, num_pages))
    }

    /// Reads a range written by [`Serializer::write_page_range_opt`].
    pub fn read_page_range_opt(&mut self) -> Result<Option<PageRange>> {
        let start = self.read_page_opt()?;
        let num_pages = self.read_u64()?;
        Ok(start.map(|start| PageRange::new(start, num_pages)))
    }

    /// Reads a length-prefixed byte string of at most `max_len` bytes.
    pub fn read_blob(&mut self, max_len: u64) -> Result<Vec<u8>> {
        let len = self.read_u64()?;
        if len > max_len {
            return Err(UmbraError::Corruption("length prefix exceeds limit"));
        }
        let mut buf = vec![0u8; len as usize];
        self.src.read_bytes(&mut buf)?;
        Ok(buf)
    }

    /// Consumes and checks a debug field tag when [`DEBUG_TAGS`] is enabled.
    pub fn validate_debugging_info(&mut self, expected: &str) -> Result<()> {
        if !DEBUG_TAGS {
            return Ok(());
        }
        let found = self.read_blob(MAX_TAG_LEN)?;
        if found != expected.as_bytes() {
            warn!(
                expected,
                found = %String::from_utf8_lossy(&found),
                "bytes.debug_tag.mismatch"
            );
            return Err(UmbraError::Corruption("debug field tag mismatch"));
        }
        Ok(())
    }
}
