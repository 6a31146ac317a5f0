use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::debug;

use super::{read_page_or_zero, BufferManager, PageGuard, PageReadPolicy};
use crate::primitives::io::FileIo;
use crate::types::{FileIdx, PageId, Result, UmbraError, PAGE_SIZE};

/// One page-structured file registered with the buffer manager.
///
/// The handle owns the logical page count; pages beyond the physical end of
/// the file read as zeros until first written back.
pub struct FileHandle {
    idx: FileIdx,
    path: PathBuf,
    io: Arc<dyn FileIo>,
    pool: Arc<BufferManager>,
    num_pages: AtomicU64,
    read_only: bool,
}

impl FileHandle {
    /// Registers `io` with `pool` under `idx`.
    pub fn open(
        idx: FileIdx,
        path: impl AsRef<Path>,
        io: Arc<dyn FileIo>,
        pool: Arc<BufferManager>,
        read_only: bool,
    ) -> Result<Arc<Self>> {
        let len = io.len()?;
        let num_pages = len.div_ceil(PAGE_SIZE as u64);
        pool.register_file(idx, io.clone());
        debug!(file = idx.0, num_pages, read_only, "buffer.file.open");
        Ok(Arc::new(Self {
            idx,
            path: path.as_ref().to_path_buf(),
            io,
            pool,
            num_pages: AtomicU64::new(num_pages),
            read_only,
        }))
    }

    /// Index used for buffer-manager and shadow-map keys.
    pub fn file_idx(&self) -> FileIdx {
        self.idx
    }

    /// Path the file was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Underlying positioned I/O.
    pub fn io(&self) -> &Arc<dyn FileIo> {
        &self.io
    }

    /// Buffer manager holding this file's frames.
    pub fn pool(&self) -> &Arc<BufferManager> {
        &self.pool
    }

    /// Logical number of pages, including pages not yet written back.
    pub fn num_pages(&self) -> u64 {
        self.num_pages.load(Ordering::Acquire)
    }

    /// Returns true if the file was opened without write access.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Appends `count` pages and returns the first new page.
    pub fn add_new_pages(&self, count: u64) -> Result<PageId> {
        if self.read_only {
            return Err(UmbraError::ReadOnly("cannot grow a read-only file"));
        }
        Ok(PageId(self.num_pages.fetch_add(count, Ordering::AcqRel)))
    }

    /// Appends a single page.
    pub fn add_new_page(&self) -> Result<PageId> {
        self.add_new_pages(1)
    }

    /// Pins `page` exclusively.
    pub fn pin_page(&self, page: PageId, policy: PageReadPolicy) -> Result<PageGuard> {
        self.pool.pin(self.idx, page, policy)
    }

    /// Runs `f` over the current bytes of `page`, served from the buffer
    /// manager.
    pub fn read_page<R>(&self, page: PageId, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let guard = self.pool.pin_read(self.idx, page)?;
        Ok(f(guard.data()))
    }

    /// Reads `page` straight from the file, bypassing frames.
    pub fn read_page_from_disk(&self, page: PageId, dst: &mut [u8]) -> Result<()> {
        read_page_or_zero(self.io.as_ref(), page, dst)
    }

    /// Writes `src` straight to the file at `page`, bypassing frames.
    pub fn write_page_to_file(&self, page: PageId, src: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(UmbraError::ReadOnly("cannot write a read-only file"));
        }
        self.io.write_at(page.offset(), src)?;
        let _ = self
            .num_pages
            .fetch_max(page.0 + 1, Ordering::AcqRel);
        Ok(())
    }

    /// Drops the frame of `page` without writing it back.
    pub fn remove_page_from_frame_if_necessary(&self, page: PageId) {
        self.pool.remove_page_from_frame(self.idx, page);
    }

    /// Shrinks the file so that `page` becomes its new end.
    pub fn remove_page_idx_and_truncate_if_necessary(&self, page: PageId) -> Result<u64> {
        let current = self.num_pages();
        if page.0 >= current {
            return Ok(0);
        }
        self.pool.remove_pages_from(self.idx, page);
        self.num_pages.store(page.0, Ordering::Release);
        if self.io.len()? > page.offset() {
            self.io.truncate(page.offset())?;
        }
        debug!(file = self.idx.0, new_pages = page.0, removed = current - page.0, "buffer.file.truncate");
        Ok(current - page.0)
    }

    /// Drops every frame and truncates the file to `pages` pages.
    pub fn reset_to_pages(&self, pages: u64) -> Result<()> {
        self.pool.remove_file_pages_from_frames(self.idx);
        self.io.truncate(pages * PAGE_SIZE as u64)?;
        self.num_pages.store(pages, Ordering::Release);
        Ok(())
    }

    /// Writes back every dirty frame of this file.
    pub fn flush_dirty_pages(&self) -> Result<u64> {
        self.pool.flush_file(self.idx)
    }

    /// Syncs the file to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.io.sync_all()
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        self.pool.unregister_file(self.idx);
    }
}
