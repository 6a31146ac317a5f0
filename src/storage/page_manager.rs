//! Page allocation on top of the free-space manager.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::primitives::buffer::FileHandle;
use crate::primitives::bytes::{Deserializer, Serializer};
use crate::storage::free_space::FreeSpaceManager;
use crate::types::{PageId, PageRange, Result, UmbraError};

/// Hands out and takes back page ranges of the data file.
pub trait PageAllocator: Send + Sync {
    /// Allocates `num_pages` contiguous pages.
    fn allocate_page_range(&self, num_pages: u64) -> Result<PageRange>;

    /// Allocates a single page.
    fn allocate_page(&self) -> Result<PageId> {
        Ok(self.allocate_page_range(1)?.start)
    }

    /// Returns `range` to the allocator once the running checkpoint lands.
    fn free_page_range(&self, range: PageRange);

    /// Returns a single page.
    fn free_page(&self, page: PageId) {
        self.free_page_range(PageRange::new(page, 1));
    }

    /// Handle of the data file the pages belong to.
    fn data_fh(&self) -> &Arc<FileHandle>;
}

struct PageManagerState {
    fsm: FreeSpaceManager,
    allocated: Vec<PageRange>,
    version: u64,
}

/// Allocator that reuses free ranges first and grows the file otherwise.
pub struct PageManager {
    fh: Arc<FileHandle>,
    state: Mutex<PageManagerState>,
}

impl PageManager {
    /// Creates an allocator with no free ranges.
    pub fn new(fh: Arc<FileHandle>) -> Self {
        Self::with_free_space(fh, FreeSpaceManager::new())
    }

    /// Creates an allocator seeded with `fsm`.
    pub fn with_free_space(fh: Arc<FileHandle>, fsm: FreeSpaceManager) -> Self {
        Self {
            fh,
            state: Mutex::new(PageManagerState {
                fsm,
                allocated: Vec::new(),
                version: 0,
            }),
        }
    }

    /// Merges the ranges freed during the checkpoint into the free lists and
    /// forgets the allocations made since the last one. Returns the number of
    /// pages truncated from the file.
    pub fn finalize_checkpoint(&self) -> Result<u64> {
        let mut state = self.state.lock();
        state.allocated.clear();
        let truncated = state.fsm.finalize_checkpoint(&self.fh)?;
        state.fsm.clear_evicted_buffer_manager_entries_if_needed(self.fh.pool());
        Ok(truncated)
    }

    /// Drops the frees of the aborted checkpoint and returns every range
    /// allocated since the last checkpoint to the free lists.
    pub fn rollback_checkpoint(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.fsm.rollback_checkpoint();
        let allocated = std::mem::take(&mut state.allocated);
        if allocated.is_empty() {
            return Ok(());
        }
        debug!(ranges = allocated.len(), "page_manager.rollback.reclaim");
        for range in allocated {
            state.fsm.add_uncheckpointed_free_pages(range);
        }
        state.fsm.finalize_checkpoint(&self.fh)?;
        state.fsm.clear_evicted_buffer_manager_entries_if_needed(self.fh.pool());
        state.version += 1;
        Ok(())
    }

    /// Writes the free list.
    pub fn serialize(&self, ser: &mut Serializer<'_>) -> Result<()> {
        self.state.lock().fsm.serialize(ser)
    }

    /// Replaces the free list with one read from `de`.
    pub fn deserialize(&self, de: &mut Deserializer<'_>) -> Result<()> {
        let fsm = FreeSpaceManager::deserialize(de, self.fh.num_pages())?;
        let mut state = self.state.lock();
        state.fsm = fsm;
        state.allocated.clear();
        Ok(())
    }

    /// Upper bound on the serialized free-list size in bytes.
    pub fn max_bytes_for_serialization(&self) -> Result<u64> {
        self.state.lock().fsm.max_bytes_for_serialization()
    }

    /// Recorded free ranges.
    pub fn free_entries(&self) -> Vec<PageRange> {
        self.state.lock().fsm.entries()
    }

    /// Ranges freed since the last checkpoint.
    pub fn pending_free_entries(&self) -> Vec<PageRange> {
        self.state.lock().fsm.uncheckpointed().to_vec()
    }

    /// Returns true if anything was allocated or freed since the last reset.
    pub fn changed_since_last_checkpoint(&self) -> bool {
        self.state.lock().version > 0
    }

    /// Clears the change counter.
    pub fn reset_version(&self) {
        self.state.lock().version = 0;
    }
}

impl PageAllocator for PageManager {
    fn allocate_page_range(&self, num_pages: u64) -> Result<PageRange> {
        if num_pages == 0 {
            return Err(UmbraError::Invalid("cannot allocate an empty page range"));
        }
        if self.fh.is_read_only() {
            return Err(UmbraError::ReadOnly("cannot allocate pages"));
        }
        let mut state = self.state.lock();
        let range = match state.fsm.pop_free_pages(num_pages) {
            Some(range) => range,
            None => PageRange::new(self.fh.add_new_pages(num_pages)?, num_pages),
        };
        state.allocated.push(range);
        state.version += 1;
        Ok(range)
    }

    fn free_page_range(&self, range: PageRange) {
        let mut state = self.state.lock();
        state.fsm.add_uncheckpointed_free_pages(range);
        state.version += 1;
    }

    fn data_fh(&self) -> &Arc<FileHandle> {
        &self.fh
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::buffer::BufferManager;
    use crate::primitives::io::MemFileIo;
    use crate::types::FileIdx;

    fn manager() -> Result<PageManager> {
        let fh = FileHandle::open(
            FileIdx(0),
            "mem",
            Arc::new(MemFileIo::default()),
            BufferManager::new(32),
            false,
        )?;
        fh.add_new_page()?;
        Ok(PageManager::new(fh))
    }

    #[test]
    fn frees_become_reusable_after_finalize() -> Result<()> {
        let pm = manager()?;
        let a = pm.allocate_page_range(4)?;
        let _b = pm.allocate_page_range(2)?;
        assert_eq!(a.start, PageId(1));
        pm.finalize_checkpoint()?;
        pm.free_page_range(a);
        assert_eq!(pm.allocate_page_range(4)?.start, PageId(7));
        pm.finalize_checkpoint()?;
        assert_eq!(pm.allocate_page_range(3)?.start, PageId(1));
        Ok(())
    }

    #[test]
    fn rollback_returns_fresh_allocations() -> Result<()> {
        let pm = manager()?;
        pm.allocate_page_range(3)?;
        pm.finalize_checkpoint()?;
        pm.reset_version();
        let fresh = pm.allocate_page_range(5)?;
        pm.free_page(PageId(1));
        assert!(pm.changed_since_last_checkpoint());
        pm.rollback_checkpoint()?;
        assert_eq!(pm.data_fh().num_pages(), fresh.start.0);
        assert!(pm.free_entries().is_empty());
        Ok(())
    }

    #[test]
    fn read_only_refuses_allocation() -> Result<()> {
        let fh = FileHandle::open(
            FileIdx(0),
            "mem",
            Arc::new(MemFileIo::default()),
            BufferManager::new(4),
            true,
        )?;
        let pm = PageManager::new(fh);
        assert!(matches!(pm.allocate_page(), Err(UmbraError::ReadOnly(_))));
        Ok(())
    }
}
