//! Free-space tracking for the data file.
//!
//! Free ranges are bucketed by `floor(log2(num_pages))` into ordered sets
//! keyed by `(num_pages, start)`, so the first entry at or above a requested
//! size within a level is its best fit. Ranges freed while a checkpoint is
//! being written sit in a separate list and only join the free lists when
//! that checkpoint finalizes.

use std::collections::BTreeSet;

use tracing::debug;

use crate::primitives::buffer::{BufferManager, FileHandle};
use crate::primitives::bytes::{ByteCounter, Deserializer, Serializer};
use crate::types::{PageId, PageRange, Result, UmbraError};

const NUM_LEVELS: usize = 64;

fn level_of(num_pages: u64) -> usize {
    debug_assert!(num_pages > 0);
    num_pages.ilog2() as usize
}

/// Tracks reusable page ranges of one data file.
#[derive(Debug)]
pub struct FreeSpaceManager {
    levels: Vec<BTreeSet<(u64, PageId)>>,
    num_entries: u64,
    uncheckpointed: Vec<PageRange>,
    needs_eviction_cleanup: bool,
}

impl Default for FreeSpaceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl FreeSpaceManager {
    /// Creates an empty manager.
    pub fn new() -> Self {
        Self {
            levels: vec![BTreeSet::new(); NUM_LEVELS],
            num_entries: 0,
            uncheckpointed: Vec::new(),
            needs_eviction_cleanup: false,
        }
    }

    /// Makes `range` available for allocation immediately.
    pub fn add_free_pages(&mut self, range: PageRange) {
        if range.num_pages == 0 {
            return;
        }
        let inserted = self.levels[level_of(range.num_pages)].insert((range.num_pages, range.start));
        debug_assert!(inserted, "free range {range:?} recorded twice");
        if inserted {
            self.num_entries += 1;
        }
    }

    /// Queues `range` until the running checkpoint finalizes.
    pub fn add_uncheckpointed_free_pages(&mut self, range: PageRange) {
        if range.num_pages == 0 {
            return;
        }
        self.uncheckpointed.push(range);
    }

    /// Takes a range of exactly `num_pages` pages, splitting a larger entry
    /// when needed. Returns `None` when no entry is large enough.
    pub fn pop_free_pages(&mut self, num_pages: u64) -> Option<PageRange> {
        if num_pages == 0 {
            return None;
        }
        for level in level_of(num_pages)..NUM_LEVELS {
            let found = self.levels[level]
                .range((num_pages, PageId(0))..)
                .next()
                .copied();
            if let Some(entry) = found {
                self.levels[level].remove(&entry);
                self.num_entries -= 1;
                let (len, start) = entry;
                return Some(self.split_page_range(PageRange::new(start, len), num_pages));
            }
        }
        None
    }

    fn split_page_range(&mut self, range: PageRange, num_pages: u64) -> PageRange {
        if range.num_pages > num_pages {
            self.add_free_pages(PageRange::new(
                PageId(range.start.0 + num_pages),
                range.num_pages - num_pages,
            ));
        }
        PageRange::new(range.start, num_pages)
    }

    /// Evicts the queued ranges from the buffer pool, then merges them into
    /// the free lists, coalescing neighbours. A merged range that reaches the
    /// end of the file truncates the file instead of being recorded. Returns
    /// the number of pages truncated.
    pub fn finalize_checkpoint(&mut self, fh: &FileHandle) -> Result<u64> {
        let pending = std::mem::take(&mut self.uncheckpointed);
        for range in &pending {
            for page in range.iter_pages() {
                fh.remove_page_from_frame_if_necessary(page);
            }
        }
        if !pending.is_empty() {
            self.needs_eviction_cleanup = true;
        }
        self.merge_page_ranges(pending, fh)
    }

    fn merge_page_ranges(&mut self, pending: Vec<PageRange>, fh: &FileHandle) -> Result<u64> {
        let mut all = self.entries();
        all.extend(pending);
        self.reset_free_lists();
        all.sort_by_key(|range| range.start);

        let mut merged: Vec<PageRange> = Vec::with_capacity(all.len());
        for range in all {
            if let Some(last) = merged.last_mut() {
                if last.coalesce_with(&range) {
                    continue;
                }
                debug_assert!(last.end() <= range.start.0, "overlapping free ranges");
            }
            merged.push(range);
        }

        let mut truncated = 0;
        if let Some(last) = merged.pop() {
            if last.end() == fh.num_pages() {
                truncated = fh.remove_page_idx_and_truncate_if_necessary(last.start)?;
                debug!(start = last.start.0, pages = truncated, "fsm.finalize.truncate");
            } else {
                merged.push(last);
            }
        }
        for range in merged {
            self.add_free_pages(range);
        }
        debug!(entries = self.num_entries, "fsm.finalize");
        Ok(truncated)
    }

    /// Forgets every range queued by the aborted checkpoint.
    pub fn rollback_checkpoint(&mut self) {
        if !self.uncheckpointed.is_empty() {
            debug!(dropped = self.uncheckpointed.len(), "fsm.rollback");
        }
        self.uncheckpointed.clear();
    }

    /// Drops stale eviction candidates left behind by the last finalize.
    pub fn clear_evicted_buffer_manager_entries_if_needed(&mut self, pool: &BufferManager) {
        if self.needs_eviction_cleanup {
            pool.remove_evicted_candidates();
            self.needs_eviction_cleanup = false;
        }
    }

    /// Writes the free list: every recorded entry followed by the ranges
    /// queued by the checkpoint being written.
    pub fn serialize(&self, ser: &mut Serializer<'_>) -> Result<()> {
        ser.write_debugging_info("page_manager")?;
        ser.write_debugging_info("numEntries")?;
        ser.write_u64(self.num_entries + self.uncheckpointed.len() as u64)?;
        ser.write_debugging_info("entries")?;
        for range in self.entries() {
            ser.write_page_range(range)?;
        }
        for range in &self.uncheckpointed {
            ser.write_page_range(*range)?;
        }
        Ok(())
    }

    /// Reads a free list written by [`FreeSpaceManager::serialize`]. Entries
    /// reaching past `file_pages` are clamped to the file.
    pub fn deserialize(de: &mut Deserializer<'_>, file_pages: u64) -> Result<Self> {
        let mut fsm = Self::new();
        de.validate_debugging_info("page_manager")?;
        de.validate_debugging_info("numEntries")?;
        let count = de.read_u64()?;
        de.validate_debugging_info("entries")?;
        for _ in 0..count {
            let range = de.read_page_range()?;
            if range.num_pages == 0 {
                return Err(UmbraError::Corruption("empty free-space entry"));
            }
            if range.start.0 >= file_pages {
                continue;
            }
            let len = range.num_pages.min(file_pages - range.start.0);
            fsm.add_free_pages(PageRange::new(range.start, len));
        }
        Ok(fsm)
    }

    /// Upper bound on the serialized size in bytes. Allocating pages for the
    /// free list never increases its entry count, so the bound holds after
    /// the allocation that reserves room for it.
    pub fn max_bytes_for_serialization(&self) -> Result<u64> {
        let mut counter = ByteCounter::default();
        self.serialize(&mut Serializer::new(&mut counter))?;
        Ok(counter.bytes())
    }

    /// [`FreeSpaceManager::max_bytes_for_serialization`] rounded up to pages.
    pub fn max_pages_for_serialization(&self) -> Result<u64> {
        let mut counter = ByteCounter::default();
        self.serialize(&mut Serializer::new(&mut counter))?;
        Ok(counter.pages())
    }

    /// Every recorded entry, ordered by level, then size, then start.
    pub fn entries(&self) -> Vec<PageRange> {
        self.levels
            .iter()
            .flat_map(|level| level.iter().map(|&(len, start)| PageRange::new(start, len)))
            .collect()
    }

    /// Recorded entries with positions `[start, end)` in [`FreeSpaceManager::entries`] order.
    pub fn get_entries(&self, start: usize, end: usize) -> Vec<PageRange> {
        self.entries()
            .into_iter()
            .skip(start)
            .take(end.saturating_sub(start))
            .collect()
    }

    /// Ranges waiting for the running checkpoint to finalize.
    pub fn uncheckpointed(&self) -> &[PageRange] {
        &self.uncheckpointed
    }

    /// Number of recorded entries, excluding queued ones.
    pub fn num_entries(&self) -> u64 {
        self.num_entries
    }

    /// Total pages across recorded entries.
    pub fn num_free_pages(&self) -> u64 {
        self.levels
            .iter()
            .flat_map(|level| level.iter().map(|&(len, _)| len))
            .sum()
    }

    fn reset_free_lists(&mut self) {
        for level in &mut self.levels {
            level.clear();
        }
        self.num_entries = 0;
    }

    /// Forgets every entry, recorded or queued.
    pub fn reset(&mut self) {
        self.reset_free_lists();
        self.uncheckpointed.clear();
        self.needs_eviction_cleanup = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::bytes::SliceSource;
    use crate::primitives::io::MemFileIo;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn handle_with_pages(pages: u64) -> Result<Arc<FileHandle>> {
        let pool = BufferManager::new(16);
        let fh = FileHandle::open(
            crate::types::FileIdx(0),
            "mem",
            Arc::new(MemFileIo::default()),
            pool,
            false,
        )?;
        fh.add_new_pages(pages)?;
        Ok(fh)
    }

    fn range(start: u64, len: u64) -> PageRange {
        PageRange::new(PageId(start), len)
    }

    #[test]
    fn pop_splits_best_fit() {
        let mut fsm = FreeSpaceManager::new();
        fsm.add_free_pages(range(10, 5));
        let got = fsm.pop_free_pages(3).unwrap();
        assert_eq!(got.num_pages, 3);
        assert!(got.start.0 >= 10 && got.end() <= 15);
        assert_eq!(fsm.num_entries(), 1);
        let rest = fsm.pop_free_pages(2).unwrap();
        assert_eq!(rest, range(13, 2));
        assert!(fsm.pop_free_pages(1).is_none());
    }

    #[test]
    fn pop_prefers_smallest_sufficient_entry() {
        let mut fsm = FreeSpaceManager::new();
        fsm.add_free_pages(range(100, 8));
        fsm.add_free_pages(range(20, 3));
        fsm.add_free_pages(range(40, 2));
        assert_eq!(fsm.pop_free_pages(3), Some(range(20, 3)));
        assert_eq!(fsm.pop_free_pages(3), Some(range(100, 3)));
        assert_eq!(fsm.entries(), vec![range(40, 2), range(103, 5)]);
    }

    #[test]
    fn finalize_coalesces_adjacent_ranges() -> Result<()> {
        let fh = handle_with_pages(64)?;
        let mut fsm = FreeSpaceManager::new();
        fsm.add_free_pages(range(10, 5));
        fsm.add_free_pages(range(15, 5));
        fsm.add_uncheckpointed_free_pages(range(30, 1));
        fsm.finalize_checkpoint(&fh)?;
        assert_eq!(fsm.entries(), vec![range(30, 1), range(10, 10)]);
        Ok(())
    }

    #[test]
    fn finalize_without_pending_still_coalesces() -> Result<()> {
        let fh = handle_with_pages(64)?;
        let mut fsm = FreeSpaceManager::new();
        fsm.add_free_pages(range(10, 5));
        fsm.add_free_pages(range(15, 5));
        fsm.add_free_pages(range(60, 4));
        assert_eq!(fsm.num_entries(), 3);
        assert_eq!(fsm.finalize_checkpoint(&fh)?, 4);
        assert_eq!(fsm.entries(), vec![range(10, 10)]);
        assert_eq!(fh.num_pages(), 60);
        Ok(())
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "recorded twice")]
    fn duplicate_free_range_is_caught() {
        let mut fsm = FreeSpaceManager::new();
        fsm.add_free_pages(range(3, 2));
        fsm.add_free_pages(range(3, 2));
    }

    #[test]
    fn finalize_merges_across_pending_boundary() -> Result<()> {
        let fh = handle_with_pages(64)?;
        let mut fsm = FreeSpaceManager::new();
        fsm.add_free_pages(range(10, 5));
        fsm.add_uncheckpointed_free_pages(range(15, 5));
        assert!(fsm.pop_free_pages(6).is_none());
        fsm.finalize_checkpoint(&fh)?;
        assert_eq!(fsm.entries(), vec![range(10, 10)]);
        assert!(fsm.uncheckpointed().is_empty());
        Ok(())
    }

    #[test]
    fn freeing_the_tail_truncates_the_file() -> Result<()> {
        let fh = handle_with_pages(20)?;
        let mut fsm = FreeSpaceManager::new();
        fsm.add_free_pages(range(12, 4));
        fsm.add_uncheckpointed_free_pages(range(16, 4));
        let truncated = fsm.finalize_checkpoint(&fh)?;
        assert_eq!(truncated, 8);
        assert_eq!(fh.num_pages(), 12);
        assert_eq!(fsm.num_entries(), 0);
        Ok(())
    }

    #[test]
    fn rollback_discards_pending_ranges() -> Result<()> {
        let fh = handle_with_pages(64)?;
        let mut fsm = FreeSpaceManager::new();
        fsm.add_uncheckpointed_free_pages(range(5, 2));
        fsm.rollback_checkpoint();
        fsm.finalize_checkpoint(&fh)?;
        assert_eq!(fsm.num_entries(), 0);
        Ok(())
    }

    #[test]
    fn eviction_cleanup_runs_once_per_finalize() -> Result<()> {
        let fh = handle_with_pages(64)?;
        let pool = fh.pool().clone();
        for page in [3, 4] {
            drop(fh.pin_page(PageId(page), crate::primitives::buffer::PageReadPolicy::DontReadPage)?);
        }
        let mut fsm = FreeSpaceManager::new();
        fsm.add_uncheckpointed_free_pages(range(3, 1));
        fsm.add_uncheckpointed_free_pages(range(4, 1));
        fsm.finalize_checkpoint(&fh)?;
        assert!(!pool.is_resident(fh.file_idx(), PageId(3)));
        fsm.clear_evicted_buffer_manager_entries_if_needed(&pool);
        assert_eq!(pool.eviction_queue_len(), 0);
        Ok(())
    }

    #[test]
    fn serialization_keeps_pending_and_clamps_to_file() -> Result<()> {
        let mut fsm = FreeSpaceManager::new();
        fsm.add_free_pages(range(2, 3));
        fsm.add_free_pages(range(40, 10));
        fsm.add_uncheckpointed_free_pages(range(7, 1));
        let mut buf = Vec::new();
        fsm.serialize(&mut Serializer::new(&mut buf))?;
        assert_eq!(buf.len() as u64, fsm.max_bytes_for_serialization()?);
        assert_eq!(fsm.max_pages_for_serialization()?, 1);

        let mut src = SliceSource::new(&buf);
        let restored = FreeSpaceManager::deserialize(&mut Deserializer::new(&mut src), 45)?;
        assert_eq!(restored.entries(), vec![range(7, 1), range(2, 3), range(40, 5)]);
        Ok(())
    }

    proptest! {
        #[test]
        fn popped_ranges_never_overlap(
            lens in proptest::collection::vec(1u64..40, 1..20),
            pops in proptest::collection::vec(1u64..12, 1..30),
        ) {
            let mut fsm = FreeSpaceManager::new();
            for (i, len) in lens.iter().enumerate() {
                fsm.add_free_pages(range(i as u64 * 64, *len));
            }
            let mut taken: Vec<PageRange> = Vec::new();
            for want in pops {
                if let Some(got) = fsm.pop_free_pages(want) {
                    prop_assert_eq!(got.num_pages, want);
                    for prev in &taken {
                        prop_assert!(got.end() <= prev.start.0 || prev.end() <= got.start.0);
                    }
                    taken.push(got);
                }
            }
        }

        #[test]
        fn finalize_leaves_no_adjacent_entries(
            lens in proptest::collection::vec(1u64..5, 1..20),
            gaps in proptest::collection::vec(0u64..3, 20),
        ) {
            let fh = handle_with_pages(10_000).unwrap();
            let mut fsm = FreeSpaceManager::new();
            let mut next = 1;
            for (i, len) in lens.iter().enumerate() {
                let r = range(next, *len);
                if i % 2 == 0 {
                    fsm.add_free_pages(r);
                } else {
                    fsm.add_uncheckpointed_free_pages(r);
                }
                next += len + gaps[i];
            }
            fsm.finalize_checkpoint(&fh).unwrap();
            let mut entries = fsm.entries();
            entries.sort_by_key(|r| r.start);
            for pair in entries.windows(2) {
                prop_assert!(pair[0].end() < pair[1].start.0);
            }
            let total: u64 = lens.iter().sum();
            prop_assert_eq!(fsm.num_free_pages(), total);
        }
    }
}
