//! Many disk-array headers packed into chained header pages.
//!
//! Header page layout: `[next: u64][count: u64][count × DiskArrayHeader]`.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::{read_pip_chain, ArrayElement, DiskArray, DiskArrayHeader, DiskArrayInternal};
use crate::primitives::buffer::FileHandle;
use crate::storage::page_manager::PageAllocator;
use crate::storage::shadow::{utils, ShadowFile};
use crate::storage::txn::TxnKind;
use crate::types::{PageId, Result, UmbraError, PAGE_SIZE};

/// Disk-array headers stored per header page.
pub const HEADERS_PER_PAGE: usize = (PAGE_SIZE - 16) / DiskArrayHeader::SIZE;

fn encode_header_page(next: Option<PageId>, headers: &[DiskArrayHeader]) -> Vec<u8> {
    let mut page = vec![0u8; PAGE_SIZE];
    page[..8].copy_from_slice(&PageId::encode_opt(next).to_be_bytes());
    page[8..16].copy_from_slice(&(headers.len() as u64).to_be_bytes());
    for (i, header) in headers.iter().enumerate() {
        let at = 16 + i * DiskArrayHeader::SIZE;
        header.encode(&mut page[at..at + DiskArrayHeader::SIZE]);
    }
    page
}

fn decode_header_page(page: &[u8]) -> Result<(Option<PageId>, Vec<DiskArrayHeader>)> {
    let next = PageId::decode_opt(super::read_u64(&page[..8]));
    let count = super::read_u64(&page[8..16]) as usize;
    if count > HEADERS_PER_PAGE {
        return Err(UmbraError::Corruption("disk array header page count out of range"));
    }
    let headers = (0..count)
        .map(|i| {
            let at = 16 + i * DiskArrayHeader::SIZE;
            DiskArrayHeader::decode(&page[at..at + DiskArrayHeader::SIZE])
        })
        .collect();
    Ok((next, headers))
}

struct Slot {
    header: DiskArrayHeader,
    array: Option<Arc<DiskArrayInternal>>,
}

impl Slot {
    fn write_header(&self) -> DiskArrayHeader {
        match &self.array {
            Some(array) => array.header(TxnKind::Write),
            None => self.header,
        }
    }
}

struct CollectionState {
    header_pages: Vec<PageId>,
    header_pages_for_write: Vec<PageId>,
    slots: Vec<Slot>,
    num_committed: usize,
}

/// Owns a set of disk arrays whose headers share header pages.
pub struct DiskArrayCollection {
    fh: Arc<FileHandle>,
    shadow: Arc<ShadowFile>,
    bypass_shadowing: bool,
    state: Mutex<CollectionState>,
}

impl DiskArrayCollection {
    /// Allocates the first header page of an empty collection.
    pub fn create(
        alloc: &dyn PageAllocator,
        shadow: Arc<ShadowFile>,
        bypass_shadowing: bool,
    ) -> Result<Self> {
        let fh = alloc.data_fh().clone();
        let first = alloc.allocate_page()?;
        utils::update_page(&fh, first, true, &shadow, |bytes| {
            bytes.copy_from_slice(&encode_header_page(None, &[]))
        })?;
        debug!(first = first.0, "disk_array.collection.create");
        Ok(Self {
            fh,
            shadow,
            bypass_shadowing,
            state: Mutex::new(CollectionState {
                header_pages: Vec::new(),
                header_pages_for_write: vec![first],
                slots: Vec::new(),
                num_committed: 0,
            }),
        })
    }

    /// Opens the collection whose first header page is `first_page`.
    pub fn open(
        fh: Arc<FileHandle>,
        shadow: Arc<ShadowFile>,
        first_page: PageId,
        bypass_shadowing: bool,
    ) -> Result<Self> {
        let mut header_pages = Vec::new();
        let mut slots = Vec::new();
        let mut next = Some(first_page);
        while let Some(page) = next {
            if header_pages.len() as u64 >= fh.num_pages() || page.0 >= fh.num_pages() {
                return Err(UmbraError::Corruption("disk array header chain leaves the file"));
            }
            let (link, headers) = fh.read_page(page, decode_header_page)??;
            header_pages.push(page);
            slots.extend(headers.into_iter().map(|header| Slot { header, array: None }));
            next = link;
        }
        let num_committed = slots.len();
        Ok(Self {
            fh,
            shadow,
            bypass_shadowing,
            state: Mutex::new(CollectionState {
                header_pages_for_write: header_pages.clone(),
                header_pages,
                slots,
                num_committed,
            }),
        })
    }

    /// First header page; the caller persists it to reopen the collection.
    /// `None` after a collection that was never checkpointed is rolled back.
    pub fn first_page(&self) -> Option<PageId> {
        self.state.lock().header_pages_for_write.first().copied()
    }

    /// Number of disk arrays, including ones added since the last checkpoint.
    pub fn num_disk_arrays(&self) -> usize {
        self.state.lock().slots.len()
    }

    /// Returns true if arrays were added or changed since the last
    /// checkpoint.
    pub fn has_changes(&self) -> bool {
        let state = self.state.lock();
        state.slots.len() != state.num_committed
            || state.header_pages_for_write != state.header_pages
            || state
                .slots
                .iter()
                .filter_map(|slot| slot.array.as_ref())
                .any(|array| array.has_transactional_updates())
    }

    /// Adds an empty disk array and returns its index.
    pub fn add_disk_array(&self) -> usize {
        let mut state = self.state.lock();
        state.slots.push(Slot {
            header: DiskArrayHeader::default(),
            array: None,
        });
        state.slots.len() - 1
    }

    /// Typed handle on disk array `idx`. The element type must stay the same
    /// across calls.
    pub fn get_disk_array<T: ArrayElement>(&self, idx: usize) -> Result<DiskArray<T>> {
        let mut state = self.state.lock();
        let len = state.slots.len();
        let slot = state.slots.get_mut(idx).ok_or(UmbraError::OutOfBounds {
            idx: idx as u64,
            len: len as u64,
        })?;
        if let Some(array) = &slot.array {
            if array.element_size() != T::SIZE {
                return Err(UmbraError::Invalid("disk array opened with another element size"));
            }
            return Ok(DiskArray::from_internal(array.clone()));
        }
        let array = Arc::new(DiskArrayInternal::open(
            slot.header,
            T::SIZE,
            self.fh.clone(),
            self.shadow.clone(),
            self.bypass_shadowing,
        )?);
        slot.array = Some(array.clone());
        Ok(DiskArray::from_internal(array))
    }

    /// Writes staged PIPs of every array, then every header page whose
    /// contents changed, allocating header pages as the collection grows.
    pub fn checkpoint(&self, alloc: &dyn PageAllocator) -> Result<()> {
        let mut state = self.state.lock();
        for array in state.slots.iter().filter_map(|slot| slot.array.as_ref()) {
            array.checkpoint()?;
        }

        let headers: Vec<DiskArrayHeader> = state.slots.iter().map(Slot::write_header).collect();
        let committed: Vec<DiskArrayHeader> = state.slots[..state.num_committed]
            .iter()
            .map(|slot| slot.header)
            .collect();
        let needed = headers.len().div_ceil(HEADERS_PER_PAGE).max(1);
        while state.header_pages_for_write.len() < needed {
            let page = alloc.allocate_page()?;
            state.header_pages_for_write.push(page);
        }

        let mut written = 0;
        for (i, &page) in state.header_pages_for_write.iter().enumerate() {
            let next = state.header_pages_for_write.get(i + 1).copied();
            let chunk = chunk_of(&headers, i);
            let bytes = encode_header_page(next, chunk);
            let unchanged = state.header_pages.get(i).is_some_and(|_| {
                let committed_next = state.header_pages.get(i + 1).copied();
                encode_header_page(committed_next, chunk_of(&committed, i)) == bytes
            });
            if unchanged {
                continue;
            }
            utils::update_page(&self.fh, page, true, &self.shadow, |dst| dst.copy_from_slice(&bytes))?;
            written += 1;
        }
        debug!(arrays = headers.len(), pages_written = written, "disk_array.collection.checkpoint");
        Ok(())
    }

    /// Makes the written headers the committed state.
    pub fn checkpoint_in_memory(&self) {
        let mut state = self.state.lock();
        for slot in &mut state.slots {
            if let Some(array) = &slot.array {
                array.checkpoint_in_memory_if_necessary();
                slot.header = array.header(TxnKind::ReadOnly);
            }
        }
        state.num_committed = state.slots.len();
        state.header_pages = state.header_pages_for_write.clone();
    }

    /// Discards arrays added and changes made since the last checkpoint.
    pub fn rollback_in_memory(&self) {
        let mut state = self.state.lock();
        let committed = state.num_committed;
        state.slots.truncate(committed);
        for array in state.slots.iter().filter_map(|slot| slot.array.as_ref()) {
            array.rollback_in_memory_if_necessary();
        }
        let committed_pages = state.header_pages.clone();
        let written = std::mem::replace(&mut state.header_pages_for_write, committed_pages);
        for page in written {
            self.shadow.clear_shadow_page(self.fh.file_idx(), page);
        }
    }

    /// Frees every array page, PIP and header page of the collection.
    pub fn reclaim_storage(&self, alloc: &dyn PageAllocator) -> Result<()> {
        let state = self.state.lock();
        for slot in &state.slots {
            match &slot.array {
                Some(array) => array.reclaim_storage(alloc)?,
                None => {
                    for wrapper in read_pip_chain(&self.fh, slot.header.first_pip)? {
                        for page in wrapper.pip.slots.iter().flatten() {
                            alloc.free_page(*page);
                        }
                        alloc.free_page(wrapper.page);
                    }
                }
            }
        }
        for page in &state.header_pages_for_write {
            alloc.free_page(*page);
        }
        Ok(())
    }
}

fn chunk_of(headers: &[DiskArrayHeader], page_idx: usize) -> &[DiskArrayHeader] {
    let start = (page_idx * HEADERS_PER_PAGE).min(headers.len());
    let end = ((page_idx + 1) * HEADERS_PER_PAGE).min(headers.len());
    &headers[start..end]
}
