//! Growable arrays of fixed-size elements stored across data-file pages.
//!
//! Element `i` lives on array page `i / elements_per_page`. Array pages are
//! located through a singly linked chain of page index pages (PIPs), each
//! holding the physical indices of [`PIP_CAPACITY`] array pages. Every array
//! keeps two headers: the committed view served to read-only transactions and
//! the write view that includes this transaction's growth. PIP changes are
//! staged in [`PipUpdates`] until a checkpoint or rollback settles them.

use std::collections::BTreeSet;
use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockWriteGuard};
use serde::Serialize;
use tracing::debug;

use crate::primitives::buffer::{FileHandle, PageGuard, PageReadPolicy};
use crate::storage::page_manager::PageAllocator;
use crate::storage::shadow::{utils, ShadowFile};
use crate::storage::txn::TxnKind;
use crate::types::{PageId, PageRange, Result, UmbraError, PAGE_SIZE};

mod collection;

pub use collection::{DiskArrayCollection, HEADERS_PER_PAGE};

/// Array pages indexed by one PIP.
pub const PIP_CAPACITY: usize = (PAGE_SIZE - 8) / 8;

/// Fixed-width codec for disk array elements.
pub trait ArrayElement: Copy + Send + Sync + 'static {
    /// Encoded size in bytes.
    const SIZE: usize;
    /// Writes `self` into `dst`, which is exactly [`ArrayElement::SIZE`] bytes.
    fn encode(&self, dst: &mut [u8]);
    /// Reads a value from `src`, which is exactly [`ArrayElement::SIZE`] bytes.
    fn decode(src: &[u8]) -> Self;
}

macro_rules! int_element {
    ($($ty:ty),*) => {
        $(
            impl ArrayElement for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();

                fn encode(&self, dst: &mut [u8]) {
                    dst.copy_from_slice(&self.to_be_bytes());
                }

                fn decode(src: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(src);
                    <$ty>::from_be_bytes(raw)
                }
            }
        )*
    };
}

int_element!(u8, u16, u32, u64, i32, i64);

impl ArrayElement for PageRange {
    const SIZE: usize = 16;

    fn encode(&self, dst: &mut [u8]) {
        dst[..8].copy_from_slice(&self.start.0.to_be_bytes());
        dst[8..].copy_from_slice(&self.num_pages.to_be_bytes());
    }

    fn decode(src: &[u8]) -> Self {
        PageRange::new(PageId(read_u64(&src[..8])), read_u64(&src[8..16]))
    }
}

fn read_u64(src: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&src[..8]);
    u64::from_be_bytes(raw)
}

/// How elements of one size are packed into pages.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PageStorageInfo {
    /// Slot size: the element size rounded up to a power of two.
    pub aligned_element_size: usize,
    /// Slots per array page.
    pub elements_per_page: u64,
}

impl PageStorageInfo {
    /// Packing for elements of `element_size` bytes.
    pub fn new(element_size: usize) -> Result<Self> {
        if element_size == 0 || element_size > PAGE_SIZE {
            return Err(UmbraError::Invalid("disk array element size must be 1..=PAGE_SIZE"));
        }
        let aligned_element_size = element_size.next_power_of_two();
        Ok(Self {
            aligned_element_size,
            elements_per_page: (PAGE_SIZE / aligned_element_size) as u64,
        })
    }

    fn locate(&self, idx: u64) -> (u64, usize) {
        let ap = idx / self.elements_per_page;
        let offset = (idx % self.elements_per_page) as usize * self.aligned_element_size;
        (ap, offset)
    }

    fn num_array_pages(&self, num_elements: u64) -> u64 {
        num_elements.div_ceil(self.elements_per_page)
    }
}

/// Persisted root of one disk array.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct DiskArrayHeader {
    /// Number of elements.
    pub num_elements: u64,
    /// First PIP of the chain, if any page was ever added.
    pub first_pip: Option<PageId>,
}

impl DiskArrayHeader {
    /// Encoded size in bytes.
    pub const SIZE: usize = 16;

    /// Writes the header into `dst`.
    pub fn encode(&self, dst: &mut [u8]) {
        dst[..8].copy_from_slice(&self.num_elements.to_be_bytes());
        dst[8..16].copy_from_slice(&PageId::encode_opt(self.first_pip).to_be_bytes());
    }

    /// Reads a header from `src`.
    pub fn decode(src: &[u8]) -> Self {
        Self {
            num_elements: read_u64(&src[..8]),
            first_pip: PageId::decode_opt(read_u64(&src[8..16])),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
struct Pip {
    next: Option<PageId>,
    slots: Vec<Option<PageId>>,
}

impl Pip {
    fn empty() -> Self {
        Self {
            next: None,
            slots: vec![None; PIP_CAPACITY],
        }
    }

    fn encode(&self, dst: &mut [u8]) {
        dst[..8].copy_from_slice(&PageId::encode_opt(self.next).to_be_bytes());
        for (i, slot) in self.slots.iter().enumerate() {
            let at = 8 + i * 8;
            dst[at..at + 8].copy_from_slice(&PageId::encode_opt(*slot).to_be_bytes());
        }
    }

    fn decode(src: &[u8]) -> Self {
        let slots = (0..PIP_CAPACITY)
            .map(|i| PageId::decode_opt(read_u64(&src[8 + i * 8..])))
            .collect();
        Self {
            next: PageId::decode_opt(read_u64(src)),
            slots,
        }
    }
}

#[derive(Clone, Debug)]
struct PipWrapper {
    page: PageId,
    pip: Pip,
}

/// PIP changes made since the last checkpoint.
#[derive(Clone, Debug, Default)]
pub struct PipUpdates {
    updated_last_pip: Option<PipWrapper>,
    new_pips: Vec<PipWrapper>,
}

impl PipUpdates {
    /// Returns true if no PIP was touched.
    pub fn is_empty(&self) -> bool {
        self.updated_last_pip.is_none() && self.new_pips.is_empty()
    }

    /// Number of PIPs created since the last checkpoint.
    pub fn num_new_pips(&self) -> usize {
        self.new_pips.len()
    }

    fn clear(&mut self) {
        self.updated_last_pip = None;
        self.new_pips.clear();
    }
}

struct DiskArrayState {
    header: DiskArrayHeader,
    write_header: DiskArrayHeader,
    has_transactional_updates: bool,
    pips: Vec<PipWrapper>,
    pip_updates: PipUpdates,
    last_page_on_disk: Option<PageId>,
    shadowed_pages: BTreeSet<PageId>,
}

impl DiskArrayState {
    fn num_elements(&self, kind: TxnKind) -> u64 {
        if kind.sees_uncommitted() {
            self.write_header.num_elements
        } else {
            self.header.num_elements
        }
    }

    fn total_pips(&self) -> usize {
        self.pips.len() + self.pip_updates.new_pips.len()
    }

    fn pip_for_read(&self, pip_idx: usize, kind: TxnKind) -> Option<&Pip> {
        if !kind.sees_uncommitted() {
            return self.pips.get(pip_idx).map(|w| &w.pip);
        }
        if pip_idx + 1 == self.pips.len() {
            if let Some(updated) = &self.pip_updates.updated_last_pip {
                return Some(&updated.pip);
            }
        }
        match self.pips.get(pip_idx) {
            Some(wrapper) => Some(&wrapper.pip),
            None => self
                .pip_updates
                .new_pips
                .get(pip_idx - self.pips.len())
                .map(|w| &w.pip),
        }
    }

    fn ap_page(&self, ap_idx: u64, kind: TxnKind) -> Result<PageId> {
        let pip_idx = (ap_idx / PIP_CAPACITY as u64) as usize;
        let slot = (ap_idx % PIP_CAPACITY as u64) as usize;
        self.pip_for_read(pip_idx, kind)
            .and_then(|pip| pip.slots[slot])
            .ok_or(UmbraError::Corruption("disk array page missing from its PIP"))
    }

    fn updated_last_pip(&mut self) -> Result<&mut PipWrapper> {
        if self.pip_updates.updated_last_pip.is_none() {
            let last = self
                .pips
                .last()
                .cloned()
                .ok_or(UmbraError::Corruption("disk array has no committed PIP"))?;
            self.pip_updates.updated_last_pip = Some(last);
        }
        self.pip_updates
            .updated_last_pip
            .as_mut()
            .ok_or(UmbraError::Corruption("disk array has no committed PIP"))
    }

    fn needs_shadow(&self, page: PageId) -> bool {
        self.last_page_on_disk.map_or(true, |last| page <= last)
    }
}

/// Untyped disk array shared by the typed facade and the collection.
pub struct DiskArrayInternal {
    info: PageStorageInfo,
    element_size: usize,
    fh: Arc<FileHandle>,
    shadow: Arc<ShadowFile>,
    bypass_shadowing: bool,
    state: RwLock<DiskArrayState>,
}

impl DiskArrayInternal {
    /// Opens the array rooted at `header`, walking its PIP chain.
    ///
    /// With `bypass_shadowing`, pages beyond the end of the file as of the
    /// last checkpoint are written in place since no committed copy exists.
    pub fn open(
        header: DiskArrayHeader,
        element_size: usize,
        fh: Arc<FileHandle>,
        shadow: Arc<ShadowFile>,
        bypass_shadowing: bool,
    ) -> Result<Self> {
        let info = PageStorageInfo::new(element_size)?;
        let pips = read_pip_chain(&fh, header.first_pip)?;
        let needed = info
            .num_array_pages(header.num_elements)
            .div_ceil(PIP_CAPACITY as u64);
        if (pips.len() as u64) < needed {
            return Err(UmbraError::Corruption("disk array PIP chain shorter than its header"));
        }
        let last_page_on_disk = last_page_on_disk(&fh, bypass_shadowing);
        Ok(Self {
            info,
            element_size,
            fh,
            shadow,
            bypass_shadowing,
            state: RwLock::new(DiskArrayState {
                header,
                write_header: header,
                has_transactional_updates: false,
                pips,
                pip_updates: PipUpdates::default(),
                last_page_on_disk,
                shadowed_pages: BTreeSet::new(),
            }),
        })
    }

    /// Element size in bytes.
    pub fn element_size(&self) -> usize {
        self.element_size
    }

    fn check_element_len(&self, bytes: &[u8]) -> Result<()> {
        if bytes.len() != self.element_size {
            return Err(UmbraError::Invalid("element bytes do not match the disk array element size"));
        }
        Ok(())
    }

    /// Packing of elements into pages.
    pub fn storage_info(&self) -> PageStorageInfo {
        self.info
    }

    /// Header as seen by `kind`.
    pub fn header(&self, kind: TxnKind) -> DiskArrayHeader {
        let state = self.state.read();
        if kind.sees_uncommitted() {
            state.write_header
        } else {
            state.header
        }
    }

    /// Number of elements visible to `kind`.
    pub fn num_elements(&self, kind: TxnKind) -> u64 {
        self.state.read().num_elements(kind)
    }

    /// Returns true if anything changed since the last checkpoint.
    pub fn has_transactional_updates(&self) -> bool {
        self.state.read().has_transactional_updates
    }

    /// Runs `op` over the bytes of element `idx` as seen by `kind`.
    pub fn get_with<R>(&self, idx: u64, kind: TxnKind, op: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let state = self.state.read();
        let len = state.num_elements(kind);
        if idx >= len {
            return Err(UmbraError::OutOfBounds { idx, len });
        }
        let (ap, offset) = self.info.locate(idx);
        let page = state.ap_page(ap, kind)?;
        let range = offset..offset + self.element_size;
        if kind.sees_uncommitted() {
            utils::read_page_maybe_shadowed(&self.fh, page, &self.shadow, |bytes| op(&bytes[range]))
        } else {
            self.fh.read_page(page, |bytes| op(&bytes[range]))
        }
    }

    /// Overwrites element `idx` in the write view.
    pub fn update(&self, kind: TxnKind, idx: u64, bytes: &[u8]) -> Result<()> {
        if !kind.sees_uncommitted() {
            return Err(UmbraError::Invalid("read-only transactions cannot update a disk array"));
        }
        self.check_element_len(bytes)?;
        let mut state = self.state.write();
        let len = state.write_header.num_elements;
        if idx >= len {
            return Err(UmbraError::OutOfBounds { idx, len });
        }
        let (ap, offset) = self.info.locate(idx);
        let page = state.ap_page(ap, kind)?;
        let mut guard = self.pin_for_write(&mut state, page, false)?;
        guard.data_mut()[offset..offset + self.element_size].copy_from_slice(bytes);
        state.has_transactional_updates = true;
        Ok(())
    }

    /// Appends one element and returns its index.
    pub fn push_back(&self, alloc: &dyn PageAllocator, kind: TxnKind, bytes: &[u8]) -> Result<u64> {
        let mut it = self.iter_mut_raw(alloc, kind)?;
        it.push_back(bytes)?;
        Ok(it.len() - 1)
    }

    /// Grows the array to `new_len` elements filled with `default` and
    /// returns the previous length. Shrinking is not supported.
    pub fn resize(
        &self,
        alloc: &dyn PageAllocator,
        kind: TxnKind,
        new_len: u64,
        default: &[u8],
    ) -> Result<u64> {
        let mut it = self.iter_mut_raw(alloc, kind)?;
        let previous = it.len();
        if new_len < previous {
            return Err(UmbraError::Invalid("disk arrays cannot shrink"));
        }
        while it.len() < new_len {
            it.push_back(default)?;
        }
        Ok(previous)
    }

    fn iter_mut_raw<'a>(&'a self, alloc: &'a dyn PageAllocator, kind: TxnKind) -> Result<RawWriteIterator<'a>> {
        if !kind.sees_uncommitted() {
            return Err(UmbraError::Invalid("read-only transactions cannot write a disk array"));
        }
        Ok(RawWriteIterator {
            array: self,
            state: self.state.write(),
            alloc,
            idx: 0,
            cached: None,
        })
    }

    /// Pins `page` for writing, through a shadow copy unless the page is
    /// newer than the last checkpoint.
    fn pin_for_write(&self, state: &mut DiskArrayState, page: PageId, fresh: bool) -> Result<PageGuard> {
        if state.needs_shadow(page) {
            let frame =
                utils::create_shadow_version_if_necessary_and_pin_page(page, fresh, &self.fh, &self.shadow)?;
            state.shadowed_pages.insert(page);
            return Ok(frame.guard);
        }
        if fresh {
            let mut guard = self.fh.pin_page(page, PageReadPolicy::DontReadPage)?;
            guard.data_mut().fill(0);
            Ok(guard)
        } else {
            self.fh.pin_page(page, PageReadPolicy::ReadPage)
        }
    }

    /// Allocates the next array page and records it in the PIP chain,
    /// creating and linking a new PIP when the last one is full.
    fn add_new_array_page(&self, state: &mut DiskArrayState, alloc: &dyn PageAllocator) -> Result<PageId> {
        let ap_idx = self.info.num_array_pages(state.write_header.num_elements);
        let pip_idx = (ap_idx / PIP_CAPACITY as u64) as usize;
        let slot = (ap_idx % PIP_CAPACITY as u64) as usize;
        let page = alloc.allocate_page()?;

        if pip_idx < state.pips.len() {
            debug_assert_eq!(pip_idx + 1, state.pips.len());
            state.updated_last_pip()?.pip.slots[slot] = Some(page);
        } else if pip_idx < state.total_pips() {
            let new_idx = pip_idx - state.pips.len();
            state.pip_updates.new_pips[new_idx].pip.slots[slot] = Some(page);
        } else {
            let pip_page = alloc.allocate_page()?;
            let mut pip = Pip::empty();
            pip.slots[slot] = Some(page);
            if state.total_pips() == 0 {
                state.write_header.first_pip = Some(pip_page);
            } else if let Some(prev) = state.pip_updates.new_pips.last_mut() {
                prev.pip.next = Some(pip_page);
            } else {
                state.updated_last_pip()?.pip.next = Some(pip_page);
            }
            state.pip_updates.new_pips.push(PipWrapper { page: pip_page, pip });
            debug!(pip = pip_page.0, pip_idx, "disk_array.pip.append");
        }
        state.has_transactional_updates = true;
        Ok(page)
    }

    /// Writes the staged PIPs through shadow pages.
    pub fn checkpoint(&self) -> Result<()> {
        let mut state = self.state.write();
        if state.pip_updates.is_empty() {
            return Ok(());
        }
        let mut written = Vec::new();
        let staged = state
            .pip_updates
            .updated_last_pip
            .iter()
            .chain(state.pip_updates.new_pips.iter());
        for wrapper in staged {
            utils::update_page(&self.fh, wrapper.page, true, &self.shadow, |bytes| {
                wrapper.pip.encode(bytes)
            })?;
            written.push(wrapper.page);
        }
        debug!(pips = written.len(), "disk_array.checkpoint");
        state.shadowed_pages.extend(written);
        Ok(())
    }

    /// Makes the write view the committed view.
    pub fn checkpoint_in_memory_if_necessary(&self) {
        let mut state = self.state.write();
        if !state.has_transactional_updates {
            return;
        }
        state.header = state.write_header;
        let updates = std::mem::take(&mut state.pip_updates);
        if let Some(updated) = updates.updated_last_pip {
            if let Some(last) = state.pips.last_mut() {
                *last = updated;
            }
        }
        state.pips.extend(updates.new_pips);
        self.forget_shadowed_pages(&mut state);
        state.last_page_on_disk = last_page_on_disk(&self.fh, self.bypass_shadowing);
        state.has_transactional_updates = false;
    }

    /// Drops the write view, restoring the committed one.
    pub fn rollback_in_memory_if_necessary(&self) {
        let mut state = self.state.write();
        if !state.has_transactional_updates {
            return;
        }
        state.write_header = state.header;
        state.pip_updates.clear();
        self.forget_shadowed_pages(&mut state);
        state.last_page_on_disk = last_page_on_disk(&self.fh, self.bypass_shadowing);
        state.has_transactional_updates = false;
    }

    fn forget_shadowed_pages(&self, state: &mut DiskArrayState) {
        for page in std::mem::take(&mut state.shadowed_pages) {
            self.shadow.clear_shadow_page(self.fh.file_idx(), page);
        }
    }

    /// Frees every array page and PIP of the write view. The array must not
    /// be used afterwards.
    pub fn reclaim_storage(&self, alloc: &dyn PageAllocator) -> Result<()> {
        let state = self.state.read();
        let mut freed = 0u64;
        for pip_idx in 0..state.total_pips() {
            let page = if pip_idx < state.pips.len() {
                state.pips[pip_idx].page
            } else {
                state.pip_updates.new_pips[pip_idx - state.pips.len()].page
            };
            let pip = state
                .pip_for_read(pip_idx, TxnKind::Write)
                .ok_or(UmbraError::Corruption("disk array PIP missing"))?;
            for slot in pip.slots.iter().flatten() {
                alloc.free_page(*slot);
                freed += 1;
            }
            alloc.free_page(page);
            freed += 1;
        }
        debug!(freed, "disk_array.reclaim");
        Ok(())
    }
}

fn last_page_on_disk(fh: &FileHandle, bypass_shadowing: bool) -> Option<PageId> {
    if bypass_shadowing {
        Some(PageId(fh.num_pages().saturating_sub(1)))
    } else {
        None
    }
}

fn read_pip_chain(fh: &FileHandle, first: Option<PageId>) -> Result<Vec<PipWrapper>> {
    let mut pips = Vec::new();
    let mut next = first;
    while let Some(page) = next {
        if pips.len() as u64 >= fh.num_pages() || page.0 >= fh.num_pages() {
            return Err(UmbraError::Corruption("disk array PIP chain leaves the file"));
        }
        let pip = fh.read_page(page, Pip::decode)?;
        next = pip.next;
        pips.push(PipWrapper { page, pip });
    }
    Ok(pips)
}

struct CachedPage {
    ap_idx: u64,
    guard: PageGuard,
}

/// Write cursor over the raw element bytes. Holds the array's write lock
/// and the pin of the current array page until dropped.
struct RawWriteIterator<'a> {
    array: &'a DiskArrayInternal,
    state: RwLockWriteGuard<'a, DiskArrayState>,
    alloc: &'a dyn PageAllocator,
    idx: u64,
    cached: Option<CachedPage>,
}

impl RawWriteIterator<'_> {
    fn len(&self) -> u64 {
        self.state.write_header.num_elements
    }

    fn pin_array_page(&mut self, ap_idx: u64, fresh: bool) -> Result<()> {
        if matches!(&self.cached, Some(cached) if cached.ap_idx == ap_idx) {
            return Ok(());
        }
        self.cached = None;
        let page = self.state.ap_page(ap_idx, TxnKind::Write)?;
        let guard = self.array.pin_for_write(&mut self.state, page, fresh)?;
        self.cached = Some(CachedPage { ap_idx, guard });
        Ok(())
    }

    fn seek(&mut self, idx: u64) -> Result<()> {
        let len = self.len();
        if idx >= len {
            return Err(UmbraError::OutOfBounds { idx, len });
        }
        let (ap, _) = self.array.info.locate(idx);
        self.pin_array_page(ap, false)?;
        self.idx = idx;
        Ok(())
    }

    fn current(&self) -> Result<&[u8]> {
        let (_, offset) = self.array.info.locate(self.idx);
        let cached = self
            .cached
            .as_ref()
            .ok_or(UmbraError::Invalid("write iterator is not positioned"))?;
        Ok(&cached.guard.data()[offset..offset + self.array.element_size])
    }

    fn set(&mut self, bytes: &[u8]) -> Result<()> {
        self.array.check_element_len(bytes)?;
        let (_, offset) = self.array.info.locate(self.idx);
        let size = self.array.element_size;
        let cached = self
            .cached
            .as_mut()
            .ok_or(UmbraError::Invalid("write iterator is not positioned"))?;
        cached.guard.data_mut()[offset..offset + size].copy_from_slice(bytes);
        self.state.has_transactional_updates = true;
        Ok(())
    }

    fn push_back(&mut self, bytes: &[u8]) -> Result<()> {
        self.array.check_element_len(bytes)?;
        let idx = self.len();
        let (ap, _) = self.array.info.locate(idx);
        let fresh = idx % self.array.info.elements_per_page == 0;
        if fresh {
            self.cached = None;
            self.array.add_new_array_page(&mut self.state, self.alloc)?;
        }
        self.state.write_header.num_elements += 1;
        self.pin_array_page(ap, fresh)?;
        self.idx = idx;
        self.set(bytes)
    }
}

/// Typed write cursor returned by [`DiskArray::iter_mut`]. Consecutive
/// operations on the same array page reuse one pin.
pub struct WriteIterator<'a, T> {
    raw: RawWriteIterator<'a>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: ArrayElement> WriteIterator<'_, T> {
    /// Number of elements in the write view.
    pub fn len(&self) -> u64 {
        self.raw.len()
    }

    /// Returns true if the write view holds no elements.
    pub fn is_empty(&self) -> bool {
        self.raw.len() == 0
    }

    /// Positions the cursor on element `idx`.
    pub fn seek(&mut self, idx: u64) -> Result<&mut Self> {
        self.raw.seek(idx)?;
        Ok(self)
    }

    /// Value under the cursor.
    pub fn get(&self) -> Result<T> {
        Ok(T::decode(self.raw.current()?))
    }

    /// Overwrites the value under the cursor.
    pub fn set(&mut self, value: T) -> Result<()> {
        let mut buf = vec![0u8; T::SIZE];
        value.encode(&mut buf);
        self.raw.set(&buf)
    }

    /// Appends `value` and positions the cursor on it.
    pub fn push_back(&mut self, value: T) -> Result<()> {
        let mut buf = vec![0u8; T::SIZE];
        value.encode(&mut buf);
        self.raw.push_back(&buf)
    }
}

/// Typed facade over a [`DiskArrayInternal`].
pub struct DiskArray<T> {
    inner: Arc<DiskArrayInternal>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for DiskArray<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _marker: PhantomData,
        }
    }
}

fn encode_element<T: ArrayElement>(value: &T) -> Vec<u8> {
    let mut buf = vec![0u8; T::SIZE];
    value.encode(&mut buf);
    buf
}

impl<T: ArrayElement> DiskArray<T> {
    /// Opens the array rooted at `header`.
    pub fn open(
        header: DiskArrayHeader,
        fh: Arc<FileHandle>,
        shadow: Arc<ShadowFile>,
        bypass_shadowing: bool,
    ) -> Result<Self> {
        let inner = DiskArrayInternal::open(header, T::SIZE, fh, shadow, bypass_shadowing)?;
        Ok(Self::from_internal(Arc::new(inner)))
    }

    pub(crate) fn from_internal(inner: Arc<DiskArrayInternal>) -> Self {
        Self {
            inner,
            _marker: PhantomData,
        }
    }

    /// Untyped array behind the facade.
    pub fn internal(&self) -> &Arc<DiskArrayInternal> {
        &self.inner
    }

    /// Element `idx` as seen by `kind`.
    pub fn get(&self, idx: u64, kind: TxnKind) -> Result<T> {
        self.inner.get_with(idx, kind, T::decode)
    }

    /// Overwrites element `idx` in the write view.
    pub fn update(&self, kind: TxnKind, idx: u64, value: T) -> Result<()> {
        self.inner.update(kind, idx, &encode_element(&value))
    }

    /// Appends `value` and returns its index.
    pub fn push_back(&self, alloc: &dyn PageAllocator, kind: TxnKind, value: T) -> Result<u64> {
        self.inner.push_back(alloc, kind, &encode_element(&value))
    }

    /// Grows the array to `new_len` elements and returns the previous length.
    pub fn resize(&self, alloc: &dyn PageAllocator, kind: TxnKind, new_len: u64, default: T) -> Result<u64> {
        self.inner.resize(alloc, kind, new_len, &encode_element(&default))
    }

    /// Write cursor holding the array's write lock; calling other mutating
    /// methods of this array while it is alive deadlocks.
    pub fn iter_mut<'a>(&'a self, alloc: &'a dyn PageAllocator) -> Result<WriteIterator<'a, T>> {
        Ok(WriteIterator {
            raw: self.inner.iter_mut_raw(alloc, TxnKind::Write)?,
            _marker: PhantomData,
        })
    }

    /// Number of elements visible to `kind`.
    pub fn num_elements(&self, kind: TxnKind) -> u64 {
        self.inner.num_elements(kind)
    }

    /// Header as seen by `kind`.
    pub fn header(&self, kind: TxnKind) -> DiskArrayHeader {
        self.inner.header(kind)
    }

    /// See [`DiskArrayInternal::checkpoint`].
    pub fn checkpoint(&self) -> Result<()> {
        self.inner.checkpoint()
    }

    /// See [`DiskArrayInternal::checkpoint_in_memory_if_necessary`].
    pub fn checkpoint_in_memory_if_necessary(&self) {
        self.inner.checkpoint_in_memory_if_necessary()
    }

    /// See [`DiskArrayInternal::rollback_in_memory_if_necessary`].
    pub fn rollback_in_memory_if_necessary(&self) {
        self.inner.rollback_in_memory_if_necessary()
    }

    /// See [`DiskArrayInternal::reclaim_storage`].
    pub fn reclaim_storage(&self, alloc: &dyn PageAllocator) -> Result<()> {
        self.inner.reclaim_storage(alloc)
    }
}
