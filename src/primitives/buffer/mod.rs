//! Buffer manager shared by the data file and the shadow file.
//!
//! Frames are keyed by `(FileIdx, PageId)`. Callers never hold raw frame
//! pointers: [`PageGuard`] and [`PageReadGuard`] own the pin and release it on
//! drop, so every exit path unpins.

use std::collections::{HashMap, VecDeque};
use std::io::ErrorKind;
use std::sync::Arc;

use parking_lot::{
    lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard},
    Mutex, RawRwLock, RwLock,
};
use tracing::debug;

use crate::primitives::io::FileIo;
use crate::types::{FileIdx, PageId, Result, UmbraError, PAGE_SIZE};

mod file_handle;

pub use file_handle::FileHandle;

/// Whether pinning a non-resident page loads its bytes from disk.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PageReadPolicy {
    /// Load the current on-disk contents.
    ReadPage,
    /// Start from a zeroed frame; the caller overwrites the page.
    DontReadPage,
}

type FrameKey = (FileIdx, PageId);
type FrameBuf = Arc<RwLock<Box<[u8]>>>;

struct Frame {
    buf: FrameBuf,
    pin_count: u32,
    dirty: bool,
}

impl Frame {
    fn new() -> Self {
        Self {
            buf: Arc::new(RwLock::new(vec![0u8; PAGE_SIZE].into_boxed_slice())),
            pin_count: 0,
            dirty: false,
        }
    }
}

#[derive(Default)]
struct PoolInner {
    frames: HashMap<FrameKey, Frame>,
    files: HashMap<FileIdx, Arc<dyn FileIo>>,
    eviction_queue: VecDeque<FrameKey>,
}

/// Counters describing buffer pool activity.
#[derive(Clone, Copy, Debug, Default)]
pub struct BufferStats {
    /// Pins served from a resident frame.
    pub hits: u64,
    /// Pins that had to create a frame.
    pub misses: u64,
    /// Frames evicted to make room.
    pub evictions: u64,
    /// Dirty frames written back during eviction or flush.
    pub write_backs: u64,
}

/// Page frames for every file of one open database.
pub struct BufferManager {
    capacity: usize,
    inner: Mutex<PoolInner>,
    stats: Mutex<BufferStats>,
}

/// Exclusive pin on one frame.
pub struct PageGuard {
    /// Page held by this guard.
    pub page: PageId,
    file: FileIdx,
    pool: Arc<BufferManager>,
    guard: Option<ArcRwLockWriteGuard<RawRwLock, Box<[u8]>>>,
    dirty: bool,
}

impl PageGuard {
    /// Page bytes.
    pub fn data(&self) -> &[u8] {
        self.guard.as_deref().map(|buf| &buf[..]).unwrap_or(&[])
    }

    /// Page bytes for writing; marks the frame dirty.
    pub fn data_mut(&mut self) -> &mut [u8] {
        self.dirty = true;
        self.guard.as_deref_mut().map(|buf| &mut buf[..]).unwrap_or(&mut [])
    }

    /// File the page belongs to.
    pub fn file(&self) -> FileIdx {
        self.file
    }
}

impl Drop for PageGuard {
    fn drop(&mut self) {
        if let Some(guard) = self.guard.take() {
            drop(guard);
        }
        self.pool.unpin((self.file, self.page), self.dirty);
    }
}

/// Shared pin on one frame.
pub struct PageReadGuard {
    /// Page held by this guard.
    pub page: PageId,
    file: FileIdx,
    pool: Arc<BufferManager>,
    guard: Option<ArcRwLockReadGuard<RawRwLock, Box<[u8]>>>,
}

impl PageReadGuard {
    /// Page bytes.
    pub fn data(&self) -> &[u8] {
        self.guard.as_deref().map(|buf| &buf[..]).unwrap_or(&[])
    }
}

impl Drop for PageReadGuard {
    fn drop(&mut self) {
        if let Some(guard) = self.guard.take() {
            drop(guard);
        }
        self.pool.unpin((self.file, self.page), false);
    }
}

impl BufferManager {
    /// Creates a pool holding at most `capacity` unpinned frames.
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity: capacity.max(1),
            inner: Mutex::new(PoolInner::default()),
            stats: Mutex::new(BufferStats::default()),
        })
    }

    pub(crate) fn register_file(&self, file: FileIdx, io: Arc<dyn FileIo>) {
        self.inner.lock().files.insert(file, io);
    }

    pub(crate) fn unregister_file(&self, file: FileIdx) {
        let mut inner = self.inner.lock();
        inner.frames.retain(|key, _| key.0 != file);
        inner.eviction_queue.retain(|key| key.0 != file);
        inner.files.remove(&file);
    }

    /// Pins a page for writing.
    pub fn pin(
        self: &Arc<Self>,
        file: FileIdx,
        page: PageId,
        policy: PageReadPolicy,
    ) -> Result<PageGuard> {
        let buf = self.acquire_frame(file, page, policy)?;
        Ok(PageGuard {
            page,
            file,
            pool: Arc::clone(self),
            guard: Some(buf.write_arc()),
            dirty: false,
        })
    }

    /// Pins a page for reading.
    pub fn pin_read(self: &Arc<Self>, file: FileIdx, page: PageId) -> Result<PageReadGuard> {
        let buf = self.acquire_frame(file, page, PageReadPolicy::ReadPage)?;
        Ok(PageReadGuard {
            page,
            file,
            pool: Arc::clone(self),
            guard: Some(buf.read_arc()),
        })
    }

    fn acquire_frame(&self, file: FileIdx, page: PageId, policy: PageReadPolicy) -> Result<FrameBuf> {
        let mut inner = self.inner.lock();
        let key = (file, page);
        if let Some(frame) = inner.frames.get_mut(&key) {
            frame.pin_count += 1;
            self.stats.lock().hits += 1;
            return Ok(frame.buf.clone());
        }
        let io = inner
            .files
            .get(&file)
            .cloned()
            .ok_or(UmbraError::Invalid("file not registered with buffer manager"))?;
        while inner.frames.len() >= self.capacity {
            if !self.evict_one_locked(&mut inner)? {
                break;
            }
        }
        let mut frame = Frame::new();
        if policy == PageReadPolicy::ReadPage {
            let mut buf = frame.buf.write();
            read_page_or_zero(io.as_ref(), page, &mut buf)?;
        }
        frame.pin_count = 1;
        let buf = frame.buf.clone();
        inner.frames.insert(key, frame);
        self.stats.lock().misses += 1;
        Ok(buf)
    }

    fn unpin(&self, key: FrameKey, dirty: bool) {
        let mut inner = self.inner.lock();
        let Some(frame) = inner.frames.get_mut(&key) else {
            return;
        };
        frame.pin_count = frame.pin_count.saturating_sub(1);
        frame.dirty |= dirty;
        if frame.pin_count == 0 {
            inner.eviction_queue.push_back(key);
            if inner.eviction_queue.len() > self.capacity.saturating_mul(4) {
                compact_queue(&mut inner);
            }
        }
    }

    fn evict_one_locked(&self, inner: &mut PoolInner) -> Result<bool> {
        while let Some(key) = inner.eviction_queue.pop_front() {
            let evictable = matches!(inner.frames.get(&key), Some(frame) if frame.pin_count == 0);
            if !evictable {
                continue;
            }
            if let Some(frame) = inner.frames.remove(&key) {
                if frame.dirty {
                    let io = inner
                        .files
                        .get(&key.0)
                        .ok_or(UmbraError::Invalid("file not registered with buffer manager"))?;
                    io.write_at(key.1.offset(), &frame.buf.read())?;
                    self.stats.lock().write_backs += 1;
                }
                self.stats.lock().evictions += 1;
                debug!(file = key.0 .0, page = key.1 .0, dirty = frame.dirty, "buffer.evict");
            }
            return Ok(true);
        }
        if inner.frames.values().all(|frame| frame.pin_count > 0) {
            return Err(UmbraError::Invalid("buffer pool exhausted: every frame is pinned"));
        }
        Ok(false)
    }

    /// Evicts one unpinned page, writing it back if dirty. Returns false when
    /// the page is not resident or still pinned.
    pub fn evict(&self, file: FileIdx, page: PageId) -> Result<bool> {
        let mut inner = self.inner.lock();
        let key = (file, page);
        match inner.frames.get(&key) {
            Some(frame) if frame.pin_count == 0 => {}
            _ => return Ok(false),
        }
        if let Some(frame) = inner.frames.remove(&key) {
            if frame.dirty {
                if let Some(io) = inner.files.get(&file) {
                    io.write_at(page.offset(), &frame.buf.read())?;
                    self.stats.lock().write_backs += 1;
                }
            }
        }
        self.stats.lock().evictions += 1;
        Ok(true)
    }

    /// Drops a frame without writing it back. Used for pages whose contents
    /// no longer matter (freed or truncated pages).
    pub fn remove_page_from_frame(&self, file: FileIdx, page: PageId) {
        self.inner.lock().frames.remove(&(file, page));
    }

    /// Drops every frame of `file` at or beyond `first`, without write-back.
    pub fn remove_pages_from(&self, file: FileIdx, first: PageId) {
        self.inner
            .lock()
            .frames
            .retain(|key, _| key.0 != file || key.1 < first);
    }

    /// Drops every frame of `file`, without write-back.
    pub fn remove_file_pages_from_frames(&self, file: FileIdx) {
        let mut inner = self.inner.lock();
        inner.frames.retain(|key, _| key.0 != file);
        inner.eviction_queue.retain(|key| key.0 != file);
    }

    /// Overwrites a resident frame with `bytes` and marks it clean. Non-resident
    /// pages are left alone.
    pub fn update_frame_if_resident(&self, file: FileIdx, page: PageId, bytes: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(frame) = inner.frames.get_mut(&(file, page)) {
            let mut buf = frame
                .buf
                .try_write()
                .ok_or(UmbraError::Invalid("frame pinned while being refreshed"))?;
            buf.copy_from_slice(bytes);
            frame.dirty = false;
        }
        Ok(())
    }

    /// Writes back every dirty frame of `file`.
    pub fn flush_file(&self, file: FileIdx) -> Result<u64> {
        let mut inner = self.inner.lock();
        let io = match inner.files.get(&file) {
            Some(io) => io.clone(),
            None => return Ok(0),
        };
        let mut written = 0;
        for (key, frame) in inner.frames.iter_mut() {
            if key.0 != file || !frame.dirty {
                continue;
            }
            let buf = frame
                .buf
                .try_read()
                .ok_or(UmbraError::Invalid("frame pinned for writing during flush"))?;
            io.write_at(key.1.offset(), &buf)?;
            drop(buf);
            frame.dirty = false;
            written += 1;
        }
        self.stats.lock().write_backs += written;
        Ok(written)
    }

    /// Purges eviction-queue entries whose frames are gone or repeated.
    pub fn remove_evicted_candidates(&self) {
        let mut inner = self.inner.lock();
        compact_queue(&mut inner);
    }

    /// Number of frames currently pinned.
    pub fn pinned_pages(&self) -> usize {
        self.inner
            .lock()
            .frames
            .values()
            .filter(|frame| frame.pin_count > 0)
            .count()
    }

    /// Number of resident frames.
    pub fn resident_pages(&self) -> usize {
        self.inner.lock().frames.len()
    }

    /// Returns true if the page currently occupies a frame.
    pub fn is_resident(&self, file: FileIdx, page: PageId) -> bool {
        self.inner.lock().frames.contains_key(&(file, page))
    }

    /// Length of the eviction queue, stale entries included.
    pub fn eviction_queue_len(&self) -> usize {
        self.inner.lock().eviction_queue.len()
    }

    /// Snapshot of the pool counters.
    pub fn stats(&self) -> BufferStats {
        *self.stats.lock()
    }
}

fn compact_queue(inner: &mut PoolInner) {
    let PoolInner {
        frames,
        eviction_queue,
        ..
    } = inner;
    let mut seen = std::collections::HashSet::with_capacity(eviction_queue.len());
    eviction_queue.retain(|key| {
        matches!(frames.get(key), Some(frame) if frame.pin_count == 0) && seen.insert(*key)
    });
}

pub(crate) fn read_page_or_zero(io: &dyn FileIo, page: PageId, dst: &mut [u8]) -> Result<()> {
    match io.read_at(page.offset(), dst) {
        Ok(()) => Ok(()),
        Err(UmbraError::Io(err)) if err.kind() == ErrorKind::UnexpectedEof => {
            let len = io.len()?;
            let available = len.saturating_sub(page.offset()) as usize;
            let available = available.min(dst.len());
            dst[available..].fill(0);
            if available > 0 {
                io.read_at(page.offset(), &mut dst[..available])?;
            }
            Ok(())
        }
        Err(err) => Err(err),
    }
}
