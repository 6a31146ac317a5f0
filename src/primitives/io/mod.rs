#![forbid(unsafe_code)]

use std::{
    collections::HashMap,
    fs::{self, File, OpenOptions},
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::Mutex;

use crate::types::{Result, UmbraError};

#[cfg(test)]
macro_rules! io_test_log {
    ($($arg:tt)*) => {
        eprintln!($($arg)*);
    };
}

#[cfg(not(test))]
macro_rules! io_test_log {
    ($($arg:tt)*) => {
        if false {
            let _ = format_args!($($arg)*);
        }
    };
}

/// Positioned I/O on one open file.
pub trait FileIo: Send + Sync + 'static {
    /// Fills `dst` with the bytes at `off`; reading past the end is an
    /// `UnexpectedEof` I/O error.
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()>;
    /// Writes all of `src` at `off`, extending the file when needed.
    fn write_at(&self, off: u64, src: &[u8]) -> Result<()>;
    /// Flushes data and metadata to stable storage.
    fn sync_all(&self) -> Result<()>;
    /// Current length in bytes.
    fn len(&self) -> Result<u64>;
    /// Returns true if the file holds no bytes.
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
    /// Truncates or extends the file to `len` bytes.
    fn truncate(&self, len: u64) -> Result<()>;
}

/// How a file should be opened through a [`Vfs`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OpenMode {
    /// Existing file, no writes.
    ReadOnly,
    /// Read-write, creating the file if it is missing.
    ReadWriteCreate,
}

/// File system seam: every file the storage core touches is opened here.
pub trait Vfs: Send + Sync + 'static {
    /// Opens `path` with the requested mode.
    fn open_file(&self, path: &Path, mode: OpenMode) -> Result<Arc<dyn FileIo>>;
    /// Deletes `path`, succeeding silently when it does not exist.
    fn remove_file_if_exists(&self, path: &Path) -> Result<()>;
    /// Returns true if `path` exists.
    fn file_exists(&self, path: &Path) -> bool;
}

#[cfg(unix)]
mod positioned {
    use std::{fs::File, io, os::unix::fs::FileExt};

    pub fn read_once(file: &File, dst: &mut [u8], off: u64) -> io::Result<usize> {
        file.read_at(dst, off)
    }

    pub fn write_once(file: &File, src: &[u8], off: u64) -> io::Result<usize> {
        file.write_at(src, off)
    }
}

#[cfg(windows)]
mod positioned {
    use std::{fs::File, io, os::windows::fs::FileExt};

    pub fn read_once(file: &File, dst: &mut [u8], off: u64) -> io::Result<usize> {
        file.seek_read(dst, off)
    }

    pub fn write_once(file: &File, src: &[u8], off: u64) -> io::Result<usize> {
        file.seek_write(src, off)
    }
}

fn read_exact_at(file: &File, mut off: u64, mut dst: &mut [u8]) -> io::Result<()> {
    io_test_log!("[io.read_exact_at] off={} len={}", off, dst.len());
    while !dst.is_empty() {
        match positioned::read_once(file, dst, off) {
            Ok(0) => {
                io_test_log!("[io.read_exact_at] eof off={} remaining={}", off, dst.len());
                return Err(io::Error::new(ErrorKind::UnexpectedEof, "read reached EOF"));
            }
            Ok(read) => {
                dst = &mut dst[read..];
                off += read as u64;
            }
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

fn write_all_at(file: &File, mut off: u64, mut src: &[u8]) -> io::Result<()> {
    io_test_log!("[io.write_all_at] off={} len={}", off, src.len());
    while !src.is_empty() {
        match positioned::write_once(file, src, off) {
            Ok(0) => {
                return Err(io::Error::new(ErrorKind::WriteZero, "write wrote zero bytes"));
            }
            Ok(written) => {
                src = &src[written..];
                off += written as u64;
            }
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

/// [`FileIo`] over an operating-system file.
#[derive(Clone, Debug)]
pub struct StdFileIo {
    inner: Arc<File>,
}

impl StdFileIo {
    /// Wraps an already open file.
    pub fn new(file: File) -> Self {
        Self {
            inner: Arc::new(file),
        }
    }

    /// Opens `path` with the requested mode.
    pub fn open(path: impl AsRef<Path>, mode: OpenMode) -> Result<Self> {
        let mut options = OpenOptions::new();
        options.read(true);
        if mode == OpenMode::ReadWriteCreate {
            options.write(true).create(true).truncate(false);
        }
        let file = options.open(path).map_err(UmbraError::from)?;
        Ok(Self::new(file))
    }
}

impl FileIo for StdFileIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        read_exact_at(&self.inner, off, dst).map_err(UmbraError::from)
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        write_all_at(&self.inner, off, src).map_err(UmbraError::from)
    }

    fn sync_all(&self) -> Result<()> {
        io_test_log!("[io.sync_all]");
        self.inner.sync_all().map_err(UmbraError::from)
    }

    fn len(&self) -> Result<u64> {
        Ok(self.inner.metadata().map_err(UmbraError::from)?.len())
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.inner.set_len(len).map_err(UmbraError::from)
    }
}

/// [`FileIo`] backed by a growable in-memory buffer.
#[derive(Debug, Default)]
pub struct MemFileIo {
    bytes: Mutex<Vec<u8>>,
}

impl MemFileIo {
    /// Copies the current contents out.
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }
}

impl FileIo for MemFileIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.lock();
        let start = off as usize;
        let end = start + dst.len();
        if end > bytes.len() {
            return Err(io::Error::new(ErrorKind::UnexpectedEof, "read reached EOF").into());
        }
        dst.copy_from_slice(&bytes[start..end]);
        Ok(())
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.lock();
        let start = off as usize;
        let end = start + src.len();
        if end > bytes.len() {
            bytes.resize(end, 0);
        }
        bytes[start..end].copy_from_slice(src);
        Ok(())
    }

    fn sync_all(&self) -> Result<()> {
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.bytes.lock().len() as u64)
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.bytes.lock().resize(len as usize, 0);
        Ok(())
    }
}

/// [`Vfs`] over the local file system.
#[derive(Clone, Copy, Debug, Default)]
pub struct StdVfs;

impl Vfs for StdVfs {
    fn open_file(&self, path: &Path, mode: OpenMode) -> Result<Arc<dyn FileIo>> {
        Ok(Arc::new(StdFileIo::open(path, mode)?))
    }

    fn remove_file_if_exists(&self, path: &Path) -> Result<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn file_exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

/// [`Vfs`] whose files live only in memory.
#[derive(Debug, Default)]
pub struct MemVfs {
    files: Mutex<HashMap<PathBuf, Arc<MemFileIo>>>,
}

impl Vfs for MemVfs {
    fn open_file(&self, path: &Path, mode: OpenMode) -> Result<Arc<dyn FileIo>> {
        let mut files = self.files.lock();
        match (files.get(path), mode) {
            (Some(file), _) => Ok(file.clone()),
            (None, OpenMode::ReadOnly) => {
                Err(io::Error::new(ErrorKind::NotFound, "no such in-memory file").into())
            }
            (None, OpenMode::ReadWriteCreate) => {
                let file = Arc::new(MemFileIo::default());
                files.insert(path.to_path_buf(), file.clone());
                Ok(file)
            }
        }
    }

    fn remove_file_if_exists(&self, path: &Path) -> Result<()> {
        self.files.lock().remove(path);
        Ok(())
    }

    fn file_exists(&self, path: &Path) -> bool {
        self.files.lock().contains_key(path)
    }
}
