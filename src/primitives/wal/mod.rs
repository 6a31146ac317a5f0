#![forbid(unsafe_code)]
//! Write-ahead log.
//!
//! The storage core only relies on one record kind, the CHECKPOINT marker,
//! whose durability is the commit point of a checkpoint. Other layers may
//! append opaque records that this module stores and returns verbatim.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::primitives::io::{FileIo, OpenMode, Vfs};
use crate::types::{crc32, Result, UmbraError};

const WAL_MAGIC: [u8; 4] = *b"UMBW";
const WAL_FORMAT_VERSION: u16 = 1;
const FILE_HEADER_LEN: usize = 32;
const RECORD_HEADER_LEN: usize = 9;
const MAX_RECORD_LEN: u32 = 64 * 1024 * 1024;

/// Kind byte stored in front of every record.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WalRecordKind {
    /// All shadow pages of a checkpoint are durable and may be applied.
    Checkpoint,
    /// Payload owned by a higher layer.
    Opaque,
}

impl WalRecordKind {
    fn as_u8(self) -> u8 {
        match self {
            WalRecordKind::Checkpoint => 1,
            WalRecordKind::Opaque => 2,
        }
    }

    fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(WalRecordKind::Checkpoint),
            2 => Some(WalRecordKind::Opaque),
            _ => None,
        }
    }
}

/// One decoded log record.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WalRecord {
    /// Record kind.
    pub kind: WalRecordKind,
    /// Record payload; empty for checkpoint markers.
    pub payload: Vec<u8>,
}

/// Statistics tracking WAL operations.
#[derive(Clone, Debug, Default)]
pub struct WalStats {
    /// Records appended since open.
    pub records_appended: u64,
    /// Bytes appended since open.
    pub bytes_appended: u64,
    /// Sync operations performed.
    pub syncs: u64,
}

struct WalInner {
    io: Option<Arc<dyn FileIo>>,
    append_offset: u64,
    stats: WalStats,
}

/// Append-only log file beside the data file.
pub struct Wal {
    path: PathBuf,
    vfs: Arc<dyn Vfs>,
    read_only: bool,
    inner: Mutex<WalInner>,
}

/// Path of the WAL belonging to `db_path`.
pub fn wal_path_for(db_path: &Path) -> PathBuf {
    let mut name = db_path.as_os_str().to_os_string();
    name.push(".wal");
    PathBuf::from(name)
}

fn encode_file_header() -> [u8; FILE_HEADER_LEN] {
    let mut buf = [0u8; FILE_HEADER_LEN];
    buf[0..4].copy_from_slice(&WAL_MAGIC);
    buf[4..6].copy_from_slice(&WAL_FORMAT_VERSION.to_be_bytes());
    let crc = crc32(&[&buf[..28]]);
    buf[28..32].copy_from_slice(&crc.to_be_bytes());
    buf
}

fn validate_file_header(src: &[u8]) -> Result<()> {
    if src.len() < FILE_HEADER_LEN {
        return Err(UmbraError::Corruption("wal header truncated"));
    }
    if src[0..4] != WAL_MAGIC {
        return Err(UmbraError::Corruption("wal magic mismatch"));
    }
    let version = u16::from_be_bytes([src[4], src[5]]);
    if version != WAL_FORMAT_VERSION {
        return Err(UmbraError::Corruption("wal format version mismatch"));
    }
    let stored = u32::from_be_bytes([src[28], src[29], src[30], src[31]]);
    if crc32(&[&src[..28]]) != stored {
        return Err(UmbraError::Corruption("wal header crc mismatch"));
    }
    Ok(())
}

fn encode_record(kind: WalRecordKind, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(RECORD_HEADER_LEN + payload.len());
    buf.push(kind.as_u8());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    let crc = crc32(&[&buf[..5], payload]);
    buf.extend_from_slice(&crc.to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Scans records from the start of the log, stopping at the first torn or
/// corrupt record. Returns the records and the offset just past the last
/// valid one.
fn scan_records(io: &dyn FileIo) -> Result<(Vec<WalRecord>, u64)> {
    let len = io.len()?;
    let mut records = Vec::new();
    let mut offset = FILE_HEADER_LEN as u64;
    while offset + RECORD_HEADER_LEN as u64 <= len {
        let mut header = [0u8; RECORD_HEADER_LEN];
        io.read_at(offset, &mut header)?;
        let Some(kind) = WalRecordKind::from_u8(header[0]) else {
            break;
        };
        let payload_len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
        if payload_len > MAX_RECORD_LEN {
            break;
        }
        let end = offset + RECORD_HEADER_LEN as u64 + u64::from(payload_len);
        if end > len {
            break;
        }
        let mut payload = vec![0u8; payload_len as usize];
        io.read_at(offset + RECORD_HEADER_LEN as u64, &mut payload)?;
        let stored = u32::from_be_bytes([header[5], header[6], header[7], header[8]]);
        if crc32(&[&header[..5], &payload]) != stored {
            warn!(offset, "wal.scan.crc_mismatch");
            break;
        }
        records.push(WalRecord { kind, payload });
        offset = end;
    }
    Ok((records, offset))
}

impl Wal {
    /// Opens the log at `path` if it exists; the file is created lazily on
    /// the first append.
    pub fn open(vfs: Arc<dyn Vfs>, path: impl AsRef<Path>, read_only: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut inner = WalInner {
            io: None,
            append_offset: FILE_HEADER_LEN as u64,
            stats: WalStats::default(),
        };
        if vfs.file_exists(&path) {
            let mode = if read_only {
                OpenMode::ReadOnly
            } else {
                OpenMode::ReadWriteCreate
            };
            let io = vfs.open_file(&path, mode)?;
            if io.len()? >= FILE_HEADER_LEN as u64 {
                let mut header = [0u8; FILE_HEADER_LEN];
                io.read_at(0, &mut header)?;
                validate_file_header(&header)?;
                let (_, valid_up_to) = scan_records(io.as_ref())?;
                inner.append_offset = valid_up_to;
            } else if !read_only {
                io.truncate(0)?;
                io.write_at(0, &encode_file_header())?;
            }
            inner.io = Some(io);
        }
        Ok(Self {
            path,
            vfs,
            read_only,
            inner: Mutex::new(inner),
        })
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_io(&self, inner: &mut WalInner) -> Result<Arc<dyn FileIo>> {
        if self.read_only {
            return Err(UmbraError::ReadOnly("cannot append to the wal"));
        }
        if let Some(io) = &inner.io {
            return Ok(io.clone());
        }
        let io = self.vfs.open_file(&self.path, OpenMode::ReadWriteCreate)?;
        io.truncate(0)?;
        io.write_at(0, &encode_file_header())?;
        inner.append_offset = FILE_HEADER_LEN as u64;
        inner.io = Some(io.clone());
        Ok(io)
    }

    fn append(&self, kind: WalRecordKind, payload: &[u8], sync: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        let io = self.ensure_io(&mut inner)?;
        let record = encode_record(kind, payload);
        io.write_at(inner.append_offset, &record)?;
        inner.append_offset += record.len() as u64;
        inner.stats.records_appended += 1;
        inner.stats.bytes_appended += record.len() as u64;
        if sync {
            io.sync_all()?;
            inner.stats.syncs += 1;
        }
        Ok(())
    }

    /// Appends an opaque record without syncing.
    pub fn log_record(&self, payload: &[u8]) -> Result<()> {
        self.append(WalRecordKind::Opaque, payload, false)
    }

    /// Syncs the log.
    pub fn sync(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(io) = inner.io.clone() {
            io.sync_all()?;
            inner.stats.syncs += 1;
        }
        Ok(())
    }

    /// Appends a CHECKPOINT record and syncs the log.
    pub fn log_and_flush_checkpoint(&self) -> Result<()> {
        self.append(WalRecordKind::Checkpoint, &[], true)?;
        info!(path = %self.path.display(), "wal.checkpoint.logged");
        Ok(())
    }

    /// Drops every record, keeping the file and its header.
    pub fn clear(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(io) = inner.io.clone() {
            io.truncate(FILE_HEADER_LEN as u64)?;
            io.sync_all()?;
            inner.append_offset = FILE_HEADER_LEN as u64;
            debug!("wal.clear");
        }
        Ok(())
    }

    /// Closes and deletes the log file.
    pub fn reset(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.io = None;
        inner.append_offset = FILE_HEADER_LEN as u64;
        if !self.read_only {
            self.vfs.remove_file_if_exists(&self.path)?;
        }
        debug!("wal.reset");
        Ok(())
    }

    /// Size of the log file in bytes; zero when it does not exist.
    pub fn size(&self) -> Result<u64> {
        match &self.inner.lock().io {
            Some(io) => io.len(),
            None => Ok(0),
        }
    }

    /// Returns true if the log file exists.
    pub fn exists(&self) -> bool {
        self.inner.lock().io.is_some()
    }

    /// Every valid record in log order.
    pub fn records(&self) -> Result<Vec<WalRecord>> {
        let io = match &self.inner.lock().io {
            Some(io) => io.clone(),
            None => return Ok(Vec::new()),
        };
        if io.len()? < FILE_HEADER_LEN as u64 {
            return Ok(Vec::new());
        }
        Ok(scan_records(io.as_ref())?.0)
    }

    /// Returns true if the last valid record is a CHECKPOINT marker.
    pub fn last_record_is_checkpoint(&self) -> Result<bool> {
        Ok(self
            .records()?
            .last()
            .is_some_and(|record| record.kind == WalRecordKind::Checkpoint))
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> WalStats {
        self.inner.lock().stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::io::StdVfs;
    use tempfile::tempdir;

    #[test]
    fn wal_is_created_lazily() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.wal");
        let wal = Wal::open(Arc::new(StdVfs), &path, false)?;
        assert!(!wal.exists());
        assert_eq!(wal.size()?, 0);
        wal.log_record(b"insert")?;
        assert!(path.exists());
        assert_eq!(wal.records()?.len(), 1);
        Ok(())
    }

    #[test]
    fn checkpoint_marker_survives_reopen() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.wal");
        {
            let wal = Wal::open(Arc::new(StdVfs), &path, false)?;
            wal.log_record(b"a")?;
            assert!(!wal.last_record_is_checkpoint()?);
            wal.log_and_flush_checkpoint()?;
            assert_eq!(wal.stats().syncs, 1);
        }
        let wal = Wal::open(Arc::new(StdVfs), &path, true)?;
        assert!(wal.last_record_is_checkpoint()?);
        Ok(())
    }

    #[test]
    fn torn_tail_is_ignored() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.wal");
        let vfs: Arc<dyn Vfs> = Arc::new(StdVfs);
        {
            let wal = Wal::open(vfs.clone(), &path, false)?;
            wal.log_record(b"complete")?;
            wal.log_and_flush_checkpoint()?;
        }
        let io = vfs.open_file(&path, OpenMode::ReadWriteCreate)?;
        let len = io.len()?;
        io.truncate(len - 2)?;
        let wal = Wal::open(vfs, &path, false)?;
        let records = wal.records()?;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].payload, b"complete");
        assert!(!wal.last_record_is_checkpoint()?);
        Ok(())
    }

    #[test]
    fn clear_and_reset() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.wal");
        let wal = Wal::open(Arc::new(StdVfs), &path, false)?;
        wal.log_and_flush_checkpoint()?;
        wal.clear()?;
        assert_eq!(wal.size()?, FILE_HEADER_LEN as u64);
        assert!(wal.records()?.is_empty());
        wal.reset()?;
        assert!(!path.exists());
        assert_eq!(wal.size()?, 0);
        Ok(())
    }
}
