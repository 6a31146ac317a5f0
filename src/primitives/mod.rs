//! Low-level primitives for building the storage engine.
//!
//! Includes byte serialization, file I/O behind a VFS, the page buffer
//! pool, and the write-ahead log.

/// Byte-level serialization with optional debugging tags.
pub mod bytes;

/// Page buffer pool and per-file handles.
///
/// Frames are pinned through RAII guards and written back on eviction.
pub mod buffer;

/// I/O abstractions and utilities.
///
/// Interfaces for positioned reads/writes and the virtual file system.
pub mod io;

/// Write-ahead logging (WAL) for crash recovery.
pub mod wal;
