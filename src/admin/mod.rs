#![forbid(unsafe_code)]

//! Offline inspection of database files.
//!
//! Everything here opens files read-only and never runs recovery, so a
//! database can be examined exactly as a crash left it.

mod error;
mod inspect;

/// Error types for administrative operations.
pub use error::{AdminError, Result};

/// Read-only report over the data file, shadow file and WAL.
pub use inspect::{
    inspect, FileSection, FreeSpaceSection, HeaderSection, InspectReport, ShadowSection,
    WalSection,
};
