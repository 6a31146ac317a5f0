use std::path::PathBuf;

use thiserror::Error;

use crate::types::UmbraError;

/// Failure while inspecting a database directory.
#[derive(Debug, Error)]
pub enum AdminError {
    /// No data file exists at the inspected path.
    #[error("no umbra database at {0}")]
    MissingDatabase(PathBuf),
    /// A file was present but could not be read or validated.
    #[error("inspecting storage: {0}")]
    Storage(#[from] UmbraError),
}

/// Result of an inspection call.
pub type Result<T> = std::result::Result<T, AdminError>;
