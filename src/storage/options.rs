use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::types::{Result, UmbraError};

/// Options supplied when opening storage.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StorageOptions {
    /// Frame capacity of the buffer manager.
    pub buffer_pool_pages: usize,
    /// Whether transactions may trigger a checkpoint when the WAL grows.
    pub auto_checkpoint: bool,
    /// WAL bytes, local plus persistent, above which auto-checkpoint fires.
    pub checkpoint_threshold: u64,
    /// Open without write access; checkpoints are refused.
    pub read_only: bool,
    /// Keep every file in memory; checkpoints do nothing.
    pub in_memory: bool,
    /// Abort open when shadow replay fails instead of discarding the shadow
    /// file.
    pub throw_on_wal_replay_failure: bool,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            buffer_pool_pages: 1024,
            auto_checkpoint: true,
            checkpoint_threshold: 16 * 1024 * 1024,
            read_only: false,
            in_memory: false,
            throw_on_wal_replay_failure: true,
        }
    }
}

impl StorageOptions {
    /// Parses options from a TOML document; missing keys keep their defaults.
    pub fn from_toml_str(src: &str) -> Result<Self> {
        toml::from_str(src).map_err(|err| UmbraError::Config(err.to_string()))
    }

    /// Reads options from the TOML file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .map_err(|err| UmbraError::Config(format!("{}: {err}", path.display())))?;
        Self::from_toml_str(&contents)
    }

    /// Renders the options as TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|err| UmbraError::Config(err.to_string()))
    }
}
