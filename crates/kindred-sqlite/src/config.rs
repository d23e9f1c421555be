//! SQLite backend configuration

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Connection and pragma settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SqliteConfig {
    /// Database file, or `:memory:`
    pub path: PathBuf,
    pub wal_mode: bool,
    pub foreign_keys: bool,
    pub busy_timeout_ms: u32,
    /// Negative values are KiB, positive values pages
    pub cache_size: i64,
    /// 0 disables memory-mapped I/O
    pub mmap_size: u64,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./kindred.db"),
            wal_mode: true,
            foreign_keys: true,
            busy_timeout_ms: 5000,
            cache_size: -16000,
            mmap_size: 0,
        }
    }
}

impl SqliteConfig {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    /// In-memory database; WAL does not apply
    pub fn memory() -> Self {
        Self {
            path: PathBuf::from(":memory:"),
            wal_mode: false,
            ..Self::default()
        }
    }

    pub fn is_memory(&self) -> bool {
        self.path.to_str() == Some(":memory:")
    }
}
