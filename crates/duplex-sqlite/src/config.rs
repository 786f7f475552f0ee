use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration for the SQLite secondary store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqliteConfig {
    /// Path to the SQLite database file
    pub path: PathBuf,

    /// Enable WAL mode
    /// Default: true
    #[serde(default = "default_true")]
    pub wal_mode: bool,

    /// Synchronous mode
    /// Default: Normal
    #[serde(default)]
    pub synchronous: SynchronousMode,

    /// Cache size in pages (negative = KB)
    /// Default: -64000 (64MB)
    #[serde(default = "default_cache_size")]
    pub cache_size: i32,

    /// How long SQLite waits on a locked database before reporting busy
    /// Default: 5000ms
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SynchronousMode {
    Full,
    #[default]
    Normal,
    Off,
}

fn default_true() -> bool {
    true
}

fn default_cache_size() -> i32 {
    -64000
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

impl SqliteConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            wal_mode: true,
            synchronous: SynchronousMode::default(),
            cache_size: default_cache_size(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }

    pub fn with_wal_mode(mut self, enabled: bool) -> Self {
        self.wal_mode = enabled;
        self
    }

    pub fn with_synchronous(mut self, mode: SynchronousMode) -> Self {
        self.synchronous = mode;
        self
    }
}
