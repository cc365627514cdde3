//! Storage configuration supplied by the caller at construction.
//!
//! Nothing in this crate reads the environment. Binaries load a
//! [`StorageConfig`] however they like (the CLI layers a JSON file and
//! `MEDIAQ_*` variables) and hand it to [`crate::StorageContext::open`].

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, StorageError};

/// Where the database lives.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "path")]
pub enum DatabaseLocation {
    /// A single database file on disk.
    File(PathBuf),
    /// A private in-memory database shared by every pooled connection.
    Memory,
}

impl Default for DatabaseLocation {
    fn default() -> Self {
        Self::File(PathBuf::from("mediaq.db"))
    }
}

/// Configuration for the pool, connections and diagnostics.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Database location.
    pub database: DatabaseLocation,
    /// Maximum open connections (default: 10).
    pub max_connections: u32,
    /// Idle connections older than this are closed (default: 30000).
    pub idle_timeout_ms: u64,
    /// How long `acquire` waits before failing (default: 5000).
    pub acquire_timeout_ms: u64,
    /// How often the idle reaper runs (default: 10000).
    pub reap_interval_ms: u64,
    /// Prepared statements cached per connection (default: 100).
    pub statement_cache_size: usize,
    /// `SQLite` busy timeout in milliseconds (default: 5000).
    pub busy_timeout_ms: u32,
    /// Statements slower than this are logged as warnings (default: 100).
    pub slow_query_threshold_ms: u64,
    /// Query statistics retained in the ring buffer (default: 1000).
    pub max_query_stats: usize,
    /// Whether pooled connections record query statistics (default: true).
    pub diagnostics_enabled: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: DatabaseLocation::default(),
            max_connections: 10,
            idle_timeout_ms: 30_000,
            acquire_timeout_ms: 5_000,
            reap_interval_ms: 10_000,
            statement_cache_size: 100,
            busy_timeout_ms: 5_000,
            slow_query_threshold_ms: 100,
            max_query_stats: 1_000,
            diagnostics_enabled: true,
        }
    }
}

impl StorageConfig {
    /// Default configuration over a private in-memory database.
    pub fn in_memory() -> Self {
        Self {
            database: DatabaseLocation::Memory,
            ..Self::default()
        }
    }

    /// Default configuration over the given database file.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            database: DatabaseLocation::File(path.into()),
            ..Self::default()
        }
    }

    /// Reject values the pool cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(StorageError::InvalidConfig(
                "max_connections must be at least 1".into(),
            ));
        }
        if self.statement_cache_size == 0 {
            return Err(StorageError::InvalidConfig(
                "statement_cache_size must be at least 1".into(),
            ));
        }
        if self.reap_interval_ms == 0 {
            return Err(StorageError::InvalidConfig(
                "reap_interval_ms must be positive".into(),
            ));
        }
        if self.max_query_stats == 0 {
            return Err(StorageError::InvalidConfig(
                "max_query_stats must be at least 1".into(),
            ));
        }
        if let DatabaseLocation::File(path) = &self.database {
            if path.as_os_str().is_empty() {
                return Err(StorageError::InvalidConfig("database path is empty".into()));
            }
        }
        Ok(())
    }

    /// Idle timeout as a [`Duration`].
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Acquire timeout as a [`Duration`].
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    /// Reaper interval as a [`Duration`].
    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }

    /// Slow-query threshold as a [`Duration`].
    pub fn slow_query_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_query_threshold_ms)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
