//! # mediaq-store
//!
//! Embedded `SQLite` storage for the mediaq download queue.
//!
//! One database file, many short-lived logical connections, a bounded
//! number of real handles:
//!
//! - [`connection`]: a single handle with explicit transactions and a
//!   bounded prepared-statement cache.
//! - [`pool`]: bounded pool with FIFO hand-off, acquire deadlines, an idle
//!   reaper and shutdown.
//! - [`migrations`]: versioned schema changes, each applied once in its own
//!   transaction.
//! - [`repository`]: generic CRUD over an [`Entity`](repository::Entity),
//!   plus the queue and config repositories.
//! - [`batch`]: chunked bulk insert/update/delete.
//! - [`diagnostics`]: query statistics, plans and index suggestions.
//! - [`context`]: the [`StorageContext`] built once at startup.
//!
//! ```ignore
//! let ctx = StorageContext::open(StorageConfig::file("data/mediaq.db")).await?;
//! let active = ctx.with_connection(|conn| QueueRepo::find_active(conn)).await?;
//! ```

#![deny(unsafe_code)]

pub mod batch;
pub mod config;
pub mod connection;
pub mod context;
pub mod diagnostics;
pub mod errors;
pub mod migrations;
pub mod pool;
pub mod repository;

pub use batch::{BatchOptions, BatchResult, batch_delete, batch_insert, batch_update};
pub use config::{DatabaseLocation, StorageConfig};
pub use connection::{Connection, ConnectionOptions, ExecResult};
pub use context::StorageContext;
pub use diagnostics::{DiagnosticsConfig, QueryOptimizer};
pub use errors::{Result, StorageError};
pub use migrations::{Migration, MigrationManager};
pub use pool::{Pool, PoolStats, PooledConnection};
pub use repository::{
    ConfigEntry, ConfigRepo, Entity, MediaType, QueryCriteria, QueueItem, QueueItemPatch,
    QueueRepo, QueueStatus, Repository, TorrentInfo,
};
pub use rusqlite::types::Value;
