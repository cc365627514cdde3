//! One physical handle to the database file.
//!
//! A [`Connection`] wraps a `rusqlite::Connection` with:
//!
//! - an explicit `begin`/`commit`/`rollback` protocol guarded by an
//!   open-transaction flag (at most one open transaction at a time),
//! - [`Connection::run_in_transaction`], which commits on `Ok` and rolls back
//!   on any `Err` from the callback,
//! - a bounded prepared-statement cache ([`StatementCache`]) with
//!   insertion-order eviction,
//! - optional query statistics via an attached [`QueryOptimizer`].
//!
//! Every new connection gets the same pragmas: WAL journal, busy timeout,
//! foreign keys and `synchronous = NORMAL`.

pub mod statement_cache;

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rusqlite::types::Value;
use rusqlite::{CachedStatement, OpenFlags, Row, params_from_iter};
use tracing::{debug, warn};

use crate::diagnostics::QueryOptimizer;
use crate::errors::{Result, StorageError};

pub use statement_cache::{Admission, StatementCache};

/// Outcome of a write statement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExecResult {
    /// Rowid of the most recent successful `INSERT` on this connection.
    pub last_insert_id: i64,
    /// Rows changed by this statement.
    pub rows_affected: usize,
}

/// Per-connection settings.
#[derive(Clone, Debug)]
pub struct ConnectionOptions {
    /// Busy timeout in milliseconds (default: 5000).
    pub busy_timeout_ms: u32,
    /// Maximum cached prepared statements (default: 100).
    pub statement_cache_size: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
            statement_cache_size: 100,
        }
    }
}

/// Pragma state for verification.
#[derive(Debug)]
pub struct PragmaState {
    /// Journal mode (`wal` for files, `memory` for in-memory databases).
    pub journal_mode: String,
    /// Whether foreign keys are enabled.
    pub foreign_keys_enabled: bool,
    /// Busy timeout in milliseconds.
    pub busy_timeout_ms: i64,
}

/// A single handle to the database with transaction tracking and a
/// statement cache.
pub struct Connection {
    id: u64,
    raw: rusqlite::Connection,
    cache: StatementCache,
    in_transaction: bool,
    last_used: Instant,
    diagnostics: Option<Arc<QueryOptimizer>>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("in_transaction", &self.in_transaction)
            .field("cached_statements", &self.cache.len())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Open (or create) a database file.
    pub fn open(path: &Path, id: u64, options: &ConnectionOptions) -> Result<Self> {
        let raw = rusqlite::Connection::open(path)?;
        Self::configure(raw, id, options)
    }

    /// Open a private in-memory database (visible to this connection only).
    pub fn open_in_memory(id: u64, options: &ConnectionOptions) -> Result<Self> {
        let raw = rusqlite::Connection::open_in_memory()?;
        Self::configure(raw, id, options)
    }

    /// Open a named in-memory database shared by every connection using `name`.
    ///
    /// The database lives as long as at least one connection to it is open.
    pub fn open_shared_memory(name: &str, id: u64, options: &ConnectionOptions) -> Result<Self> {
        let uri = format!("file:{name}?mode=memory&cache=shared");
        let raw = rusqlite::Connection::open_with_flags(
            uri,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Self::configure(raw, id, options)
    }

    fn configure(raw: rusqlite::Connection, id: u64, options: &ConnectionOptions) -> Result<Self> {
        raw.execute_batch(&format!(
            "PRAGMA journal_mode = WAL;\
             PRAGMA busy_timeout = {};\
             PRAGMA foreign_keys = ON;\
             PRAGMA synchronous = NORMAL;",
            options.busy_timeout_ms
        ))?;
        let cache = StatementCache::new(options.statement_cache_size);
        // One slot of headroom so rusqlite's own LRU never evicts first.
        raw.set_prepared_statement_cache_capacity(cache.capacity() + 1);
        debug!(conn_id = id, "connection opened");
        Ok(Self {
            id,
            raw,
            cache,
            in_transaction: false,
            last_used: Instant::now(),
            diagnostics: None,
        })
    }

    /// Attach (or detach) a statistics collector.
    pub fn set_diagnostics(&mut self, diagnostics: Option<Arc<QueryOptimizer>>) {
        self.diagnostics = diagnostics;
    }

    /// Pool-assigned identifier.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether a transaction is currently open.
    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    /// When this connection last ran a statement or was returned to the pool.
    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    /// Time since [`Connection::last_used`].
    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    pub(crate) fn touch(&mut self) {
        self.last_used = Instant::now();
    }

    /// The prepared-statement cache bookkeeping.
    pub fn statement_cache(&self) -> &StatementCache {
        &self.cache
    }

    /// Direct access to the underlying handle, bypassing cache and statistics.
    pub fn raw(&self) -> &rusqlite::Connection {
        &self.raw
    }

    // ─────────────────────────────────────────────────────────────────────
    // Statements
    // ─────────────────────────────────────────────────────────────────────

    /// Run a write statement and report the insert id and affected rows.
    pub fn execute(&mut self, sql: &str, params: &[Value]) -> Result<ExecResult> {
        self.observe(sql, params.len(), |conn| {
            let rows_affected = conn.statement(sql)?.execute(params_from_iter(params))?;
            Ok(ExecResult {
                last_insert_id: conn.raw.last_insert_rowid(),
                rows_affected,
            })
        })
    }

    /// Run a query and map its first row, if any.
    pub fn query_one<T, F>(&mut self, sql: &str, params: &[Value], mut map: F) -> Result<Option<T>>
    where
        F: FnMut(&Row<'_>) -> Result<T>,
    {
        self.observe(sql, params.len(), |conn| {
            let mut stmt = conn.statement(sql)?;
            let mut rows = stmt.query(params_from_iter(params))?;
            let first = match rows.next()? {
                Some(row) => Some(map(row)?),
                None => None,
            };
            Ok(first)
        })
    }

    /// Run a query and map every row.
    pub fn query_many<T, F>(&mut self, sql: &str, params: &[Value], mut map: F) -> Result<Vec<T>>
    where
        F: FnMut(&Row<'_>) -> Result<T>,
    {
        self.observe(sql, params.len(), |conn| {
            let mut stmt = conn.statement(sql)?;
            let mut rows = stmt.query(params_from_iter(params))?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(map(row)?);
            }
            Ok(out)
        })
    }

    /// Run a multi-statement script. Scripts are never cached.
    pub fn execute_batch(&mut self, sql: &str) -> Result<()> {
        self.observe(sql, 0, |conn| Ok(conn.raw.execute_batch(sql)?))
    }

    fn statement(&mut self, sql: &str) -> Result<CachedStatement<'_>> {
        let admission = self.cache.admit(sql);
        if let Some(evicted) = admission.evicted {
            if let Ok(stmt) = self.raw.prepare_cached(&evicted) {
                stmt.discard();
            }
            debug!(conn_id = self.id, sql = %evicted, "evicted cached statement");
        }
        match self.raw.prepare_cached(sql) {
            Ok(stmt) => Ok(stmt),
            Err(e) => {
                self.cache.forget(sql);
                Err(e.into())
            }
        }
    }

    fn observe<T>(
        &mut self,
        sql: &str,
        param_count: usize,
        f: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        self.touch();
        match self.diagnostics.clone() {
            Some(diagnostics) => diagnostics.execute_with_stats(sql, param_count, || f(self)),
            None => f(self),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Transactions
    // ─────────────────────────────────────────────────────────────────────

    /// Open a write transaction (`BEGIN IMMEDIATE`).
    pub fn begin_transaction(&mut self) -> Result<()> {
        if self.in_transaction {
            return Err(StorageError::TransactionState(format!(
                "transaction already open on connection {}",
                self.id
            )));
        }
        self.raw.execute_batch("BEGIN IMMEDIATE")?;
        self.in_transaction = true;
        Ok(())
    }

    /// Commit the open transaction.
    pub fn commit(&mut self) -> Result<()> {
        self.finish("COMMIT")
    }

    /// Roll back the open transaction.
    pub fn rollback(&mut self) -> Result<()> {
        self.finish("ROLLBACK")
    }

    fn finish(&mut self, verb: &str) -> Result<()> {
        if !self.in_transaction {
            return Err(StorageError::TransactionState(format!(
                "{verb} with no open transaction on connection {}",
                self.id
            )));
        }
        let outcome = self.raw.execute_batch(verb);
        // A failed COMMIT (e.g. SQLITE_BUSY) can leave the transaction open.
        self.in_transaction = !self.raw.is_autocommit();
        outcome.map_err(StorageError::from)
    }

    /// Run `f` inside a transaction.
    ///
    /// Commits if `f` returns `Ok`. On `Err` (database-related or not) the
    /// transaction is rolled back and the callback's error is returned.
    pub fn run_in_transaction<T, E, F>(&mut self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&mut Self) -> std::result::Result<T, E>,
        E: From<StorageError>,
    {
        self.begin_transaction()?;
        match f(self) {
            Ok(value) => {
                if let Err(e) = self.commit() {
                    self.rollback_quietly();
                    return Err(e.into());
                }
                Ok(value)
            }
            Err(e) => {
                self.rollback_quietly();
                Err(e)
            }
        }
    }

    /// Roll back if a transaction is open, logging instead of failing.
    pub(crate) fn rollback_quietly(&mut self) {
        if !self.in_transaction {
            return;
        }
        if let Err(e) = self.rollback() {
            warn!(conn_id = self.id, error = %e, "rollback failed");
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────

    /// Read back the pragmas applied at open.
    pub fn pragma_state(&self) -> Result<PragmaState> {
        let journal_mode: String = self
            .raw
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
        let foreign_keys: i64 = self
            .raw
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))?;
        let busy_timeout_ms: i64 = self
            .raw
            .query_row("PRAGMA busy_timeout", [], |row| row.get(0))?;
        Ok(PragmaState {
            journal_mode,
            foreign_keys_enabled: foreign_keys == 1,
            busy_timeout_ms,
        })
    }

    /// Close the handle, rolling back any open transaction first.
    pub fn close(mut self) -> Result<()> {
        self.rollback_quietly();
        let Self { id, raw, .. } = self;
        raw.flush_prepared_statement_cache();
        raw.close().map_err(|(_, e)| StorageError::from(e))?;
        debug!(conn_id = id, "connection closed");
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
