//! Bounded connection pool with FIFO hand-off, idle reaping and shutdown.
//!
//! - `acquire` returns an idle connection, opens a new one while below
//!   `max_connections`, or queues the caller until a connection is released
//!   or the acquire deadline passes.
//! - A released connection goes straight to the longest-waiting caller;
//!   otherwise it joins the idle list.
//! - Connections are handed over as [`PooledConnection`] guards, so a guard
//!   dropped anywhere (including inside a hand-off channel whose receiver went
//!   away) finds its way back to the pool.
//! - The reaper closes connections idle past `idle_timeout`, never one that
//!   is checked out, and always leaves at least one open.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{DatabaseLocation, StorageConfig};
use crate::connection::{Connection, ConnectionOptions};
use crate::diagnostics::QueryOptimizer;
use crate::errors::{Result, StorageError};

/// Pool sizing and timing.
#[derive(Clone, Debug)]
pub struct PoolOptions {
    /// Maximum open connections.
    pub max_connections: usize,
    /// How long `acquire` waits for a connection.
    pub acquire_timeout: Duration,
    /// Idle connections older than this are closed by the reaper.
    pub idle_timeout: Duration,
    /// Reaper period.
    pub reap_interval: Duration,
    /// Settings applied to every connection.
    pub connection: ConnectionOptions,
}

impl From<&StorageConfig> for PoolOptions {
    fn from(config: &StorageConfig) -> Self {
        Self {
            max_connections: config.max_connections as usize,
            acquire_timeout: config.acquire_timeout(),
            idle_timeout: config.idle_timeout(),
            reap_interval: config.reap_interval(),
            connection: ConnectionOptions {
                busy_timeout_ms: config.busy_timeout_ms,
                statement_cache_size: config.statement_cache_size,
            },
        }
    }
}

/// Point-in-time pool counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Open connections (idle + checked out).
    pub total: usize,
    /// Connections currently checked out.
    pub active: usize,
    /// Connections waiting in the idle list.
    pub idle: usize,
    /// Callers queued in `acquire`.
    pub waiting: usize,
    /// Configured maximum.
    pub max: usize,
}

enum Target {
    File(PathBuf),
    SharedMemory(String),
}

struct Waiter {
    id: u64,
    deadline: Instant,
    tx: oneshot::Sender<PooledConnection>,
}

struct PoolState {
    idle: VecDeque<Connection>,
    open: usize,
    waiters: VecDeque<Waiter>,
    next_waiter: u64,
    closed: bool,
}

struct PoolInner {
    target: Target,
    options: PoolOptions,
    diagnostics: Option<Arc<QueryOptimizer>>,
    state: Mutex<PoolState>,
    next_conn_id: AtomicU64,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

/// Cheaply cloneable handle to a connection pool.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool").field("stats", &self.stats()).finish()
    }
}

impl Pool {
    /// Build a pool from storage configuration and open its first connection.
    pub fn open(config: &StorageConfig, diagnostics: Option<Arc<QueryOptimizer>>) -> Result<Self> {
        config.validate()?;
        let target = match &config.database {
            DatabaseLocation::File(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        StorageError::InvalidConfig(format!(
                            "cannot create {}: {e}",
                            parent.display()
                        ))
                    })?;
                }
                Target::File(path.clone())
            }
            DatabaseLocation::Memory => Target::SharedMemory(format!("mediaq-{}", Uuid::now_v7())),
        };
        Self::with_options(target, PoolOptions::from(config), diagnostics)
    }

    fn with_options(
        target: Target,
        options: PoolOptions,
        diagnostics: Option<Arc<QueryOptimizer>>,
    ) -> Result<Self> {
        let inner = Arc::new(PoolInner {
            target,
            options,
            diagnostics,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                open: 0,
                waiters: VecDeque::new(),
                next_waiter: 0,
                closed: false,
            }),
            next_conn_id: AtomicU64::new(1),
            reaper: Mutex::new(None),
        });

        // The first connection is opened eagerly so a bad path fails here.
        let first = inner.open_connection()?;
        {
            let mut state = inner.state.lock();
            state.idle.push_back(first);
            state.open = 1;
        }
        info!(
            max_connections = inner.options.max_connections,
            "connection pool opened"
        );
        Ok(Self { inner })
    }

    /// Check out a connection, waiting up to the acquire timeout.
    pub async fn acquire(&self) -> Result<PooledConnection> {
        let started = Instant::now();
        let pending = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(StorageError::PoolShuttingDown);
            }
            // Most recently returned first, so surplus connections age out.
            if let Some(conn) = state.idle.pop_back() {
                return Ok(PooledConnection::new(conn, &self.inner));
            }
            if state.open < self.inner.options.max_connections {
                state.open += 1;
                None
            } else {
                let (tx, rx) = oneshot::channel();
                let id = state.next_waiter;
                state.next_waiter += 1;
                let deadline = started + self.inner.options.acquire_timeout;
                state.waiters.push_back(Waiter { id, deadline, tx });
                debug!(waiter = id, queued = state.waiters.len(), "pool exhausted, waiting");
                Some((id, rx, deadline))
            }
        };

        match pending {
            None => match self.inner.open_connection() {
                Ok(conn) => Ok(PooledConnection::new(conn, &self.inner)),
                Err(e) => {
                    self.inner.state.lock().open -= 1;
                    Err(e)
                }
            },
            Some((id, rx, deadline)) => self.wait_for_handoff(id, rx, started, deadline).await,
        }
    }

    async fn wait_for_handoff(
        &self,
        id: u64,
        mut rx: oneshot::Receiver<PooledConnection>,
        started: Instant,
        deadline: Instant,
    ) -> Result<PooledConnection> {
        match tokio::time::timeout_at(deadline.into(), &mut rx).await {
            Ok(Ok(conn)) => Ok(conn),
            // Sender dropped without a connection: only shutdown does that.
            Ok(Err(_)) => Err(StorageError::PoolShuttingDown),
            Err(_) => {
                let still_queued = {
                    let mut state = self.inner.state.lock();
                    let before = state.waiters.len();
                    state.waiters.retain(|w| w.id != id);
                    state.waiters.len() != before
                };
                if !still_queued {
                    // Handed over between the deadline and taking the lock.
                    if let Ok(conn) = rx.try_recv() {
                        return Ok(conn);
                    }
                    return Err(StorageError::PoolShuttingDown);
                }
                let waited = started.elapsed();
                debug!(waiter = id, waited_ms = waited.as_millis(), "acquire timed out");
                Err(StorageError::PoolTimeout { waited })
            }
        }
    }

    /// Return a connection to the pool. Equivalent to dropping the guard.
    pub fn release(&self, conn: PooledConnection) {
        drop(conn);
    }

    /// Acquire a connection, run `f` on a blocking worker, and release it.
    ///
    /// The connection is released whether `f` succeeds or fails.
    pub async fn with_connection<T, E, F>(&self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&mut Connection) -> std::result::Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: From<StorageError> + Send + 'static,
    {
        let mut conn = self.acquire().await?;
        let outcome = tokio::task::spawn_blocking(move || {
            let outcome = f(&mut *conn);
            drop(conn);
            outcome
        })
        .await
        .map_err(|e| StorageError::Internal(format!("blocking task failed: {e}")))?;
        outcome
    }

    /// Current counters.
    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            total: state.open,
            active: state.open - state.idle.len(),
            idle: state.idle.len(),
            waiting: state.waiters.iter().filter(|w| !w.tx.is_closed()).count(),
            max: self.inner.options.max_connections,
        }
    }

    /// Whether [`Pool::shutdown`] has been called.
    pub fn is_shut_down(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// The statistics collector attached to every connection, if any.
    pub fn diagnostics(&self) -> Option<&Arc<QueryOptimizer>> {
        self.inner.diagnostics.as_ref()
    }

    /// Close idle connections past the idle timeout. Returns how many closed.
    pub fn sweep_idle(&self) -> usize {
        self.inner.sweep_idle()
    }

    /// Start the background reaper on the current tokio runtime.
    ///
    /// The task holds only a weak reference and exits once the pool is shut
    /// down or dropped.
    pub fn spawn_reaper(&self) {
        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.options.reap_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let _ = ticker.tick().await;
            loop {
                let _ = ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                if inner.state.lock().closed {
                    break;
                }
                let _ = inner.sweep_idle();
            }
        });
        if let Some(previous) = self.inner.reaper.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Reject pending and future acquires, and close every connection.
    ///
    /// Idle connections close now; checked-out ones close when released.
    pub fn shutdown(&self) {
        let (waiters, idle) = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let idle: Vec<Connection> = state.idle.drain(..).collect();
            state.open -= idle.len();
            let waiters: Vec<Waiter> = state.waiters.drain(..).collect();
            (waiters, idle)
        };
        let rejected = waiters.len();
        // Dropping the senders wakes every waiter with `PoolShuttingDown`.
        drop(waiters);
        let closed = idle.len();
        for conn in idle {
            close_logged(conn);
        }
        if let Some(reaper) = self.inner.reaper.lock().take() {
            reaper.abort();
        }
        info!(rejected, closed, "connection pool shut down");
    }
}

impl PoolInner {
    fn open_connection(&self) -> Result<Connection> {
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let mut conn = match &self.target {
            Target::File(path) => Connection::open(path, id, &self.options.connection)?,
            Target::SharedMemory(name) => {
                Connection::open_shared_memory(name, id, &self.options.connection)?
            }
        };
        conn.set_diagnostics(self.diagnostics.clone());
        Ok(conn)
    }

    fn give_back(self: &Arc<Self>, mut conn: Connection) {
        conn.rollback_quietly();
        conn.touch();

        let mut state = self.state.lock();
        if state.closed || conn.in_transaction() {
            state.open -= 1;
            drop(state);
            if conn.in_transaction() {
                warn!(conn_id = conn.id(), "discarding connection stuck in a transaction");
            }
            close_logged(conn);
            return;
        }

        while let Some(waiter) = state.waiters.pop_front() {
            let guard = PooledConnection::new(conn, self);
            match waiter.tx.send(guard) {
                Ok(()) => {
                    debug!(
                        waiter = waiter.id,
                        slack_ms = waiter.deadline.saturating_duration_since(Instant::now()).as_millis(),
                        "connection handed to waiter"
                    );
                    return;
                }
                // Receiver gone (cancelled acquire): try the next one.
                Err(mut returned) => conn = returned.detach(),
            }
        }
        state.idle.push_back(conn);
    }

    fn sweep_idle(&self) -> usize {
        let idle_timeout = self.options.idle_timeout;
        let expired = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.closed {
                return 0;
            }
            let mut keep = VecDeque::with_capacity(state.idle.len());
            let mut expired = Vec::new();
            for conn in state.idle.drain(..) {
                if conn.idle_for() >= idle_timeout && state.open - expired.len() > 1 {
                    expired.push(conn);
                } else {
                    keep.push_back(conn);
                }
            }
            state.idle = keep;
            state.open -= expired.len();
            expired
        };
        let closed = expired.len();
        for conn in expired {
            close_logged(conn);
        }
        if closed > 0 {
            debug!(closed, "reaped idle connections");
        }
        closed
    }
}

fn close_logged(conn: Connection) {
    let id = conn.id();
    if let Err(e) = conn.close() {
        warn!(conn_id = id, error = %e, "failed to close connection");
    }
}

/// A checked-out connection. Dropping it returns the connection to the pool.
pub struct PooledConnection {
    conn: Option<Connection>,
    pool: Arc<PoolInner>,
}

impl PooledConnection {
    fn new(conn: Connection, pool: &Arc<PoolInner>) -> Self {
        Self {
            conn: Some(conn),
            pool: Arc::clone(pool),
        }
    }

    fn detach(&mut self) -> Connection {
        self.conn
            .take()
            .unwrap_or_else(|| unreachable!("pooled connection already detached"))
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PooledConnection").field(&self.conn).finish()
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn
            .as_ref()
            .unwrap_or_else(|| unreachable!("pooled connection already detached"))
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn
            .as_mut()
            .unwrap_or_else(|| unreachable!("pooled connection already detached"))
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.give_back(conn);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
