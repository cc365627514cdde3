//! Process-wide storage handle.
//!
//! [`StorageContext::open`] is called once at startup: it validates the
//! configuration, creates the diagnostics collector (when enabled), opens the
//! pool, brings the schema up to date and starts the idle reaper. The context
//! is cheap to clone and is passed explicitly to whatever needs storage.

use std::sync::Arc;

use tracing::{error, info};

use crate::config::StorageConfig;
use crate::connection::Connection;
use crate::diagnostics::{DiagnosticsConfig, QueryOptimizer};
use crate::errors::{Result, StorageError};
use crate::migrations::MigrationManager;
use crate::pool::{Pool, PoolStats, PooledConnection};

/// Pool, diagnostics and configuration, built once.
#[derive(Clone, Debug)]
pub struct StorageContext {
    config: Arc<StorageConfig>,
    pool: Pool,
    optimizer: Option<Arc<QueryOptimizer>>,
    migrations: Arc<MigrationManager>,
}

impl StorageContext {
    /// Open storage with the built-in schema.
    pub async fn open(config: StorageConfig) -> Result<Self> {
        Self::open_with(config, MigrationManager::with_builtin()).await
    }

    /// Open storage with a custom migration set.
    ///
    /// A migration failure shuts the pool down and is returned as is.
    pub async fn open_with(config: StorageConfig, migrations: MigrationManager) -> Result<Self> {
        config.validate()?;
        let optimizer = config
            .diagnostics_enabled
            .then(|| Arc::new(QueryOptimizer::new(DiagnosticsConfig::from(&config))));
        let pool = Pool::open(&config, optimizer.clone())?;
        let migrations = Arc::new(migrations);

        let runner = Arc::clone(&migrations);
        let applied = pool
            .with_connection(move |conn| runner.migrate(conn))
            .await;
        let applied = match applied {
            Ok(applied) => applied,
            Err(e) => {
                error!(error = %e, "schema migration failed, closing pool");
                pool.shutdown();
                return Err(e);
            }
        };

        pool.spawn_reaper();
        info!(
            database = ?config.database,
            migrations_applied = applied.len(),
            diagnostics = optimizer.is_some(),
            "storage ready"
        );
        Ok(Self {
            config: Arc::new(config),
            pool,
            optimizer,
            migrations,
        })
    }

    /// Configuration the context was opened with.
    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// The connection pool.
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Statistics collector, when diagnostics are enabled.
    pub fn optimizer(&self) -> Option<&Arc<QueryOptimizer>> {
        self.optimizer.as_ref()
    }

    /// Registered migrations.
    pub fn migrations(&self) -> &MigrationManager {
        &self.migrations
    }

    /// Check out a connection.
    pub async fn acquire(&self) -> Result<PooledConnection> {
        self.pool.acquire().await
    }

    /// Run `f` on a pooled connection on a blocking worker.
    pub async fn with_connection<T, E, F>(&self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&mut Connection) -> std::result::Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: From<StorageError> + Send + 'static,
    {
        self.pool.with_connection(f).await
    }

    /// Run `f` inside one transaction on a pooled connection.
    pub async fn with_transaction<T, E, F>(&self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&mut Connection) -> std::result::Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: From<StorageError> + Send + 'static,
    {
        self.pool
            .with_connection(move |conn| conn.run_in_transaction(f))
            .await
    }

    /// Pool counters.
    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Stop the pool. Pending and later acquires fail with
    /// [`StorageError::PoolShuttingDown`].
    pub fn shutdown(&self) {
        self.pool.shutdown();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(unused_results)]
mod tests {
    use super::*;
    use crate::migrations::Migration;
    use crate::repository::{ConfigRepo, MediaType, QueueItemPatch, QueueRepo};
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn open_migrates_and_serves_repositories() {
        let ctx = StorageContext::open(StorageConfig::in_memory()).await.unwrap();
        let item = ctx
            .with_connection(|conn| {
                QueueRepo::create(conn, &QueueItemPatch::new_item(MediaType::Book, "Dune"))
            })
            .await
            .unwrap();
        assert_eq!(item.name, "Dune");

        let version = ctx
            .with_connection(|conn| MigrationManager::with_builtin().current_version(conn))
            .await
            .unwrap();
        assert_eq!(version, 2);
        ctx.shutdown();
    }

    #[tokio::test]
    async fn migration_failure_closes_pool() {
        let mut migrations = MigrationManager::with_builtin();
        migrations
            .add_migration(Migration::sql(3, "broken", "ALTER TABLE nowhere ADD COLUMN x"))
            .unwrap();
        let err = StorageContext::open_with(StorageConfig::in_memory(), migrations)
            .await
            .unwrap_err();
        assert_matches!(err, StorageError::Migration { version: 3, .. });
    }

    #[tokio::test]
    async fn invalid_config_is_rejected_up_front() {
        let config = StorageConfig {
            max_connections: 0,
            ..StorageConfig::in_memory()
        };
        assert_matches!(
            StorageContext::open(config).await,
            Err(StorageError::InvalidConfig(_))
        );
    }

    #[tokio::test]
    async fn diagnostics_follow_config() {
        let ctx = StorageContext::open(StorageConfig::in_memory()).await.unwrap();
        let optimizer = ctx.optimizer().unwrap();
        assert!(optimizer.get_performance_stats().total_queries > 0);

        let quiet = StorageContext::open(StorageConfig {
            diagnostics_enabled: false,
            ..StorageConfig::in_memory()
        })
        .await
        .unwrap();
        assert!(quiet.optimizer().is_none());
    }

    #[tokio::test]
    async fn with_transaction_rolls_back_on_error() {
        let ctx = StorageContext::open(StorageConfig::in_memory()).await.unwrap();
        let result: Result<()> = ctx
            .with_transaction(|conn| {
                ConfigRepo::set_value(conn, "a", "1")?;
                Err(StorageError::Internal("abort".into()))
            })
            .await;
        assert!(result.is_err());
        let value = ctx
            .with_connection(|conn| ConfigRepo::get_value(conn, "a"))
            .await
            .unwrap();
        assert!(value.is_none());
    }

    #[tokio::test]
    async fn shutdown_rejects_acquire() {
        let ctx = StorageContext::open(StorageConfig::in_memory()).await.unwrap();
        let clone = ctx.clone();
        clone.shutdown();
        assert_matches!(ctx.acquire().await, Err(StorageError::PoolShuttingDown));
        assert!(ctx.pool().is_shut_down());
    }
}
