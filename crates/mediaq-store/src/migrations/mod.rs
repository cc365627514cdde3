//! Versioned schema migrations.
//!
//! A [`MigrationManager`] holds migrations keyed by version. [`migrate`]
//! applies every registered version that is not yet recorded in
//! `schema_migrations`, in ascending order, each inside its own
//! transaction. A failing migration rolls back alone: earlier ones in the
//! same run stay committed and the call returns [`StorageError::Migration`].
//! Running it again is a no-op once everything is applied.
//!
//! The built-in queue/config schema is embedded with [`include_str!`] and
//! available through [`MigrationManager::with_builtin`].
//!
//! Migration SQL must not contain its own `BEGIN`/`COMMIT`.
//!
//! [`migrate`]: MigrationManager::migrate

use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use rusqlite::types::Value;
use tracing::{debug, info};

use crate::connection::Connection;
use crate::errors::{Result, StorageError};

/// Closure form of a migration step.
pub type MigrationFn = Arc<dyn Fn(&mut Connection) -> Result<()> + Send + Sync>;

/// One direction of a migration.
#[derive(Clone)]
pub enum MigrationStep {
    /// A SQL script, run with [`Connection::execute_batch`].
    Sql(Cow<'static, str>),
    /// Arbitrary work against the connection.
    Func(MigrationFn),
}

impl MigrationStep {
    fn run(&self, conn: &mut Connection) -> Result<()> {
        match self {
            Self::Sql(sql) => conn.execute_batch(sql),
            Self::Func(f) => f(conn),
        }
    }
}

impl std::fmt::Debug for MigrationStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sql(sql) => f.debug_tuple("Sql").field(&sql.len()).finish(),
            Self::Func(_) => f.write_str("Func(..)"),
        }
    }
}

/// A single versioned schema change.
#[derive(Clone, Debug)]
pub struct Migration {
    /// Strictly increasing version number.
    pub version: u32,
    /// Human-readable name, stored alongside the version.
    pub name: String,
    /// Forward step.
    pub up: MigrationStep,
    /// Reverse step, required for [`MigrationManager::rollback_to`].
    pub down: Option<MigrationStep>,
}

impl Migration {
    /// A migration whose forward step is a SQL script.
    pub fn sql(version: u32, name: impl Into<String>, up: impl Into<Cow<'static, str>>) -> Self {
        Self {
            version,
            name: name.into(),
            up: MigrationStep::Sql(up.into()),
            down: None,
        }
    }

    /// A migration whose forward step is a closure.
    pub fn func<F>(version: u32, name: impl Into<String>, up: F) -> Self
    where
        F: Fn(&mut Connection) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            version,
            name: name.into(),
            up: MigrationStep::Func(Arc::new(up)),
            down: None,
        }
    }

    /// Attach a SQL reverse step.
    #[must_use]
    pub fn with_down_sql(mut self, down: impl Into<Cow<'static, str>>) -> Self {
        self.down = Some(MigrationStep::Sql(down.into()));
        self
    }

    /// Attach a closure reverse step.
    #[must_use]
    pub fn with_down_fn<F>(mut self, down: F) -> Self
    where
        F: Fn(&mut Connection) -> Result<()> + Send + Sync + 'static,
    {
        self.down = Some(MigrationStep::Func(Arc::new(down)));
        self
    }
}

/// Registered migrations plus the logic to apply and revert them.
#[derive(Clone, Debug, Default)]
pub struct MigrationManager {
    migrations: BTreeMap<u32, Migration>,
}

impl MigrationManager {
    /// An empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// A manager preloaded with the queue/config schema.
    pub fn with_builtin() -> Self {
        let migrations = [
            Migration::sql(1, "queue and config tables", include_str!("v001_schema.sql"))
                .with_down_sql(include_str!("v001_schema.down.sql")),
            Migration::sql(2, "queue and config indexes", include_str!("v002_indexes.sql"))
                .with_down_sql(include_str!("v002_indexes.down.sql")),
        ];
        Self {
            migrations: migrations.into_iter().map(|m| (m.version, m)).collect(),
        }
    }

    /// Register a migration. Versions must be unique.
    pub fn add_migration(&mut self, migration: Migration) -> Result<()> {
        if self.migrations.contains_key(&migration.version) {
            return Err(StorageError::Migration {
                version: migration.version,
                message: format!("duplicate migration version (\"{}\")", migration.name),
            });
        }
        let _ = self.migrations.insert(migration.version, migration);
        Ok(())
    }

    /// Registered migrations in ascending version order.
    pub fn migrations(&self) -> impl Iterator<Item = &Migration> {
        self.migrations.values()
    }

    /// Highest registered version, or 0.
    pub fn latest_version(&self) -> u32 {
        self.migrations.keys().next_back().copied().unwrap_or(0)
    }

    /// Apply every pending migration. Returns the versions applied by this call.
    pub fn migrate(&self, conn: &mut Connection) -> Result<Vec<u32>> {
        let applied = self.applied_versions(conn)?;
        let mut newly = Vec::new();

        for migration in self.migrations.values() {
            if applied.contains(&migration.version) {
                debug!(
                    version = migration.version,
                    name = %migration.name,
                    "migration already applied, skipping"
                );
                continue;
            }

            info!(version = migration.version, name = %migration.name, "applying migration");
            apply(conn, migration)?;
            newly.push(migration.version);
        }

        if !newly.is_empty() {
            info!(applied = newly.len(), "migrations complete");
        }
        Ok(newly)
    }

    /// Versions recorded in `schema_migrations`.
    pub fn applied_versions(&self, conn: &mut Connection) -> Result<BTreeSet<u32>> {
        ensure_marker_table(conn)?;
        let versions = conn.query_many(
            "SELECT version FROM schema_migrations ORDER BY version",
            &[],
            |row| Ok(row.get::<_, u32>(0)?),
        )?;
        Ok(versions.into_iter().collect())
    }

    /// Highest applied version, or 0.
    pub fn current_version(&self, conn: &mut Connection) -> Result<u32> {
        Ok(self
            .applied_versions(conn)?
            .last()
            .copied()
            .unwrap_or(0))
    }

    /// Registered migrations not yet applied, ascending.
    pub fn pending(&self, conn: &mut Connection) -> Result<Vec<&Migration>> {
        let applied = self.applied_versions(conn)?;
        Ok(self
            .migrations
            .values()
            .filter(|m| !applied.contains(&m.version))
            .collect())
    }

    /// Revert every applied version above `target`, newest first.
    ///
    /// Each reversal runs its `down` step and removes the marker row in one
    /// transaction. Returns the versions reverted.
    pub fn rollback_to(&self, conn: &mut Connection, target: u32) -> Result<Vec<u32>> {
        let applied = self.applied_versions(conn)?;
        let mut reverted = Vec::new();

        for &version in applied.iter().rev().take_while(|v| **v > target) {
            let migration = self.migrations.get(&version).ok_or_else(|| StorageError::Migration {
                version,
                message: "applied version is not registered".into(),
            })?;
            let down = migration.down.as_ref().ok_or_else(|| StorageError::Migration {
                version,
                message: format!("\"{}\" has no down step", migration.name),
            })?;

            info!(version, name = %migration.name, "reverting migration");
            conn.run_in_transaction(|c| {
                down.run(c)?;
                let _ = c.execute(
                    "DELETE FROM schema_migrations WHERE version = ?",
                    &[Value::Integer(i64::from(version))],
                )?;
                Ok(())
            })
            .map_err(|e: StorageError| StorageError::Migration {
                version,
                message: e.to_string(),
            })?;
            reverted.push(version);
        }
        Ok(reverted)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Internal
// ─────────────────────────────────────────────────────────────────────────────

fn ensure_marker_table(conn: &mut Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
           version     INTEGER PRIMARY KEY,
           name        TEXT    NOT NULL,
           applied_at  TEXT    NOT NULL
         );",
    )
}

fn apply(conn: &mut Connection, migration: &Migration) -> Result<()> {
    conn.run_in_transaction(|c| {
        migration.up.run(c)?;
        let _ = c.execute(
            "INSERT INTO schema_migrations (version, name, applied_at) VALUES (?, ?, ?)",
            &[
                Value::Integer(i64::from(migration.version)),
                Value::Text(migration.name.clone()),
                Value::Text(crate::repository::now_rfc3339()),
            ],
        )?;
        Ok(())
    })
    .map_err(|e: StorageError| StorageError::Migration {
        version: migration.version,
        message: format!("\"{}\": {e}", migration.name),
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(unused_results)]
mod tests {
    use super::*;
    use crate::connection::ConnectionOptions;
    use assert_matches::assert_matches;

    fn open_memory() -> Connection {
        Connection::open_in_memory(1, &ConnectionOptions::default()).unwrap()
    }

    fn names(conn: &mut Connection, kind: &str) -> Vec<String> {
        conn.query_many(
            "SELECT name FROM sqlite_master WHERE type = ? ORDER BY name",
            &[Value::Text(kind.into())],
            |row| Ok(row.get(0)?),
        )
        .unwrap()
    }

    #[test]
    fn builtin_creates_tables_and_indexes() {
        let mut conn = open_memory();
        let applied = MigrationManager::with_builtin().migrate(&mut conn).unwrap();
        assert_eq!(applied, vec![1, 2]);

        let tables = names(&mut conn, "table");
        for table in ["config", "queue", "schema_migrations"] {
            assert!(tables.contains(&table.to_string()), "missing table: {table}");
        }
        let indexes = names(&mut conn, "index");
        for idx in [
            "idx_queue_status",
            "idx_queue_created_at",
            "idx_queue_type",
            "idx_queue_tmdb_id",
            "idx_queue_tmdb_season_episode",
            "idx_config_key",
        ] {
            assert!(indexes.contains(&idx.to_string()), "missing index: {idx}");
        }
    }

    #[test]
    fn applied_at_uses_repository_timestamp_format() {
        use crate::repository::{format_timestamp, parse_timestamp};

        let mut conn = open_memory();
        MigrationManager::with_builtin().migrate(&mut conn).unwrap();
        let stamps: Vec<String> = conn
            .query_many("SELECT applied_at FROM schema_migrations ORDER BY version", &[], |row| {
                Ok(row.get(0)?)
            })
            .unwrap();
        assert_eq!(stamps.len(), 2);
        for stamp in &stamps {
            let parsed = parse_timestamp(stamp).unwrap();
            assert_eq!(&format_timestamp(&parsed), stamp);
            assert_eq!(stamp.len(), "2026-01-01T00:00:00.000000Z".len());
            assert!(stamp.ends_with('Z'), "{stamp}");
        }
    }

    #[test]
    fn queue_table_has_expected_columns() {
        let mut conn = open_memory();
        MigrationManager::with_builtin().migrate(&mut conn).unwrap();
        let columns: Vec<String> = conn
            .query_many("SELECT name FROM pragma_table_info('queue')", &[], |row| Ok(row.get(0)?))
            .unwrap();
        let expected = [
            "id", "type", "name", "year", "tmdb_id", "season", "episode", "is_pack", "status",
            "torrent_hash", "torrent_name", "magnet_link", "debrid_id", "progress", "error",
            "file_path", "created_at", "updated_at", "completed_at",
        ];
        assert_eq!(columns, expected);
    }

    #[test]
    fn migrate_is_idempotent() {
        let mut conn = open_memory();
        let manager = MigrationManager::with_builtin();
        assert_eq!(manager.migrate(&mut conn).unwrap().len(), 2);
        assert!(manager.migrate(&mut conn).unwrap().is_empty());

        let markers: i64 = conn
            .query_one("SELECT COUNT(*) FROM schema_migrations", &[], |row| Ok(row.get(0)?))
            .unwrap()
            .unwrap();
        assert_eq!(markers, 2);
    }

    #[test]
    fn duplicate_version_rejected() {
        let mut manager = MigrationManager::new();
        manager.add_migration(Migration::sql(1, "a", "SELECT 1")).unwrap();
        assert_matches!(
            manager.add_migration(Migration::sql(1, "b", "SELECT 2")),
            Err(StorageError::Migration { version: 1, .. })
        );
    }

    #[test]
    fn applies_in_ascending_order_regardless_of_registration() {
        let mut conn = open_memory();
        let mut manager = MigrationManager::new();
        manager
            .add_migration(Migration::sql(2, "second", "INSERT INTO log VALUES ('two')"))
            .unwrap();
        manager
            .add_migration(Migration::sql(1, "first", "CREATE TABLE log (v TEXT)"))
            .unwrap();
        assert_eq!(manager.migrate(&mut conn).unwrap(), vec![1, 2]);
    }

    #[test]
    fn failing_migration_rolls_back_alone() {
        let mut conn = open_memory();
        let mut manager = MigrationManager::new();
        manager
            .add_migration(Migration::sql(1, "ok", "CREATE TABLE a (v INTEGER)"))
            .unwrap();
        manager
            .add_migration(Migration::sql(
                2,
                "broken",
                "CREATE TABLE b (v INTEGER); INSERT INTO missing VALUES (1);",
            ))
            .unwrap();

        let err = manager.migrate(&mut conn).unwrap_err();
        assert_matches!(err, StorageError::Migration { version: 2, .. });
        assert!(!conn.in_transaction());

        let tables = names(&mut conn, "table");
        assert!(tables.contains(&"a".to_string()));
        assert!(!tables.contains(&"b".to_string()));
        assert_eq!(manager.current_version(&mut conn).unwrap(), 1);
        assert_eq!(manager.pending(&mut conn).unwrap().len(), 1);
    }

    #[test]
    fn closure_migrations_run() {
        let mut conn = open_memory();
        let mut manager = MigrationManager::new();
        manager
            .add_migration(Migration::func(1, "seed", |c| {
                c.execute_batch("CREATE TABLE seeds (v INTEGER)")?;
                for v in 0..3 {
                    c.execute("INSERT INTO seeds VALUES (?)", &[Value::Integer(v)])?;
                }
                Ok(())
            }))
            .unwrap();
        manager.migrate(&mut conn).unwrap();
        let n: i64 = conn
            .query_one("SELECT COUNT(*) FROM seeds", &[], |row| Ok(row.get(0)?))
            .unwrap()
            .unwrap();
        assert_eq!(n, 3);
    }

    #[test]
    fn rollback_to_reverts_newest_first() {
        let mut conn = open_memory();
        let manager = MigrationManager::with_builtin();
        manager.migrate(&mut conn).unwrap();

        assert_eq!(manager.rollback_to(&mut conn, 1).unwrap(), vec![2]);
        assert!(!names(&mut conn, "index").contains(&"idx_queue_status".to_string()));
        assert_eq!(manager.current_version(&mut conn).unwrap(), 1);

        assert_eq!(manager.rollback_to(&mut conn, 0).unwrap(), vec![1]);
        assert!(!names(&mut conn, "table").contains(&"queue".to_string()));

        assert_eq!(manager.migrate(&mut conn).unwrap(), vec![1, 2]);
    }

    #[test]
    fn rollback_without_down_fails() {
        let mut conn = open_memory();
        let mut manager = MigrationManager::new();
        manager
            .add_migration(Migration::sql(1, "one-way", "CREATE TABLE t (v INTEGER)"))
            .unwrap();
        manager.migrate(&mut conn).unwrap();
        assert_matches!(
            manager.rollback_to(&mut conn, 0),
            Err(StorageError::Migration { version: 1, .. })
        );
        assert_eq!(manager.current_version(&mut conn).unwrap(), 1);
    }

    #[test]
    fn versions_start_at_zero() {
        let mut conn = open_memory();
        let manager = MigrationManager::with_builtin();
        assert_eq!(manager.current_version(&mut conn).unwrap(), 0);
        assert_eq!(manager.latest_version(), 2);
        assert_eq!(manager.pending(&mut conn).unwrap().len(), 2);
    }
}
