//! Generic CRUD over one table per entity type.
//!
//! An [`Entity`] describes its table, primary key, row mapper and which
//! timestamp columns it maintains. [`Repository`] turns that description
//! into SQL: `create` inserts and re-reads by rowid, `update` writes only
//! the columns present in the patch (plus the update timestamp) and
//! re-reads, `update`/`delete` with no matching row fail with
//! [`StorageError::NotFound`].
//!
//! Like the rest of the crate, repositories are stateless: every function
//! takes the [`Connection`] to run on, so several calls can share one
//! transaction.

pub mod config;
pub mod criteria;
pub mod queue;

use std::fmt::Display;
use std::marker::PhantomData;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Row;
use rusqlite::types::Value;

use crate::connection::Connection;
use crate::errors::{Result, StorageError};

pub use config::{ConfigEntry, ConfigEntryPatch, ConfigRepo};
pub use criteria::{Filter, QueryCriteria};
pub use queue::{MediaType, QueueItem, QueueItemPatch, QueueRepo, QueueStatus, TorrentInfo};

/// A record stored in one table.
pub trait Entity: Sized {
    /// Table name.
    const TABLE: &'static str;
    /// Primary key column.
    const PRIMARY_KEY: &'static str = "id";
    /// Column stamped on insert, if any.
    const CREATED_AT: Option<&'static str> = Some("created_at");
    /// Column stamped on insert and every update, if any.
    const UPDATED_AT: Option<&'static str> = Some("updated_at");

    /// Primary key type.
    type Id: Into<Value> + Clone + Display;
    /// Partial record: only the fields that are set get written.
    type Patch;

    /// Build the entity from a `SELECT *` row.
    fn from_row(row: &Row<'_>) -> Result<Self>;

    /// Columns (and values) present in `patch`.
    fn patch_columns(patch: &Self::Patch) -> Vec<(&'static str, Value)>;
}

/// CRUD functions for entity `E`.
#[derive(Debug)]
pub struct Repository<E>(PhantomData<E>);

impl<E: Entity> Repository<E> {
    /// Fetch by primary key.
    pub fn find_by_id(conn: &mut Connection, id: &E::Id) -> Result<Option<E>> {
        let sql = format!("SELECT * FROM {} WHERE {} = ?", E::TABLE, E::PRIMARY_KEY);
        let key: Value = id.clone().into();
        conn.query_one(&sql, &[key], E::from_row)
    }

    /// Every row matching `criteria`.
    pub fn find_all(conn: &mut Connection, criteria: &QueryCriteria) -> Result<Vec<E>> {
        let (sql, params) = criteria.to_sql(&format!("SELECT * FROM {}", E::TABLE))?;
        conn.query_many(&sql, &params, E::from_row)
    }

    /// First row matching `criteria`.
    pub fn find_one(conn: &mut Connection, criteria: &QueryCriteria) -> Result<Option<E>> {
        let (sql, params) = criteria
            .clone()
            .limit(1)
            .to_sql(&format!("SELECT * FROM {}", E::TABLE))?;
        conn.query_one(&sql, &params, E::from_row)
    }

    /// Insert `patch`, stamping timestamps, and return the stored row.
    pub fn create(conn: &mut Connection, patch: &E::Patch) -> Result<E> {
        let mut columns = E::patch_columns(patch);
        let now = Value::Text(now_rfc3339());
        for stamp in [E::CREATED_AT, E::UPDATED_AT].into_iter().flatten() {
            if !columns.iter().any(|(c, _)| *c == stamp) {
                columns.push((stamp, now.clone()));
            }
        }

        let sql = if columns.is_empty() {
            format!("INSERT INTO {} DEFAULT VALUES", E::TABLE)
        } else {
            let names: Vec<&str> = columns.iter().map(|(c, _)| *c).collect();
            format!(
                "INSERT INTO {} ({}) VALUES ({})",
                E::TABLE,
                names.join(", "),
                criteria::placeholders(names.len())
            )
        };
        let params: Vec<Value> = columns.into_iter().map(|(_, v)| v).collect();
        let inserted = conn.execute(&sql, &params)?;

        let reread = format!("SELECT * FROM {} WHERE rowid = ?", E::TABLE);
        conn.query_one(&reread, &[Value::Integer(inserted.last_insert_id)], E::from_row)?
            .ok_or_else(|| StorageError::Internal(format!("{} row vanished after insert", E::TABLE)))
    }

    /// Write the fields present in `patch` and return the updated row.
    pub fn update(conn: &mut Connection, id: &E::Id, patch: &E::Patch) -> Result<E> {
        let mut columns = E::patch_columns(patch);
        if let Some(stamp) = E::UPDATED_AT {
            columns.retain(|(c, _)| *c != stamp);
            columns.push((stamp, Value::Text(now_rfc3339())));
        }

        if !columns.is_empty() {
            let assignments: Vec<String> = columns.iter().map(|(c, _)| format!("{c} = ?")).collect();
            let sql = format!(
                "UPDATE {} SET {} WHERE {} = ?",
                E::TABLE,
                assignments.join(", "),
                E::PRIMARY_KEY
            );
            let mut params: Vec<Value> = columns.into_iter().map(|(_, v)| v).collect();
            params.push(id.clone().into());
            if conn.execute(&sql, &params)?.rows_affected == 0 {
                return Err(StorageError::not_found(E::TABLE, id));
            }
        }

        Self::find_by_id(conn, id)?.ok_or_else(|| StorageError::not_found(E::TABLE, id))
    }

    /// Delete by primary key.
    pub fn delete(conn: &mut Connection, id: &E::Id) -> Result<()> {
        let sql = format!("DELETE FROM {} WHERE {} = ?", E::TABLE, E::PRIMARY_KEY);
        let key: Value = id.clone().into();
        if conn.execute(&sql, &[key])?.rows_affected == 0 {
            return Err(StorageError::not_found(E::TABLE, id));
        }
        Ok(())
    }

    /// Number of rows matching `criteria` (paging ignored).
    pub fn count(conn: &mut Connection, criteria: &QueryCriteria) -> Result<i64> {
        let (clause, params) = criteria.where_clause()?;
        let sql = format!("SELECT COUNT(*) FROM {}{clause}", E::TABLE);
        Ok(conn
            .query_one(&sql, &params, |row| Ok(row.get(0)?))?
            .unwrap_or(0))
    }

    /// Whether a row with this key exists.
    pub fn exists(conn: &mut Connection, id: &E::Id) -> Result<bool> {
        let sql = format!("SELECT 1 FROM {} WHERE {} = ?", E::TABLE, E::PRIMARY_KEY);
        let key: Value = id.clone().into();
        Ok(conn
            .query_one(&sql, &[key], |_| Ok(()))?
            .is_some())
    }
}

/// Current time as fixed-width RFC 3339 (microseconds, `Z`), so text order
/// is time order.
pub fn now_rfc3339() -> String {
    format_timestamp(&Utc::now())
}

/// Fixed-width RFC 3339 rendering used for every stored timestamp.
pub fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp.
pub fn parse_timestamp(text: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::Mapping(format!("bad timestamp {text:?}: {e}")))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
