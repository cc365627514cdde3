//! Key/value settings (API keys, paths, quality preferences).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rusqlite::Row;
use rusqlite::types::Value;
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::{Entity, QueryCriteria, Repository, now_rfc3339, parse_timestamp};
use crate::batch::MAX_BOUND_PARAMETERS;
use crate::connection::Connection;
use crate::errors::{Result, StorageError};

const UPSERT: &str = "INSERT INTO config (key, value, updated_at) VALUES (?, ?, ?)
     ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at";

/// One stored setting.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ConfigEntry {
    /// Setting name.
    pub key: String,
    /// Stored text, if any.
    pub value: Option<String>,
    /// Last write.
    pub updated_at: DateTime<Utc>,
}

/// Partial setting for the generic repository.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[allow(clippy::option_option)]
pub struct ConfigEntryPatch {
    /// Setting name; required on create.
    pub key: Option<String>,
    /// New value; `Some(None)` stores NULL.
    pub value: Option<Option<String>>,
}

impl Entity for ConfigEntry {
    const TABLE: &'static str = "config";
    const PRIMARY_KEY: &'static str = "key";
    const CREATED_AT: Option<&'static str> = None;
    type Id = String;
    type Patch = ConfigEntryPatch;

    fn from_row(row: &Row<'_>) -> Result<Self> {
        let updated_at: String = row.get("updated_at")?;
        Ok(Self {
            key: row.get("key")?,
            value: row.get("value")?,
            updated_at: parse_timestamp(&updated_at)?,
        })
    }

    fn patch_columns(patch: &ConfigEntryPatch) -> Vec<(&'static str, Value)> {
        let mut cols = Vec::new();
        if let Some(key) = &patch.key {
            cols.push(("key", Value::Text(key.clone())));
        }
        if let Some(value) = &patch.value {
            cols.push(("value", Value::from(value.clone())));
        }
        cols
    }
}

/// Settings access.
#[derive(Debug)]
pub struct ConfigRepo;

type Entries = Repository<ConfigEntry>;

impl ConfigRepo {
    /// Value for `key`; `None` when absent or stored as NULL.
    pub fn get_value(conn: &mut Connection, key: &str) -> Result<Option<String>> {
        let value = conn.query_one(
            "SELECT value FROM config WHERE key = ?",
            &[Value::Text(key.into())],
            |row| Ok(row.get::<_, Option<String>>(0)?),
        )?;
        Ok(value.flatten())
    }

    /// Full entry for `key`.
    pub fn get_entry(conn: &mut Connection, key: &str) -> Result<Option<ConfigEntry>> {
        Entries::find_by_id(conn, &key.to_string())
    }

    /// Insert or overwrite `key`.
    pub fn set_value(conn: &mut Connection, key: &str, value: &str) -> Result<()> {
        let _ = conn.execute(
            UPSERT,
            &[
                Value::Text(key.into()),
                Value::Text(value.into()),
                Value::Text(now_rfc3339()),
            ],
        )?;
        Ok(())
    }

    /// Remove `key`; [`StorageError::NotFound`] when it was absent.
    pub fn delete_value(conn: &mut Connection, key: &str) -> Result<()> {
        Entries::delete(conn, &key.to_string())
    }

    /// Values for several keys. Every requested key is in the result; absent
    /// keys map to `None`. Large key lists are read in bound-parameter-sized
    /// chunks.
    pub fn get_values(conn: &mut Connection, keys: &[&str]) -> Result<BTreeMap<String, Option<String>>> {
        let mut out: BTreeMap<String, Option<String>> =
            keys.iter().map(|k| ((*k).to_string(), None)).collect();
        for chunk in keys.chunks(MAX_BOUND_PARAMETERS) {
            let criteria = QueryCriteria::new().any_of("key", chunk.iter().map(|k| (*k).to_string()));
            let (sql, params) = criteria.to_sql("SELECT key, value FROM config")?;
            let rows = conn.query_many(&sql, &params, |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
            })?;
            for (key, value) in rows {
                let _ = out.insert(key, value);
            }
        }
        Ok(out)
    }

    /// Every entry, by key.
    pub fn get_all(conn: &mut Connection) -> Result<Vec<ConfigEntry>> {
        Entries::find_all(conn, &QueryCriteria::new().order_by("key"))
    }

    /// Entries whose key starts with `prefix`. `%` and `_` in the prefix
    /// match literally.
    pub fn get_by_prefix(conn: &mut Connection, prefix: &str) -> Result<Vec<ConfigEntry>> {
        let pattern = format!("{}%", escape_like(prefix));
        conn.query_many(
            "SELECT * FROM config WHERE key LIKE ? ESCAPE '\\' ORDER BY key",
            &[Value::Text(pattern)],
            ConfigEntry::from_row,
        )
    }

    /// Entries whose key matches a caller-supplied `LIKE` pattern.
    pub fn get_by_pattern(conn: &mut Connection, pattern: &str) -> Result<Vec<ConfigEntry>> {
        conn.query_many(
            "SELECT * FROM config WHERE key LIKE ? ORDER BY key",
            &[Value::Text(pattern.into())],
            ConfigEntry::from_row,
        )
    }

    /// Upsert several pairs atomically. Joins the caller's transaction if
    /// one is already open.
    pub fn set_values(conn: &mut Connection, pairs: &[(&str, &str)]) -> Result<()> {
        if pairs.is_empty() {
            return Ok(());
        }
        let write_all = |c: &mut Connection| -> Result<()> {
            for (key, value) in pairs {
                Self::set_value(c, key, value)?;
            }
            Ok(())
        };
        if conn.in_transaction() {
            write_all(conn)
        } else {
            conn.run_in_transaction(write_all)
        }
    }

    /// Deserialize a JSON-encoded setting.
    pub fn get_json<T: DeserializeOwned>(conn: &mut Connection, key: &str) -> Result<Option<T>> {
        Self::get_value(conn, key)?
            .map(|text| {
                serde_json::from_str(&text)
                    .map_err(|e| StorageError::Mapping(format!("config {key:?} is not valid JSON: {e}")))
            })
            .transpose()
    }

    /// Store a setting as JSON.
    pub fn set_json<T: Serialize>(conn: &mut Connection, key: &str, value: &T) -> Result<()> {
        let text = serde_json::to_string(value)
            .map_err(|e| StorageError::Mapping(format!("config {key:?} cannot be encoded: {e}")))?;
        Self::set_value(conn, key, &text)
    }
}

fn escape_like(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
