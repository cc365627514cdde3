//! Chunked bulk writes on one connection.
//!
//! Input is split into chunks of [`BatchOptions::batch_size`]. Inserts issue
//! one multi-row `INSERT` per chunk, updates one statement per row, deletes
//! one `DELETE ... IN (...)` per chunk. With `use_transaction` the whole call
//! is a single transaction, so a failing chunk undoes every earlier one.
//! When the connection already has a transaction open, the batch joins it.
//!
//! Row mappers return `(column, value)` pairs; every row of an insert must
//! produce the same columns in the same order.

use rusqlite::types::Value;
use tracing::debug;

use crate::connection::Connection;
use crate::errors::{Result, StorageError};
use crate::repository::criteria::{is_identifier, placeholders};

/// `SQLite`'s default `SQLITE_MAX_VARIABLE_NUMBER`.
pub const MAX_BOUND_PARAMETERS: usize = 32_766;

/// Chunking and atomicity settings.
#[derive(Clone, Debug)]
pub struct BatchOptions {
    /// Rows per chunk (default: 100).
    pub batch_size: usize,
    /// Wrap the whole call in one transaction (default: true).
    pub use_transaction: bool,
    /// Key column for updates and deletes (default: `id`).
    pub key_column: String,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            batch_size: 100,
            use_transaction: true,
            key_column: "id".into(),
        }
    }
}

/// Totals for one batch call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BatchResult {
    /// Rows inserted, updated or deleted.
    pub rows_affected: usize,
    /// Chunks executed.
    pub chunks: usize,
}

/// Insert `items` into `table`.
pub fn batch_insert<T, C, F>(
    conn: &mut Connection,
    table: &str,
    items: &[T],
    mut row_mapper: F,
    options: &BatchOptions,
) -> Result<BatchResult>
where
    C: AsRef<str>,
    F: FnMut(&T) -> Vec<(C, Value)>,
{
    check_identifier(table)?;
    check_batch_size(options)?;
    if items.is_empty() {
        return Ok(BatchResult::default());
    }

    let rows: Vec<Vec<(C, Value)>> = items.iter().map(&mut row_mapper).collect();
    let columns: Vec<&str> = rows[0].iter().map(|(c, _)| c.as_ref()).collect();
    if columns.is_empty() {
        return Err(StorageError::InvalidBatch("row mapper produced no columns".into()));
    }
    for column in &columns {
        check_identifier(column)?;
    }
    for (i, row) in rows.iter().enumerate().skip(1) {
        if row.len() != columns.len() || row.iter().zip(&columns).any(|((c, _), want)| c.as_ref() != *want) {
            return Err(StorageError::InvalidBatch(format!(
                "row {i} maps to different columns than row 0"
            )));
        }
    }

    let chunk_size = options
        .batch_size
        .min(MAX_BOUND_PARAMETERS / columns.len())
        .max(1);
    let row_placeholders = format!("({})", placeholders(columns.len()));
    let column_list = columns.join(", ");

    in_scope(conn, options.use_transaction, |c| {
        let mut result = BatchResult::default();
        for (index, chunk) in rows.chunks(chunk_size).enumerate() {
            let values = vec![row_placeholders.as_str(); chunk.len()].join(", ");
            let sql = format!("INSERT INTO {table} ({column_list}) VALUES {values}");
            let params: Vec<Value> = chunk
                .iter()
                .flat_map(|row| row.iter().map(|(_, v)| v.clone()))
                .collect();
            let written = c.execute(&sql, &params)?;
            result.rows_affected += written.rows_affected;
            result.chunks += 1;
            debug!(table, chunk = index, rows = chunk.len(), "batch insert chunk");
        }
        Ok(result)
    })
}

/// Update rows of `table`, one statement per item.
///
/// Each mapped row must include [`BatchOptions::key_column`]; the remaining
/// pairs become the `SET` list.
pub fn batch_update<T, C, F>(
    conn: &mut Connection,
    table: &str,
    updates: &[T],
    mut row_mapper: F,
    options: &BatchOptions,
) -> Result<BatchResult>
where
    C: AsRef<str>,
    F: FnMut(&T) -> Vec<(C, Value)>,
{
    check_identifier(table)?;
    check_identifier(&options.key_column)?;
    check_batch_size(options)?;
    if updates.is_empty() {
        return Ok(BatchResult::default());
    }

    let mut statements = Vec::with_capacity(updates.len());
    for (i, item) in updates.iter().enumerate() {
        let mut key = None;
        let mut assignments = Vec::new();
        let mut params = Vec::new();
        for (column, value) in row_mapper(item) {
            let column = column.as_ref();
            check_identifier(column)?;
            if column == options.key_column {
                key = Some(value);
            } else {
                assignments.push(format!("{column} = ?"));
                params.push(value);
            }
        }
        let key = key.ok_or_else(|| {
            StorageError::InvalidBatch(format!("row {i} has no {} value", options.key_column))
        })?;
        if assignments.is_empty() {
            return Err(StorageError::InvalidBatch(format!("row {i} has nothing to update")));
        }
        params.push(key);
        let sql = format!(
            "UPDATE {table} SET {} WHERE {} = ?",
            assignments.join(", "),
            options.key_column
        );
        statements.push((sql, params));
    }

    in_scope(conn, options.use_transaction, |c| {
        let mut result = BatchResult::default();
        for (index, chunk) in statements.chunks(options.batch_size).enumerate() {
            for (sql, params) in chunk {
                result.rows_affected += c.execute(sql, params)?.rows_affected;
            }
            result.chunks += 1;
            debug!(table, chunk = index, rows = chunk.len(), "batch update chunk");
        }
        Ok(result)
    })
}

/// Delete rows of `table` whose key is in `ids`.
pub fn batch_delete<V>(
    conn: &mut Connection,
    table: &str,
    ids: &[V],
    options: &BatchOptions,
) -> Result<BatchResult>
where
    V: Clone + Into<Value>,
{
    check_identifier(table)?;
    check_identifier(&options.key_column)?;
    check_batch_size(options)?;
    if ids.is_empty() {
        return Ok(BatchResult::default());
    }

    let chunk_size = options.batch_size.min(MAX_BOUND_PARAMETERS);
    in_scope(conn, options.use_transaction, |c| {
        let mut result = BatchResult::default();
        for (index, chunk) in ids.chunks(chunk_size).enumerate() {
            let sql = format!(
                "DELETE FROM {table} WHERE {} IN ({})",
                options.key_column,
                placeholders(chunk.len())
            );
            let params: Vec<Value> = chunk.iter().cloned().map(Into::into).collect();
            result.rows_affected += c.execute(&sql, &params)?.rows_affected;
            result.chunks += 1;
            debug!(table, chunk = index, rows = chunk.len(), "batch delete chunk");
        }
        Ok(result)
    })
}

fn in_scope<F>(conn: &mut Connection, use_transaction: bool, f: F) -> Result<BatchResult>
where
    F: FnOnce(&mut Connection) -> Result<BatchResult>,
{
    if use_transaction && !conn.in_transaction() {
        conn.run_in_transaction(f)
    } else {
        f(conn)
    }
}

fn check_identifier(name: &str) -> Result<()> {
    if is_identifier(name) {
        Ok(())
    } else {
        Err(StorageError::InvalidBatch(format!("not a plain identifier: {name:?}")))
    }
}

fn check_batch_size(options: &BatchOptions) -> Result<()> {
    if options.batch_size == 0 {
        return Err(StorageError::InvalidBatch("batch_size must be at least 1".into()));
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
