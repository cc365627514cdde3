//! Query statistics, plan inspection and indexing advice.
//!
//! [`QueryOptimizer`] is purely observational: it times the closure it is
//! given, records a [`QueryStatistic`] in a bounded ring buffer (oldest
//! evicted first), logs slow statements, and hands the closure's result back
//! untouched. Pooled connections route every statement through it when
//! diagnostics are enabled.

pub mod analyzer;
pub mod normalize;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::params_from_iter;
use rusqlite::types::Value;
use serde::{Serialize, Serializer};
use tracing::warn;

use crate::config::StorageConfig;
use crate::connection::Connection;
use crate::errors::Result;

pub use analyzer::{PlanStep, Severity, Suggestion, SuggestionKind};
pub use normalize::normalize_sql;

#[allow(clippy::trivially_copy_pass_by_ref)]
fn as_millis<S: Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64() * 1_000.0)
}

/// Tuning for the collector.
#[derive(Clone, Debug)]
pub struct DiagnosticsConfig {
    /// Statements at or above this duration are logged as slow.
    pub slow_query_threshold: Duration,
    /// Ring buffer capacity.
    pub max_stats: usize,
    /// Length of the slowest / most-frequent lists.
    pub top_n: usize,
    /// Executions of one shape before a batching hint appears.
    pub repeat_threshold: usize,
    /// Executions filtering on a column before an index is proposed.
    pub index_min_occurrences: usize,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            slow_query_threshold: Duration::from_millis(100),
            max_stats: 1_000,
            top_n: 10,
            repeat_threshold: 10,
            index_min_occurrences: 5,
        }
    }
}

impl From<&StorageConfig> for DiagnosticsConfig {
    fn from(config: &StorageConfig) -> Self {
        Self {
            slow_query_threshold: config.slow_query_threshold(),
            max_stats: config.max_query_stats,
            ..Self::default()
        }
    }
}

/// One executed statement.
#[derive(Clone, Debug, Serialize)]
pub struct QueryStatistic {
    /// SQL as executed.
    pub sql: String,
    /// Shape used for grouping.
    pub normalized: String,
    /// Bound parameters.
    pub param_count: usize,
    /// Wall time.
    #[serde(rename = "duration_ms", serialize_with = "as_millis")]
    pub duration: Duration,
    /// When it finished.
    pub executed_at: DateTime<Utc>,
    /// Whether it returned `Ok`.
    pub succeeded: bool,
}

/// Aggregate over one normalized query shape.
#[derive(Clone, Debug, Serialize)]
pub struct QueryPattern {
    /// Normalized SQL.
    pub normalized: String,
    /// Executions retained.
    pub count: usize,
    /// Mean duration.
    #[serde(rename = "average_ms", serialize_with = "as_millis")]
    pub average: Duration,
    /// Worst duration.
    #[serde(rename = "max_ms", serialize_with = "as_millis")]
    pub max: Duration,
}

/// Summary returned by [`QueryOptimizer::get_performance_stats`].
#[derive(Clone, Debug, Serialize)]
pub struct PerformanceStats {
    /// Statements observed since creation (or the last clear).
    pub total_queries: u64,
    /// Slow statements observed since creation.
    pub slow_queries: u64,
    /// Failed statements observed since creation.
    pub failed_queries: u64,
    /// Statements still in the ring buffer.
    pub retained: usize,
    /// Sum of retained durations.
    #[serde(rename = "total_duration_ms", serialize_with = "as_millis")]
    pub total_duration: Duration,
    /// Mean of retained durations.
    #[serde(rename = "average_duration_ms", serialize_with = "as_millis")]
    pub average_duration: Duration,
    /// Slowest retained statements, slowest first.
    pub slowest: Vec<QueryStatistic>,
    /// Most frequent shapes, most frequent first.
    pub most_frequent: Vec<QueryPattern>,
}

/// A proposed index mined from recent statistics.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct IndexSuggestion {
    /// Table to index.
    pub table: String,
    /// Columns, in index order.
    pub columns: Vec<String>,
    /// Statements that filtered or sorted on these columns.
    pub occurrences: usize,
    /// Ready-to-run DDL.
    pub statement: String,
}

/// Collects statistics and produces advice. Shared behind an `Arc`.
#[derive(Debug)]
pub struct QueryOptimizer {
    config: DiagnosticsConfig,
    stats: Mutex<VecDeque<QueryStatistic>>,
    total_queries: AtomicU64,
    slow_queries: AtomicU64,
    failed_queries: AtomicU64,
}

impl QueryOptimizer {
    /// Create a collector.
    pub fn new(config: DiagnosticsConfig) -> Self {
        let capacity = config.max_stats.max(1);
        Self {
            config,
            stats: Mutex::new(VecDeque::with_capacity(capacity)),
            total_queries: AtomicU64::new(0),
            slow_queries: AtomicU64::new(0),
            failed_queries: AtomicU64::new(0),
        }
    }

    /// Collector settings.
    pub fn config(&self) -> &DiagnosticsConfig {
        &self.config
    }

    /// Time `f`, record it, and return its result unchanged.
    pub fn execute_with_stats<T>(
        &self,
        sql: &str,
        param_count: usize,
        f: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        let started = Instant::now();
        let outcome = f();
        self.record(sql, param_count, started.elapsed(), outcome.is_ok());
        outcome
    }

    /// Record an execution timed elsewhere.
    pub fn record(&self, sql: &str, param_count: usize, duration: Duration, succeeded: bool) {
        let normalized = normalize_sql(sql);
        let _ = self.total_queries.fetch_add(1, Ordering::Relaxed);
        if !succeeded {
            let _ = self.failed_queries.fetch_add(1, Ordering::Relaxed);
        }
        if duration >= self.config.slow_query_threshold {
            let _ = self.slow_queries.fetch_add(1, Ordering::Relaxed);
            warn!(
                sql = %normalized,
                elapsed_ms = duration.as_millis(),
                params = param_count,
                "slow query"
            );
        }

        let stat = QueryStatistic {
            sql: sql.to_string(),
            normalized,
            param_count,
            duration,
            executed_at: Utc::now(),
            succeeded,
        };
        let mut stats = self.stats.lock();
        if stats.len() >= self.config.max_stats.max(1) {
            let _ = stats.pop_front();
        }
        stats.push_back(stat);
    }

    /// Copy of the retained statistics, oldest first.
    pub fn recent(&self) -> Vec<QueryStatistic> {
        self.stats.lock().iter().cloned().collect()
    }

    /// Drop every statistic and reset the counters.
    pub fn clear(&self) {
        self.stats.lock().clear();
        self.total_queries.store(0, Ordering::Relaxed);
        self.slow_queries.store(0, Ordering::Relaxed);
        self.failed_queries.store(0, Ordering::Relaxed);
    }

    /// Run `EXPLAIN QUERY PLAN` for `sql`.
    ///
    /// Goes straight to the underlying handle, so it is neither cached nor
    /// recorded.
    pub fn get_query_plan(&self, conn: &Connection, sql: &str, params: &[Value]) -> Result<Vec<PlanStep>> {
        let mut stmt = conn.raw().prepare(&format!("EXPLAIN QUERY PLAN {sql}"))?;
        let steps = stmt
            .query_map(params_from_iter(params), |row| {
                Ok(PlanStep {
                    id: row.get(0)?,
                    parent: row.get(1)?,
                    detail: row.get(3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(steps)
    }

    /// Ranked advice for `sql`, based on its plan and recent history.
    pub fn analyze_query(&self, conn: &Connection, sql: &str, params: &[Value]) -> Result<Vec<Suggestion>> {
        let plan = self.get_query_plan(conn, sql, params)?;
        let normalized = normalize_sql(sql);
        let repeats = self
            .stats
            .lock()
            .iter()
            .filter(|s| s.normalized == normalized)
            .count();
        Ok(analyzer::analyze(
            sql,
            &plan,
            repeats,
            self.config.repeat_threshold,
        ))
    }

    /// Propose indexes for columns that recent statements keep filtering or
    /// sorting on. Most frequent first.
    pub fn suggest_indexes(&self) -> Vec<IndexSuggestion> {
        let mut counts: HashMap<(String, Vec<String>), usize> = HashMap::new();
        for stat in self.stats.lock().iter() {
            let head = stat.normalized.trim_start().to_ascii_uppercase();
            if !(head.starts_with("SELECT") || head.starts_with("UPDATE") || head.starts_with("DELETE")) {
                continue;
            }
            let Some(table) = analyzer::primary_table(&stat.sql) else {
                continue;
            };
            let filters = analyzer::filter_columns(&stat.sql);
            if !filters.is_empty() {
                *counts.entry((table.clone(), filters)).or_default() += 1;
            }
            let ordering = analyzer::order_columns(&stat.sql);
            if !ordering.is_empty() {
                *counts.entry((table, ordering)).or_default() += 1;
            }
        }

        let mut out: Vec<IndexSuggestion> = counts
            .into_iter()
            .filter(|(_, n)| *n >= self.config.index_min_occurrences)
            .map(|((table, columns), occurrences)| IndexSuggestion {
                statement: analyzer::index_statement(&table, &columns),
                table,
                columns,
                occurrences,
            })
            .collect();
        out.sort_by(|a, b| {
            b.occurrences
                .cmp(&a.occurrences)
                .then_with(|| a.statement.cmp(&b.statement))
        });
        out
    }

    /// [`QueryOptimizer::suggest_indexes`] minus anything an existing index
    /// (or an `INTEGER PRIMARY KEY`) already covers.
    pub fn suggest_missing_indexes(&self, conn: &Connection) -> Result<Vec<IndexSuggestion>> {
        let mut existing: BTreeMap<String, Vec<Vec<String>>> = BTreeMap::new();
        let mut out = Vec::new();
        for suggestion in self.suggest_indexes() {
            if !existing.contains_key(&suggestion.table) {
                let covered = indexed_column_lists(conn, &suggestion.table)?;
                let _ = existing.insert(suggestion.table.clone(), covered);
            }
            let covered = existing
                .get(&suggestion.table)
                .is_some_and(|lists| lists.iter().any(|cols| cols.starts_with(&suggestion.columns)));
            if !covered {
                out.push(suggestion);
            }
        }
        Ok(out)
    }

    /// Totals, averages, slowest statements and most frequent shapes.
    pub fn get_performance_stats(&self) -> PerformanceStats {
        let stats = self.stats.lock();
        let retained = stats.len();
        let total_duration: Duration = stats.iter().map(|s| s.duration).sum();
        let average_duration = u32::try_from(retained)
            .ok()
            .filter(|n| *n > 0)
            .map_or(Duration::ZERO, |n| total_duration / n);

        let mut slowest: Vec<QueryStatistic> = stats.iter().cloned().collect();
        slowest.sort_by(|a, b| b.duration.cmp(&a.duration));
        slowest.truncate(self.config.top_n);

        let mut groups: HashMap<&str, (usize, Duration, Duration)> = HashMap::new();
        for stat in stats.iter() {
            let entry = groups
                .entry(stat.normalized.as_str())
                .or_insert((0, Duration::ZERO, Duration::ZERO));
            entry.0 += 1;
            entry.1 += stat.duration;
            entry.2 = entry.2.max(stat.duration);
        }
        let mut most_frequent: Vec<QueryPattern> = groups
            .into_iter()
            .map(|(normalized, (count, total, max))| QueryPattern {
                normalized: normalized.to_string(),
                count,
                average: u32::try_from(count).map_or(Duration::ZERO, |n| total / n),
                max,
            })
            .collect();
        most_frequent.sort_by(|a, b| {
            b.count
                .cmp(&a.count)
                .then_with(|| a.normalized.cmp(&b.normalized))
        });
        most_frequent.truncate(self.config.top_n);

        PerformanceStats {
            total_queries: self.total_queries.load(Ordering::Relaxed),
            slow_queries: self.slow_queries.load(Ordering::Relaxed),
            failed_queries: self.failed_queries.load(Ordering::Relaxed),
            retained,
            total_duration,
            average_duration,
            slowest,
            most_frequent,
        }
    }
}

fn indexed_column_lists(conn: &Connection, table: &str) -> Result<Vec<Vec<String>>> {
    let raw = conn.raw();
    let mut lists = Vec::new();

    let mut pk_stmt = raw.prepare(&format!("PRAGMA table_info({table})"))?;
    let pk_columns = pk_stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(5)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let pks: Vec<_> = pk_columns.iter().filter(|(_, _, pk)| *pk > 0).collect();
    if let [(name, ty, _)] = pks.as_slice() {
        if ty.eq_ignore_ascii_case("INTEGER") {
            lists.push(vec![name.clone()]);
        }
    }

    let mut list_stmt = raw.prepare(&format!("PRAGMA index_list({table})"))?;
    let names = list_stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    for name in names {
        let mut info = raw.prepare(&format!("PRAGMA index_info(\"{name}\")"))?;
        let columns = info
            .query_map([], |row| row.get::<_, Option<String>>(2))?
            .collect::<std::result::Result<Vec<_>, _>>()?
            .into_iter()
            .flatten()
            .collect();
        lists.push(columns);
    }
    Ok(lists)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(unused_results)]
mod tests {
    use super::*;
    use crate::connection::ConnectionOptions;
    use crate::errors::StorageError;
    use std::sync::Arc;

    fn optimizer(max_stats: usize) -> QueryOptimizer {
        QueryOptimizer::new(DiagnosticsConfig {
            max_stats,
            index_min_occurrences: 3,
            repeat_threshold: 3,
            ..DiagnosticsConfig::default()
        })
    }

    fn conn_with_table() -> Connection {
        let mut conn = Connection::open_in_memory(1, &ConnectionOptions::default()).unwrap();
        conn.execute_batch(
            "CREATE TABLE media (id INTEGER PRIMARY KEY, title TEXT, kind TEXT, year INTEGER);
             CREATE INDEX idx_media_kind ON media(kind);",
        )
        .unwrap();
        conn
    }

    #[test]
    fn result_passes_through_untouched() {
        let opt = optimizer(10);
        let ok = opt.execute_with_stats("SELECT 1", 0, || Ok(7)).unwrap();
        assert_eq!(ok, 7);
        let err = opt
            .execute_with_stats::<()>("SELECT nope", 0, || Err(StorageError::Internal("boom".into())))
            .unwrap_err();
        assert!(matches!(err, StorageError::Internal(ref m) if m == "boom"));

        let stats = opt.get_performance_stats();
        assert_eq!(stats.total_queries, 2);
        assert_eq!(stats.failed_queries, 1);
        assert!(!opt.recent()[1].succeeded);
    }

    #[test]
    fn ring_buffer_evicts_oldest() {
        let opt = optimizer(3);
        for i in 0..5 {
            opt.record(&format!("SELECT {i} AS n /* {i} */"), 0, Duration::ZERO, true);
        }
        let recent = opt.recent();
        assert_eq!(recent.len(), 3);
        assert!(recent[0].sql.starts_with("SELECT 2"));
        assert_eq!(opt.get_performance_stats().total_queries, 5);
    }

    #[test]
    fn slow_queries_counted() {
        let opt = QueryOptimizer::new(DiagnosticsConfig {
            slow_query_threshold: Duration::from_millis(50),
            ..DiagnosticsConfig::default()
        });
        opt.record("SELECT a", 0, Duration::from_millis(10), true);
        opt.record("SELECT b", 0, Duration::from_millis(80), true);
        let stats = opt.get_performance_stats();
        assert_eq!(stats.slow_queries, 1);
        assert_eq!(stats.slowest[0].sql, "SELECT b");
        assert_eq!(stats.total_duration, Duration::from_millis(90));
        assert_eq!(stats.average_duration, Duration::from_millis(45));
    }

    #[test]
    fn most_frequent_groups_by_shape() {
        let opt = optimizer(100);
        for id in 0..4 {
            opt.record(&format!("SELECT * FROM media WHERE id = {id}"), 0, Duration::from_millis(2), true);
        }
        opt.record("SELECT COUNT(*) FROM media", 0, Duration::from_millis(1), true);
        let stats = opt.get_performance_stats();
        assert_eq!(stats.most_frequent[0].normalized, "SELECT * FROM media WHERE id = ?");
        assert_eq!(stats.most_frequent[0].count, 4);
        assert_eq!(stats.most_frequent[0].average, Duration::from_millis(2));
        assert_eq!(stats.most_frequent[1].count, 1);
    }

    #[test]
    fn empty_stats_have_zero_average() {
        let stats = optimizer(10).get_performance_stats();
        assert_eq!(stats.retained, 0);
        assert_eq!(stats.average_duration, Duration::ZERO);
    }

    #[test]
    fn query_plan_reports_scan() {
        let conn = conn_with_table();
        let opt = optimizer(10);
        let plan = opt
            .get_query_plan(&conn, "SELECT title FROM media WHERE title = ?", &[Value::Text("x".into())])
            .unwrap();
        assert!(plan.iter().any(|s| s.detail.starts_with("SCAN media")));

        let indexed = opt
            .get_query_plan(&conn, "SELECT title FROM media WHERE kind = ?", &[Value::Text("tv".into())])
            .unwrap();
        assert!(indexed.iter().any(|s| s.detail.contains("idx_media_kind")));
    }

    #[test]
    fn analyze_query_flags_scan_and_names_column() {
        let conn = conn_with_table();
        let opt = optimizer(10);
        let out = opt
            .analyze_query(&conn, "SELECT * FROM media WHERE title = ?", &[Value::Text("x".into())])
            .unwrap();
        assert_eq!(out[0].kind, SuggestionKind::FullTableScan);
        assert!(out[0].message.contains("title"));
        assert!(out.iter().any(|s| s.kind == SuggestionKind::SelectStar));
        assert!(opt.recent().is_empty(), "plan inspection is not recorded");
    }

    #[test]
    fn analyze_query_notices_repetition() {
        let conn = conn_with_table();
        let opt = optimizer(10);
        for id in 0..3 {
            opt.record(&format!("SELECT title FROM media WHERE id = {id}"), 0, Duration::ZERO, true);
        }
        let out = opt
            .analyze_query(&conn, "SELECT title FROM media WHERE id = ?", &[Value::Integer(1)])
            .unwrap();
        assert!(out.iter().any(|s| s.kind == SuggestionKind::RepeatedQuery));
    }

    #[test]
    fn suggest_indexes_mines_filters_and_ordering() {
        let opt = optimizer(100);
        for _ in 0..3 {
            opt.record("SELECT id FROM media WHERE title = ?", 1, Duration::ZERO, true);
            opt.record("SELECT id FROM media ORDER BY year DESC", 0, Duration::ZERO, true);
        }
        opt.record("SELECT id FROM media WHERE kind = ?", 1, Duration::ZERO, true);
        let suggestions = opt.suggest_indexes();
        let statements: Vec<&str> = suggestions.iter().map(|s| s.statement.as_str()).collect();
        assert_eq!(
            statements,
            vec![
                "CREATE INDEX IF NOT EXISTS idx_media_title ON media(title)",
                "CREATE INDEX IF NOT EXISTS idx_media_year ON media(year)",
            ]
        );
        assert!(suggestions.iter().all(|s| s.occurrences == 3));
    }

    #[test]
    fn suggest_missing_indexes_skips_covered_columns() {
        let conn = conn_with_table();
        let opt = optimizer(100);
        for _ in 0..3 {
            opt.record("SELECT title FROM media WHERE kind = ?", 1, Duration::ZERO, true);
            opt.record("SELECT title FROM media WHERE id = ?", 1, Duration::ZERO, true);
            opt.record("SELECT id FROM media WHERE title = ?", 1, Duration::ZERO, true);
        }
        let missing = opt.suggest_missing_indexes(&conn).unwrap();
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].columns, vec!["title"]);
    }

    #[test]
    fn queue_inserts_never_suggest_rowid_indexes() {
        use crate::migrations::MigrationManager;
        use crate::repository::{MediaType, QueueItemPatch, QueueRepo};

        let mut conn = Connection::open_in_memory(1, &ConnectionOptions::default()).unwrap();
        MigrationManager::with_builtin().migrate(&mut conn).unwrap();
        let opt = Arc::new(optimizer(100));
        conn.set_diagnostics(Some(Arc::clone(&opt)));

        for n in 0..5 {
            QueueRepo::create(&mut conn, &QueueItemPatch::new_item(MediaType::Movie, format!("Film {n}")))
                .unwrap();
        }
        assert!(opt.recent().iter().any(|s| s.sql.contains("rowid")));

        let missing = opt.suggest_missing_indexes(&conn).unwrap();
        for suggestion in &missing {
            assert!(
                suggestion.columns.iter().all(|c| !c.eq_ignore_ascii_case("rowid")),
                "{suggestion:?}"
            );
            assert!(!suggestion.statement.to_lowercase().contains("rowid"), "{suggestion:?}");
        }
    }

    #[test]
    fn pooled_style_connection_records_statements() {
        let opt = Arc::new(optimizer(10));
        let mut conn = conn_with_table();
        conn.set_diagnostics(Some(Arc::clone(&opt)));
        conn.execute("INSERT INTO media (title) VALUES (?)", &[Value::Text("Heat".into())])
            .unwrap();
        let _: Option<String> = conn
            .query_one("SELECT title FROM media WHERE id = ?", &[Value::Integer(1)], |row| Ok(row.get(0)?))
            .unwrap();
        let recent = opt.recent();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].param_count, 1);
        assert!(recent.iter().all(|s| s.succeeded));
    }

    #[test]
    fn clear_resets_everything() {
        let opt = optimizer(10);
        opt.record("SELECT 1", 0, Duration::ZERO, true);
        opt.clear();
        assert!(opt.recent().is_empty());
        assert_eq!(opt.get_performance_stats().total_queries, 0);
    }
}
