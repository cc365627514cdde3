//! Heuristics over query plans and SQL text.
//!
//! This is deliberately shallow: it reads the first table after `FROM`
//! (or `UPDATE`), the plain column references in the `WHERE` clause and the
//! leading `ORDER BY` terms. Joins and subqueries are attributed to the
//! first table.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

static TABLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:FROM|UPDATE|INTO)\s+([A-Za-z_][A-Za-z0-9_]*)").unwrap()
});
static WHERE_CLAUSE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)\bWHERE\b(.*?)(?:\bGROUP\s+BY\b|\bORDER\s+BY\b|\bLIMIT\b|\bRETURNING\b|$)")
        .unwrap()
});
static ORDER_CLAUSE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)\bORDER\s+BY\b(.*?)(?:\bLIMIT\b|$)").unwrap()
});
static FILTER_COLUMN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(?:[A-Za-z_]\w*\.)?([A-Za-z_]\w*)\s*(?:=|!=|<>|<=|>=|<|>|\bIN\b|\bIS\b|\bLIKE\b|\bGLOB\b|\bBETWEEN\b)",
    )
    .unwrap()
});
static PLAN_SCAN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^SCAN (?:TABLE )?([A-Za-z_]\w*)").unwrap()
});
static SELECT_STAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bSELECT\s+(?:DISTINCT\s+)?\*").unwrap());
static LEADING_WILDCARD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bLIKE\s+'%").unwrap());

const KEYWORDS: &[&str] = &["and", "or", "not", "null", "where", "exists"];

/// Names for the implicit rowid; always indexed and never valid in `CREATE INDEX`.
const ROWID_ALIASES: &[&str] = &["rowid", "oid", "_rowid_"];

fn is_rowid_alias(column: &str) -> bool {
    ROWID_ALIASES.iter().any(|alias| column.eq_ignore_ascii_case(alias))
}

/// How urgent a suggestion is. Ordered so that `High > Low`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Style or minor overhead.
    Low,
    /// Noticeable cost on large tables.
    Medium,
    /// Likely the dominant cost of the query.
    High,
}

/// What a suggestion is about.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionKind {
    /// The plan scans a whole table.
    FullTableScan,
    /// Sorting needs a temporary B-tree.
    TempBTreeSort,
    /// `LIKE '%...'` cannot use an index.
    LeadingWildcard,
    /// `SELECT *` reads every column.
    SelectStar,
    /// The same query shape keeps arriving one at a time.
    RepeatedQuery,
}

/// One piece of advice about a query.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Suggestion {
    /// Urgency.
    pub severity: Severity,
    /// Category.
    pub kind: SuggestionKind,
    /// Human-readable advice.
    pub message: String,
    /// Index that would address it, if one applies.
    pub index_statement: Option<String>,
}

/// One row of `EXPLAIN QUERY PLAN`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PlanStep {
    /// Node id.
    pub id: i64,
    /// Parent node id.
    pub parent: i64,
    /// Engine's description (e.g. `SCAN queue`).
    pub detail: String,
}

/// First table named after `FROM`, `UPDATE` or `INTO`.
pub fn primary_table(sql: &str) -> Option<String> {
    TABLE.captures(sql).map(|c| c[1].to_string())
}

/// Columns compared in the `WHERE` clause, in order of first appearance.
pub fn filter_columns(sql: &str) -> Vec<String> {
    let Some(clause) = WHERE_CLAUSE.captures(sql).and_then(|c| c.get(1)) else {
        return Vec::new();
    };
    let mut columns: Vec<String> = Vec::new();
    for cap in FILTER_COLUMN.captures_iter(clause.as_str()) {
        let column = cap[1].to_string();
        if KEYWORDS.contains(&column.to_lowercase().as_str()) || is_rowid_alias(&column) {
            continue;
        }
        if !columns.contains(&column) {
            columns.push(column);
        }
    }
    columns
}

/// Leading column names of the `ORDER BY` clause.
pub fn order_columns(sql: &str) -> Vec<String> {
    let Some(clause) = ORDER_CLAUSE.captures(sql).and_then(|c| c.get(1)) else {
        return Vec::new();
    };
    clause
        .as_str()
        .split(',')
        .filter_map(|term| term.split_whitespace().next())
        .map(|term| term.rsplit('.').next().unwrap_or(term).to_string())
        .filter(|c| c.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '_'))
        .filter(|c| !c.is_empty() && !is_rowid_alias(c))
        .collect()
}

/// `CREATE INDEX IF NOT EXISTS` for `table(columns)`.
pub fn index_statement(table: &str, columns: &[String]) -> String {
    format!(
        "CREATE INDEX IF NOT EXISTS idx_{table}_{} ON {table}({})",
        columns.join("_"),
        columns.join(", ")
    )
}

/// Inspect a plan and the SQL that produced it.
///
/// `repeat_count` is how many recent executions share this query's shape;
/// at or above `repeat_threshold` a batching hint is added. Results are
/// sorted most severe first.
pub fn analyze(
    sql: &str,
    plan: &[PlanStep],
    repeat_count: usize,
    repeat_threshold: usize,
) -> Vec<Suggestion> {
    let mut suggestions = Vec::new();
    let filters = filter_columns(sql);
    let ordering = order_columns(sql);

    for step in plan {
        if let Some(cap) = PLAN_SCAN.captures(&step.detail) {
            if step.detail.contains(" USING ") {
                continue;
            }
            let table = cap[1].to_string();
            if filters.is_empty() {
                suggestions.push(Suggestion {
                    severity: Severity::Medium,
                    kind: SuggestionKind::FullTableScan,
                    message: format!(
                        "full table scan on {table} with no filter; add a WHERE clause or LIMIT"
                    ),
                    index_statement: None,
                });
            } else {
                suggestions.push(Suggestion {
                    severity: Severity::High,
                    kind: SuggestionKind::FullTableScan,
                    message: format!(
                        "full table scan detected on {table}, add index on column {}",
                        filters.join(", ")
                    ),
                    index_statement: Some(index_statement(&table, &filters)),
                });
            }
        } else if step.detail.contains("USE TEMP B-TREE FOR ORDER BY") {
            let table = primary_table(sql);
            suggestions.push(Suggestion {
                severity: Severity::Medium,
                kind: SuggestionKind::TempBTreeSort,
                message: format!(
                    "ORDER BY {} sorts in a temporary B-tree; an index can return rows pre-sorted",
                    ordering.join(", ")
                ),
                index_statement: table
                    .filter(|_| !ordering.is_empty())
                    .map(|t| index_statement(&t, &ordering)),
            });
        }
    }

    if LEADING_WILDCARD.is_match(sql) {
        suggestions.push(Suggestion {
            severity: Severity::Medium,
            kind: SuggestionKind::LeadingWildcard,
            message: "LIKE pattern starts with '%', so no index can be used".into(),
            index_statement: None,
        });
    }

    if SELECT_STAR.is_match(sql) {
        suggestions.push(Suggestion {
            severity: Severity::Low,
            kind: SuggestionKind::SelectStar,
            message: "SELECT * discouraged; list the columns you need".into(),
            index_statement: None,
        });
    }

    if repeat_threshold > 0 && repeat_count >= repeat_threshold {
        suggestions.push(Suggestion {
            severity: Severity::Low,
            kind: SuggestionKind::RepeatedQuery,
            message: format!(
                "repeated identical query pattern ({repeat_count} recent executions), consider batching"
            ),
            index_statement: None,
        });
    }

    suggestions.sort_by(|a, b| b.severity.cmp(&a.severity));
    suggestions
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
