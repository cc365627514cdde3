//! SQL text normalization for grouping statistics by query shape.
//!
//! Literals and placeholders collapse to `?`, `IN (?, ?, ...)` and
//! multi-row `VALUES` lists collapse to a single group, and whitespace is
//! squeezed, so `WHERE id = 7` and `WHERE id = ?1` land in the same bucket.

use std::sync::LazyLock;

use regex::Regex;

static STRING_LITERAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"'(?:[^']|'')*'").unwrap());
static NAMED_PARAM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\?\d+|[:@$][A-Za-z_]\w*").unwrap());
static NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d+(?:\.\d+)?\b").unwrap());
static IN_LIST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bIN\s*\(\s*\?(?:\s*,\s*\?)*\s*\)").unwrap()
});
static VALUES_LIST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bVALUES\s*(\([^()]*\))(?:\s*,\s*\([^()]*\))+").unwrap()
});
static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Reduce `sql` to its shape.
pub fn normalize_sql(sql: &str) -> String {
    let s = STRING_LITERAL.replace_all(sql, "?");
    let s = NAMED_PARAM.replace_all(&s, "?");
    let s = NUMBER.replace_all(&s, "?");
    let s = IN_LIST.replace_all(&s, "IN (?)");
    let s = VALUES_LIST.replace_all(&s, "VALUES $1");
    let s = WHITESPACE.replace_all(&s, " ");
    s.trim().trim_end_matches(';').trim_end().to_string()
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literals_become_placeholders() {
        assert_eq!(
            normalize_sql("SELECT * FROM queue WHERE id = 42 AND name = 'It''s'"),
            "SELECT * FROM queue WHERE id = ? AND name = ?"
        );
    }

    #[test]
    fn numbered_and_named_params_collapse() {
        assert_eq!(
            normalize_sql("UPDATE queue SET progress = ?1 WHERE id = :id"),
            "UPDATE queue SET progress = ? WHERE id = ?"
        );
    }

    #[test]
    fn in_lists_collapse() {
        assert_eq!(
            normalize_sql("DELETE FROM queue WHERE id IN (?, ?, ?)"),
            "DELETE FROM queue WHERE id IN (?)"
        );
        assert_eq!(
            normalize_sql("SELECT 1 FROM t WHERE x IN (1,2)"),
            normalize_sql("SELECT 1 FROM t WHERE x IN (7)")
        );
    }

    #[test]
    fn multi_row_values_collapse() {
        assert_eq!(
            normalize_sql("INSERT INTO t (a, b) VALUES (?, ?), (?, ?), (?, ?)"),
            "INSERT INTO t (a, b) VALUES (?, ?)"
        );
    }

    #[test]
    fn whitespace_and_trailing_semicolon() {
        assert_eq!(
            normalize_sql("  SELECT name\n   FROM config\tWHERE key = ? ;"),
            "SELECT name FROM config WHERE key = ?"
        );
    }

    #[test]
    fn digits_inside_identifiers_survive() {
        assert_eq!(normalize_sql("SELECT v2 FROM t1"), "SELECT v2 FROM t1");
    }
}
