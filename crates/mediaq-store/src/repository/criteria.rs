//! Declarative filters, ordering and paging, translated to SQL.
//!
//! Filters are kept in insertion order and joined with `AND`, so the same
//! criteria always produce the same SQL text (and hit the same cached
//! statement).

use rusqlite::types::Value;

use crate::errors::{Result, StorageError};

/// One condition on a column.
#[derive(Clone, Debug, PartialEq)]
pub enum Filter {
    /// `column = ?`
    Eq(String, Value),
    /// `column IS NULL`
    IsNull(String),
    /// `column IN (?, ...)`; an empty list matches nothing.
    In(String, Vec<Value>),
}

impl Filter {
    fn column(&self) -> &str {
        match self {
            Self::Eq(c, _) | Self::IsNull(c) | Self::In(c, _) => c,
        }
    }
}

/// Filters plus optional ordering and paging.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueryCriteria {
    filters: Vec<Filter>,
    order_by: Option<String>,
    limit: Option<u64>,
    offset: Option<u64>,
}

impl QueryCriteria {
    /// No filters: matches every row.
    pub fn new() -> Self {
        Self::default()
    }

    /// `column = value`. A [`Value::Null`] becomes `column IS NULL`.
    #[must_use]
    pub fn eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        let column = column.into();
        let filter = match value.into() {
            Value::Null => Filter::IsNull(column),
            v => Filter::Eq(column, v),
        };
        self.filters.push(filter);
        self
    }

    /// `column IS NULL`.
    #[must_use]
    pub fn is_null(mut self, column: impl Into<String>) -> Self {
        self.filters.push(Filter::IsNull(column.into()));
        self
    }

    /// `column IN (values...)`.
    #[must_use]
    pub fn any_of<V: Into<Value>>(
        mut self,
        column: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        self.filters
            .push(Filter::In(column.into(), values.into_iter().map(Into::into).collect()));
        self
    }

    /// `ORDER BY` text, used verbatim. Never pass user input here.
    #[must_use]
    pub fn order_by(mut self, order: impl Into<String>) -> Self {
        self.order_by = Some(order.into());
        self
    }

    /// Maximum rows returned.
    #[must_use]
    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Rows skipped before the first returned.
    #[must_use]
    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Filters in the order they were added.
    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    /// Configured limit.
    pub fn get_limit(&self) -> Option<u64> {
        self.limit
    }

    /// `" WHERE ..."` (or empty) plus its parameters.
    pub fn where_clause(&self) -> Result<(String, Vec<Value>)> {
        if self.filters.is_empty() {
            return Ok((String::new(), Vec::new()));
        }
        let mut parts = Vec::with_capacity(self.filters.len());
        let mut params = Vec::new();
        for filter in &self.filters {
            let column = filter.column();
            if !is_identifier(column) {
                return Err(StorageError::InvalidCriteria(format!(
                    "not a plain column name: {column:?}"
                )));
            }
            match filter {
                Filter::Eq(_, value) => {
                    parts.push(format!("{column} = ?"));
                    params.push(value.clone());
                }
                Filter::IsNull(_) => parts.push(format!("{column} IS NULL")),
                Filter::In(_, values) if values.is_empty() => parts.push("0 = 1".to_string()),
                Filter::In(_, values) => {
                    parts.push(format!("{column} IN ({})", placeholders(values.len())));
                    params.extend(values.iter().cloned());
                }
            }
        }
        Ok((format!(" WHERE {}", parts.join(" AND ")), params))
    }

    /// Append `WHERE`, `ORDER BY` and `LIMIT`/`OFFSET` to `base`.
    pub fn to_sql(&self, base: &str) -> Result<(String, Vec<Value>)> {
        let (clause, mut params) = self.where_clause()?;
        let mut sql = format!("{base}{clause}");
        if let Some(order) = &self.order_by {
            sql.push_str(" ORDER BY ");
            sql.push_str(order);
        }
        match (self.limit, self.offset) {
            (None, None) => {}
            (limit, offset) => {
                sql.push_str(" LIMIT ? OFFSET ?");
                params.push(Value::Integer(limit.map_or(-1, clamp_i64)));
                params.push(Value::Integer(offset.map_or(0, clamp_i64)));
            }
        }
        Ok((sql, params))
    }
}

/// `?, ?, ...` with `n` placeholders.
pub(crate) fn placeholders(n: usize) -> String {
    let mut s = String::with_capacity(n * 3);
    for i in 0..n {
        if i > 0 {
            s.push_str(", ");
        }
        s.push('?');
    }
    s
}

/// ASCII letter or underscore, then letters, digits or underscores.
pub(crate) fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn clamp_i64(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use proptest::prelude::*;

    #[test]
    fn empty_criteria_is_bare_base() {
        let (sql, params) = QueryCriteria::new().to_sql("SELECT * FROM queue").unwrap();
        assert_eq!(sql, "SELECT * FROM queue");
        assert!(params.is_empty());
    }

    #[test]
    fn filters_keep_insertion_order() {
        let (sql, params) = QueryCriteria::new()
            .eq("status", "completed".to_string())
            .is_null("error")
            .any_of("type", ["movie".to_string(), "tv".to_string()])
            .to_sql("SELECT * FROM queue")
            .unwrap();
        assert_eq!(
            sql,
            "SELECT * FROM queue WHERE status = ? AND error IS NULL AND type IN (?, ?)"
        );
        assert_eq!(
            params,
            vec![
                Value::Text("completed".into()),
                Value::Text("movie".into()),
                Value::Text("tv".into()),
            ]
        );
    }

    #[test]
    fn null_value_becomes_is_null() {
        let (sql, params) = QueryCriteria::new()
            .eq("season", Option::<i64>::None)
            .to_sql("SELECT id FROM queue")
            .unwrap();
        assert_eq!(sql, "SELECT id FROM queue WHERE season IS NULL");
        assert!(params.is_empty());
    }

    #[test]
    fn empty_in_list_matches_nothing() {
        let (sql, params) = QueryCriteria::new()
            .any_of("id", Vec::<i64>::new())
            .to_sql("SELECT id FROM queue")
            .unwrap();
        assert_eq!(sql, "SELECT id FROM queue WHERE 0 = 1");
        assert!(params.is_empty());
    }

    #[test]
    fn order_and_paging() {
        let (sql, params) = QueryCriteria::new()
            .order_by("created_at DESC, id")
            .limit(10)
            .offset(20)
            .to_sql("SELECT * FROM queue")
            .unwrap();
        assert_eq!(sql, "SELECT * FROM queue ORDER BY created_at DESC, id LIMIT ? OFFSET ?");
        assert_eq!(params, vec![Value::Integer(10), Value::Integer(20)]);
    }

    #[test]
    fn offset_without_limit_is_unbounded() {
        let (sql, params) = QueryCriteria::new().offset(5).to_sql("SELECT * FROM t").unwrap();
        assert_eq!(sql, "SELECT * FROM t LIMIT ? OFFSET ?");
        assert_eq!(params, vec![Value::Integer(-1), Value::Integer(5)]);
    }

    #[test]
    fn injected_column_is_rejected() {
        let result = QueryCriteria::new()
            .eq("id = 1 OR 1", 1_i64)
            .to_sql("SELECT * FROM queue");
        assert_matches!(result, Err(StorageError::InvalidCriteria(_)));
        assert_matches!(
            QueryCriteria::new().is_null("").where_clause(),
            Err(StorageError::InvalidCriteria(_))
        );
    }

    #[test]
    fn identifiers() {
        assert!(is_identifier("tmdb_id"));
        assert!(is_identifier("_x1"));
        assert!(!is_identifier("1x"));
        assert!(!is_identifier("a-b"));
        assert!(!is_identifier("a.b"));
    }

    proptest! {
        #[test]
        fn placeholder_count_matches_params(
            eqs in 0usize..5,
            nulls in 0usize..3,
            lists in proptest::collection::vec(0usize..6, 0..4),
            limit in proptest::option::of(0u64..100),
        ) {
            let mut criteria = QueryCriteria::new();
            for i in 0..eqs {
                criteria = criteria.eq(format!("c{i}"), i64::try_from(i).unwrap());
            }
            for i in 0..nulls {
                criteria = criteria.is_null(format!("n{i}"));
            }
            for (i, len) in lists.iter().enumerate() {
                criteria = criteria.any_of(format!("l{i}"), (0..*len).map(|v| i64::try_from(v).unwrap()));
            }
            if let Some(limit) = limit {
                criteria = criteria.limit(limit);
            }
            let (sql, params) = criteria.to_sql("SELECT * FROM t").unwrap();
            prop_assert_eq!(sql.matches('?').count(), params.len());
        }
    }
}
