//! Bounded bookkeeping for per-connection prepared statements.
//!
//! `rusqlite` owns the compiled statements (its own cache is sized one
//! larger than ours, so it never evicts on its own). This type decides
//! *which* SQL texts stay compiled. Eviction is by insertion order: the
//! entry admitted earliest leaves first, and a hit does not move an entry.

use std::collections::{HashSet, VecDeque};

/// Outcome of admitting a SQL text to the cache.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Admission {
    /// Whether the SQL text was already cached.
    pub hit: bool,
    /// SQL text that had to leave to make room, if any.
    pub evicted: Option<String>,
}

/// Insertion-ordered set of cached SQL texts with a fixed capacity.
#[derive(Debug)]
pub struct StatementCache {
    capacity: usize,
    order: VecDeque<String>,
    members: HashSet<String>,
    hits: u64,
    misses: u64,
}

impl StatementCache {
    /// Create a cache holding at most `capacity` statements (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            members: HashSet::with_capacity(capacity),
            hits: 0,
            misses: 0,
        }
    }

    /// Record a use of `sql`, admitting it if new.
    pub fn admit(&mut self, sql: &str) -> Admission {
        if self.members.contains(sql) {
            self.hits += 1;
            return Admission {
                hit: true,
                evicted: None,
            };
        }

        self.misses += 1;
        let evicted = if self.order.len() >= self.capacity {
            self.order.pop_front().inspect(|oldest| {
                let _ = self.members.remove(oldest);
            })
        } else {
            None
        };

        self.order.push_back(sql.to_string());
        let _ = self.members.insert(sql.to_string());
        Admission { hit: false, evicted }
    }

    /// Drop `sql` without counting it as an eviction (used when compiling failed).
    pub fn forget(&mut self, sql: &str) {
        if self.members.remove(sql) {
            self.order.retain(|k| k != sql);
        }
    }

    /// Whether `sql` is currently cached.
    pub fn contains(&self, sql: &str) -> bool {
        self.members.contains(sql)
    }

    /// Cached SQL texts, oldest first.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    /// Number of cached statements.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Maximum number of cached statements.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Cache hits since creation.
    pub fn hits(&self) -> u64 {
        self.hits
    }

    /// Cache misses since creation.
    pub fn misses(&self) -> u64 {
        self.misses
    }

    /// Forget every entry (counters are kept).
    pub fn clear(&mut self) {
        self.order.clear();
        self.members.clear();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn first_use_is_a_miss_then_hit() {
        let mut cache = StatementCache::new(4);
        assert!(!cache.admit("SELECT 1").hit);
        assert!(cache.admit("SELECT 1").hit);
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.misses(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn evicts_in_insertion_order() {
        let mut cache = StatementCache::new(2);
        let _ = cache.admit("a");
        let _ = cache.admit("b");
        let adm = cache.admit("c");
        assert_eq!(adm.evicted.as_deref(), Some("a"));
        assert_eq!(cache.keys().collect::<Vec<_>>(), vec!["b", "c"]);
    }

    #[test]
    fn hit_does_not_refresh_position() {
        let mut cache = StatementCache::new(2);
        let _ = cache.admit("a");
        let _ = cache.admit("b");
        // "a" is used again, but it was still added first.
        assert!(cache.admit("a").hit);
        let adm = cache.admit("c");
        assert_eq!(adm.evicted.as_deref(), Some("a"));
        assert!(cache.contains("b"));
        assert!(!cache.contains("a"));
    }

    #[test]
    fn zero_capacity_is_raised_to_one() {
        let mut cache = StatementCache::new(0);
        assert_eq!(cache.capacity(), 1);
        let _ = cache.admit("a");
        assert_eq!(cache.admit("b").evicted.as_deref(), Some("a"));
    }

    #[test]
    fn clear_keeps_counters() {
        let mut cache = StatementCache::new(3);
        let _ = cache.admit("a");
        let _ = cache.admit("a");
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.hits(), 1);
        assert!(!cache.admit("a").hit);
    }

    proptest! {
        #[test]
        fn never_exceeds_capacity(cap in 1usize..8, keys in proptest::collection::vec(0u8..16, 0..64)) {
            let mut cache = StatementCache::new(cap);
            for k in keys {
                let _ = cache.admit(&format!("SELECT {k}"));
                prop_assert!(cache.len() <= cap);
                prop_assert_eq!(cache.len(), cache.members.len());
            }
        }
    }
}
