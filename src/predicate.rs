// Copyright (c) 2024-present, blockbase-db
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The query predicate surface.
//!
//! §9 of the specification calls for replacing the legacy "expression as
//! source text" query language with a tagged predicate AST:
//! `Where ::= IndexRange | IdSet | Iter(seq, body) | Lambda(body)`, where
//! `body` is either a small interpreter-evaluated expression or a
//! compiled filter function supplied by the caller. This module
//! implements the latter: every predicate position is a typed,
//! statically-checked Rust closure (`Arc<dyn Fn(...) -> ... + Send +
//! Sync>`), so query construction cannot fail at runtime the way parsing
//! a textual expression could. `esc` (see [`crate::util::esc`]) remains
//! the supported path for embedding literal values when a caller does
//! build textual query strings upstream of this API.

use crate::table::Record;
use std::cmp::Ordering;
use std::sync::Arc;

/// A boolean predicate over a candidate record.
pub type RecordPredicate = Arc<dyn Fn(&Record) -> bool + Send + Sync>;

/// A row transform, used by `select`'s `map` clause.
pub type RecordMap = Arc<dyn Fn(Record) -> Record + Send + Sync>;

/// A two-row comparator, used by `select`'s `sort` clause.
pub type RecordCompare = Arc<dyn Fn(&Record, &Record) -> Ordering + Send + Sync>;

/// The row selection clause of a query.
#[derive(Clone)]
pub enum Where {
    /// Matches every row (`@@all()`).
    All,
    /// Matches rows whose id is a member of the given set (`@@id(...)`).
    IdSet(Arc<std::collections::HashSet<i64>>),
    /// Matches rows whose `field` value falls within `[lo, hi]` using a
    /// secondary index, if one exists (`@@index(field, lo, hi)`). Tables
    /// without a matching index fall back to scanning with the same
    /// bounds check.
    IndexRange(IndexRange),
    /// Iterates a nested sequence per row, keeping rows where `body`
    /// matches at least one element (`@@iter(seq, fn)`).
    Iter {
        /// Field holding the nested sequence to iterate.
        field: String,
        /// Predicate evaluated against each element of the sequence.
        body: RecordPredicate,
    },
    /// An arbitrary compiled predicate function.
    Lambda(RecordPredicate),
}

impl Where {
    /// Evaluates the clause against one candidate record.
    #[must_use]
    pub fn matches(&self, record: &Record) -> bool {
        match self {
            Self::All => true,
            Self::IdSet(ids) => ids.contains(&record.id),
            Self::IndexRange(range) => range.matches(record),
            Self::Iter { field, body } => record
                .data
                .get(field)
                .and_then(serde_json::Value::as_array)
                .is_some_and(|seq| {
                    seq.iter().any(|item| {
                        body(&Record {
                            id: record.id,
                            data: item.clone(),
                        })
                    })
                }),
            Self::Lambda(f) => f(record),
        }
    }

    /// Convenience constructor from a plain closure.
    pub fn lambda<F>(f: F) -> Self
    where
        F: Fn(&Record) -> bool + Send + Sync + 'static,
    {
        Self::Lambda(Arc::new(f))
    }
}

/// An inclusive range bound on a scalar field, backed by a secondary
/// index when the table has one.
#[derive(Clone)]
pub struct IndexRange {
    pub field: String,
    pub lo: Option<serde_json::Value>,
    pub hi: Option<serde_json::Value>,
}

impl IndexRange {
    #[must_use]
    pub fn matches(&self, record: &Record) -> bool {
        let Some(value) = record.data.get(&self.field) else {
            return false;
        };
        if let Some(lo) = &self.lo {
            if compare_json(value, lo) == Ordering::Less {
                return false;
            }
        }
        if let Some(hi) = &self.hi {
            if compare_json(value, hi) == Ordering::Greater {
                return false;
            }
        }
        true
    }
}

/// Orders two JSON scalars. Numbers compare numerically, strings
/// lexically; mismatched types fall back to comparing their JSON text so
/// the ordering is still total.
#[must_use]
pub fn compare_json(a: &serde_json::Value, b: &serde_json::Value) -> Ordering {
    use serde_json::Value;
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .unwrap_or_default()
            .partial_cmp(&y.as_f64().unwrap_or_default())
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => a.to_string().cmp(&b.to_string()),
    }
}

/// `joinById` clause: runs a secondary select against `table`, keyed by
/// the ids found in `id_field` of each primary row, and merges the
/// result into `into_field`.
pub struct JoinById {
    pub table: String,
    pub id_field: String,
    pub into_field: String,
}

/// A complete query accepted by `select`/`update`/`delete`.
#[derive(Clone, Default)]
pub struct Query {
    pub where_: Option<Where>,
    pub sort: Option<RecordCompare>,
    pub map: Option<RecordMap>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    /// Sharded tables only: restricts which shards are consulted,
    /// instead of fanning out to every shard.
    pub shards: Option<Vec<String>>,
    /// Sharded tables only: `Some(true)` pins every shard named in
    /// `shards` open past the end of this call; `Some(false)` clears a
    /// pin previously set on those shards; `None` leaves pins alone.
    pub persistent: Option<bool>,
}

impl std::fmt::Debug for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("has_where", &self.where_.is_some())
            .field("has_sort", &self.sort.is_some())
            .field("has_map", &self.map.is_some())
            .field("limit", &self.limit)
            .field("offset", &self.offset)
            .field("shards", &self.shards)
            .field("persistent", &self.persistent)
            .finish()
    }
}

impl Query {
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_where(mut self, where_: Where) -> Self {
        self.where_ = Some(where_);
        self
    }

    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    #[must_use]
    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    #[must_use]
    pub fn with_shards(mut self, shards: Vec<String>) -> Self {
        self.shards = Some(shards);
        self
    }

    #[must_use]
    pub fn with_persistent(mut self, persistent: bool) -> Self {
        self.persistent = Some(persistent);
        self
    }

    #[must_use]
    pub fn matches(&self, record: &Record) -> bool {
        self.where_.as_ref().is_none_or(|w| w.matches(record))
    }
}

/// A short, redacted rendering of a query for the monitoring table's
/// `query` column, truncated to `max_len` bytes.
#[must_use]
pub fn describe_query(query: &Query, max_len: usize) -> String {
    let desc = format!("{query:?}");
    if desc.len() > max_len {
        desc.chars().take(max_len).collect()
    } else {
        desc
    }
}

/// Shard selection for an insert into a sharded table.
#[derive(Clone)]
pub enum ShardGenerator {
    /// Every row goes to the named shard.
    Fixed(String),
    /// The coordinator picks a shard under `autoShardSize`, preferring
    /// already-open shards (the reserved `___auto` generator name).
    Auto,
    /// A compiled function computing the shard name from the row.
    Custom(Arc<dyn Fn(&serde_json::Value) -> String + Send + Sync>),
}

impl ShardGenerator {
    #[must_use]
    pub fn resolve(&self, row: &serde_json::Value) -> ShardTarget {
        match self {
            Self::Fixed(name) => ShardTarget::Named(name.clone()),
            Self::Auto => ShardTarget::Auto,
            Self::Custom(f) => ShardTarget::Named(f(row)),
        }
    }
}

/// Resolved output of a [`ShardGenerator`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ShardTarget {
    Named(String),
    Auto,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rec(id: i64, data: serde_json::Value) -> Record {
        Record { id, data }
    }

    #[test]
    fn id_set_matches() {
        let w = Where::IdSet(Arc::new([1, 3].into_iter().collect()));
        assert!(w.matches(&rec(1, json!({}))));
        assert!(!w.matches(&rec(2, json!({}))));
    }

    #[test]
    fn index_range_matches_inclusive_bounds() {
        let w = Where::IndexRange(IndexRange {
            field: "age".into(),
            lo: Some(json!(18)),
            hi: Some(json!(30)),
        });
        assert!(w.matches(&rec(1, json!({"age": 18}))));
        assert!(w.matches(&rec(1, json!({"age": 30}))));
        assert!(!w.matches(&rec(1, json!({"age": 31}))));
    }

    #[test]
    fn iter_matches_nested_sequence() {
        let w = Where::Iter {
            field: "tags".into(),
            body: Arc::new(|r: &Record| r.data == json!("x")),
        };
        assert!(w.matches(&rec(1, json!({"tags": ["a", "x"]}))));
        assert!(!w.matches(&rec(1, json!({"tags": ["a", "b"]}))));
    }

    #[test]
    fn query_describe_truncates() {
        let q = Query::all().with_where(Where::lambda(|_| true));
        let desc = describe_query(&q, 10);
        assert!(desc.chars().count() <= 10);
    }
}
