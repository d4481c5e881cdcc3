// Copyright (c) 2024-present, blockbase-db
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The `Table` trait shared by the basic, sharded and in-memory table
//! kinds, plus the row/index/meta types that make up its public
//! surface.

pub mod basic;
pub mod memory;

use crate::error::Result;
use crate::predicate::Query;
use async_trait::async_trait;
use std::collections::HashMap;

/// A single stored row: an integer id plus its JSON document.
#[derive(Clone, Debug, PartialEq)]
pub struct Record {
    pub id: i64,
    pub data: serde_json::Value,
}

impl Record {
    #[must_use]
    pub fn new(id: i64, data: serde_json::Value) -> Self {
        Self { id, data }
    }

    /// Builds a record from a caller-supplied row, stamping `id` into the
    /// row's own `id` field when it is a JSON object.
    #[must_use]
    pub fn from_row(id: i64, mut row: serde_json::Value) -> Self {
        if let Some(obj) = row.as_object_mut() {
            obj.insert("id".to_string(), serde_json::json!(id));
        }
        Self { id, data: row }
    }

    /// A rough estimate of the row's on-disk footprint, used for block
    /// size accounting; the real bound is the JSON text length.
    #[must_use]
    pub fn encoded_size(&self) -> usize {
        serde_json::to_string(&self.data).map(|s| s.len()).unwrap_or(0)
    }
}

/// What kind of secondary index a field carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexKind {
    /// Hash index: equality lookups only.
    Hash,
    /// Range index: supports `IndexRange` bounds as well as equality.
    Range,
}

/// A secondary index declaration, as accepted by [`Table::create_index`].
#[derive(Clone, Debug)]
pub struct IndexSpec {
    pub field: String,
    pub kind: IndexKind,
}

impl IndexSpec {
    #[must_use]
    pub fn hash(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            kind: IndexKind::Hash,
        }
    }

    #[must_use]
    pub fn range(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            kind: IndexKind::Range,
        }
    }
}

/// Options accepted by [`Table::insert`].
#[derive(Clone, Debug, Default)]
pub struct InsertOptions {
    /// Explicit id to insert at, instead of the table's autoincrement
    /// counter. Forbidden on sharded tables ([`crate::error::Error::ShardedIdForbidden`]).
    pub id: Option<i64>,
    /// If `id` is already taken, overwrite it instead of failing.
    pub replace: bool,
    /// If `id` is already taken, silently keep the existing row instead
    /// of failing.
    pub ignore: bool,
    /// Which shard to target; only meaningful for sharded tables.
    pub shard: Option<crate::predicate::ShardGenerator>,
}

/// Result of a successful [`Table::insert`].
#[derive(Clone, Debug)]
pub struct InsertResult {
    pub id: i64,
}

/// Result of [`Table::update`] / [`Table::delete`].
#[derive(Clone, Debug, Default)]
pub struct ModifyResult {
    /// Number of rows actually changed.
    pub count: u64,
}

/// A sparse patch applied to matched rows by [`Table::update`]: each
/// entry sets a field to a new value. Removing a field is expressed as
/// `serde_json::Value::Null`, matching the storage engine's own
/// tombstone-by-null convention for deltas.
pub type Patch = HashMap<String, serde_json::Value>;

/// Table-level metadata returned by [`Table::get_meta`].
#[derive(Clone, Debug, Default)]
pub struct TableMeta {
    pub table_type: String,
    pub row_count: u64,
    pub indexes: Vec<String>,
    pub corrupted: bool,
}

/// The contract shared by every table kind: basic (component E),
/// sharded (component F) and in-memory (component G). The directory
/// manager (component H) talks to tables purely through this trait, so
/// it never needs to know which kind it is holding.
#[async_trait]
pub trait Table: Send + Sync {
    /// Releases any resident resources (file handles, in-RAM blocks).
    /// Idempotent.
    async fn close(&self) -> Result<()>;

    /// Runs a query and returns the matching rows, already sorted,
    /// mapped, offset and limited per the query's clauses.
    async fn select(&self, query: &Query) -> Result<Vec<Record>>;

    /// Inserts one row, returning the id assigned to it.
    async fn insert(&self, row: serde_json::Value, opts: InsertOptions) -> Result<InsertResult>;

    /// Applies `patch` to every row matched by `query`.
    async fn update(&self, query: &Query, patch: &Patch) -> Result<ModifyResult>;

    /// Removes every row matched by `query`.
    async fn delete(&self, query: &Query) -> Result<ModifyResult>;

    /// Declares a secondary index; a no-op if one already exists on the
    /// same field.
    async fn create_index(&self, spec: IndexSpec) -> Result<()>;

    /// Removes a secondary index by field name.
    async fn drop_index(&self, field: &str) -> Result<()>;

    /// Returns table-level metadata (row count, declared indexes, type).
    async fn get_meta(&self) -> Result<TableMeta>;

    /// Marks the table as corrupted, so the next open attempts
    /// `loadCorrupted` recovery instead of a normal open.
    async fn mark_corrupted(&self) -> Result<()>;

    /// Copies every row matched by `query` into `into`, which must
    /// already be open and of a compatible type. The default
    /// implementation drives it through `select`/`insert`; table kinds
    /// that can do better (e.g. copying whole blocks) override it.
    async fn clone_into(&self, query: &Query, into: &dyn Table) -> Result<u64> {
        let rows = self.select(query).await?;
        let mut count = 0u64;
        for row in rows {
            into.insert(row.data, InsertOptions::default()).await?;
            count += 1;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_row_stamps_id_into_object() {
        let rec = Record::from_row(7, serde_json::json!({"name": "a"}));
        assert_eq!(rec.data["id"], serde_json::json!(7));
    }

    #[test]
    fn from_row_leaves_non_object_rows_alone() {
        let rec = Record::from_row(1, serde_json::json!("scalar"));
        assert_eq!(rec.data, serde_json::json!("scalar"));
    }

    #[test]
    fn index_spec_constructors() {
        let h = IndexSpec::hash("email");
        assert_eq!(h.kind, IndexKind::Hash);
        let r = IndexSpec::range("age");
        assert_eq!(r.kind, IndexKind::Range);
    }
}
