// Copyright (c) 2024-present, blockbase-db
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The in-memory table (component G): same [`Table`] contract as the
//! basic table, minus any block files or journals. Used by the
//! monitoring table and by callers who want a scratch table that never
//! touches disk.

use crate::error::{Error, Result};
use crate::lock_queue::LockQueue;
use crate::predicate::{Query, Where};
use crate::table::basic::IndexSet;
use crate::table::{IndexSpec, InsertOptions, InsertResult, ModifyResult, Patch, Record, Table, TableMeta};
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::Mutex;

struct State {
    rows: FxHashMap<i64, serde_json::Value>,
    indexes: IndexSet,
}

/// A pure in-memory table: no block files, no journals, no recovery.
pub struct MemoryTable {
    state: Mutex<State>,
    write_lock: LockQueue,
    next_id: AtomicI64,
}

impl MemoryTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                rows: FxHashMap::default(),
                indexes: IndexSet::new(),
            }),
            write_lock: LockQueue::new(),
            next_id: AtomicI64::new(1),
        }
    }
}

impl Default for MemoryTable {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Table for MemoryTable {
    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn select(&self, query: &Query) -> Result<Vec<Record>> {
        let state = self.state.lock().await;

        let ids: Vec<i64> = match &query.where_ {
            Some(Where::IdSet(ids)) => ids.iter().copied().collect(),
            Some(Where::IndexRange(range)) => {
                if let Some(idx) = state.indexes.indexes.get(&range.field) {
                    idx.range(range.lo.as_ref(), range.hi.as_ref())
                } else {
                    state.rows.keys().copied().collect()
                }
            }
            _ => state.rows.keys().copied().collect(),
        };

        let mut rows: Vec<Record> = ids
            .into_iter()
            .filter_map(|id| state.rows.get(&id).map(|data| Record::new(id, data.clone())))
            .filter(|r| query.matches(r))
            .collect();

        if let Some(cmp) = &query.sort {
            rows.sort_by(|a, b| cmp(a, b));
        }

        let offset = query.offset.unwrap_or(0);
        let rows: Vec<Record> = rows.into_iter().skip(offset).collect();
        let rows: Vec<Record> = match query.limit {
            Some(limit) => rows.into_iter().take(limit).collect(),
            None => rows,
        };

        Ok(match &query.map {
            Some(f) => rows.into_iter().map(|r| f(r)).collect(),
            None => rows,
        })
    }

    async fn insert(&self, row: serde_json::Value, opts: InsertOptions) -> Result<InsertResult> {
        let _guard = self.write_lock.acquire().await?;
        let mut state = self.state.lock().await;

        let id = match opts.id {
            Some(id) => {
                if state.rows.contains_key(&id) {
                    if opts.ignore {
                        return Ok(InsertResult { id });
                    }
                    if !opts.replace {
                        return Err(Error::DuplicateId(id));
                    }
                }
                id
            }
            None => self.next_id.fetch_add(1, Ordering::SeqCst),
        };

        let record = Record::from_row(id, row);
        state.rows.insert(id, record.data.clone());
        state.indexes.on_insert(&record.data, id);

        Ok(InsertResult { id })
    }

    async fn update(&self, query: &Query, patch: &Patch) -> Result<ModifyResult> {
        let _guard = self.write_lock.acquire().await?;
        let mut state = self.state.lock().await;

        let matched: Vec<i64> = state
            .rows
            .iter()
            .filter(|(&id, data)| query.matches(&Record::new(id, (*data).clone())))
            .map(|(&id, _)| id)
            .collect();

        for id in &matched {
            let Some(old) = state.rows.get(id).cloned() else {
                continue;
            };
            let mut data = old.clone();
            if let Some(obj) = data.as_object_mut() {
                for (field, value) in patch {
                    if value.is_null() {
                        obj.remove(field);
                    } else {
                        obj.insert(field.clone(), value.clone());
                    }
                }
            }
            state.indexes.on_remove(&old, *id);
            state.indexes.on_insert(&data, *id);
            state.rows.insert(*id, data);
        }

        Ok(ModifyResult {
            count: matched.len() as u64,
        })
    }

    async fn delete(&self, query: &Query) -> Result<ModifyResult> {
        let _guard = self.write_lock.acquire().await?;
        let mut state = self.state.lock().await;

        let matched: Vec<i64> = state
            .rows
            .iter()
            .filter(|(&id, data)| query.matches(&Record::new(id, (*data).clone())))
            .map(|(&id, _)| id)
            .collect();

        for id in &matched {
            if let Some(data) = state.rows.remove(id) {
                state.indexes.on_remove(&data, *id);
            }
        }

        Ok(ModifyResult {
            count: matched.len() as u64,
        })
    }

    async fn create_index(&self, spec: IndexSpec) -> Result<()> {
        let _guard = self.write_lock.acquire().await?;
        let mut state = self.state.lock().await;
        if state.indexes.indexes.contains_key(&spec.field) {
            return Ok(());
        }
        let mut index = crate::table::basic::SecondaryIndex::new(spec.kind);
        for (&id, data) in &state.rows {
            if let Some(v) = data.get(&spec.field) {
                index.insert(v, id);
            }
        }
        state.indexes.indexes.insert(spec.field.clone(), index);
        Ok(())
    }

    async fn drop_index(&self, field: &str) -> Result<()> {
        let _guard = self.write_lock.acquire().await?;
        self.state.lock().await.indexes.indexes.remove(field);
        Ok(())
    }

    async fn get_meta(&self) -> Result<TableMeta> {
        let state = self.state.lock().await;
        Ok(TableMeta {
            table_type: "memory".to_string(),
            row_count: state.rows.len() as u64,
            indexes: state.indexes.indexes.keys().cloned().collect(),
            corrupted: false,
        })
    }

    async fn mark_corrupted(&self) -> Result<()> {
        // In-memory tables have no durable state file to flag; nothing
        // to do beyond what `close` already achieves.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn insert_and_select_round_trip() {
        let table = MemoryTable::new();
        let r = table.insert(json!({"a": 1}), InsertOptions::default()).await.unwrap();
        let rows = table.select(&Query::all()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, r.id);
    }

    #[tokio::test]
    async fn update_and_delete() {
        let table = MemoryTable::new();
        let r = table.insert(json!({"a": 1}), InsertOptions::default()).await.unwrap();

        let mut patch = Patch::new();
        patch.insert("a".to_string(), json!(2));
        let where_id = Where::IdSet(std::sync::Arc::new([r.id].into_iter().collect()));
        let updated = table.update(&Query::all().with_where(where_id.clone()), &patch).await.unwrap();
        assert_eq!(updated.count, 1);

        let rows = table.select(&Query::all()).await.unwrap();
        assert_eq!(rows[0].data["a"], json!(2));

        let deleted = table.delete(&Query::all().with_where(where_id)).await.unwrap();
        assert_eq!(deleted.count, 1);
        assert!(table.select(&Query::all()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn index_range_query() {
        let table = MemoryTable::new();
        table.create_index(IndexSpec::range("n")).await.unwrap();
        for i in 0..10 {
            table.insert(json!({"n": i}), InsertOptions::default()).await.unwrap();
        }
        let query = Query::all().with_where(Where::IndexRange(crate::predicate::IndexRange {
            field: "n".to_string(),
            lo: Some(json!(3)),
            hi: Some(json!(5)),
        }));
        let rows = table.select(&query).await.unwrap();
        assert_eq!(rows.len(), 3);
    }
}
