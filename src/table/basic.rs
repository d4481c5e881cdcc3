// Copyright (c) 2024-present, blockbase-db
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The basic table (component E): one [`StorageEngine`] plus a write
//! lock queue, an autoincrement id counter and in-memory secondary
//! indexes rebuilt at open time.

use crate::config::TableOpenOptions;
use crate::engine::{EngineConfig, StorageEngine};
use crate::error::{Error, Result};
use crate::lock_queue::LockQueue;
use crate::predicate::{compare_json, Query, Where};
use crate::table::{IndexKind, IndexSpec, InsertOptions, InsertResult, ModifyResult, Patch, Record, Table, TableMeta};
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering as AtomicOrdering};
use tokio::sync::Mutex;

/// A JSON scalar, made orderable so it can key a [`BTreeMap`] for range
/// index lookups. Mirrors [`compare_json`]'s ordering exactly.
#[derive(Clone, Debug)]
pub(crate) struct IndexKey(serde_json::Value);

impl PartialEq for IndexKey {
    fn eq(&self, other: &Self) -> bool {
        compare_json(&self.0, &other.0) == Ordering::Equal
    }
}
impl Eq for IndexKey {}
impl PartialOrd for IndexKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for IndexKey {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_json(&self.0, &other.0)
    }
}

pub(crate) struct SecondaryIndex {
    #[allow(dead_code)]
    kind: IndexKind,
    by_value: BTreeMap<IndexKey, Vec<i64>>,
}

impl SecondaryIndex {
    pub(crate) fn new(kind: IndexKind) -> Self {
        Self {
            kind,
            by_value: BTreeMap::new(),
        }
    }

    fn insert(&mut self, value: &serde_json::Value, id: i64) {
        self.by_value.entry(IndexKey(value.clone())).or_default().push(id);
    }

    fn remove(&mut self, value: &serde_json::Value, id: i64) {
        let key = IndexKey(value.clone());
        if let Some(ids) = self.by_value.get_mut(&key) {
            ids.retain(|&x| x != id);
            if ids.is_empty() {
                self.by_value.remove(&key);
            }
        }
    }

    pub(crate) fn range(&self, lo: Option<&serde_json::Value>, hi: Option<&serde_json::Value>) -> Vec<i64> {
        let lo = lo.map(|v| IndexKey(v.clone()));
        let hi = hi.map(|v| IndexKey(v.clone()));
        self.by_value
            .range((
                lo.map_or(std::ops::Bound::Unbounded, std::ops::Bound::Included),
                hi.map_or(std::ops::Bound::Unbounded, std::ops::Bound::Included),
            ))
            .flat_map(|(_, ids)| ids.iter().copied())
            .collect()
    }
}

pub(crate) struct IndexSet {
    pub(crate) indexes: FxHashMap<String, SecondaryIndex>,
}

impl IndexSet {
    pub(crate) fn new() -> Self {
        Self {
            indexes: FxHashMap::default(),
        }
    }

    pub(crate) fn on_insert(&mut self, record: &serde_json::Value, id: i64) {
        for (field, idx) in &mut self.indexes {
            if let Some(v) = record.get(field) {
                idx.insert(v, id);
            }
        }
    }

    pub(crate) fn on_remove(&mut self, record: &serde_json::Value, id: i64) {
        for (field, idx) in &mut self.indexes {
            if let Some(v) = record.get(field) {
                idx.remove(v, id);
            }
        }
    }
}

/// Append-only block-log table, directly backing a table directory.
pub struct BasicTable {
    dir: PathBuf,
    engine: StorageEngine,
    write_lock: LockQueue,
    next_id: AtomicI64,
    indexes: Mutex<IndexSet>,
    corrupted: AtomicBool,
}

impl BasicTable {
    /// Opens (creating if requested) a basic table directory, replaying
    /// its journals and rebuilding secondary indexes by a full scan.
    pub async fn open(dir: PathBuf, opts: &TableOpenOptions, allow_corrupted: bool) -> Result<Self> {
        tokio::fs::create_dir_all(&dir).await?;

        let engine_cfg = EngineConfig {
            block_ceiling: opts.block_size,
            compression: opts.compressed,
            cache_size: opts.cache_size,
            allow_corrupted,
        };
        let engine = StorageEngine::new(dir.clone(), engine_cfg);

        let next_id = if allow_corrupted {
            engine.load_corrupted().await?
        } else {
            engine.load().await?
        };

        Ok(Self {
            dir,
            engine,
            write_lock: LockQueue::new(),
            next_id: AtomicI64::new(next_id),
            indexes: Mutex::new(IndexSet::new()),
            corrupted: AtomicBool::new(false),
        })
    }

    pub fn table_dir(&self) -> &Path {
        &self.dir
    }

    async fn scan_all(&self) -> Result<Vec<Record>> {
        let mut out = Vec::new();
        for id in self.engine.iterate_ids().await {
            if let Some(data) = self.engine.get(id).await? {
                out.push(Record::new(id, data));
            }
        }
        Ok(out)
    }

    /// Resolves a query's row candidates without fetching every row:
    /// `IdSet`/`IndexRange` narrow via the engine's id map / secondary
    /// indexes, everything else falls back to a full scan.
    async fn candidate_ids(&self, query: &Query) -> Result<Vec<i64>> {
        match &query.where_ {
            Some(Where::IdSet(ids)) => {
                let mut out = Vec::new();
                for &id in ids.iter() {
                    if self.engine.has(id).await {
                        out.push(id);
                    }
                }
                Ok(out)
            }
            Some(Where::IndexRange(range)) => {
                let indexes = self.indexes.lock().await;
                if let Some(idx) = indexes.indexes.get(&range.field) {
                    Ok(idx.range(range.lo.as_ref(), range.hi.as_ref()))
                } else {
                    Ok(self.engine.iterate_ids().await)
                }
            }
            _ => Ok(self.engine.iterate_ids().await),
        }
    }
}

#[async_trait]
impl Table for BasicTable {
    async fn close(&self) -> Result<()> {
        self.engine.destroy().await;
        Ok(())
    }

    async fn select(&self, query: &Query) -> Result<Vec<Record>> {
        let ids = self.candidate_ids(query).await?;
        let mut rows = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(data) = self.engine.get(id).await? else {
                continue;
            };
            let record = Record::new(id, data);
            if query.matches(&record) {
                rows.push(record);
            }
        }

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

        let id = match opts.id {
            Some(id) => {
                if self.engine.has(id).await {
                    if opts.ignore {
                        return Ok(InsertResult { id });
                    }
                    if !opts.replace {
                        return Err(Error::DuplicateId(id));
                    }
                }
                id
            }
            None => self.next_id.fetch_add(1, AtomicOrdering::SeqCst),
        };

        let record = Record::from_row(id, row);
        let encoded_size = record.encoded_size() as u64;

        let delta = self.engine.begin_delta();
        let data = record.data.clone();
        self.engine
            .write_batch(delta, |w| {
                w.set(id, data, encoded_size);
                Ok(())
            })
            .await?;

        self.indexes.lock().await.on_insert(&record.data, id);

        Ok(InsertResult { id })
    }

    async fn update(&self, query: &Query, patch: &Patch) -> Result<ModifyResult> {
        let _guard = self.write_lock.acquire().await?;

        let ids = self.candidate_ids(query).await?;
        let mut matched = Vec::new();
        for id in ids {
            let Some(data) = self.engine.get(id).await? else {
                continue;
            };
            let record = Record::new(id, data);
            if query.matches(&record) {
                matched.push(record);
            }
        }

        if matched.is_empty() {
            return Ok(ModifyResult::default());
        }

        let mut updated = Vec::with_capacity(matched.len());
        for record in &matched {
            let mut data = record.data.clone();
            if let Some(obj) = data.as_object_mut() {
                for (field, value) in patch {
                    if value.is_null() {
                        obj.remove(field);
                    } else {
                        obj.insert(field.clone(), value.clone());
                    }
                }
            }
            updated.push((record.id, data));
        }

        let delta = self.engine.begin_delta();
        let batch = updated.clone();
        self.engine
            .write_batch(delta, |w| {
                for (id, data) in batch {
                    let size = serde_json::to_vec(&data).map(|v| v.len() as u64).unwrap_or(0);
                    w.set(id, data, size);
                }
                Ok(())
            })
            .await?;

        let mut indexes = self.indexes.lock().await;
        for (old, (id, new_data)) in matched.iter().zip(updated.iter()) {
            indexes.on_remove(&old.data, *id);
            indexes.on_insert(new_data, *id);
        }

        Ok(ModifyResult {
            count: updated.len() as u64,
        })
    }

    async fn delete(&self, query: &Query) -> Result<ModifyResult> {
        let _guard = self.write_lock.acquire().await?;

        let ids = self.candidate_ids(query).await?;
        let mut matched = Vec::new();
        for id in ids {
            let Some(data) = self.engine.get(id).await? else {
                continue;
            };
            let record = Record::new(id, data);
            if query.matches(&record) {
                matched.push(record);
            }
        }

        if matched.is_empty() {
            return Ok(ModifyResult::default());
        }

        let delta = self.engine.begin_delta();
        let ids_to_del: Vec<i64> = matched.iter().map(|r| r.id).collect();
        self.engine
            .write_batch(delta, |w| {
                for id in &ids_to_del {
                    w.del(*id);
                }
                Ok(())
            })
            .await?;

        let mut indexes = self.indexes.lock().await;
        for record in &matched {
            indexes.on_remove(&record.data, record.id);
        }

        Ok(ModifyResult {
            count: matched.len() as u64,
        })
    }

    async fn create_index(&self, spec: IndexSpec) -> Result<()> {
        let _guard = self.write_lock.acquire().await?;
        let mut indexes = self.indexes.lock().await;
        if indexes.indexes.contains_key(&spec.field) {
            return Ok(());
        }

        let mut index = SecondaryIndex::new(spec.kind);
        drop(indexes);
        for record in self.scan_all().await? {
            if let Some(v) = record.data.get(&spec.field) {
                index.insert(v, record.id);
            }
        }
        self.indexes.lock().await.indexes.insert(spec.field, index);
        Ok(())
    }

    async fn drop_index(&self, field: &str) -> Result<()> {
        let _guard = self.write_lock.acquire().await?;
        self.indexes.lock().await.indexes.remove(field);
        Ok(())
    }

    async fn get_meta(&self) -> Result<TableMeta> {
        let indexes = self.indexes.lock().await;
        Ok(TableMeta {
            table_type: "basic".to_string(),
            row_count: self.engine.row_count().await,
            indexes: indexes.indexes.keys().cloned().collect(),
            corrupted: self.corrupted.load(AtomicOrdering::SeqCst) || self.engine.sticky_error().await.is_some(),
        })
    }

    async fn mark_corrupted(&self) -> Result<()> {
        self.corrupted.store(true, AtomicOrdering::SeqCst);
        self.engine.destroy().await;
        tokio::fs::write(self.dir.join("state"), b"0").await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TableOpenOptions;
    use serde_json::json;

    fn opts() -> TableOpenOptions {
        TableOpenOptions {
            block_size: 4096,
            ..TableOpenOptions::default()
        }
    }

    #[tokio::test]
    async fn insert_assigns_autoincrement_id() {
        let dir = tempfile::tempdir().unwrap();
        let table = BasicTable::open(dir.path().to_path_buf(), &opts(), false).await.unwrap();

        let r1 = table.insert(json!({"name": "a"}), InsertOptions::default()).await.unwrap();
        let r2 = table.insert(json!({"name": "b"}), InsertOptions::default()).await.unwrap();
        assert_eq!(r2.id, r1.id + 1);
    }

    #[tokio::test]
    async fn duplicate_explicit_id_errors_without_replace() {
        let dir = tempfile::tempdir().unwrap();
        let table = BasicTable::open(dir.path().to_path_buf(), &opts(), false).await.unwrap();

        table
            .insert(json!({"a": 1}), InsertOptions { id: Some(5), ..Default::default() })
            .await
            .unwrap();
        let err = table
            .insert(json!({"a": 2}), InsertOptions { id: Some(5), ..Default::default() })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateId(5)));
    }

    #[tokio::test]
    async fn select_with_where_and_limit() {
        let dir = tempfile::tempdir().unwrap();
        let table = BasicTable::open(dir.path().to_path_buf(), &opts(), false).await.unwrap();

        for i in 0..10 {
            table.insert(json!({"n": i}), InsertOptions::default()).await.unwrap();
        }

        let query = Query::all()
            .with_where(Where::lambda(|r| r.data["n"].as_i64().unwrap_or(0) % 2 == 0))
            .with_limit(3);
        let rows = table.select(&query).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r.data["n"].as_i64().unwrap() % 2 == 0));
    }

    #[tokio::test]
    async fn update_applies_patch_and_maintains_index() {
        let dir = tempfile::tempdir().unwrap();
        let table = BasicTable::open(dir.path().to_path_buf(), &opts(), false).await.unwrap();
        table.create_index(IndexSpec::hash("tag")).await.unwrap();

        let r = table.insert(json!({"tag": "x"}), InsertOptions::default()).await.unwrap();

        let mut patch = Patch::new();
        patch.insert("tag".to_string(), json!("y"));
        let result = table
            .update(&Query::all().with_where(Where::IdSet(std::sync::Arc::new([r.id].into_iter().collect()))), &patch)
            .await
            .unwrap();
        assert_eq!(result.count, 1);

        let rows = table.select(&Query::all()).await.unwrap();
        assert_eq!(rows[0].data["tag"], json!("y"));
    }

    #[tokio::test]
    async fn delete_removes_row() {
        let dir = tempfile::tempdir().unwrap();
        let table = BasicTable::open(dir.path().to_path_buf(), &opts(), false).await.unwrap();
        let r = table.insert(json!({"a": 1}), InsertOptions::default()).await.unwrap();

        let result = table
            .delete(&Query::all().with_where(Where::IdSet(std::sync::Arc::new([r.id].into_iter().collect()))))
            .await
            .unwrap();
        assert_eq!(result.count, 1);
        assert!(table.select(&Query::all()).await.unwrap().is_empty());
    }
}
