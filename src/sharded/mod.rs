// Copyright (c) 2024-present, blockbase-db
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The sharded table (component F): a directory of [`BasicTable`]
//! shards behind one [`Table`] facade.
//!
//! Each shard owns a disjoint slice of the id space, `[index *
//! SHARD_ID_STEP, (index + 1) * SHARD_ID_STEP)`, so a global row id
//! alone is enough to route a point lookup to its shard without
//! consulting any other shard. A `shards.json` manifest (rewritten
//! atomically, the same pattern the block files use) records every
//! shard's name, assigned index, row count and the secondary indexes
//! declared across the whole table, plus the aggregate row count an
//! info-shard would hold (§4.F, §8 invariant 6: `sum(shardRec.count) ==
//! infoShard.count`) — both are updated together on every insert/delete
//! so the invariant always holds by construction.
//!
//! Only a bounded number of shards are held open at once
//! (`cache_shards`). Each open shard carries `(lock, pers)` counters:
//! `lock` counts in-flight operations pinning it open, `pers` is a
//! long-lived pin a caller can set via `Query::persistent` that
//! outlives the call. A shard is evictable only once both are clear;
//! if the cache is full and nothing is evictable, a new shard open
//! suspends on a `Notify` until a pin is released.

use crate::config::TableOpenOptions;
use crate::error::{Error, Result};
use crate::predicate::{Query, ShardGenerator, ShardTarget, Where};
use crate::table::basic::BasicTable;
use crate::table::{IndexKind, IndexSpec, InsertOptions, InsertResult, ModifyResult, Patch, Record, Table, TableMeta};
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};

/// Width of each shard's private id range.
const SHARD_ID_STEP: i64 = 1_000_000_000;

#[derive(Serialize, Deserialize, Clone)]
struct ShardEntry {
    name: String,
    index: i64,
    /// Persisted row count for this shard (§4.F "shards" record set).
    #[serde(default)]
    count: u64,
}

#[derive(Serialize, Deserialize, Clone)]
struct IndexRecord {
    field: String,
    kind: String,
}

#[derive(Serialize, Deserialize, Clone, Default)]
struct ManifestFile {
    shards: Vec<ShardEntry>,
    next_index: i64,
    /// The reserved info-shard's aggregate count (`id=""` in §4.F).
    #[serde(default)]
    info_count: u64,
    indexes: Vec<IndexRecord>,
}

struct Manifest {
    by_name: FxHashMap<String, i64>,
    counts: FxHashMap<String, u64>,
    next_index: i64,
    info_count: u64,
    indexes: Vec<IndexSpec>,
    path: PathBuf,
}

impl Manifest {
    async fn load(dir: &PathBuf) -> Result<Self> {
        let path = dir.join("shards.json");
        let file = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<ManifestFile>(&bytes)?,
            // The first-ever shard starts at index 1: the reserved
            // info-shard conceptually occupies index/id 0.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ManifestFile { next_index: 1, ..ManifestFile::default() },
            Err(e) => return Err(e.into()),
        };

        let by_name = file.shards.iter().map(|s| (s.name.clone(), s.index)).collect();
        let counts = file.shards.iter().map(|s| (s.name.clone(), s.count)).collect();
        let indexes = file
            .indexes
            .iter()
            .map(|r| IndexSpec {
                field: r.field.clone(),
                kind: if r.kind == "range" { IndexKind::Range } else { IndexKind::Hash },
            })
            .collect();

        Ok(Self {
            by_name,
            counts,
            next_index: file.next_index,
            info_count: file.info_count,
            indexes,
            path,
        })
    }

    async fn save(&self) -> Result<()> {
        let file = ManifestFile {
            shards: self
                .by_name
                .iter()
                .map(|(name, &index)| ShardEntry {
                    name: name.clone(),
                    index,
                    count: self.counts.get(name).copied().unwrap_or(0),
                })
                .collect(),
            next_index: self.next_index,
            info_count: self.info_count,
            indexes: self
                .indexes
                .iter()
                .map(|s| IndexRecord {
                    field: s.field.clone(),
                    kind: if s.kind == IndexKind::Range { "range" } else { "hash" }.to_string(),
                })
                .collect(),
        };
        let bytes = serde_json::to_vec_pretty(&file)?;
        crate::block_file::rewrite_atomic(&self.path, &bytes).await
    }

    fn index_of(&mut self, name: &str) -> i64 {
        if let Some(&idx) = self.by_name.get(name) {
            return idx;
        }
        let idx = self.next_index;
        self.next_index += 1;
        self.by_name.insert(name.to_string(), idx);
        self.counts.entry(name.to_string()).or_insert(0);
        idx
    }

    fn name_for_index(&self, index: i64) -> Option<&str> {
        self.by_name.iter().find(|(_, &i)| i == index).map(|(n, _)| n.as_str())
    }

    /// Adjusts one shard's persisted count and the info-shard's
    /// aggregate by the same `delta`, keeping invariant 6
    /// (`sum(shardRec.count) == infoShard.count`) intact.
    fn adjust_count(&mut self, name: &str, delta: i64) {
        let entry = self.counts.entry(name.to_string()).or_insert(0);
        *entry = i64::try_from(*entry).unwrap_or(i64::MAX).saturating_add(delta).max(0) as u64;
        self.info_count = i64::try_from(self.info_count).unwrap_or(i64::MAX).saturating_add(delta).max(0) as u64;
    }
}

struct ShardSlot {
    table: Arc<BasicTable>,
    /// In-flight operations currently pinning this shard open.
    lock: u32,
    /// A long-lived pin requested through `Query::persistent`.
    pers: bool,
}

struct ShardCache {
    open: FxHashMap<String, ShardSlot>,
    /// FIFO order used to pick an eviction candidate among closable
    /// shards.
    order: VecDeque<String>,
    /// Slots claimed by an in-progress open but not yet inserted.
    reserved: usize,
    capacity: usize,
}

impl ShardCache {
    fn new(capacity: usize) -> Self {
        Self {
            open: FxHashMap::default(),
            order: VecDeque::new(),
            reserved: 0,
            capacity: capacity.max(1),
        }
    }

    fn touch(&mut self, name: &str) {
        self.order.retain(|n| n != name);
        self.order.push_back(name.to_string());
    }

    /// `true` once room exists or a closable victim was removed, in
    /// which case the caller owns one reserved slot it must fill (by
    /// inserting the newly opened shard) or release on failure.
    fn try_reserve(&mut self) -> bool {
        if self.open.len() + self.reserved < self.capacity {
            self.reserved += 1;
            return true;
        }

        let mut victim = None;
        for name in &self.order {
            if let Some(slot) = self.open.get(name) {
                if slot.lock == 0 && !slot.pers {
                    victim = Some(name.clone());
                    break;
                }
            }
        }

        let Some(victim) = victim else { return false };
        self.order.retain(|n| n != &victim);
        self.open.remove(&victim);
        self.reserved += 1;
        true
    }

    fn release_reservation(&mut self) {
        self.reserved = self.reserved.saturating_sub(1);
    }
}

/// A directory of basic-table shards behind one [`Table`] facade.
pub struct ShardedTable {
    dir: PathBuf,
    opts: TableOpenOptions,
    manifest: Mutex<Manifest>,
    cache: Mutex<ShardCache>,
    cache_gate: Notify,
}

impl ShardedTable {
    pub async fn open(dir: PathBuf, opts: TableOpenOptions) -> Result<Self> {
        tokio::fs::create_dir_all(&dir).await?;
        let manifest = Manifest::load(&dir).await?;
        Ok(Self {
            cache: Mutex::new(ShardCache::new(opts.cache_shards)),
            dir,
            opts,
            manifest: Mutex::new(manifest),
            cache_gate: Notify::new(),
        })
    }

    fn shard_dir(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Opens a shard's on-disk table directly, applying every
    /// manifest-declared index. Does not touch the cache.
    async fn load_shard_handle(&self, name: &str) -> Result<Arc<BasicTable>> {
        let declared = self.manifest.lock().await.indexes.clone();
        let table = BasicTable::open(self.shard_dir(name), &self.opts, false).await?;
        for spec in declared {
            table.create_index(spec).await?;
        }
        Ok(Arc::new(table))
    }

    /// Acquires a pinned handle to an open shard, opening it (and
    /// evicting a closable victim, or suspending until one appears) if
    /// it isn't already cached.
    async fn acquire_shard(&self, name: &str) -> Result<Arc<BasicTable>> {
        loop {
            // Register interest before checking the condition: a
            // `notify_waiters` fired between the check and the await
            // below would otherwise be lost.
            let notified = self.cache_gate.notified();
            {
                let mut cache = self.cache.lock().await;
                if let Some(slot) = cache.open.get_mut(name) {
                    slot.lock += 1;
                    cache.touch(name);
                    return Ok(slot.table.clone());
                }
                if cache.try_reserve() {
                    break;
                }
            }
            notified.await;
        }

        let opened = self.load_shard_handle(name).await;
        let mut cache = self.cache.lock().await;
        cache.release_reservation();
        match opened {
            Ok(table) => {
                cache.open.insert(name.to_string(), ShardSlot { table: table.clone(), lock: 1, pers: false });
                cache.touch(name);
                Ok(table)
            }
            Err(e) => {
                drop(cache);
                self.cache_gate.notify_waiters();
                Err(e)
            }
        }
    }

    /// Releases one in-flight pin on `name` and applies a persistent
    /// pin change, if requested (`Some(true)` sets it, `Some(false)`
    /// clears it, `None` leaves it alone).
    async fn release_shard(&self, name: &str, persistent: Option<bool>) {
        {
            let mut cache = self.cache.lock().await;
            if let Some(slot) = cache.open.get_mut(name) {
                slot.lock = slot.lock.saturating_sub(1);
                if let Some(pers) = persistent {
                    slot.pers = pers;
                }
            }
        }
        self.cache_gate.notify_waiters();
    }

    /// Runs `f` against the pinned shard `name`, always releasing the
    /// pin afterwards (even on error).
    async fn with_shard<F, Fut, T>(&self, name: &str, persistent: Option<bool>, f: F) -> Result<T>
    where
        F: FnOnce(Arc<BasicTable>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let table = self.acquire_shard(name).await?;
        let result = f(table).await;
        self.release_shard(name, persistent).await;
        result
    }

    /// Resolves the name a new row should land in, allocating a
    /// manifest entry for it if it's new.
    async fn resolve_for_insert(&self, gen: &ShardGenerator, row: &serde_json::Value) -> Result<(i64, String)> {
        let target = gen.resolve(row);
        let name = match target {
            ShardTarget::Named(name) => name,
            ShardTarget::Auto => self.pick_auto_shard().await?,
        };

        let mut manifest = self.manifest.lock().await;
        let is_new = !manifest.by_name.contains_key(&name);
        let index = manifest.index_of(&name);
        if is_new {
            manifest.save().await?;
        }
        drop(manifest);

        Ok((index, name))
    }

    /// Picks an auto-generated shard under `auto_shard_size` rows
    /// (lowest index first, so names fill in order `auto_1, auto_2,
    /// …`), purely from the persisted manifest counts, or names a
    /// fresh one.
    async fn pick_auto_shard(&self) -> Result<String> {
        let manifest = self.manifest.lock().await;
        let mut candidates: Vec<(i64, &str, u64)> = manifest
            .by_name
            .iter()
            .filter(|(name, _)| name.starts_with("auto_"))
            .map(|(name, &idx)| (idx, name.as_str(), manifest.counts.get(name).copied().unwrap_or(0)))
            .collect();
        candidates.sort_by_key(|&(idx, _, _)| idx);

        for (_, name, count) in candidates {
            if count < self.opts.auto_shard_size {
                return Ok(name.to_string());
            }
        }
        Ok(format!("auto_{}", manifest.next_index))
    }

    fn split_id(id: i64) -> (i64, i64) {
        (id.div_euclid(SHARD_ID_STEP), id.rem_euclid(SHARD_ID_STEP))
    }

    async fn all_shard_names(&self) -> Vec<String> {
        self.manifest.lock().await.by_name.keys().cloned().collect()
    }

    async fn shard_name_for_index(&self, index: i64) -> Option<String> {
        self.manifest.lock().await.name_for_index(index).map(str::to_string)
    }

    /// Splits an id set by owning shard, dropping ids whose shard index
    /// isn't known to the manifest.
    async fn route_ids(&self, ids: &std::collections::HashSet<i64>) -> Vec<(String, Vec<i64>)> {
        let mut by_shard: FxHashMap<i64, Vec<i64>> = FxHashMap::default();
        for &id in ids.iter() {
            let (shard_idx, local_id) = Self::split_id(id);
            by_shard.entry(shard_idx).or_default().push(local_id);
        }

        let mut out = Vec::with_capacity(by_shard.len());
        for (shard_idx, local_ids) in by_shard {
            if let Some(name) = self.shard_name_for_index(shard_idx).await {
                out.push((name, local_ids));
            }
        }
        out
    }

    async fn adjust_count(&self, name: &str, delta: i64) -> Result<()> {
        let mut manifest = self.manifest.lock().await;
        manifest.adjust_count(name, delta);
        manifest.save().await
    }
}

#[async_trait]
impl Table for ShardedTable {
    async fn close(&self) -> Result<()> {
        let mut cache = self.cache.lock().await;
        let tables: Vec<Arc<BasicTable>> = cache.open.drain().map(|(_, slot)| slot.table).collect();
        cache.order.clear();
        drop(cache);
        for table in tables {
            table.close().await?;
        }
        Ok(())
    }

    async fn select(&self, query: &Query) -> Result<Vec<Record>> {
        if let Some(Where::IdSet(ids)) = &query.where_ {
            let routed = self.route_ids(ids).await;
            let mut out = Vec::new();
            for (name, local_ids) in routed {
                let shard_idx = self.manifest.lock().await.by_name.get(&name).copied().unwrap_or_default();
                let local_query = Query {
                    where_: Some(Where::IdSet(Arc::new(local_ids.into_iter().collect()))),
                    shards: None,
                    persistent: None,
                    ..query.clone()
                };
                let records = self.with_shard(&name, query.persistent, |t| async move { t.select(&local_query).await }).await?;
                for record in records {
                    out.push(Record::new(record.id + shard_idx * SHARD_ID_STEP, record.data));
                }
            }
            return Ok(out);
        }

        let names = match &query.shards {
            Some(list) => list.clone(),
            None => self.all_shard_names().await,
        };

        let mut out = Vec::new();
        for name in names {
            let Some(index) = self.manifest.lock().await.by_name.get(&name).copied() else {
                continue;
            };
            let records = self.with_shard(&name, query.persistent, |t| async move { t.select(query).await }).await?;
            for record in records {
                out.push(Record::new(record.id + index * SHARD_ID_STEP, record.data));
            }
        }

        if let Some(cmp) = &query.sort {
            out.sort_by(|a, b| cmp(a, b));
        }
        let offset = query.offset.unwrap_or(0);
        let out: Vec<Record> = out.into_iter().skip(offset).collect();
        let out: Vec<Record> = match query.limit {
            Some(limit) => out.into_iter().take(limit).collect(),
            None => out,
        };
        Ok(match &query.map {
            Some(f) => out.into_iter().map(|r| f(r)).collect(),
            None => out,
        })
    }

    async fn insert(&self, row: serde_json::Value, opts: InsertOptions) -> Result<InsertResult> {
        if opts.id.is_some() {
            return Err(Error::ShardedIdForbidden);
        }

        let generator = opts.shard.clone().unwrap_or(ShardGenerator::Auto);
        let (shard_idx, name) = self.resolve_for_insert(&generator, &row).await?;

        let local = self.with_shard(&name, None, |t| async move { t.insert(row, InsertOptions::default()).await }).await?;
        self.adjust_count(&name, 1).await?;

        Ok(InsertResult {
            id: local.id + shard_idx * SHARD_ID_STEP,
        })
    }

    async fn update(&self, query: &Query, patch: &Patch) -> Result<ModifyResult> {
        if let Some(Where::IdSet(ids)) = &query.where_ {
            let routed = self.route_ids(ids).await;
            let mut total = 0u64;
            for (name, local_ids) in routed {
                let local_query = Query::all().with_where(Where::IdSet(Arc::new(local_ids.into_iter().collect())));
                let count = self.with_shard(&name, None, |t| async move { t.update(&local_query, patch).await }).await?.count;
                total += count;
            }
            return Ok(ModifyResult { count: total });
        }

        let mut total = 0u64;
        for name in self.all_shard_names().await {
            total += self.with_shard(&name, None, |t| async move { t.update(query, patch).await }).await?.count;
        }
        Ok(ModifyResult { count: total })
    }

    async fn delete(&self, query: &Query) -> Result<ModifyResult> {
        if let Some(Where::IdSet(ids)) = &query.where_ {
            let routed = self.route_ids(ids).await;
            let mut total = 0u64;
            for (name, local_ids) in routed {
                let local_query = Query::all().with_where(Where::IdSet(Arc::new(local_ids.into_iter().collect())));
                let count = self.with_shard(&name, None, |t| async move { t.delete(&local_query).await }).await?.count;
                if count > 0 {
                    self.adjust_count(&name, -i64::try_from(count).unwrap_or(i64::MAX)).await?;
                }
                total += count;
            }
            return Ok(ModifyResult { count: total });
        }

        let mut total = 0u64;
        for name in self.all_shard_names().await {
            let count = self.with_shard(&name, None, |t| async move { t.delete(query).await }).await?.count;
            if count > 0 {
                self.adjust_count(&name, -i64::try_from(count).unwrap_or(i64::MAX)).await?;
            }
            total += count;
        }
        Ok(ModifyResult { count: total })
    }

    async fn create_index(&self, spec: IndexSpec) -> Result<()> {
        {
            let mut manifest = self.manifest.lock().await;
            if manifest.indexes.iter().any(|s| s.field == spec.field) {
                return Ok(());
            }
            manifest.indexes.push(spec.clone());
            manifest.save().await?;
        }

        for name in self.all_shard_names().await {
            let spec = spec.clone();
            self.with_shard(&name, None, |t| async move { t.create_index(spec).await }).await?;
        }
        Ok(())
    }

    async fn drop_index(&self, field: &str) -> Result<()> {
        {
            let mut manifest = self.manifest.lock().await;
            manifest.indexes.retain(|s| s.field != field);
            manifest.save().await?;
        }
        for name in self.all_shard_names().await {
            self.with_shard(&name, None, |t| async move { t.drop_index(field).await }).await?;
        }
        Ok(())
    }

    async fn get_meta(&self) -> Result<TableMeta> {
        let mut corrupted = false;
        for name in self.all_shard_names().await {
            let meta = self.with_shard(&name, None, |t| async move { t.get_meta().await }).await?;
            corrupted |= meta.corrupted;
        }
        let manifest = self.manifest.lock().await;
        Ok(TableMeta {
            table_type: "sharded".to_string(),
            row_count: manifest.info_count,
            indexes: manifest.indexes.iter().map(|s| s.field.clone()).collect(),
            corrupted,
        })
    }

    async fn mark_corrupted(&self) -> Result<()> {
        for name in self.all_shard_names().await {
            self.with_shard(&name, None, |t| async move { t.mark_corrupted().await }).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn opts() -> TableOpenOptions {
        TableOpenOptions {
            block_size: 4096,
            cache_shards: 2,
            auto_shard_size: 5,
            ..TableOpenOptions::default()
        }
    }

    #[tokio::test]
    async fn insert_into_named_shard_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let table = ShardedTable::open(dir.path().to_path_buf(), opts()).await.unwrap();

        let result = table
            .insert(
                json!({"a": 1}),
                InsertOptions { shard: Some(ShardGenerator::Fixed("us".to_string())), ..Default::default() },
            )
            .await
            .unwrap();

        let rows = table
            .select(&Query::all().with_where(Where::IdSet(Arc::new([result.id].into_iter().collect()))))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].data["a"], json!(1));
    }

    #[tokio::test]
    async fn explicit_id_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let table = ShardedTable::open(dir.path().to_path_buf(), opts()).await.unwrap();
        let err = table
            .insert(json!({}), InsertOptions { id: Some(1), ..Default::default() })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ShardedIdForbidden));
    }

    #[tokio::test]
    async fn auto_sharding_spreads_rows_once_threshold_hit() {
        let dir = tempfile::tempdir().unwrap();
        let table = ShardedTable::open(dir.path().to_path_buf(), opts()).await.unwrap();

        for i in 0..12 {
            table.insert(json!({"n": i}), InsertOptions::default()).await.unwrap();
        }

        let meta = table.get_meta().await.unwrap();
        assert_eq!(meta.row_count, 12);
        let names = table.all_shard_names().await;
        assert!(names.len() >= 2);
        assert!(names.contains(&"auto_1".to_string()));
    }

    #[tokio::test]
    async fn select_all_fans_out_and_remaps_ids() {
        let dir = tempfile::tempdir().unwrap();
        let table = ShardedTable::open(dir.path().to_path_buf(), opts()).await.unwrap();

        for i in 0..5 {
            table
                .insert(
                    json!({"n": i}),
                    InsertOptions { shard: Some(ShardGenerator::Fixed(format!("s{}", i % 2))), ..Default::default() },
                )
                .await
                .unwrap();
        }

        let rows = table.select(&Query::all()).await.unwrap();
        assert_eq!(rows.len(), 5);
        let ids: std::collections::HashSet<i64> = rows.iter().map(|r| r.id).collect();
        assert_eq!(ids.len(), 5);
    }

    #[tokio::test]
    async fn shard_counts_track_inserts_and_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let table = ShardedTable::open(dir.path().to_path_buf(), opts()).await.unwrap();

        let mut ids = Vec::new();
        for i in 0..4 {
            let r = table
                .insert(json!({"n": i}), InsertOptions { shard: Some(ShardGenerator::Fixed("a".into())), ..Default::default() })
                .await
                .unwrap();
            ids.push(r.id);
        }
        assert_eq!(table.get_meta().await.unwrap().row_count, 4);

        let deleted = table
            .delete(&Query::all().with_where(Where::IdSet(Arc::new([ids[0], ids[1]].into_iter().collect()))))
            .await
            .unwrap();
        assert_eq!(deleted.count, 2);
        assert_eq!(table.get_meta().await.unwrap().row_count, 2);
    }

    #[tokio::test]
    async fn delete_by_global_id_routes_to_owning_shard() {
        let dir = tempfile::tempdir().unwrap();
        let table = ShardedTable::open(dir.path().to_path_buf(), opts()).await.unwrap();

        let a = table
            .insert(json!({"n": 1}), InsertOptions { shard: Some(ShardGenerator::Fixed("a".into())), ..Default::default() })
            .await
            .unwrap();
        table
            .insert(json!({"n": 2}), InsertOptions { shard: Some(ShardGenerator::Fixed("b".into())), ..Default::default() })
            .await
            .unwrap();

        let result = table.delete(&Query::all().with_where(Where::IdSet(Arc::new([a.id].into_iter().collect())))).await.unwrap();
        assert_eq!(result.count, 1);

        let remaining = table.select(&Query::all()).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].data["n"], json!(2));
    }

    #[tokio::test]
    async fn cache_eviction_respects_persistent_pin() {
        let dir = tempfile::tempdir().unwrap();
        let mut single = opts();
        single.cache_shards = 1;
        let table = Arc::new(ShardedTable::open(dir.path().to_path_buf(), single).await.unwrap());

        table
            .insert(json!({"n": 1}), InsertOptions { shard: Some(ShardGenerator::Fixed("a".into())), ..Default::default() })
            .await
            .unwrap();
        table
            .insert(json!({"n": 2}), InsertOptions { shard: Some(ShardGenerator::Fixed("b".into())), ..Default::default() })
            .await
            .unwrap();

        let pinned = table.select(&Query::all().with_shards(vec!["a".to_string()]).with_persistent(true)).await.unwrap();
        assert_eq!(pinned.len(), 1);

        let waiter_table = table.clone();
        let handle = tokio::spawn(async move { waiter_table.select(&Query::all().with_shards(vec!["b".to_string()])).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished(), "select on an evicted-but-pinned shard's neighbour should suspend");

        table.select(&Query::all().with_shards(vec!["a".to_string()]).with_persistent(false)).await.unwrap();

        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].data["n"], json!(2));
    }
}
