// Copyright (c) 2024-present, blockbase-db
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The database directory manager (component H): owns the directory
//! file lock, the map of open tables, and the monitoring table. Every
//! operation a caller runs against a named table passes through here so
//! it can be serialized per table name and, if enabled, timed into the
//! monitoring table.

use crate::config::{DbOpenOptions, TableOpenOptions, TableType};
use crate::error::{Error, Result};
use crate::file_lock::FileLock;
use crate::lock_queue::NamedLockQueues;
use crate::monitoring::Monitoring;
use crate::predicate::{JoinById, Query, Where};
use crate::sharded::ShardedTable;
use crate::table::basic::BasicTable;
use crate::table::memory::MemoryTable;
use crate::table::{InsertOptions, InsertResult, ModifyResult, Patch, Record, Table, TableMeta};
use rustc_hash::FxHashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

const TYPE_FILE: &str = "type";
const SENTINEL_NAME: &str = ".lock";
const MONITORING_DIR_PREFIX: &str = "__";

/// Per-table row count and type, as returned by [`Database::info`].
#[derive(Clone, Debug)]
pub struct TableInfo {
    pub name: String,
    pub table_type: String,
    pub row_count: u64,
}

/// A summary of the whole database directory.
#[derive(Clone, Debug, Default)]
pub struct DbInfo {
    pub tables: Vec<TableInfo>,
}

/// An open database directory: the file lock, the open-table map and
/// the monitoring table.
pub struct Database {
    dir: PathBuf,
    table_defaults: TableOpenOptions,
    lock: Mutex<Option<FileLock>>,
    table_locks: NamedLockQueues,
    tables: Mutex<FxHashMap<String, Arc<dyn Table>>>,
    monitoring: Arc<Monitoring>,
}

impl Database {
    /// Opens (and optionally creates) a database directory, acquiring
    /// its file lock per `opts.lock_mode()`.
    pub async fn open(opts: DbOpenOptions, monitoring: crate::config::MonitoringOptions) -> Result<Arc<Self>> {
        if opts.create {
            tokio::fs::create_dir_all(&opts.db_path).await?;
        } else {
            tokio::fs::metadata(&opts.db_path).await.map_err(Error::from)?;
        }

        let lock = FileLock::acquire(&opts.db_path, opts.lock_mode()).await?;

        Ok(Arc::new(Self {
            dir: opts.db_path.clone(),
            table_defaults: opts.table_defaults.clone(),
            lock: Mutex::new(Some(lock)),
            table_locks: NamedLockQueues::new(),
            tables: Mutex::new(FxHashMap::default()),
            monitoring: Monitoring::start(monitoring),
        }))
    }

    fn table_path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Creates a table directory and opens it. Fails with
    /// [`Error::TableAlreadyExists`] unless `opts.recreate` is set.
    pub async fn create(&self, name: &str, opts: TableOpenOptions) -> Result<()> {
        let queue = self.table_locks.get(name).await;
        let _guard = queue.acquire().await?;

        let dir = self.table_path(name);
        let exists = crate::util::path_exists(&dir).await;
        if exists && !opts.recreate {
            return Err(Error::TableAlreadyExists(name.to_string()));
        }
        if exists {
            self.close_one(name).await?;
            tokio::fs::remove_dir_all(&dir).await?;
        }

        tokio::fs::create_dir_all(&dir).await?;
        let table_type = opts.table_type.unwrap_or(TableType::Basic);
        tokio::fs::write(dir.join(TYPE_FILE), table_type.as_str()).await?;

        let table = self.open_table_kind(&dir, table_type, &opts).await?;
        self.tables.lock().await.insert(name.to_string(), table);
        Ok(())
    }

    async fn open_table_kind(&self, dir: &Path, kind: TableType, opts: &TableOpenOptions) -> Result<Arc<dyn Table>> {
        match kind {
            TableType::Basic => {
                let allow_corrupted = opts.auto_repair && state_file_says_corrupted(dir).await;
                Ok(Arc::new(BasicTable::open(dir.to_path_buf(), opts, allow_corrupted).await?))
            }
            TableType::Sharded => Ok(Arc::new(ShardedTable::open(dir.to_path_buf(), opts.clone()).await?)),
            TableType::Memory => Ok(Arc::new(MemoryTable::new())),
        }
    }

    /// Opens every table directory under the database root that isn't
    /// already open: any subdirectory carrying a `type` file.
    pub async fn open_all(&self) -> Result<()> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let Ok(file_type) = entry.file_type().await else {
                continue;
            };
            if !file_type.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name == SENTINEL_NAME || name.starts_with(MONITORING_DIR_PREFIX) {
                continue;
            }
            if crate::util::path_exists(&entry.path().join(TYPE_FILE)).await {
                names.push(name.to_string());
            }
        }

        for name in names {
            if self.tables.lock().await.contains_key(&name) {
                continue;
            }
            let dir = self.table_path(&name);
            let kind = read_table_type(&dir).await?.unwrap_or(TableType::Basic);
            let table = self.open_table_kind(&dir, kind, &self.table_defaults).await?;
            self.tables.lock().await.insert(name, table);
        }
        Ok(())
    }

    /// Whether `name` has a table directory on disk, open or not.
    pub async fn table_exists(&self, name: &str) -> bool {
        if self.tables.lock().await.contains_key(name) {
            return true;
        }
        crate::util::path_exists(&self.table_path(name).join(TYPE_FILE)).await
    }

    async fn get_table(&self, name: &str) -> Result<Arc<dyn Table>> {
        if let Some(table) = self.tables.lock().await.get(name) {
            return Ok(table.clone());
        }
        if self.table_exists(name).await {
            Err(Error::TableNotOpen(name.to_string()))
        } else {
            Err(Error::TableNotFound(name.to_string()))
        }
    }

    async fn close_one(&self, name: &str) -> Result<()> {
        if let Some(table) = self.tables.lock().await.remove(name) {
            table.close().await?;
        }
        Ok(())
    }

    /// Closes and removes a table's directory entirely.
    pub async fn drop_table(&self, name: &str) -> Result<()> {
        let queue = self.table_locks.get(name).await;
        let _guard = queue.acquire().await?;

        self.close_one(name).await?;
        let dir = self.table_path(name);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.table_locks.remove(name).await;
        Ok(())
    }

    /// Deletes every row without removing the table directory itself.
    pub async fn truncate(&self, name: &str) -> Result<()> {
        let table = self.get_table(name).await?;
        table.delete(&Query::all()).await?;
        Ok(())
    }

    /// Copies every row matched by `query` from `src` into `dst`, which
    /// must already exist.
    pub async fn clone_table(&self, src: &str, dst: &str, query: &Query) -> Result<u64> {
        let src_table = self.get_table(src).await?;
        let dst_table = self.get_table(dst).await?;
        src_table.clone_into(query, dst_table.as_ref()).await
    }

    /// Runs `select`, optionally joining in rows from another table by
    /// id, and times the call into the monitoring table.
    pub async fn select(&self, name: &str, query: &Query, join: Option<&JoinById>) -> Result<Vec<Record>> {
        let time_begin = crate::monitoring::now_micros();
        let result = self.select_inner(name, query, join).await;
        let time_end = crate::monitoring::now_micros();
        self.monitoring
            .record(name, "select", Some(query), time_begin, time_end, result.as_ref().err().map(ToString::to_string).as_deref())
            .await;
        result
    }

    async fn select_inner(&self, name: &str, query: &Query, join: Option<&JoinById>) -> Result<Vec<Record>> {
        let table = self.get_table(name).await?;
        let mut rows = table.select(query).await?;

        if let Some(join) = join {
            let joined = self.get_table(&join.table).await?;
            for row in &mut rows {
                let Some(value) = row.data.get(&join.id_field).cloned() else {
                    continue;
                };
                let ids: std::collections::HashSet<i64> = match &value {
                    serde_json::Value::Array(items) => items.iter().filter_map(serde_json::Value::as_i64).collect(),
                    other => other.as_i64().into_iter().collect(),
                };
                if ids.is_empty() {
                    continue;
                }
                let sub_query = Query::all().with_where(Where::IdSet(Arc::new(ids)));
                let joined_rows = joined.select(&sub_query).await?;
                if let Some(obj) = row.data.as_object_mut() {
                    obj.insert(
                        join.into_field.clone(),
                        serde_json::to_value(joined_rows.into_iter().map(|r| r.data).collect::<Vec<_>>())
                            .unwrap_or(serde_json::Value::Null),
                    );
                }
            }
        }

        Ok(rows)
    }

    pub async fn insert(&self, name: &str, row: serde_json::Value, opts: InsertOptions) -> Result<InsertResult> {
        let time_begin = crate::monitoring::now_micros();
        let table = self.get_table(name).await;
        let result = match table {
            Ok(table) => table.insert(row, opts).await,
            Err(e) => Err(e),
        };
        let time_end = crate::monitoring::now_micros();
        self.monitoring
            .record(name, "insert", None, time_begin, time_end, result.as_ref().err().map(ToString::to_string).as_deref())
            .await;
        result
    }

    pub async fn update(&self, name: &str, query: &Query, patch: &Patch) -> Result<ModifyResult> {
        let time_begin = crate::monitoring::now_micros();
        let table = self.get_table(name).await;
        let result = match table {
            Ok(table) => table.update(query, patch).await,
            Err(e) => Err(e),
        };
        let time_end = crate::monitoring::now_micros();
        self.monitoring
            .record(name, "update", Some(query), time_begin, time_end, result.as_ref().err().map(ToString::to_string).as_deref())
            .await;
        result
    }

    pub async fn delete(&self, name: &str, query: &Query) -> Result<ModifyResult> {
        let time_begin = crate::monitoring::now_micros();
        let table = self.get_table(name).await;
        let result = match table {
            Ok(table) => table.delete(query).await,
            Err(e) => Err(e),
        };
        let time_end = crate::monitoring::now_micros();
        self.monitoring
            .record(name, "delete", Some(query), time_begin, time_end, result.as_ref().err().map(ToString::to_string).as_deref())
            .await;
        result
    }

    pub async fn get_meta(&self, name: &str) -> Result<TableMeta> {
        self.get_table(name).await?.get_meta().await
    }

    pub async fn mark_corrupted(&self, name: &str) -> Result<()> {
        self.get_table(name).await?.mark_corrupted().await
    }

    /// A snapshot of every open/discoverable table's type and row
    /// count.
    pub async fn info(&self) -> Result<DbInfo> {
        self.open_all().await?;
        let tables = self.tables.lock().await;
        let mut out = Vec::with_capacity(tables.len());
        for (name, table) in tables.iter() {
            let meta = table.get_meta().await?;
            out.push(TableInfo {
                name: name.clone(),
                table_type: meta.table_type,
                row_count: meta.row_count,
            });
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(DbInfo { tables: out })
    }

    /// Total on-disk size of the database directory, in bytes.
    pub async fn disk_size(&self) -> Result<u64> {
        dir_size(&self.dir).await
    }

    /// The in-memory monitoring table's recorded calls.
    pub async fn monitoring_rows(&self) -> Result<Vec<Record>> {
        self.monitoring.rows().await
    }

    /// Closes every open table and releases the directory lock. Further
    /// calls on this handle will fail once the tables are gone.
    pub async fn close(&self) -> Result<()> {
        let names: Vec<String> = self.tables.lock().await.keys().cloned().collect();
        for name in names {
            self.close_one(&name).await?;
        }
        if let Some(lock) = self.lock.lock().await.take() {
            lock.release().await;
        }
        Ok(())
    }
}

async fn read_table_type(dir: &Path) -> Result<Option<TableType>> {
    match tokio::fs::read_to_string(dir.join(TYPE_FILE)).await {
        Ok(contents) => Ok(TableType::parse(contents.trim())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn state_file_says_corrupted(dir: &Path) -> bool {
    matches!(tokio::fs::read_to_string(dir.join("state")).await, Ok(s) if s.trim() == "0")
}

fn dir_size<'a>(dir: &'a Path) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<u64>> + Send + 'a>> {
    Box::pin(async move {
        let mut total = 0u64;
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            if meta.is_dir() {
                total += dir_size(&entry.path()).await?;
            } else {
                total += meta.len();
            }
        }
        Ok(total)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn db_opts(path: &Path) -> DbOpenOptions {
        DbOpenOptions::new(path)
    }

    #[tokio::test]
    async fn create_and_insert_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(db_opts(dir.path()), crate::config::MonitoringOptions::default()).await.unwrap();
        db.create("users", TableOpenOptions::default()).await.unwrap();

        let r = db.insert("users", json!({"name": "a"}), InsertOptions::default()).await.unwrap();
        let rows = db.select("users", &Query::all(), None).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, r.id);
    }

    #[tokio::test]
    async fn create_twice_without_recreate_fails() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(db_opts(dir.path()), crate::config::MonitoringOptions::default()).await.unwrap();
        db.create("users", TableOpenOptions::default()).await.unwrap();
        let err = db.create("users", TableOpenOptions::default()).await.unwrap_err();
        assert!(matches!(err, Error::TableAlreadyExists(_)));
    }

    #[tokio::test]
    async fn reopen_discovers_tables_via_open_all() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = Database::open(db_opts(dir.path()), crate::config::MonitoringOptions::default()).await.unwrap();
            db.create("users", TableOpenOptions::default()).await.unwrap();
            db.insert("users", json!({"a": 1}), InsertOptions::default()).await.unwrap();
            db.close().await.unwrap();
        }

        let db = Database::open(db_opts(dir.path()), crate::config::MonitoringOptions::default()).await.unwrap();
        db.open_all().await.unwrap();
        let rows = db.select("users", &Query::all(), None).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn drop_table_removes_directory() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(db_opts(dir.path()), crate::config::MonitoringOptions::default()).await.unwrap();
        db.create("users", TableOpenOptions::default()).await.unwrap();
        db.drop_table("users").await.unwrap();
        assert!(!db.table_exists("users").await);
    }

    #[tokio::test]
    async fn join_by_id_embeds_related_rows() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(db_opts(dir.path()), crate::config::MonitoringOptions::default()).await.unwrap();
        db.create("authors", TableOpenOptions::default()).await.unwrap();
        db.create("books", TableOpenOptions::default()).await.unwrap();

        let author = db.insert("authors", json!({"name": "Ada"}), InsertOptions::default()).await.unwrap();
        db.insert("books", json!({"title": "T", "authorId": author.id}), InsertOptions::default()).await.unwrap();

        let join = JoinById {
            table: "authors".to_string(),
            id_field: "authorId".to_string(),
            into_field: "author".to_string(),
        };
        let rows = db.select("books", &Query::all(), Some(&join)).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].data["author"][0]["name"], json!("Ada"));
    }

    #[tokio::test]
    async fn monitoring_records_success_and_failure_rows() {
        let dir = tempfile::tempdir().unwrap();
        let monitoring_opts = crate::config::MonitoringOptions { enable: true, max_query_length: 10, ..Default::default() };
        let db = Database::open(db_opts(dir.path()), monitoring_opts).await.unwrap();
        db.create("users", TableOpenOptions::default()).await.unwrap();

        db.insert("users", json!({"name": "a"}), InsertOptions::default()).await.unwrap();
        let _ = db.select("missing", &Query::all(), None).await;

        let rows = db.monitoring_rows().await.unwrap();
        assert_eq!(rows.len(), 2);

        let insert_row = rows.iter().find(|r| r.data["method"] == json!("insert")).unwrap();
        assert_eq!(insert_row.data["error"], json!(""));
        let begin = insert_row.data["timeBegin"].as_u64().unwrap();
        let end = insert_row.data["timeEnd"].as_u64().unwrap();
        assert!(end >= begin);

        let select_row = rows.iter().find(|r| r.data["method"] == json!("select")).unwrap();
        assert_ne!(select_row.data["error"], json!(""));
        let begin = select_row.data["timeBegin"].as_u64().unwrap();
        let end = select_row.data["timeEnd"].as_u64().unwrap();
        assert!(end >= begin);
    }
}
