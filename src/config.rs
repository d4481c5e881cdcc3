// Copyright (c) 2024-present, blockbase-db
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Configuration structs for the three entry points named in the
//! external interface: opening a database directory, opening a table,
//! and enabling the monitoring table.

use crate::file_lock::LockMode;
use std::path::{Path, PathBuf};

/// What kind of table a given name/path refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TableType {
    /// Append-only block-file-backed table (component E).
    Basic,
    /// Sharded table (component F), a directory of basic tables.
    Sharded,
    /// Pure in-memory table (component G).
    Memory,
}

impl TableType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Basic => "basic",
            Self::Sharded => "sharded",
            Self::Memory => "memory",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "basic" => Some(Self::Basic),
            "sharded" => Some(Self::Sharded),
            "memory" => Some(Self::Memory),
            _ => None,
        }
    }
}

/// Options for opening (and optionally creating) a database directory.
#[derive(Clone, Debug)]
pub struct DbOpenOptions {
    /// Directory the database lives in.
    pub db_path: PathBuf,
    /// Create the directory if it does not exist.
    pub create: bool,
    /// Steal a stale lock sentinel instead of failing hard.
    pub soft_lock: bool,
    /// Open regardless of any existing lock sentinel.
    pub ignore_lock: bool,
    /// Defaults merged into every table's open options unless overridden.
    pub table_defaults: TableOpenOptions,
}

impl DbOpenOptions {
    #[must_use]
    pub fn new<P: AsRef<Path>>(db_path: P) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
            create: false,
            soft_lock: false,
            ignore_lock: false,
            table_defaults: TableOpenOptions::default(),
        }
    }

    #[must_use]
    pub fn lock_mode(&self) -> LockMode {
        if self.ignore_lock {
            LockMode::Ignore
        } else if self.soft_lock {
            LockMode::Soft
        } else {
            LockMode::Hard
        }
    }
}

/// Per-table open options.
#[derive(Clone, Debug)]
pub struct TableOpenOptions {
    /// Table kind; `None` means "read from the on-disk `type` file".
    pub table_type: Option<TableType>,
    /// Number of blocks kept resident in RAM beyond the current block.
    pub cache_size: usize,
    /// Max number of shard-tables simultaneously open (sharded only).
    pub cache_shards: usize,
    /// Row threshold a shard stays under before auto-sharding opens a
    /// new one.
    pub auto_shard_size: u64,
    /// DEFLATE compression level used for finalized block files; `0`
    /// disables compression.
    pub compressed: u32,
    /// Wipe and recreate the table on open.
    pub recreate: bool,
    /// Attempt `loadCorrupted` recovery if `state` reads `"0"`.
    pub auto_repair: bool,
    /// Force closing any file handles held from a previous open before
    /// reopening (useful for tests that reopen a table quickly).
    pub force_file_closing: bool,
    /// Tolerate a table directory whose `type` file names a different
    /// type than requested, rather than erroring.
    pub type_compat_mode: bool,
    /// Block size ceiling in bytes before a new current block is
    /// created.
    pub block_size: u64,
}

impl Default for TableOpenOptions {
    fn default() -> Self {
        Self {
            table_type: None,
            cache_size: 5,
            cache_shards: 1,
            auto_shard_size: 1_000_000,
            compressed: 0,
            recreate: false,
            auto_repair: false,
            force_file_closing: false,
            type_compat_mode: false,
            block_size: /* 1 MiB */ 1_024 * 1_024,
        }
    }
}

/// Options for the in-memory monitoring table (§4.H).
#[derive(Clone, Debug)]
pub struct MonitoringOptions {
    /// Whether to intercept directory calls at all.
    pub enable: bool,
    /// Name of the in-memory monitoring table.
    pub table: String,
    /// Rows older than this are swept away periodically.
    pub interval_minutes: u64,
    /// Queries longer than this are truncated before being recorded.
    pub max_query_length: usize,
}

impl Default for MonitoringOptions {
    fn default() -> Self {
        Self {
            enable: false,
            table: "__monitoring".to_string(),
            interval_minutes: 15,
            max_query_length: 200,
        }
    }
}
