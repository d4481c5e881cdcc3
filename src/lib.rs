// Copyright (c) 2024-present, blockbase-db
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! An embedded, document-oriented database engine.
//!
//! A database is a directory on disk (see [`Database`]); inside it,
//! each named table is its own subdirectory of append-only block files
//! (see [`table::basic::BasicTable`]), a directory of such tables keyed
//! by shard (see [`sharded::ShardedTable`]), or a pure in-memory table
//! (see [`table::memory::MemoryTable`]). Every table implements the
//! shared [`table::Table`] trait, so the directory manager never needs
//! to know which kind it is holding.
//!
//! # Example
//!
//! ```
//! # async fn run() -> blockbase_db::error::Result<()> {
//! use blockbase_db::config::{DbOpenOptions, MonitoringOptions, TableOpenOptions};
//! use blockbase_db::predicate::Query;
//! use blockbase_db::table::InsertOptions;
//!
//! let folder = tempfile::tempdir()?;
//! let mut opts = DbOpenOptions::new(folder.path());
//! opts.create = true;
//!
//! let db = blockbase_db::Database::open(opts, MonitoringOptions::default()).await?;
//! db.create("users", TableOpenOptions::default()).await?;
//! db.insert("users", serde_json::json!({"name": "Ada"}), InsertOptions::default()).await?;
//!
//! let rows = db.select("users", &Query::all(), None).await?;
//! assert_eq!(rows.len(), 1);
//! # Ok(())
//! # }
//! # tokio::runtime::Runtime::new().unwrap().block_on(run()).unwrap();
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![deny(clippy::unwrap_used)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::module_name_repetitions)]

mod block_file;
pub mod config;
pub mod directory;
pub mod engine;
pub mod error;
mod file_lock;
mod lock_queue;
pub mod monitoring;
pub mod predicate;
pub mod sharded;
pub mod table;
mod util;

pub use directory::{Database, DbInfo, TableInfo};
pub use error::{Error, Result};
