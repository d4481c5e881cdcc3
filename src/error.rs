// Copyright (c) 2024-present, blockbase-db
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Error taxonomy for the database engine.
//!
//! Errors fall into five kinds (configuration, not-found, busy, data,
//! system). Configuration and not-found errors are synchronous caller
//! mistakes and leave no state behind. Busy errors are transient. Data
//! errors surface during recovery. System errors during commit stick to
//! the offending table.

use std::fmt;

/// Errors that can occur while operating the database.
#[derive(Debug)]
pub enum Error {
    /// The database directory is not open.
    DatabaseClosed,

    /// Another process (or a stale lock from this one) holds the
    /// directory's file lock.
    DatabaseLocked,

    /// `create` was called for a table that already exists.
    TableAlreadyExists(String),

    /// A table name was not found in the directory.
    TableNotFound(String),

    /// The table exists in the map but is not currently open.
    TableNotOpen(String),

    /// The table's on-disk `state` file is `"0"` and `autoRepair` was not
    /// requested, or repair itself failed.
    TableCorrupted(String),

    /// A required parameter was not supplied.
    MissingParameter(&'static str),

    /// A lock queue reached its configured maximum waiter count.
    LockQueueOverflow,

    /// Sharded tables do not support unique hash/index specs.
    UniqueConstraintUnsupported,

    /// A row already exists and neither `replace` nor `ignore` was set.
    DuplicateId(i64),

    /// A sharded insert carried an explicit `id`, which is forbidden.
    ShardedIdForbidden,

    /// A block file or journal is malformed beyond what the tolerant
    /// reader can recover.
    Corrupted(String),

    /// Underlying I/O failure.
    Io(std::io::Error),

    /// JSON encode/decode failure.
    Json(serde_json::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DatabaseClosed => write!(f, "database is closed"),
            Self::DatabaseLocked => write!(f, "database directory is locked by another process"),
            Self::TableAlreadyExists(name) => write!(f, "table already exists: {name}"),
            Self::TableNotFound(name) => write!(f, "table not found: {name}"),
            Self::TableNotOpen(name) => write!(f, "table not open: {name}"),
            Self::TableCorrupted(name) => write!(f, "table corrupted: {name}"),
            Self::MissingParameter(name) => write!(f, "missing parameter: {name}"),
            Self::LockQueueOverflow => write!(f, "lock queue overflow"),
            Self::UniqueConstraintUnsupported => {
                write!(f, "unique hash/index specs are not supported on sharded tables")
            }
            Self::DuplicateId(id) => write!(f, "row already exists: {id}"),
            Self::ShardedIdForbidden => write!(f, "id must not be supplied on sharded insert"),
            Self::Corrupted(msg) => write!(f, "corrupted data: {msg}"),
            Self::Io(err) => write!(f, "io error: {err}"),
            Self::Json(err) => write!(f, "json error: {err}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

impl Error {
    /// Whether this error is transient and safe to retry.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::LockQueueOverflow | Self::DatabaseLocked)
    }

    /// Whether this error should flip a table into its sticky
    /// `fileError` / `state=0` mode, per the commit failure semantics.
    #[must_use]
    pub fn is_system(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}

/// Database result type.
pub type Result<T> = std::result::Result<T, Error>;
