// Copyright (c) 2024-present, blockbase-db
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Small utilities shared across the engine (component I).

use crate::error::Result;
use crate::lock_queue::LockQueue;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Structural clone of a JSON record. `serde_json::Value::clone` is
/// already a deep copy (every variant owns its data), so this exists to
/// give the operation a name at call sites, matching the source's
/// explicit `deepClone` utility.
#[must_use]
pub fn deep_clone(value: &serde_json::Value) -> serde_json::Value {
    value.clone()
}

/// Whether `path` exists, tolerating permission errors the same way a
/// plain existence check should (anything other than "not found" is
/// still reported as `true` so callers don't silently treat "can't tell"
/// as "doesn't exist").
pub async fn path_exists(path: &Path) -> bool {
    tokio::fs::metadata(path).await.is_ok()
}

/// Escapes a JSON value for embedding as a literal into predicate source
/// text: strings are quoted/escaped, arrays become bracketed literal
/// lists, everything else uses its JSON rendering (numbers, booleans,
/// null).
#[must_use]
pub fn esc(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(esc).collect();
            format!("[{}]", parts.join(","))
        }
        other => other.to_string(),
    }
}

/// Compresses `data` with DEFLATE at `level` (0-9). `level == 0` returns
/// the input unchanged.
pub fn deflate(data: &[u8], level: u32) -> std::io::Result<Vec<u8>> {
    use flate2::write::DeflateEncoder;
    use flate2::Compression;
    use std::io::Write;

    if level == 0 {
        return Ok(data.to_vec());
    }

    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::new(level.min(9)));
    encoder.write_all(data)?;
    encoder.finish()
}

/// Decompresses DEFLATE-encoded `data`.
pub fn inflate(data: &[u8]) -> std::io::Result<Vec<u8>> {
    use flate2::read::DeflateDecoder;
    use std::io::Read;

    let mut decoder = DeflateDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

/// Per-path lock registry guarding a block file while it is being loaded
/// or unlinked, as distinct from the per-table [`LockQueue`]. Entries are
/// dropped once no commit holds a reference to them, so the registry
/// never grows unbounded.
#[derive(Default)]
pub struct FileLockRegistry {
    locks: Mutex<HashMap<PathBuf, Arc<LockQueue>>>,
}

impl FileLockRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn queue_for(&self, path: &Path) -> Arc<LockQueue> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(LockQueue::new()))
            .clone()
    }

    /// Runs `f` while holding the per-file lock for `path`, then drops
    /// the registry entry if nobody else grabbed a reference to it in
    /// the meantime.
    pub async fn with_lock<T, F, Fut>(&self, path: &Path, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let queue = self.queue_for(path);
        let result = {
            let _guard = queue.acquire().await?;
            f().await
        };

        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(entry) = locks.get(path) {
            if Arc::strong_count(entry) == 1 {
                locks.remove(path);
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn esc_renders_strings_and_arrays() {
        assert_eq!(esc(&json!("a\"b")), "\"a\\\"b\"");
        assert_eq!(esc(&json!([1, 2, "x"])), "[1,2,\"x\"]");
        assert_eq!(esc(&json!(42)), "42");
        assert_eq!(esc(&json!(null)), "null");
    }

    #[test]
    fn deflate_inflate_round_trip() {
        let data = b"hello world, hello world, hello world".to_vec();
        let compressed = deflate(&data, 6).unwrap();
        assert!(compressed.len() < data.len());
        let restored = inflate(&compressed).unwrap();
        assert_eq!(restored, data);
    }

    #[tokio::test]
    async fn file_lock_registry_serializes_access() {
        let registry = Arc::new(FileLockRegistry::new());
        let path = PathBuf::from("/tmp/some-block.jem");
        let order = Arc::new(tokio::sync::Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..4 {
            let registry = registry.clone();
            let path = path.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                registry
                    .with_lock(&path, || async move {
                        order.lock().await.push(i);
                        Ok(())
                    })
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(order.lock().await.len(), 4);
    }
}
