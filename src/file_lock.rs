// Copyright (c) 2024-present, blockbase-db
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Cooperative exclusive lock on a directory via a sentinel file
//! (component B).
//!
//! On open, the directory manager tries to create a `.lock` sentinel
//! file and hold it for the lifetime of the database. A background
//! watcher refreshes the sentinel's mtime so other processes can tell a
//! live holder apart from a crashed one. Three modes, matching the
//! specification:
//!
//! - **hard**: fail immediately if the sentinel exists.
//! - **soft**: steal the sentinel if its mtime is older than a grace
//!   period (the previous holder is assumed dead).
//! - **ignore**: open regardless of any sentinel.

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;

const SENTINEL_NAME: &str = ".lock";
const REFRESH_INTERVAL: Duration = Duration::from_millis(2_000);
const DEFAULT_STALE_GRACE: Duration = Duration::from_secs(10);

/// Locking discipline applied when opening a database directory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LockMode {
    /// Fail with [`Error::DatabaseLocked`] if the sentinel already
    /// exists.
    #[default]
    Hard,
    /// Steal a sentinel whose mtime is older than the grace period.
    Soft,
    /// Open regardless of the sentinel's presence.
    Ignore,
}

/// A held directory lock. Dropping it (or calling [`FileLock::release`])
/// removes the sentinel and stops the background watcher.
pub struct FileLock {
    path: PathBuf,
    watcher: Option<JoinHandle<()>>,
}

impl FileLock {
    /// Attempts to take the directory lock for `dir` under `mode`.
    pub async fn acquire(dir: &Path, mode: LockMode) -> Result<Self> {
        let path = dir.join(SENTINEL_NAME);

        if mode != LockMode::Ignore {
            if let Ok(meta) = tokio::fs::metadata(&path).await {
                let is_stale = mode == LockMode::Soft
                    && meta
                        .modified()
                        .ok()
                        .and_then(|m| SystemTime::now().duration_since(m).ok())
                        .is_some_and(|age| age > DEFAULT_STALE_GRACE);

                if !is_stale {
                    log::warn!("directory lock held: {}", path.display());
                    return Err(Error::DatabaseLocked);
                }

                log::info!("stealing stale lock: {}", path.display());
            }
        }

        touch(&path).await?;

        let watcher_path = path.clone();
        let watcher = tokio::spawn(async move {
            loop {
                tokio::time::sleep(REFRESH_INTERVAL).await;
                if touch(&watcher_path).await.is_err() {
                    log::warn!("failed to refresh lock sentinel: {}", watcher_path.display());
                }
            }
        });

        Ok(Self {
            path,
            watcher: Some(watcher),
        })
    }

    /// Releases the lock: stops the watcher and removes the sentinel.
    pub async fn release(mut self) {
        if let Some(handle) = self.watcher.take() {
            handle.abort();
        }
        let _ = tokio::fs::remove_file(&self.path).await;
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Some(handle) = self.watcher.take() {
            handle.abort();
        }
    }
}

async fn touch(path: &Path) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .await?;
    file.write_all(std::process::id().to_string().as_bytes())
        .await?;
    file.sync_all().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hard_lock_rejects_second_holder() {
        let dir = tempfile::tempdir().unwrap();
        let lock1 = FileLock::acquire(dir.path(), LockMode::Hard).await.unwrap();
        let err = FileLock::acquire(dir.path(), LockMode::Hard)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DatabaseLocked));
        lock1.release().await;
        let _lock2 = FileLock::acquire(dir.path(), LockMode::Hard).await.unwrap();
    }

    #[tokio::test]
    async fn ignore_mode_always_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let _a = FileLock::acquire(dir.path(), LockMode::Ignore).await.unwrap();
        let _b = FileLock::acquire(dir.path(), LockMode::Ignore).await.unwrap();
    }

    #[tokio::test]
    async fn release_removes_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let lock = FileLock::acquire(dir.path(), LockMode::Hard).await.unwrap();
        lock.release().await;
        assert!(!dir.path().join(SENTINEL_NAME).exists());
    }
}
