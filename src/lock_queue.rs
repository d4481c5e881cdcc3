// Copyright (c) 2024-present, blockbase-db
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! A cooperative, single-holder, FIFO lock queue (component A).
//!
//! `acquire` suspends the caller until all prior acquirers have released;
//! `release` hands the lock to the next waiter in arrival order. An
//! optional maximum waiter count turns overflow into an immediate
//! [`Error::LockQueueOverflow`] instead of suspending forever. There is
//! no reentrancy: a task that already holds the guard must not acquire
//! it again.

use crate::error::{Error, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Semaphore, SemaphorePermit};

/// A cooperative mutex with bounded waiter count.
///
/// Implemented on top of a binary [`Semaphore`], which already queues
/// acquirers in FIFO order; this type only adds the waiter-count bound
/// and a guard type that releases on drop.
pub struct LockQueue {
    sem: Semaphore,
    max_waiters: Option<usize>,
    waiters: AtomicUsize,
}

impl LockQueue {
    /// Creates an unbounded lock queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sem: Semaphore::new(1),
            max_waiters: None,
            waiters: AtomicUsize::new(0),
        }
    }

    /// Creates a lock queue that fails `acquire` with
    /// [`Error::LockQueueOverflow`] once more than `max_waiters` callers
    /// are suspended waiting for the lock.
    #[must_use]
    pub fn with_max_waiters(max_waiters: usize) -> Self {
        Self {
            sem: Semaphore::new(1),
            max_waiters: Some(max_waiters),
            waiters: AtomicUsize::new(0),
        }
    }

    /// Suspends the caller until the lock is free, then holds it until
    /// the returned guard is dropped.
    pub async fn acquire(&self) -> Result<LockGuard<'_>> {
        if let Some(max) = self.max_waiters {
            let prev = self.waiters.fetch_add(1, Ordering::SeqCst);
            if prev >= max {
                self.waiters.fetch_sub(1, Ordering::SeqCst);
                return Err(Error::LockQueueOverflow);
            }
        }

        // `acquire` on a closed semaphore only happens if we close it
        // ourselves, which this type never does.
        #[allow(clippy::unwrap_used)]
        let permit = self.sem.acquire().await.unwrap();

        if self.max_waiters.is_some() {
            self.waiters.fetch_sub(1, Ordering::SeqCst);
        }

        Ok(LockGuard { _permit: permit })
    }

    /// Current number of callers suspended in `acquire`.
    #[must_use]
    pub fn waiter_count(&self) -> usize {
        self.waiters.load(Ordering::SeqCst)
    }
}

impl Default for LockQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard; releases the lock queue when dropped.
pub struct LockGuard<'a> {
    _permit: SemaphorePermit<'a>,
}

/// A map of named lock queues, used by the directory manager to hold one
/// mutex per table name without pre-registering every table up front.
pub struct NamedLockQueues {
    queues: tokio::sync::Mutex<rustc_hash::FxHashMap<String, Arc<LockQueue>>>,
}

impl NamedLockQueues {
    #[must_use]
    pub fn new() -> Self {
        Self {
            queues: tokio::sync::Mutex::new(rustc_hash::FxHashMap::default()),
        }
    }

    /// Returns the queue for `name`, creating it if this is the first
    /// reference. Cheap: the registry itself is only held for the
    /// duration of the lookup/insert, not across the caller's critical
    /// section.
    pub async fn get(&self, name: &str) -> Arc<LockQueue> {
        let mut queues = self.queues.lock().await;
        if let Some(q) = queues.get(name) {
            return q.clone();
        }
        let q = Arc::new(LockQueue::new());
        queues.insert(name.to_string(), q.clone());
        q
    }

    /// Drops the queue for `name` from the registry. Safe to call even
    /// while other holders of the `Arc` are still using it; they simply
    /// keep the queue alive until they finish.
    pub async fn remove(&self, name: &str) {
        self.queues.lock().await.remove(name);
    }
}

impl Default for NamedLockQueues {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    #[tokio::test]
    async fn fifo_single_holder() {
        let q = Arc::new(LockQueue::new());
        let order = Arc::new(tokio::sync::Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..5 {
            let q = q.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let _guard = q.acquire().await.unwrap();
                tokio::time::sleep(Duration::from_millis(5)).await;
                order.lock().await.push(i);
            }));
        }

        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(order.lock().await.len(), 5);
    }

    #[tokio::test]
    async fn overflow_fails_fast() {
        let q = Arc::new(LockQueue::with_max_waiters(1));
        let _held = q.acquire().await.unwrap();

        let q2 = q.clone();
        let waiter = tokio::spawn(async move {
            let _g = q2.acquire().await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = q.acquire().await.unwrap_err();
        assert!(matches!(err, Error::LockQueueOverflow));

        drop(_held);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn named_queues_are_reused() {
        let reg = NamedLockQueues::new();
        let a = reg.get("t1").await;
        let b = reg.get("t1").await;
        let counter = Arc::new(AtomicU32::new(0));

        let c1 = counter.clone();
        let a2 = a.clone();
        tokio::spawn(async move {
            let _g = a2.acquire().await.unwrap();
            c1.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();

        assert!(Arc::ptr_eq(&a, &b));
    }
}
