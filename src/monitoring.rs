// Copyright (c) 2024-present, blockbase-db
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The in-memory monitoring table (§4.H): every call the directory
//! manager dispatches to a table is recorded here as one row
//! `(id, method, truncatedEncodedQuery, error, timeBegin, timeEnd)`, and
//! a background sweep periodically evicts rows older than
//! `interval_minutes`.

use crate::config::MonitoringOptions;
use crate::predicate::Query;
use crate::table::memory::MemoryTable;
use crate::table::{InsertOptions, Record, Table};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;

/// Records table calls into an in-memory table and sweeps them away
/// after `interval_minutes`.
pub struct Monitoring {
    table: MemoryTable,
    opts: MonitoringOptions,
    sweeper: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Monitoring {
    /// Builds the monitoring table and, if enabled, spawns the
    /// background sweep task. The returned `Arc` is kept alive by the
    /// directory manager for as long as the database stays open.
    #[must_use]
    pub fn start(opts: MonitoringOptions) -> Arc<Self> {
        let monitoring = Arc::new(Self {
            table: MemoryTable::new(),
            sweeper: std::sync::Mutex::new(None),
            opts,
        });

        if monitoring.opts.enable {
            let weak = Arc::downgrade(&monitoring);
            let interval = Duration::from_secs(monitoring.opts.interval_minutes.max(1) * 60);
            let handle = tokio::spawn(async move {
                loop {
                    tokio::time::sleep(interval).await;
                    let Some(monitoring) = weak.upgrade() else {
                        return;
                    };
                    if let Err(e) = monitoring.sweep().await {
                        log::warn!("monitoring sweep failed: {e}");
                    }
                }
            });
            *monitoring.sweeper.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(handle);
        }

        monitoring
    }

    /// Records one completed call: `method` is the table operation name
    /// (`"select"`, `"insert"`, …), `time_begin`/`time_end` are
    /// microseconds since the epoch bracketing the call, and `error` is
    /// `None` on success.
    pub async fn record(&self, table: &str, method: &str, query: Option<&Query>, time_begin: u64, time_end: u64, error: Option<&str>) {
        if !self.opts.enable {
            return;
        }

        let query_desc = query.map(|q| crate::predicate::describe_query(q, self.opts.max_query_length)).unwrap_or_default();
        let row = json!({
            "table": table,
            "method": method,
            "truncatedEncodedQuery": query_desc,
            "error": error.unwrap_or(""),
            "timeBegin": time_begin,
            "timeEnd": time_end,
        });

        if let Err(e) = self.table.insert(row, InsertOptions::default()).await {
            log::warn!("failed to record monitoring call: {e}");
        }
    }

    /// Snapshot of every recorded call still within the retention
    /// window.
    pub async fn rows(&self) -> crate::error::Result<Vec<Record>> {
        self.table.select(&Query::all()).await
    }

    async fn sweep(&self) -> crate::error::Result<()> {
        let cutoff = now_micros().saturating_sub(self.opts.interval_minutes.max(1) * 60 * 1_000_000);
        let query = Query::all().with_where(crate::predicate::Where::lambda(move |r: &Record| {
            r.data.get("timeEnd").and_then(serde_json::Value::as_u64).is_some_and(|ts| ts < cutoff)
        }));
        let deleted = self.table.delete(&query).await?.count;
        if deleted > 0 {
            log::debug!("monitoring sweep evicted {deleted} rows");
        }
        Ok(())
    }
}

impl Drop for Monitoring {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.lock().unwrap_or_else(std::sync::PoisonError::into_inner).take() {
            handle.abort();
        }
    }
}

/// Microseconds since the epoch, used for monitoring's `timeBegin`/
/// `timeEnd` so fast calls still show `timeEnd > timeBegin`.
pub(crate) fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> MonitoringOptions {
        MonitoringOptions {
            enable: true,
            interval_minutes: 60,
            ..MonitoringOptions::default()
        }
    }

    #[tokio::test]
    async fn records_calls_when_enabled() {
        let monitoring = Monitoring::start(opts());
        monitoring.record("users", "select", Some(&Query::all()), 1, 5, None).await;
        let rows = monitoring.rows().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].data["table"], json!("users"));
        assert_eq!(rows[0].data["method"], json!("select"));
        assert_eq!(rows[0].data["error"], json!(""));
        assert_eq!(rows[0].data["timeBegin"], json!(1));
        assert_eq!(rows[0].data["timeEnd"], json!(5));
    }

    #[tokio::test]
    async fn disabled_monitoring_records_nothing() {
        let monitoring = Monitoring::start(MonitoringOptions::default());
        monitoring.record("users", "select", None, 1, 2, None).await;
        assert!(monitoring.rows().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sweep_evicts_rows_past_retention() {
        let monitoring = Monitoring::start(MonitoringOptions { interval_minutes: 60, ..opts() });
        monitoring.table.insert(json!({"timeBegin": 0_u64, "timeEnd": 0_u64}), InsertOptions::default()).await.unwrap();
        monitoring.sweep().await.unwrap();
        assert!(monitoring.rows().await.unwrap().is_empty());
    }
}
