//! Best-effort counter recording with a durable trail.
//!
//! Producers hand samples to a bounded queue and never block or fail; a
//! dedicated consumer task tallies in-memory counters and appends each
//! sample to SQLite. When the queue is full the sample is dropped and a
//! process-local drop counter increments (an mpsc queue cannot shed its
//! oldest entry, so the shed policy is drop-newest).

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Queue depth between producers and the consumer task.
const QUEUE_DEPTH: usize = 1024;

/// One recorded counter change.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub name: String,
    pub delta: u64,
    pub metadata: Option<serde_json::Value>,
    pub timestamp: String,
}

/// Cheap clone-able producer side. `record` never blocks and never
/// surfaces an error to the caller.
#[derive(Clone)]
pub struct TelemetryHandle {
    tx: mpsc::Sender<TelemetrySample>,
    counters: Arc<RwLock<HashMap<String, u64>>>,
    dropped: Arc<AtomicU64>,
}

impl TelemetryHandle {
    pub fn record(&self, name: &str, delta: u64, metadata: Option<serde_json::Value>) {
        let sample = TelemetrySample {
            name: name.to_string(),
            delta,
            metadata,
            timestamp: Utc::now().to_rfc3339(),
        };
        if self.tx.try_send(sample).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(counter = name, "telemetry queue full, sample dropped");
        }
    }

    /// Current tallied value of a counter. Samples still in the queue are
    /// not yet reflected here.
    pub fn counter_get(&self, name: &str) -> u64 {
        self.counters.read().get(name).copied().unwrap_or(0)
    }

    /// How many samples were shed because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

pub struct TelemetryRecorder;

impl TelemetryRecorder {
    /// Open the sample database and start the consumer task.
    ///
    /// The task exits once every `TelemetryHandle` clone has been dropped
    /// and the queue has drained.
    pub fn spawn(db_path: &Path) -> Result<(TelemetryHandle, JoinHandle<()>), rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(db_path)?;
        Self::spawn_with(conn, QUEUE_DEPTH)
    }

    /// In-memory variant for tests. Samples are tallied but the durable
    /// trail does not outlive the process.
    pub fn spawn_in_memory() -> Result<(TelemetryHandle, JoinHandle<()>), rusqlite::Error> {
        Self::spawn_with(Connection::open_in_memory()?, QUEUE_DEPTH)
    }

    fn spawn_with(
        conn: Connection,
        depth: usize,
    ) -> Result<(TelemetryHandle, JoinHandle<()>), rusqlite::Error> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;
             CREATE TABLE IF NOT EXISTS telemetry_samples (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 timestamp TEXT NOT NULL,
                 name TEXT NOT NULL,
                 delta INTEGER NOT NULL,
                 metadata TEXT
             );
             CREATE INDEX IF NOT EXISTS idx_telemetry_name ON telemetry_samples(name, timestamp);",
        )?;

        let (tx, mut rx) = mpsc::channel::<TelemetrySample>(depth);
        let counters: Arc<RwLock<HashMap<String, u64>>> = Arc::new(RwLock::new(HashMap::new()));

        let consumer_counters = counters.clone();
        let join = tokio::spawn(async move {
            while let Some(sample) = rx.recv().await {
                {
                    let mut map = consumer_counters.write();
                    *map.entry(sample.name.clone()).or_insert(0) += sample.delta;
                }
                let metadata_json = sample
                    .metadata
                    .as_ref()
                    .and_then(|m| serde_json::to_string(m).ok());
                let result = conn.execute(
                    "INSERT INTO telemetry_samples (timestamp, name, delta, metadata)
                     VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![sample.timestamp, sample.name, sample.delta, metadata_json],
                );
                if let Err(e) = result {
                    tracing::warn!(counter = %sample.name, "telemetry write failed: {e}");
                }
            }
        });

        let handle = TelemetryHandle {
            tx,
            counters,
            dropped: Arc::new(AtomicU64::new(0)),
        };
        Ok((handle, join))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn wait_for(handle: &TelemetryHandle, name: &str, expected: u64) {
        for _ in 0..200 {
            if handle.counter_get(name) == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "counter {name} never reached {expected}, got {}",
            handle.counter_get(name)
        );
    }

    #[tokio::test]
    async fn samples_tally_into_counters() {
        let (handle, _join) = TelemetryRecorder::spawn_in_memory().unwrap();
        handle.record("messages.in", 1, None);
        handle.record("messages.in", 1, None);
        handle.record("workers.spawned", 3, None);

        wait_for(&handle, "messages.in", 2).await;
        wait_for(&handle, "workers.spawned", 3).await;
        assert_eq!(handle.counter_get("never.recorded"), 0);
    }

    #[tokio::test]
    async fn record_with_metadata_does_not_error() {
        let (handle, _join) = TelemetryRecorder::spawn_in_memory().unwrap();
        handle.record(
            "workers.crashed",
            1,
            Some(serde_json::json!({ "connection": "conn_a" })),
        );
        wait_for(&handle, "workers.crashed", 1).await;
    }

    #[tokio::test]
    async fn overflow_drops_newest_and_counts() {
        // Depth 2 with no consumer draining fast enough: park the consumer
        // by never yielding to it before the queue fills.
        let conn = Connection::open_in_memory().unwrap();
        let (handle, _join) = TelemetryRecorder::spawn_with(conn, 2).unwrap();

        handle.record("a", 1, None);
        handle.record("a", 1, None);
        handle.record("a", 1, None);
        handle.record("a", 1, None);

        // At least the overflow beyond the queue depth was shed.
        assert!(handle.dropped() >= 2);
    }

    #[tokio::test]
    async fn consumer_exits_when_handles_drop() {
        let (handle, join) = TelemetryRecorder::spawn_in_memory().unwrap();
        handle.record("connections.opened", 1, None);
        drop(handle);
        tokio::time::timeout(Duration::from_secs(1), join)
            .await
            .expect("consumer should exit once senders are gone")
            .unwrap();
    }

    #[tokio::test]
    async fn samples_persist_to_sqlite() {
        let dir =
            std::env::temp_dir().join(format!("lucid-telemetry-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        let db_path = dir.join("telemetry.db");

        let (handle, join) = TelemetryRecorder::spawn(&db_path).unwrap();
        handle.record("responses.out", 1, None);
        handle.record("responses.out", 1, None);
        drop(handle);
        join.await.unwrap();

        let conn = Connection::open(&db_path).unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM telemetry_samples WHERE name = 'responses.out'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 2);

        let _ = std::fs::remove_dir_all(&dir);
    }

    // Two recorders on the same file must both get their writes in
    // rather than erroring on the lock.
    #[tokio::test]
    async fn concurrent_recorders_share_a_file() {
        let dir =
            std::env::temp_dir().join(format!("lucid-telemetry-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        let db_path = dir.join("telemetry.db");

        let (handle_a, join_a) = TelemetryRecorder::spawn(&db_path).unwrap();
        let (handle_b, join_b) = TelemetryRecorder::spawn(&db_path).unwrap();
        handle_a.record("writers.a", 1, None);
        handle_b.record("writers.b", 1, None);
        drop(handle_a);
        drop(handle_b);
        join_a.await.unwrap();
        join_b.await.unwrap();

        let conn = Connection::open(&db_path).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM telemetry_samples", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 2);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
