//! SQLite retention store implementation.

use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Transaction};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use super::models::*;

const MONITORING_SINCE_KEY: &str = "monitoring_since";

/// Database error types.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("stored document is not valid JSON: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("store worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
    #[error("store connection lock poisoned")]
    Poisoned,
}

/// One write primitive. A push is applied as a slice of these inside a
/// single transaction.
#[derive(Debug, Clone)]
pub enum WriteOp {
    /// Overwrite the machine's current slot, visible until `expires_at`.
    SetCurrent { snapshot: Snapshot, expires_at: i64 },
    /// Add the machine to the registry. No-op if already known.
    RegisterMachine { machine_id: String },
    /// Increment the machine's push counter; when the new count is a
    /// multiple of `every`, prepend the snapshot to history and trim it
    /// to `max_len`.
    CountAndSample {
        snapshot: Snapshot,
        every: i64,
        max_len: usize,
    },
    /// Prepend to the shared alert log.
    PushAlert { alert: AlertEvent },
    TrimAlerts { max_len: usize },
    /// Set the monitoring-since marker only if it has never been set.
    MarkMonitoringSince { value: String },
}

/// What a batch did, for logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub push_count: Option<i64>,
    pub sampled: bool,
}

/// Thread-safe retention store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open(path)?)
    }

    /// Create a store that lives only as long as the process.
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Initialize the database with migrations.
    fn init(&self) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| StoreError::Migration(format!("Migration 1 failed: {}", e)))?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Run raw SQL against the store, for tests that need a damaged schema.
    #[cfg(test)]
    pub(crate) fn execute_batch(&self, sql: &str) -> Result<(), StoreError> {
        self.conn()?.execute_batch(sql)?;
        Ok(())
    }

    // --- Writes ---

    /// Apply a batch of write primitives atomically.
    pub fn apply(&self, ops: &[WriteOp]) -> Result<BatchOutcome, StoreError> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        let mut outcome = BatchOutcome::default();

        for op in ops {
            match op {
                WriteOp::SetCurrent { snapshot, expires_at } => {
                    tx.execute(
                        "INSERT INTO current_snapshots (machine_id, payload, expires_at) VALUES (?1, ?2, ?3)
                         ON CONFLICT(machine_id) DO UPDATE SET
                         payload=excluded.payload, expires_at=excluded.expires_at",
                        params![snapshot.machine_id(), serde_json::to_string(snapshot)?, expires_at],
                    )?;
                }
                WriteOp::RegisterMachine { machine_id } => {
                    tx.execute(
                        "INSERT OR IGNORE INTO machines (machine_id) VALUES (?1)",
                        params![machine_id],
                    )?;
                }
                WriteOp::CountAndSample {
                    snapshot,
                    every,
                    max_len,
                } => {
                    let count = increment_push_count(&tx, snapshot.machine_id())?;
                    outcome.push_count = Some(count);
                    if *every > 0 && count % every == 0 {
                        prepend_history(&tx, snapshot, *max_len)?;
                        outcome.sampled = true;
                    }
                }
                WriteOp::PushAlert { alert } => {
                    tx.execute(
                        "INSERT INTO alerts (machine_id, payload) VALUES (?1, ?2)",
                        params![alert.machine_id().unwrap_or(DEFAULT_MACHINE_ID), serde_json::to_string(alert)?],
                    )?;
                }
                WriteOp::TrimAlerts { max_len } => {
                    tx.execute(
                        "DELETE FROM alerts WHERE id NOT IN
                         (SELECT id FROM alerts ORDER BY id DESC LIMIT ?1)",
                        params![*max_len as i64],
                    )?;
                }
                WriteOp::MarkMonitoringSince { value } => {
                    tx.execute(
                        "INSERT OR IGNORE INTO meta (key, value) VALUES (?1, ?2)",
                        params![MONITORING_SINCE_KEY, value],
                    )?;
                }
            }
        }

        tx.commit()?;
        Ok(outcome)
    }

    /// Delete current slots whose TTL has elapsed. Returns rows removed.
    pub fn purge_expired_current(&self, now: i64) -> Result<usize, StoreError> {
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM current_snapshots WHERE expires_at <= ?1",
            params![now],
        )?;
        Ok(removed)
    }

    // --- Reads ---

    /// All machine identifiers ever seen.
    pub fn get_machines(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT machine_id FROM machines ORDER BY machine_id")?;
        let machines = stmt
            .query_map([], |row| row.get(0))?
            .collect::<SqlResult<Vec<String>>>()?;
        Ok(machines)
    }

    /// The machine's current snapshot, unless it has expired by `now`.
    pub fn get_current(&self, machine_id: &str, now: i64) -> Result<Option<Snapshot>, StoreError> {
        let conn = self.conn()?;
        let payload: Option<String> = conn
            .query_row(
                "SELECT payload FROM current_snapshots WHERE machine_id = ?1 AND expires_at > ?2",
                params![machine_id, now],
                |row| row.get(0),
            )
            .optional()?;

        payload
            .map(|p| serde_json::from_str(&p))
            .transpose()
            .map_err(StoreError::from)
    }

    /// Sampled history for a machine, newest first.
    pub fn get_history(&self, machine_id: &str, limit: usize) -> Result<Vec<Snapshot>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT payload FROM history WHERE machine_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![machine_id, limit as i64], |row| row.get(0))?
            .collect::<SqlResult<Vec<String>>>()?;
        decode_all(rows)
    }

    /// The shared alert log, newest first.
    pub fn get_alerts(&self, limit: usize) -> Result<Vec<AlertEvent>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT payload FROM alerts ORDER BY id DESC LIMIT ?1")?;
        let rows = stmt
            .query_map(params![limit as i64], |row| row.get(0))?
            .collect::<SqlResult<Vec<String>>>()?;
        decode_all(rows)
    }

    pub fn get_monitoring_since(&self) -> Result<Option<String>, StoreError> {
        let conn = self.conn()?;
        let value = conn
            .query_row(
                "SELECT value FROM meta WHERE key = ?1",
                params![MONITORING_SINCE_KEY],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    // --- Status Page Stats ---

    /// Get database size in bytes.
    pub fn get_db_size_bytes(&self) -> Result<i64, StoreError> {
        let conn = self.conn()?;
        let page_count: i64 = conn.query_row("PRAGMA page_count", [], |r| r.get(0))?;
        let page_size: i64 = conn.query_row("PRAGMA page_size", [], |r| r.get(0))?;
        Ok(page_count * page_size)
    }

    /// Get page count.
    pub fn get_page_count(&self) -> Result<i64, StoreError> {
        let conn = self.conn()?;
        Ok(conn.query_row("PRAGMA page_count", [], |r| r.get(0))?)
    }

    /// Get freelist count.
    pub fn get_freelist_count(&self) -> Result<i64, StoreError> {
        let conn = self.conn()?;
        Ok(conn.query_row("PRAGMA freelist_count", [], |r| r.get(0))?)
    }

    pub fn get_alert_count(&self) -> Result<i64, StoreError> {
        let conn = self.conn()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM alerts", [], |r| r.get(0))?)
    }

    /// Push counts and history depth for every registered machine.
    pub fn get_machine_stats(&self) -> Result<Vec<MachineStat>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT m.machine_id,
                    COALESCE(pc.count, 0),
                    (SELECT COUNT(*) FROM history h WHERE h.machine_id = m.machine_id)
             FROM machines m
             LEFT JOIN push_counters pc ON pc.machine_id = m.machine_id
             ORDER BY m.machine_id",
        )?;

        let stats = stmt
            .query_map([], |row| {
                Ok(MachineStat {
                    machine_id: row.get(0)?,
                    push_count: row.get(1)?,
                    history_len: row.get(2)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(stats)
    }
}

fn increment_push_count(tx: &Transaction<'_>, machine_id: &str) -> Result<i64, StoreError> {
    let count = tx.query_row(
        "INSERT INTO push_counters (machine_id, count) VALUES (?1, 1)
         ON CONFLICT(machine_id) DO UPDATE SET count = count + 1
         RETURNING count",
        params![machine_id],
        |row| row.get(0),
    )?;
    Ok(count)
}

fn prepend_history(tx: &Transaction<'_>, snapshot: &Snapshot, max_len: usize) -> Result<(), StoreError> {
    let machine_id = snapshot.machine_id();
    tx.execute(
        "INSERT INTO history (machine_id, payload) VALUES (?1, ?2)",
        params![machine_id, serde_json::to_string(snapshot)?],
    )?;
    tx.execute(
        "DELETE FROM history WHERE machine_id = ?1 AND id NOT IN
         (SELECT id FROM history WHERE machine_id = ?1 ORDER BY id DESC LIMIT ?2)",
        params![machine_id, max_len as i64],
    )?;
    Ok(())
}

fn decode_all<T: serde::de::DeserializeOwned>(rows: Vec<String>) -> Result<Vec<T>, StoreError> {
    rows.iter()
        .map(|raw| serde_json::from_str(raw).map_err(StoreError::from))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map, Value};
    use tempfile::NamedTempFile;

    fn snapshot(machine: &str, ts: i64) -> Snapshot {
        let mut doc = Map::new();
        doc.insert("ts".to_string(), json!(ts));
        doc.insert("system".to_string(), json!({"cpu_temp": 40.0}));
        Snapshot::new(doc, machine)
    }

    fn alert(machine: &str, message: &str) -> AlertEvent {
        let mut raw = Map::new();
        raw.insert("message".to_string(), Value::String(message.to_string()));
        AlertEvent::enrich(raw, machine)
    }

    fn push_count(store: &Store, machine_id: &str) -> i64 {
        let conn = store.conn().unwrap();
        conn.query_row(
            "SELECT count FROM push_counters WHERE machine_id = ?1",
            params![machine_id],
            |row| row.get(0),
        )
        .optional()
        .unwrap()
        .unwrap_or(0)
    }

    fn count_and_sample(store: &Store, snap: Snapshot, max_len: usize) -> BatchOutcome {
        store
            .apply(&[WriteOp::CountAndSample {
                snapshot: snap,
                every: 5,
                max_len,
            }])
            .unwrap()
    }

    #[test]
    fn test_store_on_disk() {
        let tmp = NamedTempFile::new().unwrap();
        {
            let store = Store::new(tmp.path()).unwrap();
            store
                .apply(&[WriteOp::RegisterMachine {
                    machine_id: "clawpi".to_string(),
                }])
                .unwrap();
        }

        // Reopening runs the migration again against existing tables.
        let store = Store::new(tmp.path()).unwrap();
        assert_eq!(store.get_machines().unwrap(), vec!["clawpi".to_string()]);
        assert!(store.get_db_size_bytes().unwrap() > 0);
    }

    #[test]
    fn test_sampling_every_fifth_push() {
        let store = Store::open_in_memory().unwrap();

        for ts in 1..=4 {
            let outcome = count_and_sample(&store, snapshot("m1", ts), 288);
            assert!(!outcome.sampled);
        }
        let outcome = count_and_sample(&store, snapshot("m1", 5), 288);
        assert_eq!(outcome.push_count, Some(5));
        assert!(outcome.sampled);

        for ts in 6..=12 {
            count_and_sample(&store, snapshot("m1", ts), 288);
        }

        let history = store.get_history("m1", 288).unwrap();
        let stamps: Vec<_> = history.iter().map(|s| s.ts().unwrap()).collect();
        assert_eq!(stamps, vec![10, 5]);
        assert_eq!(push_count(&store, "m1"), 12);
    }

    #[test]
    fn test_counters_are_per_machine() {
        let store = Store::open_in_memory().unwrap();
        for ts in 1..=3 {
            count_and_sample(&store, snapshot("a", ts), 288);
            count_and_sample(&store, snapshot("b", ts), 288);
        }
        assert_eq!(push_count(&store, "a"), 3);
        assert_eq!(push_count(&store, "b"), 3);
        assert_eq!(push_count(&store, "never"), 0);
    }

    #[test]
    fn test_history_is_bounded_oldest_evicted() {
        let store = Store::open_in_memory().unwrap();
        for ts in 1..=50 {
            count_and_sample(&store, snapshot("m1", ts), 3);
        }

        let history = store.get_history("m1", 288).unwrap();
        let stamps: Vec<_> = history.iter().map(|s| s.ts().unwrap()).collect();
        assert_eq!(stamps, vec![50, 45, 40]);
    }

    #[test]
    fn test_alerts_bounded_newest_first() {
        let store = Store::open_in_memory().unwrap();
        let mut ops: Vec<WriteOp> = (0..60)
            .map(|i| WriteOp::PushAlert {
                alert: alert("m1", &format!("alert {}", i)),
            })
            .collect();
        ops.push(WriteOp::TrimAlerts { max_len: 50 });
        store.apply(&ops).unwrap();

        let alerts = store.get_alerts(100).unwrap();
        assert_eq!(alerts.len(), 50);
        assert_eq!(alerts[0].message(), Some("alert 59"));
        assert_eq!(alerts[49].message(), Some("alert 10"));
        assert_eq!(store.get_alert_count().unwrap(), 50);
    }

    #[test]
    fn test_current_expires() {
        let store = Store::open_in_memory().unwrap();
        store
            .apply(&[WriteOp::SetCurrent {
                snapshot: snapshot("m1", 100),
                expires_at: 400,
            }])
            .unwrap();

        assert_eq!(store.get_current("m1", 399).unwrap().unwrap().ts(), Some(100));
        assert!(store.get_current("m1", 400).unwrap().is_none());

        assert_eq!(store.purge_expired_current(399).unwrap(), 0);
        assert_eq!(store.purge_expired_current(400).unwrap(), 1);
        assert!(store.get_current("m1", 0).unwrap().is_none());
    }

    #[test]
    fn test_current_overwritten() {
        let store = Store::open_in_memory().unwrap();
        for ts in [10, 20] {
            store
                .apply(&[WriteOp::SetCurrent {
                    snapshot: snapshot("m1", ts),
                    expires_at: ts + 300,
                }])
                .unwrap();
        }
        assert_eq!(store.get_current("m1", 20).unwrap().unwrap().ts(), Some(20));
    }

    #[test]
    fn test_monitoring_since_first_write_wins() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.get_monitoring_since().unwrap().is_none());

        for value in ["first", "second"] {
            store
                .apply(&[WriteOp::MarkMonitoringSince {
                    value: value.to_string(),
                }])
                .unwrap();
        }
        assert_eq!(store.get_monitoring_since().unwrap().as_deref(), Some("first"));
    }

    #[test]
    fn test_registry_idempotent() {
        let store = Store::open_in_memory().unwrap();
        for machine in ["b", "a", "b", "b"] {
            store
                .apply(&[WriteOp::RegisterMachine {
                    machine_id: machine.to_string(),
                }])
                .unwrap();
        }
        assert_eq!(store.get_machines().unwrap(), vec!["a".to_string(), "b".to_string()]);

        let stats = store.get_machine_stats().unwrap();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].push_count, 0);
    }
}
