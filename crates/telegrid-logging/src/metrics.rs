//! Pipeline metrics: in-memory counters and gauges with periodic SQLite
//! snapshots.
//!
//! Hot paths (publish, ingest decode, queue overflow) record through the
//! process-global helpers, which are no-ops until [`init_global`] runs, so
//! library code never threads a recorder handle through every constructor.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

/// A persisted metric value at a point in time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub id: i64,
    pub timestamp: String,
    pub name: String,
    pub value: f64,
    pub labels: Option<String>,
    pub metric_type: String,
}

/// Query parameters for historical snapshots.
#[derive(Clone, Debug, Default)]
pub struct MetricsQuery {
    pub name: Option<String>,
    pub since: Option<String>,
    pub limit: Option<u32>,
}

/// Monotonic counter.
struct Counter {
    value: AtomicU64,
}

impl Counter {
    fn new() -> Self {
        Self { value: AtomicU64::new(0) }
    }
    fn increment(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }
    fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Gauge; stores f64 bits so it can go negative under atomics.
struct Gauge {
    value: AtomicI64,
}

impl Gauge {
    fn new() -> Self {
        Self { value: AtomicI64::new(0.0f64.to_bits() as i64) }
    }
    fn set(&self, v: f64) {
        self.value.store(v.to_bits() as i64, Ordering::Relaxed);
    }
    fn add(&self, delta: f64) {
        loop {
            let current = self.value.load(Ordering::Relaxed);
            let new = (f64::from_bits(current as u64) + delta).to_bits() as i64;
            if self
                .value
                .compare_exchange_weak(current, new, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }
    fn get(&self) -> f64 {
        f64::from_bits(self.value.load(Ordering::Relaxed) as u64)
    }
}

/// Metric key: name + sorted labels, so label order never splits a series.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct MetricKey {
    name: String,
    labels: Vec<(String, String)>,
}

impl MetricKey {
    fn new(name: &str, labels: &[(&str, &str)]) -> Self {
        let mut sorted: Vec<(String, String)> = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));
        Self {
            name: name.to_string(),
            labels: sorted,
        }
    }

    fn labels_json(&self) -> Option<String> {
        if self.labels.is_empty() {
            return None;
        }
        let map: HashMap<&str, &str> = self
            .labels
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        serde_json::to_string(&map).ok()
    }
}

/// Thread-safe metrics recorder backed by SQLite for historical snapshots.
pub struct MetricsRecorder {
    counters: RwLock<HashMap<MetricKey, Counter>>,
    gauges: RwLock<HashMap<MetricKey, Gauge>>,
    db: Mutex<Connection>,
}

impl MetricsRecorder {
    pub fn new(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(db_path)?;
        Self::with_connection(conn)
    }

    /// In-memory recorder for tests.
    pub fn in_memory() -> Result<Self, rusqlite::Error> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, rusqlite::Error> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             CREATE TABLE IF NOT EXISTS metrics_snapshots (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 timestamp TEXT NOT NULL,
                 name TEXT NOT NULL,
                 value REAL NOT NULL,
                 labels TEXT,
                 metric_type TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_metrics_name ON metrics_snapshots(name, timestamp);",
        )?;
        Ok(Self {
            counters: RwLock::new(HashMap::new()),
            gauges: RwLock::new(HashMap::new()),
            db: Mutex::new(conn),
        })
    }

    pub fn counter_inc(&self, name: &str, labels: &[(&str, &str)], n: u64) {
        let key = MetricKey::new(name, labels);
        let counters = self.counters.read();
        if let Some(c) = counters.get(&key) {
            c.increment(n);
            return;
        }
        drop(counters);
        self.counters
            .write()
            .entry(key)
            .or_insert_with(Counter::new)
            .increment(n);
    }

    pub fn gauge_set(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let key = MetricKey::new(name, labels);
        let gauges = self.gauges.read();
        if let Some(g) = gauges.get(&key) {
            g.set(value);
            return;
        }
        drop(gauges);
        self.gauges
            .write()
            .entry(key)
            .or_insert_with(Gauge::new)
            .set(value);
    }

    pub fn gauge_add(&self, name: &str, labels: &[(&str, &str)], delta: f64) {
        let key = MetricKey::new(name, labels);
        let gauges = self.gauges.read();
        if let Some(g) = gauges.get(&key) {
            g.add(delta);
            return;
        }
        drop(gauges);
        self.gauges
            .write()
            .entry(key)
            .or_insert_with(Gauge::new)
            .add(delta);
    }

    pub fn counter_get(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = MetricKey::new(name, labels);
        self.counters.read().get(&key).map_or(0, Counter::get)
    }

    pub fn gauge_get(&self, name: &str, labels: &[(&str, &str)]) -> f64 {
        let key = MetricKey::new(name, labels);
        self.gauges.read().get(&key).map_or(0.0, Gauge::get)
    }

    /// Persist all current values to SQLite; returns the row count written.
    pub fn snapshot(&self) -> Result<usize, rusqlite::Error> {
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock();
        let mut count = 0;

        let counters = self.counters.read();
        for (key, counter) in counters.iter() {
            db.execute(
                "INSERT INTO metrics_snapshots (timestamp, name, value, labels, metric_type)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![now, key.name, counter.get() as f64, key.labels_json(), "counter"],
            )?;
            count += 1;
        }
        drop(counters);

        let gauges = self.gauges.read();
        for (key, gauge) in gauges.iter() {
            db.execute(
                "INSERT INTO metrics_snapshots (timestamp, name, value, labels, metric_type)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![now, key.name, gauge.get(), key.labels_json(), "gauge"],
            )?;
            count += 1;
        }

        Ok(count)
    }

    pub fn query(&self, q: &MetricsQuery) -> Result<Vec<MetricsSnapshot>, rusqlite::Error> {
        let db = self.db.lock();
        let mut sql = String::from(
            "SELECT id, timestamp, name, value, labels, metric_type FROM metrics_snapshots WHERE 1=1",
        );
        let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(name) = &q.name {
            sql.push_str(&format!(" AND name = ?{}", params.len() + 1));
            params.push(Box::new(name.clone()));
        }
        if let Some(since) = &q.since {
            sql.push_str(&format!(" AND timestamp >= ?{}", params.len() + 1));
            params.push(Box::new(since.clone()));
        }

        sql.push_str(" ORDER BY id DESC");
        let limit = q.limit.unwrap_or(100);
        sql.push_str(&format!(" LIMIT {limit}"));

        let param_refs: Vec<&dyn rusqlite::types::ToSql> =
            params.iter().map(|p| p.as_ref()).collect();
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map(param_refs.as_slice(), |row| {
            Ok(MetricsSnapshot {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                name: row.get(2)?,
                value: row.get(3)?,
                labels: row.get(4)?,
                metric_type: row.get(5)?,
            })
        })?;

        rows.collect()
    }

    /// Delete snapshots older than `retention_days`.
    pub fn prune(&self, retention_days: u32) -> Result<usize, rusqlite::Error> {
        let db = self.db.lock();
        let cutoff = Utc::now()
            .checked_sub_signed(chrono::Duration::days(i64::from(retention_days)))
            .unwrap_or_else(Utc::now)
            .to_rfc3339();
        db.execute(
            "DELETE FROM metrics_snapshots WHERE timestamp < ?1",
            rusqlite::params![cutoff],
        )
    }
}

// ── Process-global accessor ─────────────────────────────────────────────────

static GLOBAL: OnceLock<Arc<MetricsRecorder>> = OnceLock::new();

/// Install the global recorder. Later calls are ignored.
pub fn init_global(recorder: Arc<MetricsRecorder>) {
    let _ = GLOBAL.set(recorder);
}

pub fn global() -> Option<&'static MetricsRecorder> {
    GLOBAL.get().map(Arc::as_ref)
}

/// Increment a counter on the global recorder, if installed.
pub fn counter_inc(name: &str, labels: &[(&str, &str)], n: u64) {
    if let Some(recorder) = GLOBAL.get() {
        recorder.counter_inc(name, labels, n);
    }
}

/// Adjust a gauge on the global recorder, if installed.
pub fn gauge_add(name: &str, labels: &[(&str, &str)], delta: f64) {
    if let Some(recorder) = GLOBAL.get() {
        recorder.gauge_add(name, labels, delta);
    }
}

/// Set a gauge on the global recorder, if installed.
pub fn gauge_set(name: &str, labels: &[(&str, &str)], value: f64) {
    if let Some(recorder) = GLOBAL.get() {
        recorder.gauge_set(name, labels, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_accumulates_per_label_set() {
        let recorder = MetricsRecorder::in_memory().unwrap();
        recorder.counter_inc("ingest.messages.total", &[("kind", "data")], 1);
        recorder.counter_inc("ingest.messages.total", &[("kind", "data")], 1);
        recorder.counter_inc("ingest.messages.total", &[("kind", "status")], 1);

        assert_eq!(recorder.counter_get("ingest.messages.total", &[("kind", "data")]), 2);
        assert_eq!(recorder.counter_get("ingest.messages.total", &[("kind", "status")]), 1);
        assert_eq!(recorder.counter_get("ingest.messages.total", &[("kind", "other")]), 0);
    }

    #[test]
    fn gauge_set_and_add() {
        let recorder = MetricsRecorder::in_memory().unwrap();
        recorder.gauge_set("ws.connections.active", &[], 10.0);
        assert_eq!(recorder.gauge_get("ws.connections.active", &[]), 10.0);

        recorder.gauge_add("ws.connections.active", &[], 5.0);
        assert_eq!(recorder.gauge_get("ws.connections.active", &[]), 15.0);

        recorder.gauge_add("ws.connections.active", &[], -7.0);
        assert_eq!(recorder.gauge_get("ws.connections.active", &[]), 8.0);
    }

    #[test]
    fn label_ordering_independent() {
        let recorder = MetricsRecorder::in_memory().unwrap();
        recorder.counter_inc("fanout.delivered", &[("gw", "1"), ("sensor", "t")], 1);
        recorder.counter_inc("fanout.delivered", &[("sensor", "t"), ("gw", "1")], 1);
        assert_eq!(
            recorder.counter_get("fanout.delivered", &[("gw", "1"), ("sensor", "t")]),
            2
        );
    }

    #[test]
    fn snapshot_persists_and_queries() {
        let recorder = MetricsRecorder::in_memory().unwrap();
        recorder.counter_inc("ingest.malformed.total", &[], 3);
        recorder.gauge_set("ws.connections.active", &[], 2.0);

        let written = recorder.snapshot().unwrap();
        assert_eq!(written, 2);

        let results = recorder
            .query(&MetricsQuery {
                name: Some("ingest.malformed.total".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].value, 3.0);
        assert_eq!(results[0].metric_type, "counter");
    }

    #[test]
    fn query_since_filters() {
        let recorder = MetricsRecorder::in_memory().unwrap();
        recorder.counter_inc("x", &[], 1);
        recorder.snapshot().unwrap();

        let results = recorder
            .query(&MetricsQuery {
                since: Some("2099-01-01T00:00:00Z".into()),
                ..Default::default()
            })
            .unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn prune_removes_everything_at_zero_retention() {
        let recorder = MetricsRecorder::in_memory().unwrap();
        recorder.counter_inc("x", &[], 1);
        recorder.snapshot().unwrap();

        let removed = recorder.prune(0).unwrap();
        assert_eq!(removed, 1);
        assert!(recorder.query(&MetricsQuery::default()).unwrap().is_empty());
    }

    #[test]
    fn concurrent_counter_increments() {
        use std::thread;

        let recorder = Arc::new(MetricsRecorder::in_memory().unwrap());
        let mut handles = vec![];
        for _ in 0..8 {
            let r = recorder.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    r.counter_inc("concurrent.test", &[], 1);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(recorder.counter_get("concurrent.test", &[]), 8_000);
    }

    #[test]
    fn global_helpers_are_noops_before_init() {
        // Must not panic when no recorder is installed.
        counter_inc("ingest.messages.total", &[], 1);
        gauge_add("ws.connections.active", &[], 1.0);
        gauge_set("ws.connections.active", &[], 0.0);
    }
}
