use serde::{Deserialize, Serialize};
use tracing::instrument;

use telegrid_core::{Quality, StreamKey, TelemetryEvent};

use crate::database::Database;
use crate::error::StoreError;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TelemetryRow {
    pub stream_key: StreamKey,
    pub sequence: u64,
    pub value: f64,
    pub quality: Quality,
    pub captured_at: String,
}

/// Append-only history of delivered telemetry. Best-effort: callers go
/// through [`crate::StorageWriter`], which drops rather than blocks.
pub struct TelemetryRepo {
    db: Database,
}

impl TelemetryRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a batch of events in one transaction.
    #[instrument(skip(self, events), fields(count = events.len()))]
    pub fn insert_batch(&self, events: &[TelemetryEvent]) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute_batch("BEGIN")?;
            let result = (|| -> Result<(), StoreError> {
                let mut stmt = conn.prepare_cached(
                    "INSERT INTO telemetry (stream_key, sequence, value, quality, captured_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )?;
                for event in events {
                    stmt.execute(rusqlite::params![
                        event.stream_key.as_str(),
                        event.sequence as i64,
                        event.value,
                        event.quality.as_str(),
                        event.captured_at.to_rfc3339(),
                    ])?;
                }
                Ok(())
            })();
            match result {
                Ok(()) => conn.execute_batch("COMMIT")?,
                Err(_) => conn.execute_batch("ROLLBACK")?,
            }
            result
        })
    }

    /// Most recent rows for one stream, newest first.
    #[instrument(skip(self), fields(stream_key = %key))]
    pub fn recent(&self, key: &StreamKey, limit: u32) -> Result<Vec<TelemetryRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT stream_key, sequence, value, quality, captured_at FROM telemetry
                 WHERE stream_key = ?1 ORDER BY sequence DESC LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(rusqlite::params![key.as_str(), limit], |row| {
                    let quality: String = row.get(3)?;
                    Ok(TelemetryRow {
                        stream_key: StreamKey::from_raw(row.get::<_, String>(0)?),
                        sequence: row.get::<_, i64>(1)? as u64,
                        value: row.get(2)?,
                        quality: Quality::from_wire(Some(&quality)),
                        captured_at: row.get(4)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn count(&self, key: &StreamKey) -> Result<u64, StoreError> {
        self.db.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM telemetry WHERE stream_key = ?1",
                [key.as_str()],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
    }
}
