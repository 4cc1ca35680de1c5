use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use telegrid_core::StreamKey;

use crate::database::Database;
use crate::error::StoreError;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GatewayRow {
    pub gateway_id: String,
    pub name: String,
    pub location: Option<String>,
    pub last_status: Option<String>,
    pub last_seen_at: Option<String>,
    pub created_at: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SensorRow {
    pub stream_key: StreamKey,
    pub gateway_id: String,
    pub sensor_id: String,
    pub name: String,
    pub unit: Option<String>,
    pub active: bool,
    pub created_at: String,
}

/// Lookup and registration of known gateways and sensors. The ingestion
/// bridge and the connection sessions consult this to validate stream
/// identities; everything else about metadata CRUD lives outside this core.
pub struct MetadataRepo {
    db: Database,
}

impl MetadataRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Register a gateway, updating the name if it already exists.
    #[instrument(skip(self))]
    pub fn register_gateway(&self, gateway_id: &str, name: &str) -> Result<GatewayRow, StoreError> {
        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO gateways (gateway_id, name, created_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(gateway_id) DO UPDATE SET name = excluded.name",
                rusqlite::params![gateway_id, name, now],
            )?;
            conn.query_row(
                "SELECT gateway_id, name, location, last_status, last_seen_at, created_at
                 FROM gateways WHERE gateway_id = ?1",
                [gateway_id],
                |row| {
                    Ok(GatewayRow {
                        gateway_id: row.get(0)?,
                        name: row.get(1)?,
                        location: row.get(2)?,
                        last_status: row.get(3)?,
                        last_seen_at: row.get(4)?,
                        created_at: row.get(5)?,
                    })
                },
            )
            .map_err(StoreError::from)
        })
    }

    /// Register a sensor under a gateway. The stream key is derived from the
    /// pair and returned for convenience.
    #[instrument(skip(self))]
    pub fn register_sensor(
        &self,
        gateway_id: &str,
        sensor_id: &str,
        name: &str,
        unit: Option<&str>,
    ) -> Result<StreamKey, StoreError> {
        let key = StreamKey::from_parts(gateway_id, sensor_id);
        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO sensors (stream_key, gateway_id, sensor_id, name, unit, active, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6)
                 ON CONFLICT(stream_key) DO UPDATE SET name = excluded.name, unit = excluded.unit",
                rusqlite::params![key.as_str(), gateway_id, sensor_id, name, unit, now],
            )?;
            Ok(())
        })?;
        Ok(key)
    }

    /// Resolve a `(gateway_id, sensor_id)` pair to its stream key, or
    /// `NotFound` if the sensor is unknown or deactivated.
    #[instrument(skip(self))]
    pub fn resolve_stream_key(
        &self,
        gateway_id: &str,
        sensor_id: &str,
    ) -> Result<StreamKey, StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT stream_key FROM sensors
                 WHERE gateway_id = ?1 AND sensor_id = ?2 AND active = 1",
                [gateway_id, sensor_id],
                |row| Ok(StreamKey::from_raw(row.get::<_, String>(0)?)),
            )
            .map_err(|_| StoreError::NotFound(format!("sensor {gateway_id}/{sensor_id}")))
        })
    }

    /// Whether a stream key names a known, active sensor.
    pub fn stream_key_known(&self, key: &StreamKey) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM sensors WHERE stream_key = ?1 AND active = 1",
                [key.as_str()],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
    }

    /// All active stream keys registered under a gateway, for status fan-out.
    #[instrument(skip(self))]
    pub fn streams_for_gateway(&self, gateway_id: &str) -> Result<Vec<StreamKey>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT stream_key FROM sensors
                 WHERE gateway_id = ?1 AND active = 1 ORDER BY sensor_id",
            )?;
            let rows = stmt
                .query_map([gateway_id], |row| {
                    Ok(StreamKey::from_raw(row.get::<_, String>(0)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Record the latest gateway status report.
    pub fn record_gateway_status(&self, gateway_id: &str, status: &str) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "UPDATE gateways SET last_status = ?2, last_seen_at = ?3 WHERE gateway_id = ?1",
                rusqlite::params![gateway_id, status, now],
            )?;
            Ok(())
        })
    }

    /// Deactivate a sensor; resolution then fails for it.
    pub fn deactivate_sensor(&self, key: &StreamKey) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE sensors SET active = 0 WHERE stream_key = ?1",
                [key.as_str()],
            )?;
            Ok(())
        })
    }
}
