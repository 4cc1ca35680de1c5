use serde::{Deserialize, Serialize};

/// Top-level settings tree, one section per subsystem.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub server: ServerSettings,
    pub mqtt: MqttSettings,
    pub storage: StorageSettings,
    pub observability: ObservabilitySettings,
}

/// WebSocket server settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// WebSocket/HTTP port.
    pub port: u16,
    /// Bounded per-connection outbound queue capacity.
    pub send_queue_capacity: usize,
    /// Heartbeat interval advertised to clients, in seconds. Sessions close
    /// after 3x this without an inbound ping.
    pub heartbeat_interval_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            send_queue_capacity: 256,
            heartbeat_interval_secs: 30,
        }
    }
}

/// MQTT broker settings for the ingestion bridge.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    pub keepalive_secs: u64,
    /// Prefix of the telemetry topic tree (`{prefix}/{gw}/{sensor}/data`).
    pub topic_prefix: String,
    /// Client id prefix; a uuid suffix is appended per process.
    pub client_id_prefix: String,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            keepalive_secs: 60,
            topic_prefix: "sensors".to_string(),
            client_id_prefix: "telegrid".to_string(),
        }
    }
}

/// Durable storage settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageSettings {
    /// Path to the SQLite database (relative paths resolve under
    /// `~/.telegrid`).
    pub db_path: String,
    /// Bounded queue between the ingestion hot path and the writer task.
    pub writer_queue_capacity: usize,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            db_path: "telegrid.db".to_string(),
            writer_queue_capacity: 1024,
        }
    }
}

/// Logging and metrics settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ObservabilitySettings {
    /// Default log level; `RUST_LOG` still wins when set.
    pub log_level: String,
    /// Persist warn+ logs to SQLite.
    pub log_to_sqlite: bool,
    pub log_db_path: String,
    pub metrics_enabled: bool,
    pub metrics_db_path: String,
    pub metrics_snapshot_interval_secs: u64,
    pub metrics_retention_days: u32,
}

impl Default for ObservabilitySettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_to_sqlite: true,
            log_db_path: "logs.db".to_string(),
            metrics_enabled: true,
            metrics_db_path: "metrics.db".to_string(),
            metrics_snapshot_interval_secs: 60,
            metrics_retention_days: 7,
        }
    }
}
