/// SQL DDL for the telegrid database.
/// WAL mode + foreign keys enabled at connection time.
pub const SCHEMA_VERSION: u32 = 1;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS gateways (
    gateway_id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    location TEXT,
    last_status TEXT,
    last_seen_at TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sensors (
    stream_key TEXT PRIMARY KEY,
    gateway_id TEXT NOT NULL REFERENCES gateways(gateway_id),
    sensor_id TEXT NOT NULL,
    name TEXT NOT NULL,
    unit TEXT,
    active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS telemetry (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    stream_key TEXT NOT NULL,
    sequence INTEGER NOT NULL,
    value REAL NOT NULL,
    quality TEXT NOT NULL,
    captured_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sensors_gateway ON sensors(gateway_id);
CREATE INDEX IF NOT EXISTS idx_sensors_pair ON sensors(gateway_id, sensor_id);
CREATE INDEX IF NOT EXISTS idx_telemetry_stream ON telemetry(stream_key, captured_at);
CREATE INDEX IF NOT EXISTS idx_telemetry_stream_seq ON telemetry(stream_key, sequence);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;
