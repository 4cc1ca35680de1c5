use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::field::{Field, Visit};
use tracing::span;
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// A log record persisted to SQLite.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: i64,
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
    pub fields: Option<String>,
    pub connection_id: Option<String>,
    pub stream_key: Option<String>,
}

/// Query parameters for searching persisted logs.
#[derive(Clone, Debug, Default)]
pub struct LogQuery {
    pub level: Option<String>,
    pub connection_id: Option<String>,
    pub stream_key: Option<String>,
    pub limit: Option<u32>,
}

/// SQLite sink that persists warn+ logs.
pub struct SqliteLogSink {
    conn: Mutex<Connection>,
}

impl SqliteLogSink {
    pub fn new(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             CREATE TABLE IF NOT EXISTS logs (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 timestamp TEXT NOT NULL,
                 level TEXT NOT NULL,
                 target TEXT NOT NULL,
                 message TEXT NOT NULL,
                 fields TEXT,
                 connection_id TEXT,
                 stream_key TEXT
             );
             CREATE INDEX IF NOT EXISTS idx_logs_level ON logs(level);
             CREATE INDEX IF NOT EXISTS idx_logs_connection ON logs(connection_id);
             CREATE INDEX IF NOT EXISTS idx_logs_stream ON logs(stream_key);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn insert(&self, record: &LogInsert) {
        let conn = self.conn.lock();
        let _ = conn.execute(
            "INSERT INTO logs (timestamp, level, target, message, fields, connection_id, stream_key)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                record.timestamp,
                record.level,
                record.target,
                record.message,
                record.fields,
                record.connection_id,
                record.stream_key,
            ],
        );
    }

    pub fn query(&self, q: &LogQuery) -> Result<Vec<LogRecord>, rusqlite::Error> {
        let conn = self.conn.lock();
        let mut sql = String::from(
            "SELECT id, timestamp, level, target, message, fields, connection_id, stream_key \
             FROM logs WHERE 1=1",
        );
        let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(level) = &q.level {
            sql.push_str(&format!(" AND level = ?{}", params.len() + 1));
            params.push(Box::new(level.clone()));
        }
        if let Some(connection_id) = &q.connection_id {
            sql.push_str(&format!(" AND connection_id = ?{}", params.len() + 1));
            params.push(Box::new(connection_id.clone()));
        }
        if let Some(stream_key) = &q.stream_key {
            sql.push_str(&format!(" AND stream_key = ?{}", params.len() + 1));
            params.push(Box::new(stream_key.clone()));
        }

        sql.push_str(" ORDER BY id DESC");
        let limit = q.limit.unwrap_or(100);
        sql.push_str(&format!(" LIMIT {limit}"));

        let param_refs: Vec<&dyn rusqlite::types::ToSql> =
            params.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(param_refs.as_slice(), |row| {
            Ok(LogRecord {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                level: row.get(2)?,
                target: row.get(3)?,
                message: row.get(4)?,
                fields: row.get(5)?,
                connection_id: row.get(6)?,
                stream_key: row.get(7)?,
            })
        })?;

        rows.collect()
    }

    pub fn count(&self) -> Result<i64, rusqlite::Error> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM logs", [], |row| row.get(0))
    }
}

/// Internal insert record.
struct LogInsert {
    timestamp: String,
    level: String,
    target: String,
    message: String,
    fields: Option<String>,
    connection_id: Option<String>,
    stream_key: Option<String>,
}

/// tracing Layer that writes warn+ events to SQLite.
pub struct SqliteLogLayer {
    sink: Arc<SqliteLogSink>,
}

impl SqliteLogLayer {
    pub fn new(sink: Arc<SqliteLogSink>) -> Self {
        Self { sink }
    }
}

/// Visitor that extracts fields from a tracing event, pulling out the
/// pipeline correlation keys.
struct FieldVisitor {
    message: Option<String>,
    fields: serde_json::Map<String, serde_json::Value>,
    connection_id: Option<String>,
    stream_key: Option<String>,
}

impl FieldVisitor {
    fn new() -> Self {
        Self {
            message: None,
            fields: serde_json::Map::new(),
            connection_id: None,
            stream_key: None,
        }
    }
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let val = format!("{:?}", value);
        match field.name() {
            "message" => self.message = Some(val),
            "connection_id" => self.connection_id = Some(val.trim_matches('"').to_string()),
            "stream_key" => self.stream_key = Some(val.trim_matches('"').to_string()),
            name => {
                self.fields
                    .insert(name.to_string(), serde_json::Value::String(val));
            }
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message = Some(value.to_string()),
            "connection_id" => self.connection_id = Some(value.to_string()),
            "stream_key" => self.stream_key = Some(value.to_string()),
            name => {
                self.fields
                    .insert(name.to_string(), serde_json::Value::String(value.to_string()));
            }
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields
            .insert(field.name().to_string(), serde_json::Value::Number(value.into()));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields
            .insert(field.name().to_string(), serde_json::Value::Number(value.into()));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        if let Some(n) = serde_json::Number::from_f64(value) {
            self.fields
                .insert(field.name().to_string(), serde_json::Value::Number(n));
        }
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields
            .insert(field.name().to_string(), serde_json::Value::Bool(value));
    }
}

impl<S> Layer<S> for SqliteLogLayer
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        // Only persist WARN and above
        let level = *event.metadata().level();
        if level > tracing::Level::WARN {
            return;
        }

        let mut visitor = FieldVisitor::new();
        event.record(&mut visitor);

        // Fall back to correlation keys recorded on enclosing spans.
        if visitor.connection_id.is_none() || visitor.stream_key.is_none() {
            if let Some(scope) = ctx.event_scope(event) {
                for span in scope {
                    let extensions = span.extensions();
                    if let Some(fields) = extensions.get::<SpanFields>() {
                        if visitor.connection_id.is_none() {
                            visitor.connection_id.clone_from(&fields.connection_id);
                        }
                        if visitor.stream_key.is_none() {
                            visitor.stream_key.clone_from(&fields.stream_key);
                        }
                    }
                }
            }
        }

        let fields_json = if visitor.fields.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&visitor.fields).unwrap_or_default())
        };

        self.sink.insert(&LogInsert {
            timestamp: Utc::now().to_rfc3339(),
            level: level.to_string().to_uppercase(),
            target: event.metadata().target().to_string(),
            message: visitor.message.unwrap_or_default(),
            fields: fields_json,
            connection_id: visitor.connection_id,
            stream_key: visitor.stream_key,
        });
    }

    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::new();
        attrs.record(&mut visitor);

        if visitor.connection_id.is_some() || visitor.stream_key.is_some() {
            if let Some(span) = ctx.span(id) {
                let mut extensions = span.extensions_mut();
                extensions.insert(SpanFields {
                    connection_id: visitor.connection_id,
                    stream_key: visitor.stream_key,
                });
            }
        }
    }
}

/// Stored on spans to propagate correlation keys to child events.
struct SpanFields {
    connection_id: Option<String>,
    stream_key: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_db() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("telegrid-test-logs-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        dir.join("test-logs.db")
    }

    fn insert_record(sink: &SqliteLogSink, level: &str, message: &str, conn: Option<&str>, key: Option<&str>) {
        sink.insert(&LogInsert {
            timestamp: Utc::now().to_rfc3339(),
            level: level.into(),
            target: "telegrid_server::session".into(),
            message: message.into(),
            fields: None,
            connection_id: conn.map(String::from),
            stream_key: key.map(String::from),
        });
    }

    #[test]
    fn sink_create_and_insert() {
        let sink = SqliteLogSink::new(&temp_db()).unwrap();
        insert_record(&sink, "WARN", "send queue full", Some("conn_123"), None);
        assert_eq!(sink.count().unwrap(), 1);
    }

    #[test]
    fn query_by_level() {
        let sink = SqliteLogSink::new(&temp_db()).unwrap();
        insert_record(&sink, "WARN", "slow consumer", Some("conn_a"), None);
        insert_record(&sink, "ERROR", "broker unreachable", None, None);

        let results = sink
            .query(&LogQuery {
                level: Some("ERROR".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].message, "broker unreachable");
    }

    #[test]
    fn query_by_connection() {
        let sink = SqliteLogSink::new(&temp_db()).unwrap();
        insert_record(&sink, "WARN", "a", Some("conn_a"), None);
        insert_record(&sink, "WARN", "b", Some("conn_b"), None);

        let results = sink
            .query(&LogQuery {
                connection_id: Some("conn_a".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].message, "a");
    }

    #[test]
    fn query_by_stream_key() {
        let sink = SqliteLogSink::new(&temp_db()).unwrap();
        insert_record(&sink, "WARN", "dropped", None, Some("gw-01/temp-07"));
        insert_record(&sink, "WARN", "dropped", None, Some("gw-02/flow-01"));

        let results = sink
            .query(&LogQuery {
                stream_key: Some("gw-01/temp-07".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].stream_key.as_deref(), Some("gw-01/temp-07"));
    }

    #[test]
    fn query_limit_most_recent_first() {
        let sink = SqliteLogSink::new(&temp_db()).unwrap();
        for i in 0..10 {
            insert_record(&sink, "WARN", &format!("msg {i}"), None, None);
        }

        let results = sink
            .query(&LogQuery {
                limit: Some(3),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].message, "msg 9");
    }

    #[test]
    fn log_record_serde_roundtrip() {
        let record = LogRecord {
            id: 1,
            timestamp: "2026-08-01T12:00:00Z".into(),
            level: "WARN".into(),
            target: "telegrid_ingest::bridge".into(),
            message: "malformed payload".into(),
            fields: Some(r#"{"topic":"sensors/gw/t/data"}"#.into()),
            connection_id: None,
            stream_key: Some("gw/t".into()),
        };
        let json = serde_json::to_string(&record).unwrap();
        let parsed: LogRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.level, "WARN");
        assert_eq!(parsed.stream_key.as_deref(), Some("gw/t"));
    }
}
