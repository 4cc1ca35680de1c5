//! Observability for the distribution pipeline: tracing initialization with
//! an optional SQLite sink for warn+ records, and a process-wide metrics
//! recorder with periodic SQLite snapshots.

mod logging;
pub mod metrics;

pub use logging::{LogQuery, LogRecord, SqliteLogLayer, SqliteLogSink};
pub use metrics::{MetricsQuery, MetricsRecorder, MetricsSnapshot};

use std::path::PathBuf;
use std::sync::Arc;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the observability subsystem.
#[derive(Clone, Debug)]
pub struct ObservabilityConfig {
    /// Default log filter. Overridden by the RUST_LOG env var.
    pub log_level: String,
    /// Whether to persist warn+ logs to SQLite.
    pub log_to_sqlite: bool,
    /// Path to the log database.
    pub log_db_path: PathBuf,
    /// Whether metrics recording is enabled.
    pub metrics_enabled: bool,
    /// Path to the metrics database.
    pub metrics_db_path: PathBuf,
    /// How often to snapshot metrics to SQLite (seconds).
    pub metrics_snapshot_interval_secs: u64,
    /// How many days of metric snapshots to retain.
    pub metrics_retention_days: u32,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        let dir = dirs_fallback();
        Self {
            log_level: "info".to_string(),
            log_to_sqlite: true,
            log_db_path: dir.join("logs.db"),
            metrics_enabled: true,
            metrics_db_path: dir.join("metrics.db"),
            metrics_snapshot_interval_secs: 60,
            metrics_retention_days: 7,
        }
    }
}

/// Handle returned by [`init_observability`]; exposes the sink and recorder
/// for querying.
pub struct ObservabilityGuard {
    log_sink: Option<Arc<SqliteLogSink>>,
    metrics_recorder: Option<Arc<MetricsRecorder>>,
}

impl ObservabilityGuard {
    pub fn metrics(&self) -> Option<&MetricsRecorder> {
        self.metrics_recorder.as_deref()
    }

    pub fn logs(&self) -> Option<&SqliteLogSink> {
        self.log_sink.as_deref()
    }
}

/// Initialize logging and metrics. Call once at startup; the metrics
/// recorder is also installed as the process-global accessed through
/// [`metrics::counter_inc`] and friends.
pub fn init_observability(config: ObservabilityConfig) -> ObservabilityGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_target(true)
        .with_filter(env_filter);

    let (sqlite_layer, sqlite_sink) = if config.log_to_sqlite {
        match SqliteLogSink::new(&config.log_db_path) {
            Ok(sink) => {
                let sink = Arc::new(sink);
                (Some(SqliteLogLayer::new(sink.clone())), Some(sink))
            }
            Err(e) => {
                eprintln!("telegrid-logging: failed to open log DB: {e}");
                (None, None)
            }
        }
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(sqlite_layer)
        .init();

    let metrics_recorder = if config.metrics_enabled {
        match MetricsRecorder::new(&config.metrics_db_path) {
            Ok(recorder) => {
                let recorder = Arc::new(recorder);
                metrics::init_global(recorder.clone());
                Some(recorder)
            }
            Err(e) => {
                tracing::warn!("telegrid-logging: failed to open metrics DB: {e}");
                None
            }
        }
    } else {
        None
    };

    ObservabilityGuard {
        log_sink: sqlite_sink,
        metrics_recorder,
    }
}

/// Fallback home dir for default paths.
fn dirs_fallback() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".telegrid")
}
