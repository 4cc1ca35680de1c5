use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use telegrid_ingest::{BridgeConfig, IngestionBridge, MqttConfig, MqttTransport};
use telegrid_logging::{init_observability, ObservabilityConfig};
use telegrid_settings::{load_settings, load_settings_from_path, Settings};
use telegrid_store::{Database, MetadataRepo, StorageWriter, TelemetryRepo};

#[derive(Parser)]
#[command(name = "telegrid", about = "Real-time sensor telemetry distribution")]
struct Cli {
    /// Path to settings.json (default: ~/.telegrid/settings.json)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the WebSocket server port
    #[arg(long)]
    port: Option<u16>,

    /// Override the MQTT broker host
    #[arg(long)]
    mqtt_host: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut settings = match &cli.config {
        Some(path) => load_settings_from_path(path)?,
        None => load_settings()?,
    };
    if let Some(port) = cli.port {
        settings.server.port = port;
    }
    if let Some(host) = cli.mqtt_host {
        settings.mqtt.host = host;
    }

    let data_dir = data_dir();
    let _observability = init_observability(observability_config(&settings, &data_dir));
    tracing::info!("starting telegrid");

    let db = Database::open(&resolve(&data_dir, &settings.storage.db_path))?;
    let metadata = Arc::new(MetadataRepo::new(db.clone()));
    let (writer, _writer_task) = StorageWriter::spawn(
        TelemetryRepo::new(db),
        settings.storage.writer_queue_capacity,
    );

    let registry = Arc::new(telegrid_hub::BroadcastRegistry::new());

    let transport = MqttTransport::new(MqttConfig {
        host: settings.mqtt.host.clone(),
        port: settings.mqtt.port,
        username: settings.mqtt.username.clone(),
        password: settings.mqtt.password.clone(),
        keepalive: Duration::from_secs(settings.mqtt.keepalive_secs),
        client_id_prefix: settings.mqtt.client_id_prefix.clone(),
    });
    let bridge = IngestionBridge::new(
        transport,
        registry.clone(),
        metadata.clone(),
        Some(writer),
        BridgeConfig {
            topic_prefix: settings.mqtt.topic_prefix.clone(),
            ..Default::default()
        },
    );
    let shutdown = CancellationToken::new();
    let bridge_task = tokio::spawn(bridge.run(shutdown.clone()));

    spawn_metrics_snapshots(
        settings.observability.metrics_snapshot_interval_secs,
        settings.observability.metrics_retention_days,
    );

    let server = telegrid_server::start(
        telegrid_server::ServerConfig {
            host: settings.server.host.clone(),
            port: settings.server.port,
            send_queue_capacity: settings.server.send_queue_capacity,
            heartbeat_interval: Duration::from_secs(settings.server.heartbeat_interval_secs),
        },
        registry,
        metadata,
    )
    .await?;
    tracing::info!(port = server.port, "telegrid ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    shutdown.cancel();
    let _ = bridge_task.await;
    Ok(())
}

fn observability_config(settings: &Settings, data_dir: &Path) -> ObservabilityConfig {
    let obs = &settings.observability;
    ObservabilityConfig {
        log_level: obs.log_level.clone(),
        log_to_sqlite: obs.log_to_sqlite,
        log_db_path: resolve(data_dir, &obs.log_db_path),
        metrics_enabled: obs.metrics_enabled,
        metrics_db_path: resolve(data_dir, &obs.metrics_db_path),
        metrics_snapshot_interval_secs: obs.metrics_snapshot_interval_secs,
        metrics_retention_days: obs.metrics_retention_days,
    }
}

/// Periodically persist and prune metric snapshots.
fn spawn_metrics_snapshots(interval_secs: u64, retention_days: u32) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
        ticker.tick().await; // skip the immediate tick
        loop {
            ticker.tick().await;
            if let Some(recorder) = telegrid_logging::metrics::global() {
                if let Err(e) = recorder.snapshot() {
                    tracing::warn!(error = %e, "metrics snapshot failed");
                }
                if let Err(e) = recorder.prune(retention_days) {
                    tracing::warn!(error = %e, "metrics prune failed");
                }
            }
        }
    });
}

fn data_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".telegrid")
}

fn resolve(data_dir: &Path, path: &str) -> PathBuf {
    let path = Path::new(path);
    if path.is_absolute() {
        path.to_owned()
    } else {
        data_dir.join(path)
    }
}
