use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use telegrid_core::{Backoff, StatusUpdate, StreamKey, TelemetryEvent};
use telegrid_hub::BroadcastRegistry;
use telegrid_logging::metrics;
use telegrid_store::{MetadataRepo, StorageWriterHandle};

use crate::decode::{decode, InboundKind};
use crate::transport::{PubSubTransport, TransportMessage};

/// Bridge behavior knobs. The attempt bound exists for tests; production
/// wiring leaves it `None` because ingestion must self-heal indefinitely.
#[derive(Clone, Debug)]
pub struct BridgeConfig {
    pub topic_prefix: String,
    pub backoff: Backoff,
    pub max_connect_attempts: Option<u32>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            topic_prefix: "sensors".to_string(),
            backoff: Backoff::ingestion(),
            max_connect_attempts: None,
        }
    }
}

/// Ingestion-side tallies, shared with tests and the stats endpoint.
#[derive(Debug, Default)]
pub struct BridgeCounters {
    pub published: AtomicU64,
    pub malformed: AtomicU64,
    pub unknown_stream: AtomicU64,
    pub status_updates: AtomicU64,
    pub reconnects: AtomicU64,
}

/// Connection lifecycle of the bridge. It only ever moves forward through
/// `Connecting -> Connected` and loops back through `Reconnecting`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BridgeState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Pulls raw messages off the transport, normalizes them, assigns per-stream
/// sequence numbers, and feeds the registry plus the storage writer.
pub struct IngestionBridge<T: PubSubTransport> {
    transport: T,
    registry: Arc<BroadcastRegistry>,
    metadata: Arc<MetadataRepo>,
    writer: Option<StorageWriterHandle>,
    config: BridgeConfig,
    sequences: HashMap<StreamKey, u64>,
    counters: Arc<BridgeCounters>,
    state: BridgeState,
}

impl<T: PubSubTransport> IngestionBridge<T> {
    pub fn new(
        transport: T,
        registry: Arc<BroadcastRegistry>,
        metadata: Arc<MetadataRepo>,
        writer: Option<StorageWriterHandle>,
        config: BridgeConfig,
    ) -> Self {
        Self {
            transport,
            registry,
            metadata,
            writer,
            config,
            sequences: HashMap::new(),
            counters: Arc::new(BridgeCounters::default()),
            state: BridgeState::Disconnected,
        }
    }

    pub fn counters(&self) -> Arc<BridgeCounters> {
        self.counters.clone()
    }

    fn topic_filters(&self) -> Vec<String> {
        vec![
            format!("{}/+/+/data", self.config.topic_prefix),
            "gateways/+/status".to_string(),
        ]
    }

    fn set_state(&mut self, state: BridgeState) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "bridge state change");
            self.state = state;
        }
    }

    /// Run until cancelled. Transport loss never escapes this loop: every
    /// failure path funnels into backoff + reconnect.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let topics = self.topic_filters();
        let mut attempt: u32 = 0;

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            self.set_state(BridgeState::Connecting);
            match self.transport.connect(&topics).await {
                Ok(mut messages) => {
                    self.set_state(BridgeState::Connected);
                    attempt = 0;
                    info!(transport = self.transport.name(), "ingestion connected");

                    loop {
                        tokio::select! {
                            () = shutdown.cancelled() => {
                                self.set_state(BridgeState::Disconnected);
                                return;
                            }
                            next = messages.next() => match next {
                                Some(Ok(message)) => self.handle_message(message),
                                Some(Err(e)) => {
                                    warn!(error = %e, "transport error, reconnecting");
                                    break;
                                }
                                None => {
                                    warn!("transport stream ended, reconnecting");
                                    break;
                                }
                            }
                        }
                    }
                    self.set_state(BridgeState::Reconnecting);
                }
                Err(e) => {
                    warn!(error = %e, attempt, "transport connect failed");
                    self.set_state(BridgeState::Reconnecting);
                }
            }

            self.counters.reconnects.fetch_add(1, Ordering::Relaxed);
            attempt = attempt.saturating_add(1);
            if let Some(max) = self.config.max_connect_attempts {
                if attempt >= max {
                    warn!(attempt, "bridge attempt bound reached, stopping");
                    break;
                }
            }

            let delay = self.config.backoff.delay(attempt - 1);
            debug!(delay_ms = delay.as_millis() as u64, attempt, "backing off");
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }
        self.set_state(BridgeState::Disconnected);
    }

    fn handle_message(&mut self, message: TransportMessage) {
        metrics::counter_inc("ingest.messages.total", &[], 1);

        match decode(&message.topic, &message.payload, &self.config.topic_prefix) {
            Ok(InboundKind::Telemetry { gateway_id, sensor_id, reading }) => {
                let key = match self.metadata.resolve_stream_key(&gateway_id, &sensor_id) {
                    Ok(key) => key,
                    Err(_) => {
                        self.counters.unknown_stream.fetch_add(1, Ordering::Relaxed);
                        metrics::counter_inc("ingest.unknown_stream.total", &[], 1);
                        debug!(gateway_id, sensor_id, "reading from unknown sensor dropped");
                        return;
                    }
                };

                let sequence = self.next_sequence(&key);
                let event = TelemetryEvent::new(
                    key,
                    reading.timestamp,
                    reading.value,
                    reading.quality,
                    sequence,
                );
                self.registry.publish(&event);
                self.counters.published.fetch_add(1, Ordering::Relaxed);

                // Fire-and-forget persistence; drops are counted inside.
                if let Some(writer) = &self.writer {
                    writer.persist(event);
                }
            }
            Ok(InboundKind::GatewayStatus { gateway_id, status }) => {
                self.counters.status_updates.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = self.metadata.record_gateway_status(&gateway_id, &status) {
                    warn!(error = %e, gateway_id, "failed to record gateway status");
                }
                match self.metadata.streams_for_gateway(&gateway_id) {
                    Ok(keys) => {
                        let observed_at = Utc::now();
                        for stream_key in keys {
                            self.registry.publish_status(&StatusUpdate {
                                stream_key,
                                status: status.clone(),
                                observed_at,
                            });
                        }
                    }
                    Err(e) => warn!(error = %e, gateway_id, "gateway stream lookup failed"),
                }
            }
            Err(e) => {
                self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                metrics::counter_inc("ingest.malformed.total", &[], 1);
                warn!(topic = %message.topic, error = %e, "dropping malformed message");
            }
        }
    }

    fn next_sequence(&mut self, key: &StreamKey) -> u64 {
        let counter = self.sequences.entry(key.clone()).or_insert(0);
        *counter += 1;
        *counter
    }
}
