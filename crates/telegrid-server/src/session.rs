use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use telegrid_core::{ClientFrame, CloseReason, ServerFrame};
use telegrid_hub::{BroadcastRegistry, ConnectionHandle};
use telegrid_logging::metrics;
use telegrid_store::MetadataRepo;

/// Per-session knobs, taken from server settings at accept time.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Interval advertised in the handshake; clients ping at this cadence.
    pub heartbeat_interval: Duration,
    /// Bounded outbound queue capacity.
    pub queue_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            queue_capacity: 256,
        }
    }
}

impl SessionConfig {
    /// A session is stale after three missed heartbeats.
    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_interval * 3
    }
}

/// Drive one client link from handshake to teardown.
///
/// Two activities run concurrently: a writer task draining the bounded
/// outbound queue in FIFO order, and this task's reader loop applying
/// inbound control frames. Whichever path decides to close (client close,
/// heartbeat expiry, queue overflow) wins once; teardown always deregisters
/// from the registry exactly once before returning.
pub async fn run_session(
    socket: WebSocket,
    registry: Arc<BroadcastRegistry>,
    metadata: Arc<MetadataRepo>,
    config: SessionConfig,
) {
    let (handle, outbound_rx) = ConnectionHandle::new(config.queue_capacity);
    registry.register(handle.clone());
    let connection_id = handle.id().clone();
    info!(connection_id = %connection_id, "client connected");

    let (mut ws_tx, ws_rx) = socket.split();

    let established = ServerFrame::ConnectionEstablished {
        connection_id: connection_id.clone(),
        heartbeat_interval_secs: config.heartbeat_interval.as_secs(),
    };
    if send_frame(&mut ws_tx, &established).await.is_err() {
        registry.remove_connection(&connection_id);
        return;
    }

    let cancel = handle.closed_signal();
    let writer = tokio::spawn(write_outbound(ws_tx, outbound_rx, cancel.clone()));

    read_inbound(ws_rx, &handle, &registry, &metadata, &config).await;

    // Teardown: deregistration is idempotent and `close` inside the handle
    // is once-only, so racing closers are harmless.
    registry.remove_connection(&connection_id);
    let _ = writer.await;

    let reason = handle.close_reason().unwrap_or(CloseReason::ClientClosed);
    info!(connection_id = %connection_id, reason = reason.as_str(), "client disconnected");
}

async fn send_frame(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    frame: &ServerFrame,
) -> Result<(), axum::Error> {
    let json = serde_json::to_string(frame).unwrap_or_default();
    ws_tx.send(Message::Text(json.into())).await
}

/// Writer half: forwards queued frames to the socket until the queue or the
/// connection closes.
async fn write_outbound(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut outbound_rx: tokio::sync::mpsc::Receiver<ServerFrame>,
    cancel: tokio_util::sync::CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            frame = outbound_rx.recv() => match frame {
                Some(frame) => {
                    if send_frame(&mut ws_tx, &frame).await.is_err() {
                        break;
                    }
                }
                None => break,
            }
        }
    }
    let _ = ws_tx.close().await;
}

/// Reader half: applies control frames and enforces the heartbeat deadline.
async fn read_inbound(
    mut ws_rx: SplitStream<WebSocket>,
    handle: &Arc<ConnectionHandle>,
    registry: &BroadcastRegistry,
    metadata: &MetadataRepo,
    config: &SessionConfig,
) {
    let cancel = handle.closed_signal();
    let heartbeat_timeout = config.heartbeat_timeout();
    let mut deadline = Instant::now() + heartbeat_timeout;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep_until(deadline) => {
                warn!(connection_id = %handle.id(), "heartbeat timeout");
                handle.close(CloseReason::HeartbeatTimeout);
                break;
            }
            message = ws_rx.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ClientFrame>(&text) {
                        Ok(ClientFrame::Ping { timestamp }) => {
                            deadline = Instant::now() + heartbeat_timeout;
                            debug!(connection_id = %handle.id(), ?timestamp, "ping");
                            let _ = handle.enqueue(ServerFrame::Pong {
                                timestamp: chrono::Utc::now(),
                            });
                        }
                        Ok(frame) => apply_frame(frame, handle, registry, metadata),
                        Err(e) => {
                            metrics::counter_inc("ws.malformed_frames.total", &[], 1);
                            debug!(connection_id = %handle.id(), error = %e, "malformed client frame");
                            let _ = handle.enqueue(ServerFrame::Error {
                                message: format!("unparseable frame: {e}"),
                            });
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    handle.close(CloseReason::ClientClosed);
                    break;
                }
                Some(Ok(_)) => {} // ws-level ping/pong/binary; axum answers pings itself
                Some(Err(e)) => {
                    debug!(connection_id = %handle.id(), error = %e, "socket error");
                    handle.close(CloseReason::ClientClosed);
                    break;
                }
            }
        }
    }
}

/// Subscribe/unsubscribe/stats handling. Replies go through the same
/// bounded queue as telemetry, so a slow consumer cannot wedge the reader.
fn apply_frame(
    frame: ClientFrame,
    handle: &Arc<ConnectionHandle>,
    registry: &BroadcastRegistry,
    metadata: &MetadataRepo,
) {
    match frame {
        ClientFrame::Subscribe { stream_keys } => {
            let mut accepted = Vec::new();
            let mut rejected = Vec::new();
            for key in stream_keys {
                match metadata.stream_key_known(&key) {
                    Ok(true) if registry.subscribe(handle.id(), &key) => accepted.push(key),
                    _ => rejected.push(key),
                }
            }
            if !rejected.is_empty() {
                metrics::counter_inc("ws.subscribe_rejected.total", &[], rejected.len() as u64);
            }
            debug!(
                connection_id = %handle.id(),
                accepted = accepted.len(),
                rejected = rejected.len(),
                "subscribe"
            );
            let _ = handle.enqueue(ServerFrame::SubscriptionAck {
                stream_keys: accepted,
                rejected,
            });
        }
        ClientFrame::Unsubscribe { stream_keys } => {
            for key in &stream_keys {
                registry.unsubscribe(handle.id(), key);
            }
            // The ack reports the post-state, so a subscribe-then-unsubscribe
            // round trip shows exactly what is still active.
            let mut remaining: Vec<_> = handle.subscriptions().into_iter().collect();
            remaining.sort();
            let _ = handle.enqueue(ServerFrame::SubscriptionAck {
                stream_keys: remaining,
                rejected: Vec::new(),
            });
        }
        ClientFrame::GetStats => {
            let stats = registry.stats();
            let _ = handle.enqueue(ServerFrame::Stats {
                connections: stats.connections,
                streams: stats.streams,
            });
        }
        // Handled inline in the reader loop, where the deadline lives.
        ClientFrame::Ping { .. } => unreachable!("ping handled by reader loop"),
    }
}
