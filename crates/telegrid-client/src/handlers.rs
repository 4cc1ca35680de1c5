use std::panic::{catch_unwind, AssertUnwindSafe};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{error, trace};

use telegrid_core::{Quality, ServerFrame, StreamKey};

/// Telemetry delivered to `on_telemetry` handlers.
#[derive(Clone, Debug, PartialEq)]
pub struct TelemetryMessage {
    pub stream_key: StreamKey,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    pub quality: Quality,
    pub sequence: u64,
}

/// Status change delivered to `on_status` handlers. A `stream_key` of `"*"`
/// means the link itself (e.g. terminal disconnection).
#[derive(Clone, Debug, PartialEq)]
pub struct StatusMessage {
    pub stream_key: StreamKey,
    pub status: String,
}

/// Heartbeat answer delivered to `on_pong` handlers.
#[derive(Clone, Debug, PartialEq)]
pub struct PongMessage {
    pub timestamp: DateTime<Utc>,
}

type Handler<T> = Box<dyn Fn(&T) + Send + Sync>;

/// Ordered handler lists keyed by message type. Dispatch isolates panicking
/// handlers: one failure never stops the remaining handlers or the read
/// loop feeding them.
#[derive(Default)]
pub struct HandlerRegistry {
    telemetry: RwLock<Vec<Handler<TelemetryMessage>>>,
    status: RwLock<Vec<Handler<StatusMessage>>>,
    pong: RwLock<Vec<Handler<PongMessage>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_telemetry(&self, handler: impl Fn(&TelemetryMessage) + Send + Sync + 'static) {
        self.telemetry.write().push(Box::new(handler));
    }

    pub fn on_status(&self, handler: impl Fn(&StatusMessage) + Send + Sync + 'static) {
        self.status.write().push(Box::new(handler));
    }

    pub fn on_pong(&self, handler: impl Fn(&PongMessage) + Send + Sync + 'static) {
        self.pong.write().push(Box::new(handler));
    }

    /// Route one inbound frame to its handler list. Frames without handlers
    /// (acks, stats, errors, the handshake) are session-internal and only
    /// traced here.
    pub fn dispatch(&self, frame: &ServerFrame) {
        match frame {
            ServerFrame::Telemetry { stream_key, value, timestamp, quality, sequence } => {
                let message = TelemetryMessage {
                    stream_key: stream_key.clone(),
                    value: *value,
                    timestamp: *timestamp,
                    quality: *quality,
                    sequence: *sequence,
                };
                Self::run_all(&self.telemetry.read(), &message, "telemetry");
            }
            ServerFrame::Status { stream_key, status } => {
                let message = StatusMessage {
                    stream_key: stream_key.clone(),
                    status: status.clone(),
                };
                Self::run_all(&self.status.read(), &message, "status");
            }
            ServerFrame::Pong { timestamp } => {
                let message = PongMessage { timestamp: *timestamp };
                Self::run_all(&self.pong.read(), &message, "pong");
            }
            other => trace!(frame = other.frame_type(), "frame without handler pathway"),
        }
    }

    fn run_all<T>(handlers: &[Handler<T>], message: &T, kind: &'static str) {
        for (index, handler) in handlers.iter().enumerate() {
            if catch_unwind(AssertUnwindSafe(|| handler(message))).is_err() {
                error!(kind, index, "message handler panicked, continuing");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn telemetry_frame(sequence: u64) -> ServerFrame {
        ServerFrame::Telemetry {
            stream_key: StreamKey::from_parts("gw-01", "temp-07"),
            value: 21.0,
            timestamp: Utc::now(),
            quality: Quality::Good,
            sequence,
        }
    }

    #[test]
    fn handlers_run_in_registration_order() {
        let registry = HandlerRegistry::new();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = order.clone();
            registry.on_telemetry(move |_| order.lock().push(tag));
        }
        registry.dispatch(&telemetry_frame(1));

        assert_eq!(*order.lock(), vec!["first", "second", "third"]);
    }

    #[test]
    fn panicking_handler_does_not_stop_the_rest() {
        let registry = HandlerRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));

        registry.on_telemetry(|_| panic!("handler bug"));
        let counter = calls.clone();
        registry.on_telemetry(move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        });

        registry.dispatch(&telemetry_frame(1));
        registry.dispatch(&telemetry_frame(2));

        assert_eq!(calls.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn dispatch_routes_by_type() {
        let registry = HandlerRegistry::new();
        let telemetry = Arc::new(AtomicUsize::new(0));
        let status = Arc::new(AtomicUsize::new(0));
        let pong = Arc::new(AtomicUsize::new(0));

        let t = telemetry.clone();
        registry.on_telemetry(move |_| {
            t.fetch_add(1, Ordering::Relaxed);
        });
        let s = status.clone();
        registry.on_status(move |m| {
            assert_eq!(m.status, "offline");
            s.fetch_add(1, Ordering::Relaxed);
        });
        let p = pong.clone();
        registry.on_pong(move |_| {
            p.fetch_add(1, Ordering::Relaxed);
        });

        registry.dispatch(&telemetry_frame(1));
        registry.dispatch(&ServerFrame::Status {
            stream_key: StreamKey::from_raw("gw-01/temp-07"),
            status: "offline".into(),
        });
        registry.dispatch(&ServerFrame::Pong { timestamp: Utc::now() });
        // Frames without a handler pathway are ignored.
        registry.dispatch(&ServerFrame::Error { message: "x".into() });

        assert_eq!(telemetry.load(Ordering::Relaxed), 1);
        assert_eq!(status.load(Ordering::Relaxed), 1);
        assert_eq!(pong.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn telemetry_message_carries_full_reading() {
        let registry = HandlerRegistry::new();
        let seen = Arc::new(parking_lot::Mutex::new(None));
        let slot = seen.clone();
        registry.on_telemetry(move |m| {
            *slot.lock() = Some(m.clone());
        });

        registry.dispatch(&telemetry_frame(7));
        let message = seen.lock().clone().unwrap();
        assert_eq!(message.sequence, 7);
        assert_eq!(message.quality, Quality::Good);
        assert_eq!(message.stream_key.as_str(), "gw-01/temp-07");
    }
}
