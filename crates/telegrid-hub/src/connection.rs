use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use telegrid_core::{CloseReason, ConnectionId, DistributionError, ServerFrame, StreamKey};

/// Hub-side handle for one live client link.
///
/// Owns the bounded outbound queue and the connection's view of its
/// subscriptions. The session task that created the handle owns teardown;
/// everyone else (the registry, publishers) may only *request* closure via
/// [`ConnectionHandle::close`], which wins exactly once.
pub struct ConnectionHandle {
    id: ConnectionId,
    created_at: DateTime<Utc>,
    tx: mpsc::Sender<ServerFrame>,
    pub(crate) subscriptions: Mutex<HashSet<StreamKey>>,
    closed: AtomicBool,
    close_reason: Mutex<Option<CloseReason>>,
    cancel: CancellationToken,
}

impl ConnectionHandle {
    /// Create a handle with a bounded outbound queue. The receiver half goes
    /// to the session's writer task.
    pub fn new(queue_capacity: usize) -> (Arc<Self>, mpsc::Receiver<ServerFrame>) {
        let (tx, rx) = mpsc::channel(queue_capacity);
        let handle = Arc::new(Self {
            id: ConnectionId::new(),
            created_at: Utc::now(),
            tx,
            subscriptions: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
            close_reason: Mutex::new(None),
            cancel: CancellationToken::new(),
        });
        (handle, rx)
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Queue a frame without waiting. Overflow closes the connection with
    /// `SlowConsumer`: the producer is never blocked on a slow viewer.
    pub fn enqueue(&self, frame: ServerFrame) -> Result<(), DistributionError> {
        match self.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.close(CloseReason::SlowConsumer);
                Err(DistributionError::SlowConsumer)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(DistributionError::QueueClosed),
        }
    }

    /// Request closure. The first caller's reason sticks; later calls are
    /// no-ops. Returns whether this call performed the close.
    pub fn close(&self, reason: CloseReason) -> bool {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        *self.close_reason.lock() = Some(reason);
        self.cancel.cancel();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close_reason.lock()
    }

    /// Resolves when someone has requested closure.
    pub fn closed_signal(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Snapshot of the keys this connection currently holds.
    pub fn subscriptions(&self) -> HashSet<StreamKey> {
        self.subscriptions.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use telegrid_core::{Quality, TelemetryEvent};

    fn frame(sequence: u64) -> ServerFrame {
        ServerFrame::telemetry(&TelemetryEvent::new(
            StreamKey::from_parts("gw-01", "temp-07"),
            Utc::now(),
            1.0,
            Quality::Good,
            sequence,
        ))
    }

    #[tokio::test]
    async fn enqueue_preserves_fifo_order() {
        let (handle, mut rx) = ConnectionHandle::new(8);
        for sequence in 1..=3 {
            handle.enqueue(frame(sequence)).unwrap();
        }
        for expected in 1..=3u64 {
            match rx.recv().await.unwrap() {
                ServerFrame::Telemetry { sequence, .. } => assert_eq!(sequence, expected),
                other => panic!("expected telemetry, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn overflow_closes_with_slow_consumer() {
        let (handle, _rx) = ConnectionHandle::new(2);
        handle.enqueue(frame(1)).unwrap();
        handle.enqueue(frame(2)).unwrap();

        let err = handle.enqueue(frame(3)).unwrap_err();
        assert!(matches!(err, DistributionError::SlowConsumer));
        assert!(handle.is_closed());
        assert_eq!(handle.close_reason(), Some(CloseReason::SlowConsumer));
        assert!(handle.closed_signal().is_cancelled());
    }

    #[test]
    fn first_close_reason_wins() {
        let (handle, _rx) = ConnectionHandle::new(2);
        assert!(handle.close(CloseReason::HeartbeatTimeout));
        assert!(!handle.close(CloseReason::ClientClosed));
        assert_eq!(handle.close_reason(), Some(CloseReason::HeartbeatTimeout));
    }

    #[tokio::test]
    async fn enqueue_after_receiver_dropped_reports_closed_queue() {
        let (handle, rx) = ConnectionHandle::new(2);
        drop(rx);
        let err = handle.enqueue(frame(1)).unwrap_err();
        assert!(matches!(err, DistributionError::QueueClosed));
    }

    #[test]
    fn ids_are_unique_and_prefixed() {
        let (a, _ra) = ConnectionHandle::new(1);
        let (b, _rb) = ConnectionHandle::new(1);
        assert_ne!(a.id(), b.id());
        assert!(a.id().as_str().starts_with("conn_"));
    }
}
