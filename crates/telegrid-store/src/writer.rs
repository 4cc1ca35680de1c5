use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use telegrid_core::TelemetryEvent;
use telegrid_logging::metrics;

use crate::telemetry::TelemetryRepo;

/// How many queued events are drained into one insert transaction.
const BATCH_SIZE: usize = 64;

/// Non-blocking entry point to the persistence path. `persist` never waits:
/// a saturated queue drops the event and counts it, keeping the ingestion
/// hot path free of storage latency.
#[derive(Clone)]
pub struct StorageWriterHandle {
    tx: mpsc::Sender<TelemetryEvent>,
}

impl StorageWriterHandle {
    /// Hand an event to the writer. Returns false when the event was dropped
    /// (queue full or writer gone).
    pub fn persist(&self, event: TelemetryEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                metrics::counter_inc("storage.persist.dropped", &[], 1);
                warn!(stream_key = %event.stream_key, "storage writer queue full, dropping event");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// Background task that drains the queue in batches and appends them to the
/// telemetry history.
pub struct StorageWriter;

impl StorageWriter {
    pub fn spawn(repo: TelemetryRepo, queue_capacity: usize) -> (StorageWriterHandle, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<TelemetryEvent>(queue_capacity);

        let task = tokio::spawn(async move {
            let mut batch = Vec::with_capacity(BATCH_SIZE);
            loop {
                let received = rx.recv_many(&mut batch, BATCH_SIZE).await;
                if received == 0 {
                    break;
                }
                if let Err(e) = repo.insert_batch(&batch) {
                    metrics::counter_inc("storage.persist.failed", &[], batch.len() as u64);
                    warn!(error = %e, count = batch.len(), "telemetry batch insert failed");
                }
                batch.clear();
            }
        });

        (StorageWriterHandle { tx }, task)
    }
}
