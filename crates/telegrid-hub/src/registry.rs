use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;

use telegrid_core::{
    CloseReason, ConnectionId, ServerFrame, StatusUpdate, StreamKey, TelemetryEvent,
};
use telegrid_logging::metrics;

use crate::connection::ConnectionHandle;

/// Snapshot of registry occupancy, served through `get_stats` and `/health`.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct RegistryStats {
    pub connections: usize,
    pub streams: usize,
}

/// The shared fan-out map: `StreamKey -> subscribers` for O(subscribers)
/// publish, and the inverse set inside each [`ConnectionHandle`] for O(held)
/// cleanup on disconnect.
///
/// Lock discipline: mutations always take the connection's subscription
/// mutex first, then the per-key shard entry. Publishes take only the shard
/// entry (exclusively), so a publish on a key never observes a half-applied
/// subscribe on that key, while distinct keys proceed in parallel.
pub struct BroadcastRegistry {
    subscribers: DashMap<StreamKey, HashSet<ConnectionId>>,
    connections: DashMap<ConnectionId, Arc<ConnectionHandle>>,
}

impl Default for BroadcastRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastRegistry {
    pub fn new() -> Self {
        Self {
            subscribers: DashMap::new(),
            connections: DashMap::new(),
        }
    }

    /// Add a freshly handshaken connection.
    pub fn register(&self, handle: Arc<ConnectionHandle>) {
        self.connections.insert(handle.id().clone(), handle);
        metrics::gauge_set("ws.connections.active", &[], self.connections.len() as f64);
    }

    pub fn connection(&self, id: &ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.connections.get(id).map(|entry| entry.value().clone())
    }

    /// Subscribe a connection to a stream key. Idempotent; returns false for
    /// unknown or already-closing connections.
    pub fn subscribe(&self, id: &ConnectionId, key: &StreamKey) -> bool {
        let Some(handle) = self.connection(id) else {
            return false;
        };

        let mut held = handle.subscriptions.lock();
        if handle.is_closed() {
            return false;
        }
        held.insert(key.clone());
        self.subscribers
            .entry(key.clone())
            .or_default()
            .insert(id.clone());
        true
    }

    /// Remove one subscription pair. Idempotent; a no-op when absent.
    pub fn unsubscribe(&self, id: &ConnectionId, key: &StreamKey) {
        let Some(handle) = self.connection(id) else {
            return;
        };

        {
            let mut held = handle.subscriptions.lock();
            held.remove(key);
            if let Some(mut entry) = self.subscribers.get_mut(key) {
                entry.remove(id);
            }
        }
        self.subscribers.remove_if(key, |_, subs| subs.is_empty());
    }

    /// Detach a connection from every key it holds, then forget it. Safe to
    /// call any number of times.
    pub fn remove_connection(&self, id: &ConnectionId) {
        let Some((_, handle)) = self.connections.remove(id) else {
            return;
        };
        // Closing here is what prevents resurrection: subscribe re-checks
        // the flag under the same subscription mutex.
        handle.close(CloseReason::ClientClosed);

        let mut emptied = Vec::new();
        {
            let mut held = handle.subscriptions.lock();
            for key in held.drain() {
                if let Some(mut entry) = self.subscribers.get_mut(&key) {
                    entry.remove(id);
                    if entry.is_empty() {
                        emptied.push(key);
                    }
                }
            }
        }
        for key in emptied {
            self.subscribers.remove_if(&key, |_, subs| subs.is_empty());
        }

        metrics::gauge_set("ws.connections.active", &[], self.connections.len() as f64);
        debug!(connection_id = %id, "connection removed from registry");
    }

    /// Fan one event out to every subscriber of its stream key. Each
    /// subscriber's queue gets its own copy; a full queue marks that
    /// connection `SlowConsumer` and detaches it, without failing the
    /// publish or touching other subscribers. Returns the delivery count.
    pub fn publish(&self, event: &TelemetryEvent) -> usize {
        self.fan_out(&event.stream_key, || ServerFrame::telemetry(event))
    }

    /// Same fan-out for gateway status updates.
    pub fn publish_status(&self, update: &StatusUpdate) -> usize {
        self.fan_out(&update.stream_key, || ServerFrame::status(update))
    }

    fn fan_out(&self, key: &StreamKey, frame: impl Fn() -> ServerFrame) -> usize {
        let mut delivered = 0;
        let mut overflowed = Vec::new();

        // Exclusive shard access serializes publishes per key against
        // subscription changes on the same key.
        if let Some(entry) = self.subscribers.get_mut(key) {
            for id in entry.iter() {
                let Some(conn) = self.connections.get(id) else {
                    continue;
                };
                match conn.enqueue(frame()) {
                    Ok(()) => delivered += 1,
                    Err(_) => overflowed.push(id.clone()),
                }
            }
        }

        for id in &overflowed {
            metrics::counter_inc("fanout.slow_consumer", &[], 1);
            tracing::warn!(connection_id = %id, stream_key = %key, "queue overflow, closing slow consumer");
            self.remove_connection(id);
        }

        if delivered > 0 {
            metrics::counter_inc("fanout.delivered", &[], delivered as u64);
        }
        delivered
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            connections: self.connections.len(),
            streams: self.subscribers.len(),
        }
    }

    /// Subscriber count for one key (0 when the key is absent).
    pub fn subscriber_count(&self, key: &StreamKey) -> usize {
        self.subscribers.get(key).map_or(0, |entry| entry.len())
    }

    /// Ids of all live connections.
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.connections.iter().map(|entry| entry.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use telegrid_core::Quality;

    fn event(key: &StreamKey, sequence: u64) -> TelemetryEvent {
        TelemetryEvent::new(key.clone(), Utc::now(), 20.0 + sequence as f64, Quality::Good, sequence)
    }

    fn setup(capacity: usize) -> (BroadcastRegistry, Arc<ConnectionHandle>, tokio::sync::mpsc::Receiver<ServerFrame>) {
        let registry = BroadcastRegistry::new();
        let (handle, rx) = ConnectionHandle::new(capacity);
        registry.register(handle.clone());
        (registry, handle, rx)
    }

    /// The §3 invariant: a key's subscriber set contains a connection iff
    /// that connection's own set contains the key.
    fn assert_views_consistent(registry: &BroadcastRegistry) {
        for conn_entry in registry.connections.iter() {
            let id = conn_entry.key();
            for key in conn_entry.value().subscriptions() {
                let subs = registry.subscribers.get(&key).expect("key missing from forward view");
                assert!(subs.contains(id), "{key} missing {id} in forward view");
            }
        }
        for key_entry in registry.subscribers.iter() {
            for id in key_entry.value().iter() {
                let conn = registry.connections.get(id).expect("connection missing");
                assert!(
                    conn.subscriptions().contains(key_entry.key()),
                    "{} not in {id}'s view",
                    key_entry.key()
                );
            }
        }
    }

    #[tokio::test]
    async fn subscribe_is_idempotent() {
        let (registry, handle, _rx) = setup(8);
        let key = StreamKey::from_parts("gw-01", "temp-07");

        assert!(registry.subscribe(handle.id(), &key));
        assert!(registry.subscribe(handle.id(), &key));
        assert_eq!(registry.subscriber_count(&key), 1);
        assert_views_consistent(&registry);
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent_and_prunes() {
        let (registry, handle, _rx) = setup(8);
        let key = StreamKey::from_parts("gw-01", "temp-07");

        registry.subscribe(handle.id(), &key);
        registry.unsubscribe(handle.id(), &key);
        registry.unsubscribe(handle.id(), &key);

        assert_eq!(registry.subscriber_count(&key), 0);
        assert_eq!(registry.stats().streams, 0);
        assert_views_consistent(&registry);
    }

    #[tokio::test]
    async fn subscribe_then_unsubscribe_leaves_remaining_keys() {
        let (registry, handle, _rx) = setup(8);
        let a = StreamKey::from_parts("gw-01", "a");
        let b = StreamKey::from_parts("gw-01", "b");

        registry.subscribe(handle.id(), &a);
        registry.subscribe(handle.id(), &b);
        registry.unsubscribe(handle.id(), &a);

        assert_eq!(handle.subscriptions(), HashSet::from([b.clone()]));
        assert_eq!(registry.subscriber_count(&b), 1);
        assert_views_consistent(&registry);
    }

    #[tokio::test]
    async fn publish_delivers_in_sequence_order() {
        let (registry, handle, mut rx) = setup(8);
        let key = StreamKey::from_parts("gw-01", "temp-07");
        registry.subscribe(handle.id(), &key);

        for sequence in 1..=3 {
            assert_eq!(registry.publish(&event(&key, sequence)), 1);
        }
        for expected in 1..=3u64 {
            match rx.recv().await.unwrap() {
                ServerFrame::Telemetry { sequence, .. } => assert_eq!(sequence, expected),
                other => panic!("expected telemetry, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_a_noop() {
        let (registry, _handle, _rx) = setup(8);
        let key = StreamKey::from_parts("gw-01", "nobody");
        assert_eq!(registry.publish(&event(&key, 1)), 0);
    }

    #[tokio::test]
    async fn publish_skips_unsubscribed_connections() {
        let registry = BroadcastRegistry::new();
        let (sub, mut sub_rx) = ConnectionHandle::new(8);
        let (other, mut other_rx) = ConnectionHandle::new(8);
        registry.register(sub.clone());
        registry.register(other.clone());

        let key = StreamKey::from_parts("gw-01", "temp-07");
        registry.subscribe(sub.id(), &key);

        assert_eq!(registry.publish(&event(&key, 1)), 1);
        assert!(sub_rx.try_recv().is_ok());
        assert!(other_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn slow_consumer_is_closed_and_detached_others_unaffected() {
        let registry = BroadcastRegistry::new();
        let (slow, _slow_rx) = ConnectionHandle::new(2);
        let (healthy, mut healthy_rx) = ConnectionHandle::new(64);
        registry.register(slow.clone());
        registry.register(healthy.clone());

        let key = StreamKey::from_parts("gw-01", "temp-07");
        registry.subscribe(slow.id(), &key);
        registry.subscribe(healthy.id(), &key);

        // Nobody drains `slow`, so the third publish overflows its queue.
        for sequence in 1..=3 {
            registry.publish(&event(&key, sequence));
        }

        assert!(slow.is_closed());
        assert_eq!(slow.close_reason(), Some(CloseReason::SlowConsumer));
        assert!(registry.connection(slow.id()).is_none());
        assert_eq!(registry.subscriber_count(&key), 1);
        assert_views_consistent(&registry);

        // The healthy subscriber keeps receiving subsequent events.
        registry.publish(&event(&key, 4));
        let mut sequences = Vec::new();
        while let Ok(ServerFrame::Telemetry { sequence, .. }) = healthy_rx.try_recv() {
            sequences.push(sequence);
        }
        assert_eq!(sequences, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn remove_connection_detaches_every_key() {
        let (registry, handle, _rx) = setup(8);
        let keys: Vec<StreamKey> = (0..5)
            .map(|i| StreamKey::from_parts("gw-01", &format!("s{i}")))
            .collect();
        for key in &keys {
            registry.subscribe(handle.id(), key);
        }

        registry.remove_connection(handle.id());
        registry.remove_connection(handle.id()); // idempotent

        assert_eq!(registry.stats().connections, 0);
        assert_eq!(registry.stats().streams, 0);
        for key in &keys {
            assert_eq!(registry.subscriber_count(key), 0);
        }
    }

    #[tokio::test]
    async fn subscribe_after_removal_is_refused() {
        let (registry, handle, _rx) = setup(8);
        let key = StreamKey::from_parts("gw-01", "temp-07");
        registry.remove_connection(handle.id());
        assert!(!registry.subscribe(handle.id(), &key));
        assert_eq!(registry.subscriber_count(&key), 0);
    }

    #[tokio::test]
    async fn views_stay_consistent_across_op_sequences() {
        let registry = BroadcastRegistry::new();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let (handle, rx) = ConnectionHandle::new(16);
            registry.register(handle.clone());
            handles.push((handle, rx));
        }
        let keys: Vec<StreamKey> = (0..6)
            .map(|i| StreamKey::from_parts("gw", &format!("s{i}")))
            .collect();

        for (i, (handle, _)) in handles.iter().enumerate() {
            for key in keys.iter().skip(i % 2).step_by(2) {
                registry.subscribe(handle.id(), key);
            }
        }
        assert_views_consistent(&registry);

        for (handle, _) in handles.iter().take(2) {
            for key in keys.iter().take(3) {
                registry.unsubscribe(handle.id(), key);
            }
        }
        assert_views_consistent(&registry);

        registry.remove_connection(handles[3].0.id());
        assert_views_consistent(&registry);
    }

    #[tokio::test]
    async fn concurrent_subscribers_on_distinct_keys() {
        let registry = Arc::new(BroadcastRegistry::new());
        let mut join = tokio::task::JoinSet::new();
        let mut rxs = Vec::new();

        for i in 0..8 {
            let (handle, rx) = ConnectionHandle::new(256);
            registry.register(handle.clone());
            rxs.push(rx);
            let registry = registry.clone();
            join.spawn(async move {
                let key = StreamKey::from_parts("gw", &format!("s{}", i % 4));
                for _ in 0..50 {
                    registry.subscribe(handle.id(), &key);
                    registry.unsubscribe(handle.id(), &key);
                }
                registry.subscribe(handle.id(), &key);
            });
        }
        while join.join_next().await.is_some() {}

        let mut total = 0;
        for i in 0..4 {
            total += registry.subscriber_count(&StreamKey::from_parts("gw", &format!("s{i}")));
        }
        assert_eq!(total, 8);
    }

    #[tokio::test]
    async fn status_updates_fan_out_like_telemetry() {
        let (registry, handle, mut rx) = setup(8);
        let key = StreamKey::from_parts("gw-01", "temp-07");
        registry.subscribe(handle.id(), &key);

        let update = StatusUpdate {
            stream_key: key.clone(),
            status: "offline".into(),
            observed_at: Utc::now(),
        };
        assert_eq!(registry.publish_status(&update), 1);

        match rx.recv().await.unwrap() {
            ServerFrame::Status { stream_key, status } => {
                assert_eq!(stream_key, key);
                assert_eq!(status, "offline");
            }
            other => panic!("expected status, got {other:?}"),
        }
    }
}
