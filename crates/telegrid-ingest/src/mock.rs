//! Scripted transport for deterministic bridge tests without a broker.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use futures::stream;
use parking_lot::Mutex;

use telegrid_core::DistributionError;

use crate::transport::{MessageStream, PubSubTransport, TransportMessage};

/// Pre-programmed outcome of one `connect` call.
pub enum MockConnection {
    /// Connect fails outright.
    Fail(DistributionError),
    /// Connect succeeds; the stream yields these messages, then ends
    /// (the bridge treats a bare end like a disconnect).
    Deliver(Vec<TransportMessage>),
    /// Connect succeeds; the stream yields the messages, then the error.
    DeliverThenError(Vec<TransportMessage>, DistributionError),
}

/// Transport returning scripted connections in sequence. Exhausting the
/// script fails further connects, so a test's shutdown token always wins.
pub struct MockTransport {
    connections: Mutex<Vec<Option<MockConnection>>>,
    call_count: AtomicUsize,
    seen_topics: Mutex<Vec<Vec<String>>>,
}

impl MockTransport {
    pub fn new(connections: Vec<MockConnection>) -> Self {
        Self {
            connections: Mutex::new(connections.into_iter().map(Some).collect()),
            call_count: AtomicUsize::new(0),
            seen_topics: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    /// Topic filters passed to each connect call.
    pub fn seen_topics(&self) -> Vec<Vec<String>> {
        self.seen_topics.lock().clone()
    }
}

#[async_trait]
impl PubSubTransport for MockTransport {
    fn name(&self) -> &str {
        "mock"
    }

    async fn connect(&self, topics: &[String]) -> Result<MessageStream, DistributionError> {
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
        self.seen_topics.lock().push(topics.to_vec());

        let connection = self.connections.lock().get_mut(idx).and_then(Option::take);

        match connection {
            None => Err(DistributionError::TransportDisconnected(format!(
                "mock transport: no scripted connection for call {idx}"
            ))),
            Some(MockConnection::Fail(e)) => Err(e),
            Some(MockConnection::Deliver(messages)) => {
                let items: Vec<_> = messages.into_iter().map(Ok).collect();
                Ok(Box::pin(stream::iter(items)))
            }
            Some(MockConnection::DeliverThenError(messages, error)) => {
                let items: Vec<_> = messages
                    .into_iter()
                    .map(Ok)
                    .chain(std::iter::once(Err(error)))
                    .collect();
                Ok(Box::pin(stream::iter(items)))
            }
        }
    }
}
