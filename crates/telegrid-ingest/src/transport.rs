use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;

use telegrid_core::DistributionError;

/// One raw message from the pub/sub transport, before decoding.
#[derive(Clone, Debug)]
pub struct TransportMessage {
    pub topic: String,
    pub payload: Bytes,
}

impl TransportMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    /// Convenience for tests: a JSON-encoded payload.
    pub fn json(topic: impl Into<String>, payload: &serde_json::Value) -> Self {
        Self::new(topic, serde_json::to_vec(payload).unwrap_or_default())
    }
}

pub type MessageStream =
    Pin<Box<dyn Stream<Item = Result<TransportMessage, DistributionError>> + Send>>;

/// Seam between the ingestion bridge and the broker. One implementation
/// speaks MQTT; tests script a mock. A returned stream ends (or yields an
/// error) when the underlying link drops; the bridge then reconnects from
/// scratch, resubscribing the topic filters.
#[async_trait]
pub trait PubSubTransport: Send + Sync {
    fn name(&self) -> &str;

    async fn connect(&self, topics: &[String]) -> Result<MessageStream, DistributionError>;
}
