//! Telemetry ingestion: subscribes to the pub/sub transport, normalizes
//! inbound messages into typed events, and feeds the broadcast registry and
//! the storage writer. Self-heals across broker outages with unbounded
//! backoff.

mod bridge;
mod decode;
pub mod mock;
mod mqtt;
mod transport;

pub use bridge::{BridgeConfig, BridgeCounters, IngestionBridge};
pub use decode::{decode, InboundKind, RawReading};
pub use mqtt::{MqttConfig, MqttTransport};
pub use transport::{MessageStream, PubSubTransport, TransportMessage};
