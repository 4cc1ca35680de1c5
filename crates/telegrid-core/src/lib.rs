//! Shared vocabulary for the telegrid pipeline: identifiers, telemetry
//! events, the WebSocket wire protocol, the error taxonomy, and the
//! backoff policy used by both reconnect loops.

pub mod backoff;
pub mod errors;
pub mod event;
pub mod ids;
pub mod wire;

pub use backoff::{Backoff, Jitter};
pub use errors::{CloseReason, DistributionError};
pub use event::{Quality, StatusUpdate, TelemetryEvent};
pub use ids::{ConnectionId, StreamKey};
pub use wire::{ClientFrame, ServerFrame};
