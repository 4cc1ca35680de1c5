//! The fan-out core: per-connection handles with bounded outbound queues,
//! and the lock-striped broadcast registry mapping stream keys to their
//! subscribers.

mod connection;
mod registry;

pub use connection::ConnectionHandle;
pub use registry::{BroadcastRegistry, RegistryStats};
