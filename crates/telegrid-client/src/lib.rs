//! Consumer-side session manager: keeps one WebSocket link alive with
//! reconnect-and-resubscribe, answers heartbeats, and dispatches typed
//! messages to registered handlers.

mod handlers;
mod reconnect;
mod session;

pub use handlers::{HandlerRegistry, PongMessage, StatusMessage, TelemetryMessage};
pub use reconnect::{ReconnectPolicy, ReconnectState};
pub use session::{ClientConfig, ClientHandle, ClientSession, SessionState};

/// Stream key used for synthetic status dispatches that concern the whole
/// link rather than one stream.
pub const LINK_SCOPE: &str = "*";
