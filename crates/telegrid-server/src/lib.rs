//! WebSocket distribution server: accepts viewer connections, runs one
//! session per link, and serves a health endpoint.

mod server;
mod session;

pub use server::{build_router, start, AppState, ServerConfig, ServerHandle};
pub use session::{run_session, SessionConfig};
