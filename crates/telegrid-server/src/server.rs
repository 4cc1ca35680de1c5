use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;

use telegrid_hub::BroadcastRegistry;
use telegrid_store::MetadataRepo;

use crate::session::{self, SessionConfig};

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub send_queue_capacity: usize,
    pub heartbeat_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            send_queue_capacity: 256,
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

/// Shared application state passed to axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<BroadcastRegistry>,
    pub metadata: Arc<MetadataRepo>,
    pub session_config: SessionConfig,
}

/// Build the axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Bind and serve. Returns a handle that keeps the server task alive.
pub async fn start(
    config: ServerConfig,
    registry: Arc<BroadcastRegistry>,
    metadata: Arc<MetadataRepo>,
) -> Result<ServerHandle, std::io::Error> {
    let session_config = SessionConfig {
        heartbeat_interval: config.heartbeat_interval,
        queue_capacity: config.send_queue_capacity,
    };
    let state = AppState {
        registry,
        metadata,
        session_config,
    };

    let router = build_router(state);
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(port = local_addr.port(), "telegrid server started");

    let server_task = tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        _server: server_task,
    })
}

/// Handle returned by `start()`; dropping it aborts nothing, the server
/// runs until the process exits.
pub struct ServerHandle {
    pub port: u16,
    _server: tokio::task::JoinHandle<()>,
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    session::run_session(
        socket,
        state.registry,
        state.metadata,
        state.session_config,
    )
    .await;
}

/// Health check HTTP endpoint with registry occupancy.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.registry.stats();
    axum::Json(serde_json::json!({
        "status": "healthy",
        "connections": stats.connections,
        "streams": stats.streams,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use telegrid_store::Database;

    fn state() -> AppState {
        AppState {
            registry: Arc::new(BroadcastRegistry::new()),
            metadata: Arc::new(MetadataRepo::new(Database::in_memory().unwrap())),
            session_config: SessionConfig::default(),
        }
    }

    #[test]
    fn build_router_creates_routes() {
        let _router = build_router(state());
    }

    #[tokio::test]
    async fn server_starts_and_serves_health() {
        let config = ServerConfig {
            port: 0, // random port
            ..Default::default()
        };
        let registry = Arc::new(BroadcastRegistry::new());
        let metadata = Arc::new(MetadataRepo::new(Database::in_memory().unwrap()));

        let handle = start(config, registry, metadata).await.unwrap();
        assert!(handle.port > 0);

        let url = format!("http://127.0.0.1:{}/health", handle.port);
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 200);

        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["connections"], 0);
    }
}
