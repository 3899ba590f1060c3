//! InkMesh Relay Server
//!
//! Two WebSocket services on one listener:
//!
//! - `/ws`: the room relay. Clients join a room topic and publish opaque
//!   base64 payloads that are fanned out to the other members.
//! - `/signal`: the rendezvous service. Clients announce the URL they accept
//!   direct links on and get back the other peers in the topic.
//!
//! ## Protocol
//!
//! ```json
//! { "type": "join", "room": "inkmesh/abc123" }
//! { "type": "publish", "data": "<base64>", "ephemeral": true }
//! { "type": "announce", "topic": "inkmesh/abc123", "offer": { "peer_id": "…", "url": "ws://…" } }
//! ```

pub mod config;
mod error;
pub mod relay;
pub mod rendezvous;

use std::sync::Arc;

use axum::{
    Router,
    extract::{State, ws::WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use config::ServerConfig;
pub use error::ServerError;
pub use relay::RelayState;
pub use rendezvous::RendezvousState;

/// Shared application state.
pub struct AppState {
    pub relay: RelayState,
    pub rendezvous: RendezvousState,
}

impl AppState {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            relay: RelayState::new(config.history_limit, config.channel_capacity)
                .with_history_bytes(config.history_bytes),
            rendezvous: RendezvousState::new(),
        }
    }
}

/// All routes over `state`.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/ws", get(relay_handler))
        .route("/signal", get(signal_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve on `listener` until the process stops.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> Result<(), ServerError> {
    axum::serve(listener, router(state)).await?;
    Ok(())
}

/// Index page
async fn index() -> &'static str {
    "InkMesh Relay Server - relay at /ws, rendezvous at /signal"
}

/// Health check
async fn health() -> &'static str {
    "ok"
}

async fn relay_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| relay::handle_socket(socket, state))
}

async fn signal_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| rendezvous::handle_socket(socket, state))
}
