//! Peer chat relay server.
//!
//! A WebSocket relay that forwards chat, presence and permission frames
//! between named clients. It keeps no history and enforces no permission
//! gate; clients running `peerchat-core` do that themselves.

mod api;
mod relay;

use axum::{
    Router,
    extract::ws::{WebSocket, WebSocketUpgrade},
    response::IntoResponse,
    routing::{get, post},
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing_subscriber::EnvFilter;

use relay::{RelayConfig, RelayState};

#[tokio::main]
async fn main() -> std::io::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = RelayConfig::from_env();
    let state = Arc::new(RelayState::new(config.broadcast_capacity));

    let listener = tokio::net::TcpListener::bind(&config.addr).await?;
    tracing::info!("Peer chat relay listening on {}", config.addr);
    tracing::info!("WebSocket: ws://{}/ws", config.addr);
    tracing::info!("HTTP API:  http://{}/api/", config.addr);

    axum::serve(listener, app(state)).await
}

fn app(state: Arc<RelayState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .route("/api/send", post(api::send_message))
        .route("/api/users", get(api::get_users))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    state: axum::extract::State<Arc<RelayState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.0))
}

async fn handle_socket(socket: WebSocket, state: Arc<RelayState>) {
    relay::handle_connection(socket, state).await;
}
