//! HTTP API for scripts and bots.
//!
//! Endpoints:
//! - POST /api/send  — send a chat message without a WebSocket connection
//! - GET  /api/users — list joined users

use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::relay::{RelayState, UserInfo};

/// Request body for POST /api/send.
#[derive(Debug, Deserialize)]
pub struct SendRequest {
    /// Display name stamped on the message.
    pub from: String,
    /// `"all"` or a joined user's name.
    pub to: String,
    pub text: String,
}

/// Response for GET /api/users.
#[derive(Debug, Serialize)]
pub struct UsersResponse {
    pub users: Vec<UserInfo>,
    pub count: usize,
}

/// POST /api/send — route a message as if a client had sent it.
pub async fn send_message(
    State(state): State<Arc<RelayState>>,
    Json(req): Json<SendRequest>,
) -> impl IntoResponse {
    if req.from.trim().is_empty() {
        return StatusCode::BAD_REQUEST;
    }
    if state.route_message(&req.from, None, &req.to, req.text).await {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}

/// GET /api/users — currently joined users.
pub async fn get_users(State(state): State<Arc<RelayState>>) -> impl IntoResponse {
    let users = state.user_details().await;
    Json(UsersResponse {
        count: users.len(),
        users,
    })
}
