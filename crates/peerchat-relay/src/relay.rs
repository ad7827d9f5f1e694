//! Core relay logic: name registry, frame routing and connection handling.
//!
//! There is no permission gate, persistence or presence expiry here. A name
//! belongs to whichever socket joined with it last.

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{RwLock, broadcast, broadcast::error::RecvError};
use tracing::{debug, info, warn};

/// Default broadcast channel capacity.
pub const BROADCAST_CAPACITY: usize = 256;

/// Default listen address.
pub const DEFAULT_ADDR: &str = "0.0.0.0:3002";

/// Recipient sentinel for messages addressed to everyone.
pub const EVERYONE: &str = "all";

/// Relay settings, read from the environment.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub addr: String,
    pub broadcast_capacity: usize,
}

impl RelayConfig {
    /// `CHAT_RELAY_ADDR` and `CHAT_RELAY_BROADCAST_CAPACITY`, with defaults.
    pub fn from_env() -> Self {
        let addr = std::env::var("CHAT_RELAY_ADDR").unwrap_or_else(|_| DEFAULT_ADDR.to_string());
        let broadcast_capacity = match std::env::var("CHAT_RELAY_BROADCAST_CAPACITY") {
            Ok(raw) => match raw.parse::<usize>() {
                Ok(capacity) if capacity > 0 => capacity,
                _ => {
                    warn!("Ignoring CHAT_RELAY_BROADCAST_CAPACITY={raw:?}");
                    BROADCAST_CAPACITY
                }
            },
            Err(_) => BROADCAST_CAPACITY,
        };
        Self {
            addr,
            broadcast_capacity,
        }
    }
}

pub type ConnId = u64;

/// A joined socket, keyed in the registry by name.
#[derive(Debug, Clone)]
pub struct Member {
    pub name: String,
    pub color: Option<String>,
    pub conn_id: ConnId,
}

/// Who receives an outbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Targets {
    Everyone,
    Connections(Vec<ConnId>),
}

impl Targets {
    pub fn includes(&self, conn_id: ConnId) -> bool {
        match self {
            Targets::Everyone => true,
            Targets::Connections(ids) => ids.contains(&conn_id),
        }
    }
}

/// A frame queued on the broadcast channel with its routing.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub targets: Targets,
    pub frame: ServerFrame,
}

/// Frames sent by clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientFrame {
    /// Register (or re-register) under a name.
    Join {
        user: String,
        #[serde(default)]
        color: Option<String>,
    },

    /// Chat message to `"all"` or one name. `from` is informational; the
    /// relay stamps the joined name.
    Message {
        #[serde(default)]
        from: Option<String>,
        to: String,
        text: String,
    },

    PermissionRequest {
        #[serde(default)]
        from: Option<String>,
        to: String,
        #[serde(default)]
        text: String,
    },

    #[serde(rename_all = "camelCase")]
    PermissionGranted {
        #[serde(default)]
        from: Option<String>,
        to: String,
        #[serde(default)]
        request_id: Option<String>,
    },
}

/// Name and colour of a joined user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub name: String,
    pub color: Option<String>,
}

/// Frames sent by the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerFrame {
    #[serde(rename_all = "camelCase")]
    Users {
        users: Vec<String>,
        users_with_details: Vec<UserInfo>,
    },

    Message {
        from: String,
        to: String,
        text: String,
        time: u64,
    },

    #[serde(rename_all = "camelCase")]
    PermissionRequest {
        from: String,
        message: String,
        request_id: String,
    },

    #[serde(rename_all = "camelCase")]
    PermissionGranted {
        from: String,
        request_id: Option<String>,
    },
}

/// Shared relay state.
pub struct RelayState {
    /// Joined sockets by name. Last join wins.
    pub users: RwLock<BTreeMap<String, Member>>,
    /// Broadcast channel feeding every socket's send task.
    pub broadcast_tx: broadcast::Sender<Outbound>,
    next_conn_id: AtomicU64,
}

impl RelayState {
    pub fn new(broadcast_capacity: usize) -> Self {
        let (broadcast_tx, _) = broadcast::channel(broadcast_capacity.max(1));
        Self {
            users: RwLock::new(BTreeMap::new()),
            broadcast_tx,
            next_conn_id: AtomicU64::new(1),
        }
    }

    fn next_conn_id(&self) -> ConnId {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    fn send(&self, targets: Targets, frame: ServerFrame) {
        // No receivers just means nobody is connected.
        let _ = self.broadcast_tx.send(Outbound { targets, frame });
    }

    /// Current users with their colours.
    pub async fn user_details(&self) -> Vec<UserInfo> {
        self.users
            .read()
            .await
            .values()
            .map(|m| UserInfo {
                name: m.name.clone(),
                color: m.color.clone(),
            })
            .collect()
    }

    async fn broadcast_users(&self) {
        let users_with_details = self.user_details().await;
        let users = users_with_details.iter().map(|u| u.name.clone()).collect();
        self.send(
            Targets::Everyone,
            ServerFrame::Users {
                users,
                users_with_details,
            },
        );
    }

    /// Bind `name` to `conn_id`, replacing any earlier holder of the name and
    /// any earlier name of this connection.
    pub async fn register(&self, name: &str, color: Option<String>, conn_id: ConnId) {
        {
            let mut users = self.users.write().await;
            users.retain(|_, m| m.conn_id != conn_id);
            if let Some(previous) = users.insert(
                name.to_string(),
                Member {
                    name: name.to_string(),
                    color: color.clone(),
                    conn_id,
                },
            ) {
                info!(
                    "Name '{name}' moved from connection {} to {conn_id}",
                    previous.conn_id
                );
            }
        }
        info!("{name} joined with color {color:?}");
        self.broadcast_users().await;
    }

    /// Drop whatever name `conn_id` still holds. Returns the freed name.
    pub async fn unregister(&self, conn_id: ConnId) -> Option<String> {
        let removed = {
            let mut users = self.users.write().await;
            let name = users
                .values()
                .find(|m| m.conn_id == conn_id)
                .map(|m| m.name.clone());
            if let Some(ref name) = name {
                users.remove(name);
            }
            name
        };
        if removed.is_some() {
            self.broadcast_users().await;
        }
        removed
    }

    pub async fn conn_for(&self, name: &str) -> Option<ConnId> {
        self.users.read().await.get(name).map(|m| m.conn_id)
    }

    /// Route a chat message. Direct messages go to the target and echo back
    /// to `sender_conn` when given. Returns false if a direct target is not
    /// joined (the echo is still sent).
    pub async fn route_message(
        &self,
        from: &str,
        sender_conn: Option<ConnId>,
        to: &str,
        text: String,
    ) -> bool {
        let frame = ServerFrame::Message {
            from: from.to_string(),
            to: to.to_string(),
            text,
            time: now_millis(),
        };

        if to == EVERYONE {
            self.send(Targets::Everyone, frame);
            return true;
        }

        let target = self.conn_for(to).await;
        let mut conns: Vec<ConnId> = target.into_iter().collect();
        if let Some(sender) = sender_conn {
            if target != Some(sender) {
                conns.push(sender);
            }
        }
        if !conns.is_empty() {
            self.send(Targets::Connections(conns), frame);
        }
        target.is_some()
    }

    /// Forward a permission request to `to` with a fresh request id.
    pub async fn route_permission_request(&self, from: &str, to: &str, message: String) -> bool {
        let Some(target) = self.conn_for(to).await else {
            return false;
        };
        self.send(
            Targets::Connections(vec![target]),
            ServerFrame::PermissionRequest {
                from: from.to_string(),
                message,
                request_id: request_id(),
            },
        );
        true
    }

    /// Forward a grant back to the requester `to`.
    pub async fn route_permission_granted(
        &self,
        from: &str,
        to: &str,
        request_id: Option<String>,
    ) -> bool {
        let Some(target) = self.conn_for(to).await else {
            return false;
        };
        self.send(
            Targets::Connections(vec![target]),
            ServerFrame::PermissionGranted {
                from: from.to_string(),
                request_id,
            },
        );
        true
    }
}

pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// `req_{millis}_{9 base-36 chars}`.
fn request_id() -> String {
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::rng();
    let suffix: String = (0..9)
        .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
        .collect();
    format!("req_{}_{suffix}", now_millis())
}

/// Apply one client frame. `name` is the connection's current name, `None`
/// until it joins; anything but `join` is ignored before then.
async fn handle_frame(
    state: &RelayState,
    conn_id: ConnId,
    name: &mut Option<String>,
    text: &str,
) {
    let frame = match serde_json::from_str::<ClientFrame>(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!("Malformed frame from connection {conn_id}: {e}");
            return;
        }
    };

    let frame = match frame {
        ClientFrame::Join { user, color } => {
            state.register(&user, color, conn_id).await;
            *name = Some(user);
            return;
        }
        other => other,
    };

    let Some(name) = name.as_deref() else {
        debug!("Connection {conn_id} sent a frame before joining; ignored");
        return;
    };

    match frame {
        ClientFrame::Join { .. } => {}
        ClientFrame::Message { to, text, .. } => {
            debug!("Message from {name} to {to}");
            state.route_message(name, Some(conn_id), &to, text).await;
        }
        ClientFrame::PermissionRequest { to, text, .. } => {
            info!("Permission request from {name} to {to}");
            state.route_permission_request(name, &to, text).await;
        }
        ClientFrame::PermissionGranted { to, request_id, .. } => {
            info!("Permission granted by {name} to {to}");
            state.route_permission_granted(name, &to, request_id).await;
        }
    }
}

/// Handle a single WebSocket connection. Broadcasts flow to the socket as
/// soon as it opens; direct frames need a `join` first.
pub async fn handle_connection(socket: WebSocket, state: std::sync::Arc<RelayState>) {
    let conn_id = state.next_conn_id();
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut broadcast_rx = state.broadcast_tx.subscribe();

    debug!("Connection {conn_id} opened");

    // Forward routed frames addressed to this connection.
    let mut send_task = tokio::spawn(async move {
        loop {
            match broadcast_rx.recv().await {
                Ok(out) => {
                    if !out.targets.includes(conn_id) {
                        continue;
                    }
                    let json = match serde_json::to_string(&out.frame) {
                        Ok(json) => json,
                        Err(e) => {
                            warn!("Failed to encode frame: {e}");
                            continue;
                        }
                    };
                    if ws_tx.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!("Connection {conn_id} lagged; {missed} frames dropped");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    // Read incoming frames from the client.
    let state_clone = state.clone();
    let mut recv_task = tokio::spawn(async move {
        let mut name: Option<String> = None;
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                Message::Text(text) => {
                    handle_frame(&state_clone, conn_id, &mut name, text.as_str()).await;
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish.
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    match state.unregister(conn_id).await {
        Some(name) => info!("{name} disconnected"),
        None => debug!("Connection {conn_id} closed without holding a name"),
    }
}
