//! Core data types: users, messages, permission requests and the persisted record.

use rand::Rng;
use serde::{Deserialize, Serialize};

/// The well-known identity that every user may message without consent.
pub const ADMIN: &str = "Admin";

/// Recipient sentinel for messages addressed to everyone.
pub const BROADCAST_RECIPIENT: &str = "all";

/// Whether `name` may exchange direct messages without an explicit grant.
pub fn is_implicitly_trusted(name: &str) -> bool {
    name == ADMIN
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// What a tab announces about its user when joining.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub name: String,
    #[serde(default)]
    pub color: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub phone: String,
}

impl UserProfile {
    pub fn new(
        name: impl Into<String>,
        color: impl Into<String>,
        email: impl Into<String>,
        phone: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            color: color.into(),
            email: email.into(),
            phone: phone.into(),
        }
    }
}

/// A presence record. Rebuilt from join and heartbeat events, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub name: String,
    pub color: String,
    pub email: String,
    pub phone: String,
    /// Last join or heartbeat observed, in milliseconds.
    pub last_seen: u64,
}

impl User {
    pub fn from_profile(profile: &UserProfile, last_seen: u64) -> Self {
        Self {
            name: profile.name.clone(),
            color: profile.color.clone(),
            email: profile.email.clone(),
            phone: profile.phone.clone(),
            last_seen,
        }
    }

    /// Whether this record is fresh at `now` given a freshness window.
    pub fn is_fresh(&self, now: u64, window_ms: u64) -> bool {
        now.saturating_sub(self.last_seen) < window_ms
    }
}

/// An immutable chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub from: String,
    /// A user name, or `"all"`.
    pub to: String,
    pub text: String,
    /// Creation time in milliseconds.
    pub time: u64,
}

impl Message {
    /// Create a new message stamped with the current time and a fresh id.
    pub fn new(from: impl Into<String>, to: impl Into<String>, text: impl Into<String>) -> Self {
        let time = now_millis();
        Self {
            id: message_id(time),
            from: from.into(),
            to: to.into(),
            text: text.into(),
            time,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.to == BROADCAST_RECIPIENT
    }
}

/// A withheld direct message awaiting the recipient's consent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingPermissionRequest {
    pub from: String,
    pub to: String,
    pub message: String,
    pub request_id: String,
}

/// The single record kept under the storage key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    #[serde(default)]
    pub message_history: Vec<Message>,
    #[serde(default)]
    pub allowed_contacts: Vec<String>,
}

/// Message id: creation time plus a random suffix.
fn message_id(time: u64) -> String {
    let suffix: u32 = rand::thread_rng().r#gen();
    format!("{time}-{suffix:08x}")
}

/// Permission request id: `req_{millis}_{9 base-36 chars}`.
pub fn request_id() -> String {
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..9)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect();
    format!("req_{}_{suffix}", now_millis())
}
