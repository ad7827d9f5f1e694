//! Events exchanged between instances over the broadcast bus.
//!
//! Every state change is expressed as exactly one `BusEvent`. The JSON form
//! carries a kebab-case `type` tag and camelCase fields.

use serde::{Deserialize, Serialize};

use crate::types::{Message, UserProfile};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum BusEvent {
    /// A tab registered its local identity.
    UserJoined { user: UserProfile, timestamp: u64 },

    /// A message was sent.
    NewMessage { message: Message },

    /// A blocked direct message asks the recipient for consent.
    #[serde(rename_all = "camelCase")]
    PermissionRequest {
        from: String,
        to: String,
        message: String,
        request_id: String,
    },

    /// The recipient answered a permission request.
    #[serde(rename_all = "camelCase")]
    PermissionResponse {
        from: String,
        to: String,
        granted: bool,
        request_id: String,
    },

    /// Periodic presence refresh.
    Heartbeat { user: String, timestamp: u64 },

    /// A tab left. Peers do not evict; the record ages out.
    UserLeft { user: String, timestamp: u64 },
}

impl BusEvent {
    /// The wire tag of this event.
    pub fn kind(&self) -> &'static str {
        match self {
            BusEvent::UserJoined { .. } => "user-joined",
            BusEvent::NewMessage { .. } => "new-message",
            BusEvent::PermissionRequest { .. } => "permission-request",
            BusEvent::PermissionResponse { .. } => "permission-response",
            BusEvent::Heartbeat { .. } => "heartbeat",
            BusEvent::UserLeft { .. } => "user-left",
        }
    }
}
