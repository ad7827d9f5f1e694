//! Tunables for a `PeerChatSystem`.

use std::time::Duration;
use tracing::warn;

use crate::types::{ADMIN, UserProfile};

/// Default key the persisted record lives under.
pub const DEFAULT_STORAGE_KEY: &str = "peer-chat-data";

/// A user unseen for this long is offline.
pub const DEFAULT_FRESHNESS_WINDOW: Duration = Duration::from_secs(30);

/// Period of the self-announcement heartbeat.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub storage_key: String,
    pub freshness_window: Duration,
    pub heartbeat_interval: Duration,
    /// Profile reported for Admin when no Admin tab has been seen.
    pub admin: UserProfile,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            storage_key: DEFAULT_STORAGE_KEY.to_string(),
            freshness_window: DEFAULT_FRESHNESS_WINDOW,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            admin: UserProfile::new(
                ADMIN,
                "bg-purple-600",
                "admin@kamogelomosia.com",
                "+27 123 456 789",
            ),
        }
    }
}

impl ChatConfig {
    /// Defaults overridden by `PEER_CHAT_STORAGE_KEY`,
    /// `PEER_CHAT_FRESHNESS_SECS` and `PEER_CHAT_HEARTBEAT_SECS`.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(key) = std::env::var("PEER_CHAT_STORAGE_KEY") {
            if !key.is_empty() {
                config.storage_key = key;
            }
        }
        if let Some(window) = secs_from_env("PEER_CHAT_FRESHNESS_SECS") {
            config.freshness_window = window;
        }
        if let Some(interval) = secs_from_env("PEER_CHAT_HEARTBEAT_SECS") {
            config.heartbeat_interval = interval;
        }

        config
    }

    pub(crate) fn freshness_window_ms(&self) -> u64 {
        self.freshness_window.as_millis() as u64
    }
}

fn secs_from_env(var: &str) -> Option<Duration> {
    let raw = std::env::var(var).ok()?;
    match raw.parse::<u64>() {
        Ok(secs) if secs > 0 => Some(Duration::from_secs(secs)),
        _ => {
            warn!("Ignoring {var}={raw:?}: expected a positive number of seconds");
            None
        }
    }
}
