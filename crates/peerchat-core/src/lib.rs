//! # peerchat-core
//!
//! Serverless chat between independent instances ("tabs") that share two
//! primitives:
//! - a [`BroadcastBus`] every instance publishes to and subscribes on
//! - a [`KeyValueStore`] holding message history and allowed contacts
//!
//! On top of those, [`PeerChatSystem`] keeps a presence roster fresh with
//! heartbeats, records messages, and gates unsolicited direct messages
//! behind an explicit permission grant.
//!
//! This crate has no network code. Instances in one process share a
//! [`LocalBus`]; storage is in memory or SQLite.

pub mod bus;
pub mod config;
pub mod error;
pub mod event;
mod heartbeat;
pub mod store;
pub mod system;
pub mod types;

pub use bus::{BroadcastBus, LocalBus};
pub use config::ChatConfig;
pub use error::{Error, Result, StorageError};
pub use event::BusEvent;
pub use store::{KeyValueStore, MemoryStore, SqliteStore};
pub use system::{PeerChatSystem, SendOutcome};
pub use types::{
    ADMIN, BROADCAST_RECIPIENT, Message, PendingPermissionRequest, PersistedState, User,
    UserProfile, is_implicitly_trusted,
};
