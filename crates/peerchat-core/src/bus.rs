//! The broadcast bus shared by every instance of one origin.

use tokio::sync::broadcast;

use crate::error::{Error, Result};
use crate::event::BusEvent;

/// Default channel capacity. A receiver that falls this far behind lags.
pub const DEFAULT_CAPACITY: usize = 256;

/// Publish/subscribe transport for [`BusEvent`]s.
///
/// Every subscriber, including the publisher's own subscription, receives
/// every event published after it subscribed. There is no acknowledgement,
/// retry or ordering guarantee across publishers.
pub trait BroadcastBus: Send + Sync {
    fn publish(&self, event: &BusEvent) -> Result<()>;

    fn subscribe(&self) -> broadcast::Receiver<BusEvent>;
}

/// In-process bus backed by a tokio broadcast channel.
///
/// Clones share the same channel, so one `LocalBus` stands for one origin and
/// each clone handed to a `PeerChatSystem` acts as one tab.
#[derive(Clone)]
pub struct LocalBus {
    tx: broadcast::Sender<BusEvent>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastBus for LocalBus {
    fn publish(&self, event: &BusEvent) -> Result<()> {
        self.tx
            .send(event.clone())
            .map(|_| ())
            .map_err(|_| Error::Bus(format!("no subscribers for {}", event.kind())))
    }

    fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }
}
