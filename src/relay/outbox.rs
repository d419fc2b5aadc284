use std::collections::HashMap;

use tokio::sync::{RwLock, mpsc};
use tracing::{debug, trace, warn};

use crate::db::ConnectionId;

use super::events::Outbound;

pub type OutboundSender = mpsc::Sender<Outbound>;
pub type OutboundReceiver = mpsc::Receiver<Outbound>;

pub const DEFAULT_OUTBOUND_CAPACITY: usize = 64;

/// Outbound queues of every live connection. Sending never blocks: each
/// connection drains its own bounded queue into its socket, and an event that
/// finds the queue full is dropped for that connection.
pub struct Outbox {
    capacity: usize,
    connections: RwLock<HashMap<ConnectionId, OutboundSender>>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_OUTBOUND_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// A queue sized for this outbox, to hand to [`Outbox::register`].
    pub fn channel(&self) -> (OutboundSender, OutboundReceiver) {
        mpsc::channel(self.capacity)
    }

    pub async fn register(&self, connection_id: ConnectionId, sender: OutboundSender) {
        self.connections.write().await.insert(connection_id, sender);
    }

    pub async fn unregister(&self, connection_id: ConnectionId) -> bool {
        self.connections.write().await.remove(&connection_id).is_some()
    }

    pub async fn is_registered(&self, connection_id: ConnectionId) -> bool {
        self.connections.read().await.contains_key(&connection_id)
    }

    pub async fn connection_ids(&self) -> Vec<ConnectionId> {
        self.connections.read().await.keys().copied().collect()
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn unicast(&self, connection_id: ConnectionId, event: Outbound) -> bool {
        let connections = self.connections.read().await;
        let Some(sender) = connections.get(&connection_id) else {
            trace!(%connection_id, event = event.name(), "unicast to unknown connection");
            return false;
        };
        deliver(connection_id, sender, event)
    }

    /// Sends to each target that is still connected. Returns how many got it.
    pub async fn multicast(&self, targets: impl IntoIterator<Item = ConnectionId>, event: Outbound) -> usize {
        let connections = self.connections.read().await;
        let name = event.name();
        let sent = targets
            .into_iter()
            .filter_map(|c| connections.get_key_value(&c))
            .filter(|(c, sender)| deliver(**c, sender, event.clone()))
            .count();
        debug!(event = name, sent, "multicast");
        sent
    }

    /// Sends to every connection except `excluded`.
    pub async fn broadcast_except(&self, excluded: ConnectionId, event: Outbound) -> usize {
        let connections = self.connections.read().await;
        let name = event.name();
        let sent = connections
            .iter()
            .filter(|(c, _)| **c != excluded)
            .filter(|(c, sender)| deliver(**c, sender, event.clone()))
            .count();
        debug!(event = name, sent, "broadcast");
        sent
    }
}

impl Default for Outbox {
    fn default() -> Self {
        Self::new()
    }
}

fn deliver(connection_id: ConnectionId, sender: &OutboundSender, event: Outbound) -> bool {
    match sender.try_send(event) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(event)) => {
            warn!(%connection_id, event = event.name(), "outbound queue full, dropping event");
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}
