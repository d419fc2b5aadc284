mod events;
mod membership;
mod outbox;
mod registry;
mod ws;

use std::sync::Arc;

use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

use crate::{
    db::{ChatId, ConnectionId, MessageId, NewMessage, UserId},
    error::{RelayError, RelayResult, StoreError},
    store::{MessageStore, PresenceStore, Store},
};

pub use events::{Inbound, Outbound, RawFrame, StatusUpdate, parse_id};
pub use membership::RoomMembership;
pub use outbox::{DEFAULT_OUTBOUND_CAPACITY, Outbox, OutboundReceiver, OutboundSender};
pub use registry::{Bound, ConnectionRegistry, Released, SessionPolicy};
pub use ws::relay_ws;

/// Where a connection is in its lifetime, as seen by the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepted by the transport, no user announced.
    Connected,
    Identified { user_id: UserId },
    InRoom { user_id: Option<UserId>, rooms: Vec<ChatId> },
    Disconnected,
}

/// Routes inbound events to the stores and fans the results out to connections.
///
/// Registry, membership and outbox locks are only held across map access,
/// never across a store call, so a slow store stalls one event and nothing else.
pub struct Relay {
    store: Arc<dyn Store>,
    registry: ConnectionRegistry,
    membership: RoomMembership,
    outbox: Outbox,
}

impl Relay {
    pub fn new(store: Arc<dyn Store>, policy: SessionPolicy) -> Self {
        Self {
            store,
            registry: ConnectionRegistry::new(policy),
            membership: RoomMembership::new(),
            outbox: Outbox::new(),
        }
    }

    /// Caps how many events may queue up for one connection before new ones are dropped.
    pub fn with_outbound_capacity(mut self, capacity: usize) -> Self {
        self.outbox = Outbox::with_capacity(capacity);
        self
    }

    pub fn store(&self) -> &dyn Store {
        &*self.store
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn membership(&self) -> &RoomMembership {
        &self.membership
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub async fn connect(&self, connection_id: ConnectionId, sender: OutboundSender) {
        self.outbox.register(connection_id, sender).await;
        self.membership.open(connection_id).await;
        self.registry.open(connection_id).await;
        info!(%connection_id, "connected");
    }

    pub async fn state(&self, connection_id: ConnectionId) -> ConnectionState {
        if !self.outbox.is_registered(connection_id).await {
            return ConnectionState::Disconnected;
        }

        let user_id = self.registry.lookup_user_by_connection(connection_id).await;
        let mut rooms: Vec<_> = self.membership.rooms_of(connection_id).await.into_iter().collect();
        rooms.sort();

        match (user_id, rooms.is_empty()) {
            (None, true) => ConnectionState::Connected,
            (Some(user_id), true) => ConnectionState::Identified { user_id },
            (user_id, false) => ConnectionState::InRoom { user_id, rooms },
        }
    }

    /// Decodes and handles one text frame.
    pub async fn handle_frame(&self, connection_id: ConnectionId, text: &str) {
        match Inbound::from_json(text) {
            Ok(event) => self.handle(connection_id, event).await,
            Err(err) => warn!(%connection_id, %err, "dropping frame"),
        }
    }

    /// Handles one event. Failures are logged and the event dropped; they never
    /// reach other connections or the client.
    pub async fn handle(&self, connection_id: ConnectionId, event: Inbound) {
        let name = event.name();
        let closed = event != Inbound::Disconnect && !self.outbox.is_registered(connection_id).await;
        let result = match event {
            Inbound::Disconnect => self.disconnect(connection_id).await,
            _ if closed => Err(RelayError::validation(name, "connection is closed")),
            Inbound::UserOnline { user_id } => self.user_online(connection_id, user_id).await,
            Inbound::JoinChat { chat_id } => self.join_chat(connection_id, chat_id).await,
            Inbound::Message(message) => self.send_message(connection_id, message).await,
            Inbound::MessageDeleted { message_id, chat_id } => {
                self.delete_message(connection_id, message_id, chat_id).await
            }
        };

        match result {
            Ok(()) => {}
            Err(err @ (RelayError::Validation { .. } | RelayError::Parse { .. })) => {
                warn!(%connection_id, event = name, %err, "dropping event")
            }
            Err(err @ RelayError::Store(_)) => {
                error!(%connection_id, event = name, %err, "dropping event")
            }
        }
    }

    async fn user_online(&self, connection_id: ConnectionId, user_id: UserId) -> RelayResult<()> {
        let Some(Bound { displaced, previous }) = self.registry.set_online(user_id, connection_id).await else {
            return Err(RelayError::validation("userOnline", "connection is closed"));
        };
        if !displaced.is_empty() {
            info!(user_id, ?displaced, "user moved to a newer connection");
        }
        if let Some(previous) = previous {
            info!(%connection_id, from = previous.user_id, to = user_id, "connection switched user");
            if let Err(err) = self.release_presence(connection_id, previous).await {
                error!(%connection_id, user_id = previous.user_id, %err, "cannot mark previous user offline");
            }
        }

        self.store.upsert(user_id, true).await?;
        let record = self
            .store
            .get(user_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("status of user {user_id}")))?;

        info!(%connection_id, user_id, "user online");
        self.outbox
            .broadcast_except(connection_id, Outbound::UserStatusUpdate(record.into()))
            .await;
        Ok(())
    }

    async fn join_chat(&self, connection_id: ConnectionId, chat_id: ChatId) -> RelayResult<()> {
        if !self.membership.join(chat_id, connection_id).await {
            return Err(RelayError::validation("joinChat", "connection is closed"));
        }
        info!(%connection_id, chat_id, "joined chat");

        let messages = self.store.list_by_chat(chat_id).await?;
        debug!(%connection_id, chat_id, count = messages.len(), "sending old messages");
        self.outbox.unicast(connection_id, Outbound::OldMessages(messages)).await;
        Ok(())
    }

    async fn send_message(&self, connection_id: ConnectionId, message: NewMessage) -> RelayResult<()> {
        let chat_id = message.chat_id;
        let message = self.store.create(message).await?;
        debug!(%connection_id, chat_id, message_id = message.id, "message stored");

        let targets = self.membership.members_except(chat_id, connection_id).await;
        self.outbox.multicast(targets, Outbound::NewMessage(message.clone())).await;
        self.outbox.unicast(connection_id, Outbound::Message(message)).await;
        Ok(())
    }

    async fn delete_message(
        &self,
        connection_id: ConnectionId,
        message_id: MessageId,
        chat_id: ChatId,
    ) -> RelayResult<()> {
        self.store.delete_by_id(message_id).await?;
        info!(%connection_id, chat_id, message_id, "message deleted");

        let targets = self.membership.members_except(chat_id, connection_id).await;
        self.outbox.multicast(targets, Outbound::MessageDeleted(message_id)).await;
        Ok(())
    }

    /// Tears the connection down. Safe to call more than once.
    ///
    /// The connection stops being a fan-out target before any store call, so
    /// nothing emitted afterwards can reach it.
    pub async fn disconnect(&self, connection_id: ConnectionId) -> RelayResult<()> {
        let was_connected = self.outbox.unregister(connection_id).await;
        let rooms = self.membership.leave_all(connection_id).await;
        let released = self.registry.release(connection_id).await;
        if was_connected {
            info!(%connection_id, ?rooms, "disconnected");
        }

        match released {
            Some(released) => self.release_presence(connection_id, released).await,
            None => Ok(()),
        }
    }

    /// Marks a user offline once `connection_id` no longer speaks for them,
    /// unless another connection still does.
    async fn release_presence(
        &self,
        connection_id: ConnectionId,
        Released { user_id, still_online }: Released,
    ) -> RelayResult<()> {
        if still_online {
            debug!(user_id, "user still has other connections");
            return Ok(());
        }

        let now = OffsetDateTime::now_utc();
        self.store.set_offline(user_id, now).await?;
        let update = match self.store.get(user_id).await? {
            Some(record) => StatusUpdate::from(record),
            None => StatusUpdate { user_id, is_online: false, last_seen: now },
        };

        info!(user_id, "user offline");
        self.outbox
            .broadcast_except(connection_id, Outbound::UserStatusUpdate(update))
            .await;
        Ok(())
    }

    /// Disconnects every live connection, marking their users offline.
    pub async fn shutdown(&self) {
        for connection_id in self.outbox.connection_ids().await {
            self.handle(connection_id, Inbound::Disconnect).await;
        }
    }
}
