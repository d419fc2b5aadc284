use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::{
    db::{ChatId, Message, MessageId, NewMessage, PresenceRecord, UserId, UserSnapshot},
    error::StoreError,
};

use super::{MessageStore, PresenceStore, StoreResult};

#[derive(Default)]
struct State {
    users: HashMap<UserId, String>,
    presence: HashMap<UserId, PresenceRecord>,
    messages: BTreeMap<MessageId, Message>,
    last_id: MessageId,
}

/// Process-local store with the same contracts as [`super::SqliteStore`].
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_user(&self, id: UserId, name: &str) {
        self.state.write().await.users.insert(id, name.to_owned());
    }
}

#[async_trait]
impl PresenceStore for MemoryStore {
    async fn upsert(&self, user_id: UserId, is_online: bool) -> StoreResult<()> {
        self.state
            .write()
            .await
            .presence
            .entry(user_id)
            .and_modify(|record| record.is_online = is_online)
            .or_insert_with(|| PresenceRecord {
                user_id,
                is_online,
                last_seen: OffsetDateTime::now_utc(),
            });
        Ok(())
    }

    async fn get(&self, user_id: UserId) -> StoreResult<Option<PresenceRecord>> {
        Ok(self.state.read().await.presence.get(&user_id).cloned())
    }

    async fn set_offline(&self, user_id: UserId, last_seen: OffsetDateTime) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let record = state
            .presence
            .get_mut(&user_id)
            .ok_or_else(|| StoreError::NotFound(format!("status of user {user_id}")))?;
        record.is_online = false;
        record.last_seen = last_seen;
        Ok(())
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn create(&self, message: NewMessage) -> StoreResult<Message> {
        let NewMessage { chat_id, sender_id, text, reply_to_id } = message;
        let mut state = self.state.write().await;

        let sender = state
            .users
            .get(&sender_id)
            .map(|name| UserSnapshot { id: sender_id, name: name.clone() })
            .ok_or_else(|| StoreError::NotFound(format!("user {sender_id}")))?;

        let reply_to = match reply_to_id {
            Some(reply_to_id) => Some(
                state
                    .messages
                    .get(&reply_to_id)
                    .filter(|m| m.chat_id == chat_id)
                    .map(Message::as_reply)
                    .ok_or_else(|| StoreError::NotFound(format!("message {reply_to_id} in chat {chat_id}")))?,
            ),
            None => None,
        };

        state.last_id += 1;
        let message = Message {
            id: state.last_id,
            chat_id,
            sender_id,
            text,
            reply_to_id,
            created_at: OffsetDateTime::now_utc(),
            sender,
            reply_to,
        };
        state.messages.insert(message.id, message.clone());

        Ok(message)
    }

    async fn list_by_chat(&self, chat_id: ChatId) -> StoreResult<Vec<Message>> {
        Ok(self
            .state
            .read()
            .await
            .messages
            .values()
            .filter(|m| m.chat_id == chat_id)
            .cloned()
            .collect())
    }

    async fn delete_by_id(&self, message_id: MessageId) -> StoreResult<()> {
        let mut state = self.state.write().await;
        state
            .messages
            .remove(&message_id)
            .ok_or_else(|| StoreError::NotFound(format!("message {message_id}")))?;

        // same as ON DELETE SET NULL
        for message in state.messages.values_mut() {
            if message.reply_to_id == Some(message_id) {
                message.reply_to_id = None;
                message.reply_to = None;
            }
        }
        Ok(())
    }
}
