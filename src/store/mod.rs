mod memory;
mod sqlite;

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::{
    db::{ChatId, Message, MessageId, NewMessage, PresenceRecord, UserId},
    error::StoreError,
};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Marks the user online, creating the record (with `last_seen` = now) if absent.
    async fn upsert(&self, user_id: UserId, is_online: bool) -> StoreResult<()>;

    async fn get(&self, user_id: UserId) -> StoreResult<Option<PresenceRecord>>;

    /// Fails with [`StoreError::NotFound`] when the user never announced.
    async fn set_offline(&self, user_id: UserId, last_seen: OffsetDateTime) -> StoreResult<()>;
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persists the message and returns it with `sender`/`reply_to` filled in.
    /// Fails with [`StoreError::NotFound`] for an unknown sender, or a
    /// `reply_to_id` that is not a message of the same chat.
    async fn create(&self, message: NewMessage) -> StoreResult<Message>;

    /// Ascending by id.
    async fn list_by_chat(&self, chat_id: ChatId) -> StoreResult<Vec<Message>>;

    async fn delete_by_id(&self, message_id: MessageId) -> StoreResult<()>;

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}

pub trait Store: PresenceStore + MessageStore {}

impl<T: PresenceStore + MessageStore> Store for T {}
