use async_trait::async_trait;
use sqlx::SqlitePool;
use time::OffsetDateTime;

use crate::{
    db::{ChatId, Message, MessageId, NewMessage, PresenceRecord, ReplySnapshot, UserId, UserSnapshot},
    error::StoreError,
};

use super::{MessageStore, PresenceStore, StoreResult};

const SELECT_MESSAGE: &str = "
    SELECT
        m.id, m.chat_id, m.sender_id, m.text, m.reply_to_id, m.created_at,
        u.name AS sender_name,
        r.id AS reply_id, r.chat_id AS reply_chat_id, r.sender_id AS reply_sender_id,
        r.text AS reply_text, r.created_at AS reply_created_at,
        ru.name AS reply_sender_name
    FROM messages m
    JOIN users u ON u.id = m.sender_id
    LEFT JOIN messages r ON r.id = m.reply_to_id
    LEFT JOIN users ru ON ru.id = r.sender_id";

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: MessageId,
    chat_id: ChatId,
    sender_id: UserId,
    text: String,
    reply_to_id: Option<MessageId>,
    created_at: OffsetDateTime,
    sender_name: String,

    reply_id: Option<MessageId>,
    reply_chat_id: Option<ChatId>,
    reply_sender_id: Option<UserId>,
    reply_text: Option<String>,
    reply_created_at: Option<OffsetDateTime>,
    reply_sender_name: Option<String>,
}

impl From<MessageRow> for Message {
    fn from(row: MessageRow) -> Self {
        let reply_to = match (
            row.reply_id,
            row.reply_chat_id,
            row.reply_sender_id,
            row.reply_text,
            row.reply_created_at,
            row.reply_sender_name,
        ) {
            (Some(id), Some(chat_id), Some(sender_id), Some(text), Some(created_at), Some(name)) => Some(ReplySnapshot {
                id,
                chat_id,
                sender_id,
                text,
                created_at,
                sender: UserSnapshot { id: sender_id, name },
            }),
            _ => None,
        };

        Message {
            id: row.id,
            chat_id: row.chat_id,
            sender_id: row.sender_id,
            text: row.text,
            reply_to_id: row.reply_to_id,
            created_at: row.created_at,
            sender: UserSnapshot {
                id: row.sender_id,
                name: row.sender_name,
            },
            reply_to,
        }
    }
}

/// Presence and messages persisted in SQLite through sqlx.
#[derive(Clone)]
pub struct SqliteStore {
    db_pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(db_pool: SqlitePool) -> Self {
        Self { db_pool }
    }

    pub async fn add_user(&self, id: UserId, name: &str) -> StoreResult<()> {
        sqlx::query("INSERT INTO users (id,name) VALUES (?,?) ON CONFLICT(id) DO UPDATE SET name=excluded.name")
            .bind(id)
            .bind(name)
            .execute(&self.db_pool)
            .await?;
        Ok(())
    }

    async fn find_message(&self, id: MessageId) -> StoreResult<Option<Message>> {
        let row: Option<MessageRow> = sqlx::query_as(&format!("{SELECT_MESSAGE} WHERE m.id=?"))
            .bind(id)
            .fetch_optional(&self.db_pool)
            .await?;
        Ok(row.map(Message::from))
    }
}

#[async_trait]
impl PresenceStore for SqliteStore {
    async fn upsert(&self, user_id: UserId, is_online: bool) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO user_status (user_id,is_online,last_seen) VALUES (?,?,?)
             ON CONFLICT(user_id) DO UPDATE SET is_online=excluded.is_online",
        )
        .bind(user_id)
        .bind(is_online)
        .bind(OffsetDateTime::now_utc())
        .execute(&self.db_pool)
        .await?;
        Ok(())
    }

    async fn get(&self, user_id: UserId) -> StoreResult<Option<PresenceRecord>> {
        let row: Option<(bool, OffsetDateTime)> =
            sqlx::query_as("SELECT is_online,last_seen FROM user_status WHERE user_id=?")
                .bind(user_id)
                .fetch_optional(&self.db_pool)
                .await?;

        Ok(row.map(|(is_online, last_seen)| PresenceRecord { user_id, is_online, last_seen }))
    }

    async fn set_offline(&self, user_id: UserId, last_seen: OffsetDateTime) -> StoreResult<()> {
        let result = sqlx::query("UPDATE user_status SET is_online=FALSE, last_seen=? WHERE user_id=?")
            .bind(last_seen)
            .bind(user_id)
            .execute(&self.db_pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("status of user {user_id}")));
        }
        Ok(())
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn create(&self, message: NewMessage) -> StoreResult<Message> {
        let NewMessage { chat_id, sender_id, text, reply_to_id } = message;

        let sender: Option<(UserId,)> = sqlx::query_as("SELECT id FROM users WHERE id=?")
            .bind(sender_id)
            .fetch_optional(&self.db_pool)
            .await?;
        if sender.is_none() {
            return Err(StoreError::NotFound(format!("user {sender_id}")));
        }

        if let Some(reply_to_id) = reply_to_id {
            let exists: Option<(MessageId,)> = sqlx::query_as("SELECT id FROM messages WHERE id=? AND chat_id=?")
                .bind(reply_to_id)
                .bind(chat_id)
                .fetch_optional(&self.db_pool)
                .await?;
            if exists.is_none() {
                return Err(StoreError::NotFound(format!("message {reply_to_id} in chat {chat_id}")));
            }
        }

        let id = sqlx::query("INSERT INTO messages (chat_id,sender_id,text,reply_to_id,created_at) VALUES (?,?,?,?,?)")
            .bind(chat_id)
            .bind(sender_id)
            .bind(&text)
            .bind(reply_to_id)
            .bind(OffsetDateTime::now_utc())
            .execute(&self.db_pool)
            .await?
            .last_insert_rowid();

        self.find_message(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("message {id}")))
    }

    async fn list_by_chat(&self, chat_id: ChatId) -> StoreResult<Vec<Message>> {
        let rows: Vec<MessageRow> = sqlx::query_as(&format!("{SELECT_MESSAGE} WHERE m.chat_id=? ORDER BY m.id ASC"))
            .bind(chat_id)
            .fetch_all(&self.db_pool)
            .await?;
        Ok(rows.into_iter().map(Message::from).collect())
    }

    async fn delete_by_id(&self, message_id: MessageId) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM messages WHERE id=?")
            .bind(message_id)
            .execute(&self.db_pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("message {message_id}")));
        }
        Ok(())
    }

    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.db_pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use sqlx::sqlite::SqlitePoolOptions;

    use super::*;

    async fn store() -> SqliteStore {
        // one connection, otherwise every pooled connection opens its own in-memory db
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::db::migrate(&pool).await.unwrap();
        let store = SqliteStore::new(pool);
        store.add_user(1, "Alice").await.unwrap();
        store.add_user(2, "Bob").await.unwrap();
        store
    }

    fn new_message(chat_id: ChatId, sender_id: UserId, text: &str, reply_to_id: Option<MessageId>) -> NewMessage {
        NewMessage { chat_id, sender_id, text: text.to_owned(), reply_to_id }
    }

    #[tokio::test]
    async fn upsert_keeps_last_seen_and_set_offline_updates_it() {
        let store = store().await;

        store.upsert(42, true).await.unwrap();
        let first = store.get(42).await.unwrap().unwrap();
        assert!(first.is_online);

        let later = first.last_seen + time::Duration::minutes(5);
        store.set_offline(42, later).await.unwrap();
        let offline = store.get(42).await.unwrap().unwrap();
        assert!(!offline.is_online);
        assert_eq!(offline.last_seen, later);

        store.upsert(42, true).await.unwrap();
        let again = store.get(42).await.unwrap().unwrap();
        assert!(again.is_online);
        assert_eq!(again.last_seen, later);
    }

    #[tokio::test]
    async fn set_offline_without_record_is_not_found() {
        let store = store().await;
        let err = store.set_offline(7, OffsetDateTime::now_utc()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn create_denormalizes_sender_and_reply() {
        let store = store().await;

        let first = store.create(new_message(7, 1, "hi", None)).await.unwrap();
        assert_eq!(first.sender.name, "Alice");
        assert!(first.reply_to.is_none());

        let reply = store.create(new_message(7, 2, "hey", Some(first.id))).await.unwrap();
        assert_eq!(reply.reply_to_id, Some(first.id));
        let reply_to = reply.reply_to.unwrap();
        assert_eq!(reply_to.text, "hi");
        assert_eq!(reply_to.sender.name, "Alice");
        assert_eq!(reply.sender.name, "Bob");
    }

    #[tokio::test]
    async fn unknown_sender_is_rejected() {
        let store = store().await;
        let err = store.create(new_message(7, 99, "who", None)).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        assert!(store.list_by_chat(7).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn deleting_a_reply_target_sets_the_reply_null() {
        let store = store().await;
        let original = store.create(new_message(7, 1, "hi", None)).await.unwrap();
        let reply = store.create(new_message(7, 2, "hey", Some(original.id))).await.unwrap();

        store.delete_by_id(original.id).await.unwrap();

        let left = store.list_by_chat(7).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, reply.id);
        assert_eq!(left[0].reply_to_id, None);
        assert!(left[0].reply_to.is_none());
        assert_eq!(left[0].sender.name, "Bob");
    }

    #[tokio::test]
    async fn reply_across_chats_is_rejected() {
        let store = store().await;
        let other = store.create(new_message(8, 1, "elsewhere", None)).await.unwrap();

        let err = store.create(new_message(7, 1, "nope", Some(other.id))).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        assert!(store.list_by_chat(7).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_is_ascending_and_scoped_to_chat() {
        let store = store().await;
        for text in ["a", "b", "c"] {
            store.create(new_message(7, 1, text, None)).await.unwrap();
            store.create(new_message(8, 2, text, None)).await.unwrap();
        }

        let messages = store.list_by_chat(7).await.unwrap();
        let ids: Vec<_> = messages.iter().map(|m| m.id).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
        assert_eq!(messages.iter().map(|m| m.text.as_str()).collect::<Vec<_>>(), ["a", "b", "c"]);
        assert!(messages.iter().all(|m| m.chat_id == 7));
    }

    #[tokio::test]
    async fn delete_missing_is_not_found() {
        let store = store().await;
        let message = store.create(new_message(7, 1, "bye", None)).await.unwrap();

        store.delete_by_id(message.id).await.unwrap();
        assert!(store.list_by_chat(7).await.unwrap().is_empty());

        let err = store.delete_by_id(message.id).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
