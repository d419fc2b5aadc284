//! Wire events.
//!
//! Every frame is a JSON object `{"event": <name>, "data": <payload>}`. Inbound
//! frames are decoded loosely first and then validated into [`Inbound`], so
//! business logic only ever sees typed, parsed identifiers.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::{
    GetField,
    db::{ChatId, Message, MessageId, NewMessage, PresenceRecord, UserId},
    error::{RelayError, RelayResult},
};

#[derive(Debug, Deserialize)]
pub struct RawFrame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    UserOnline { user_id: UserId },
    JoinChat { chat_id: ChatId },
    Message(NewMessage),
    MessageDeleted { message_id: MessageId, chat_id: ChatId },
    Disconnect,
}

impl Inbound {
    pub fn name(&self) -> &'static str {
        match self {
            Inbound::UserOnline { .. } => "userOnline",
            Inbound::JoinChat { .. } => "joinChat",
            Inbound::Message(_) => "message",
            Inbound::MessageDeleted { .. } => "messageDeleted",
            Inbound::Disconnect => "disconnect",
        }
    }

    pub fn from_json(text: &str) -> RelayResult<Inbound> {
        let frame: RawFrame = serde_json::from_str(text)
            .map_err(|err| RelayError::validation("frame", err.to_string()))?;
        Inbound::try_from(frame)
    }
}

impl TryFrom<RawFrame> for Inbound {
    type Error = RelayError;

    fn try_from(RawFrame { event, data }: RawFrame) -> RelayResult<Inbound> {
        match event.as_str() {
            "userOnline" => Ok(Inbound::UserOnline {
                user_id: parse_id("userOnline", "userId", &data, false)?,
            }),
            "joinChat" => Ok(Inbound::JoinChat {
                chat_id: parse_id("joinChat", "chatId", &data, true)?,
            }),
            "message" => Ok(Inbound::Message(NewMessage {
                chat_id: data.get_id_field("message", "chatId")?,
                sender_id: data.get_id_field("message", "senderId")?,
                text: data.get_str_field("message", "text")?,
                reply_to_id: data.get_opt_id_field("replyToId")?,
            })),
            "messageDeleted" => Ok(Inbound::MessageDeleted {
                message_id: data.get_id_field("messageDeleted", "messageId")?,
                chat_id: data.get_id_field("messageDeleted", "chatId")?,
            }),
            "disconnect" => Ok(Inbound::Disconnect),
            other => Err(RelayError::validation("frame", format!("unknown event {other:?}"))),
        }
    }
}

/// Parses an id that may arrive as a number or a string of digits.
///
/// `null`, `""` and (when `truthy`) `0` count as missing.
pub fn parse_id(event: &'static str, field: &'static str, value: &Value, truthy: bool) -> RelayResult<i64> {
    let id = match value {
        Value::Null => None,
        Value::Number(n) => Some(n.as_i64().ok_or_else(|| RelayError::parse(field, n))?),
        Value::String(s) if s.trim().is_empty() => None,
        Value::String(s) => Some(s.trim().parse::<i64>().map_err(|_| RelayError::parse(field, s))?),
        other => return Err(RelayError::parse(field, other)),
    };

    match id {
        Some(0) if truthy => Err(RelayError::validation(event, format!("{field} is missing"))),
        Some(id) => Ok(id),
        None => Err(RelayError::validation(event, format!("{field} is missing"))),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub user_id: UserId,
    pub is_online: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
}

impl From<PresenceRecord> for StatusUpdate {
    fn from(PresenceRecord { user_id, is_online, last_seen }: PresenceRecord) -> Self {
        Self { user_id, is_online, last_seen }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum Outbound {
    UserStatusUpdate(StatusUpdate),
    OldMessages(Vec<Message>),
    NewMessage(Message),
    /// Acknowledgment to the sender; same payload as [`Outbound::NewMessage`].
    Message(Message),
    MessageDeleted(MessageId),
}

impl Outbound {
    pub fn name(&self) -> &'static str {
        match self {
            Outbound::UserStatusUpdate(_) => "userStatusUpdate",
            Outbound::OldMessages(_) => "oldMessages",
            Outbound::NewMessage(_) => "newMessage",
            Outbound::Message(_) => "message",
            Outbound::MessageDeleted(_) => "messageDeleted",
        }
    }
}
