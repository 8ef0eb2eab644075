//! Archived message model.
//!
//! A `MessageRecord` is what lands in `<ts>[_<chat>_<msg>].json` for every
//! inbound event. The raw platform payload is kept verbatim under `event`.

use serde::{Deserialize, Serialize};

/// Telegram chat id (numeric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChatId(pub i64);

/// Telegram message id (numeric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub i32);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sender {
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub first_name: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Photo,
    Document,
    Other,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessageRecord {
    pub chat_id: ChatId,
    pub message_id: MessageId,
    /// Unix seconds of the message as reported by the platform.
    pub timestamp: i64,
    /// RFC 3339 UTC time at which the bot persisted the record.
    pub received_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender: Option<Sender>,
    pub kind: MessageKind,
    /// Names of the attachment items stored alongside this record.
    #[serde(default)]
    pub attachments: Vec<String>,
    pub event: serde_json::Value,
}

impl MessageRecord {
    /// Discriminator appended to the record's file name so that two messages
    /// sharing a timestamp never overwrite each other.
    pub fn discriminator(&self) -> String {
        format!("{}_{}", self.chat_id.0, self.message_id.0)
    }
}
