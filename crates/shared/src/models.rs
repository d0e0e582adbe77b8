//! Payload models carried inside frames and published on the event bus.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// --- Messages ---

/// A chat message as delivered by the messaging service, either over the
/// `messages` socket or as the response of the HTTP send endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub read: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
    /// Echo of the client id the sender attached, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

/// Where an outgoing message is addressed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "kind", content = "id", rename_all = "camelCase")]
pub enum Recipient {
    User(String),
    Group(String),
}

impl Recipient {
    pub fn id(&self) -> &str {
        match self {
            Recipient::User(id) | Recipient::Group(id) => id,
        }
    }
}

/// Outgoing message body, used by both the socket frame and the HTTP fallback.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    pub content: String,
    pub client_id: String,
}

impl OutgoingMessage {
    pub fn new(recipient: &Recipient, content: impl Into<String>) -> Self {
        let (recipient_id, group_id) = match recipient {
            Recipient::User(id) => (Some(id.clone()), None),
            Recipient::Group(id) => (None, Some(id.clone())),
        };
        Self {
            recipient_id,
            group_id,
            content: content.into(),
            client_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn recipient(&self) -> Recipient {
        match (&self.recipient_id, &self.group_id) {
            (_, Some(group)) => Recipient::Group(group.clone()),
            (Some(user), None) => Recipient::User(user.clone()),
            (None, None) => Recipient::User(String::new()),
        }
    }
}

/// Published on `message-sent` once a message left the client, whichever
/// transport carried it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessageSent {
    pub client_id: String,
    pub recipient: Recipient,
    pub content: String,
    pub sent_at: DateTime<Utc>,
}

impl MessageSent {
    pub fn from_outgoing(msg: &OutgoingMessage, sent_at: DateTime<Utc>) -> Self {
        Self {
            client_id: msg.client_id.clone(),
            recipient: msg.recipient(),
            content: msg.content.clone(),
            sent_at,
        }
    }
}

/// Published on `retry-failed-message` when the HTTP fallback could not
/// deliver. Retrying is left to the caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RetryFailedMessage {
    pub recipient_id: String,
    pub content: String,
    pub client_id: String,
    pub reason: String,
}

// --- Typing ---

/// Payload of `typing` and `stop_typing` frames.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TypingEvent {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
}

/// Typing state change as published on `typing-status-changed`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TypingStatus {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    pub is_typing: bool,
}

impl TypingStatus {
    pub fn from_event(event: TypingEvent, is_typing: bool) -> Self {
        Self {
            user_id: event.user_id,
            recipient_id: event.recipient_id,
            group_id: event.group_id,
            is_typing,
        }
    }
}

/// Outgoing typing indicator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TypingIndicator {
    pub recipient_id: String,
}

// --- Presence ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum Availability {
    Online,
    Away,
    Busy,
    #[default]
    Offline,
    #[serde(other)]
    Unknown,
}

/// Payload of `status` frames, published on `user-status-changed`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub user_id: String,
    pub status: Availability,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

// --- Read receipts / unread counts ---

/// Payload of `read` frames, published on `messages-read`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    pub message_ids: Vec<String>,
    pub reader_id: String,
    pub read_at: DateTime<Utc>,
}

/// Outgoing request to mark messages read.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReadRequest {
    pub message_ids: Vec<String>,
}

/// Payload of `unread_count` frames, published on `unread-counts-updated`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct UnreadCounts {
    #[serde(default)]
    pub total: u32,
    /// Unread count keyed by conversation (user or group) id.
    #[serde(default)]
    pub by_conversation: HashMap<String, u32>,
}

// --- Errors ---

/// Payload of `error` frames, published on `server-error`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub message: String,
}
