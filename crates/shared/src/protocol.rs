//! Socket frame definitions, codec and close-code taxonomy.
//!
//! Every frame on the wire is a JSON object `{ "type": <kind>, "data": <object> }`.
//! Subscription control frames use `{ "action": "subscribe"|"unsubscribe", "channel": <topic> }`.

use serde::{Deserialize, Serialize};

use crate::error::FrameError;
use crate::models::{
    ChatMessage, ErrorFrame, OutgoingMessage, ReadReceipt, ReadRequest, StatusUpdate,
    TypingEvent, TypingIndicator, UnreadCounts,
};

/// Known frame kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Message,
    Typing,
    StopTyping,
    Status,
    Read,
    UnreadCount,
    Error,
}

impl FrameKind {
    pub const ALL: [FrameKind; 7] = [
        FrameKind::Message,
        FrameKind::Typing,
        FrameKind::StopTyping,
        FrameKind::Status,
        FrameKind::Read,
        FrameKind::UnreadCount,
        FrameKind::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FrameKind::Message => "message",
            FrameKind::Typing => "typing",
            FrameKind::StopTyping => "stop_typing",
            FrameKind::Status => "status",
            FrameKind::Read => "read",
            FrameKind::UnreadCount => "unread_count",
            FrameKind::Error => "error",
        }
    }

    pub fn parse(kind: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == kind)
    }
}

impl std::fmt::Display for FrameKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded server frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Message(ChatMessage),
    Typing(TypingEvent),
    StopTyping(TypingEvent),
    Status(StatusUpdate),
    Read(ReadReceipt),
    UnreadCount(UnreadCounts),
    Error(ErrorFrame),
    /// A kind this client does not know yet. Kept so callers can log it.
    Unknown {
        kind: String,
        data: serde_json::Value,
    },
}

/// The untyped envelope every frame is first parsed into.
#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

impl InboundFrame {
    /// Decode a text frame.
    ///
    /// The text must be a JSON object with a string `type`. For known kinds the
    /// `data` must match the payload shape, otherwise the frame is malformed.
    pub fn decode(text: &str) -> Result<Self, FrameError> {
        let raw: RawFrame =
            serde_json::from_str(text).map_err(|e| FrameError::Malformed(e.to_string()))?;

        let Some(kind) = FrameKind::parse(&raw.kind) else {
            return Ok(InboundFrame::Unknown {
                kind: raw.kind,
                data: raw.data,
            });
        };

        let payload_err = |e: serde_json::Error| FrameError::InvalidPayload {
            kind: kind.as_str(),
            reason: e.to_string(),
        };

        let data = raw.data;
        Ok(match kind {
            FrameKind::Message => {
                InboundFrame::Message(serde_json::from_value(data).map_err(payload_err)?)
            }
            FrameKind::Typing => {
                InboundFrame::Typing(serde_json::from_value(data).map_err(payload_err)?)
            }
            FrameKind::StopTyping => {
                InboundFrame::StopTyping(serde_json::from_value(data).map_err(payload_err)?)
            }
            FrameKind::Status => {
                InboundFrame::Status(serde_json::from_value(data).map_err(payload_err)?)
            }
            FrameKind::Read => {
                InboundFrame::Read(serde_json::from_value(data).map_err(payload_err)?)
            }
            FrameKind::UnreadCount => {
                InboundFrame::UnreadCount(serde_json::from_value(data).map_err(payload_err)?)
            }
            FrameKind::Error => {
                InboundFrame::Error(serde_json::from_value(data).map_err(payload_err)?)
            }
        })
    }

    /// The kind of this frame, `None` for unknown kinds.
    pub fn kind(&self) -> Option<FrameKind> {
        match self {
            InboundFrame::Message(_) => Some(FrameKind::Message),
            InboundFrame::Typing(_) => Some(FrameKind::Typing),
            InboundFrame::StopTyping(_) => Some(FrameKind::StopTyping),
            InboundFrame::Status(_) => Some(FrameKind::Status),
            InboundFrame::Read(_) => Some(FrameKind::Read),
            InboundFrame::UnreadCount(_) => Some(FrameKind::UnreadCount),
            InboundFrame::Error(_) => Some(FrameKind::Error),
            InboundFrame::Unknown { .. } => None,
        }
    }
}

/// Data frames a client sends.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientFrame {
    Message(OutgoingMessage),
    Typing(TypingIndicator),
    StopTyping(TypingIndicator),
    Read(ReadRequest),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionAction {
    Subscribe,
    Unsubscribe,
}

/// Subscription control frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ControlFrame {
    pub action: SubscriptionAction,
    pub channel: String,
}

impl ControlFrame {
    pub fn subscribe(topic: impl Into<String>) -> Self {
        Self {
            action: SubscriptionAction::Subscribe,
            channel: topic.into(),
        }
    }

    pub fn unsubscribe(topic: impl Into<String>) -> Self {
        Self {
            action: SubscriptionAction::Unsubscribe,
            channel: topic.into(),
        }
    }
}

/// Anything a channel can put on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum OutboundFrame {
    Data(ClientFrame),
    Control(ControlFrame),
}

impl OutboundFrame {
    pub fn encode(&self) -> Result<String, FrameError> {
        serde_json::to_string(self).map_err(|e| FrameError::Encode(e.to_string()))
    }
}

impl From<ClientFrame> for OutboundFrame {
    fn from(frame: ClientFrame) -> Self {
        OutboundFrame::Data(frame)
    }
}

impl From<ControlFrame> for OutboundFrame {
    fn from(frame: ControlFrame) -> Self {
        OutboundFrame::Control(frame)
    }
}

// --- Close codes ---

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const CLOSE_ABNORMAL: u16 = 1006;
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// Application range the backend uses for authentication failures.
pub const CLOSE_AUTH_RANGE: std::ops::RangeInclusive<u16> = 4000..=4099;

/// How a channel must react to a close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseClass {
    /// Deliberate closure, no reconnect.
    Normal,
    /// Token rejected, tear the session down instead of reconnecting.
    Authentication,
    /// Anything else, reconnect with backoff.
    Transient,
}

/// Classify a close code and reason.
///
/// Authentication wins over a normal code when the reason mentions auth or
/// the token, since some proxies close with 1000 and a descriptive reason.
pub fn classify_close(code: u16, reason: &str) -> CloseClass {
    let reason = reason.to_ascii_lowercase();
    if code == CLOSE_POLICY_VIOLATION
        || CLOSE_AUTH_RANGE.contains(&code)
        || reason.contains("auth")
        || reason.contains("token")
    {
        return CloseClass::Authentication;
    }
    match code {
        CLOSE_NORMAL | CLOSE_GOING_AWAY => CloseClass::Normal,
        _ => CloseClass::Transient,
    }
}
