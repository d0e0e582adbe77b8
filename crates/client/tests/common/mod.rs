#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chatwire_client::bus::Topic;
use chatwire_client::ws::{
    Channel, ChannelHooks, ChannelKind, ChannelSettings, ChannelStatus, ReconnectCounter,
};
use chatwire_client::{EventBus, MessageApi, RealtimeConfig, ReconnectConfig, SessionTokens};
use chatwire_shared::{ApiError, ChatMessage, OutgoingMessage};
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::watch;
use url::Url;

pub const MESSAGES: &str = "/ws/messages";
pub const PRESENCE: &str = "/ws/presence";

pub fn config() -> RealtimeConfig {
    RealtimeConfig {
        api_base: "http://chat.test".into(),
        ws_base: "ws://chat.test".into(),
        ..RealtimeConfig::default()
    }
}

pub fn settings(kind: ChannelKind) -> ChannelSettings {
    let path = match kind {
        ChannelKind::Messages => MESSAGES,
        ChannelKind::Presence => PRESENCE,
    };
    ChannelSettings {
        kind,
        endpoint: Url::parse(&format!("ws://chat.test{path}")).unwrap(),
        handshake_timeout: Duration::from_secs(10),
        reconnect: ReconnectConfig::default(),
    }
}

pub fn spawn_messages(
    transport: &chatwire_client::ws::transport::MemoryTransport,
    tokens: &SessionTokens,
    hooks: ChannelHooks,
) -> Channel {
    Channel::spawn(
        settings(ChannelKind::Messages),
        Arc::new(tokens.clone()),
        Arc::new(transport.clone()),
        ReconnectCounter::new(),
        hooks,
    )
}

/// Wait until the watched status satisfies `pred`.
pub async fn wait_status(
    mut rx: watch::Receiver<ChannelStatus>,
    pred: impl Fn(&ChannelStatus) -> bool,
) -> ChannelStatus {
    let waited = tokio::time::timeout(Duration::from_secs(300), rx.wait_for(|s| pred(s)))
        .await
        .expect("timed out waiting for channel status");
    let status = waited.expect("channel worker stopped").clone();
    status
}

/// Let spawned tasks run without moving far on the paused clock.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

/// Record every payload published on topic `T`.
pub fn record<T: Topic>(bus: &Arc<EventBus>) -> Arc<Mutex<Vec<T::Payload>>>
where
    T::Payload: Clone,
{
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    bus.on::<T>(move |payload| sink.lock().push(payload.clone()));
    seen
}

pub fn json(text: &str) -> serde_json::Value {
    serde_json::from_str(text).expect("client sent invalid JSON")
}

pub fn message_frame(id: &str, content: &str) -> String {
    serde_json::json!({
        "type": "message",
        "data": {
            "id": id,
            "senderId": "u2",
            "recipientId": "me",
            "content": content,
            "createdAt": "2024-05-01T10:00:00Z"
        }
    })
    .to_string()
}

/// HTTP endpoint double for the fallback path.
pub struct FakeApi {
    pub fail_with: Option<ApiError>,
    pub calls: Mutex<Vec<OutgoingMessage>>,
}

impl FakeApi {
    pub fn ok() -> Arc<Self> {
        Arc::new(Self {
            fail_with: None,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn failing(error: ApiError) -> Arc<Self> {
        Arc::new(Self {
            fail_with: Some(error),
            calls: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl MessageApi for FakeApi {
    async fn send_private_message(&self, msg: &OutgoingMessage) -> Result<ChatMessage, ApiError> {
        self.calls.lock().push(msg.clone());
        if let Some(error) = &self.fail_with {
            return Err(error.clone());
        }
        Ok(ChatMessage {
            id: format!("srv-{}", self.calls.lock().len()),
            sender_id: "me".into(),
            recipient_id: msg.recipient_id.clone(),
            group_id: msg.group_id.clone(),
            content: msg.content.clone(),
            created_at: Utc::now(),
            read: false,
            read_at: None,
            client_id: Some(msg.client_id.clone()),
        })
    }
}
