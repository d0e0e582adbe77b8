//! HTTP delivery path for private messages when the messages channel is down.
//!
//! One request per message, no retry loop. On success the same bus events a
//! socket delivery produces are emitted; on failure a `retry-failed-message`
//! event hands the decision to retry back to the caller.

use std::sync::Arc;

use async_trait::async_trait;
use chatwire_shared::{ApiError, ChatMessage, MessageSent, OutgoingMessage, RetryFailedMessage};
use chrono::Utc;

use crate::bus::{topics, EventBus};
use crate::{log_info, log_warn};

/// The HTTP endpoint used by the fallback sender.
#[async_trait]
pub trait MessageApi: Send + Sync + 'static {
    /// Deliver one private message and return it as stored by the server.
    async fn send_private_message(&self, msg: &OutgoingMessage) -> Result<ChatMessage, ApiError>;
}

#[derive(Clone)]
pub struct FallbackSender {
    api: Arc<dyn MessageApi>,
    bus: Arc<EventBus>,
}

impl std::fmt::Debug for FallbackSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackSender").finish_non_exhaustive()
    }
}

impl FallbackSender {
    pub fn new(api: Arc<dyn MessageApi>, bus: Arc<EventBus>) -> Self {
        Self { api, bus }
    }

    /// Send `msg` over HTTP and publish the outcome.
    pub async fn send_private(&self, msg: &OutgoingMessage) -> Result<ChatMessage, ApiError> {
        let recipient_id = msg.recipient().id().to_string();
        match self.api.send_private_message(msg).await {
            Ok(stored) => {
                log_info!("Delivered message {} to {recipient_id} over HTTP", msg.client_id);
                self.bus
                    .emit::<topics::MessageSent>(&MessageSent::from_outgoing(msg, Utc::now()));
                self.bus.emit::<topics::MessageReceived>(&stored);
                Ok(stored)
            }
            Err(e) => {
                log_warn!("HTTP delivery to {recipient_id} failed: {e}");
                self.bus.emit::<topics::RetryFailedMessage>(&RetryFailedMessage {
                    recipient_id,
                    content: msg.content.clone(),
                    client_id: msg.client_id.clone(),
                    reason: e.user_reason(),
                });
                Err(e)
            }
        }
    }
}
