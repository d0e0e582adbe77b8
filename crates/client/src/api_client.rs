//! HTTP API client for the messaging service.

use std::sync::Arc;

use async_trait::async_trait;
use chatwire_shared::{ApiError, ChatMessage, OutgoingMessage};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::RealtimeConfig;
use crate::error::RealtimeError;
use crate::fallback::MessageApi;
use crate::session::TokenProvider;

pub const PRIVATE_MESSAGES_PATH: &str = "/api/messages/private";

/// HTTP client that authenticates with the current session's bearer token.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    tokens: Arc<dyn TokenProvider>,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl ApiClient {
    pub fn new(
        config: &RealtimeConfig,
        tokens: Arc<dyn TokenProvider>,
    ) -> Result<Self, RealtimeError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| RealtimeError::Config(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: config.api_base.clone(),
            tokens,
        })
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        let base = self.base_url.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        format!("{base}/{path}")
    }

    /// POST a JSON body and decode the JSON response
    pub async fn post_json<TReq: Serialize, TRes: DeserializeOwned>(
        &self,
        path: &str,
        body: &TReq,
    ) -> Result<TRes, ApiError> {
        let mut rb = self.client.post(self.url(path)).json(body);
        if let Some(token) = self.tokens.token() {
            rb = rb.bearer_auth(token);
        }

        let resp = rb.send().await.map_err(|e| ApiError::Network(e.to_string()))?;

        let status = resp.status().as_u16();
        let is_success = resp.status().is_success();
        let text = resp
            .text()
            .await
            .map_err(|e| ApiError::Network(format!("failed to read body: {e}")))?;

        if !is_success {
            return Err(ApiError::Http { status, body: text });
        }

        if text.is_empty() {
            serde_json::from_str("null").map_err(|e| ApiError::Deserialize(e.to_string()))
        } else {
            serde_json::from_str(&text).map_err(|e| ApiError::Deserialize(e.to_string()))
        }
    }
}

#[async_trait]
impl MessageApi for ApiClient {
    async fn send_private_message(&self, msg: &OutgoingMessage) -> Result<ChatMessage, ApiError> {
        self.post_json(PRIVATE_MESSAGES_PATH, msg).await
    }
}
