//! Client configuration from defaults or environment variables.

use std::time::Duration;

use url::Url;

use crate::error::RealtimeError;
use crate::ws::{ChannelKind, ReconnectConfig};

pub const DEFAULT_PROVIDER: &str = "localhost:8080";
pub const DEFAULT_MESSAGES_PATH: &str = "/ws/messages";
pub const DEFAULT_PRESENCE_PATH: &str = "/ws/presence";
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Settings for the coordinator, its channels and the HTTP fallback.
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Base URL for HTTP calls, e.g. `https://chat.example.com`.
    pub api_base: String,
    /// Base URL for sockets, e.g. `wss://chat.example.com`.
    pub ws_base: String,
    pub messages_path: String,
    pub presence_path: String,
    pub handshake_timeout: Duration,
    pub request_timeout: Duration,
    pub reconnect: ReconnectConfig,
    /// Start both channels as soon as the coordinator is built and a token exists.
    pub auto_connect: bool,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            api_base: format!("http://{DEFAULT_PROVIDER}"),
            ws_base: format!("ws://{DEFAULT_PROVIDER}"),
            messages_path: DEFAULT_MESSAGES_PATH.to_string(),
            presence_path: DEFAULT_PRESENCE_PATH.to_string(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            reconnect: ReconnectConfig::default(),
            auto_connect: true,
        }
    }
}

impl RealtimeConfig {
    /// Configuration for a provider given as a domain (`chat.example.com`,
    /// `localhost:8080`) or a full URL.
    pub fn for_provider(provider: &str) -> Result<Self, RealtimeError> {
        let api_base = provider_base_url(provider)?;
        let ws_base = http_to_ws(&api_base)?;
        Ok(Self {
            api_base: api_base.as_str().trim_end_matches('/').to_string(),
            ws_base: ws_base.as_str().trim_end_matches('/').to_string(),
            ..Self::default()
        })
    }

    /// Parse configuration from environment variables.
    ///
    /// Environment variables:
    /// - `CHATWIRE_PROVIDER`: provider domain or URL (default: "localhost:8080")
    /// - `CHATWIRE_MESSAGES_PATH`: messages socket path (default: "/ws/messages")
    /// - `CHATWIRE_PRESENCE_PATH`: presence socket path (default: "/ws/presence")
    /// - `CHATWIRE_RECONNECT_BASE_MS`: backoff base interval (default: 1000)
    /// - `CHATWIRE_MAX_RECONNECT_ATTEMPTS`: attempts before giving up (default: 5)
    /// - `CHATWIRE_HANDSHAKE_TIMEOUT_MS`: socket handshake timeout (default: 10000)
    /// - `CHATWIRE_REQUEST_TIMEOUT_MS`: fallback HTTP timeout (default: 15000)
    /// - `CHATWIRE_AUTO_CONNECT`: "true" | "false" (default: "true")
    pub fn from_env() -> Result<Self, RealtimeError> {
        let provider =
            std::env::var("CHATWIRE_PROVIDER").unwrap_or_else(|_| DEFAULT_PROVIDER.to_string());
        let mut config = Self::for_provider(&provider)?;

        if let Ok(path) = std::env::var("CHATWIRE_MESSAGES_PATH") {
            config.messages_path = path;
        }
        if let Ok(path) = std::env::var("CHATWIRE_PRESENCE_PATH") {
            config.presence_path = path;
        }
        if let Some(ms) = env_parse::<u64>("CHATWIRE_RECONNECT_BASE_MS")? {
            config.reconnect.base_delay = Duration::from_millis(ms);
        }
        if let Some(max) = env_parse::<u32>("CHATWIRE_MAX_RECONNECT_ATTEMPTS")? {
            config.reconnect.max_attempts = max;
        }
        if let Some(ms) = env_parse::<u64>("CHATWIRE_HANDSHAKE_TIMEOUT_MS")? {
            config.handshake_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("CHATWIRE_REQUEST_TIMEOUT_MS")? {
            config.request_timeout = Duration::from_millis(ms);
        }
        if let Some(auto) = env_parse::<bool>("CHATWIRE_AUTO_CONNECT")? {
            config.auto_connect = auto;
        }

        Ok(config)
    }

    pub fn path_for(&self, kind: ChannelKind) -> &str {
        match kind {
            ChannelKind::Messages => &self.messages_path,
            ChannelKind::Presence => &self.presence_path,
        }
    }

    /// Socket endpoint for a channel, without the token.
    pub fn endpoint(&self, kind: ChannelKind) -> Result<Url, RealtimeError> {
        let base = Url::parse(&self.ws_base)
            .map_err(|e| {
                RealtimeError::Config(format!("bad socket base {:?}: {e}", self.ws_base))
            })?;
        base.join(self.path_for(kind))
            .map_err(|e| RealtimeError::Config(format!("bad {} path: {e}", kind.as_str())))
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>, RealtimeError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .to_lowercase()
            .parse::<T>()
            .map(Some)
            .map_err(|e| RealtimeError::Config(format!("{key}={raw:?}: {e}"))),
        Err(_) => Ok(None),
    }
}

/// Check if a host is a local/development address.
pub fn is_local_address(host: &str) -> bool {
    let host_part = host.split(':').next().unwrap_or(host);
    host_part == "localhost"
        || host_part == "127.0.0.1"
        || host_part == "0.0.0.0"
        || host_part.starts_with("192.168.")
        || host_part.starts_with("10.")
}

/// HTTP base URL for a provider. Local addresses get `http`, everything
/// else `https`; explicit schemes are kept.
pub fn provider_base_url(provider: &str) -> Result<Url, RealtimeError> {
    let provider = provider.trim().trim_end_matches('/');
    if provider.is_empty() {
        return Err(RealtimeError::Config("provider must not be empty".into()));
    }

    let raw = if provider.contains("://") {
        provider.to_string()
    } else if is_local_address(provider) {
        format!("http://{provider}")
    } else {
        format!("https://{provider}")
    };

    Url::parse(&raw).map_err(|e| RealtimeError::Config(format!("bad provider {provider:?}: {e}")))
}

/// Convert an HTTP/HTTPS URL to WS/WSS.
pub fn http_to_ws(url: &Url) -> Result<Url, RealtimeError> {
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(RealtimeError::Config(format!(
                "unsupported scheme {other:?} for socket URL"
            )))
        }
    };
    let mut ws = url.clone();
    ws.set_scheme(scheme)
        .map_err(|_| RealtimeError::Config(format!("cannot switch {url} to {scheme}")))?;
    Ok(ws)
}
