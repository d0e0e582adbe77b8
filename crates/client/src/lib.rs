//! Chatwire client - real-time connectivity layer
//!
//! This crate keeps two authenticated sockets (messages and presence) alive,
//! dispatches their frames to a typed event bus, queues outbound frames while
//! disconnected and falls back to HTTP for private messages.

pub mod logging;

pub mod api_client;
pub mod bus;
pub mod config;
pub mod error;
pub mod fallback;
pub mod listener;
pub mod session;
pub mod stores;
pub mod ws;

pub use api_client::ApiClient;
pub use bus::{topics, EventBus, HandlerId, Topic};
pub use config::RealtimeConfig;
pub use error::{ChannelError, RealtimeError};
pub use fallback::{FallbackSender, MessageApi};
pub use listener::{Listener, ListenerHandle, PageVisibility, PRESENCE_DEBOUNCE, TYPING_DEBOUNCE};
pub use session::{SessionTokens, TokenProvider};
pub use ws::{ChannelKind, ChannelState, ConnectionSnapshot, Coordinator, ReconnectConfig};
