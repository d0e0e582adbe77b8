//! Socket layer for real-time messaging and presence.
//!
//! This module provides:
//! - Two managed channels with auto-reconnect, an outbound queue and
//!   subscription replay
//! - A coordinator that derives one connection state from both channels
//! - A transport seam so the same logic runs over a real or in-memory socket
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                    Coordinator                      │
//! │   (derived state, message history, send routing)    │
//! └─────────────────────────────────────────────────────┘
//!             │                           │
//!             ▼                           ▼
//!     ┌──────────────┐            ┌──────────────┐        ┌──────────────┐
//!     │   Channel    │            │   Channel    │        │   Fallback   │
//!     │  (messages)  │            │  (presence)  │        │    (HTTP)    │
//!     └──────────────┘            └──────────────┘        └──────────────┘
//!             │                           │                       │
//!             └─────────────┬─────────────┘───────────────────────┘
//!                           ▼
//!                ┌─────────────────────┐
//!                │      EventBus       │
//!                └─────────────────────┘
//!                           │
//!          ┌────────────────┼────────────────┐
//!          ▼                ▼                ▼
//!    ┌────────────┐   ┌────────────┐   ┌────────────┐
//!    │  Listener  │   │  Listener  │   │  Listener  │
//!    └────────────┘   └────────────┘   └────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! let bus = EventBus::new();
//! let tokens = Arc::new(SessionTokens::new(Some(token)));
//! let client = Coordinator::builder(RealtimeConfig::from_env()?, tokens, bus.clone()).build()?;
//!
//! Listener::<topics::NewMessage>::new(&bus).subscribe(|msg| println!("{}", msg.content));
//! client.send_private_message("user-42", "hello").await;
//! ```

mod connection;
mod coordinator;
pub mod queue;
pub mod subscriptions;
pub mod transport;

pub use connection::{
    authenticated_url, Channel, ChannelHooks, ChannelKind, ChannelSettings, ChannelState,
    ChannelStatus, ReconnectConfig, ReconnectCounter,
};
pub use coordinator::{
    presence_topic, ConnectionSnapshot, Coordinator, CoordinatorBuilder, UNREAD_COUNTS_TOPIC,
};
