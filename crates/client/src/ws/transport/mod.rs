//! Socket transport abstraction.
//!
//! A [`Transport`] opens sockets; a [`Socket`] carries text frames both ways.
//! The channel worker only talks to these traits, so the same reconnect and
//! dispatch logic runs over tokio-tungstenite in production and over
//! [`memory::MemoryTransport`] in tests.

use async_trait::async_trait;
use thiserror::Error;
use url::Url;

pub mod memory;
pub mod tungstenite;

pub use memory::{ConnectBehavior, ConnectAttempt, MemoryPeer, MemoryTransport};
pub use tungstenite::TungsteniteTransport;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("close failed: {0}")]
    Close(String),
}

/// Something that happened on an open socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    Text(String),
    /// The peer closed the socket with a close frame.
    Closed { code: u16, reason: String },
    /// The socket failed; it must be considered closed.
    Error(String),
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a socket to `url`. Resolves once the handshake completed.
    async fn open(&self, url: &Url) -> Result<Box<dyn Socket>, TransportError>;
}

#[async_trait]
pub trait Socket: Send {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;

    /// Wait for the next event. `None` means the stream ended without a
    /// close frame. Must be cancel safe.
    async fn next_event(&mut self) -> Option<SocketEvent>;

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError>;
}
