//! Client error types.

use thiserror::Error;

/// Errors returned by operations a caller invokes directly.
#[derive(Debug, Error)]
pub enum RealtimeError {
    /// No bearer token is available; connecting is not allowed.
    #[error("not authenticated: no session token available")]
    Authentication,
    /// The channel worker has stopped (its runtime shut down).
    #[error("channel worker is gone")]
    ChannelGone,
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Channel-level failure, surfaced as state rather than returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("authentication rejected by server")]
    Authentication,
    #[error("Connection timeout")]
    HandshakeTimeout,
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("Max reconnect attempts ({attempts}) exceeded")]
    MaxAttemptsExceeded { attempts: u32 },
}

impl ChannelError {
    /// Terminal errors stop automatic reconnection.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ChannelError::Authentication | ChannelError::MaxAttemptsExceeded { .. }
        )
    }
}
