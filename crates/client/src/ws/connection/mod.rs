//! One long-lived socket channel with state management and auto-reconnect.
//!
//! A [`Channel`] is a cheap handle; the socket itself is owned by a worker
//! task that serially handles socket events and commands from the handle.
//! State is published through a `watch` channel, so observers always see the
//! worker's latest [`ChannelStatus`].

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chatwire_shared::{InboundFrame, OutboundFrame};
use futures_channel::mpsc::{unbounded, UnboundedSender};
use tokio::sync::watch;
use url::Url;

use crate::error::{ChannelError, RealtimeError};
use crate::session::TokenProvider;
use crate::ws::transport::Transport;

mod worker;

use worker::{Command, Worker};

/// The two channels a client keeps open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Messages,
    Presence,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Messages => "messages",
            ChannelKind::Presence => "presence",
        }
    }
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection state for a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelState {
    #[default]
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
}

impl ChannelState {
    pub fn is_open(&self) -> bool {
        matches!(self, ChannelState::Open)
    }

    pub fn is_connecting(&self) -> bool {
        matches!(self, ChannelState::Connecting)
    }

    /// Connecting or open.
    pub fn is_active(&self) -> bool {
        self.is_open() || self.is_connecting()
    }
}

/// State plus the last failure, published by the worker.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChannelStatus {
    pub state: ChannelState,
    pub error: Option<ChannelError>,
}

/// Configuration for auto-reconnect behavior
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Consecutive failures after which automatic reconnects stop
    pub max_attempts: u32,
    /// Delay unit; failure `n` waits `n` times this
    pub base_delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(1000),
        }
    }
}

impl ReconnectConfig {
    /// Delay before reconnecting after consecutive failure number `failure`
    /// (1-based), or `None` once the attempt budget is spent.
    pub fn delay_for_attempt(&self, failure: u32) -> Option<Duration> {
        if failure == 0 || failure >= self.max_attempts {
            return None;
        }
        Some(self.base_delay.saturating_mul(failure))
    }
}

/// Consecutive-failure counter.
///
/// Channels built from the same coordinator share one counter, so a success
/// on either resets it. Pass separate counters to keep channels independent.
#[derive(Debug, Clone, Default)]
pub struct ReconnectCounter(Arc<AtomicU32>);

impl ReconnectCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one more failure and return the new total.
    pub fn record_failure(&self) -> u32 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn reset(&self) {
        self.0.store(0, Ordering::SeqCst);
    }

    pub fn get(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Everything a channel needs besides its collaborators.
#[derive(Debug, Clone)]
pub struct ChannelSettings {
    pub kind: ChannelKind,
    /// Socket URL without the token.
    pub endpoint: Url,
    pub handshake_timeout: Duration,
    pub reconnect: ReconnectConfig,
}

/// Callbacks from the worker into whoever owns the channel.
#[derive(Clone)]
pub struct ChannelHooks {
    /// Called for every successfully decoded frame of a known kind.
    pub on_frame: Arc<dyn Fn(ChannelKind, InboundFrame) + Send + Sync>,
    /// Called when the server rejected the token.
    pub on_auth_failure: Arc<dyn Fn(ChannelKind) + Send + Sync>,
}

impl ChannelHooks {
    /// Hooks that ignore everything.
    pub fn noop() -> Self {
        Self {
            on_frame: Arc::new(|_, _| {}),
            on_auth_failure: Arc::new(|_| {}),
        }
    }
}

/// Build the authenticated socket URL. The token travels as a query
/// parameter because socket handshakes cannot carry custom headers.
pub fn authenticated_url(endpoint: &Url, token: &str) -> Url {
    let token = urlencoding::encode(token);
    let query = match endpoint.query() {
        Some(existing) if !existing.is_empty() => format!("{existing}&token={token}"),
        _ => format!("token={token}"),
    };
    let mut url = endpoint.clone();
    url.set_query(Some(&query));
    url
}

/// Handle to a managed socket channel.
#[derive(Clone)]
pub struct Channel {
    kind: ChannelKind,
    commands: UnboundedSender<Command>,
    status: watch::Receiver<ChannelStatus>,
    tokens: Arc<dyn TokenProvider>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("kind", &self.kind)
            .field("status", &*self.status.borrow())
            .finish()
    }
}

impl Channel {
    /// Create the channel and start its worker on the current tokio runtime.
    /// The channel starts `Idle`; call [`Channel::connect`] to open it.
    pub fn spawn(
        settings: ChannelSettings,
        tokens: Arc<dyn TokenProvider>,
        transport: Arc<dyn Transport>,
        counter: ReconnectCounter,
        hooks: ChannelHooks,
    ) -> Self {
        let (commands, receiver) = unbounded();
        let (status_tx, status) = watch::channel(ChannelStatus::default());
        let kind = settings.kind;

        let worker = Worker::new(
            settings,
            tokens.clone(),
            transport,
            counter,
            hooks,
            receiver,
            status_tx,
        );
        tokio::spawn(worker.run());

        Self {
            kind,
            commands,
            status,
            tokens,
        }
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn status(&self) -> ChannelStatus {
        self.status.borrow().clone()
    }

    pub fn state(&self) -> ChannelState {
        self.status.borrow().state
    }

    pub fn is_open(&self) -> bool {
        self.state().is_open()
    }

    /// Receiver for observing status changes.
    pub fn watch(&self) -> watch::Receiver<ChannelStatus> {
        self.status.clone()
    }

    /// Start connecting. No-op while connecting or open.
    ///
    /// Fails with [`RealtimeError::Authentication`] when there is no token.
    pub fn connect(&self) -> Result<(), RealtimeError> {
        if self.tokens.token().is_none() {
            return Err(RealtimeError::Authentication);
        }
        if self.state().is_active() {
            return Ok(());
        }
        self.command(Command::Connect)
    }

    /// Drop the current socket (if any) and connect again, keeping queued
    /// frames and subscriptions. Used when the session token changed.
    pub fn reconnect(&self) -> Result<(), RealtimeError> {
        if self.tokens.token().is_none() {
            return Err(RealtimeError::Authentication);
        }
        self.command(Command::Reconnect)
    }

    /// Send a frame now if open, otherwise queue it and start connecting.
    pub fn send(&self, frame: impl Into<OutboundFrame>) -> Result<(), RealtimeError> {
        self.command(Command::Send(frame.into()))
    }

    /// Add a topic to the subscription set; announced now if open and after
    /// every reconnect.
    pub fn subscribe(&self, topic: impl Into<String>) -> Result<(), RealtimeError> {
        self.command(Command::Subscribe(topic.into()))
    }

    pub fn unsubscribe(&self, topic: impl Into<String>) -> Result<(), RealtimeError> {
        self.command(Command::Unsubscribe(topic.into()))
    }

    /// Close with a normal closure, cancel any pending reconnect and forget
    /// queued frames and subscriptions.
    pub fn shutdown(&self) -> Result<(), RealtimeError> {
        self.command(Command::Shutdown)
    }

    fn command(&self, command: Command) -> Result<(), RealtimeError> {
        self.commands
            .unbounded_send(command)
            .map_err(|_| RealtimeError::ChannelGone)
    }
}
