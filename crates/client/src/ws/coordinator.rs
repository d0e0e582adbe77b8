//! Composes the messages and presence channels into one client.
//!
//! The coordinator owns both [`Channel`]s and the [`MessageHistory`]. Frames
//! decoded by either channel are dispatched by kind to the [`EventBus`].
//! Connection state is never stored here; it is derived from the two
//! channels whenever asked for and republished on the bus when it changes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chatwire_shared::{
    ChatMessage, ClientFrame, InboundFrame, MessageSent, OutgoingMessage, ReadRequest, Recipient,
    TypingIndicator, TypingStatus,
};
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::connection::{
    Channel, ChannelHooks, ChannelKind, ChannelSettings, ChannelState, ChannelStatus,
    ReconnectCounter,
};
use super::transport::{Transport, TungsteniteTransport};
use crate::api_client::ApiClient;
use crate::bus::{topics, EventBus};
use crate::config::RealtimeConfig;
use crate::error::{ChannelError, RealtimeError};
use crate::fallback::{FallbackSender, MessageApi};
use crate::session::TokenProvider;
use crate::stores::MessageHistory;
use crate::{log_debug, log_info, log_warn};

/// Topic the presence channel uses for one user's status.
pub fn presence_topic(user_id: &str) -> String {
    format!("presence:{user_id}")
}

/// Topic the presence channel uses for unread counters.
pub const UNREAD_COUNTS_TOPIC: &str = "unread_counts";

/// Derived view of both channels.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectionSnapshot {
    /// Both channels are open.
    pub connected: bool,
    /// At least one channel is connecting.
    pub connecting: bool,
    pub messages: ChannelState,
    pub presence: ChannelState,
    /// The messages channel's error, else the presence channel's.
    pub error: Option<ChannelError>,
}

impl ConnectionSnapshot {
    pub fn derive(messages: &ChannelStatus, presence: &ChannelStatus) -> Self {
        Self {
            connected: messages.state.is_open() && presence.state.is_open(),
            connecting: messages.state.is_connecting() || presence.state.is_connecting(),
            messages: messages.state,
            presence: presence.state,
            error: messages.error.clone().or_else(|| presence.error.clone()),
        }
    }
}

type SessionInvalidFn = Arc<dyn Fn() + Send + Sync>;

/// State reachable from channel hooks and background tasks.
struct Shared {
    bus: Arc<EventBus>,
    history: Mutex<MessageHistory>,
    /// Cleared by `disconnect()` and logout. Frames a worker still delivers
    /// after that are dropped instead of refilling the history.
    live: AtomicBool,
    /// Set once the session was reported invalid; cleared when a channel
    /// opens again or the token changes.
    auth_reported: AtomicBool,
    on_session_invalid: Option<SessionInvalidFn>,
}

impl Shared {
    /// Stop accepting frames and forget the history.
    fn suspend(&self) {
        let mut history = self.history.lock();
        self.live.store(false, Ordering::SeqCst);
        history.clear();
    }

    fn resume(&self) {
        self.live.store(true, Ordering::SeqCst);
    }

    fn dispatch_frame(&self, kind: ChannelKind, frame: InboundFrame) {
        if !self.live.load(Ordering::SeqCst) {
            log_debug!("Dropping {kind} frame received after disconnect");
            return;
        }
        match frame {
            InboundFrame::Message(msg) => {
                let fresh = {
                    let mut history = self.history.lock();
                    self.live.load(Ordering::SeqCst) && history.insert(msg.clone())
                };
                if fresh {
                    self.bus.emit::<topics::NewMessage>(&msg);
                    self.bus.emit::<topics::MessageReceived>(&msg);
                } else {
                    log_debug!("Ignoring duplicate message {}", msg.id);
                }
            }
            InboundFrame::Typing(event) => {
                self.bus
                    .emit::<topics::TypingStatusChanged>(&TypingStatus::from_event(event, true));
            }
            InboundFrame::StopTyping(event) => {
                self.bus
                    .emit::<topics::TypingStatusChanged>(&TypingStatus::from_event(event, false));
            }
            InboundFrame::Status(update) => {
                self.bus.emit::<topics::UserStatusChanged>(&update);
            }
            InboundFrame::Read(receipt) => {
                let changed = self.history.lock().apply_read_receipt(&receipt);
                log_debug!("Read receipt from {} updated {changed} message(s)", receipt.reader_id);
                self.bus.emit::<topics::MessagesRead>(&receipt);
            }
            InboundFrame::UnreadCount(counts) => {
                self.bus.emit::<topics::UnreadCountsUpdated>(&counts);
            }
            InboundFrame::Error(error) => {
                log_warn!("Server error on {kind} channel: {}", error.message);
                self.bus.emit::<topics::ServerError>(&error);
            }
            InboundFrame::Unknown { kind: frame_kind, .. } => {
                log_debug!("Ignoring unknown frame type {frame_kind:?} on {kind} channel");
            }
        }
    }

    fn session_invalid(&self) {
        if self.auth_reported.swap(true, Ordering::SeqCst) {
            return;
        }
        log_warn!("Session rejected by server, logging out");
        if let Some(callback) = &self.on_session_invalid {
            callback();
        }
    }
}

/// Builder for [`Coordinator`].
pub struct CoordinatorBuilder {
    config: RealtimeConfig,
    tokens: Arc<dyn TokenProvider>,
    bus: Arc<EventBus>,
    transport: Option<Arc<dyn Transport>>,
    api: Option<Arc<dyn MessageApi>>,
    on_session_invalid: Option<SessionInvalidFn>,
    counter: Option<ReconnectCounter>,
}

impl CoordinatorBuilder {
    /// Socket transport; defaults to tokio-tungstenite.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// HTTP endpoint for the fallback path; defaults to [`ApiClient`].
    pub fn fallback(mut self, api: Arc<dyn MessageApi>) -> Self {
        self.api = Some(api);
        self
    }

    /// Called once when the server rejects the session. Typically logs out.
    pub fn on_session_invalid(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_session_invalid = Some(Arc::new(callback));
        self
    }

    /// Failure counter shared by both channels. A fresh one is used if unset.
    pub fn reconnect_counter(mut self, counter: ReconnectCounter) -> Self {
        self.counter = Some(counter);
        self
    }

    /// Build the coordinator and start its tasks. Must be called inside a
    /// tokio runtime.
    pub fn build(self) -> Result<Coordinator, RealtimeError> {
        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(TungsteniteTransport::new()),
        };
        let api: Arc<dyn MessageApi> = match self.api {
            Some(api) => api,
            None => Arc::new(ApiClient::new(&self.config, self.tokens.clone())?),
        };
        let counter = self.counter.unwrap_or_default();

        let shared = Arc::new(Shared {
            bus: self.bus.clone(),
            history: Mutex::new(MessageHistory::new()),
            live: AtomicBool::new(true),
            auth_reported: AtomicBool::new(false),
            on_session_invalid: self.on_session_invalid,
        });

        let hooks = ChannelHooks {
            on_frame: {
                let shared = shared.clone();
                Arc::new(move |kind: ChannelKind, frame: InboundFrame| {
                    shared.dispatch_frame(kind, frame)
                })
            },
            on_auth_failure: {
                let shared = shared.clone();
                Arc::new(move |_: ChannelKind| shared.session_invalid())
            },
        };

        let spawn_channel = |kind: ChannelKind| -> Result<Channel, RealtimeError> {
            let settings = ChannelSettings {
                kind,
                endpoint: self.config.endpoint(kind)?,
                handshake_timeout: self.config.handshake_timeout,
                reconnect: self.config.reconnect.clone(),
            };
            Ok(Channel::spawn(
                settings,
                self.tokens.clone(),
                transport.clone(),
                counter.clone(),
                hooks.clone(),
            ))
        };
        let messages = spawn_channel(ChannelKind::Messages)?;
        let presence = spawn_channel(ChannelKind::Presence)?;

        let tasks = vec![
            tokio::spawn(publish_state(
                messages.watch(),
                presence.watch(),
                shared.clone(),
            )),
            tokio::spawn(follow_session(
                self.tokens.changes(),
                messages.clone(),
                presence.clone(),
                shared.clone(),
                self.config.auto_connect,
            )),
        ];

        let coordinator = Coordinator {
            messages,
            presence,
            shared,
            fallback: FallbackSender::new(api, self.bus),
            tokens: self.tokens,
            tasks,
        };

        if self.config.auto_connect && coordinator.tokens.token().is_some() {
            coordinator.connect()?;
        }
        Ok(coordinator)
    }
}

/// Watches both channels and emits `connection-state-changed` when the
/// derived snapshot changes.
async fn publish_state(
    mut messages: watch::Receiver<ChannelStatus>,
    mut presence: watch::Receiver<ChannelStatus>,
    shared: Arc<Shared>,
) {
    let mut last = ConnectionSnapshot::derive(&messages.borrow(), &presence.borrow());
    loop {
        tokio::select! {
            changed = messages.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            changed = presence.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
        let snapshot = ConnectionSnapshot::derive(
            &messages.borrow_and_update(),
            &presence.borrow_and_update(),
        );
        let opened = (snapshot.messages.is_open() && !last.messages.is_open())
            || (snapshot.presence.is_open() && !last.presence.is_open());
        if opened {
            shared.auth_reported.store(false, Ordering::SeqCst);
        }
        if snapshot != last {
            last = snapshot.clone();
            shared.bus.emit::<topics::ConnectionStateChanged>(&snapshot);
        }
    }
}

/// Follows the session token: logout tears both channels down, a new token
/// reconnects them.
async fn follow_session(
    mut changes: watch::Receiver<Option<String>>,
    messages: Channel,
    presence: Channel,
    shared: Arc<Shared>,
    auto_connect: bool,
) {
    while changes.changed().await.is_ok() {
        let token = changes.borrow_and_update().clone();
        if token.is_none() {
            log_info!("Session ended, closing channels");
            shared.suspend();
            let _ = messages.shutdown();
            let _ = presence.shutdown();
            continue;
        }

        shared.resume();
        shared.auth_reported.store(false, Ordering::SeqCst);
        for channel in [&messages, &presence] {
            if auto_connect || channel.state().is_active() {
                if let Err(e) = channel.reconnect() {
                    log_warn!("Cannot reconnect {} channel: {e}", channel.kind());
                }
            }
        }
    }
}

/// The client-facing real-time API.
///
/// Dropping the coordinator stops its background tasks; the channel workers
/// then close their sockets and exit.
pub struct Coordinator {
    messages: Channel,
    presence: Channel,
    shared: Arc<Shared>,
    fallback: FallbackSender,
    tokens: Arc<dyn TokenProvider>,
    tasks: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Coordinator {
    pub fn builder(
        config: RealtimeConfig,
        tokens: Arc<dyn TokenProvider>,
        bus: Arc<EventBus>,
    ) -> CoordinatorBuilder {
        CoordinatorBuilder {
            config,
            tokens,
            bus,
            transport: None,
            api: None,
            on_session_invalid: None,
            counter: None,
        }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.shared.bus
    }

    pub fn channel(&self, kind: ChannelKind) -> &Channel {
        match kind {
            ChannelKind::Messages => &self.messages,
            ChannelKind::Presence => &self.presence,
        }
    }

    /// Connect both channels. Fails if there is no session token.
    pub fn connect(&self) -> Result<(), RealtimeError> {
        self.shared.resume();
        self.messages.connect()?;
        self.presence.connect()
    }

    /// Close both channels with a normal closure, cancel pending reconnects
    /// and forget queued frames, subscriptions and history.
    pub fn disconnect(&self) {
        log_info!("Disconnecting realtime channels");
        self.shared.suspend();
        for channel in [&self.messages, &self.presence] {
            if let Err(e) = channel.shutdown() {
                log_debug!("{} channel already stopped: {e}", channel.kind());
            }
        }
    }

    pub fn state(&self) -> ConnectionSnapshot {
        ConnectionSnapshot::derive(&self.messages.status(), &self.presence.status())
    }

    pub fn is_connected(&self) -> bool {
        self.state().connected
    }

    pub fn is_connecting(&self) -> bool {
        self.state().connecting
    }

    pub fn error(&self) -> Option<ChannelError> {
        self.state().error
    }

    /// Message history in arrival order.
    pub fn messages(&self) -> Vec<ChatMessage> {
        self.shared.history.lock().messages().to_vec()
    }

    /// Send a private message over the messages channel, or over HTTP when
    /// the channel is not open. Returns whether the message was handed off.
    pub async fn send_private_message(&self, recipient_id: &str, content: &str) -> bool {
        let msg = OutgoingMessage::new(&Recipient::User(recipient_id.to_string()), content);

        if self.messages.is_open() {
            match self.messages.send(ClientFrame::Message(msg.clone())) {
                Ok(()) => {
                    self.shared
                        .bus
                        .emit::<topics::MessageSent>(&MessageSent::from_outgoing(&msg, Utc::now()));
                    return true;
                }
                Err(e) => log_warn!("Socket send failed, using HTTP: {e}"),
            }
        }

        match self.fallback.send_private(&msg).await {
            Ok(stored) => {
                self.shared.history.lock().insert(stored);
                true
            }
            Err(e) => {
                if e.is_unauthorized() {
                    self.shared.session_invalid();
                }
                false
            }
        }
    }

    /// Send a group message. Queued until the messages channel opens.
    pub fn send_group_message(&self, group_id: &str, content: &str) -> bool {
        let msg = OutgoingMessage::new(&Recipient::Group(group_id.to_string()), content);
        self.shared.resume();
        let open = self.messages.is_open();
        match self.messages.send(ClientFrame::Message(msg.clone())) {
            Ok(()) => {
                if open {
                    self.shared
                        .bus
                        .emit::<topics::MessageSent>(&MessageSent::from_outgoing(&msg, Utc::now()));
                }
                true
            }
            Err(e) => {
                log_warn!("Cannot send group message: {e}");
                false
            }
        }
    }

    /// Tell `recipient_id` that the user started or stopped typing.
    pub fn send_typing(&self, recipient_id: &str, is_typing: bool) -> bool {
        let indicator = TypingIndicator {
            recipient_id: recipient_id.to_string(),
        };
        let frame = if is_typing {
            ClientFrame::Typing(indicator)
        } else {
            ClientFrame::StopTyping(indicator)
        };
        self.shared.resume();
        self.messages.send(frame).is_ok()
    }

    /// Ask the server to mark messages read.
    pub fn mark_read(&self, message_ids: Vec<String>) -> bool {
        if message_ids.is_empty() {
            return true;
        }
        self.shared.resume();
        self.messages
            .send(ClientFrame::Read(ReadRequest { message_ids }))
            .is_ok()
    }

    /// Add a topic to a channel's subscription set.
    pub fn subscribe(&self, kind: ChannelKind, topic: &str) -> Result<(), RealtimeError> {
        self.channel(kind).subscribe(topic)
    }

    pub fn unsubscribe(&self, kind: ChannelKind, topic: &str) -> Result<(), RealtimeError> {
        self.channel(kind).unsubscribe(topic)
    }

    /// Follow a user's presence.
    pub fn watch_presence(&self, user_id: &str) -> Result<(), RealtimeError> {
        self.presence.subscribe(presence_topic(user_id))
    }

    pub fn unwatch_presence(&self, user_id: &str) -> Result<(), RealtimeError> {
        self.presence.unsubscribe(presence_topic(user_id))
    }

    /// Follow unread counters.
    pub fn watch_unread_counts(&self) -> Result<(), RealtimeError> {
        self.presence.subscribe(UNREAD_COUNTS_TOPIC)
    }

    pub fn unwatch_unread_counts(&self) -> Result<(), RealtimeError> {
        self.presence.unsubscribe(UNREAD_COUNTS_TOPIC)
    }
}
