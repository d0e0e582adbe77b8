//! The task that owns one channel's socket.
//!
//! The worker moves between four phases: idle (no socket, waiting for a
//! command), connecting (handshake in flight, bounded by the handshake
//! timeout), open (socket events and commands multiplexed with `select!`) and
//! backoff (a reconnect timer that any command can cut short or cancel).
//! Because one task owns the socket, the queue and the subscription set,
//! flushing after open always completes before a new send is looked at.

use std::sync::Arc;
use std::time::Duration;

use chatwire_shared::{
    classify_close, CloseClass, ControlFrame, InboundFrame, OutboundFrame, CLOSE_ABNORMAL,
    CLOSE_NORMAL,
};
use futures_channel::mpsc::UnboundedReceiver;
use futures_util::StreamExt;
use tokio::sync::watch;

use super::{
    authenticated_url, ChannelHooks, ChannelSettings, ChannelState, ChannelStatus,
    ReconnectCounter,
};
use crate::error::ChannelError;
use crate::session::TokenProvider;
use crate::ws::queue::OutboundQueue;
use crate::ws::subscriptions::SubscriptionSet;
use crate::ws::transport::{Socket, SocketEvent, Transport};
use crate::{log_debug, log_error, log_info, log_warn};

/// Commands sent from a [`super::Channel`] handle to its worker.
#[derive(Debug)]
pub(super) enum Command {
    /// Manual connect.
    Connect,
    /// Drop the socket and connect again.
    Reconnect,
    Send(OutboundFrame),
    Subscribe(String),
    Unsubscribe(String),
    Shutdown,
}

enum Phase {
    Idle,
    Connect,
    Open(Box<dyn Socket>),
    Backoff(Duration),
    Stop,
}

/// How an open socket stopped being open.
enum Exit {
    /// The server closed it with a close frame.
    Closed { code: u16, reason: String },
    /// The socket failed or vanished.
    Failed(String),
}

pub(super) struct Worker {
    settings: ChannelSettings,
    tokens: Arc<dyn TokenProvider>,
    transport: Arc<dyn Transport>,
    counter: ReconnectCounter,
    hooks: ChannelHooks,
    commands: UnboundedReceiver<Command>,
    status: watch::Sender<ChannelStatus>,
    queue: OutboundQueue,
    subscriptions: SubscriptionSet,
}

impl Worker {
    pub(super) fn new(
        settings: ChannelSettings,
        tokens: Arc<dyn TokenProvider>,
        transport: Arc<dyn Transport>,
        counter: ReconnectCounter,
        hooks: ChannelHooks,
        commands: UnboundedReceiver<Command>,
        status: watch::Sender<ChannelStatus>,
    ) -> Self {
        Self {
            settings,
            tokens,
            transport,
            counter,
            hooks,
            commands,
            status,
            queue: OutboundQueue::new(),
            subscriptions: SubscriptionSet::new(),
        }
    }

    pub(super) async fn run(mut self) {
        let mut phase = Phase::Idle;
        loop {
            phase = match phase {
                Phase::Idle => self.idle().await,
                Phase::Connect => self.connect().await,
                Phase::Open(socket) => self.open(socket).await,
                Phase::Backoff(delay) => self.backoff(delay).await,
                Phase::Stop => break,
            };
        }
        log_debug!("{} channel worker stopped", self.settings.kind);
    }

    fn publish(&self, state: ChannelState, error: Option<ChannelError>) {
        self.status.send_if_modified(|status| {
            let next = ChannelStatus { state, error };
            if *status == next {
                false
            } else {
                *status = next;
                true
            }
        });
    }

    fn publish_state(&self, state: ChannelState) {
        let error = self.status.borrow().error.clone();
        self.publish(state, error);
    }

    fn halted(&self) -> bool {
        self.status
            .borrow()
            .error
            .as_ref()
            .is_some_and(ChannelError::is_terminal)
    }

    fn forget(&mut self) {
        self.queue.clear();
        self.subscriptions.clear();
    }

    /// Handle a command that doesn't depend on the socket. Returns the
    /// command back when the caller has to deal with it.
    fn absorb(&mut self, command: Command) -> Option<Command> {
        match command {
            Command::Send(frame) => {
                self.queue.push(frame);
                None
            }
            Command::Subscribe(topic) => {
                self.subscriptions.insert(topic);
                None
            }
            Command::Unsubscribe(topic) => {
                self.subscriptions.remove(&topic);
                None
            }
            other => Some(other),
        }
    }

    async fn idle(&mut self) -> Phase {
        loop {
            let Some(command) = self.commands.next().await else {
                return Phase::Stop;
            };
            match command {
                Command::Connect | Command::Reconnect => {
                    if self.halted() {
                        log_info!(
                            "{} channel: manual connect, resetting attempts",
                            self.settings.kind
                        );
                        self.counter.reset();
                    }
                    return Phase::Connect;
                }
                Command::Send(frame) => {
                    self.queue.push(frame);
                    if !self.halted() {
                        return Phase::Connect;
                    }
                }
                Command::Shutdown => {
                    self.forget();
                    self.publish(ChannelState::Closed, None);
                }
                other => {
                    self.absorb(other);
                }
            }
        }
    }

    async fn connect(&mut self) -> Phase {
        let kind = self.settings.kind;
        let Some(token) = self.tokens.token() else {
            log_warn!("{kind} channel: no session token, not connecting");
            self.publish(ChannelState::Closed, Some(ChannelError::Authentication));
            return Phase::Idle;
        };

        self.publish_state(ChannelState::Connecting);
        let url = authenticated_url(&self.settings.endpoint, &token);
        log_info!("{kind} channel connecting to {}", self.settings.endpoint);

        let transport = self.transport.clone();
        let handshake = tokio::time::timeout(self.settings.handshake_timeout, transport.open(&url));
        tokio::pin!(handshake);

        loop {
            tokio::select! {
                result = &mut handshake => {
                    return match result {
                        Ok(Ok(socket)) => Phase::Open(socket),
                        Ok(Err(e)) => {
                            log_warn!("{kind} channel: {e}");
                            self.failure(ChannelError::Transport(e.to_string()))
                        }
                        Err(_) => {
                            log_warn!("{kind} channel: handshake timed out");
                            self.failure(ChannelError::HandshakeTimeout)
                        }
                    };
                }
                command = self.commands.next() => {
                    match command {
                        None => return Phase::Stop,
                        Some(Command::Connect) => {}
                        Some(Command::Reconnect) => return Phase::Connect,
                        Some(Command::Shutdown) => {
                            log_debug!("{kind} channel: shutdown during handshake");
                            self.forget();
                            self.publish(ChannelState::Closed, None);
                            return Phase::Idle;
                        }
                        Some(other) => {
                            self.absorb(other);
                        }
                    }
                }
            }
        }
    }

    async fn open(&mut self, mut socket: Box<dyn Socket>) -> Phase {
        let kind = self.settings.kind;
        self.counter.reset();

        if let Err(reason) = self.flush(socket.as_mut()).await {
            return self.failure(ChannelError::Transport(reason));
        }
        for frame in self.subscriptions.replay_frames() {
            let text = match OutboundFrame::from(frame).encode() {
                Ok(text) => text,
                Err(e) => {
                    log_error!("{kind} channel: cannot encode subscription: {e}");
                    continue;
                }
            };
            if let Err(e) = socket.send_text(text).await {
                return self.failure(ChannelError::Transport(e.to_string()));
            }
        }

        self.publish(ChannelState::Open, None);
        log_info!("{kind} channel open");

        let exit = loop {
            tokio::select! {
                event = socket.next_event() => {
                    match event {
                        Some(SocketEvent::Text(text)) => self.dispatch(&text),
                        Some(SocketEvent::Closed { code, reason }) => {
                            break Exit::Closed { code, reason }
                        }
                        Some(SocketEvent::Error(e)) => break Exit::Failed(e),
                        None => break Exit::Failed(format!("stream ended (code {CLOSE_ABNORMAL})")),
                    }
                }
                command = self.commands.next() => {
                    match command {
                        None => {
                            let _ = socket.close(CLOSE_NORMAL, "Client shutting down").await;
                            return Phase::Stop;
                        }
                        Some(Command::Connect) => {}
                        Some(Command::Reconnect) => {
                            log_info!("{kind} channel: session changed, reconnecting");
                            let _ = socket.close(CLOSE_NORMAL, "Session changed").await;
                            return Phase::Connect;
                        }
                        Some(Command::Shutdown) => {
                            self.publish_state(ChannelState::Closing);
                            if let Err(e) = socket.close(CLOSE_NORMAL, "Client disconnect").await {
                                log_debug!("{kind} channel: close failed: {e}");
                            }
                            self.forget();
                            self.publish(ChannelState::Closed, None);
                            return Phase::Idle;
                        }
                        Some(Command::Send(frame)) => {
                            self.queue.push(frame);
                            if let Err(reason) = self.flush(socket.as_mut()).await {
                                break Exit::Failed(reason);
                            }
                        }
                        Some(Command::Subscribe(topic)) => {
                            if self.subscriptions.insert(topic.clone()) {
                                let frame = ControlFrame::subscribe(&topic).into();
                                if let Err(reason) = send_frame(socket.as_mut(), frame).await {
                                    break Exit::Failed(reason);
                                }
                            }
                        }
                        Some(Command::Unsubscribe(topic)) => {
                            if self.subscriptions.remove(&topic) {
                                let frame = ControlFrame::unsubscribe(&topic).into();
                                if let Err(reason) = send_frame(socket.as_mut(), frame).await {
                                    break Exit::Failed(reason);
                                }
                            }
                        }
                    }
                }
            }
        };

        match exit {
            Exit::Closed { code, reason } => self.closed(code, &reason),
            Exit::Failed(reason) => {
                log_warn!("{kind} channel lost: {reason}");
                self.failure(ChannelError::Transport(reason))
            }
        }
    }

    /// Send queued frames in order. A frame leaves the queue only after the
    /// transport accepted it.
    async fn flush(&mut self, socket: &mut dyn Socket) -> Result<(), String> {
        while let Some(frame) = self.queue.front() {
            let text = match frame.encode() {
                Ok(text) => text,
                Err(e) => {
                    log_error!("{} channel: dropping unencodable frame: {e}", self.settings.kind);
                    self.queue.pop_sent();
                    continue;
                }
            };
            socket.send_text(text).await.map_err(|e| e.to_string())?;
            self.queue.pop_sent();
        }
        Ok(())
    }

    fn dispatch(&self, text: &str) {
        let kind = self.settings.kind;
        match InboundFrame::decode(text) {
            Ok(InboundFrame::Unknown { kind: frame_kind, .. }) => {
                log_debug!("{kind} channel: ignoring unknown frame type {frame_kind:?}");
            }
            Ok(frame) => (self.hooks.on_frame)(kind, frame),
            Err(e) => log_warn!("{kind} channel: dropping frame: {e}"),
        }
    }

    fn closed(&mut self, code: u16, reason: &str) -> Phase {
        let kind = self.settings.kind;
        match classify_close(code, reason) {
            CloseClass::Normal => {
                log_info!("{kind} channel closed normally ({code})");
                self.publish(ChannelState::Closed, None);
                Phase::Idle
            }
            CloseClass::Authentication => {
                log_warn!("{kind} channel rejected by server ({code} {reason:?})");
                self.publish(ChannelState::Closed, Some(ChannelError::Authentication));
                (self.hooks.on_auth_failure)(kind);
                Phase::Idle
            }
            CloseClass::Transient => {
                log_warn!("{kind} channel closed ({code} {reason:?})");
                self.failure(ChannelError::Transport(format!("closed with code {code}")))
            }
        }
    }

    /// Record a failed connect or a lost connection and decide whether to
    /// retry.
    fn failure(&mut self, error: ChannelError) -> Phase {
        let kind = self.settings.kind;
        let failures = self.counter.record_failure();
        match self.settings.reconnect.delay_for_attempt(failures) {
            Some(delay) => {
                log_info!(
                    "{kind} channel: reconnecting in {}ms (attempt {}/{})",
                    delay.as_millis(),
                    failures,
                    self.settings.reconnect.max_attempts
                );
                self.publish(ChannelState::Closed, Some(error));
                Phase::Backoff(delay)
            }
            None => {
                let attempts = self.settings.reconnect.max_attempts;
                log_error!("{kind} channel: giving up after {attempts} attempts");
                self.publish(
                    ChannelState::Closed,
                    Some(ChannelError::MaxAttemptsExceeded { attempts }),
                );
                Phase::Idle
            }
        }
    }

    async fn backoff(&mut self, delay: Duration) -> Phase {
        let timer = tokio::time::sleep(delay);
        tokio::pin!(timer);

        loop {
            tokio::select! {
                _ = &mut timer => return Phase::Connect,
                command = self.commands.next() => {
                    match command {
                        None => return Phase::Stop,
                        Some(Command::Connect) | Some(Command::Reconnect) => return Phase::Connect,
                        Some(Command::Shutdown) => {
                            log_debug!("{} channel: reconnect cancelled", self.settings.kind);
                            self.forget();
                            self.publish(ChannelState::Closed, None);
                            return Phase::Idle;
                        }
                        Some(other) => {
                            self.absorb(other);
                        }
                    }
                }
            }
        }
    }
}

async fn send_frame(socket: &mut dyn Socket, frame: OutboundFrame) -> Result<(), String> {
    let text = frame.encode().map_err(|e| e.to_string())?;
    socket.send_text(text).await.map_err(|e| e.to_string())
}
