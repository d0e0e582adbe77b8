//! In-memory transport for tests and offline development.
//!
//! Every accepted connection yields a [`MemoryPeer`], the server end of the
//! socket, which a test drives directly: push frames, close with a code, read
//! what the client sent. Connection attempts can be scripted per endpoint
//! path to refuse or hang.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use url::Url;

use super::{Socket, SocketEvent, Transport, TransportError};

/// What the next connection attempt to a path does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectBehavior {
    Accept,
    Refuse(String),
    /// Never complete the handshake.
    Hang,
}

/// A recorded call to [`Transport::open`].
#[derive(Debug, Clone)]
pub struct ConnectAttempt {
    pub url: Url,
    pub at: Instant,
}

#[derive(Default)]
struct MemoryState {
    scripts: HashMap<String, VecDeque<ConnectBehavior>>,
    attempts: HashMap<String, Vec<ConnectAttempt>>,
    peers: HashMap<String, VecDeque<MemoryPeer>>,
}

#[derive(Clone, Default)]
pub struct MemoryTransport {
    state: Arc<Mutex<MemoryState>>,
    accepted: Arc<Notify>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue behaviors for the next attempts on `path`. Once the script is
    /// used up, attempts are accepted.
    pub fn script(&self, path: &str, behaviors: impl IntoIterator<Item = ConnectBehavior>) {
        self.state
            .lock()
            .scripts
            .entry(path.to_string())
            .or_default()
            .extend(behaviors);
    }

    pub fn attempts(&self, path: &str) -> Vec<ConnectAttempt> {
        self.state
            .lock()
            .attempts
            .get(path)
            .cloned()
            .unwrap_or_default()
    }

    pub fn attempt_count(&self, path: &str) -> usize {
        self.state.lock().attempts.get(path).map_or(0, Vec::len)
    }

    /// Gaps between consecutive attempts on `path`.
    pub fn attempt_gaps(&self, path: &str) -> Vec<Duration> {
        let attempts = self.attempts(path);
        attempts
            .windows(2)
            .map(|pair| pair[1].at.duration_since(pair[0].at))
            .collect()
    }

    /// Take the oldest accepted connection on `path` that no one took yet.
    pub fn try_take_peer(&self, path: &str) -> Option<MemoryPeer> {
        self.state.lock().peers.get_mut(path)?.pop_front()
    }

    /// Wait for the next accepted connection on `path`.
    pub async fn next_peer(&self, path: &str) -> MemoryPeer {
        loop {
            let accepted = self.accepted.notified();
            if let Some(peer) = self.try_take_peer(path) {
                return peer;
            }
            accepted.await;
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self, url: &Url) -> Result<Box<dyn Socket>, TransportError> {
        let path = url.path().to_string();
        let behavior = {
            let mut state = self.state.lock();
            state
                .attempts
                .entry(path.clone())
                .or_default()
                .push(ConnectAttempt {
                    url: url.clone(),
                    at: Instant::now(),
                });
            state
                .scripts
                .get_mut(&path)
                .and_then(VecDeque::pop_front)
                .unwrap_or(ConnectBehavior::Accept)
        };

        match behavior {
            ConnectBehavior::Refuse(reason) => Err(TransportError::Connect(reason)),
            ConnectBehavior::Hang => {
                std::future::pending::<()>().await;
                Err(TransportError::Connect("handshake never completed".into()))
            }
            ConnectBehavior::Accept => {
                let (to_client, from_server) = mpsc::unbounded_channel();
                let (to_server, from_client) = mpsc::unbounded_channel();
                let client_close = Arc::new(Mutex::new(None));

                let peer = MemoryPeer {
                    url: url.clone(),
                    to_client,
                    from_client,
                    client_close: client_close.clone(),
                };
                self.state
                    .lock()
                    .peers
                    .entry(path)
                    .or_default()
                    .push_back(peer);
                self.accepted.notify_waiters();

                Ok(Box::new(MemorySocket {
                    from_server,
                    to_server,
                    client_close,
                }))
            }
        }
    }
}

struct MemorySocket {
    from_server: mpsc::UnboundedReceiver<SocketEvent>,
    to_server: mpsc::UnboundedSender<String>,
    client_close: Arc<Mutex<Option<(u16, String)>>>,
}

#[async_trait]
impl Socket for MemorySocket {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.to_server
            .send(text)
            .map_err(|_| TransportError::Send("peer dropped".into()))
    }

    async fn next_event(&mut self) -> Option<SocketEvent> {
        self.from_server.recv().await
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError> {
        *self.client_close.lock() = Some((code, reason.to_string()));
        self.from_server.close();
        Ok(())
    }
}

/// Server end of an in-memory socket.
pub struct MemoryPeer {
    pub url: Url,
    to_client: mpsc::UnboundedSender<SocketEvent>,
    from_client: mpsc::UnboundedReceiver<String>,
    client_close: Arc<Mutex<Option<(u16, String)>>>,
}

impl MemoryPeer {
    /// The `token` query parameter the client connected with.
    pub fn token(&self) -> Option<String> {
        self.url
            .query_pairs()
            .find(|(key, _)| key == "token")
            .map(|(_, value)| value.into_owned())
    }

    pub fn send_text(&self, text: impl Into<String>) {
        let _ = self.to_client.send(SocketEvent::Text(text.into()));
    }

    /// Close from the server side with a close frame.
    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.to_client.send(SocketEvent::Closed {
            code,
            reason: reason.to_string(),
        });
    }

    /// Report a socket error to the client.
    pub fn fail(&self, error: &str) {
        let _ = self.to_client.send(SocketEvent::Error(error.to_string()));
    }

    /// Next frame the client sent, waiting if needed.
    pub async fn recv_text(&mut self) -> Option<String> {
        self.from_client.recv().await
    }

    /// Everything the client sent so far, without waiting.
    pub fn drain(&mut self) -> Vec<String> {
        let mut frames = Vec::new();
        while let Ok(text) = self.from_client.try_recv() {
            frames.push(text);
        }
        frames
    }

    /// The close code and reason the client closed with, if it did.
    pub fn client_close(&self) -> Option<(u16, String)> {
        self.client_close.lock().clone()
    }
}

impl std::fmt::Debug for MemoryPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryPeer").field("url", &self.url.as_str()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(path: &str) -> Url {
        Url::parse(&format!("ws://chat.test{path}?token=abc")).unwrap()
    }

    #[tokio::test]
    async fn accepted_socket_pairs_with_peer() {
        let transport = MemoryTransport::new();
        let mut socket = transport.open(&url("/ws/messages")).await.unwrap();
        let mut peer = transport.next_peer("/ws/messages").await;
        assert_eq!(peer.token().as_deref(), Some("abc"));

        socket.send_text("ping".into()).await.unwrap();
        assert_eq!(peer.recv_text().await.as_deref(), Some("ping"));

        peer.send_text("pong");
        assert_eq!(socket.next_event().await, Some(SocketEvent::Text("pong".into())));

        socket.close(1000, "bye").await.unwrap();
        assert_eq!(peer.client_close(), Some((1000, "bye".into())));
    }

    #[tokio::test]
    async fn scripted_refusals_are_recorded() {
        let transport = MemoryTransport::new();
        transport.script("/ws/presence", [ConnectBehavior::Refuse("down".into())]);

        let err = transport.open(&url("/ws/presence")).await.err();
        assert_eq!(err, Some(TransportError::Connect("down".into())));
        assert!(transport.open(&url("/ws/presence")).await.is_ok());
        assert_eq!(transport.attempt_count("/ws/presence"), 2);
        assert_eq!(transport.attempt_count("/ws/messages"), 0);
    }

    #[tokio::test]
    async fn dropped_peer_ends_the_stream() {
        let transport = MemoryTransport::new();
        let mut socket = transport.open(&url("/ws/messages")).await.unwrap();
        drop(transport.try_take_peer("/ws/messages"));
        assert_eq!(socket.next_event().await, None);
        assert!(socket.send_text("late".into()).await.is_err());
    }
}
