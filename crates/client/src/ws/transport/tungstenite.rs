//! Native WebSocket transport using tokio-tungstenite.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use super::{Socket, SocketEvent, Transport, TransportError};

/// Close code reported when the server sent a close frame without a status.
const CLOSE_NO_STATUS: u16 = 1005;

#[derive(Debug, Clone, Copy, Default)]
pub struct TungsteniteTransport;

impl TungsteniteTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for TungsteniteTransport {
    async fn open(&self, url: &Url) -> Result<Box<dyn Socket>, TransportError> {
        crate::log_debug!("Opening WebSocket to {}{}", url.host_str().unwrap_or(""), url.path());
        let (stream, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        Ok(Box::new(TungsteniteSocket { stream }))
    }
}

struct TungsteniteSocket {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Socket for TungsteniteSocket {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.stream
            .send(Message::text(text))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn next_event(&mut self) -> Option<SocketEvent> {
        while let Some(msg_result) = self.stream.next().await {
            match msg_result {
                Ok(Message::Text(text)) => return Some(SocketEvent::Text(text.as_str().to_owned())),
                Ok(Message::Close(frame)) => {
                    let (code, reason) = match frame {
                        Some(frame) => (u16::from(frame.code), frame.reason.as_str().to_owned()),
                        None => (CLOSE_NO_STATUS, String::new()),
                    };
                    return Some(SocketEvent::Closed { code, reason });
                }
                Ok(Message::Ping(data)) => {
                    // Pong is handled automatically by tungstenite
                    crate::log_debug!("Received ping: {:?}", data);
                }
                Ok(_) => {
                    // Binary, pong and raw frames carry nothing for us
                }
                Err(e) => return Some(SocketEvent::Error(e.to_string())),
            }
        }
        None
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError> {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_owned().into(),
        };
        self.stream
            .close(Some(frame))
            .await
            .map_err(|e| TransportError::Close(e.to_string()))
    }
}
