//! WebSocket transport.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::trace;

use super::transport::{Channel, Transport, TransportError};

/// First frame sent on every new channel.
#[derive(Serialize)]
struct AuthFrame<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    token: &'a str,
}

/// Opens WebSocket channels at `{endpoint}{path}`.
///
/// The session token travels in an `auth` frame sent right after the
/// upgrade, never in a header or the URL.
#[derive(Debug, Clone)]
pub struct WsTransport {
    path: String,
    connect_timeout: Duration,
}

impl WsTransport {
    pub fn new(path: &str, connect_timeout: Duration) -> Self {
        Self {
            path: path.to_string(),
            connect_timeout,
        }
    }

    /// `http(s)://` endpoints become `ws(s)://`.
    pub fn url_for(&self, endpoint: &str) -> String {
        let endpoint = if let Some(rest) = endpoint.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = endpoint.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            endpoint.to_string()
        };
        format!("{}{}", endpoint.trim_end_matches('/'), self.path)
    }
}

#[async_trait]
impl Transport for WsTransport {
    fn name(&self) -> &str {
        "websocket"
    }

    async fn open(&self, endpoint: &str, auth_token: &str) -> Result<Box<dyn Channel>, TransportError> {
        let url = self.url_for(endpoint);
        trace!(url = %url, "Opening WebSocket");

        let (mut stream, _response) = tokio::time::timeout(self.connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| TransportError::Connect("timed out".to_string()))?
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let auth = serde_json::to_string(&AuthFrame {
            kind: "auth",
            token: auth_token,
        })
        .map_err(|e| TransportError::Handshake(e.to_string()))?;
        stream
            .send(Message::Text(auth))
            .await
            .map_err(|e| TransportError::Handshake(e.to_string()))?;

        Ok(Box::new(WsChannel { stream }))
    }
}

struct WsChannel {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Channel for WsChannel {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Close(_)) => return None,
                // Pings are answered by tungstenite itself.
                Ok(_) => continue,
                Err(e) => return Some(Err(TransportError::Io(e.to_string()))),
            }
        }
    }
}
