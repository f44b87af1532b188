//! Transport abstraction for the realtime channel.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors raised by a transport or an open channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("channel I/O error: {0}")]
    Io(String),
    #[error("channel closed")]
    Closed,
}

/// One open bidirectional channel.
#[async_trait]
pub trait Channel: Send {
    /// Send a text frame.
    async fn send(&mut self, text: String) -> Result<(), TransportError>;

    /// Wait for the next inbound text frame.
    ///
    /// Returns `None` once the peer has closed the channel. Must be cancel
    /// safe: dropping the future loses no message.
    async fn recv(&mut self) -> Option<Result<String, TransportError>>;
}

/// Opens channels to a realtime endpoint.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Open a channel, authenticating with `auth_token` during the handshake.
    async fn open(&self, endpoint: &str, auth_token: &str) -> Result<Box<dyn Channel>, TransportError>;
}

/// Tries each transport in preference order and keeps the first that opens.
pub struct FallbackTransport {
    transports: Vec<Arc<dyn Transport>>,
}

impl FallbackTransport {
    /// Prefer `primary`, fall back to `fallback`.
    pub fn new(primary: Arc<dyn Transport>, fallback: Arc<dyn Transport>) -> Self {
        Self {
            transports: vec![primary, fallback],
        }
    }
}

#[async_trait]
impl Transport for FallbackTransport {
    fn name(&self) -> &str {
        "fallback"
    }

    async fn open(&self, endpoint: &str, auth_token: &str) -> Result<Box<dyn Channel>, TransportError> {
        let mut last_error = TransportError::Connect("no transports configured".to_string());

        for transport in &self.transports {
            match transport.open(endpoint, auth_token).await {
                Ok(channel) => {
                    debug!(transport = transport.name(), "Realtime transport opened");
                    return Ok(channel);
                }
                Err(error) => {
                    warn!(transport = transport.name(), %error, "Realtime transport failed, trying next");
                    last_error = error;
                }
            }
        }

        Err(last_error)
    }
}

/// Derive the realtime endpoint from the REST base URL by removing a
/// trailing path segment such as `/api`.
pub fn realtime_endpoint(rest_base: &str, strip_suffix: &str) -> String {
    let base = rest_base.trim_end_matches('/');
    let suffix = strip_suffix.trim_end_matches('/');

    let base = if suffix.is_empty() {
        base
    } else {
        base.strip_suffix(suffix).unwrap_or(base)
    };
    base.trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Named {
        name: &'static str,
        succeed: bool,
        attempts: Arc<Mutex<Vec<&'static str>>>,
    }

    struct NullChannel;

    #[async_trait]
    impl Channel for NullChannel {
        async fn send(&mut self, _text: String) -> Result<(), TransportError> {
            Ok(())
        }

        async fn recv(&mut self) -> Option<Result<String, TransportError>> {
            None
        }
    }

    #[async_trait]
    impl Transport for Named {
        fn name(&self) -> &str {
            self.name
        }

        async fn open(&self, _endpoint: &str, _auth_token: &str) -> Result<Box<dyn Channel>, TransportError> {
            self.attempts.lock().push(self.name);
            if self.succeed {
                Ok(Box::new(NullChannel))
            } else {
                Err(TransportError::Connect(format!("{} unavailable", self.name)))
            }
        }
    }

    fn pair(primary_ok: bool, fallback_ok: bool) -> (FallbackTransport, Arc<Mutex<Vec<&'static str>>>) {
        let attempts = Arc::new(Mutex::new(Vec::new()));
        let primary = Arc::new(Named {
            name: "websocket",
            succeed: primary_ok,
            attempts: attempts.clone(),
        });
        let fallback = Arc::new(Named {
            name: "polling",
            succeed: fallback_ok,
            attempts: attempts.clone(),
        });
        (FallbackTransport::new(primary, fallback), attempts)
    }

    #[tokio::test]
    async fn test_primary_preferred() {
        let (transport, attempts) = pair(true, true);
        assert!(transport.open("ws://x", "t").await.is_ok());
        assert_eq!(*attempts.lock(), vec!["websocket"]);
    }

    #[tokio::test]
    async fn test_fallback_used_when_primary_fails() {
        let (transport, attempts) = pair(false, true);
        assert!(transport.open("ws://x", "t").await.is_ok());
        assert_eq!(*attempts.lock(), vec!["websocket", "polling"]);
    }

    #[tokio::test]
    async fn test_last_error_reported_when_all_fail() {
        let (transport, _attempts) = pair(false, false);
        let err = transport.open("ws://x", "t").await.err().unwrap();
        assert_eq!(err, TransportError::Connect("polling unavailable".to_string()));
    }

    #[test]
    fn test_realtime_endpoint_strips_suffix() {
        assert_eq!(
            realtime_endpoint("https://api.heartline.app/api", "/api"),
            "https://api.heartline.app"
        );
        assert_eq!(
            realtime_endpoint("https://api.heartline.app/api/", "/api"),
            "https://api.heartline.app"
        );
        assert_eq!(
            realtime_endpoint("http://10.0.2.2:3000", "/api"),
            "http://10.0.2.2:3000"
        );
        assert_eq!(realtime_endpoint("http://host/v1/api", ""), "http://host/v1/api");
    }
}
