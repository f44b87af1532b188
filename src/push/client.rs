//! Client for the push registration endpoint.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::trace;

/// Errors from a single registration attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
    /// The backend answered with a non-2xx status
    #[error("registration rejected with status {0}")]
    Status(u16),

    /// The request never produced a response
    #[error("registration transport error: {0}")]
    Transport(String),
}

/// Sends a device push handle to the backend.
#[async_trait]
pub trait RegistrationClient: Send + Sync {
    /// Register `push_token` for the session identified by `auth_token`.
    async fn register(&self, auth_token: &str, push_token: &str) -> Result<(), RegistrationError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RegisterRequest<'a> {
    push_token: &'a str,
}

/// `POST {base}/push/register` over HTTP.
#[derive(Debug, Clone)]
pub struct HttpRegistrationClient {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpRegistrationClient {
    /// Create a client for the given REST base URL.
    pub fn new(base_url: &str, timeout: Duration) -> crate::error::Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(http, base_url))
    }

    /// Reuse an existing HTTP client.
    pub fn with_client(http: reqwest::Client, base_url: &str) -> Self {
        Self {
            http,
            endpoint: format!("{}/push/register", base_url.trim_end_matches('/')),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl RegistrationClient for HttpRegistrationClient {
    async fn register(&self, auth_token: &str, push_token: &str) -> Result<(), RegistrationError> {
        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(auth_token)
            .json(&RegisterRequest { push_token })
            .send()
            .await
            .map_err(|e| RegistrationError::Transport(e.to_string()))?;

        let status = response.status();
        trace!(status = status.as_u16(), "Push registration response");
        if status.is_success() {
            Ok(())
        } else {
            Err(RegistrationError::Status(status.as_u16()))
        }
    }
}
