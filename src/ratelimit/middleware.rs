//! axum middleware enforcing a [`RateLimiter`] in front of a route family.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::{from_fn_with_state, Next};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::limiter::{Admission, RateLimiter};

/// JSON body of a 429 response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitedBody {
    pub error: String,
    pub retry_after_seconds: u64,
}

/// State handed to [`enforce`].
#[derive(Clone)]
pub struct RateLimitState {
    limiter: Arc<RateLimiter>,
    trust_forwarded_for: bool,
}

impl RateLimitState {
    pub fn new(limiter: Arc<RateLimiter>, trust_forwarded_for: bool) -> Self {
        Self {
            limiter,
            trust_forwarded_for,
        }
    }
}

/// Put every route of `router` behind `limiter`.
pub fn protect<S>(router: Router<S>, limiter: Arc<RateLimiter>, trust_forwarded_for: bool) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router.route_layer(from_fn_with_state(
        RateLimitState::new(limiter, trust_forwarded_for),
        enforce,
    ))
}

/// Admit the request or answer 429 with `Retry-After`.
pub async fn enforce(State(state): State<RateLimitState>, req: Request, next: Next) -> Response {
    let client = client_identifier(&req, state.trust_forwarded_for);
    let limit = state.limiter.config().max_requests;

    match state.limiter.check(&client).await {
        Admission::Allowed { remaining } => {
            let mut response = next.run(req).await;
            let headers = response.headers_mut();
            headers.insert("x-ratelimit-limit", HeaderValue::from(limit));
            headers.insert("x-ratelimit-remaining", HeaderValue::from(remaining));
            response
        }
        Admission::Rejected { retry_after_secs } => {
            info!(
                prefix = %state.limiter.config().key_prefix,
                client = %client,
                retry_after_secs,
                "Request rejected by rate limiter"
            );
            rejection(&state.limiter.config().message, retry_after_secs)
        }
    }
}

fn rejection(message: &str, retry_after_secs: u64) -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        [(header::RETRY_AFTER, HeaderValue::from(retry_after_secs))],
        Json(RateLimitedBody {
            error: message.to_string(),
            retry_after_seconds: retry_after_secs,
        }),
    )
        .into_response()
}

/// Derive the client identifier for a request.
///
/// With `trust_forwarded_for` the first `X-Forwarded-For` entry wins;
/// otherwise the peer address is used. Falls back to `"unknown"`.
pub fn client_identifier(req: &Request, trust_forwarded_for: bool) -> String {
    if trust_forwarded_for {
        let forwarded = req
            .headers()
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        if let Some(ip) = forwarded {
            return ip.to_string();
        }
    }

    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}
