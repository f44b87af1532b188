//! Forwards admitted requests to the upstream API.

use std::sync::Arc;

use axum::body::{to_bytes, Bytes};
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::{trace, warn};

/// Headers that describe one hop and must not be forwarded.
const HOP_BY_HOP: [header::HeaderName; 8] = [
    header::CONNECTION,
    header::CONTENT_LENGTH,
    header::HOST,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// State shared by the proxy handler.
#[derive(Clone)]
pub struct ProxyState {
    client: reqwest::Client,
    upstream: Arc<str>,
    body_limit: usize,
}

impl ProxyState {
    pub fn new(client: reqwest::Client, upstream: &str, body_limit: usize) -> Self {
        Self {
            client,
            upstream: Arc::from(upstream.trim_end_matches('/')),
            body_limit,
        }
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP.iter() {
        headers.remove(name);
    }
    headers.remove("keep-alive");
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

/// Forward the request upstream and relay the answer.
pub async fn forward(State(state): State<ProxyState>, req: Request) -> Response {
    let (parts, body) = req.into_parts();
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = format!("{}{}", state.upstream, path);

    let body: Bytes = match to_bytes(body, state.body_limit).await {
        Ok(body) => body,
        Err(_) => return error_response(StatusCode::PAYLOAD_TOO_LARGE, "Request body too large"),
    };

    let mut headers = parts.headers;
    strip_hop_by_hop(&mut headers);

    trace!(method = %parts.method, url = %url, "Forwarding request");
    let upstream = state
        .client
        .request(parts.method, &url)
        .headers(headers)
        .body(body)
        .send()
        .await;

    let upstream = match upstream {
        Ok(upstream) => upstream,
        Err(error) => {
            warn!(url = %url, %error, "Upstream request failed");
            return error_response(StatusCode::BAD_GATEWAY, "Upstream unavailable");
        }
    };

    let status = upstream.status();
    let mut headers = upstream.headers().clone();
    strip_hop_by_hop(&mut headers);

    match upstream.bytes().await {
        Ok(bytes) => {
            let mut response = (status, bytes).into_response();
            response.headers_mut().extend(headers);
            response
        }
        Err(error) => {
            warn!(url = %url, %error, "Failed to read upstream response");
            error_response(StatusCode::BAD_GATEWAY, "Upstream response unreadable")
        }
    }
}
