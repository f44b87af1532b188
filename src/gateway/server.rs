//! Gateway server implementation.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::response::IntoResponse;
use axum::routing::{any, get};
use axum::{Json, Router};
use tokio::net::TcpListener;
use tracing::{error, info};

use super::proxy::{forward, ProxyState};
use crate::config::HeartlineConfig;
use crate::error::{HeartlineError, Result};
use crate::ratelimit::{protect, spawn_sweeper, AuthLimiters, CounterStore, MemoryCounterStore, RateLimiter};

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// Build the gateway routes.
///
/// Each auth route family sits behind its own limiter; every other path is
/// forwarded unthrottled.
pub fn router(limiters: &AuthLimiters, trust_forwarded_for: bool, proxy: ProxyState) -> Router {
    let limited = |path: &str, limiter: &Arc<RateLimiter>| {
        protect(
            Router::new().route(path, any(forward)),
            limiter.clone(),
            trust_forwarded_for,
        )
    };

    Router::new()
        .route("/health", get(health))
        .merge(limited("/auth/login", &limiters.login))
        .merge(limited("/auth/signup", &limiters.signup))
        .merge(limited("/auth/forgot-password", &limiters.forgot_password))
        .merge(limited(
            "/auth/reset-password/verify",
            &limiters.reset_password_verify,
        ))
        .fallback(forward)
        .with_state(proxy)
}

/// The gateway process: limiters, counter sweeper and HTTP listener.
pub struct GatewayServer {
    config: HeartlineConfig,
}

impl GatewayServer {
    pub fn new(config: HeartlineConfig) -> Self {
        Self { config }
    }

    /// Serve until `signal` resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let server = &self.config.server;
        let limits = &self.config.rate_limits;

        let store: Arc<dyn CounterStore> = Arc::new(MemoryCounterStore::new());
        let limiters = AuthLimiters::new(limits, store.clone());
        let sweeper = spawn_sweeper(store, limits.sweep_interval());

        let client = reqwest::Client::builder().build()?;
        let proxy = ProxyState::new(client, &server.upstream_url, server.body_limit_bytes);
        let app = router(&limiters, limits.trust_forwarded_for, proxy);

        let listener = TcpListener::bind(server.listen_addr).await?;
        info!(
            addr = %server.listen_addr,
            upstream = %server.upstream_url,
            bypass = limits.bypass,
            "Gateway listening"
        );

        let result = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "Gateway server failed");
            HeartlineError::Server(e.to_string())
        });

        sweeper.abort();
        result
    }
}
