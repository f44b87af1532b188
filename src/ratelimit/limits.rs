//! Limiter configurations and the named route-family presets.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::limiter::RateLimiter;
use super::store::CounterStore;

const MINUTE_MS: u64 = 60 * 1000;

/// Configuration for a single limiter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitConfig {
    /// Prefix separating this limiter's counters from others in the store
    pub key_prefix: String,
    /// Window length in milliseconds
    pub window_ms: u64,
    /// Requests admitted per client per window
    pub max_requests: u32,
    /// Message returned in the `error` field of a 429 body
    #[serde(default = "default_message")]
    pub message: String,
}

fn default_message() -> String {
    "Too many requests, please try again later.".to_string()
}

impl LimitConfig {
    pub fn new(key_prefix: &str, window: Duration, max_requests: u32) -> Self {
        Self {
            key_prefix: key_prefix.to_string(),
            window_ms: window.as_millis() as u64,
            max_requests,
            message: default_message(),
        }
    }

    pub fn with_message(mut self, message: &str) -> Self {
        self.message = message.to_string();
        self
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// 10 requests per 15 minutes.
    pub fn login() -> Self {
        Self::new("login", Duration::from_millis(15 * MINUTE_MS), 10)
            .with_message("Too many login attempts, please try again later.")
    }

    /// 5 requests per hour.
    pub fn signup() -> Self {
        Self::new("signup", Duration::from_millis(60 * MINUTE_MS), 5)
            .with_message("Too many accounts created from this address, please try again later.")
    }

    /// 5 requests per 15 minutes.
    pub fn forgot_password() -> Self {
        Self::new("forgot-password", Duration::from_millis(15 * MINUTE_MS), 5)
            .with_message("Too many password reset requests, please try again later.")
    }

    /// 10 requests per 15 minutes.
    pub fn reset_password_verify() -> Self {
        Self::new("reset-password-verify", Duration::from_millis(15 * MINUTE_MS), 10)
            .with_message("Too many verification attempts, please try again later.")
    }

    /// Reject configurations that could never admit anything.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.window_ms == 0 {
            return Err(format!("limit '{}': window_ms must be positive", self.key_prefix));
        }
        if self.max_requests == 0 {
            return Err(format!(
                "limit '{}': max_requests must be positive",
                self.key_prefix
            ));
        }
        Ok(())
    }
}

/// Rate limiting configuration for the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitsConfig {
    /// Admit everything without counting
    #[serde(default)]
    pub bypass: bool,

    /// How often expired counters are swept, in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Identify clients by the first `X-Forwarded-For` entry
    #[serde(default)]
    pub trust_forwarded_for: bool,

    #[serde(default = "LimitConfig::login")]
    pub login: LimitConfig,

    #[serde(default = "LimitConfig::signup")]
    pub signup: LimitConfig,

    #[serde(default = "LimitConfig::forgot_password")]
    pub forgot_password: LimitConfig,

    #[serde(default = "LimitConfig::reset_password_verify")]
    pub reset_password_verify: LimitConfig,
}

fn default_sweep_interval() -> u64 {
    60
}

impl Default for RateLimitsConfig {
    fn default() -> Self {
        Self {
            bypass: false,
            sweep_interval_secs: default_sweep_interval(),
            trust_forwarded_for: false,
            login: LimitConfig::login(),
            signup: LimitConfig::signup(),
            forgot_password: LimitConfig::forgot_password(),
            reset_password_verify: LimitConfig::reset_password_verify(),
        }
    }
}

impl RateLimitsConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    /// All named limits.
    pub fn all(&self) -> [&LimitConfig; 4] {
        [
            &self.login,
            &self.signup,
            &self.forgot_password,
            &self.reset_password_verify,
        ]
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        self.all().iter().try_for_each(|limit| limit.validate())
    }
}

/// One limiter per protected route family, all over one store.
pub struct AuthLimiters {
    pub login: Arc<RateLimiter>,
    pub signup: Arc<RateLimiter>,
    pub forgot_password: Arc<RateLimiter>,
    pub reset_password_verify: Arc<RateLimiter>,
}

impl AuthLimiters {
    pub fn new(config: &RateLimitsConfig, store: Arc<dyn CounterStore>) -> Self {
        let build = |limit: &LimitConfig| {
            Arc::new(RateLimiter::new(limit.clone(), store.clone()).with_bypass(config.bypass))
        };

        Self {
            login: build(&config.login),
            signup: build(&config.signup),
            forgot_password: build(&config.forgot_password),
            reset_password_verify: build(&config.reset_password_verify),
        }
    }
}
