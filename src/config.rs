//! Configuration management for Heartline.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::{BackoffPolicy, ExponentialBackoff, Jittered};
use crate::error::{HeartlineError, Result};
use crate::ratelimit::RateLimitsConfig;

/// Main configuration for Heartline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeartlineConfig {
    /// Gateway server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limits: RateLimitsConfig,

    /// Push registration configuration
    #[serde(default)]
    pub push: PushConfig,

    /// Realtime connection configuration
    #[serde(default)]
    pub realtime: RealtimeConfig,
}

/// Gateway server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the gateway listens on
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Base URL of the API that admitted requests are forwarded to
    #[serde(default = "default_upstream_url")]
    pub upstream_url: String,

    /// Largest request body forwarded upstream
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            upstream_url: default_upstream_url(),
            body_limit_bytes: default_body_limit(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_upstream_url() -> String {
    "http://127.0.0.1:3000".to_string()
}

fn default_body_limit() -> usize {
    1024 * 1024
}

/// Push registration configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushConfig {
    /// REST base URL; the endpoint is `{base_url}/push/register`
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_push_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            max_attempts: default_push_attempts(),
            initial_delay_ms: default_initial_delay(),
            multiplier: default_multiplier(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl PushConfig {
    /// 1s, 2s, 4s, ... between attempts.
    pub fn backoff(&self) -> Arc<dyn BackoffPolicy> {
        Arc::new(ExponentialBackoff::new(
            Duration::from_millis(self.initial_delay_ms),
            self.multiplier,
        ))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn default_base_url() -> String {
    "http://127.0.0.1:3000/api".to_string()
}

fn default_push_attempts() -> u32 {
    3
}

fn default_initial_delay() -> u64 {
    1000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_request_timeout() -> u64 {
    10
}

/// Realtime connection configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimeConfig {
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Consecutive failed connects before giving up; unset retries forever
    #[serde(default)]
    pub max_attempts: Option<u32>,

    /// Trailing segment removed from the REST base URL
    #[serde(default = "default_strip_suffix")]
    pub strip_suffix: String,

    /// Path of the WebSocket endpoint
    #[serde(default = "default_ws_path")]
    pub ws_path: String,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Randomize reconnect delays
    #[serde(default)]
    pub jitter: bool,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            max_attempts: None,
            strip_suffix: default_strip_suffix(),
            ws_path: default_ws_path(),
            connect_timeout_secs: default_connect_timeout(),
            jitter: false,
        }
    }
}

impl RealtimeConfig {
    /// 1s doubling up to 5s, optionally jittered.
    pub fn backoff(&self) -> Arc<dyn BackoffPolicy> {
        let policy = ExponentialBackoff::new(Duration::from_millis(self.initial_delay_ms), 2.0)
            .with_max(Duration::from_millis(self.max_delay_ms));
        if self.jitter {
            Arc::new(Jittered::new(policy))
        } else {
            Arc::new(policy)
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

fn default_max_delay() -> u64 {
    5000
}

fn default_strip_suffix() -> String {
    "/api".to_string()
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

impl HeartlineConfig {
    /// Load configuration from an optional file plus `HEARTLINE__*` environment variables.
    ///
    /// `HEARTLINE__RATE_LIMITS__BYPASS=true` sets `rate_limits.bypass`.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix("HEARTLINE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: HeartlineConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: HeartlineConfig =
            serde_yaml::from_str(yaml).map_err(|e| HeartlineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make a component inert or panic.
    pub fn validate(&self) -> Result<()> {
        self.rate_limits.validate().map_err(HeartlineError::Config)?;

        if self.push.max_attempts == 0 {
            return Err(HeartlineError::Config(
                "push.max_attempts must be positive".to_string(),
            ));
        }
        if !(self.push.multiplier.is_finite() && self.push.multiplier >= 1.0) {
            return Err(HeartlineError::Config(
                "push.multiplier must be at least 1".to_string(),
            ));
        }
        if self.realtime.max_attempts == Some(0) {
            return Err(HeartlineError::Config(
                "realtime.max_attempts must be positive when set".to_string(),
            ));
        }
        if self.realtime.max_delay_ms < self.realtime.initial_delay_ms {
            return Err(HeartlineError::Config(
                "realtime.max_delay_ms must not be below initial_delay_ms".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = HeartlineConfig::default();

        assert_eq!(config.server.listen_addr.port(), 8080);
        assert!(!config.rate_limits.bypass);
        assert_eq!(config.push.max_attempts, 3);
        assert_eq!(config.realtime.max_delay_ms, 5000);
        assert_eq!(config.realtime.max_attempts, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_yaml_overrides() {
        let yaml = r#"
server:
  upstream_url: http://api.internal:4000
rate_limits:
  bypass: true
push:
  base_url: https://api.heartline.app/api
  max_attempts: 5
realtime:
  max_attempts: 10
  jitter: true
"#;
        let config = HeartlineConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.server.upstream_url, "http://api.internal:4000");
        assert_eq!(config.server.listen_addr.port(), 8080);
        assert!(config.rate_limits.bypass);
        assert_eq!(config.rate_limits.login.max_requests, 10);
        assert_eq!(config.push.max_attempts, 5);
        assert_eq!(config.push.initial_delay_ms, 1000);
        assert_eq!(config.realtime.max_attempts, Some(10));
        assert!(config.realtime.jitter);
    }

    #[test]
    fn test_validation_errors() {
        let yaml = "push:\n  max_attempts: 0\n";
        assert!(matches!(
            HeartlineConfig::from_yaml(yaml),
            Err(HeartlineError::Config(_))
        ));

        let yaml = "realtime:\n  initial_delay_ms: 6000\n";
        assert!(HeartlineConfig::from_yaml(yaml).is_err());

        let yaml = "rate_limits:\n  signup:\n    key_prefix: signup\n    window_ms: 0\n    max_requests: 5\n";
        assert!(HeartlineConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_backoff_policies_follow_config() {
        let config = HeartlineConfig::default();

        let push = config.push.backoff();
        assert_eq!(push.next_delay(0), Duration::from_secs(1));
        assert_eq!(push.next_delay(2), Duration::from_secs(4));

        let realtime = config.realtime.backoff();
        assert_eq!(realtime.next_delay(1), Duration::from_secs(2));
        assert_eq!(realtime.next_delay(10), Duration::from_secs(5));
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = HeartlineConfig::load(None).unwrap();
        assert_eq!(config.push.max_attempts, 3);
    }
}
