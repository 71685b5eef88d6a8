//! Configuration management with validation and defaults
//!
//! Sections map one-to-one onto the gateway's moving parts. A TOML file is
//! optional; `BCHGATE_*` environment variables override it, and the result is
//! validated before anything starts.

use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;

/// Top-level gateway configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub rate_limit: RateLimitConfig,
    pub auth: AuthConfig,
    pub feed: FeedConfig,
    pub live: LiveConfig,
}

/// HTTP listener settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub allowed_origins: Vec<String>,
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            allowed_origins: vec!["*".to_string()],
            request_timeout_secs: 30,
        }
    }
}

/// Per-tier request quotas over a fixed window
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Fixed window length shared by all tiers
    pub window_seconds: u64,
    /// Capacity for callers without credentials
    pub anonymous_requests: u32,
    /// Capacity for tokens carrying the `basic` tier
    pub basic_requests: u32,
    /// Upper bound for any capacity declared inside a token.
    /// Also the capacity granted to the privileged shared secret.
    pub max_requests_per_window: u32,
    /// How often expired counters are swept
    pub sweep_interval_seconds: u64,
    /// Key anonymous callers by `X-Forwarded-For` / `X-Real-IP`
    pub trust_forwarded_headers: bool,
    /// `/v2/<group>` route groups that reject callers without valid credentials
    pub auth_required_groups: Vec<String>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_seconds: 60,
            anonymous_requests: 60,
            basic_requests: 600,
            max_requests_per_window: 6000,
            sweep_interval_seconds: 300,
            trust_forwarded_headers: false,
            auth_required_groups: Vec::new(),
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }
}

/// Signing material for caller credentials
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// HS256 secret for signed tier tokens. `None` disables token auth.
    pub jwt_secret: Option<String>,
    /// Static shared secret granting the highest tier. `None` disables it.
    pub privileged_secret: Option<String>,
}

/// Upstream node publish/subscribe feed
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// e.g. `tcp://127.0.0.1:28332`. `None` disables the live feed.
    pub endpoint: Option<String>,
    pub connect_timeout_ms: u64,
    pub reconnect_delay_ms: u64,
    /// Silence after which the upstream is assumed gone and the socket is
    /// rebuilt. 0 disables the check.
    pub idle_timeout_ms: u64,
    /// Queue between the listener and the decode loop
    pub channel_capacity: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            connect_timeout_ms: 5_000,
            reconnect_delay_ms: 2_000,
            idle_timeout_ms: 300_000,
            channel_capacity: 1_024,
        }
    }
}

impl FeedConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_ms > 0).then(|| Duration::from_millis(self.idle_timeout_ms))
    }
}

/// Live subscriber fan-out
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    /// Messages buffered per subscriber before new ones are dropped
    pub subscriber_buffer: usize,
    pub max_subscribers: usize,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: 256,
            max_subscribers: 10_000,
        }
    }
}

impl GatewayConfig {
    /// Validate configuration for logical consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        let rl = &self.rate_limit;
        if rl.window_seconds == 0 {
            return Err(ConfigError::ValidationFailed(
                "rate_limit.window_seconds must be > 0".to_string(),
            ));
        }
        if rl.anonymous_requests == 0 || rl.basic_requests == 0 {
            return Err(ConfigError::ValidationFailed(
                "tier capacities must be > 0".to_string(),
            ));
        }
        if rl.max_requests_per_window < rl.basic_requests {
            return Err(ConfigError::ValidationFailed(
                "rate_limit.max_requests_per_window must be >= basic_requests".to_string(),
            ));
        }
        if rl.sweep_interval_seconds == 0 {
            return Err(ConfigError::ValidationFailed(
                "rate_limit.sweep_interval_seconds must be > 0".to_string(),
            ));
        }

        if let Some(secret) = &self.auth.jwt_secret {
            if secret.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "auth.jwt_secret".to_string(),
                    value: String::new(),
                    reason: "signing secret cannot be empty".to_string(),
                });
            }
        }
        if let Some(secret) = &self.auth.privileged_secret {
            if secret.len() < 16 {
                return Err(ConfigError::InvalidValue {
                    field: "auth.privileged_secret".to_string(),
                    value: "<redacted>".to_string(),
                    reason: "must be at least 16 characters".to_string(),
                });
            }
        }

        if let Some(endpoint) = &self.feed.endpoint {
            if !(endpoint.starts_with("tcp://") || endpoint.starts_with("ipc://")) {
                return Err(ConfigError::InvalidValue {
                    field: "feed.endpoint".to_string(),
                    value: endpoint.clone(),
                    reason: "expected tcp:// or ipc:// endpoint".to_string(),
                });
            }
        }
        if self.feed.channel_capacity == 0 {
            return Err(ConfigError::ValidationFailed(
                "feed.channel_capacity must be > 0".to_string(),
            ));
        }

        if self.live.subscriber_buffer == 0 || self.live.max_subscribers == 0 {
            return Err(ConfigError::ValidationFailed(
                "live.subscriber_buffer and live.max_subscribers must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Configuration loader with environment variable support
#[derive(Debug, Default)]
pub struct ConfigLoader {
    config_path: Option<String>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the configuration file path
    pub fn with_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_path = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Load configuration from file and environment variables
    pub fn load(&self) -> Result<GatewayConfig, ConfigError> {
        let mut config = match &self.config_path {
            Some(path) => Self::load_from_file(path)?,
            None => GatewayConfig::default(),
        };

        Self::apply_env_overrides(&mut config)?;
        config.validate()?;

        Ok(config)
    }

    fn load_from_file(path: &str) -> Result<GatewayConfig, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::LoadFailed(format!("Failed to read {}: {}", path, e)))?;

        toml::from_str(&content)
            .map_err(|e| ConfigError::LoadFailed(format!("Failed to parse TOML: {}", e)))
    }

    fn apply_env_overrides(config: &mut GatewayConfig) -> Result<(), ConfigError> {
        if let Ok(host) = env::var("BCHGATE_HOST") {
            config.server.host = host;
        }
        if let Some(port) = parse_env("BCHGATE_PORT", "Invalid port number")? {
            config.server.port = port;
        }
        if let Some(window) = parse_env("BCHGATE_RATE_LIMIT_WINDOW_SECONDS", "Invalid integer")? {
            config.rate_limit.window_seconds = window;
        }
        if let Some(cap) = parse_env("BCHGATE_RATE_LIMIT_ANONYMOUS", "Invalid integer")? {
            config.rate_limit.anonymous_requests = cap;
        }
        if let Some(cap) = parse_env("BCHGATE_RATE_LIMIT_BASIC", "Invalid integer")? {
            config.rate_limit.basic_requests = cap;
        }
        if let Some(cap) = parse_env("BCHGATE_RATE_LIMIT_MAX", "Invalid integer")? {
            config.rate_limit.max_requests_per_window = cap;
        }
        if let Ok(secret) = env::var("BCHGATE_JWT_SECRET") {
            config.auth.jwt_secret = Some(secret);
        }
        if let Ok(secret) = env::var("BCHGATE_PRIVILEGED_SECRET") {
            config.auth.privileged_secret = Some(secret);
        }
        if let Ok(endpoint) = env::var("BCHGATE_FEED_ENDPOINT") {
            config.feed.endpoint = if endpoint.is_empty() {
                None
            } else {
                Some(endpoint)
            };
        }

        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, reason: &str) -> Result<Option<T>, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                field: key.to_string(),
                value: raw,
                reason: reason.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        assert!(GatewayConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_window_rejected() {
        let mut config = GatewayConfig::default();
        config.rate_limit.window_seconds = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_clamp_below_basic_rejected() {
        let mut config = GatewayConfig::default();
        config.rate_limit.max_requests_per_window = config.rate_limit.basic_requests - 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_jwt_secret_rejected() {
        let mut config = GatewayConfig::default();
        config.auth.jwt_secret = Some(String::new());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_short_privileged_secret_rejected() {
        let mut config = GatewayConfig::default();
        config.auth.privileged_secret = Some("short".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_feed_endpoint_scheme() {
        let mut config = GatewayConfig::default();
        config.feed.endpoint = Some("localhost:28332".to_string());
        assert!(config.validate().is_err());

        config.feed.endpoint = Some("tcp://127.0.0.1:28332".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_partial_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[rate_limit]
window_seconds = 30
anonymous_requests = 5
auth_required_groups = ["control"]

[feed]
endpoint = "tcp://10.0.0.2:28332"
"#
        )
        .unwrap();

        let config = ConfigLoader::new().with_path(file.path()).load().unwrap();
        assert_eq!(config.rate_limit.window_seconds, 30);
        assert_eq!(config.rate_limit.anonymous_requests, 5);
        assert_eq!(config.rate_limit.basic_requests, 600);
        assert_eq!(config.rate_limit.auth_required_groups, vec!["control"]);
        assert_eq!(config.feed.endpoint.as_deref(), Some("tcp://10.0.0.2:28332"));
        assert_eq!(config.server.port, 3000);
    }

    #[test]
    fn test_unparseable_file_fails_fast() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[rate_limit\nwindow_seconds = ").unwrap();
        let result = ConfigLoader::new().with_path(file.path()).load();
        assert!(matches!(result, Err(ConfigError::LoadFailed(_))));
    }

    #[test]
    fn test_duration_conversions() {
        let config = GatewayConfig::default();
        assert_eq!(config.rate_limit.window(), Duration::from_secs(60));
        assert_eq!(config.feed.reconnect_delay(), Duration::from_millis(2_000));
        assert_eq!(config.feed.idle_timeout(), Some(Duration::from_secs(300)));

        let mut quiet = config.feed.clone();
        quiet.idle_timeout_ms = 0;
        assert_eq!(quiet.idle_timeout(), None);
    }
}
