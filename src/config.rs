//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and environment variable overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub endpoint: EndpointConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub recovery: RecoveryConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Backend endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    /// Host and optional port, e.g. `localhost:10443`
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_path")]
    pub path: String,

    /// Use `wss://` rather than `ws://`
    #[serde(default = "default_secure")]
    pub secure: bool,
}

fn default_host() -> String {
    "localhost:10443".to_string()
}

fn default_path() -> String {
    "/ws/v1.0.0".to_string()
}

fn default_secure() -> bool {
    true
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            path: default_path(),
            secure: default_secure(),
        }
    }
}

impl EndpointConfig {
    /// Full socket URL
    pub fn url(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        let path = if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };
        format!("{}://{}{}", scheme, self.host, path)
    }
}

/// Session behaviour: handshake route, keepalive, retries
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Route of the connection's own control messages
    #[serde(default = "default_route")]
    pub route: String,

    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_ms: u64,

    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,

    /// Give up on a failing send after this many attempts (0 = never)
    #[serde(default = "default_max_send_attempts")]
    pub max_send_attempts: u32,

    #[serde(default = "default_reconnect_base_delay")]
    pub reconnect_base_delay_ms: u64,

    #[serde(default = "default_reconnect_max_delay")]
    pub reconnect_max_delay_ms: u64,

    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
}

fn default_route() -> String {
    "websocketclient".to_string()
}

fn default_keepalive_interval() -> u64 {
    60_000 // 1 minute
}

fn default_retry_delay() -> u64 {
    250
}

fn default_max_send_attempts() -> u32 {
    20
}

fn default_reconnect_base_delay() -> u64 {
    1000
}

fn default_reconnect_max_delay() -> u64 {
    30_000
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            route: default_route(),
            keepalive_interval_ms: default_keepalive_interval(),
            retry_delay_ms: default_retry_delay(),
            max_send_attempts: default_max_send_attempts(),
            reconnect_base_delay_ms: default_reconnect_base_delay(),
            reconnect_max_delay_ms: default_reconnect_max_delay(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
        }
    }
}

impl SessionConfig {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Backoff before reconnect attempt `attempt` (0-based)
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let factor = 2_u64.saturating_pow(attempt);
        let delay = self
            .reconnect_base_delay_ms
            .saturating_mul(factor)
            .min(self.reconnect_max_delay_ms);
        Duration::from_millis(delay)
    }
}

/// Last-page re-hydration key
#[derive(Debug, Clone, Deserialize)]
pub struct RecoveryConfig {
    #[serde(default = "default_recovery_enabled")]
    pub enabled: bool,

    #[serde(default = "default_recovery_file")]
    pub file: String,

    /// Keys older than this are ignored on restore
    #[serde(default = "default_recovery_max_age")]
    pub max_age_secs: u64,

    /// Request the stored page again after a successful login
    #[serde(default = "default_restore_on_auth")]
    pub restore_on_auth: bool,
}

fn default_recovery_enabled() -> bool {
    true
}

fn default_recovery_file() -> String {
    dirs::data_local_dir()
        .map(|p| p.join("growlink").join("last-page.json").to_string_lossy().to_string())
        .unwrap_or_else(|| "./growlink-last-page.json".to_string())
}

fn default_recovery_max_age() -> u64 {
    3600
}

fn default_restore_on_auth() -> bool {
    false
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: default_recovery_enabled(),
            file: default_recovery_file(),
            max_age_secs: default_recovery_max_age(),
            restore_on_auth: default_restore_on_auth(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,

    pub file: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Self::parse(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e,
        })
    }

    fn parse(content: &str) -> Result<Self, String> {
        toml::from_str(content).map_err(|e| e.to_string())
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from default locations or environment
    pub fn load_default() -> Self {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("growlink").join("config.toml")),
            Some(PathBuf::from("/etc/growlink/config.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path_opt in config_paths.iter().flatten() {
            if path_opt.exists() {
                match Self::load_with_env(path_opt) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path_opt);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path_opt, e);
                    }
                }
            }
        }

        tracing::info!("Using default config with environment overrides");
        Self::from_env()
    }

    /// Apply environment variable overrides to an existing config
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        // Endpoint overrides
        if let Some(host) = var("GROWLINK_HOST") {
            self.endpoint.host = host;
        }
        if let Some(path) = var("GROWLINK_PATH") {
            self.endpoint.path = path;
        }
        if let Some(secure) = var("GROWLINK_SECURE") {
            self.endpoint.secure = secure.to_lowercase() != "false" && secure != "0";
        }

        // Session overrides
        if let Some(ms) = var("GROWLINK_KEEPALIVE_MS").and_then(|s| s.parse().ok()) {
            self.session.keepalive_interval_ms = ms;
        }
        if let Some(ms) = var("GROWLINK_RETRY_DELAY_MS").and_then(|s| s.parse().ok()) {
            self.session.retry_delay_ms = ms;
        }
        if let Some(n) = var("GROWLINK_MAX_SEND_ATTEMPTS").and_then(|s| s.parse().ok()) {
            self.session.max_send_attempts = n;
        }

        // Recovery overrides
        if let Some(file) = var("GROWLINK_RECOVERY_FILE") {
            self.recovery.file = file;
        }

        // Logging overrides
        if let Some(level) = var("GROWLINK_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = var("GROWLINK_LOG_FORMAT") {
            self.logging.format = format;
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# growlink configuration
#
# Environment variables override these settings:
# - GROWLINK_HOST
# - GROWLINK_PATH
# - GROWLINK_SECURE
# - GROWLINK_KEEPALIVE_MS
# - GROWLINK_RETRY_DELAY_MS
# - GROWLINK_MAX_SEND_ATTEMPTS
# - GROWLINK_RECOVERY_FILE
# - GROWLINK_LOG_LEVEL
# - GROWLINK_LOG_FORMAT

[endpoint]
# Backend host and port
host = "localhost:10443"

# Socket path on the host
path = "/ws/v1.0.0"

# Use wss:// (true) or ws:// (false)
secure = true

[session]
# Route of the connection's own control messages
route = "websocketclient"

# Keepalive period while authenticated (ms)
keepalive_interval_ms = 60000

# Delay before retrying a failed send (ms)
retry_delay_ms = 250

# Attempts before a failing send is dropped (0 = retry forever)
max_send_attempts = 20

# Reconnect backoff for queued sends (ms)
reconnect_base_delay_ms = 1000
reconnect_max_delay_ms = 30000
max_reconnect_attempts = 5

[recovery]
# Remember the last page fetched with getPagelet
enabled = true

# Where the last-page key is stored
file = "~/.local/share/growlink/last-page.json"

# Ignore stored pages older than this (seconds)
max_age_secs = 3600

# Request the stored page again after login
restore_on_auth = false

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"

# Optional log file path
# file = "/var/log/growlink/growlink.log"
"#
    .to_string()
}
