//! Configuration management
//!
//! Settings are resolved in this order (later wins):
//! 1. Default values
//! 2. `wa-gateway.toml` (or the file named by `WA_GATEWAY_CONFIG`)
//! 3. Environment variables
//!
//! Inside the config file `${VAR_NAME}` is replaced by the value of the
//! environment variable of that name.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Default config file looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "wa-gateway.toml";

/// Main configuration for wa-gateway
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP API configuration
    pub api: ApiConfig,

    /// Outbound webhook configuration
    pub webhook: WebhookConfig,

    /// Session lifecycle configuration
    pub sessions: SessionConfig,

    /// Protocol bridge configuration
    pub bridge: BridgeConfig,

    /// Logging configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Secret expected in `x-api-key` / `Authorization: Bearer`
    #[serde(skip_serializing)]
    pub key: Option<String>,

    /// Bind address
    pub host: String,

    /// Listen port
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            key: None,
            host: "0.0.0.0".to_string(),
            port: 3000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    /// Destination URL. Delivery is disabled when unset.
    pub url: Option<String>,

    /// Total delivery attempts per event
    pub max_attempts: u32,

    /// Delay before the first retry; later retries scale linearly
    pub retry_delay_ms: u64,

    /// Per-request timeout
    pub timeout_secs: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_attempts: 3,
            retry_delay_ms: 1000,
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Root directory holding one credential directory per session
    pub auth_dir: PathBuf,

    /// Session id used when a request omits one
    pub default_id: String,

    /// Automatic reconnects allowed after transient closures
    pub max_reconnect_attempts: u32,

    /// First reconnect delay; doubles per attempt
    pub reconnect_base_delay_secs: u64,

    /// Upper bound for the reconnect delay
    pub reconnect_max_delay_secs: u64,

    /// How long an issued QR stays readable
    pub qr_ttl_secs: u64,

    /// How long `/create-session` waits for a QR or a connection
    pub create_wait_ms: u64,

    /// Reconnect every session with stored credentials at startup
    pub restore_on_startup: bool,

    /// Tear down and reconnect even when already connected
    pub reconnect_when_connected: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auth_dir: PathBuf::from("data/auth"),
            default_id: "default".to_string(),
            max_reconnect_attempts: 3,
            reconnect_base_delay_secs: 5,
            reconnect_max_delay_secs: 60,
            qr_ttl_secs: 60,
            create_wait_ms: 5000,
            restore_on_startup: true,
            reconnect_when_connected: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// WebSocket base URL of the protocol sidecar
    pub url: String,

    /// How long a send waits for the sidecar's acknowledgement
    pub send_timeout_secs: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8787".to_string(),
            send_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directive used when `RUST_LOG` is not set
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Replace `${VAR_NAME}` with the environment value (empty when unset)
    fn expand_env_vars(value: &str) -> String {
        let mut result = String::with_capacity(value.len());
        let mut chars = value.chars().peekable();

        while let Some(c) = chars.next() {
            if c != '$' || chars.peek() != Some(&'{') {
                result.push(c);
                continue;
            }
            chars.next();

            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }

            if let Ok(env_value) = std::env::var(&var_name) {
                result.push_str(&env_value);
            }
        }

        result
    }

    /// Parse a TOML document (after `${VAR}` expansion)
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let expanded = Self::expand_env_vars(content);
        toml::from_str(&expanded).map_err(|e| Error::Config(format!("Failed to parse TOML: {}", e)))
    }

    /// Load from a TOML file, then apply environment overrides
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let mut config = Self::from_toml_str(&content)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load using the default lookup
    ///
    /// An explicit `path` must exist. Otherwise `WA_GATEWAY_CONFIG`, then
    /// `./wa-gateway.toml`, then the environment alone.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::from_toml_file(path);
        }

        if let Ok(path) = std::env::var("WA_GATEWAY_CONFIG") {
            if !path.is_empty() {
                return Self::from_toml_file(path);
            }
        }

        if Path::new(DEFAULT_CONFIG_FILE).exists() {
            return Self::from_toml_file(DEFAULT_CONFIG_FILE);
        }

        Self::from_env()
    }

    /// Override settings from the environment
    fn apply_env_overrides(&mut self) {
        if let Some(key) = env_string("API_KEY") {
            self.api.key = Some(key);
        }
        if let Some(host) = env_string("HOST") {
            self.api.host = host;
        }
        if let Some(port) = env_parse("PORT") {
            self.api.port = port;
        }

        if let Some(url) = env_string("WEBHOOK_URL") {
            self.webhook.url = Some(url);
        }
        if let Some(attempts) = env_parse("WEBHOOK_MAX_ATTEMPTS") {
            self.webhook.max_attempts = attempts;
        }
        if let Some(delay) = env_parse("WEBHOOK_RETRY_DELAY_MS") {
            self.webhook.retry_delay_ms = delay;
        }
        if let Some(timeout) = env_parse("WEBHOOK_TIMEOUT_SECS") {
            self.webhook.timeout_secs = timeout;
        }

        if let Some(dir) = env_string("AUTH_DIR") {
            self.sessions.auth_dir = PathBuf::from(dir);
        }
        if let Some(id) = env_string("DEFAULT_SESSION_ID") {
            self.sessions.default_id = id;
        }
        if let Some(max) = env_parse("MAX_RECONNECT_ATTEMPTS") {
            self.sessions.max_reconnect_attempts = max;
        }
        if let Some(wait) = env_parse("CREATE_WAIT_MS") {
            self.sessions.create_wait_ms = wait;
        }
        if let Ok(restore) = std::env::var("RESTORE_SESSIONS") {
            self.sessions.restore_on_startup = restore.to_lowercase() != "false";
        }

        if let Some(url) = env_string("BRIDGE_URL") {
            self.bridge.url = url;
        }

        if let Some(level) = env_string("LOG_LEVEL") {
            self.log.level = level;
        }
    }
}

/// Non-empty environment value
fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|v| v.parse().ok())
}
