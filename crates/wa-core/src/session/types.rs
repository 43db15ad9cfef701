//! Session types

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::SessionConfig;

/// Connection state of a session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    QrReady,
    Connected,
    Error,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::QrReady => "qr_ready",
            Self::Connected => "connected",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options for [`SessionRegistry::connect`](super::SessionRegistry::connect)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct ConnectOptions {
    /// Wipe credentials and state first, forcing a new pairing
    #[serde(default)]
    pub fresh: bool,
    /// Reconnect even if already connected
    #[serde(default)]
    pub force: bool,
}

/// Read-only status projection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    #[serde(rename = "status")]
    pub state: SessionState,
    pub phone: Option<String>,
    #[serde(rename = "hasQR")]
    pub has_qr: bool,
    pub reconnect_attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// Lifecycle tuning
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub qr_ttl: Duration,
    pub reconnect_when_connected: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from(&SessionConfig::default())
    }
}

impl From<&SessionConfig> for SessionSettings {
    fn from(config: &SessionConfig) -> Self {
        Self {
            max_reconnect_attempts: config.max_reconnect_attempts,
            reconnect_base_delay: Duration::from_secs(config.reconnect_base_delay_secs),
            reconnect_max_delay: Duration::from_secs(config.reconnect_max_delay_secs),
            qr_ttl: Duration::from_secs(config.qr_ttl_secs),
            reconnect_when_connected: config.reconnect_when_connected,
        }
    }
}
