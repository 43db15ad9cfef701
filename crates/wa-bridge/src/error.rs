//! Error types (wa-bridge)

use std::time::Duration;

use thiserror::Error;

/// Errors talking to the protocol bridge
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Invalid bridge URL: {0}")]
    InvalidUrl(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Bridge rejected request: {0}")]
    Rejected(String),

    #[error("No acknowledgement within {0:?}")]
    Timeout(Duration),

    #[error("Bridge connection closed")]
    Closed,
}

impl From<url::ParseError> for BridgeError {
    fn from(e: url::ParseError) -> Self {
        Self::InvalidUrl(e.to_string())
    }
}

impl From<BridgeError> for wa_core::Error {
    fn from(e: BridgeError) -> Self {
        wa_core::Error::Transport(e.to_string())
    }
}

/// Result alias
pub type Result<T> = std::result::Result<T, BridgeError>;
