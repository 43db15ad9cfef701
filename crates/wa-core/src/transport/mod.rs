//! Messaging transport seam
//!
//! A transport handle is the live connection for one session. It is created
//! by a [`TransportFactory`], reports everything that happens to it through
//! one ordered [`TransportEvent`] stream and accepts sends, a protocol-level
//! logout and a plain close.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::{Error, Result};

#[cfg(any(test, feature = "test-util"))]
pub mod mock;

/// Domain appended to bare phone numbers
pub const USER_SERVER: &str = "s.whatsapp.net";

/// Close status the protocol uses for an authoritative sign-out
pub const LOGGED_OUT_STATUS: u16 = 401;

/// Events emitted by a transport handle, in protocol order
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A new pairing payload to be shown as a QR code
    Qr(String),
    /// The handle authenticated as `jid`
    Open { jid: String, name: Option<String> },
    /// The handle closed; no further events follow
    Closed(CloseReason),
    /// A batch of inbound messages
    Messages(Vec<InboundMessage>),
}

/// Why a handle closed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Remote sign-out; credentials are no longer valid
    LoggedOut,
    /// Anything else; treated as transient
    Other {
        status_code: Option<u16>,
        message: Option<String>,
    },
}

impl CloseReason {
    /// Classify a close by status code and optional reason text
    pub fn from_status(status_code: Option<u16>, message: Option<String>) -> Self {
        let logged_out_text = message
            .as_deref()
            .map(|m| m.eq_ignore_ascii_case("logged_out") || m.eq_ignore_ascii_case("loggedout"))
            .unwrap_or(false);

        if status_code == Some(LOGGED_OUT_STATUS) || logged_out_text {
            Self::LoggedOut
        } else {
            Self::Other {
                status_code,
                message,
            }
        }
    }

    pub fn is_logged_out(&self) -> bool {
        matches!(self, Self::LoggedOut)
    }

    /// Short label used in webhook payloads and logs
    pub fn describe(&self) -> String {
        match self {
            Self::LoggedOut => "logged_out".to_string(),
            Self::Other {
                message: Some(message),
                ..
            } => message.clone(),
            Self::Other {
                status_code: Some(code),
                ..
            } => format!("status_{}", code),
            Self::Other { .. } => "connection_closed".to_string(),
        }
    }
}

/// One inbound message as delivered by the transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    /// Protocol message id
    pub id: String,
    /// Chat the message belongs to
    pub remote_jid: String,
    /// Author inside a group chat
    #[serde(default)]
    pub participant: Option<String>,
    /// Sent by this session rather than received
    #[serde(default)]
    pub from_me: bool,
    /// Sender's display name
    #[serde(default)]
    pub push_name: Option<String>,
    /// Unix seconds
    #[serde(default)]
    pub timestamp: i64,
    /// Raw message body, protocol-shaped
    #[serde(default)]
    pub message: Option<serde_json::Value>,
}

/// Message content accepted by [`Transport::send`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OutboundMessage {
    Text {
        text: String,
    },
    Image {
        url: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
    },
}

/// A live transport handle
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a message to a normalized address; returns the message id
    async fn send(&self, to: &str, message: OutboundMessage) -> Result<String>;

    /// Sign out at protocol level and close
    async fn logout(&self) -> Result<()>;

    /// Release the handle without signing out. Safe to call repeatedly.
    async fn close(&self);
}

/// A freshly constructed handle and its event stream
pub struct Connection {
    pub handle: Arc<dyn Transport>,
    pub events: mpsc::Receiver<TransportEvent>,
}

/// Builds transport handles
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Open a handle for `session_id` backed by the credential directory
    async fn connect(&self, session_id: &str, credentials: &Path) -> Result<Connection>;
}

/// Turn a phone number into the transport's address form
///
/// Addresses that already carry a domain are returned unchanged.
pub fn normalize_jid(phone: &str) -> Result<String> {
    let phone = phone.trim();
    if phone.contains('@') {
        return Ok(phone.to_string());
    }

    let digits: String = phone.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return Err(Error::InvalidRequest(format!("Invalid phone number: {:?}", phone)));
    }

    Ok(format!("{}@{}", digits, USER_SERVER))
}

/// Phone number part of an address (`5511999999999:12@s.whatsapp.net`)
pub fn phone_from_jid(jid: &str) -> String {
    let user = jid.split('@').next().unwrap_or(jid);
    user.split(':').next().unwrap_or(user).to_string()
}
