//! Bridge wire frames

use serde::{Deserialize, Serialize};
use wa_core::{InboundMessage, OutboundMessage};

/// Frames sent by the bridge
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum InboundFrame {
    Qr {
        qr: String,
    },
    Open {
        jid: String,
        #[serde(default)]
        name: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Close {
        #[serde(default)]
        status_code: Option<u16>,
        #[serde(default)]
        reason: Option<String>,
    },
    Messages {
        messages: Vec<InboundMessage>,
    },
    #[serde(rename_all = "camelCase")]
    Ack {
        request_id: String,
        message_id: String,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        #[serde(default)]
        request_id: Option<String>,
        error: String,
    },
}

/// Frames sent to the bridge
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum OutboundFrame {
    #[serde(rename_all = "camelCase")]
    Send {
        request_id: String,
        to: String,
        message: OutboundMessage,
    },
    Logout,
}
