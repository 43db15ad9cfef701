//! Inbound message ingestion
//!
//! Filters a transport message batch and packages each surviving message as
//! a `message` webhook payload. Batch order is preserved.

use serde::Serialize;
use tracing::debug;

use crate::transport::InboundMessage;
use crate::webhook::{EventKind, WebhookDispatcher};

/// Normalized inbound message sent as webhook `data`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestedMessage {
    pub message_id: String,
    pub sender: String,
    pub from_me: bool,
    pub raw_message: serde_json::Value,
    pub timestamp: i64,
    pub sender_display_name: Option<String>,
}

/// Best-effort plain text of simple text messages
///
/// Richer types yield `None`; the text is advisory and only logged.
pub fn extract_text(message: &serde_json::Value) -> Option<&str> {
    message
        .get("conversation")
        .and_then(|v| v.as_str())
        .or_else(|| {
            message
                .get("extendedTextMessage")
                .and_then(|m| m.get("text"))
                .and_then(|v| v.as_str())
        })
}

/// Filter and normalize a batch, keeping transport order
pub fn normalize_batch(messages: Vec<InboundMessage>) -> Vec<IngestedMessage> {
    messages
        .into_iter()
        .filter_map(|msg| {
            if msg.from_me {
                return None;
            }
            let raw_message = msg.message.filter(|m| !m.is_null())?;

            Some(IngestedMessage {
                message_id: msg.id,
                sender: msg.participant.unwrap_or(msg.remote_jid),
                from_me: msg.from_me,
                raw_message,
                timestamp: msg.timestamp,
                sender_display_name: msg.push_name,
            })
        })
        .collect()
}

/// Dispatch every accepted message of a batch as a `message` webhook
///
/// Returns how many messages were forwarded.
pub fn ingest_batch(
    dispatcher: &WebhookDispatcher,
    session_id: &str,
    messages: Vec<InboundMessage>,
) -> usize {
    let total = messages.len();
    let accepted = normalize_batch(messages);

    for message in &accepted {
        debug!(
            "[Session {}] Message {} from {}: {}",
            session_id,
            message.message_id,
            message.sender,
            extract_text(&message.raw_message).unwrap_or("<non-text>")
        );

        match serde_json::to_value(message) {
            Ok(data) => {
                dispatcher.emit(EventKind::Message, session_id, data);
            }
            Err(e) => debug!("[Session {}] Unserializable message: {}", session_id, e),
        }
    }

    if accepted.len() < total {
        debug!(
            "[Session {}] Skipped {} of {} messages",
            session_id,
            total - accepted.len(),
            total
        );
    }

    accepted.len()
}
