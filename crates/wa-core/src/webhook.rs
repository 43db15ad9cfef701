//! Outbound webhook delivery
//!
//! Events are POSTed as `{type, sessionId, timestamp, data}` to a single
//! configured URL. Delivery is best effort: a bounded number of attempts with
//! a linearly growing delay, then the event is logged and dropped.

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::config::WebhookConfig;
use crate::Result;

/// Header carrying the per-event id (stable across retries)
pub const EVENT_ID_HEADER: &str = "X-Webhook-Event-Id";

/// Webhook event type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Qr,
    Connected,
    Disconnected,
    Message,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Qr => "qr",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Message => "message",
        }
    }
}

/// Payload delivered to the webhook
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEvent {
    #[serde(skip)]
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
}

impl WebhookEvent {
    pub fn new(kind: EventKind, session_id: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            session_id: session_id.into(),
            timestamp: Utc::now(),
            data,
        }
    }
}

/// Delivers events to the configured webhook
#[derive(Debug, Clone)]
pub struct WebhookDispatcher {
    client: Client,
    url: Option<String>,
    max_attempts: u32,
    retry_delay: Duration,
}

impl WebhookDispatcher {
    /// Create a dispatcher from configuration
    pub fn new(config: &WebhookConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            url: config.url.clone().filter(|u| !u.is_empty()),
            max_attempts: config.max_attempts.max(1),
            retry_delay: Duration::from_millis(config.retry_delay_ms),
        })
    }

    /// A dispatcher that drops every event
    pub fn disabled() -> Self {
        Self {
            client: Client::new(),
            url: None,
            max_attempts: 1,
            retry_delay: Duration::ZERO,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.url.is_some()
    }

    /// Deliver one event, retrying on failure
    ///
    /// Returns whether the endpoint acknowledged with a 2xx status.
    pub async fn deliver(&self, event: &WebhookEvent) -> bool {
        let Some(url) = self.url.as_deref() else {
            return false;
        };

        for attempt in 1..=self.max_attempts {
            let result = self
                .client
                .post(url)
                .header(EVENT_ID_HEADER, event.id.to_string())
                .json(event)
                .send()
                .await;

            match result {
                Ok(response) if response.status().is_success() => {
                    debug!(
                        "Webhook {} delivered for session {} (attempt {})",
                        event.kind.as_str(),
                        event.session_id,
                        attempt
                    );
                    return true;
                }
                Ok(response) => {
                    warn!(
                        "Webhook {} for session {} returned {} (attempt {}/{})",
                        event.kind.as_str(),
                        event.session_id,
                        response.status(),
                        attempt,
                        self.max_attempts
                    );
                }
                Err(e) => {
                    warn!(
                        "Webhook {} for session {} failed: {} (attempt {}/{})",
                        event.kind.as_str(),
                        event.session_id,
                        e,
                        attempt,
                        self.max_attempts
                    );
                }
            }

            if attempt < self.max_attempts {
                tokio::time::sleep(self.retry_delay * attempt).await;
            }
        }

        error!(
            "Dropping webhook {} for session {} after {} attempts",
            event.kind.as_str(),
            event.session_id,
            self.max_attempts
        );
        false
    }

    /// Deliver on a background task so the caller never waits on the webhook
    pub fn dispatch(&self, event: WebhookEvent) -> Option<JoinHandle<bool>> {
        if !self.is_enabled() {
            return None;
        }

        let dispatcher = self.clone();
        Some(tokio::spawn(async move { dispatcher.deliver(&event).await }))
    }

    /// Build and dispatch an event
    pub fn emit(
        &self,
        kind: EventKind,
        session_id: &str,
        data: serde_json::Value,
    ) -> Option<JoinHandle<bool>> {
        self.dispatch(WebhookEvent::new(kind, session_id, data))
    }
}
