//! QR issuance tracking
//!
//! Expiry is lazy: a snapshot older than the TTL is dropped the next time it
//! is read. No timer runs in the background.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone)]
struct QrSnapshot {
    payload: String,
    issued_at: Instant,
}

/// Current pairing payload of one session
#[derive(Debug, Clone)]
pub struct QrTracker {
    ttl: Duration,
    current: Option<QrSnapshot>,
}

impl QrTracker {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, current: None }
    }

    /// Replace the snapshot with a payload issued now
    pub fn issue(&mut self, payload: impl Into<String>) {
        self.issue_at(payload, Instant::now());
    }

    pub fn issue_at(&mut self, payload: impl Into<String>, issued_at: Instant) {
        self.current = Some(QrSnapshot {
            payload: payload.into(),
            issued_at,
        });
    }

    /// Payload if still fresh; an expired snapshot is cleared
    pub fn current(&mut self) -> Option<&str> {
        self.current_at(Instant::now())
    }

    pub fn current_at(&mut self, now: Instant) -> Option<&str> {
        let fresh = matches!(
            &self.current,
            Some(snapshot) if now.saturating_duration_since(snapshot.issued_at) <= self.ttl
        );
        if !fresh {
            self.current = None;
        }
        self.current.as_ref().map(|s| s.payload.as_str())
    }

    pub fn clear(&mut self) {
        self.current = None;
    }

    /// Whether a snapshot is stored, without checking expiry
    pub fn is_stored(&self) -> bool {
        self.current.is_some()
    }
}
