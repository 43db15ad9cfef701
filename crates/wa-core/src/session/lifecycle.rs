//! Session state machine
//!
//! Applies transport events to a session's mutable fields and reports the
//! side effects the registry has to carry out. Nothing here performs I/O.

use std::time::Duration;

use serde_json::json;
use tracing::{info, warn};

use super::qr::QrTracker;
use super::types::{SessionSettings, SessionSnapshot, SessionState};
use crate::transport::{phone_from_jid, CloseReason, TransportEvent};
use crate::webhook::EventKind;

/// Reconnect delay for the `attempt`-th retry (1-based)
pub fn backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 1u32
        .checked_shl(attempt.saturating_sub(1))
        .unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(max)
}

/// Side effects of one transition
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transition {
    pub webhook: Option<(EventKind, serde_json::Value)>,
    /// The handle is finished and must be released
    pub closed: bool,
    pub reconnect_after: Option<Duration>,
    pub wipe_credentials: bool,
}

/// Mutable lifecycle fields of one session
#[derive(Debug, Clone)]
pub struct Lifecycle {
    pub state: SessionState,
    pub phone: Option<String>,
    pub name: Option<String>,
    pub qr: QrTracker,
    pub reconnect_attempts: u32,
    pub last_error: Option<String>,
}

impl Lifecycle {
    pub fn new(qr_ttl: Duration) -> Self {
        Self {
            state: SessionState::Disconnected,
            phone: None,
            name: None,
            qr: QrTracker::new(qr_ttl),
            reconnect_attempts: 0,
            last_error: None,
        }
    }

    /// Back to a never-paired record
    pub fn reset(&mut self) {
        self.state = SessionState::Disconnected;
        self.phone = None;
        self.name = None;
        self.qr.clear();
        self.reconnect_attempts = 0;
        self.last_error = None;
    }

    pub fn mark_connecting(&mut self) {
        self.state = SessionState::Connecting;
        self.last_error = None;
    }

    pub fn mark_error(&mut self, message: impl Into<String>) {
        self.state = SessionState::Error;
        self.phone = None;
        self.qr.clear();
        self.last_error = Some(message.into());
    }

    pub fn mark_disconnected(&mut self) {
        self.state = SessionState::Disconnected;
        self.phone = None;
        self.qr.clear();
    }

    /// Fresh QR payload; an expired one moves `qr_ready` back to `connecting`
    pub fn current_qr(&mut self) -> Option<String> {
        let current = self.qr.current().map(str::to_string);
        if current.is_none() && self.state == SessionState::QrReady {
            self.state = SessionState::Connecting;
        }
        current
    }

    pub fn snapshot(&mut self) -> SessionSnapshot {
        let has_qr = self.current_qr().is_some();
        SessionSnapshot {
            state: self.state,
            phone: self.phone.clone(),
            has_qr,
            reconnect_attempts: self.reconnect_attempts,
            last_error: self.last_error.clone(),
            created_at: None,
        }
    }

    /// Apply one lifecycle event from the current handle
    ///
    /// Message batches carry no lifecycle change and yield an empty transition.
    pub fn apply(
        &mut self,
        session_id: &str,
        event: &TransportEvent,
        settings: &SessionSettings,
    ) -> Transition {
        match event {
            TransportEvent::Qr(payload) => self.on_qr(session_id, payload),
            TransportEvent::Open { jid, name } => self.on_open(session_id, jid, name.clone()),
            TransportEvent::Closed(reason) => self.on_closed(session_id, reason, settings),
            TransportEvent::Messages(_) => Transition::default(),
        }
    }

    fn on_qr(&mut self, session_id: &str, payload: &str) -> Transition {
        if self.state == SessionState::Connected {
            warn!("[Session {}] Ignoring QR while connected", session_id);
            return Transition::default();
        }

        self.qr.issue(payload);
        self.state = SessionState::QrReady;
        info!("[Session {}] QR code issued", session_id);

        Transition {
            webhook: Some((EventKind::Qr, json!({ "qr": payload }))),
            ..Default::default()
        }
    }

    fn on_open(&mut self, session_id: &str, jid: &str, name: Option<String>) -> Transition {
        let phone = phone_from_jid(jid);
        self.state = SessionState::Connected;
        self.phone = Some(phone.clone());
        self.name = name.clone();
        self.qr.clear();
        self.reconnect_attempts = 0;
        self.last_error = None;
        info!("[Session {}] Connected as {}", session_id, phone);

        Transition {
            webhook: Some((
                EventKind::Connected,
                json!({ "phone": phone, "name": name, "jid": jid }),
            )),
            ..Default::default()
        }
    }

    fn on_closed(
        &mut self,
        session_id: &str,
        reason: &CloseReason,
        settings: &SessionSettings,
    ) -> Transition {
        self.state = SessionState::Disconnected;
        self.phone = None;
        self.qr.clear();

        let mut transition = Transition {
            closed: true,
            ..Default::default()
        };

        if reason.is_logged_out() {
            info!("[Session {}] Logged out, clearing credentials", session_id);
            self.name = None;
            transition.wipe_credentials = true;
        } else if self.reconnect_attempts < settings.max_reconnect_attempts {
            self.reconnect_attempts += 1;
            let delay = backoff(
                self.reconnect_attempts,
                settings.reconnect_base_delay,
                settings.reconnect_max_delay,
            );
            info!(
                "[Session {}] Connection closed ({}), reconnecting in {:?} (attempt {}/{})",
                session_id,
                reason.describe(),
                delay,
                self.reconnect_attempts,
                settings.max_reconnect_attempts
            );
            transition.reconnect_after = Some(delay);
        } else {
            warn!(
                "[Session {}] Connection closed ({}), giving up after {} attempts",
                session_id,
                reason.describe(),
                self.reconnect_attempts
            );
        }

        transition.webhook = Some((
            EventKind::Disconnected,
            json!({
                "reason": reason.describe(),
                "willReconnect": transition.reconnect_after.is_some(),
                "attempts": self.reconnect_attempts,
            }),
        ));
        transition
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(max: u32) -> SessionSettings {
        SessionSettings {
            max_reconnect_attempts: max,
            ..Default::default()
        }
    }

    fn transient() -> TransportEvent {
        TransportEvent::Closed(CloseReason::from_status(Some(428), None))
    }

    #[test]
    fn test_backoff() {
        let base = Duration::from_secs(5);
        let max = Duration::from_secs(60);

        assert_eq!(backoff(1, base, max), Duration::from_secs(5));
        assert_eq!(backoff(2, base, max), Duration::from_secs(10));
        assert_eq!(backoff(3, base, max), Duration::from_secs(20));
        assert_eq!(backoff(5, base, max), Duration::from_secs(60));
        assert_eq!(backoff(40, base, max), Duration::from_secs(60));
        assert_eq!(backoff(0, base, max), Duration::from_secs(5));
    }

    #[test]
    fn test_qr_then_open() {
        let mut lc = Lifecycle::new(Duration::from_secs(60));
        lc.mark_connecting();

        let t = lc.apply("acct1", &TransportEvent::Qr("XYZ".into()), &settings(3));
        assert_eq!(lc.state, SessionState::QrReady);
        assert_eq!(t.webhook, Some((EventKind::Qr, json!({"qr": "XYZ"}))));
        assert_eq!(lc.current_qr().as_deref(), Some("XYZ"));

        let t = lc.apply(
            "acct1",
            &TransportEvent::Open {
                jid: "5511999999999:3@s.whatsapp.net".into(),
                name: Some("Ana".into()),
            },
            &settings(3),
        );
        assert_eq!(lc.state, SessionState::Connected);
        assert_eq!(lc.phone.as_deref(), Some("5511999999999"));
        assert_eq!(lc.current_qr(), None);
        assert!(!t.closed);
        let (kind, data) = t.webhook.unwrap();
        assert_eq!(kind, EventKind::Connected);
        assert_eq!(data["phone"], "5511999999999");
        assert_eq!(data["name"], "Ana");
    }

    #[test]
    fn test_qr_ignored_when_connected() {
        let mut lc = Lifecycle::new(Duration::from_secs(60));
        lc.state = SessionState::Connected;

        let t = lc.apply("acct1", &TransportEvent::Qr("XYZ".into()), &settings(3));
        assert_eq!(t, Transition::default());
        assert_eq!(lc.state, SessionState::Connected);
        assert!(!lc.qr.is_stored());
    }

    #[test]
    fn test_transient_close_schedules_reconnect() {
        let mut lc = Lifecycle::new(Duration::from_secs(60));
        lc.state = SessionState::Connected;
        lc.phone = Some("5511999999999".into());

        let t = lc.apply("acct1", &transient(), &settings(3));
        assert_eq!(lc.state, SessionState::Disconnected);
        assert_eq!(lc.phone, None);
        assert_eq!(lc.reconnect_attempts, 1);
        assert!(t.closed);
        assert!(!t.wipe_credentials);
        assert_eq!(t.reconnect_after, Some(Duration::from_secs(5)));
        let (kind, data) = t.webhook.unwrap();
        assert_eq!(kind, EventKind::Disconnected);
        assert_eq!(data["willReconnect"], true);
        assert_eq!(data["reason"], "status_428");
    }

    #[test]
    fn test_reconnect_attempts_are_bounded() {
        let mut lc = Lifecycle::new(Duration::from_secs(60));

        for expected in 1..=2 {
            let t = lc.apply("acct1", &transient(), &settings(2));
            assert!(t.reconnect_after.is_some());
            assert_eq!(lc.reconnect_attempts, expected);
        }

        let t = lc.apply("acct1", &transient(), &settings(2));
        assert_eq!(t.reconnect_after, None);
        assert_eq!(lc.reconnect_attempts, 2);
        assert_eq!(t.webhook.unwrap().1["willReconnect"], false);
    }

    #[test]
    fn test_logged_out_clears_identity() {
        let mut lc = Lifecycle::new(Duration::from_secs(60));
        lc.state = SessionState::Connected;
        lc.phone = Some("5511999999999".into());

        let t = lc.apply("acct1", &TransportEvent::Closed(CloseReason::LoggedOut), &settings(3));
        assert_eq!(lc.state, SessionState::Disconnected);
        assert_eq!(lc.phone, None);
        assert_eq!(lc.reconnect_attempts, 0);
        assert!(t.wipe_credentials);
        assert_eq!(t.reconnect_after, None);
        assert_eq!(t.webhook.unwrap().1["reason"], "logged_out");
    }

    #[test]
    fn test_open_resets_attempts() {
        let mut lc = Lifecycle::new(Duration::from_secs(60));
        lc.apply("acct1", &transient(), &settings(3));
        lc.apply("acct1", &transient(), &settings(3));
        assert_eq!(lc.reconnect_attempts, 2);

        lc.apply(
            "acct1",
            &TransportEvent::Open {
                jid: "5511999999999@s.whatsapp.net".into(),
                name: None,
            },
            &settings(3),
        );
        assert_eq!(lc.reconnect_attempts, 0);
    }

    #[test]
    fn test_snapshot_and_error() {
        let mut lc = Lifecycle::new(Duration::from_secs(60));
        lc.mark_error("bridge unreachable");

        let snapshot = lc.snapshot();
        assert_eq!(snapshot.state, SessionState::Error);
        assert!(!snapshot.has_qr);
        assert_eq!(snapshot.last_error.as_deref(), Some("bridge unreachable"));

        lc.mark_connecting();
        assert_eq!(lc.snapshot().last_error, None);
    }
}
