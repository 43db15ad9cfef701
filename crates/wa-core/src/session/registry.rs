//! Session registry and per-session orchestration

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::json;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::lifecycle::Lifecycle;
use super::types::{ConnectOptions, SessionSettings, SessionSnapshot, SessionState};
use crate::credentials::{validate_session_id, CredentialStore};
use crate::ingest::ingest_batch;
use crate::transport::{
    normalize_jid, CloseReason, Connection, OutboundMessage, Transport, TransportEvent,
    TransportFactory,
};
use crate::webhook::{EventKind, WebhookDispatcher};
use crate::{Error, Result};

/// How a live handle is let go
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Release {
    Close,
    Logout,
}

/// Who asked for a connect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Api,
    Reconnect,
}

struct SessionInner {
    lifecycle: Lifecycle,
    transport: Option<Arc<dyn Transport>>,
    pump: Option<JoinHandle<()>>,
}

/// One session record
pub struct Session {
    id: String,
    created_at: DateTime<Utc>,
    inner: RwLock<SessionInner>,
    /// Serializes connect, disconnect, delete and reconnect timers
    op_lock: Mutex<()>,
    /// Bumped whenever the current handle is replaced or torn down
    generation: AtomicU64,
    state_tx: watch::Sender<SessionState>,
}

impl Session {
    fn new(id: &str, settings: &SessionSettings) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Disconnected);
        Self {
            id: id.to_string(),
            created_at: Utc::now(),
            inner: RwLock::new(SessionInner {
                lifecycle: Lifecycle::new(settings.qr_ttl),
                transport: None,
                pump: None,
            }),
            op_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
            state_tx,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Watch state changes
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub async fn state(&self) -> SessionState {
        self.inner.read().await.lifecycle.state
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let mut snapshot = self.update(|inner| inner.lifecycle.snapshot()).await;
        snapshot.created_at = Some(self.created_at);
        snapshot
    }

    pub async fn current_qr(&self) -> Option<String> {
        self.update(|inner| inner.lifecycle.current_qr()).await
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    async fn update<R>(&self, f: impl FnOnce(&mut SessionInner) -> R) -> R {
        let mut inner = self.inner.write().await;
        let result = f(&mut inner);
        self.publish(inner.lifecycle.state);
        result
    }

    fn publish(&self, state: SessionState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }
}

/// Owns every session and drives their lifecycles
pub struct SessionRegistry {
    me: Weak<SessionRegistry>,
    sessions: DashMap<String, Arc<Session>>,
    factory: Arc<dyn TransportFactory>,
    credentials: CredentialStore,
    dispatcher: WebhookDispatcher,
    settings: SessionSettings,
}

impl SessionRegistry {
    pub fn new(
        factory: Arc<dyn TransportFactory>,
        credentials: CredentialStore,
        dispatcher: WebhookDispatcher,
        settings: SessionSettings,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            sessions: DashMap::new(),
            factory,
            credentials,
            dispatcher,
            settings,
        })
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    /// Existing record or a new `disconnected` one
    pub fn get_or_create(&self, id: &str) -> Result<Arc<Session>> {
        validate_session_id(id)?;
        let session = self
            .sessions
            .entry(id.to_string())
            .or_insert_with(|| {
                info!("Creating session {}", id);
                Arc::new(Session::new(id, &self.settings))
            })
            .value()
            .clone();
        Ok(session)
    }

    fn is_registered(&self, session: &Arc<Session>) -> bool {
        self.sessions
            .get(&session.id)
            .map(|entry| Arc::ptr_eq(entry.value(), session))
            .unwrap_or(false)
    }

    /// Start (or restart) a session's connection
    ///
    /// Returns once the handle is created; pairing and authentication are
    /// observed through [`snapshot`](Self::snapshot) and webhooks.
    pub async fn connect(&self, id: &str, options: ConnectOptions) -> Result<SessionSnapshot> {
        loop {
            let session = self.get_or_create(id)?;
            let _guard = session.op_lock.lock().await;
            // Deleted while we waited for the guard
            if !self.is_registered(&session) {
                continue;
            }
            return self.connect_locked(&session, options, Origin::Api).await;
        }
    }

    async fn connect_locked(
        &self,
        session: &Arc<Session>,
        options: ConnectOptions,
        origin: Origin,
    ) -> Result<SessionSnapshot> {
        let force = options.force || self.settings.reconnect_when_connected;
        if !options.fresh && !force {
            let connected = {
                let inner = session.inner.read().await;
                inner.lifecycle.state == SessionState::Connected && inner.transport.is_some()
            };
            if connected {
                debug!("[Session {}] Already connected", session.id);
                return Ok(session.snapshot().await);
            }
        }

        self.release(session, Release::Close).await;

        if options.fresh {
            info!("[Session {}] Fresh connect, clearing credentials", session.id);
            if let Err(e) = self.credentials.remove(&session.id).await {
                session
                    .update(|inner| inner.lifecycle.mark_error(e.to_string()))
                    .await;
                return Err(e);
            }
            session.update(|inner| inner.lifecycle.reset()).await;
        }
        if origin == Origin::Api {
            session
                .update(|inner| inner.lifecycle.reconnect_attempts = 0)
                .await;
        }

        let dir = match self.credentials.prepare(&session.id).await {
            Ok(dir) => dir,
            Err(e) => {
                error!("[Session {}] {}", session.id, e);
                session
                    .update(|inner| inner.lifecycle.mark_error(e.to_string()))
                    .await;
                return Err(e);
            }
        };

        let generation = session.next_generation();
        session.update(|inner| inner.lifecycle.mark_connecting()).await;
        info!("[Session {}] Connecting", session.id);

        let Connection { handle, events } = match self.factory.connect(&session.id, &dir).await {
            Ok(connection) => connection,
            Err(e) => {
                error!("[Session {}] Failed to open transport: {}", session.id, e);
                session
                    .update(|inner| inner.lifecycle.mark_error(e.to_string()))
                    .await;
                return Err(e);
            }
        };

        session.update(|inner| inner.transport = Some(handle)).await;
        let pump = tokio::spawn(pump_events(
            self.me.clone(),
            session.clone(),
            generation,
            events,
        ));
        session.update(|inner| inner.pump = Some(pump)).await;

        Ok(session.snapshot().await)
    }

    /// Drop the current handle, if any. Idempotent.
    async fn release(&self, session: &Session, mode: Release) {
        session.next_generation();
        let (handle, pump, connected) = {
            let mut inner = session.inner.write().await;
            (
                inner.transport.take(),
                inner.pump.take(),
                inner.lifecycle.state == SessionState::Connected,
            )
        };

        if let Some(pump) = pump {
            pump.abort();
        }
        let Some(handle) = handle else {
            return;
        };

        if mode == Release::Logout && connected {
            info!("[Session {}] Logging out", session.id);
            if let Err(e) = handle.logout().await {
                warn!("[Session {}] Logout failed, closing: {}", session.id, e);
                handle.close().await;
            }
        } else {
            debug!("[Session {}] Closing transport", session.id);
            handle.close().await;
        }
    }

    async fn disconnect_locked(&self, session: &Session, mode: Release, reason: &str) {
        self.release(session, mode).await;

        let (previous, attempts) = session
            .update(|inner| {
                let previous = inner.lifecycle.state;
                inner.lifecycle.mark_disconnected();
                (previous, inner.lifecycle.reconnect_attempts)
            })
            .await;

        if previous != SessionState::Disconnected {
            info!("[Session {}] Disconnected ({})", session.id, reason);
            self.dispatcher.emit(
                EventKind::Disconnected,
                &session.id,
                json!({ "reason": reason, "willReconnect": false, "attempts": attempts }),
            );
        }
    }

    /// Graceful close: logout if authenticated. Credentials are kept.
    pub async fn disconnect(&self, id: &str) -> Result<SessionSnapshot> {
        let session = self
            .get(id)
            .ok_or_else(|| Error::SessionNotFound(id.to_string()))?;
        let _guard = session.op_lock.lock().await;
        self.disconnect_locked(&session, Release::Logout, "manual")
            .await;
        Ok(session.snapshot().await)
    }

    /// Release the handle without logging out
    pub async fn close(&self, id: &str) -> Result<()> {
        let session = self
            .get(id)
            .ok_or_else(|| Error::SessionNotFound(id.to_string()))?;
        let _guard = session.op_lock.lock().await;
        self.disconnect_locked(&session, Release::Close, "closed")
            .await;
        Ok(())
    }

    /// Disconnect, remove credentials and forget the session
    pub async fn delete(&self, id: &str) -> Result<()> {
        validate_session_id(id)?;

        let Some(session) = self.get(id) else {
            if self.credentials.exists(id).await {
                self.credentials.remove(id).await?;
                info!("Removed credentials of unloaded session {}", id);
                return Ok(());
            }
            return Err(Error::SessionNotFound(id.to_string()));
        };

        let _guard = session.op_lock.lock().await;
        self.disconnect_locked(&session, Release::Logout, "deleted")
            .await;
        self.credentials.remove(id).await?;
        self.sessions
            .remove_if(id, |_, current| Arc::ptr_eq(current, &session));
        info!("Deleted session {}", id);
        Ok(())
    }

    pub async fn snapshot(&self, id: &str) -> Option<SessionSnapshot> {
        match self.get(id) {
            Some(session) => Some(session.snapshot().await),
            None => None,
        }
    }

    /// Snapshots of every session, ordered by id
    pub async fn list(&self) -> BTreeMap<String, SessionSnapshot> {
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        let mut snapshots = BTreeMap::new();
        for session in sessions {
            snapshots.insert(session.id.clone(), session.snapshot().await);
        }
        snapshots
    }

    /// Fresh QR payload of a session
    pub async fn current_qr(&self, id: &str) -> Option<String> {
        match self.get(id) {
            Some(session) => session.current_qr().await,
            None => None,
        }
    }

    /// Wait until the session leaves `connecting` or `timeout` elapses
    pub async fn wait_for_outcome(&self, id: &str, timeout: Duration) -> Option<SessionSnapshot> {
        let session = self.get(id)?;
        let mut rx = session.subscribe();
        let settled = tokio::time::timeout(
            timeout,
            rx.wait_for(|state| *state != SessionState::Connecting),
        )
        .await
        .is_ok();
        if !settled {
            debug!("[Session {}] Still connecting after {:?}", id, timeout);
        }
        Some(session.snapshot().await)
    }

    /// Send through a connected session; returns the transport message id
    pub async fn send(&self, id: &str, to: &str, message: OutboundMessage) -> Result<String> {
        let session = self
            .get(id)
            .ok_or_else(|| Error::SessionNotFound(id.to_string()))?;
        let jid = normalize_jid(to)?;

        let handle = {
            let inner = session.inner.read().await;
            match (&inner.transport, inner.lifecycle.state) {
                (Some(handle), SessionState::Connected) => handle.clone(),
                _ => return Err(Error::NotConnected(id.to_string())),
            }
        };

        let message_id = handle.send(&jid, message).await?;
        debug!("[Session {}] Sent {} to {}", id, message_id, jid);
        Ok(message_id)
    }

    /// Connect every session that has stored credentials
    pub async fn restore(&self) -> Result<usize> {
        let ids = self.credentials.list().await?;
        let mut restored = 0;

        for id in ids {
            match self.connect(&id, ConnectOptions::default()).await {
                Ok(_) => restored += 1,
                Err(e) => warn!("Failed to restore session {}: {}", id, e),
            }
        }

        info!("Restored {} session(s)", restored);
        Ok(restored)
    }

    /// Close every session without logging out
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        info!("Closing {} session(s)", sessions.len());

        for session in sessions {
            let _guard = session.op_lock.lock().await;
            self.disconnect_locked(&session, Release::Close, "shutdown")
                .await;
        }
    }

    /// Apply one event from the handle of `generation`; false once stale
    async fn handle_event(
        &self,
        session: &Arc<Session>,
        generation: u64,
        event: TransportEvent,
    ) -> bool {
        if let TransportEvent::Messages(batch) = event {
            if session.generation() != generation {
                return false;
            }
            ingest_batch(&self.dispatcher, &session.id, batch);
            return true;
        }

        // Teardown after a close must finish before a connect can start over
        let _guard = if matches!(event, TransportEvent::Closed(_)) {
            Some(session.op_lock.lock().await)
        } else {
            None
        };

        let (transition, finished) = {
            let mut inner = session.inner.write().await;
            if session.generation() != generation {
                debug!("[Session {}] Ignoring event from stale connection", session.id);
                return false;
            }
            let transition = inner.lifecycle.apply(&session.id, &event, &self.settings);
            let finished = if transition.closed {
                inner.pump.take();
                inner.transport.take()
            } else {
                None
            };
            session.publish(inner.lifecycle.state);
            (transition, finished)
        };

        if let Some(handle) = finished {
            handle.close().await;
        }
        if transition.wipe_credentials {
            if let Err(e) = self.credentials.remove(&session.id).await {
                warn!("[Session {}] {}", session.id, e);
            }
        }
        if let Some((kind, data)) = transition.webhook {
            self.dispatcher.emit(kind, &session.id, data);
        }
        if let Some(delay) = transition.reconnect_after {
            self.schedule_reconnect(session.clone(), generation, delay);
        }
        true
    }

    fn schedule_reconnect(&self, session: Arc<Session>, generation: u64, delay: Duration) {
        let registry = self.me.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(registry) = registry.upgrade() {
                registry.reconnect(&session, generation).await;
            }
        });
    }

    async fn reconnect(&self, session: &Arc<Session>, generation: u64) {
        let _guard = session.op_lock.lock().await;

        if !self.is_registered(session) {
            debug!("[Session {}] Deleted, skipping reconnect", session.id);
            return;
        }
        if session.generation() != generation {
            debug!("[Session {}] Superseded, skipping reconnect", session.id);
            return;
        }
        if session.state().await == SessionState::Connected {
            return;
        }

        info!("[Session {}] Reconnecting", session.id);
        if let Err(e) = self
            .connect_locked(session, ConnectOptions::default(), Origin::Reconnect)
            .await
        {
            warn!("[Session {}] Reconnect failed: {}", session.id, e);
        }
    }
}

/// Consume one handle's events in order
async fn pump_events(
    registry: Weak<SessionRegistry>,
    session: Arc<Session>,
    generation: u64,
    mut events: mpsc::Receiver<TransportEvent>,
) {
    loop {
        let event = events.recv().await.unwrap_or_else(|| {
            TransportEvent::Closed(CloseReason::Other {
                status_code: None,
                message: Some("event_stream_ended".to_string()),
            })
        });
        let last = matches!(event, TransportEvent::Closed(_));

        let Some(registry) = registry.upgrade() else {
            return;
        };
        if !registry.handle_event(&session, generation, event).await || last {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WebhookConfig;
    use crate::transport::mock::{MockConnection, MockTransportFactory};
    use crate::transport::InboundMessage;
    use tempfile::TempDir;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Harness {
        registry: Arc<SessionRegistry>,
        factory: MockTransportFactory,
        dir: TempDir,
    }

    impl Harness {
        fn new() -> Self {
            Self::with(SessionSettings::default(), WebhookDispatcher::disabled())
        }

        fn with(settings: SessionSettings, dispatcher: WebhookDispatcher) -> Self {
            let dir = TempDir::new().unwrap();
            let factory = MockTransportFactory::new();
            let registry = SessionRegistry::new(
                Arc::new(factory.clone()),
                CredentialStore::new(dir.path()),
                dispatcher,
                settings,
            );
            Self {
                registry,
                factory,
                dir,
            }
        }

        fn conn(&self, id: &str) -> MockConnection {
            self.factory.last_for(id).expect("no connection")
        }

        fn auth_dir(&self, id: &str) -> std::path::PathBuf {
            self.dir.path().join(id)
        }

        async fn connect(&self, id: &str) -> SessionSnapshot {
            self.registry
                .connect(id, ConnectOptions::default())
                .await
                .unwrap()
        }

        async fn wait_state(&self, id: &str, state: SessionState) {
            let session = self.registry.get(id).expect("unknown session");
            let mut rx = session.subscribe();
            tokio::time::timeout(Duration::from_secs(30), rx.wait_for(|s| *s == state))
                .await
                .expect("state not reached")
                .expect("state channel closed");
        }

        async fn connect_and_open(&self, id: &str) -> MockConnection {
            self.connect(id).await;
            let conn = self.conn(id);
            conn.emit(open_event()).await;
            self.wait_state(id, SessionState::Connected).await;
            conn
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..1000 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("condition not met");
    }

    fn open_event() -> TransportEvent {
        TransportEvent::Open {
            jid: "5511999999999:7@s.whatsapp.net".to_string(),
            name: Some("Ana".to_string()),
        }
    }

    fn transient() -> TransportEvent {
        TransportEvent::Closed(CloseReason::from_status(Some(428), None))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_get_or_create_is_idempotent() {
        let h = Harness::new();

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let registry = h.registry.clone();
                tokio::spawn(async move { registry.get_or_create("acct1").unwrap() })
            })
            .collect();

        let mut sessions = Vec::new();
        for task in tasks {
            sessions.push(task.await.unwrap());
        }

        assert!(sessions.iter().all(|s| Arc::ptr_eq(s, &sessions[0])));
        assert_eq!(h.registry.len(), 1);
        assert_eq!(sessions[0].state().await, SessionState::Disconnected);
        assert!(h.registry.get_or_create("../etc").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_qr_polling() {
        let h = Harness::new();

        let snapshot = h.connect("acct1").await;
        assert_eq!(snapshot.state, SessionState::Connecting);
        assert!(h.auth_dir("acct1").is_dir());

        h.conn("acct1").emit(TransportEvent::Qr("XYZ".into())).await;
        h.wait_state("acct1", SessionState::QrReady).await;

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(h.registry.current_qr("acct1").await.as_deref(), Some("XYZ"));
        assert!(h.registry.snapshot("acct1").await.unwrap().has_qr);

        tokio::time::advance(Duration::from_secs(55)).await;
        assert_eq!(h.registry.current_qr("acct1").await, None);
        let snapshot = h.registry.snapshot("acct1").await.unwrap();
        assert_eq!(snapshot.state, SessionState::Connecting);
        assert!(!snapshot.has_qr);
    }

    #[tokio::test]
    async fn test_open_sets_phone_and_clears_qr() {
        let h = Harness::new();
        h.connect("acct1").await;

        let conn = h.conn("acct1");
        conn.emit(TransportEvent::Qr("XYZ".into())).await;
        h.wait_state("acct1", SessionState::QrReady).await;
        conn.emit(open_event()).await;
        h.wait_state("acct1", SessionState::Connected).await;

        let snapshot = h.registry.snapshot("acct1").await.unwrap();
        assert_eq!(snapshot.phone.as_deref(), Some("5511999999999"));
        assert!(!snapshot.has_qr);
        assert_eq!(snapshot.reconnect_attempts, 0);
    }

    #[tokio::test]
    async fn test_connect_when_connected_is_noop_unless_forced() {
        let h = Harness::new();
        let first = h.connect_and_open("acct1").await;

        let snapshot = h.connect("acct1").await;
        assert_eq!(snapshot.state, SessionState::Connected);
        assert_eq!(h.factory.connect_count(), 1);
        assert!(!first.is_closed());

        let snapshot = h
            .registry
            .connect(
                "acct1",
                ConnectOptions {
                    force: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(snapshot.state, SessionState::Connecting);
        assert_eq!(h.factory.connect_count(), 2);
        assert!(first.is_closed());
        assert!(!first.is_logged_out());
    }

    #[tokio::test]
    async fn test_reconnect_when_connected_policy() {
        let settings = SessionSettings {
            reconnect_when_connected: true,
            ..Default::default()
        };
        let h = Harness::with(settings, WebhookDispatcher::disabled());
        let first = h.connect_and_open("acct1").await;

        h.connect("acct1").await;
        assert_eq!(h.factory.connect_count(), 2);
        assert!(first.is_closed());
    }

    #[tokio::test]
    async fn test_fresh_connect_wipes_credentials() {
        let h = Harness::new();
        h.connect_and_open("acct1").await;
        std::fs::write(h.auth_dir("acct1").join("creds.json"), "{}").unwrap();

        let snapshot = h
            .registry
            .connect(
                "acct1",
                ConnectOptions {
                    fresh: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(snapshot.state, SessionState::Connecting);
        assert_eq!(snapshot.phone, None);
        assert_eq!(h.factory.connect_count(), 2);
        assert!(h.auth_dir("acct1").is_dir());
        assert!(!h.auth_dir("acct1").join("creds.json").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_close_reconnects_with_backoff() {
        let h = Harness::new();
        h.connect_and_open("acct1").await;

        h.conn("acct1").emit(transient()).await;
        h.wait_state("acct1", SessionState::Disconnected).await;

        let snapshot = h.registry.snapshot("acct1").await.unwrap();
        assert_eq!(snapshot.reconnect_attempts, 1);
        assert_eq!(snapshot.phone, None);
        assert!(!snapshot.has_qr);

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(h.factory.connect_count(), 1);

        let factory = h.factory.clone();
        wait_until(|| factory.connect_count() == 2).await;
        h.wait_state("acct1", SessionState::Connecting).await;
        assert_eq!(h.registry.snapshot("acct1").await.unwrap().reconnect_attempts, 1);

        h.conn("acct1").emit(open_event()).await;
        h.wait_state("acct1", SessionState::Connected).await;
        assert_eq!(h.registry.snapshot("acct1").await.unwrap().reconnect_attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_attempts_are_bounded() {
        let settings = SessionSettings {
            max_reconnect_attempts: 2,
            ..Default::default()
        };
        let h = Harness::with(settings, WebhookDispatcher::disabled());
        h.connect("acct1").await;

        for expected in 2..=3 {
            h.conn("acct1").emit(transient()).await;
            let factory = h.factory.clone();
            wait_until(|| factory.connect_count() == expected).await;
        }

        h.conn("acct1").emit(transient()).await;
        h.wait_state("acct1", SessionState::Disconnected).await;

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(h.factory.connect_count(), 3);

        let snapshot = h.registry.snapshot("acct1").await.unwrap();
        assert_eq!(snapshot.state, SessionState::Disconnected);
        assert_eq!(snapshot.reconnect_attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_logged_out_is_terminal() {
        let h = Harness::new();
        h.connect_and_open("acct1").await;
        std::fs::write(h.auth_dir("acct1").join("creds.json"), "{}").unwrap();

        h.conn("acct1")
            .emit(TransportEvent::Closed(CloseReason::LoggedOut))
            .await;
        h.wait_state("acct1", SessionState::Disconnected).await;

        let dir = h.auth_dir("acct1");
        wait_until(|| !dir.exists()).await;

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(h.factory.connect_count(), 1);

        let snapshot = h.registry.snapshot("acct1").await.unwrap();
        assert_eq!(snapshot.phone, None);
        assert_eq!(snapshot.reconnect_attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_logged_out_wipe_finishes_before_reconnect() {
        let h = Harness::new();
        let conn = h.connect_and_open("acct1").await;
        conn.slow_close(Duration::from_millis(300));
        std::fs::write(h.auth_dir("acct1").join("creds.json"), "{}").unwrap();

        conn.emit(TransportEvent::Closed(CloseReason::LoggedOut))
            .await;
        h.wait_state("acct1", SessionState::Disconnected).await;

        // Blocks until the old handle is closed and its credentials are gone
        let snapshot = h.connect("acct1").await;
        assert_eq!(snapshot.state, SessionState::Connecting);
        assert_eq!(h.factory.connect_count(), 2);
        assert!(conn.is_closed());

        tokio::time::sleep(Duration::from_secs(1)).await;
        let dir = h.auth_dir("acct1");
        assert!(dir.is_dir());
        assert!(!dir.join("creds.json").exists());
        let snapshot = h.registry.snapshot("acct1").await.unwrap();
        assert_eq!(snapshot.state, SessionState::Connecting);
    }

    #[tokio::test]
    async fn test_connect_failure_sets_error() {
        let h = Harness::new();
        h.factory.fail_next("bridge unreachable");

        let err = h
            .registry
            .connect("acct1", ConnectOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport(_)));

        let snapshot = h.registry.snapshot("acct1").await.unwrap();
        assert_eq!(snapshot.state, SessionState::Error);
        assert!(snapshot.last_error.unwrap().contains("bridge unreachable"));

        let snapshot = h.connect("acct1").await;
        assert_eq!(snapshot.state, SessionState::Connecting);
        assert_eq!(snapshot.last_error, None);
    }

    #[tokio::test]
    async fn test_disconnect_logs_out_and_keeps_credentials() {
        let h = Harness::new();
        let conn = h.connect_and_open("acct1").await;

        let snapshot = h.registry.disconnect("acct1").await.unwrap();
        assert_eq!(snapshot.state, SessionState::Disconnected);
        assert_eq!(snapshot.phone, None);
        assert!(conn.is_logged_out());
        assert!(h.auth_dir("acct1").is_dir());

        // Unauthenticated handles are only released
        h.connect("acct1").await;
        let pending = h.conn("acct1");
        h.registry.disconnect("acct1").await.unwrap();
        assert!(pending.is_closed());
        assert!(!pending.is_logged_out());

        assert!(matches!(
            h.registry.disconnect("nope").await,
            Err(Error::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_close_never_logs_out() {
        let h = Harness::new();
        let conn = h.connect_and_open("acct1").await;

        h.registry.close("acct1").await.unwrap();
        assert!(conn.is_closed());
        assert!(!conn.is_logged_out());
        assert_eq!(h.registry.get("acct1").unwrap().state().await, SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_delete_then_recreate() {
        let h = Harness::new();
        let conn = h.connect_and_open("acct1").await;

        h.registry.delete("acct1").await.unwrap();
        assert!(conn.is_logged_out());
        assert!(!h.auth_dir("acct1").exists());
        assert!(h.registry.get("acct1").is_none());
        assert!(h.registry.is_empty());

        let session = h.registry.get_or_create("acct1").unwrap();
        let snapshot = session.snapshot().await;
        assert_eq!(snapshot.state, SessionState::Disconnected);
        assert_eq!(snapshot.phone, None);

        assert!(matches!(
            h.registry.delete("nope").await,
            Err(Error::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_unloaded_credentials() {
        let h = Harness::new();
        h.registry.credentials().prepare("old").await.unwrap();

        h.registry.delete("old").await.unwrap();
        assert!(!h.auth_dir("old").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_cancels_pending_reconnect() {
        let h = Harness::new();
        h.connect_and_open("acct1").await;

        h.conn("acct1").emit(transient()).await;
        h.wait_state("acct1", SessionState::Disconnected).await;
        h.registry.delete("acct1").await.unwrap();

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(h.factory.connect_count(), 1);
        assert!(h.registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_api_connect_supersedes_pending_reconnect() {
        let h = Harness::new();
        h.connect_and_open("acct1").await;

        h.conn("acct1").emit(transient()).await;
        h.wait_state("acct1", SessionState::Disconnected).await;

        let snapshot = h.connect("acct1").await;
        assert_eq!(snapshot.reconnect_attempts, 0);
        assert_eq!(h.factory.connect_count(), 2);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(h.factory.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_stale_events_are_ignored() {
        let h = Harness::new();
        h.connect("acct1").await;
        let old = h.conn("acct1");

        h.registry
            .connect(
                "acct1",
                ConnectOptions {
                    force: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let new = h.conn("acct1");

        old.emit(TransportEvent::Closed(CloseReason::LoggedOut)).await;
        old.emit(TransportEvent::Qr("OLD".into())).await;
        new.emit(TransportEvent::Qr("NEW".into())).await;
        h.wait_state("acct1", SessionState::QrReady).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.registry.current_qr("acct1").await.as_deref(), Some("NEW"));
        assert!(h.auth_dir("acct1").is_dir());
    }

    #[tokio::test]
    async fn test_send_requires_connected() {
        let h = Harness::new();
        h.connect("acct1").await;
        let conn = h.conn("acct1");

        let text = OutboundMessage::Text { text: "hi".into() };
        let err = h
            .registry
            .send("acct1", "5511888888888", text.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotConnected(_)));
        assert!(conn.sent().is_empty());

        conn.emit(open_event()).await;
        h.wait_state("acct1", SessionState::Connected).await;

        let id = h
            .registry
            .send("acct1", "5511888888888", text.clone())
            .await
            .unwrap();
        assert_eq!(id, "MOCK1");
        assert_eq!(conn.sent()[0].0, "5511888888888@s.whatsapp.net");

        conn.fail_sends(true);
        assert!(matches!(
            h.registry.send("acct1", "5511888888888", text.clone()).await,
            Err(Error::Transport(_))
        ));
        assert_eq!(h.registry.get("acct1").unwrap().state().await, SessionState::Connected);

        assert!(matches!(
            h.registry.send("acct1", "nope", text.clone()).await,
            Err(Error::InvalidRequest(_))
        ));
        assert!(matches!(
            h.registry.send("other", "5511888888888", text).await,
            Err(Error::SessionNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_outcome() {
        let h = Harness::new();
        h.connect("acct1").await;
        let conn = h.conn("acct1");

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            conn.emit(TransportEvent::Qr("XYZ".into())).await;
        });

        let snapshot = h
            .registry
            .wait_for_outcome("acct1", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(snapshot.state, SessionState::QrReady);
        assert!(snapshot.has_qr);

        h.connect("quiet").await;
        let snapshot = h
            .registry
            .wait_for_outcome("quiet", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(snapshot.state, SessionState::Connecting);

        assert!(h
            .registry
            .wait_for_outcome("nope", Duration::from_secs(1))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_restore_connects_stored_sessions() {
        let h = Harness::new();
        h.registry.credentials().prepare("b").await.unwrap();
        h.registry.credentials().prepare("a").await.unwrap();

        assert_eq!(h.registry.restore().await.unwrap(), 2);
        assert_eq!(h.factory.connect_count(), 2);

        let ids: Vec<_> = h.registry.list().await.into_keys().collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_shutdown_closes_without_logout() {
        let h = Harness::new();
        let first = h.connect_and_open("acct1").await;
        let second = h.connect_and_open("acct2").await;

        h.registry.shutdown().await;

        for conn in [&first, &second] {
            assert!(conn.is_closed());
            assert!(!conn.is_logged_out());
        }
        for snapshot in h.registry.list().await.values() {
            assert_eq!(snapshot.state, SessionState::Disconnected);
        }
        assert!(h.auth_dir("acct1").is_dir());
    }

    #[tokio::test]
    async fn test_lifecycle_webhooks() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let dispatcher = WebhookDispatcher::new(&WebhookConfig {
            url: Some(server.uri()),
            ..Default::default()
        })
        .unwrap();
        let h = Harness::with(SessionSettings::default(), dispatcher);

        h.connect("acct1").await;
        let conn = h.conn("acct1");
        conn.emit(TransportEvent::Qr("XYZ".into())).await;
        h.wait_state("acct1", SessionState::QrReady).await;
        conn.emit(open_event()).await;
        h.wait_state("acct1", SessionState::Connected).await;

        let inbound = |id: &str, from_me: bool| InboundMessage {
            id: id.to_string(),
            remote_jid: "5511888888888@s.whatsapp.net".to_string(),
            participant: None,
            from_me,
            push_name: None,
            timestamp: 1_700_000_000,
            message: Some(json!({"conversation": "hi"})),
        };
        conn.emit(TransportEvent::Messages(vec![
            inbound("in", false),
            inbound("out", true),
        ]))
        .await;

        // Let the batch reach the webhook before the handle is torn down
        for _ in 0..100 {
            if server.received_requests().await.unwrap().len() >= 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        h.registry.disconnect("acct1").await.unwrap();

        let mut bodies = Vec::new();
        for _ in 0..100 {
            let requests = server.received_requests().await.unwrap();
            if requests.len() >= 4 {
                bodies = requests
                    .iter()
                    .map(|r| serde_json::from_slice::<serde_json::Value>(&r.body).unwrap())
                    .collect();
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        assert!(bodies.iter().all(|body| body["sessionId"] == "acct1"));
        let mut types: Vec<&str> = bodies
            .iter()
            .map(|body| body["type"].as_str().unwrap())
            .collect();
        types.sort();
        assert_eq!(types, vec!["connected", "disconnected", "message", "qr"]);

        let disconnected = bodies
            .iter()
            .find(|body| body["type"] == "disconnected")
            .unwrap();
        assert_eq!(disconnected["data"]["reason"], "manual");
        assert_eq!(disconnected["data"]["willReconnect"], false);
    }
}
