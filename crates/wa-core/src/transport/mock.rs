//! In-memory transport for tests
//!
//! Every `connect` produces a [`MockConnection`] that the test drives by
//! emitting events and inspecting sends, logouts and closes.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{Connection, OutboundMessage, Transport, TransportEvent, TransportFactory};
use crate::{Error, Result};

#[derive(Default)]
struct HandleState {
    sent: Mutex<Vec<(String, OutboundMessage)>>,
    logged_out: AtomicBool,
    closed: AtomicBool,
    fail_sends: AtomicBool,
    close_delay_ms: AtomicU64,
}

struct MockTransport {
    state: Arc<HandleState>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, to: &str, message: OutboundMessage) -> Result<String> {
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(Error::Transport("handle closed".to_string()));
        }
        if self.state.fail_sends.load(Ordering::SeqCst) {
            return Err(Error::Transport("send rejected".to_string()));
        }

        let mut sent = self.state.sent.lock().expect("mock state poisoned");
        sent.push((to.to_string(), message));
        Ok(format!("MOCK{}", sent.len()))
    }

    async fn logout(&self) -> Result<()> {
        self.state.logged_out.store(true, Ordering::SeqCst);
        self.state.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        let delay = self.state.close_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.state.closed.store(true, Ordering::SeqCst);
    }
}

/// Test-side view of one handle
#[derive(Clone)]
pub struct MockConnection {
    pub session_id: String,
    pub credentials: PathBuf,
    events: mpsc::Sender<TransportEvent>,
    state: Arc<HandleState>,
}

impl MockConnection {
    /// Push an event into the handle's stream; false if nobody listens
    pub async fn emit(&self, event: TransportEvent) -> bool {
        self.events.send(event).await.is_ok()
    }

    /// Messages sent through this handle
    pub fn sent(&self) -> Vec<(String, OutboundMessage)> {
        self.state.sent.lock().expect("mock state poisoned").clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    pub fn is_logged_out(&self) -> bool {
        self.state.logged_out.load(Ordering::SeqCst)
    }

    /// Make `close` take `delay` before it returns
    pub fn slow_close(&self, delay: Duration) {
        self.state
            .close_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Make subsequent sends fail
    pub fn fail_sends(&self, fail: bool) {
        self.state.fail_sends.store(fail, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct FactoryState {
    connections: Vec<MockConnection>,
    fail_next: Option<String>,
}

/// Factory handing out [`MockConnection`]s
#[derive(Clone, Default)]
pub struct MockTransportFactory {
    state: Arc<Mutex<FactoryState>>,
}

impl MockTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of handles created so far
    pub fn connect_count(&self) -> usize {
        self.lock().connections.len()
    }

    /// Handles created for one session, oldest first
    pub fn connections_for(&self, session_id: &str) -> Vec<MockConnection> {
        self.lock()
            .connections
            .iter()
            .filter(|c| c.session_id == session_id)
            .cloned()
            .collect()
    }

    /// Most recent handle for a session
    pub fn last_for(&self, session_id: &str) -> Option<MockConnection> {
        self.connections_for(session_id).pop()
    }

    /// Make the next `connect` fail with `message`
    pub fn fail_next(&self, message: impl Into<String>) {
        self.lock().fail_next = Some(message.into());
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FactoryState> {
        self.state.lock().expect("mock state poisoned")
    }
}

#[async_trait]
impl TransportFactory for MockTransportFactory {
    async fn connect(&self, session_id: &str, credentials: &Path) -> Result<Connection> {
        let mut state = self.lock();
        if let Some(message) = state.fail_next.take() {
            return Err(Error::Transport(message));
        }

        let (tx, rx) = mpsc::channel(64);
        let handle_state = Arc::new(HandleState::default());
        state.connections.push(MockConnection {
            session_id: session_id.to_string(),
            credentials: credentials.to_path_buf(),
            events: tx,
            state: handle_state.clone(),
        });

        Ok(Connection {
            handle: Arc::new(MockTransport {
                state: handle_state,
            }),
            events: rx,
        })
    }
}
