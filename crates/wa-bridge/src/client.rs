//! Bridge-backed transport handles

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;
use wa_core::{
    BridgeConfig, CloseReason, Connection, OutboundMessage, Transport, TransportEvent,
    TransportFactory,
};

use crate::error::{BridgeError, Result};
use crate::protocol::{InboundFrame, OutboundFrame};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Waiters for send acknowledgements, keyed by request id
type PendingAcks = Arc<DashMap<String, oneshot::Sender<std::result::Result<String, String>>>>;

const EVENT_BUFFER: usize = 64;

/// Opens one bridge WebSocket per session
#[derive(Debug, Clone)]
pub struct BridgeTransportFactory {
    base_url: Url,
    send_timeout: Duration,
}

impl BridgeTransportFactory {
    pub fn new(config: &BridgeConfig) -> Result<Self> {
        let base_url = Url::parse(&config.url)?;
        if !matches!(base_url.scheme(), "ws" | "wss") {
            return Err(BridgeError::InvalidUrl(format!(
                "expected ws:// or wss://, got {}",
                config.url
            )));
        }

        Ok(Self {
            base_url,
            send_timeout: Duration::from_secs(config.send_timeout_secs),
        })
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// `<base>/sessions/<id>?authDir=<dir>`
    pub fn session_url(&self, session_id: &str, credentials: &Path) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| BridgeError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .push("sessions")
            .push(session_id);
        url.query_pairs_mut()
            .append_pair("authDir", &credentials.to_string_lossy());
        Ok(url)
    }
}

#[async_trait]
impl TransportFactory for BridgeTransportFactory {
    async fn connect(&self, session_id: &str, credentials: &Path) -> wa_core::Result<Connection> {
        let url = self.session_url(session_id, credentials)?;
        info!("[Session {}] Connecting to bridge: {}", session_id, url.path());

        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| BridgeError::WebSocket(e.to_string()))?;
        debug!("[Session {}] Bridge socket open", session_id);

        let (write, read) = ws_stream.split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let pending: PendingAcks = Arc::new(DashMap::new());

        tokio::spawn(write_loop(session_id.to_string(), write, outbound_rx));
        let reader = tokio::spawn(read_loop(
            session_id.to_string(),
            read,
            outbound_tx.clone(),
            events_tx,
            pending.clone(),
        ));

        let handle = BridgeTransport {
            session_id: session_id.to_string(),
            outbound: outbound_tx,
            pending,
            send_timeout: self.send_timeout,
            closed: AtomicBool::new(false),
            reader: reader.abort_handle(),
        };

        Ok(Connection {
            handle: Arc::new(handle),
            events: events_rx,
        })
    }
}

/// One live bridge socket
struct BridgeTransport {
    session_id: String,
    outbound: mpsc::UnboundedSender<WsMessage>,
    pending: PendingAcks,
    send_timeout: Duration,
    closed: AtomicBool,
    reader: AbortHandle,
}

impl BridgeTransport {
    fn write(&self, frame: &OutboundFrame) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BridgeError::Closed);
        }
        let text = serde_json::to_string(frame)?;
        self.outbound
            .send(WsMessage::Text(text.into()))
            .map_err(|_| BridgeError::Closed)
    }

    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // The writer sends the close frame and exits
        let _ = self.outbound.send(WsMessage::Close(None));
        self.reader.abort();
        self.pending.clear();
    }

    async fn send_frame(&self, to: &str, message: OutboundMessage) -> Result<String> {
        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id.clone(), tx);

        let frame = OutboundFrame::Send {
            request_id: request_id.clone(),
            to: to.to_string(),
            message,
        };
        if let Err(e) = self.write(&frame) {
            self.pending.remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(self.send_timeout, rx).await {
            Ok(Ok(Ok(message_id))) => Ok(message_id),
            Ok(Ok(Err(reason))) => Err(BridgeError::Rejected(reason)),
            Ok(Err(_)) => Err(BridgeError::Closed),
            Err(_) => {
                self.pending.remove(&request_id);
                Err(BridgeError::Timeout(self.send_timeout))
            }
        }
    }
}

#[async_trait]
impl Transport for BridgeTransport {
    async fn send(&self, to: &str, message: OutboundMessage) -> wa_core::Result<String> {
        Ok(self.send_frame(to, message).await?)
    }

    async fn logout(&self) -> wa_core::Result<()> {
        info!("[Session {}] Sending logout to bridge", self.session_id);
        self.write(&OutboundFrame::Logout)?;
        self.shutdown();
        Ok(())
    }

    async fn close(&self) {
        self.shutdown();
    }
}

impl Drop for BridgeTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn write_loop(
    session_id: String,
    mut write: SplitSink<WsStream, WsMessage>,
    mut outbound: mpsc::UnboundedReceiver<WsMessage>,
) {
    while let Some(message) = outbound.recv().await {
        let closing = matches!(message, WsMessage::Close(_));
        if let Err(e) = write.send(message).await {
            debug!("[Session {}] Bridge write failed: {}", session_id, e);
            break;
        }
        if closing {
            break;
        }
    }
    let _ = write.close().await;
}

async fn read_loop(
    session_id: String,
    mut read: SplitStream<WsStream>,
    outbound: mpsc::UnboundedSender<WsMessage>,
    events: mpsc::Sender<TransportEvent>,
    pending: PendingAcks,
) {
    let mut closed_by_bridge = false;

    while let Some(message) = read.next().await {
        match message {
            Ok(WsMessage::Text(text)) => {
                let frame: InboundFrame = match serde_json::from_str(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("[Session {}] Unparseable bridge frame: {}", session_id, e);
                        continue;
                    }
                };

                let Some(event) = route_frame(&session_id, frame, &pending) else {
                    continue;
                };
                let last = matches!(event, TransportEvent::Closed(_));
                if events.send(event).await.is_err() {
                    debug!("[Session {}] Event receiver gone", session_id);
                    break;
                }
                if last {
                    closed_by_bridge = true;
                    break;
                }
            }
            Ok(WsMessage::Ping(data)) => {
                let _ = outbound.send(WsMessage::Pong(data));
            }
            Ok(WsMessage::Close(frame)) => {
                debug!("[Session {}] Bridge closed socket: {:?}", session_id, frame);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("[Session {}] Bridge socket error: {}", session_id, e);
                break;
            }
        }
    }

    pending.clear();
    if !closed_by_bridge {
        let reason = CloseReason::from_status(None, Some("connection_lost".to_string()));
        let _ = events.send(TransportEvent::Closed(reason)).await;
    }
}

/// Turn a frame into a lifecycle event, resolving ack waiters on the way
fn route_frame(
    session_id: &str,
    frame: InboundFrame,
    pending: &PendingAcks,
) -> Option<TransportEvent> {
    match frame {
        InboundFrame::Qr { qr } => Some(TransportEvent::Qr(qr)),
        InboundFrame::Open { jid, name } => Some(TransportEvent::Open { jid, name }),
        InboundFrame::Close {
            status_code,
            reason,
        } => Some(TransportEvent::Closed(CloseReason::from_status(
            status_code,
            reason,
        ))),
        InboundFrame::Messages { messages } if messages.is_empty() => None,
        InboundFrame::Messages { messages } => Some(TransportEvent::Messages(messages)),
        InboundFrame::Ack {
            request_id,
            message_id,
        } => {
            match pending.remove(&request_id) {
                Some((_, waiter)) => {
                    let _ = waiter.send(Ok(message_id));
                }
                None => debug!("[Session {}] Late ack for {}", session_id, request_id),
            }
            None
        }
        InboundFrame::Error {
            request_id: Some(request_id),
            error,
        } => {
            if let Some((_, waiter)) = pending.remove(&request_id) {
                let _ = waiter.send(Err(error));
            }
            None
        }
        InboundFrame::Error {
            request_id: None,
            error,
        } => {
            warn!("[Session {}] Bridge error: {}", session_id, error);
            None
        }
    }
}
