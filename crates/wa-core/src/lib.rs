//! wa-core: session lifecycle core for wa-gateway
//!
//! Owns the per-tenant session registry, the connection state machine, QR
//! issuance, inbound message ingestion and webhook delivery. The messaging
//! transport and the credential store are consumed through the seams in
//! [`transport`] and [`credentials`].

pub mod config;
pub mod credentials;
pub mod error;
pub mod ingest;
pub mod session;
pub mod transport;
pub mod webhook;

pub use config::{ApiConfig, BridgeConfig, Config, LogConfig, SessionConfig, WebhookConfig};
pub use credentials::CredentialStore;
pub use error::{Error, Result};
pub use session::{
    ConnectOptions, Session, SessionRegistry, SessionSettings, SessionSnapshot, SessionState,
};
pub use transport::{
    CloseReason, Connection, InboundMessage, OutboundMessage, Transport, TransportEvent,
    TransportFactory,
};
pub use webhook::{EventKind, WebhookDispatcher, WebhookEvent};
