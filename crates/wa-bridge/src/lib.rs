//! wa-bridge: WebSocket transport for wa-gateway
//!
//! Each session opens one WebSocket to the protocol sidecar, which speaks the
//! messaging protocol and keeps the credential files in the directory it is
//! handed. Lifecycle events arrive as JSON frames tagged by `event`; sends and
//! logouts go out as frames tagged by `op`.

pub mod client;
pub mod error;
pub mod protocol;

pub use client::BridgeTransportFactory;
pub use error::{BridgeError, Result};
