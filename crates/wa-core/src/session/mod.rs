//! Session lifecycle
//!
//! A session is one independently authenticated account on the messaging
//! network. The [`SessionRegistry`] owns every session record, serializes
//! connect/disconnect per session and reacts to transport events.

pub mod lifecycle;
pub mod qr;
mod registry;
mod types;

pub use lifecycle::{backoff, Lifecycle, Transition};
pub use qr::QrTracker;
pub use registry::{Session, SessionRegistry};
pub use types::{ConnectOptions, SessionSettings, SessionSnapshot, SessionState};
