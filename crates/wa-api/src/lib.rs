//! wa-api: HTTP API for wa-gateway
//!
//! Session management, QR polling and message sending over REST.
//! Built with axum; every handler is a thin adapter over
//! [`wa_core::SessionRegistry`].

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod qr;
pub mod routes;
pub mod server;

pub use error::{ApiError, Result};
pub use server::{AppState, router, start_server};
