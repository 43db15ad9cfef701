//! Route definitions
//!
//! `/health` and `/qrcode` are public; everything else requires the API key.

use axum::{
    Router, middleware,
    routing::{delete, get, post},
};

use crate::handlers::{
    create_session, delete_default_session, delete_session, disconnect, health, qrcode,
    send_message, status,
};
use crate::middleware::auth::auth_middleware;
use crate::server::AppState;

/// Create the API router
pub fn routes(state: AppState) -> Router<AppState> {
    let protected = Router::new()
        // Session lifecycle
        .route("/create-session", post(create_session))
        .route("/status", get(status))
        .route("/disconnect", post(disconnect))
        .route("/logout", post(disconnect))
        .route("/session", delete(delete_default_session))
        .route("/session/{session_id}", delete(delete_session))
        // Messaging
        .route("/send-message", post(send_message))
        .route_layer(middleware::from_fn_with_state(state, auth_middleware));

    Router::new()
        .route("/health", get(health))
        .route("/qrcode", get(qrcode))
        .merge(protected)
}
