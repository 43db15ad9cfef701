//! HTTP API handlers
//!
//! Request handlers for session management, QR polling and sending.

use std::collections::BTreeMap;
use std::time::Duration;

use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State},
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use wa_core::{ConnectOptions, OutboundMessage, SessionSnapshot, SessionState};

use crate::error::{ApiError, Result};
use crate::qr::{render_unicode, svg_data_url};
use crate::server::AppState;

// ============================================================================
// Request/Response types
// ============================================================================

/// Create session request payload
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub session_id: Option<String>,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub fresh: bool,
    /// Also draw the QR code into the server log
    #[serde(default, rename = "printQR")]
    pub print_qr: bool,
}

/// Body of endpoints addressing a single session
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRequest {
    pub session_id: Option<String>,
}

/// `?sessionId=` query
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionQuery {
    pub session_id: Option<String>,
}

/// Send message request payload
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub session_id: Option<String>,
    /// Recipient; `to` is accepted as an alias
    pub phone: Option<String>,
    pub to: Option<String>,
    /// Text body, or the caption when `image` is set
    pub message: Option<String>,
    /// Image URL
    pub image: Option<String>,
    pub caption: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionResponse {
    pub success: bool,
    pub session_id: String,
    pub status: SessionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qrcode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QrCodeResponse {
    pub session_id: String,
    pub status: SessionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qrcode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub sessions: BTreeMap<String, SessionSnapshot>,
    pub total: usize,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub sessions: usize,
    /// Seconds since startup
    pub uptime: i64,
}

#[derive(Debug, Serialize)]
pub struct SuccessResponse {
    pub success: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageResponse {
    pub success: bool,
    pub message_id: String,
}

// ============================================================================
// Helpers
// ============================================================================

/// Parse an optional JSON body; an empty body yields the defaults
fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| ApiError::InvalidRequest(format!("Invalid JSON body: {}", e)))
}

fn resolve_session_id(state: &AppState, requested: Option<String>) -> String {
    requested
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| state.config.sessions.default_id.clone())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

// ============================================================================
// Handler functions
// ============================================================================

/// Health check endpoint
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        sessions: state.registry.len(),
        uptime: (chrono::Utc::now() - state.started_at).num_seconds(),
    })
}

/// Connect a session and wait briefly for a QR code or a connection
pub async fn create_session(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<CreateSessionResponse>> {
    let req: CreateSessionRequest = parse_body(&body)?;
    let session_id = resolve_session_id(&state, req.session_id);
    info!(
        "Create session request: {} (force={}, fresh={})",
        session_id, req.force, req.fresh
    );

    state
        .registry
        .connect(
            &session_id,
            ConnectOptions {
                fresh: req.fresh,
                force: req.force,
            },
        )
        .await?;

    let wait = Duration::from_millis(state.config.sessions.create_wait_ms);
    let snapshot = state
        .registry
        .wait_for_outcome(&session_id, wait)
        .await
        .ok_or_else(|| ApiError::SessionNotFound(session_id.clone()))?;

    let qr = match snapshot.state {
        SessionState::QrReady => state.registry.current_qr(&session_id).await,
        _ => None,
    };
    let qrcode = qr.as_deref().map(svg_data_url).transpose()?;

    if req.print_qr {
        if let Some(payload) = qr.as_deref() {
            match render_unicode(payload) {
                Ok(text) => info!("[Session {}] Scan to pair:\n{}", session_id, text),
                Err(e) => warn!("[Session {}] {}", session_id, e),
            }
        }
    }

    let message = match snapshot.state {
        SessionState::Connected => "Session connected".to_string(),
        SessionState::QrReady => "Scan the QR code to pair".to_string(),
        SessionState::Error => snapshot
            .last_error
            .clone()
            .unwrap_or_else(|| "Connection failed".to_string()),
        _ => "Connecting; poll /qrcode for the pairing code".to_string(),
    };

    Ok(Json(CreateSessionResponse {
        success: snapshot.state != SessionState::Error,
        session_id,
        status: snapshot.state,
        qr,
        qrcode,
        phone: snapshot.phone,
        message: Some(message),
    }))
}

/// Current QR code of a session (public)
pub async fn qrcode(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
) -> Result<Json<QrCodeResponse>> {
    let session_id = resolve_session_id(&state, query.session_id);
    let session = state
        .registry
        .get(&session_id)
        .ok_or_else(|| ApiError::SessionNotFound(session_id.clone()))?;

    // Read the QR first so an expired one is reflected in the snapshot
    let qr = session.current_qr().await;
    let snapshot = session.snapshot().await;
    let qrcode = qr.as_deref().map(svg_data_url).transpose()?;

    Ok(Json(QrCodeResponse {
        session_id,
        status: snapshot.state,
        qr,
        qrcode,
        phone: snapshot.phone,
    }))
}

/// Status of one session (`?sessionId=`) or all of them
pub async fn status(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
) -> Result<Json<StatusResponse>> {
    let sessions = match non_empty(query.session_id) {
        Some(id) => {
            let session = state.registry.get_or_create(id.trim())?;
            BTreeMap::from([(session.id().to_string(), session.snapshot().await)])
        }
        None => state.registry.list().await,
    };

    Ok(Json(StatusResponse {
        total: sessions.len(),
        sessions,
    }))
}

/// Log out (if authenticated) and disconnect; credentials are kept
pub async fn disconnect(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<SuccessResponse>> {
    let req: SessionRequest = parse_body(&body)?;
    let session_id = resolve_session_id(&state, req.session_id);
    info!("Disconnect request: {}", session_id);

    state.registry.disconnect(&session_id).await?;
    Ok(Json(SuccessResponse { success: true }))
}

/// Delete the default session
pub async fn delete_default_session(State(state): State<AppState>) -> Result<Json<SuccessResponse>> {
    let session_id = state.config.sessions.default_id.clone();
    delete(&state, &session_id).await
}

/// Delete a session and its credentials
pub async fn delete_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<SuccessResponse>> {
    delete(&state, &session_id).await
}

async fn delete(state: &AppState, session_id: &str) -> Result<Json<SuccessResponse>> {
    info!("Delete session request: {}", session_id);
    state.registry.delete(session_id).await?;
    Ok(Json(SuccessResponse { success: true }))
}

/// Send a text or image message through a connected session
pub async fn send_message(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<SendMessageResponse>> {
    let req: SendMessageRequest = parse_body(&body)?;
    let session_id = resolve_session_id(&state, req.session_id);

    let recipient = non_empty(req.phone)
        .or_else(|| non_empty(req.to))
        .ok_or_else(|| ApiError::InvalidRequest("phone or to is required".to_string()))?;

    let message = match (non_empty(req.image), non_empty(req.message)) {
        (Some(url), text) => OutboundMessage::Image {
            url,
            caption: non_empty(req.caption).or(text),
        },
        (None, Some(text)) => OutboundMessage::Text { text },
        (None, None) => {
            return Err(ApiError::InvalidRequest(
                "message or image is required".to_string(),
            ));
        }
    };

    debug!("Send message request: {} -> {}", session_id, recipient);
    state.registry.get_or_create(&session_id)?;
    let message_id = state
        .registry
        .send(&session_id, &recipient, message)
        .await?;

    Ok(Json(SendMessageResponse {
        success: true,
        message_id,
    }))
}
