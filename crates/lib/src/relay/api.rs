//! Portal HTTP API: session listing and administration, help signal, key pool status.

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use super::error::{ApiError, ApiResult};
use super::server::RelayState;
use crate::dispatch::available_models;
use crate::session::{Message, SessionSummary};

/// GET / and GET /health
pub async fn health(State(state): State<RelayState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "runtime": "running",
        "port": state.port,
        "timestamp": chrono::Utc::now(),
    }))
}

/// GET /api/sessions
pub async fn list_sessions(State(state): State<RelayState>) -> Json<Vec<SessionSummary>> {
    let limit = state.relay.settings().session_list_limit;
    Json(state.relay.store().list_recent(limit).await)
}

/// GET /api/sessions/:id/messages
pub async fn get_messages(
    State(state): State<RelayState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<Message>>> {
    let session = state
        .relay
        .store()
        .get(&id)
        .await
        .ok_or_else(|| ApiError::NotFound("Session not found".to_string()))?;
    Ok(Json(session.history))
}

#[derive(Debug, Deserialize)]
pub struct PostMessageBody {
    #[serde(default)]
    pub message: String,
}

/// POST /api/sessions/:id/messages
pub async fn post_message(
    State(state): State<RelayState>,
    Path(id): Path<String>,
    Json(body): Json<PostMessageBody>,
) -> ApiResult<Json<Message>> {
    if body.message.trim().is_empty() {
        return Err(ApiError::BadRequest("message is required".to_string()));
    }
    let saved = state.relay.post_portal_message(&id, body.message).await?;
    Ok(Json(saved))
}

/// DELETE /api/sessions/:id/messages
pub async fn clear_messages(
    State(state): State<RelayState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    state.relay.clear_session_history(&id).await?;
    Ok(Json(json!({ "success": true, "message": "History cleared" })))
}

/// DELETE /api/sessions/:id
pub async fn delete_session(
    State(state): State<RelayState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    if !state.relay.delete_session(&id).await? {
        return Err(ApiError::NotFound("Session not found".to_string()));
    }
    log::info!("api: deleted session {}", id);
    Ok(Json(json!({ "message": "Session deleted successfully" })))
}

/// DELETE /api/sessions/all
pub async fn delete_all_sessions(State(state): State<RelayState>) -> ApiResult<Json<Value>> {
    let deleted = state.relay.delete_all_sessions().await?;
    log::info!("api: deleted all sessions ({})", deleted);
    Ok(Json(json!({
        "message": "All sessions deleted successfully",
        "deletedCount": deleted,
    })))
}

#[derive(Debug, Default, Deserialize)]
pub struct HelpBody {
    #[serde(default)]
    pub message: String,
}

/// POST /api/sessions/:id/help
pub async fn request_help(
    State(state): State<RelayState>,
    Path(id): Path<String>,
    body: Option<Json<HelpBody>>,
) -> ApiResult<Json<Value>> {
    let Json(body) = body.unwrap_or_default();
    let outcome = state.relay.request_help(&id, body.message).await?;
    let message = if outcome.portal_notified {
        "Help request sent to portal"
    } else {
        "Help request saved; no portal connected"
    };
    Ok(Json(json!({
        "success": true,
        "message": message,
        "portalNotified": outcome.portal_notified,
    })))
}

/// GET /api/keys/status
pub async fn key_status(State(state): State<RelayState>) -> Json<Value> {
    let keys = state.relay.dispatcher().key_status();
    let active = keys.iter().filter(|k| !k.is_blocked).count();
    Json(json!({
        "success": true,
        "totalKeys": keys.len(),
        "activeKeys": active,
        "keys": keys,
    }))
}

/// POST /api/keys/unblock
pub async fn unblock_keys(State(state): State<RelayState>) -> Json<Value> {
    state.relay.dispatcher().unblock_all();
    log::info!("api: all keys unblocked");
    Json(json!({ "success": true, "message": "All keys unblocked" }))
}

/// GET /api/models
pub async fn models() -> Json<Value> {
    Json(available_models())
}
