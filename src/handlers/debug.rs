//! Diagnostics endpoints for live calls.
//!
//! Operators use these to inspect active sessions without attaching to the
//! carrier stream: a summary list, and the full per-call trace (state
//! history, events, errors, metrics) for one stream.

use crate::error::RelayError;
use crate::state::AppState;
use actix_web::{web, HttpResponse, Result as ActixResult};
use serde_json::json;

/// GET /api/v1/sessions: summaries of every active call.
pub async fn list_sessions(state: web::Data<AppState>) -> ActixResult<HttpResponse, RelayError> {
    let sessions = state.registry.summaries();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "active_count": sessions.len(),
        "sessions": sessions
    })))
}

/// GET /api/v1/sessions/{stream_sid}/trace: the full diagnostics trace for
/// one call.
pub async fn session_trace(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> ActixResult<HttpResponse, RelayError> {
    let stream_sid = path.into_inner();

    let session = state
        .registry
        .get(&stream_sid)
        .ok_or_else(|| RelayError::NotFound(format!("no active session for stream {}", stream_sid)))?;

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "session": session.summary(),
        "trace": session.state.trace_summary()
    })))
}
