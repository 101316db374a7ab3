use crate::{error::RelayError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Serializable view of the config with the API key withheld.
fn config_view(config: &crate::config::AppConfig) -> serde_json::Value {
    json!({
        "server": {
            "host": config.server.host,
            "port": config.server.port
        },
        "audio": {
            "sample_rate": config.audio.sample_rate,
            "frame_duration_ms": config.audio.frame_duration_ms,
            "bytes_per_sample": config.audio.bytes_per_sample
        },
        "buffering": {
            "min_utterance_bytes": config.buffering.min_utterance_bytes,
            "silence_threshold_ms": config.buffering.silence_threshold_ms,
            "question_silence_ms": config.buffering.question_silence_ms,
            "statement_silence_ms": config.buffering.statement_silence_ms,
            "max_buffer_frames": config.buffering.max_buffer_frames,
            "silence_rms_threshold": config.buffering.silence_rms_threshold
        },
        "collaborators": {
            "transcription_url": config.collaborators.transcription_url,
            "reply_url": config.collaborators.reply_url,
            "synthesis_url": config.collaborators.synthesis_url,
            "timeout_ms": config.collaborators.timeout_ms,
            "min_reply_gap_ms": config.collaborators.min_reply_gap_ms
        },
        "performance": {
            "max_concurrent_sessions": config.performance.max_concurrent_sessions,
            "session_timeout_seconds": config.performance.session_timeout_seconds
        }
    })
}

pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, RelayError> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config_view(&config)
    })))
}

/// Partial runtime update, mostly for tuning segmentation thresholds on a
/// live deployment. New calls pick the values up; existing sessions keep the
/// config they started with.
pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> Result<HttpResponse, RelayError> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut current_config = state.get_config();
    current_config
        .update_from_json(&json_str)
        .map_err(|e| RelayError::BadRequest(e.to_string()))?;

    state
        .update_config(current_config.clone())
        .map_err(RelayError::BadRequest)?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": config_view(&current_config)
    })))
}
