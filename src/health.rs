use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let uptime_seconds = state.get_uptime_seconds();
    let active_calls = state.registry.active_count();

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "service": {
            "name": "voice-relay-backend",
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "metrics": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": if metrics.request_count > 0 {
                metrics.error_count as f64 / metrics.request_count as f64
            } else {
                0.0
            },
            "active_calls": active_calls
        },
        "system": system_status(&config, active_calls)
    }))
}

/// Detailed status: aggregate call and request metrics plus per-endpoint
/// rollups. Served at `/api/v1/status`.
pub async fn service_status(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let uptime_seconds = state.get_uptime_seconds();
    let active_calls = state.registry.active_count();

    let mut endpoint_stats = Vec::new();
    for (endpoint, metric) in metrics.endpoint_metrics.iter() {
        endpoint_stats.push(json!({
            "endpoint": endpoint,
            "request_count": metric.request_count,
            "error_count": metric.error_count,
            "error_rate": metric.error_rate(),
            "average_duration_ms": metric.average_duration_ms(),
            "total_duration_ms": metric.total_duration_ms
        }));
    }

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "calls": {
            "active": active_calls,
            "started": metrics.calls_started,
            "ended": metrics.calls_ended,
            "max_concurrent": config.performance.max_concurrent_sessions
        },
        "requests": {
            "total": metrics.request_count,
            "errors": metrics.error_count,
            "error_rate": if metrics.request_count > 0 {
                metrics.error_count as f64 / metrics.request_count as f64
            } else {
                0.0
            },
            "per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "synthesis_cache": {
            "entries": state.cache.len()
        },
        "endpoints": endpoint_stats,
        "audio": {
            "sample_rate": config.audio.sample_rate,
            "frame_duration_ms": config.audio.frame_duration_ms
        }
    }))
}

fn system_status(config: &crate::config::AppConfig, active_calls: usize) -> serde_json::Value {
    let session_usage = if config.performance.max_concurrent_sessions > 0 {
        active_calls as f64 / config.performance.max_concurrent_sessions as f64
    } else {
        0.0
    };

    let status = if session_usage > 0.9 {
        "high_load"
    } else if session_usage > 0.7 {
        "moderate_load"
    } else {
        "normal"
    };

    json!({
        "status": status,
        "call_usage_percent": (session_usage * 100.0).round(),
        "max_calls": config.performance.max_concurrent_sessions,
        "current_calls": active_calls,
        "load_warnings": if session_usage > 0.8 {
            vec!["High call volume - consider increasing max_concurrent_sessions"]
        } else {
            vec![]
        }
    })
}
