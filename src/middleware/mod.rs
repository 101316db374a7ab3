pub mod logging;
pub mod metrics;

pub use logging::RequestLogging;
pub use metrics::MetricsMiddleware;

use actix_web::dev::ServiceRequest;

/// Whether a request is a websocket upgrade, i.e. the carrier media stream.
pub(crate) fn is_websocket_upgrade(req: &ServiceRequest) -> bool {
    req.headers()
        .get("upgrade")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}
