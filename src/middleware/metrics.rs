use crate::state::AppState;
use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    web, Error,
};
use futures_util::future::LocalBoxFuture;
use std::{
    future::{ready, Ready},
    time::Instant,
};

/// Per-endpoint request counting and timing, fed into [`AppState`].
///
/// The carrier media-stream upgrade gets its own `WS` endpoint label: its
/// measured duration covers only the HTTP handshake, and folding that into
/// the API latency rollups would skew their averages. The stream itself is
/// tracked per-session by the registry, not here.
pub struct MetricsMiddleware;

/// Rollup key for one endpoint. Websocket upgrades are labeled `WS` instead
/// of the HTTP method so handshake timings stay out of the API stats.
fn endpoint_label(req: &ServiceRequest) -> String {
    if super::is_websocket_upgrade(req) {
        format!("WS {}", req.uri().path())
    } else {
        format!("{} {}", req.method(), req.uri().path())
    }
}

impl<S, B> Transform<S, ServiceRequest> for MetricsMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = MetricsMiddlewareService<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(MetricsMiddlewareService { service }))
    }
}

pub struct MetricsMiddlewareService<S> {
    service: S,
}

impl<S, B> Service<ServiceRequest> for MetricsMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let start_time = Instant::now();
        let endpoint = endpoint_label(&req);

        if let Some(app_state) = req.app_data::<web::Data<AppState>>() {
            app_state.increment_request_count();
        }

        let fut = self.service.call(req);

        Box::pin(async move {
            let result = fut.await;
            let duration_ms = start_time.elapsed().as_millis() as u64;

            let is_error = match &result {
                Ok(response) => {
                    response.status().is_client_error() || response.status().is_server_error()
                }
                Err(_) => true,
            };

            if let Ok(response) = &result {
                if let Some(app_state) = response.request().app_data::<web::Data<AppState>>() {
                    app_state.record_endpoint_request(&endpoint, duration_ms, is_error);

                    if is_error {
                        app_state.increment_error_count();
                    }
                }
            }

            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;

    #[actix_web::test]
    async fn test_upgrade_requests_get_their_own_label() {
        let req = TestRequest::get()
            .uri("/ws/media-stream")
            .insert_header(("upgrade", "websocket"))
            .to_srv_request();
        assert_eq!(endpoint_label(&req), "WS /ws/media-stream");
    }

    #[actix_web::test]
    async fn test_api_requests_keep_method_and_path() {
        let req = TestRequest::get().uri("/health").to_srv_request();
        assert_eq!(endpoint_label(&req), "GET /health");

        let req = TestRequest::put().uri("/api/v1/config").to_srv_request();
        assert_eq!(endpoint_label(&req), "PUT /api/v1/config");
    }
}
