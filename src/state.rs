//! # Application State Management
//!
//! Shared state for the HTTP and websocket layers. Everything here is
//! reached from concurrent request handlers, so each piece carries its own
//! synchronization: `Arc<RwLock<..>>` for config and metrics, and the
//! registry/cache types bring their own interior locks.
//!
//! Per-call diagnostics live on the session trace; the metrics here are the
//! process-wide aggregates the status endpoints report.

use crate::collaborators::cache::SynthesisCache;
use crate::collaborators::{Collaborators, SessionObserver};
use crate::config::AppConfig;
use crate::session::registry::SessionRegistry;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// The application state shared across all HTTP request handlers and
/// websocket connections.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// Process-wide aggregate metrics, updated by middleware and sessions
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// All active call sessions, keyed by carrier stream SID
    pub registry: Arc<SessionRegistry>,

    /// Speech-service clients shared by every call
    pub collaborators: Collaborators,

    /// Synthesized-audio cache shared by every call
    pub cache: Arc<SynthesisCache>,

    /// When the server started
    pub start_time: Instant,
}

/// Aggregate metrics collected across all requests and calls.
#[derive(Debug, Default)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Total number of request errors since server start
    pub error_count: u64,

    /// Total calls started since server start
    pub calls_started: u64,

    /// Total calls ended (closed or errored) since server start
    pub calls_ended: u64,

    /// Per-endpoint statistics, keyed by "METHOD /path"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Performance metrics for a single API endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        registry: Arc<SessionRegistry>,
        mut collaborators: Collaborators,
        cache: Arc<SynthesisCache>,
    ) -> Self {
        let metrics = Arc::new(RwLock::new(AppMetrics::default()));

        // Call starts and ends flow back into the aggregates through the
        // observer seam, so the relay stays unaware of AppState.
        collaborators
            .observers
            .push(Arc::new(CallCountObserver {
                metrics: metrics.clone(),
            }));

        Self {
            config: Arc::new(RwLock::new(config)),
            metrics,
            registry,
            collaborators,
            cache,
            start_time: Instant::now(),
        }
    }

    /// Get a copy of the current configuration.
    ///
    /// ## Thread Safety:
    /// Cloning under the read lock releases it immediately; `AppConfig` is
    /// cheap to clone.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap().clone()
    }

    /// Replace the configuration after validating it.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        match new_config.validate() {
            Ok(_) => {
                *self.config.write().unwrap() = new_config;
                Ok(())
            }
            Err(e) => Err(e.to_string()),
        }
    }

    pub fn increment_request_count(&self) {
        self.metrics.write().unwrap().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.metrics.write().unwrap().error_count += 1;
    }

    /// Record one request against an endpoint's rollup.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Consistent snapshot of the aggregates, cloned so no lock is held
    /// while the response serializes.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        let metrics = self.metrics.read().unwrap();
        AppMetrics {
            request_count: metrics.request_count,
            error_count: metrics.error_count,
            calls_started: metrics.calls_started,
            calls_ended: metrics.calls_ended,
            endpoint_metrics: metrics.endpoint_metrics.clone(),
        }
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

/// Feeds call lifecycle events into the aggregate counters.
struct CallCountObserver {
    metrics: Arc<RwLock<AppMetrics>>,
}

impl SessionObserver for CallCountObserver {
    fn on_session_start(&self, _call_sid: &str) {
        self.metrics.write().unwrap().calls_started += 1;
    }

    fn on_session_end(&self, _call_sid: &str, _trace: &serde_json::Value) {
        self.metrics.write().unwrap().calls_ended += 1;
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Error rate as a fraction (0.0 to 1.0).
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{ReplyGenerator, Synthesizer, Transcriber};
    use crate::collaborators::ConversationContext;
    use crate::error::RelayResult;
    use async_trait::async_trait;

    struct NoopTranscriber;
    #[async_trait]
    impl Transcriber for NoopTranscriber {
        async fn transcribe(&self, _audio: &[u8], _sample_rate: u32) -> RelayResult<String> {
            Ok(String::new())
        }
    }

    struct NoopReply;
    #[async_trait]
    impl ReplyGenerator for NoopReply {
        async fn generate_reply(
            &self,
            _text: &str,
            _context: &ConversationContext,
        ) -> RelayResult<String> {
            Ok(String::new())
        }
    }

    struct NoopSynth;
    #[async_trait]
    impl Synthesizer for NoopSynth {
        async fn synthesize(&self, _text: &str) -> RelayResult<Vec<u8>> {
            Ok(vec![0])
        }
    }

    fn test_state() -> AppState {
        let collaborators = Collaborators {
            transcriber: Arc::new(NoopTranscriber),
            reply_generator: Arc::new(NoopReply),
            synthesizer: Arc::new(NoopSynth),
            observers: Vec::new(),
        };
        AppState::new(
            AppConfig::default(),
            Arc::new(SessionRegistry::new(10)),
            collaborators,
            Arc::new(SynthesisCache::new()),
        )
    }

    #[test]
    fn test_endpoint_metrics_accumulate() {
        let state = test_state();
        state.record_endpoint_request("GET /health", 10, false);
        state.record_endpoint_request("GET /health", 30, true);

        let snapshot = state.get_metrics_snapshot();
        let metric = &snapshot.endpoint_metrics["GET /health"];
        assert_eq!(metric.request_count, 2);
        assert_eq!(metric.error_count, 1);
        assert_eq!(metric.average_duration_ms(), 20.0);
        assert_eq!(metric.error_rate(), 0.5);
    }

    #[test]
    fn test_call_counts_flow_through_observer() {
        let state = test_state();
        let observer = state.collaborators.observers.last().unwrap().clone();

        observer.on_session_start("CA1");
        observer.on_session_start("CA2");
        observer.on_session_end("CA1", &serde_json::json!({}));

        let snapshot = state.get_metrics_snapshot();
        assert_eq!(snapshot.calls_started, 2);
        assert_eq!(snapshot.calls_ended, 1);
    }

    #[test]
    fn test_invalid_config_update_rejected() {
        let state = test_state();
        let mut bad = AppConfig::default();
        bad.server.port = 0;
        assert!(state.update_config(bad).is_err());

        // The original config is untouched
        assert_ne!(state.get_config().server.port, 0);
    }
}
