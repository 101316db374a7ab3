//! # Call Trace
//!
//! Observability companion for one call: ordered state history, event log,
//! error log, and a metric map. Written by the orchestrator as the call
//! progresses, read only by the diagnostics endpoints and the session-end
//! observer hook. Nothing in the audio path ever consults it for control
//! flow.

use crate::session::state_machine::CallState;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize)]
pub struct TraceEvent {
    pub timestamp: DateTime<Utc>,
    pub name: String,
    pub details: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct TraceError {
    pub timestamp: DateTime<Utc>,
    pub kind: String,
    pub message: String,
}

/// Diagnostic record of one call's lifetime.
#[derive(Debug)]
pub struct CallTrace {
    call_sid: String,
    stream_sid: String,
    started_at: DateTime<Utc>,
    state_history: Vec<(DateTime<Utc>, CallState)>,
    events: Vec<TraceEvent>,
    errors: Vec<TraceError>,
    metrics: HashMap<String, f64>,
}

impl CallTrace {
    pub fn new(call_sid: &str, stream_sid: &str) -> Self {
        Self {
            call_sid: call_sid.to_string(),
            stream_sid: stream_sid.to_string(),
            started_at: Utc::now(),
            state_history: Vec::new(),
            events: Vec::new(),
            errors: Vec::new(),
            metrics: HashMap::new(),
        }
    }

    pub fn record_state(&mut self, state: CallState) {
        self.state_history.push((Utc::now(), state));
    }

    pub fn log_event(&mut self, name: &str, details: serde_json::Value) {
        self.events.push(TraceEvent {
            timestamp: Utc::now(),
            name: name.to_string(),
            details,
        });
    }

    pub fn record_error(&mut self, kind: &str, message: &str) {
        self.errors.push(TraceError {
            timestamp: Utc::now(),
            kind: kind.to_string(),
            message: message.to_string(),
        });
    }

    /// Record a named measurement. Repeated measurements overwrite; the map
    /// holds the latest value for each name.
    pub fn record_metric(&mut self, name: &str, value: f64) {
        self.metrics.insert(name.to_string(), value);
    }

    pub fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// JSON summary for the diagnostics endpoints and session-end hooks.
    pub fn summary(&self) -> serde_json::Value {
        let current_state = self
            .state_history
            .last()
            .map(|(_, state)| state.as_str())
            .unwrap_or("unknown");

        let duration_seconds =
            (Utc::now() - self.started_at).num_milliseconds() as f64 / 1000.0;

        serde_json::json!({
            "call_sid": self.call_sid,
            "stream_sid": self.stream_sid,
            "started_at": self.started_at.to_rfc3339(),
            "duration_seconds": duration_seconds,
            "current_state": current_state,
            "state_history_len": self.state_history.len(),
            "state_history": self.state_history.iter().map(|(t, s)| {
                serde_json::json!({ "timestamp": t.to_rfc3339(), "state": s.as_str() })
            }).collect::<Vec<_>>(),
            "events": self.events.len(),
            "recent_events": self.events.iter().rev().take(10).rev().collect::<Vec<_>>(),
            "error_count": self.errors.len(),
            "errors": self.errors,
            "metrics": self.metrics,
        })
    }
}
