//! # Error Handling
//!
//! This module defines the error taxonomy for the voice relay and how errors
//! are converted to HTTP responses on the API surface.
//!
//! ## Error Categories:
//!
//! ### Audio pipeline errors (recovered locally, never fatal to a session)
//! - **MalformedContainer**: a container (WAV) header was truncated or invalid
//! - **MisalignedSampleWidth**: a 16-bit PCM buffer had an odd byte length
//! - **UnsupportedResample**: a sample-rate conversion the codec cannot perform
//!
//! ### Session/transport errors (surface to the orchestrator)
//! - **InvalidStateTransition**: a call-state change not in the legal table
//! - **TransportClosed**: the carrier connection is gone mid-operation
//! - **CollaboratorTimeout / CollaboratorFailure**: a speech-service call
//!   timed out or failed; at most one retry, then the turn is skipped
//!
//! ### HTTP surface errors
//! - **Internal / BadRequest / NotFound / ConfigError**: standard API failures
//!
//! ## Propagation policy:
//! Codec errors drop the offending frame or utterance and log; state-machine
//! violations skip the guarded operation; transport and collaborator failures
//! move the affected session toward ERROR then DISCONNECTED. No error in the
//! audio path terminates sessions other than the one affected.

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Error type covering the audio pipeline, call lifecycle, and HTTP surface.
#[derive(Debug)]
pub enum RelayError {
    /// Container audio (e.g. WAV) with a truncated or invalid header
    MalformedContainer(String),

    /// 16-bit PCM byte buffer with an odd length
    MisalignedSampleWidth(usize),

    /// Sample-rate conversion the codec does not support
    UnsupportedResample { from: u32, to: u32 },

    /// Call-state change that is not in the legal transition table
    InvalidStateTransition { from: String, to: String },

    /// The carrier transport closed while an operation was in flight
    TransportClosed(String),

    /// A collaborator call exceeded its configured timeout
    CollaboratorTimeout { service: &'static str, timeout_ms: u64 },

    /// A collaborator call failed outright (network, HTTP status, bad body)
    CollaboratorFailure { service: &'static str, message: String },

    /// Internal server errors on the HTTP surface
    Internal(String),

    /// Client sent invalid or malformed data
    BadRequest(String),

    /// Requested resource was not found
    NotFound(String),

    /// Configuration file or environment variable problems
    ConfigError(String),
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayError::MalformedContainer(msg) => {
                write!(f, "Malformed audio container: {}", msg)
            }
            RelayError::MisalignedSampleWidth(len) => write!(
                f,
                "Misaligned sample width: {} bytes is not a whole number of 16-bit samples",
                len
            ),
            RelayError::UnsupportedResample { from, to } => {
                write!(f, "Unsupported resample: {} Hz -> {} Hz", from, to)
            }
            RelayError::InvalidStateTransition { from, to } => {
                write!(f, "Invalid state transition: {} -> {}", from, to)
            }
            RelayError::TransportClosed(msg) => write!(f, "Transport closed: {}", msg),
            RelayError::CollaboratorTimeout {
                service,
                timeout_ms,
            } => write!(f, "{} call timed out after {}ms", service, timeout_ms),
            RelayError::CollaboratorFailure { service, message } => {
                write!(f, "{} call failed: {}", service, message)
            }
            RelayError::Internal(msg) => write!(f, "Internal error: {}", msg),
            RelayError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            RelayError::NotFound(msg) => write!(f, "Not found: {}", msg),
            RelayError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for RelayError {}

/// Converts relay errors into the JSON error responses the API surface emits.
///
/// Pipeline errors only reach this impl through the debug endpoints; in the
/// audio path they are handled before an HTTP response is ever involved.
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "malformed_container",
///     "message": "Malformed audio container: missing data chunk",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for RelayError {
    fn error_response(&self) -> HttpResponse {
        use actix_web::http::StatusCode;

        let (status, error_type) = match self {
            RelayError::MalformedContainer(_) => (StatusCode::BAD_REQUEST, "malformed_container"),
            RelayError::MisalignedSampleWidth(_) => {
                (StatusCode::BAD_REQUEST, "misaligned_sample_width")
            }
            RelayError::UnsupportedResample { .. } => {
                (StatusCode::UNPROCESSABLE_ENTITY, "unsupported_resample")
            }
            RelayError::InvalidStateTransition { .. } => {
                (StatusCode::CONFLICT, "invalid_state_transition")
            }
            RelayError::TransportClosed(_) => (StatusCode::GONE, "transport_closed"),
            RelayError::CollaboratorTimeout { .. } => {
                (StatusCode::GATEWAY_TIMEOUT, "collaborator_timeout")
            }
            RelayError::CollaboratorFailure { .. } => {
                (StatusCode::BAD_GATEWAY, "collaborator_failure")
            }
            RelayError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
            RelayError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            RelayError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            RelayError::ConfigError(_) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error"),
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": self.to_string(),
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for RelayError {
    fn from(err: anyhow::Error) -> Self {
        RelayError::Internal(err.to_string())
    }
}

/// JSON parsing errors are almost always the client's fault, so they map to
/// BadRequest rather than an internal error.
impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for RelayError {
    fn from(err: config::ConfigError) -> Self {
        RelayError::ConfigError(err.to_string())
    }
}

/// Shorthand for `Result<T, RelayError>` used throughout the crate.
pub type RelayResult<T> = Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_context() {
        let err = RelayError::MisalignedSampleWidth(7);
        assert!(err.to_string().contains("7 bytes"));

        let err = RelayError::CollaboratorTimeout {
            service: "transcription",
            timeout_ms: 5000,
        };
        assert!(err.to_string().contains("5000ms"));
    }

    #[test]
    fn test_anyhow_conversion() {
        let err: RelayError = anyhow::anyhow!("boom").into();
        assert!(matches!(err, RelayError::Internal(_)));
    }

    #[test]
    fn test_invalid_transition_display() {
        let err = RelayError::InvalidStateTransition {
            from: "disconnected".to_string(),
            to: "speaking".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid state transition: disconnected -> speaking"
        );
    }
}
