//! # Speech-Service Collaborators
//!
//! The relay treats transcription, reply generation, and speech synthesis as
//! external services consumed through narrow trait interfaces. The audio
//! pipeline never knows which vendor sits behind a trait: tests substitute
//! in-process mocks, production wires up the HTTP clients in [`http`].
//!
//! ## Call policy:
//! Every collaborator call carries a timeout and gets at most one retry.
//! After that the turn is skipped and the orchestrator degrades gracefully
//! instead of blocking a live phone call on a slow service.

pub mod cache; // Content-hash synthesis cache
pub mod http; // reqwest-backed implementations

use crate::error::{RelayError, RelayResult};
use async_trait::async_trait;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Conversation state handed to the reply generator alongside the
/// transcript.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationContext {
    pub call_sid: String,
    pub turn_count: u32,
}

/// Speech-to-text. Receives raw linear16 bytes plus their sample rate.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio: &[u8], sample_rate: u32) -> RelayResult<String>;
}

/// Transcript-to-reply-text.
#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    async fn generate_reply(&self, text: &str, context: &ConversationContext)
        -> RelayResult<String>;
}

/// Text-to-speech. Returns container audio (WAV); the relay owns converting
/// it to the carrier format.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, text: &str) -> RelayResult<Vec<u8>>;
}

/// Lifecycle hooks for logging/personalization systems. Deliberately off
/// the audio-critical path: implementations must return quickly and never
/// fail the call.
pub trait SessionObserver: Send + Sync {
    fn on_session_start(&self, call_id: &str);
    fn on_session_end(&self, call_id: &str, trace_summary: &serde_json::Value);
}

/// The full set of collaborators a relay needs, behind trait objects.
#[derive(Clone)]
pub struct Collaborators {
    pub transcriber: Arc<dyn Transcriber>,
    pub reply_generator: Arc<dyn ReplyGenerator>,
    pub synthesizer: Arc<dyn Synthesizer>,
    pub observers: Vec<Arc<dyn SessionObserver>>,
}

/// Run a collaborator call with a timeout and at most one retry.
///
/// A timeout or failure on the first attempt logs and retries once; a second
/// failure surfaces to the caller, who skips the turn.
pub async fn call_with_retry<T, F, Fut>(
    service: &'static str,
    timeout: Duration,
    attempt: F,
) -> RelayResult<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = RelayResult<T>>,
{
    match tokio::time::timeout(timeout, attempt()).await {
        Ok(Ok(value)) => return Ok(value),
        Ok(Err(err)) => warn!("{} call failed, retrying once: {}", service, err),
        Err(_) => warn!(
            "{} call exceeded {}ms, retrying once",
            service,
            timeout.as_millis()
        ),
    }

    match tokio::time::timeout(timeout, attempt()).await {
        Ok(result) => result,
        Err(_) => Err(RelayError::CollaboratorTimeout {
            service,
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}
