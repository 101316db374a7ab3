//! # HTTP Collaborator Clients
//!
//! reqwest-backed implementations of the collaborator traits. Each client
//! holds one endpoint URL and a shared connection pool; authentication is a
//! bearer token applied when configured.
//!
//! The per-call timeout is enforced twice: on the reqwest client itself and
//! by the orchestrator's `call_with_retry` wrapper, so a stuck connection
//! can never outlive the call policy.

use crate::audio::codec;
use crate::collaborators::{ConversationContext, ReplyGenerator, Synthesizer, Transcriber};
use crate::config::CollaboratorsConfig;
use crate::error::{RelayError, RelayResult};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

fn build_client(timeout_ms: u64) -> RelayResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_millis(timeout_ms))
        .build()
        .map_err(|e| RelayError::Internal(format!("HTTP client build failed: {}", e)))
}

fn apply_auth(request: reqwest::RequestBuilder, api_key: &str) -> reqwest::RequestBuilder {
    if api_key.is_empty() {
        request
    } else {
        request.bearer_auth(api_key)
    }
}

async fn check_status(
    service: &'static str,
    response: reqwest::Response,
) -> RelayResult<reqwest::Response> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(RelayError::CollaboratorFailure {
            service,
            message: format!("HTTP {}", response.status()),
        })
    }
}

/// Speech-to-text over HTTP: POSTs a WAV body, expects `{"text": "..."}`.
pub struct HttpTranscriber {
    client: reqwest::Client,
    url: String,
    api_key: String,
}

#[derive(Deserialize)]
struct TranscriptionResponse {
    text: String,
}

impl HttpTranscriber {
    pub fn new(config: &CollaboratorsConfig) -> RelayResult<Self> {
        Ok(Self {
            client: build_client(config.timeout_ms)?,
            url: config.transcription_url.clone(),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl Transcriber for HttpTranscriber {
    async fn transcribe(&self, audio: &[u8], sample_rate: u32) -> RelayResult<String> {
        // Empty audio transcribes to nothing without a network round trip
        if audio.is_empty() {
            return Ok(String::new());
        }

        // The service wants a self-describing container, not raw samples
        let samples = codec::pcm_bytes_to_samples(audio)?;
        let wav = codec::wrap_pcm(&samples, sample_rate, 1);

        let request = apply_auth(self.client.post(&self.url), &self.api_key)
            .header("content-type", "audio/wav")
            .body(wav);

        let response = request.send().await.map_err(|e| RelayError::CollaboratorFailure {
            service: "transcription",
            message: e.to_string(),
        })?;
        let response = check_status("transcription", response).await?;

        let body: TranscriptionResponse =
            response
                .json()
                .await
                .map_err(|e| RelayError::CollaboratorFailure {
                    service: "transcription",
                    message: format!("unparseable response: {}", e),
                })?;
        Ok(body.text.trim().to_string())
    }
}

/// Reply generation over HTTP: POSTs the transcript and conversation
/// context, expects `{"reply": "..."}`.
pub struct HttpReplyGenerator {
    client: reqwest::Client,
    url: String,
    api_key: String,
}

#[derive(Deserialize)]
struct ReplyResponse {
    reply: String,
}

impl HttpReplyGenerator {
    pub fn new(config: &CollaboratorsConfig) -> RelayResult<Self> {
        Ok(Self {
            client: build_client(config.timeout_ms)?,
            url: config.reply_url.clone(),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl ReplyGenerator for HttpReplyGenerator {
    async fn generate_reply(
        &self,
        text: &str,
        context: &ConversationContext,
    ) -> RelayResult<String> {
        let request = apply_auth(self.client.post(&self.url), &self.api_key).json(
            &serde_json::json!({
                "text": text,
                "call_sid": context.call_sid,
                "turn_count": context.turn_count,
            }),
        );

        let response = request.send().await.map_err(|e| RelayError::CollaboratorFailure {
            service: "reply",
            message: e.to_string(),
        })?;
        let response = check_status("reply", response).await?;

        let body: ReplyResponse = response
            .json()
            .await
            .map_err(|e| RelayError::CollaboratorFailure {
                service: "reply",
                message: format!("unparseable response: {}", e),
            })?;
        Ok(body.reply)
    }
}

/// Text-to-speech over HTTP: POSTs `{"text": "..."}`, expects container
/// audio bytes (WAV) in the response body.
pub struct HttpSynthesizer {
    client: reqwest::Client,
    url: String,
    api_key: String,
}

impl HttpSynthesizer {
    pub fn new(config: &CollaboratorsConfig) -> RelayResult<Self> {
        Ok(Self {
            client: build_client(config.timeout_ms)?,
            url: config.synthesis_url.clone(),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl Synthesizer for HttpSynthesizer {
    async fn synthesize(&self, text: &str) -> RelayResult<Vec<u8>> {
        let request = apply_auth(self.client.post(&self.url), &self.api_key)
            .json(&serde_json::json!({ "text": text }));

        let response = request.send().await.map_err(|e| RelayError::CollaboratorFailure {
            service: "synthesis",
            message: e.to_string(),
        })?;
        let response = check_status("synthesis", response).await?;

        let bytes = response
            .bytes()
            .await
            .map_err(|e| RelayError::CollaboratorFailure {
                service: "synthesis",
                message: format!("body read failed: {}", e),
            })?;

        if bytes.is_empty() {
            return Err(RelayError::CollaboratorFailure {
                service: "synthesis",
                message: "empty audio response".to_string(),
            });
        }
        Ok(bytes.to_vec())
    }
}
