//! # Configuration Management
//!
//! This module handles loading and managing relay configuration from multiple
//! sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (APP_SERVER_HOST, APP_BUFFERING_SILENCETHRESHOLDMS, ...)
//! 2. Configuration file (config.toml)
//! 3. Default values (defined in the Default impl)
//!
//! ## Why one config structure:
//! The silence/buffering thresholds that drive utterance segmentation are
//! heuristics, not guarantees, and have to be tunable per deployment. They
//! all live here under named fields instead of being scattered through the
//! pipeline as magic numbers.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Top-level relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub audio: AudioConfig,
    pub buffering: BufferingConfig,
    pub collaborators: CollaboratorsConfig,
    pub performance: PerformanceConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Carrier audio format parameters.
///
/// ## Fields:
/// - `sample_rate`: carrier media stream rate in Hz (telephony is 8000)
/// - `frame_duration_ms`: outbound frame duration; balances per-frame
///   transport overhead against end-to-end latency. Some carriers mandate
///   20 ms frames, the default transport here uses 160 ms.
/// - `bytes_per_sample`: 1 for the 8-bit companded carrier format
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub frame_duration_ms: u64,
    pub bytes_per_sample: usize,
}

/// Utterance segmentation thresholds consumed by StreamBuffer and the VAD.
///
/// ## Fields:
/// - `min_utterance_bytes`: accumulated bytes that count as "enough audio to
///   transcribe" regardless of silence (default 4000 = 0.5 s at 8 kHz μ-law)
/// - `silence_threshold_ms`: base silence duration that ends an utterance
/// - `question_silence_ms`: shorter threshold used right after the agent
///   asked a question (callers answer questions quickly)
/// - `statement_silence_ms`: longer threshold after a plain statement
/// - `late_turn_scale_pct`: percentage applied to the threshold once the
///   conversation has passed `late_turn_after` turns (callers settle into a
///   rhythm, pauses shrink)
/// - `max_buffer_frames`: frame ceiling; oldest frames are evicted beyond it
/// - `silence_rms_threshold`: RMS amplitude (16-bit linear scale) below which
///   a sub-frame is classified as silence
/// - `vad_subframe_ms`: sub-frame duration for speech/silence classification
/// - `vad_speech_frames`: consecutive speech sub-frames to confirm speech start
/// - `vad_silence_frames`: consecutive silence sub-frames to confirm speech end
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferingConfig {
    pub min_utterance_bytes: usize,
    pub silence_threshold_ms: u64,
    pub question_silence_ms: u64,
    pub statement_silence_ms: u64,
    pub late_turn_scale_pct: u64,
    pub late_turn_after: u32,
    pub max_buffer_frames: usize,
    pub silence_rms_threshold: f64,
    pub vad_subframe_ms: u64,
    pub vad_speech_frames: u32,
    pub vad_silence_frames: u32,
}

/// Speech-service collaborator endpoints and call policy.
///
/// ## Fields:
/// - `*_url`: HTTP endpoints for transcription, reply generation, synthesis
/// - `api_key`: bearer token passed to all three services (empty = none)
/// - `timeout_ms`: per-call timeout; a timed-out call counts as a recoverable
///   failure, never an indefinite block
/// - `greeting_text`: spoken when a call starts
/// - `apology_text`: spoken when reply synthesis fails, so the caller never
///   hears dead air
/// - `min_reply_gap_ms`: minimum spacing between agent replies in one session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollaboratorsConfig {
    pub transcription_url: String,
    pub reply_url: String,
    pub synthesis_url: String,
    pub api_key: String,
    pub timeout_ms: u64,
    pub greeting_text: String,
    pub apology_text: String,
    pub min_reply_gap_ms: u64,
}

/// Performance tuning configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_sessions: usize,
    pub session_timeout_seconds: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            audio: AudioConfig {
                sample_rate: 8000,
                frame_duration_ms: 160,
                bytes_per_sample: 1,
            },
            buffering: BufferingConfig {
                min_utterance_bytes: 4000, // 0.5 s of 8 kHz μ-law
                silence_threshold_ms: 1500,
                question_silence_ms: 1200,
                statement_silence_ms: 1800,
                late_turn_scale_pct: 80,
                late_turn_after: 3,
                max_buffer_frames: 50,
                silence_rms_threshold: 300.0,
                vad_subframe_ms: 30,
                vad_speech_frames: 5,
                vad_silence_frames: 20, // ~600 ms of confirmed silence
            },
            collaborators: CollaboratorsConfig {
                transcription_url: "http://127.0.0.1:9100/v1/transcribe".to_string(),
                reply_url: "http://127.0.0.1:9101/v1/reply".to_string(),
                synthesis_url: "http://127.0.0.1:9102/v1/synthesize".to_string(),
                api_key: String::new(),
                timeout_ms: 5000,
                greeting_text: "Hello! You have reached the voice assistant. How can I help you today?"
                    .to_string(),
                apology_text: "I'm sorry, I'm having trouble responding right now. Could you say that again?"
                    .to_string(),
                min_reply_gap_ms: 2000,
            },
            performance: PerformanceConfig {
                max_concurrent_sessions: 100,
                session_timeout_seconds: 300,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, then config.toml, then environment.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER_HOST=0.0.0.0`: Override server host
    /// - `APP_COLLABORATORS_TIMEOUTMS=8000`: Override collaborator timeout
    /// - `HOST=0.0.0.0` / `PORT=3000`: Special cases for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("_"));

        // Deployment platforms set HOST/PORT without the APP_ prefix
        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// Catching configuration errors at startup prevents runtime failures
    /// deep inside the audio path, where they would surface as garbled calls
    /// rather than clear messages.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.audio.sample_rate == 0 {
            return Err(anyhow::anyhow!("Audio sample rate cannot be 0"));
        }

        if self.audio.frame_duration_ms == 0 {
            return Err(anyhow::anyhow!("Frame duration must be greater than 0"));
        }

        if self.audio.bytes_per_sample == 0 {
            return Err(anyhow::anyhow!("Bytes per sample must be greater than 0"));
        }

        if self.buffering.min_utterance_bytes == 0 {
            return Err(anyhow::anyhow!("Minimum utterance bytes must be greater than 0"));
        }

        if self.buffering.max_buffer_frames == 0 {
            return Err(anyhow::anyhow!("Max buffer frames must be greater than 0"));
        }

        if self.buffering.vad_subframe_ms == 0 {
            return Err(anyhow::anyhow!("VAD sub-frame duration must be greater than 0"));
        }

        if self.collaborators.timeout_ms == 0 {
            return Err(anyhow::anyhow!("Collaborator timeout must be greater than 0"));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        Ok(())
    }

    /// Update configuration from a JSON string (used for runtime tuning).
    ///
    /// ## Partial updates:
    /// Only the provided fields change. The segmentation thresholds are the
    /// fields operators actually tune live, e.g.
    /// `{"buffering": {"silence_threshold_ms": 1200}}`.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(server) = partial.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                self.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                self.server.port = port as u16;
            }
        }

        if let Some(buffering) = partial.get("buffering") {
            if let Some(v) = buffering.get("min_utterance_bytes").and_then(|v| v.as_u64()) {
                self.buffering.min_utterance_bytes = v as usize;
            }
            if let Some(v) = buffering.get("silence_threshold_ms").and_then(|v| v.as_u64()) {
                self.buffering.silence_threshold_ms = v;
            }
            if let Some(v) = buffering.get("question_silence_ms").and_then(|v| v.as_u64()) {
                self.buffering.question_silence_ms = v;
            }
            if let Some(v) = buffering.get("statement_silence_ms").and_then(|v| v.as_u64()) {
                self.buffering.statement_silence_ms = v;
            }
            if let Some(v) = buffering.get("max_buffer_frames").and_then(|v| v.as_u64()) {
                self.buffering.max_buffer_frames = v as usize;
            }
            if let Some(v) = buffering.get("silence_rms_threshold").and_then(|v| v.as_f64()) {
                self.buffering.silence_rms_threshold = v;
            }
        }

        if let Some(collaborators) = partial.get("collaborators") {
            if let Some(v) = collaborators.get("timeout_ms").and_then(|v| v.as_u64()) {
                self.collaborators.timeout_ms = v;
            }
            if let Some(v) = collaborators.get("min_reply_gap_ms").and_then(|v| v.as_u64()) {
                self.collaborators.min_reply_gap_ms = v;
            }
        }

        if let Some(performance) = partial.get("performance") {
            if let Some(v) = performance
                .get("max_concurrent_sessions")
                .and_then(|v| v.as_u64())
            {
                self.performance.max_concurrent_sessions = v as usize;
            }
            if let Some(v) = performance
                .get("session_timeout_seconds")
                .and_then(|v| v.as_u64())
            {
                self.performance.session_timeout_seconds = v;
            }
        }

        self.validate()?;
        Ok(())
    }

    /// Bytes in one outbound carrier frame at the configured operating point.
    pub fn frame_size_bytes(&self) -> usize {
        (self.audio.sample_rate as u64 * self.audio.frame_duration_ms / 1000) as usize
            * self.audio.bytes_per_sample
    }
}
