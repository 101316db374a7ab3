//! # Audio Pipeline Module
//!
//! This module holds the real-time audio pipeline that bridges the carrier's
//! 8 kHz companded media stream to the linear PCM formats the speech services
//! require.
//!
//! ## Key Components:
//! - **Codec**: bit-exact G.711 μ-law companding, WAV container handling,
//!   resampling and downmixing
//! - **Frame Chunker**: reshapes byte streams into protocol-correct frames
//! - **VAD**: speech/silence classification with hysteresis
//! - **Stream Buffer**: per-session utterance accumulation and flush heuristic
//!
//! ## Carrier Audio Format:
//! - **Sample Rate**: 8 kHz (8,000 Hz)
//! - **Bit Depth**: 8-bit logarithmic (μ-law), 16-bit linear once decoded
//! - **Channels**: Mono (1 channel)
//! - **Framing**: base64 payloads over JSON text frames, no container header

pub mod buffer; // Per-session utterance accumulation
pub mod chunker; // Protocol frame sizing
pub mod codec; // μ-law companding and container conversion
pub mod frame; // Immutable audio frame value type
pub mod vad; // Speech/silence classification
