//! # Audio Frame
//!
//! The immutable unit of audio handed between pipeline stages. A frame is
//! produced by one component, consumed by the next, and discarded; nothing
//! in the pipeline shares a mutable frame.

use serde::Serialize;
use std::time::Duration;

/// Sample encoding of an audio frame's byte buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FrameEncoding {
    /// 16-bit signed little-endian linear PCM
    Linear16,
    /// 8-bit logarithmically companded samples (G.711 μ-law)
    Mulaw8,
}

impl FrameEncoding {
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            FrameEncoding::Linear16 => 2,
            FrameEncoding::Mulaw8 => 1,
        }
    }
}

/// Immutable byte buffer plus the metadata needed to interpret it.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    bytes: Vec<u8>,
    sample_rate: u32,
    channels: u16,
    encoding: FrameEncoding,
}

impl AudioFrame {
    pub fn new(bytes: Vec<u8>, sample_rate: u32, channels: u16, encoding: FrameEncoding) -> Self {
        Self {
            bytes,
            sample_rate,
            channels,
            encoding,
        }
    }

    /// Convenience constructor for the carrier's native format: 8 kHz mono μ-law.
    pub fn carrier(bytes: Vec<u8>, sample_rate: u32) -> Self {
        Self::new(bytes, sample_rate, 1, FrameEncoding::Mulaw8)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn encoding(&self) -> FrameEncoding {
        self.encoding
    }

    /// Wall-clock duration this frame represents when played back.
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 || self.channels == 0 {
            return Duration::ZERO;
        }
        let samples_per_channel =
            self.bytes.len() / self.encoding.bytes_per_sample() / self.channels as usize;
        Duration::from_secs_f64(samples_per_channel as f64 / self.sample_rate as f64)
    }
}
