//! # Frame Chunker
//!
//! Reshapes a byte stream into the fixed-duration frames the carrier
//! transport mandates. The frame size is derived from configuration because
//! different carriers mandate different per-frame durations (20 ms is common
//! on some transports; the default operating point here is 160 ms, which
//! trades a little latency for much lower per-frame overhead).
//!
//! The final partial frame is emitted short rather than dropped or padded.
//! Dropping truncates the tail of an utterance, and padding injects silence
//! the receiver plays back.

use std::time::Duration;

/// Splits byte buffers into protocol-correct frames.
///
/// Standard operating point: 160 ms at 8 kHz with 1-byte μ-law samples
/// gives 1,280-byte frames.
#[derive(Debug, Clone)]
pub struct FrameChunker {
    frame_size: usize,
    frame_duration: Duration,
}

impl FrameChunker {
    /// ## Parameters:
    /// - **sample_rate**: samples per second of the stream being framed
    /// - **frame_duration_ms**: target duration of each frame
    /// - **bytes_per_sample**: 1 for μ-law, 2 for linear16
    ///
    /// Frame size = `sample_rate * frame_duration_ms / 1000 * bytes_per_sample`,
    /// rounded down. A frame size of zero (degenerate configuration) is
    /// clamped to one byte so chunking always terminates.
    pub fn new(sample_rate: u32, frame_duration_ms: u64, bytes_per_sample: usize) -> Self {
        let frame_size =
            (sample_rate as u64 * frame_duration_ms / 1000) as usize * bytes_per_sample;
        Self {
            frame_size: frame_size.max(1),
            frame_duration: Duration::from_millis(frame_duration_ms),
        }
    }

    /// Bytes in one full frame.
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Real-time duration of one full frame; the pacing interval for
    /// outbound delivery.
    pub fn frame_duration(&self) -> Duration {
        self.frame_duration
    }

    /// Split `bytes` into frames of `frame_size()`, the last possibly short.
    ///
    /// Lazy and finite: yields `ceil(len / frame_size)` borrowed slices whose
    /// concatenation reproduces the input exactly. Empty input yields no
    /// frames.
    pub fn chunk<'a>(&self, bytes: &'a [u8]) -> impl Iterator<Item = &'a [u8]> {
        bytes.chunks(self.frame_size)
    }

    /// How many frames `chunk` will yield for an input of `len` bytes.
    pub fn frame_count(&self, len: usize) -> usize {
        len.div_ceil(self.frame_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec;

    #[test]
    fn test_standard_operating_point() {
        let chunker = FrameChunker::new(8000, 160, 1);
        assert_eq!(chunker.frame_size(), 1280);
        assert_eq!(chunker.frame_duration(), Duration::from_millis(160));
    }

    #[test]
    fn test_20ms_carrier_frames() {
        let chunker = FrameChunker::new(8000, 20, 1);
        assert_eq!(chunker.frame_size(), 160);
    }

    #[test]
    fn test_chunk_invariant() {
        // ceil(L/F) frames, all full except possibly the last, and the
        // concatenation reproduces the input exactly.
        let chunker = FrameChunker::new(8000, 160, 1);
        for len in [0usize, 1, 1279, 1280, 1281, 2560, 9000] {
            let bytes: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let frames: Vec<&[u8]> = chunker.chunk(&bytes).collect();

            assert_eq!(frames.len(), len.div_ceil(1280), "len {}", len);
            assert_eq!(frames.len(), chunker.frame_count(len));
            for frame in frames.iter().take(frames.len().saturating_sub(1)) {
                assert_eq!(frame.len(), 1280);
            }

            let rejoined: Vec<u8> = frames.concat();
            assert_eq!(rejoined, bytes);
        }
    }

    #[test]
    fn test_one_second_tone_yields_seven_frames() {
        // 1 s of 440 Hz at 8 kHz encodes to 8,000 μ-law bytes; at 160 ms
        // frames that is 6 full frames of 1,280 bytes plus a 320-byte tail
        // (6 * 1280 + 320 = 8000).
        let tone: Vec<i16> = (0..8000)
            .map(|i| {
                let t = i as f64 / 8000.0;
                (8000.0 * (2.0 * std::f64::consts::PI * 440.0 * t).sin()) as i16
            })
            .collect();
        let encoded = codec::encode_mulaw(&tone);
        assert_eq!(encoded.len(), 8000);

        let chunker = FrameChunker::new(8000, 160, 1);
        let frames: Vec<&[u8]> = chunker.chunk(&encoded).collect();

        assert_eq!(frames.len(), 7);
        for frame in &frames[..6] {
            assert_eq!(frame.len(), 1280);
        }
        assert_eq!(frames[6].len(), 320);
    }

    #[test]
    fn test_empty_input_yields_no_frames() {
        let chunker = FrameChunker::new(8000, 160, 1);
        assert_eq!(chunker.chunk(&[]).count(), 0);
        assert_eq!(chunker.frame_count(0), 0);
    }

    #[test]
    fn test_degenerate_config_clamps_frame_size() {
        let chunker = FrameChunker::new(8000, 0, 1);
        assert_eq!(chunker.frame_size(), 1);
    }
}
