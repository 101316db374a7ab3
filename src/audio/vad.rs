//! # Voice Activity Detection
//!
//! Classifies short sub-frames of linear PCM as speech or silence and applies
//! hysteresis so single-frame blips in either direction do not flip the
//! decision: N consecutive speech sub-frames confirm speech start, M
//! consecutive silence sub-frames confirm speech end.
//!
//! The classifier is RMS amplitude against a configured threshold. It sits
//! behind this one type so a dedicated VAD algorithm can replace it without
//! touching the stream buffer.

use crate::config::BufferingConfig;
use tracing::debug;

/// Outcome of feeding audio through the detector.
#[derive(Debug, Clone, Copy, Default)]
pub struct VadDecision {
    /// Confirmed speech is currently in progress
    pub speech_active: bool,
    /// A confirmed speech-to-silence transition happened during this call
    pub speech_ended: bool,
}

/// Sub-frame speech classifier with hysteresis counters.
///
/// Carries partial sub-frames between calls, so inbound frames of any size
/// (carrier frames rarely align with the classification sub-frame) are
/// classified over exact sub-frame windows.
pub struct VadProcessor {
    subframe_samples: usize,
    rms_threshold: f64,
    speech_confirm: u32,
    silence_confirm: u32,

    pending: Vec<i16>,
    consecutive_speech: u32,
    consecutive_silence: u32,
    in_speech: bool,
}

impl VadProcessor {
    pub fn new(config: &BufferingConfig, sample_rate: u32) -> Self {
        let subframe_samples =
            ((sample_rate as u64 * config.vad_subframe_ms / 1000) as usize).max(1);
        Self {
            subframe_samples,
            rms_threshold: config.silence_rms_threshold,
            speech_confirm: config.vad_speech_frames.max(1),
            silence_confirm: config.vad_silence_frames.max(1),
            pending: Vec::new(),
            consecutive_speech: 0,
            consecutive_silence: 0,
            in_speech: false,
        }
    }

    /// Feed decoded linear samples through the detector.
    pub fn process(&mut self, samples: &[i16]) -> VadDecision {
        self.pending.extend_from_slice(samples);

        let mut speech_ended = false;
        while self.pending.len() >= self.subframe_samples {
            let subframe: Vec<i16> = self.pending.drain(..self.subframe_samples).collect();
            if self.classify_subframe(&subframe) {
                speech_ended = true;
            }
        }

        VadDecision {
            speech_active: self.in_speech,
            speech_ended,
        }
    }

    /// Classify one exact sub-frame; returns true when this sub-frame
    /// confirmed the end of a speech run.
    fn classify_subframe(&mut self, subframe: &[i16]) -> bool {
        let is_speech = rms(subframe) > self.rms_threshold;

        if is_speech {
            self.consecutive_speech += 1;
            self.consecutive_silence = 0;

            if !self.in_speech && self.consecutive_speech >= self.speech_confirm {
                self.in_speech = true;
                debug!(
                    "Speech confirmed after {} sub-frames",
                    self.consecutive_speech
                );
            }
            false
        } else {
            self.consecutive_silence += 1;
            self.consecutive_speech = 0;

            if self.in_speech && self.consecutive_silence >= self.silence_confirm {
                self.in_speech = false;
                debug!(
                    "Speech ended after {} silent sub-frames",
                    self.consecutive_silence
                );
                true
            } else {
                false
            }
        }
    }

    /// Whether confirmed speech is currently in progress.
    pub fn speech_active(&self) -> bool {
        self.in_speech
    }

    /// Reset between utterances. Discards partial sub-frames and counters so
    /// the trailing edge of one utterance cannot bleed into the next.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.consecutive_speech = 0;
        self.consecutive_silence = 0;
        self.in_speech = false;
    }
}

/// Root-mean-square amplitude on the 16-bit linear scale.
pub fn rms(samples: &[i16]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum_squares / samples.len() as f64).sqrt()
}
