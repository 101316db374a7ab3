//! # Stream Buffer
//!
//! Accumulates inbound carrier audio for one session and decides when the
//! accumulated bytes constitute an utterance worth transcribing. The flush
//! decision is a heuristic classifier, not a hard guarantee, so every
//! threshold it consults comes from [`BufferingConfig`].
//!
//! ## Flush conditions (either is sufficient):
//! 1. Accumulated bytes reach the minimum-utterance threshold. This bounds
//!    latency when the caller talks continuously.
//! 2. Speech was observed and the stream has been silent longer than the
//!    silence threshold. This avoids cutting a caller off mid-pause.
//!
//! The silence threshold adapts: shorter right after the agent asked a
//! question, longer after a statement, and scaled down once the conversation
//! settles into a rhythm.
//!
//! ## Thread Safety:
//! Interior Mutex, same as the rest of the per-session state: the carrier
//! event handler appends while spawned pipeline tasks read and drain.

use crate::audio::frame::AudioFrame;
use crate::config::BufferingConfig;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

struct BufferState {
    frames: VecDeque<Vec<u8>>,
    total_bytes: usize,
    last_frame_at: Option<Instant>,
    speech_observed: bool,
    turn_count: u32,
    last_reply_was_question: Option<bool>,
}

/// Bounded per-session accumulation of inbound audio frames.
pub struct StreamBuffer {
    state: Mutex<BufferState>,
    config: BufferingConfig,
    sample_rate: u32,
}

impl StreamBuffer {
    pub fn new(config: BufferingConfig, sample_rate: u32) -> Self {
        Self {
            state: Mutex::new(BufferState {
                frames: VecDeque::with_capacity(config.max_buffer_frames),
                total_bytes: 0,
                last_frame_at: None,
                speech_observed: false,
                turn_count: 0,
                last_reply_was_question: None,
            }),
            config,
            sample_rate,
        }
    }

    /// Append an inbound frame, recording arrival time and the caller's
    /// speech signal. Oldest frames are evicted beyond the frame ceiling so
    /// a session that never flushes cannot grow without bound.
    pub fn add_frame(&self, frame: AudioFrame, speech_active: bool) {
        let mut state = self.lock();

        state.total_bytes += frame.len();
        state.frames.push_back(frame.into_bytes());
        state.last_frame_at = Some(Instant::now());
        if speech_active {
            state.speech_observed = true;
        }

        while state.frames.len() > self.config.max_buffer_frames {
            if let Some(evicted) = state.frames.pop_front() {
                state.total_bytes -= evicted.len();
                debug!("Evicted {} buffered bytes past frame ceiling", evicted.len());
            }
        }
    }

    /// Whether the accumulated audio should be handed off for transcription.
    pub fn should_flush(&self) -> bool {
        let state = self.lock();

        if state.frames.is_empty() {
            return false;
        }

        if state.total_bytes >= self.config.min_utterance_bytes {
            return true;
        }

        if state.speech_observed {
            if let Some(last) = state.last_frame_at {
                let threshold = Self::silence_threshold_for(
                    &self.config,
                    state.turn_count,
                    state.last_reply_was_question,
                );
                if last.elapsed() > threshold {
                    return true;
                }
            }
        }

        false
    }

    /// Concatenate and clear the buffered frames.
    ///
    /// Idempotent: draining an empty buffer returns empty bytes and changes
    /// nothing. The speech-observed flag resets with the drain, so the next
    /// utterance starts from scratch.
    pub fn drain(&self) -> Vec<u8> {
        let mut state = self.lock();
        if state.frames.is_empty() {
            return Vec::new();
        }

        let mut out = Vec::with_capacity(state.total_bytes);
        for frame in state.frames.drain(..) {
            out.extend_from_slice(&frame);
        }
        state.total_bytes = 0;
        state.speech_observed = false;
        out
    }

    /// Discard everything, including the adaptive-context counters. Used on
    /// session teardown.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.frames.clear();
        state.total_bytes = 0;
        state.speech_observed = false;
        state.last_frame_at = None;
    }

    /// Record that the agent delivered a reply, and whether it ended in a
    /// question. Drives the adaptive silence threshold.
    pub fn note_agent_reply(&self, ended_in_question: bool) {
        let mut state = self.lock();
        state.turn_count += 1;
        state.last_reply_was_question = Some(ended_in_question);
    }

    /// The silence duration currently required to end an utterance.
    pub fn silence_threshold(&self) -> Duration {
        let state = self.lock();
        Self::silence_threshold_for(&self.config, state.turn_count, state.last_reply_was_question)
    }

    fn silence_threshold_for(
        config: &BufferingConfig,
        turn_count: u32,
        last_reply_was_question: Option<bool>,
    ) -> Duration {
        // Callers answer questions promptly; statements invite longer pauses.
        let base_ms = match last_reply_was_question {
            Some(true) => config.question_silence_ms,
            Some(false) => config.statement_silence_ms,
            None => config.silence_threshold_ms,
        };

        let ms = if turn_count > config.late_turn_after {
            base_ms * config.late_turn_scale_pct / 100
        } else {
            base_ms
        };
        Duration::from_millis(ms)
    }

    pub fn total_bytes(&self) -> usize {
        self.lock().total_bytes
    }

    pub fn frame_count(&self) -> usize {
        self.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().frames.is_empty()
    }

    pub fn speech_observed(&self) -> bool {
        self.lock().speech_observed
    }

    /// Completed conversation turns (agent replies delivered).
    pub fn turn_count(&self) -> u32 {
        self.lock().turn_count
    }

    /// Duration of buffered audio at the carrier rate (1 byte per sample).
    pub fn buffered_duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.total_bytes() as f64 / self.sample_rate as f64)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BufferState> {
        // A poisoned buffer mutex means a panic mid-append; the frame data
        // is still structurally sound, so recover the guard.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    #[cfg(test)]
    fn backdate_last_frame(&self, age: Duration) {
        let mut state = self.lock();
        state.last_frame_at = Instant::now().checked_sub(age);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    fn carrier_frame(len: usize) -> AudioFrame {
        AudioFrame::carrier(vec![0xFF; len], 8000)
    }

    fn test_buffer() -> StreamBuffer {
        StreamBuffer::new(AppConfig::default().buffering, 8000)
    }

    #[test]
    fn test_empty_drain_is_idempotent() {
        let buffer = test_buffer();
        assert!(buffer.drain().is_empty());
        assert!(buffer.drain().is_empty());
        assert_eq!(buffer.total_bytes(), 0);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_drain_concatenates_in_arrival_order() {
        let buffer = test_buffer();
        buffer.add_frame(AudioFrame::carrier(vec![1, 2], 8000), false);
        buffer.add_frame(AudioFrame::carrier(vec![3], 8000), false);
        buffer.add_frame(AudioFrame::carrier(vec![4, 5], 8000), false);

        assert_eq!(buffer.drain(), vec![1, 2, 3, 4, 5]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_no_flush_below_half_second() {
        // 0.3 s of audio against a 0.5 s minimum: no flush until either more
        // audio arrives or observed speech goes silent long enough.
        let buffer = test_buffer();
        buffer.add_frame(carrier_frame(2400), true);
        assert!(!buffer.should_flush());

        // Crossing the byte threshold flushes
        buffer.add_frame(carrier_frame(1600), true);
        assert!(buffer.should_flush());
    }

    #[test]
    fn test_silence_flush_requires_observed_speech() {
        let buffer = test_buffer();
        buffer.add_frame(carrier_frame(2400), false);
        buffer.backdate_last_frame(Duration::from_secs(5));
        // Silence alone is not enough without speech
        assert!(!buffer.should_flush());

        let buffer = test_buffer();
        buffer.add_frame(carrier_frame(2400), true);
        buffer.backdate_last_frame(Duration::from_secs(5));
        assert!(buffer.should_flush());
    }

    #[test]
    fn test_silence_shorter_than_threshold_does_not_flush() {
        let buffer = test_buffer();
        buffer.add_frame(carrier_frame(2400), true);
        buffer.backdate_last_frame(Duration::from_millis(200));
        assert!(!buffer.should_flush());
    }

    #[test]
    fn test_frame_ceiling_evicts_oldest() {
        let config = AppConfig::default().buffering;
        let max = config.max_buffer_frames;
        let buffer = StreamBuffer::new(config, 8000);

        for i in 0..(max + 10) {
            buffer.add_frame(AudioFrame::carrier(vec![i as u8; 10], 8000), false);
        }

        assert_eq!(buffer.frame_count(), max);
        assert_eq!(buffer.total_bytes(), max * 10);
        // The oldest ten frames are gone; the drain starts at frame 10
        assert_eq!(buffer.drain()[0], 10);
    }

    #[test]
    fn test_adaptive_silence_threshold() {
        let buffer = test_buffer();
        assert_eq!(buffer.silence_threshold(), Duration::from_millis(1500));

        buffer.note_agent_reply(true);
        assert_eq!(buffer.silence_threshold(), Duration::from_millis(1200));

        buffer.note_agent_reply(false);
        assert_eq!(buffer.silence_threshold(), Duration::from_millis(1800));

        // Past the late-turn point the threshold scales down
        buffer.note_agent_reply(false);
        buffer.note_agent_reply(false);
        assert_eq!(
            buffer.silence_threshold(),
            Duration::from_millis(1800 * 80 / 100)
        );
    }

    #[test]
    fn test_buffered_duration() {
        let buffer = test_buffer();
        buffer.add_frame(carrier_frame(4000), false);
        assert_eq!(buffer.buffered_duration(), Duration::from_millis(500));
    }

    #[test]
    fn test_drain_resets_speech_observed() {
        let buffer = test_buffer();
        buffer.add_frame(carrier_frame(100), true);
        assert!(buffer.speech_observed());
        buffer.drain();
        assert!(!buffer.speech_observed());
    }
}
