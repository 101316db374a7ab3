//! # Stream Session
//!
//! Owned per-call state. Exactly one media relay owns a session: created
//! when the carrier sends `start`, destroyed on `closed` or transport error.
//! Everything a call needs (state machine, inbound buffer, VAD, timestamps)
//! lives here, so no two calls can interfere through shared globals.

use crate::audio::buffer::StreamBuffer;
use crate::audio::vad::VadProcessor;
use crate::config::AppConfig;
use crate::session::state_machine::CallStateMachine;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::task::AbortHandle;
use uuid::Uuid;

/// Mutable state for one active call.
///
/// ## Thread Safety:
/// Shared as `Arc<StreamSession>` between the websocket actor and spawned
/// pipeline tasks; each field carries its own interior lock so the inbound
/// path never blocks on the outbound path.
pub struct StreamSession {
    /// Internal unique identifier for this session
    pub session_id: String,

    /// Carrier media stream identifier (echoed in outbound media events)
    pub stream_sid: String,

    /// Carrier call identifier
    pub call_sid: String,

    pub created_at: DateTime<Utc>,

    /// Validated lifecycle state plus the diagnostics trace
    pub state: CallStateMachine,

    /// Inbound utterance accumulation
    pub buffer: StreamBuffer,

    /// Speech/silence classifier for the inbound stream
    vad: Mutex<VadProcessor>,

    last_activity: RwLock<DateTime<Utc>>,

    /// When the agent last delivered a reply; drives response rate limiting
    last_reply_at: Mutex<Option<Instant>>,

    /// Set once the greeting has been delivered (or delivery has begun).
    /// Lets the first media frame trigger a deferred greeting when the
    /// start-time delivery could not run.
    greeting_sent: AtomicBool,

    /// In-flight outbound delivery task, aborted on close
    outbound_task: Mutex<Option<AbortHandle>>,
}

impl StreamSession {
    pub fn new(stream_sid: &str, call_sid: &str, config: &AppConfig) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            stream_sid: stream_sid.to_string(),
            call_sid: call_sid.to_string(),
            created_at: Utc::now(),
            state: CallStateMachine::new(call_sid, stream_sid),
            buffer: StreamBuffer::new(config.buffering.clone(), config.audio.sample_rate),
            vad: Mutex::new(VadProcessor::new(&config.buffering, config.audio.sample_rate)),
            last_activity: RwLock::new(Utc::now()),
            last_reply_at: Mutex::new(None),
            greeting_sent: AtomicBool::new(false),
            outbound_task: Mutex::new(None),
        }
    }

    /// Run the VAD over a decoded inbound frame, returning whether confirmed
    /// speech is active.
    pub fn classify_speech(&self, samples: &[i16]) -> bool {
        self.vad.lock().unwrap().process(samples).speech_active
    }

    /// Reset the VAD between utterances.
    pub fn reset_vad(&self) {
        self.vad.lock().unwrap().reset();
    }

    pub fn touch(&self) {
        *self.last_activity.write().unwrap() = Utc::now();
    }

    pub fn idle_seconds(&self) -> i64 {
        (Utc::now() - *self.last_activity.read().unwrap()).num_seconds()
    }

    /// Atomically claim greeting delivery. Returns true exactly once unless
    /// the claim is released after a failed delivery.
    pub fn claim_greeting(&self) -> bool {
        !self.greeting_sent.swap(true, Ordering::SeqCst)
    }

    /// Release a greeting claim after delivery failed, so the first media
    /// frame can trigger another attempt.
    pub fn release_greeting_claim(&self) {
        self.greeting_sent.store(false, Ordering::SeqCst);
    }

    pub fn greeting_sent(&self) -> bool {
        self.greeting_sent.load(Ordering::SeqCst)
    }

    /// Whether enough time has passed since the last reply to send another.
    pub fn reply_allowed(&self, min_gap: Duration) -> bool {
        match *self.last_reply_at.lock().unwrap() {
            Some(last) => last.elapsed() >= min_gap,
            None => true,
        }
    }

    pub fn mark_reply_sent(&self) {
        *self.last_reply_at.lock().unwrap() = Some(Instant::now());
    }

    /// Track the in-flight outbound delivery task. A previous unfinished
    /// task is aborted first: one utterance's frames must never interleave
    /// with another's.
    pub fn set_outbound_task(&self, handle: AbortHandle) {
        let mut slot = self.outbound_task.lock().unwrap();
        if let Some(previous) = slot.take() {
            if !previous.is_finished() {
                previous.abort();
            }
        }
        *slot = Some(handle);
    }

    /// Abort any in-flight outbound delivery. Called on close.
    pub fn abort_outbound(&self) {
        if let Some(task) = self.outbound_task.lock().unwrap().take() {
            task.abort();
        }
    }

    /// Summary row for the diagnostics endpoints.
    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "session_id": self.session_id,
            "stream_sid": self.stream_sid,
            "call_sid": self.call_sid,
            "state": self.state.state().as_str(),
            "created_at": self.created_at.to_rfc3339(),
            "idle_seconds": self.idle_seconds(),
            "buffered_bytes": self.buffer.total_bytes(),
            "buffered_frames": self.buffer.frame_count(),
            "speech_observed": self.buffer.speech_observed(),
            "error_count": self.state.error_count(),
        })
    }
}
