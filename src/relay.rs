//! # Media Relay
//!
//! The orchestrator. One relay owns one [`StreamSession`] end-to-end: it is
//! driven by carrier transport events, feeds inbound audio through the
//! stream buffer, hands flushed utterances to the speech-service
//! collaborators, and delivers synthesized replies back to the carrier at
//! real-time cadence.
//!
//! ## Pacing:
//! Outbound frames are sent with a `frame_duration` sleep between sends. A
//! 160 ms frame sent faster than 160 ms after the previous one overruns the
//! receiver's jitter buffer and is audible as speed distortion; slower, and
//! the caller hears gaps.
//!
//! ## Cancellation:
//! The call state machine is consulted before every single chunk send, and
//! the delivery task's abort handle is stored on the session. The transport
//! calls [`MediaRelay::signal_close`] the moment it parses a close, ahead of
//! any queued events, so an in-flight delivery is aborted and the next state
//! check short-circuits even while the event queue is busy. No frame is sent
//! after the session observes DISCONNECTED.

use crate::audio::chunker::FrameChunker;
use crate::audio::codec;
use crate::audio::frame::AudioFrame;
use crate::collaborators::cache::SynthesisCache;
use crate::collaborators::{call_with_retry, Collaborators, ConversationContext};
use crate::config::AppConfig;
use crate::error::{RelayError, RelayResult};
use crate::session::registry::SessionRegistry;
use crate::session::session::StreamSession;
use crate::session::state_machine::CallState;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Where outbound media payloads go. The websocket actor implements this
/// over the carrier connection; tests implement it over a Vec.
#[async_trait]
pub trait MediaSink: Send + Sync {
    /// Send one base64 μ-law payload for the given stream.
    async fn send_media(&self, stream_sid: &str, payload_b64: String) -> RelayResult<()>;
}

/// Orchestrates one duplex call session.
pub struct MediaRelay {
    config: AppConfig,
    registry: Arc<SessionRegistry>,
    collaborators: Collaborators,
    cache: Arc<SynthesisCache>,
    sink: Arc<dyn MediaSink>,
    session: RwLock<Option<Arc<StreamSession>>>,
}

impl MediaRelay {
    pub fn new(
        config: AppConfig,
        registry: Arc<SessionRegistry>,
        collaborators: Collaborators,
        cache: Arc<SynthesisCache>,
        sink: Arc<dyn MediaSink>,
    ) -> Self {
        Self {
            config,
            registry,
            collaborators,
            cache,
            sink,
            session: RwLock::new(None),
        }
    }

    pub fn session(&self) -> Option<Arc<StreamSession>> {
        self.session.read().unwrap().clone()
    }

    /// Carrier `connected` event: purely informational, no session yet.
    pub fn on_connected(&self) {
        info!("Carrier transport connected");
    }

    /// Carrier `start` event: create and register the session, then greet
    /// the caller.
    pub async fn on_start(&self, stream_sid: &str, call_sid: &str) -> RelayResult<()> {
        let session = Arc::new(StreamSession::new(stream_sid, call_sid, &self.config));
        self.registry.register(session.clone())?;
        *self.session.write().unwrap() = Some(session.clone());

        info!(
            "Call {} started on stream {} (session {})",
            call_sid, stream_sid, session.session_id
        );

        session
            .state
            .transition(CallState::Greeting, "start event received");

        for observer in &self.collaborators.observers {
            observer.on_session_start(call_sid);
        }

        if session.claim_greeting() {
            match self
                .speak(&session, &self.config.collaborators.greeting_text, GREETING_STATES)
                .await
            {
                Ok(()) => {
                    session.state.log_event("greeting_delivered", serde_json::json!({}));
                    session
                        .state
                        .transition(CallState::Listening, "greeting delivered");
                }
                Err(err) => {
                    // Carrier may not be ready for outbound media this early;
                    // the first media frame retries.
                    warn!("Greeting delivery failed, deferring to first media frame: {}", err);
                    session.release_greeting_claim();
                }
            }
        }
        Ok(())
    }

    /// Carrier `media` event: one base64 μ-law frame.
    pub async fn on_media(&self, payload_b64: &str) {
        let Some(session) = self.session() else {
            warn!("Media frame received before start event, dropping");
            return;
        };
        session.touch();

        if session.claim_greeting() {
            self.deliver_deferred_greeting(&session).await;
        }

        let mulaw = match BASE64.decode(payload_b64) {
            Ok(bytes) => bytes,
            Err(err) => {
                // Malformed payload: drop the frame, never the session
                warn!("Undecodable media payload, dropping frame: {}", err);
                session.state.record_error("malformed_payload", &err.to_string());
                return;
            }
        };
        if mulaw.is_empty() {
            return;
        }

        let samples = codec::decode_mulaw(&mulaw);
        let speech_active = session.classify_speech(&samples);
        session.buffer.add_frame(
            AudioFrame::carrier(mulaw, self.config.audio.sample_rate),
            speech_active,
        );

        if session.buffer.should_flush() {
            self.process_utterance(&session).await;
        }
    }

    /// Synchronous close signal from the transport.
    ///
    /// Called the moment a close is parsed off the socket, before the event
    /// reaches the queue, so a hangup preempts an in-flight paced delivery:
    /// the outbound task is aborted and the state machine leaves the
    /// sendable states immediately. Full teardown (registry removal,
    /// observer notification) still happens in [`MediaRelay::on_closed`].
    pub fn signal_close(&self) {
        let Some(session) = self.session() else {
            return;
        };

        session.abort_outbound();
        match session.state.state() {
            CallState::Disconnecting | CallState::Disconnected => {}
            CallState::Listening | CallState::Speaking => {
                session
                    .state
                    .transition(CallState::Disconnecting, "carrier signaled close");
            }
            _ => {
                session
                    .state
                    .transition(CallState::Disconnected, "carrier signaled close");
            }
        }
    }

    /// Carrier `closed` event: tear the session down.
    pub fn on_closed(&self) {
        let Some(session) = self.session.write().unwrap().take() else {
            debug!("Closed event with no active session");
            return;
        };

        self.registry.remove(&session.stream_sid);
        self.teardown(&session, "closed event received");

        let trace = session.state.trace_summary();
        for observer in &self.collaborators.observers {
            observer.on_session_end(&session.call_sid, &trace);
        }
        info!("Call {} closed", session.call_sid);
    }

    /// Unexpected transport or pipeline fault: mark the session errored and
    /// drain it to DISCONNECTED. Other sessions are unaffected.
    pub fn on_transport_error(&self, message: &str) {
        let Some(session) = self.session.write().unwrap().take() else {
            return;
        };

        error!("Transport error on call {}: {}", session.call_sid, message);
        self.registry.remove(&session.stream_sid);
        session.state.record_error("transport_error", message);
        session.state.transition(CallState::Error, message);
        self.teardown(&session, "transport error");

        let trace = session.state.trace_summary();
        for observer in &self.collaborators.observers {
            observer.on_session_end(&session.call_sid, &trace);
        }
    }

    /// Abort outbound delivery and drive the state machine to DISCONNECTED
    /// through whatever legal path applies from the current state.
    fn teardown(&self, session: &Arc<StreamSession>, reason: &str) {
        session.abort_outbound();

        match session.state.state() {
            CallState::Disconnected => {}
            CallState::Listening | CallState::Speaking => {
                session.state.transition(CallState::Disconnecting, reason);
                session.state.transition(CallState::Disconnected, reason);
            }
            _ => {
                session.state.transition(CallState::Disconnected, reason);
            }
        }

        session.buffer.clear();
    }

    async fn deliver_deferred_greeting(&self, session: &Arc<StreamSession>) {
        info!("Delivering deferred greeting on first media frame");
        if let Err(err) = self
            .speak(session, &self.config.collaborators.greeting_text, GREETING_STATES)
            .await
        {
            warn!("Deferred greeting delivery failed: {}", err);
        }
        // Proceed to listening either way; a silent greeting must not wedge
        // the call in GREETING.
        if session.state.state() == CallState::Greeting {
            session
                .state
                .transition(CallState::Listening, "greeting phase complete");
        }
    }

    /// Drain the buffered utterance and run it through transcription, reply
    /// generation, and synthesis. Every failure path lands back in LISTENING.
    async fn process_utterance(&self, session: &Arc<StreamSession>) {
        let mulaw = session.buffer.drain();
        session.reset_vad();
        if mulaw.is_empty() {
            return;
        }

        session
            .state
            .record_metric("utterance_bytes", mulaw.len() as f64);
        debug!("Flushing {} byte utterance for transcription", mulaw.len());

        let linear = codec::samples_to_pcm_bytes(&codec::decode_mulaw(&mulaw));
        let sample_rate = self.config.audio.sample_rate;
        let timeout = Duration::from_millis(self.config.collaborators.timeout_ms);

        let transcriber = self.collaborators.transcriber.clone();
        let transcript = match call_with_retry("transcription", timeout, || {
            transcriber.transcribe(&linear, sample_rate)
        })
        .await
        {
            Ok(text) => text,
            Err(err) => {
                // The utterance goes untranscribed; the caller will repeat
                warn!("Transcription failed, skipping utterance: {}", err);
                session
                    .state
                    .record_error("transcription_failed", &err.to_string());
                return;
            }
        };

        if transcript.is_empty() {
            debug!("Empty transcript, staying in listening");
            return;
        }
        info!("Caller said: '{}'", transcript);
        session.state.log_event(
            "transcription",
            serde_json::json!({ "text": transcript, "bytes": mulaw.len() }),
        );

        let min_gap = Duration::from_millis(self.config.collaborators.min_reply_gap_ms);
        if !session.reply_allowed(min_gap) {
            debug!("Reply rate limit active, skipping turn");
            session
                .state
                .log_event("reply_rate_limited", serde_json::json!({}));
            return;
        }

        if !session
            .state
            .transition(CallState::Processing, "transcript received")
        {
            return;
        }

        let context = ConversationContext {
            call_sid: session.call_sid.clone(),
            turn_count: session.buffer.turn_count(),
        };
        let reply_generator = self.collaborators.reply_generator.clone();
        let reply = match call_with_retry("reply", timeout, || {
            reply_generator.generate_reply(&transcript, &context)
        })
        .await
        {
            Ok(text) if !text.is_empty() => text,
            Ok(_) => {
                session
                    .state
                    .transition(CallState::Listening, "empty reply, turn skipped");
                return;
            }
            Err(err) => {
                warn!("Reply generation failed, skipping turn: {}", err);
                session.state.record_error("reply_failed", &err.to_string());
                session
                    .state
                    .transition(CallState::Listening, "reply generation failed");
                return;
            }
        };

        if !session.state.transition(CallState::Speaking, "reply ready") {
            return;
        }

        match self.speak(session, &reply, SPEAKING_STATES).await {
            Ok(()) => {
                session.mark_reply_sent();
                session
                    .buffer
                    .note_agent_reply(reply.trim_end().ends_with('?'));
                session
                    .state
                    .log_event("reply_delivered", serde_json::json!({ "text": reply }));
            }
            Err(err) => {
                warn!("Reply delivery failed: {}", err);
                session.state.record_error("reply_delivery_failed", &err.to_string());
                if matches!(err, RelayError::TransportClosed(_)) {
                    // The caller is gone; nobody is listening for an apology
                    return;
                }
                // The caller must hear something rather than dead air
                let apology = self.config.collaborators.apology_text.clone();
                if let Err(err) = self.speak(session, &apology, SPEAKING_STATES).await {
                    warn!("Apology delivery also failed: {}", err);
                }
            }
        }

        session
            .state
            .transition(CallState::Listening, "reply phase complete");
    }

    /// Synthesize `text` (or take it from the cache), convert it to the
    /// carrier format, and deliver it paced.
    async fn speak(
        &self,
        session: &Arc<StreamSession>,
        text: &str,
        allowed_states: &'static [CallState],
    ) -> RelayResult<()> {
        let timeout = Duration::from_millis(self.config.collaborators.timeout_ms);

        let container = match self.cache.get(text) {
            Some(cached) => cached,
            None => {
                let synthesizer = self.collaborators.synthesizer.clone();
                let audio =
                    call_with_retry("synthesis", timeout, || synthesizer.synthesize(text)).await?;
                self.cache.store(text, audio)
            }
        };

        let (samples, source_rate, channels) = codec::extract_pcm(&container)?;
        let mono = codec::downmix(&samples, channels);
        let carrier_rate = self.config.audio.sample_rate;
        let resampled = codec::resample(&mono, source_rate, carrier_rate);
        let mulaw = codec::encode_mulaw(&resampled);

        let chunker = FrameChunker::new(
            carrier_rate,
            self.config.audio.frame_duration_ms,
            self.config.audio.bytes_per_sample,
        );

        // Delivery runs as its own task so close can abort it mid-flight
        let task = tokio::spawn(deliver_paced(
            session.clone(),
            self.sink.clone(),
            mulaw,
            chunker,
            allowed_states,
        ));
        session.set_outbound_task(task.abort_handle());

        match task.await {
            Ok(result) => result,
            Err(join_err) if join_err.is_cancelled() => Err(RelayError::TransportClosed(
                "outbound delivery aborted".to_string(),
            )),
            Err(join_err) => Err(RelayError::Internal(format!(
                "outbound delivery task failed: {}",
                join_err
            ))),
        }
    }
}

/// States in which greeting frames may be sent.
const GREETING_STATES: &[CallState] = &[CallState::Greeting, CallState::Listening];

/// States in which reply frames may be sent.
const SPEAKING_STATES: &[CallState] = &[CallState::Speaking];

/// Send each frame at its real-time cadence, re-checking session state
/// before every send.
async fn deliver_paced(
    session: Arc<StreamSession>,
    sink: Arc<dyn MediaSink>,
    mulaw: Vec<u8>,
    chunker: FrameChunker,
    allowed_states: &'static [CallState],
) -> RelayResult<()> {
    let frame_duration = chunker.frame_duration();
    let total = chunker.frame_count(mulaw.len());
    let mut sent = 0usize;

    for chunk in chunker.chunk(&mulaw) {
        if !session.state.check_state(allowed_states, "send_media") {
            session
                .state
                .record_metric("frames_abandoned", (total - sent) as f64);
            return Err(RelayError::TransportClosed(format!(
                "delivery abandoned after {} of {} frames",
                sent, total
            )));
        }

        let payload = BASE64.encode(chunk);
        sink.send_media(&session.stream_sid, payload).await?;
        sent += 1;

        tokio::time::sleep(frame_duration).await;
    }

    session.state.record_metric("frames_sent", sent as f64);
    debug!("Delivered {} paced frames", sent);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{ReplyGenerator, SessionObserver, Synthesizer, Transcriber};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct MockSink {
        sends: Mutex<Vec<(String, String)>>,
    }

    impl MockSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sends: Mutex::new(Vec::new()),
            })
        }

        fn count(&self) -> usize {
            self.sends.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl MediaSink for MockSink {
        async fn send_media(&self, stream_sid: &str, payload_b64: String) -> RelayResult<()> {
            self.sends
                .lock()
                .unwrap()
                .push((stream_sid.to_string(), payload_b64));
            Ok(())
        }
    }

    struct MockTranscriber {
        text: String,
    }

    #[async_trait]
    impl Transcriber for MockTranscriber {
        async fn transcribe(&self, _audio: &[u8], _sample_rate: u32) -> RelayResult<String> {
            Ok(self.text.clone())
        }
    }

    struct MockReplyGenerator {
        reply: String,
    }

    #[async_trait]
    impl ReplyGenerator for MockReplyGenerator {
        async fn generate_reply(
            &self,
            _text: &str,
            _context: &ConversationContext,
        ) -> RelayResult<String> {
            Ok(self.reply.clone())
        }
    }

    struct MockSynthesizer {
        /// Container audio returned for every utterance
        wav: Vec<u8>,
        calls: AtomicUsize,
        fail: bool,
    }

    impl MockSynthesizer {
        fn with_duration_ms(ms: usize) -> Self {
            let samples: Vec<i16> = (0..(8 * ms)).map(|i| ((i % 100) as i16 - 50) * 100).collect();
            Self {
                wav: codec::wrap_pcm(&samples, 8000, 1),
                calls: AtomicUsize::new(0),
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                wav: Vec::new(),
                calls: AtomicUsize::new(0),
                fail: true,
            }
        }
    }

    #[async_trait]
    impl Synthesizer for MockSynthesizer {
        async fn synthesize(&self, _text: &str) -> RelayResult<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(RelayError::CollaboratorFailure {
                    service: "synthesis",
                    message: "mock failure".to_string(),
                })
            } else {
                Ok(self.wav.clone())
            }
        }
    }

    struct CountingObserver {
        starts: AtomicUsize,
        ends: AtomicUsize,
    }

    impl SessionObserver for CountingObserver {
        fn on_session_start(&self, _call_id: &str) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }
        fn on_session_end(&self, _call_id: &str, _trace: &serde_json::Value) {
            self.ends.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn fast_config() -> AppConfig {
        let mut config = AppConfig::default();
        // Short frames keep paced delivery fast under test
        config.audio.frame_duration_ms = 5;
        config.collaborators.min_reply_gap_ms = 0;
        config.collaborators.timeout_ms = 1000;
        config
    }

    struct Harness {
        relay: MediaRelay,
        sink: Arc<MockSink>,
        synthesizer: Arc<MockSynthesizer>,
        observer: Arc<CountingObserver>,
    }

    fn harness(config: AppConfig, synthesizer: MockSynthesizer) -> Harness {
        let sink = MockSink::new();
        let synthesizer = Arc::new(synthesizer);
        let observer = Arc::new(CountingObserver {
            starts: AtomicUsize::new(0),
            ends: AtomicUsize::new(0),
        });
        let collaborators = Collaborators {
            transcriber: Arc::new(MockTranscriber {
                text: "what are your hours".to_string(),
            }),
            reply_generator: Arc::new(MockReplyGenerator {
                reply: "We are open nine to five.".to_string(),
            }),
            synthesizer: synthesizer.clone(),
            observers: vec![observer.clone()],
        };
        let relay = MediaRelay::new(
            config,
            Arc::new(SessionRegistry::new(10)),
            collaborators,
            Arc::new(SynthesisCache::new()),
            sink.clone(),
        );
        Harness {
            relay,
            sink,
            synthesizer,
            observer,
        }
    }

    /// A loud inbound frame: 200 ms of alternating ±5000 encoded as μ-law.
    fn loud_frame_b64() -> String {
        let samples: Vec<i16> = (0..1600)
            .map(|i| if i % 2 == 0 { 5000 } else { -5000 })
            .collect();
        BASE64.encode(codec::encode_mulaw(&samples))
    }

    #[tokio::test]
    async fn test_start_greets_and_listens() {
        let h = harness(fast_config(), MockSynthesizer::with_duration_ms(100));
        h.relay.on_start("MZ1", "CA1").await.unwrap();

        let session = h.relay.session().unwrap();
        assert_eq!(session.state.state(), CallState::Listening);
        assert!(session.greeting_sent());
        assert!(h.sink.count() > 0);
        assert_eq!(h.observer.starts.load(Ordering::SeqCst), 1);

        // Every sent payload is valid base64 μ-law for the right stream
        for (stream_sid, payload) in h.sink.sends.lock().unwrap().iter() {
            assert_eq!(stream_sid, "MZ1");
            assert!(BASE64.decode(payload).is_ok());
        }
    }

    #[tokio::test]
    async fn test_media_flush_produces_reply() {
        let h = harness(fast_config(), MockSynthesizer::with_duration_ms(100));
        h.relay.on_start("MZ1", "CA1").await.unwrap();
        let greeting_frames = h.sink.count();

        // Three 1600-byte loud frames cross the 4000-byte utterance minimum
        for _ in 0..3 {
            h.relay.on_media(&loud_frame_b64()).await;
        }

        let session = h.relay.session().unwrap();
        assert_eq!(session.state.state(), CallState::Listening);
        assert!(session.buffer.is_empty(), "utterance should have drained");
        assert!(h.sink.count() > greeting_frames, "reply frames were sent");
        assert_eq!(session.buffer.turn_count(), 1);
    }

    #[tokio::test]
    async fn test_closed_removes_session_and_notifies() {
        let h = harness(fast_config(), MockSynthesizer::with_duration_ms(50));
        h.relay.on_start("MZ1", "CA1").await.unwrap();
        let session = h.relay.session().unwrap();

        h.relay.on_closed();

        assert_eq!(session.state.state(), CallState::Disconnected);
        assert!(h.relay.session().is_none());
        assert_eq!(h.observer.ends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_media_before_start_is_dropped() {
        let h = harness(fast_config(), MockSynthesizer::with_duration_ms(50));
        h.relay.on_media(&loud_frame_b64()).await;
        assert_eq!(h.sink.count(), 0);
    }

    #[tokio::test]
    async fn test_malformed_payload_drops_frame_not_session() {
        let h = harness(fast_config(), MockSynthesizer::with_duration_ms(50));
        h.relay.on_start("MZ1", "CA1").await.unwrap();

        h.relay.on_media("not-valid-base64!!!").await;

        let session = h.relay.session().unwrap();
        assert_eq!(session.state.state(), CallState::Listening);
        assert!(session.buffer.is_empty());
    }

    #[tokio::test]
    async fn test_synthesis_failure_defers_greeting() {
        let h = harness(fast_config(), MockSynthesizer::failing());
        h.relay.on_start("MZ1", "CA1").await.unwrap();

        let session = h.relay.session().unwrap();
        // Greeting could not be synthesized; the claim is released and the
        // session waits in GREETING for the first media frame
        assert_eq!(session.state.state(), CallState::Greeting);
        assert!(!session.greeting_sent());
        assert_eq!(h.sink.count(), 0);

        // First media frame retries, fails again, and the call proceeds
        h.relay.on_media(&loud_frame_b64()).await;
        assert_eq!(session.state.state(), CallState::Listening);
    }

    #[tokio::test]
    async fn test_synthesis_cached_after_first_call() {
        let h = harness(fast_config(), MockSynthesizer::with_duration_ms(50));
        h.relay.on_start("MZ1", "CA1").await.unwrap();
        assert_eq!(h.synthesizer.calls.load(Ordering::SeqCst), 1);

        // Same greeting text on a second relay sharing the cache would hit;
        // here the reply text is new, so one more synthesis happens
        for _ in 0..3 {
            h.relay.on_media(&loud_frame_b64()).await;
        }
        assert_eq!(h.synthesizer.calls.load(Ordering::SeqCst), 2);

        // A second identical reply reuses the cached audio
        for _ in 0..3 {
            h.relay.on_media(&loud_frame_b64()).await;
        }
        assert_eq!(h.synthesizer.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_no_sends_after_disconnect() {
        // Race scenario: close arrives while a paced delivery is mid-flight.
        let mut config = fast_config();
        config.audio.frame_duration_ms = 10;

        // 1 s of synthesized audio → 8000 μ-law bytes → 100 frames of 80
        let h = harness(config, MockSynthesizer::with_duration_ms(1000));
        let relay = Arc::new(h.relay);

        let start_relay = relay.clone();
        let delivery = tokio::spawn(async move {
            // Greeting delivery runs paced for ~1 s
            let _ = start_relay.on_start("MZ1", "CA1").await;
        });

        // Let a few frames out, then close mid-delivery
        tokio::time::sleep(Duration::from_millis(50)).await;
        let session = relay.session().unwrap();
        relay.on_closed();
        assert_eq!(session.state.state(), CallState::Disconnected);
        let sends_at_close = h.sink.count();

        // Give the (aborted) delivery loop ample time to misbehave
        tokio::time::sleep(Duration::from_millis(200)).await;
        let _ = delivery.await;

        let final_sends = h.sink.count();
        assert!(
            final_sends <= sends_at_close + 1,
            "frames kept flowing after disconnect: {} at close, {} after",
            sends_at_close,
            final_sends
        );
        assert!(final_sends < 100, "delivery should have been cut short");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_close_signal_preempts_delivery_behind_dispatcher() {
        // The transport path: events arrive through the dispatcher channel,
        // which is busy awaiting the paced greeting when the caller hangs
        // up. The out-of-band close signal must stop outbound frames even
        // though the `closed` event itself is stuck behind the delivery.
        use crate::websocket::{spawn_dispatcher, CarrierEvent, StartMeta};

        let mut config = fast_config();
        config.audio.frame_duration_ms = 20;

        // 1 s of synthesized greeting → 8000 μ-law bytes → 50 frames of 160
        let h = harness(config, MockSynthesizer::with_duration_ms(1000));
        let relay = Arc::new(h.relay);
        let events = spawn_dispatcher(relay.clone());

        events
            .send(CarrierEvent::Start {
                start: StartMeta {
                    stream_sid: "MZ1".to_string(),
                    call_sid: "CA1".to_string(),
                },
            })
            .unwrap();

        // Let a few greeting frames out, then hang up mid-delivery the way
        // the websocket actor does: signal first, then queue the event
        tokio::time::sleep(Duration::from_millis(100)).await;
        relay.signal_close();
        events.send(CarrierEvent::Closed).unwrap();
        let sends_at_close = h.sink.count();

        tokio::time::sleep(Duration::from_millis(300)).await;
        let final_sends = h.sink.count();
        assert!(
            final_sends <= sends_at_close + 1,
            "frames kept flowing after close: {} at close, {} after",
            sends_at_close,
            final_sends
        );
        assert!(final_sends < 50, "delivery should have been cut short");

        // The queued `closed` event still completed the teardown
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(relay.session().is_none());
        assert_eq!(h.observer.ends.load(Ordering::SeqCst), 1);
    }
}
