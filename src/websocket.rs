//! # Carrier Media Stream Handler
//!
//! The websocket endpoint the phone carrier connects to. The carrier speaks
//! a JSON event protocol over the socket:
//!
//! 1. **`connected`**: transport-level hello, no call context yet
//! 2. **`start`**: call metadata (stream SID, call SID); the session begins
//! 3. **`media`**: one base64 μ-law audio frame per event
//! 4. **`closed`**: the call ended
//!
//! Outbound audio travels the same socket as `media` events carrying
//! headerless 8 kHz mono μ-law, base64 encoded. Unrecognized inbound events
//! are logged and ignored so carrier protocol additions never break live
//! calls.
//!
//! ## Actor Model:
//! Each connection is an Actix actor. The actor itself only parses and
//! forwards: inbound events flow through an mpsc channel to a dispatcher
//! task that drives the [`MediaRelay`] one event at a time, preserving frame
//! order. Outbound payloads come back as actor messages so only the actor
//! ever writes to the socket.
//!
//! The one exception to strict queue order is close: the dispatcher may be
//! busy awaiting a multi-second paced delivery, so a parsed `closed` event
//! (and an actor stop) signals the relay synchronously before queuing. The
//! in-flight delivery is aborted at once; the queued event then performs the
//! remaining teardown.

use crate::error::{RelayError, RelayResult};
use crate::relay::{MediaRelay, MediaSink};
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Ping cadence and the silence window after which the peer is presumed gone.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Inbound carrier events. The carrier sends more fields than these (track
/// names, sequence numbers, timestamps); only what the relay consumes is
/// modeled and the rest is ignored.
#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum CarrierEvent {
    /// Transport established, no call context yet
    Connected,

    /// Call metadata; the media stream follows
    Start { start: StartMeta },

    /// One frame of base64 μ-law audio
    Media { media: InboundMedia },

    /// The call ended
    Closed,

    /// Any event type this build does not recognize
    #[serde(other)]
    Unknown,
}

/// The call identifiers carried by the `start` event.
#[derive(Debug, Deserialize)]
pub struct StartMeta {
    #[serde(rename = "streamSid")]
    pub stream_sid: String,
    #[serde(rename = "callSid")]
    pub call_sid: String,
}

#[derive(Debug, Deserialize)]
pub struct InboundMedia {
    /// Base64-encoded μ-law bytes
    pub payload: String,
}

/// Outbound media event. The field shape is the carrier's contract: the
/// payload must be headerless base64 μ-law and the stream SID must echo the
/// one from `start`.
#[derive(Debug, Serialize)]
pub struct OutboundMediaEvent {
    pub event: &'static str,
    #[serde(rename = "streamSid")]
    pub stream_sid: String,
    pub media: OutboundMedia,
}

#[derive(Debug, Serialize)]
pub struct OutboundMedia {
    pub payload: String,
}

impl OutboundMediaEvent {
    pub fn new(stream_sid: &str, payload: String) -> Self {
        Self {
            event: "media",
            stream_sid: stream_sid.to_string(),
            media: OutboundMedia { payload },
        }
    }
}

/// [`MediaSink`] backed by the websocket actor's address.
///
/// The relay is constructed before the actor starts, so the address slot
/// begins empty and is attached from `started()`. A send before attachment
/// or after the actor stops reports the transport as closed.
pub struct ActorMediaSink {
    addr: RwLock<Option<Addr<CarrierWebSocket>>>,
}

impl ActorMediaSink {
    pub fn new() -> Self {
        Self {
            addr: RwLock::new(None),
        }
    }

    fn attach(&self, addr: Addr<CarrierWebSocket>) {
        *self.addr.write().unwrap() = Some(addr);
    }

    fn detach(&self) {
        *self.addr.write().unwrap() = None;
    }
}

impl Default for ActorMediaSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaSink for ActorMediaSink {
    async fn send_media(&self, stream_sid: &str, payload_b64: String) -> RelayResult<()> {
        let addr = self.addr.read().unwrap().clone().ok_or_else(|| {
            RelayError::TransportClosed("carrier socket not attached".to_string())
        })?;

        let json = serde_json::to_string(&OutboundMediaEvent::new(stream_sid, payload_b64))?;
        addr.send(SendFrame(json))
            .await
            .map_err(|_| RelayError::TransportClosed("carrier socket closed".to_string()))
    }
}

/// One serialized outbound event, written verbatim to the socket.
#[derive(Message)]
#[rtype(result = "()")]
struct SendFrame(String);

/// Websocket actor for one carrier connection.
pub struct CarrierWebSocket {
    /// Inbound events, consumed in order by the dispatcher task
    events: mpsc::UnboundedSender<CarrierEvent>,

    /// The sink handed to the relay; attached to this actor on start
    sink: Arc<ActorMediaSink>,

    /// Held for the synchronous close signal only; everything else goes
    /// through the dispatcher channel
    relay: Arc<MediaRelay>,

    last_heartbeat: Instant,
}

impl CarrierWebSocket {
    fn new(
        events: mpsc::UnboundedSender<CarrierEvent>,
        sink: Arc<ActorMediaSink>,
        relay: Arc<MediaRelay>,
    ) -> Self {
        Self {
            events,
            sink,
            relay,
            last_heartbeat: Instant::now(),
        }
    }

    fn forward(&self, event: CarrierEvent) {
        // A send failure means the dispatcher already finished (closed or
        // errored); late events have nowhere to go.
        if self.events.send(event).is_err() {
            debug!("Dropping carrier event received after session end");
        }
    }
}

impl Actor for CarrierWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!("Carrier websocket connection started");
        self.sink.attach(ctx.address());

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!("Carrier heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!("Carrier websocket connection stopped");
        self.sink.detach();
        // A socket that dies mid-delivery must stop outbound frames now,
        // not when the dispatcher drains its queue
        self.relay.signal_close();
        // Dropping the actor drops the event sender; the dispatcher sees the
        // channel close and tears the session down if `closed` never came.
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for CarrierWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => match serde_json::from_str::<CarrierEvent>(&text) {
                Ok(event) => {
                    // Close must preempt any in-flight delivery; the queued
                    // event only handles the remaining teardown
                    if matches!(event, CarrierEvent::Closed) {
                        self.relay.signal_close();
                    }
                    self.forward(event);
                }
                Err(err) => {
                    // Malformed event: drop the message, never the call
                    warn!("Unparseable carrier event, ignoring: {}", err);
                }
            },
            Ok(ws::Message::Binary(_)) => {
                warn!("Carrier sent unexpected binary frame, ignoring");
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!("Carrier websocket closed: {:?}", reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!("Websocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

impl Handler<SendFrame> for CarrierWebSocket {
    type Result = ();

    fn handle(&mut self, msg: SendFrame, ctx: &mut Self::Context) {
        ctx.text(msg.0);
    }
}

/// Consume carrier events in arrival order and drive the relay.
///
/// Runs until the carrier says `closed`, the channel drops (socket died
/// without a close), or the session fails to start.
pub(crate) fn spawn_dispatcher(relay: Arc<MediaRelay>) -> mpsc::UnboundedSender<CarrierEvent> {
    let (tx, mut rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                CarrierEvent::Connected => relay.on_connected(),
                CarrierEvent::Start { start } => {
                    if let Err(err) = relay.on_start(&start.stream_sid, &start.call_sid).await {
                        error!("Call {} failed to start: {}", start.call_sid, err);
                        relay.on_transport_error(&err.to_string());
                        return;
                    }
                }
                CarrierEvent::Media { media } => relay.on_media(&media.payload).await,
                CarrierEvent::Closed => {
                    relay.on_closed();
                    return;
                }
                CarrierEvent::Unknown => {
                    debug!("Ignoring unrecognized carrier event");
                }
            }
        }

        // Socket dropped without a `closed` event
        relay.on_transport_error("carrier connection dropped");
    });

    tx
}

/// HTTP-to-websocket upgrade for `/ws/media-stream`.
///
/// Each connection gets its own relay wired to the shared registry,
/// collaborators, and synthesis cache from [`AppState`].
pub async fn media_stream(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    info!(
        "New carrier media stream connection from: {:?}",
        req.connection_info().peer_addr()
    );

    let sink = Arc::new(ActorMediaSink::new());
    let relay = Arc::new(MediaRelay::new(
        state.get_config(),
        state.registry.clone(),
        state.collaborators.clone(),
        state.cache.clone(),
        sink.clone(),
    ));
    let events = spawn_dispatcher(relay.clone());

    ws::start(CarrierWebSocket::new(events, sink, relay), &req, stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outbound_media_event_wire_shape() {
        let event = OutboundMediaEvent::new("MZ123", "AAECAw==".to_string());
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(
            json,
            r#"{"event":"media","streamSid":"MZ123","media":{"payload":"AAECAw=="}}"#
        );
    }

    #[test]
    fn test_parse_start_event() {
        let json = r#"{
            "event": "start",
            "sequenceNumber": "1",
            "start": {
                "accountSid": "AC0000",
                "streamSid": "MZ123",
                "callSid": "CA456",
                "tracks": ["inbound"],
                "mediaFormat": {"encoding": "audio/x-mulaw", "sampleRate": 8000, "channels": 1}
            },
            "streamSid": "MZ123"
        }"#;
        match serde_json::from_str::<CarrierEvent>(json).unwrap() {
            CarrierEvent::Start { start } => {
                assert_eq!(start.stream_sid, "MZ123");
                assert_eq!(start.call_sid, "CA456");
            }
            other => panic!("wrong event: {:?}", other),
        }
    }

    #[test]
    fn test_parse_media_event() {
        let json = r#"{
            "event": "media",
            "sequenceNumber": "7",
            "media": {"track": "inbound", "chunk": "5", "timestamp": "800", "payload": "f39/fw=="},
            "streamSid": "MZ123"
        }"#;
        match serde_json::from_str::<CarrierEvent>(json).unwrap() {
            CarrierEvent::Media { media } => assert_eq!(media.payload, "f39/fw=="),
            other => panic!("wrong event: {:?}", other),
        }
    }

    #[test]
    fn test_parse_connected_and_closed() {
        let connected = r#"{"event": "connected", "protocol": "Call", "version": "1.0.0"}"#;
        assert!(matches!(
            serde_json::from_str::<CarrierEvent>(connected).unwrap(),
            CarrierEvent::Connected
        ));

        let closed = r#"{"event": "closed", "streamSid": "MZ123"}"#;
        assert!(matches!(
            serde_json::from_str::<CarrierEvent>(closed).unwrap(),
            CarrierEvent::Closed
        ));
    }

    #[test]
    fn test_unknown_event_is_tolerated() {
        let json = r#"{"event": "mark", "streamSid": "MZ123", "mark": {"name": "greeting"}}"#;
        assert!(matches!(
            serde_json::from_str::<CarrierEvent>(json).unwrap(),
            CarrierEvent::Unknown
        ));
    }

    #[test]
    fn test_malformed_event_is_an_error() {
        assert!(serde_json::from_str::<CarrierEvent>("not json").is_err());
        assert!(serde_json::from_str::<CarrierEvent>(r#"{"no_event_tag": true}"#).is_err());
    }

    #[tokio::test]
    async fn test_unattached_sink_reports_transport_closed() {
        let sink = ActorMediaSink::new();
        let result = sink.send_media("MZ1", "AAAA".to_string()).await;
        assert!(matches!(result, Err(RelayError::TransportClosed(_))));
    }
}
