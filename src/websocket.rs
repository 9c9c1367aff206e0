//! # Live Session Transport
//!
//! The single full-duplex WebSocket connection to the remote voice service.
//!
//! ## Live Protocol:
//! 1. **Connection**: client connects to the endpoint (API key as `key=` query parameter)
//! 2. **Setup**: first client message is `setup` (model, modalities, voice, system instruction)
//! 3. **Ready**: the server answers `setupComplete`; only then is the connection `Opened`
//! 4. **Audio Streaming**: each capture block goes out as one `realtimeInput` message
//!    carrying base64 PCM16 at the capture rate
//! 5. **Responses**: `serverContent` carries base64 PCM16 audio parts, text parts,
//!    `interrupted` and `turnComplete`
//!
//! ## Message Format:
//! - **Client → Server**: JSON text frames
//! - **Server → Client**: JSON in text or binary frames
//!
//! Events reach the session controller through a bounded channel, tagged with
//! the [`ConnectionId`] of the attempt that produced them.

use crate::config::{BackpressurePolicy, LiveConfig};
use crate::error::{AppError, AppResult};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};

/// Identifies one connection attempt.
pub type ConnectionId = u64;

/// Sender half of the controller's transport event channel.
pub type EventSender = mpsc::Sender<(ConnectionId, TransportEvent)>;

/// Something the remote service told us.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Raw PCM16 little-endian audio at the playback rate
    AudioChunk(Vec<u8>),
    /// The user started talking over the assistant; drop pending audio
    Interrupted,
    TurnComplete,
    /// Text part of a response (audio+text modality)
    Text(String),
    /// The server will close the connection soon
    GoAway(Option<String>),
    /// Audio part whose payload could not be decoded from base64
    MalformedAudio(String),
    /// Message shape we do not handle; names the top-level fields
    Unknown(String),
}

/// Lifecycle and traffic of one connection attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Setup acknowledged; outbound audio is accepted from now on
    Opened,
    Message(InboundMessage),
    /// The attempt failed or an open connection broke
    Failed(String),
    /// The remote side closed an open connection
    Closed(Option<String>),
}

/// Result of handing one frame to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Queued,
    /// Outbound queue full under the `drop` policy
    Dropped,
    /// No open connection
    NotConnected,
}

/// The connection the session controller drives.
///
/// ## Contract:
/// - `connect` starts an attempt and returns immediately; the attempt later
///   produces exactly one `Opened` or `Failed` on `events`
/// - `send` preserves order for every frame it queues
/// - `close` is idempotent; no event of a closed connection is delivered
///   after it returns, except ones already sitting in the channel
pub trait Transport: Send {
    fn connect(&mut self, config: &LiveConfig, events: EventSender) -> AppResult<ConnectionId>;

    fn send(&mut self, frame: Vec<u8>) -> SendOutcome;

    fn close(&mut self);
}

// ---------------------------------------------------------------------------
// Client → server messages
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SetupMessage {
    setup: Setup,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Setup {
    model: String,
    generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_modalities: Vec<String>,
    speech_config: SpeechConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SpeechConfig {
    voice_config: VoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VoiceConfig {
    prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PrebuiltVoiceConfig {
    voice_name: String,
}

#[derive(Debug, Serialize)]
struct Content {
    parts: Vec<TextPart>,
}

#[derive(Debug, Serialize)]
struct TextPart {
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInputMessage {
    realtime_input: RealtimeInput,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInput {
    media_chunks: Vec<Blob>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Blob {
    mime_type: String,
    data: String,
}

/// Build the `setup` message for `config`.
pub fn setup_message(config: &LiveConfig) -> AppResult<String> {
    let system_instruction = if config.system_prompt.trim().is_empty() {
        None
    } else {
        Some(Content {
            parts: vec![TextPart {
                text: config.system_prompt.clone(),
            }],
        })
    };

    let message = SetupMessage {
        setup: Setup {
            model: config.model.clone(),
            generation_config: GenerationConfig {
                response_modalities: config.modality.wire_names(),
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: config.voice.clone(),
                        },
                    },
                },
            },
            system_instruction,
        },
    };
    serde_json::to_string(&message).map_err(|e| AppError::Internal(e.to_string()))
}

/// Wrap one PCM16 capture frame as a `realtimeInput` message.
pub fn audio_input_message(pcm: &[u8], sample_rate: u32) -> AppResult<String> {
    let message = RealtimeInputMessage {
        realtime_input: RealtimeInput {
            media_chunks: vec![Blob {
                mime_type: format!("audio/pcm;rate={}", sample_rate),
                data: BASE64.encode(pcm),
            }],
        },
    };
    serde_json::to_string(&message).map_err(|e| AppError::Internal(e.to_string()))
}

// ---------------------------------------------------------------------------
// Server → client messages
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    setup_complete: Option<Value>,
    server_content: Option<ServerContent>,
    go_away: Option<GoAway>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    model_turn: Option<ModelTurn>,
    #[serde(default)]
    interrupted: bool,
    #[serde(default)]
    turn_complete: bool,
}

#[derive(Debug, Default, Deserialize)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    text: Option<String>,
    inline_data: Option<InlineData>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    data: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoAway {
    time_left: Option<String>,
}

/// Top-level fields that are understood, or known and deliberately ignored.
const KNOWN_FIELDS: &[&str] = &["setupComplete", "serverContent", "goAway", "usageMetadata"];

/// One decoded server frame.
#[derive(Debug, Default, PartialEq)]
pub struct ServerFrame {
    pub setup_complete: bool,
    pub messages: Vec<InboundMessage>,
}

/// Parse one server frame.
///
/// Audio parts come first, then `interrupted`, then `turnComplete`, the order
/// in which they apply to playback.
///
/// ## Errors:
/// `UnknownMessage` when the payload is not a JSON object.
pub fn parse_server_message(payload: &[u8]) -> AppResult<ServerFrame> {
    let value: Value = serde_json::from_slice(payload)?;
    let object = value
        .as_object()
        .ok_or_else(|| AppError::UnknownMessage("server message is not an object".to_string()))?;

    let unknown_fields: Vec<&str> = object
        .keys()
        .map(String::as_str)
        .filter(|key| !KNOWN_FIELDS.contains(key))
        .collect();

    let message: ServerMessage = serde_json::from_value(value.clone())?;
    let mut frame = ServerFrame {
        setup_complete: message.setup_complete.is_some(),
        messages: Vec::new(),
    };

    if let Some(content) = message.server_content {
        for part in content.model_turn.map(|turn| turn.parts).unwrap_or_default() {
            if let Some(inline) = part.inline_data {
                if inline.mime_type.starts_with("audio/") {
                    match BASE64.decode(inline.data.as_bytes()) {
                        Ok(bytes) => frame.messages.push(InboundMessage::AudioChunk(bytes)),
                        Err(e) => frame.messages.push(InboundMessage::MalformedAudio(e.to_string())),
                    }
                } else {
                    frame
                        .messages
                        .push(InboundMessage::Unknown(format!("inlineData {}", inline.mime_type)));
                }
            }
            if let Some(text) = part.text {
                frame.messages.push(InboundMessage::Text(text));
            }
        }
        if content.interrupted {
            frame.messages.push(InboundMessage::Interrupted);
        }
        if content.turn_complete {
            frame.messages.push(InboundMessage::TurnComplete);
        }
    }

    if let Some(go_away) = message.go_away {
        frame.messages.push(InboundMessage::GoAway(go_away.time_left));
    }

    if !unknown_fields.is_empty() && frame.messages.is_empty() && !frame.setup_complete {
        frame
            .messages
            .push(InboundMessage::Unknown(unknown_fields.join(",")));
    }

    Ok(frame)
}

/// Endpoint URL with the API key attached.
pub fn connection_url(config: &LiveConfig) -> String {
    if config.api_key.is_empty() {
        return config.endpoint.clone();
    }
    let separator = if config.endpoint.contains('?') { '&' } else { '?' };
    format!("{}{}key={}", config.endpoint, separator, config.api_key)
}

// ---------------------------------------------------------------------------
// WebSocket client
// ---------------------------------------------------------------------------

/// Outbound frame queue, bounded or not depending on the backpressure policy.
enum OutboundSender {
    Bounded(mpsc::Sender<Vec<u8>>),
    Unbounded(mpsc::UnboundedSender<Vec<u8>>),
}

enum OutboundReceiver {
    Bounded(mpsc::Receiver<Vec<u8>>),
    Unbounded(mpsc::UnboundedReceiver<Vec<u8>>),
}

impl OutboundReceiver {
    async fn recv(&mut self) -> Option<Vec<u8>> {
        match self {
            OutboundReceiver::Bounded(rx) => rx.recv().await,
            OutboundReceiver::Unbounded(rx) => rx.recv().await,
        }
    }
}

fn outbound_queue(policy: BackpressurePolicy, capacity: usize) -> (OutboundSender, OutboundReceiver) {
    match policy {
        BackpressurePolicy::Drop => {
            let (tx, rx) = mpsc::channel(capacity.max(1));
            (OutboundSender::Bounded(tx), OutboundReceiver::Bounded(rx))
        }
        BackpressurePolicy::Buffer => {
            let (tx, rx) = mpsc::unbounded_channel();
            (OutboundSender::Unbounded(tx), OutboundReceiver::Unbounded(rx))
        }
    }
}

struct ActiveConnection {
    id: ConnectionId,
    outbound: OutboundSender,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

/// WebSocket transport speaking the Live protocol.
pub struct LiveTransport {
    backpressure: BackpressurePolicy,
    queue_frames: usize,
    capture_rate: u32,
    next_id: ConnectionId,
    active: Option<ActiveConnection>,
}

impl LiveTransport {
    pub fn new(backpressure: BackpressurePolicy, queue_frames: usize, capture_rate: u32) -> Self {
        Self {
            backpressure,
            queue_frames,
            capture_rate,
            next_id: 1,
            active: None,
        }
    }
}

impl Transport for LiveTransport {
    fn connect(&mut self, config: &LiveConfig, events: EventSender) -> AppResult<ConnectionId> {
        if self.active.is_some() {
            return Err(AppError::InvalidState("transport already connected".to_string()));
        }

        let setup = setup_message(config)?;
        let url = connection_url(config);
        let id = self.next_id;
        self.next_id += 1;

        let (outbound, outbound_rx) = outbound_queue(self.backpressure, self.queue_frames);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let connection = Connection {
            id,
            url,
            setup,
            capture_rate: self.capture_rate,
            events,
        };
        let task = tokio::spawn(connection.run(outbound_rx, shutdown_rx));

        info!(connection = id, endpoint = %config.endpoint, "Connecting to live service");
        self.active = Some(ActiveConnection {
            id,
            outbound,
            shutdown: Some(shutdown_tx),
            task,
        });
        Ok(id)
    }

    fn send(&mut self, frame: Vec<u8>) -> SendOutcome {
        let Some(active) = self.active.as_ref() else {
            return SendOutcome::NotConnected;
        };
        match &active.outbound {
            OutboundSender::Bounded(tx) => match tx.try_send(frame) {
                Ok(()) => SendOutcome::Queued,
                Err(mpsc::error::TrySendError::Full(_)) => SendOutcome::Dropped,
                Err(mpsc::error::TrySendError::Closed(_)) => SendOutcome::NotConnected,
            },
            OutboundSender::Unbounded(tx) => match tx.send(frame) {
                Ok(()) => SendOutcome::Queued,
                Err(_) => SendOutcome::NotConnected,
            },
        }
    }

    fn close(&mut self) {
        let Some(mut active) = self.active.take() else {
            return;
        };
        // The task sends a close frame on shutdown; abort it if it already exited.
        let graceful = active
            .shutdown
            .take()
            .map(|tx| tx.send(()).is_ok())
            .unwrap_or(false);
        if !graceful {
            active.task.abort();
        }
        debug!(connection = active.id, "Transport closed");
    }
}

impl Drop for LiveTransport {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            active.task.abort();
        }
    }
}

/// State owned by one connection task.
struct Connection {
    id: ConnectionId,
    url: String,
    setup: String,
    capture_rate: u32,
    events: EventSender,
}

impl Connection {
    async fn emit(&self, event: TransportEvent) -> bool {
        self.events.send((self.id, event)).await.is_ok()
    }

    async fn run(self, mut outbound: OutboundReceiver, mut shutdown: oneshot::Receiver<()>) {
        let ws_stream = tokio::select! {
            _ = &mut shutdown => return,
            result = tokio_tungstenite::connect_async(self.url.as_str()) => match result {
                Ok((stream, _response)) => stream,
                Err(e) => {
                    error!(connection = self.id, error = %e, "Live connection failed");
                    self.emit(TransportEvent::Failed(format!("connect: {}", e))).await;
                    return;
                }
            },
        };

        let (mut ws_write, mut ws_read) = ws_stream.split();
        if let Err(e) = ws_write.send(WsMessage::Text(self.setup.clone())).await {
            self.emit(TransportEvent::Failed(format!("setup: {}", e))).await;
            return;
        }
        debug!(connection = self.id, "Setup sent, waiting for setupComplete");

        let mut opened = false;
        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    let _ = ws_write.send(WsMessage::Close(None)).await;
                    break;
                }

                frame = outbound.recv(), if opened => {
                    let Some(pcm) = frame else { break };
                    let json = match audio_input_message(&pcm, self.capture_rate) {
                        Ok(json) => json,
                        Err(e) => {
                            warn!(connection = self.id, error = %e, "Dropping unencodable frame");
                            continue;
                        }
                    };
                    if let Err(e) = ws_write.send(WsMessage::Text(json)).await {
                        self.emit(TransportEvent::Failed(format!("send: {}", e))).await;
                        break;
                    }
                }

                msg = ws_read.next() => {
                    let payload = match msg {
                        Some(Ok(WsMessage::Text(text))) => text.into_bytes(),
                        Some(Ok(WsMessage::Binary(data))) => data,
                        Some(Ok(WsMessage::Ping(data))) => {
                            let _ = ws_write.send(WsMessage::Pong(data)).await;
                            continue;
                        }
                        Some(Ok(WsMessage::Close(frame))) => {
                            let reason = frame.and_then(|f| {
                                (f.code != CloseCode::Normal || !f.reason.is_empty())
                                    .then(|| format!("{} {}", u16::from(f.code), f.reason))
                            });
                            info!(connection = self.id, reason = ?reason, "Live service closed the connection");
                            let event = if opened {
                                TransportEvent::Closed(reason)
                            } else {
                                TransportEvent::Failed(format!(
                                    "closed before setup completed: {}",
                                    reason.unwrap_or_else(|| "no reason".to_string())
                                ))
                            };
                            self.emit(event).await;
                            break;
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            error!(connection = self.id, error = %e, "Live connection error");
                            self.emit(TransportEvent::Failed(e.to_string())).await;
                            break;
                        }
                        None => {
                            let event = if opened {
                                TransportEvent::Closed(None)
                            } else {
                                TransportEvent::Failed("stream ended before setup completed".to_string())
                            };
                            self.emit(event).await;
                            break;
                        }
                    };

                    let frame = match parse_server_message(&payload) {
                        Ok(frame) => frame,
                        Err(e) => {
                            debug!(connection = self.id, error = %e, "Unparseable server message");
                            ServerFrame {
                                setup_complete: false,
                                messages: vec![InboundMessage::Unknown(e.to_string())],
                            }
                        }
                    };

                    if frame.setup_complete && !opened {
                        opened = true;
                        info!(connection = self.id, "Live session ready");
                        if !self.emit(TransportEvent::Opened).await {
                            break;
                        }
                    }
                    for message in frame.messages {
                        if !self.emit(TransportEvent::Message(message)).await {
                            return;
                        }
                    }
                }
            }
        }
    }
}
