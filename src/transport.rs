//! # Session Transport
//!
//! Owns the single bidirectional WebSocket connection to the voice backend
//! for the lifetime of a live session.
//!
//! ## Wire Protocol:
//! 1. **Handshake**: after the WebSocket upgrade the client sends a `setup`
//!    message (model, persona voice, system instruction, audio response
//!    modality, transcription flags) and waits for the server's
//!    `setupComplete` before the session counts as open.
//! 2. **Outbound**: one `realtimeInput` message per capture block, carrying
//!    base64 PCM at 16 kHz. Fire-and-forget; no acknowledgment is awaited.
//! 3. **Inbound**: `serverContent` messages carrying zero-or-one base64
//!    audio payload (24 kHz PCM), zero-or-one transcript fragment for either
//!    direction, and a `turnComplete` marker.
//!
//! The field names are fixed by the backend's contract; the endpoint is
//! configurable so tests can stand up an in-process server.
//!
//! Transport failures surface as a single `Closed` event. There is no
//! automatic reconnect: a retry is a fresh [`SessionTransport::connect`].

use crate::error::{BridgeError, BridgeResult};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

/// Outbound frames queued between capture and the send task. Capture drops
/// on overflow rather than blocking, so the bound only smooths bursts.
const OUTBOUND_AUDIO_BUFFER: usize = 64;

/// Inbound events queued for the session's event loop.
const INBOUND_EVENT_BUFFER: usize = 256;

/// MIME type of outbound microphone audio.
const OUTBOUND_MIME_TYPE: &str = "audio/pcm;rate=16000";

/// Connection parameters for one live session.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// WebSocket endpoint of the voice backend.
    pub endpoint: String,
    /// Provider API key, appended as a query parameter. May be empty when
    /// the endpoint itself carries credentials (or needs none, in tests).
    pub api_key: String,
    /// Model identifier requested in the setup message.
    pub model: String,
    /// Persona voice identity.
    pub voice_name: String,
    /// Persona system-instruction text.
    pub system_instruction: String,
}

/// Events delivered to the session from the inbound side of the connection.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Base64 PCM audio payload for the playback scheduler.
    Audio(String),
    /// A transcript fragment; `is_user` marks fragments transcribed from
    /// the microphone rather than spoken by the persona.
    Transcript { text: String, is_user: bool },
    /// The current turn finished; running transcripts reset.
    TurnComplete,
    /// The connection ended: remote close, transport error, or local
    /// `close()`. Always the final event.
    Closed { reason: Option<String> },
}

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ClientMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    setup: Option<Setup>,
    #[serde(skip_serializing_if = "Option::is_none")]
    realtime_input: Option<RealtimeInput>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Setup {
    model: String,
    generation_config: GenerationConfig,
    system_instruction: Content,
    output_audio_transcription: EmptyConfig,
    input_audio_transcription: EmptyConfig,
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

/// Serializes as `{}`; presence of the key enables the feature.
#[derive(Debug, Serialize)]
struct EmptyConfig {}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    inline_data: Option<Blob>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Blob {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInput {
    media_chunks: Vec<Blob>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    #[serde(default)]
    setup_complete: Option<serde_json::Value>,
    #[serde(default)]
    server_content: Option<ServerContent>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    #[serde(default)]
    model_turn: Option<Content>,
    #[serde(default)]
    output_transcription: Option<Transcription>,
    #[serde(default)]
    input_transcription: Option<Transcription>,
    #[serde(default)]
    turn_complete: bool,
}

#[derive(Debug, Deserialize)]
struct Transcription {
    #[serde(default)]
    text: String,
}

impl Setup {
    fn from_config(config: &TransportConfig) -> Self {
        Self {
            model: config.model.clone(),
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: config.voice_name.clone(),
                        },
                    },
                },
            },
            system_instruction: Content {
                parts: vec![Part {
                    text: Some(config.system_instruction.clone()),
                    inline_data: None,
                }],
            },
            output_audio_transcription: EmptyConfig {},
            input_audio_transcription: EmptyConfig {},
        }
    }
}

/// Extract the events carried by one server message.
///
/// Each message yields zero-or-one audio payload, zero-or-one transcript
/// fragment per direction, and possibly a turn-complete marker, in that
/// order. Unknown fields are ignored.
fn dispatch(message: ServerMessage) -> Vec<TransportEvent> {
    let mut events = Vec::new();
    let Some(content) = message.server_content else {
        return events;
    };

    if let Some(turn) = content.model_turn {
        if let Some(data) = turn
            .parts
            .into_iter()
            .find_map(|part| part.inline_data.map(|blob| blob.data))
        {
            events.push(TransportEvent::Audio(data));
        }
    }
    if let Some(transcription) = content.output_transcription {
        events.push(TransportEvent::Transcript {
            text: transcription.text,
            is_user: false,
        });
    }
    if let Some(transcription) = content.input_transcription {
        events.push(TransportEvent::Transcript {
            text: transcription.text,
            is_user: true,
        });
    }
    if content.turn_complete {
        events.push(TransportEvent::TurnComplete);
    }
    events
}

/// Parse a WebSocket message into a server message, if it carries one.
fn parse_server_message(message: &Message) -> Option<ServerMessage> {
    match message {
        Message::Text(text) => match serde_json::from_str(text.as_ref()) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                warn!("ignoring unparseable server message: {}", e);
                None
            }
        },
        // Some backends deliver JSON payloads as binary frames.
        Message::Binary(bytes) => match serde_json::from_slice(bytes.as_ref()) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                warn!("ignoring unparseable binary server message: {}", e);
                None
            }
        },
        _ => None,
    }
}

// ── Transport ───────────────────────────────────────────────────────

/// One open connection to the voice backend.
///
/// Dropping the transport without calling [`close`](Self::close) signals the
/// background tasks to finish as the channels close.
pub struct SessionTransport {
    audio_tx: mpsc::Sender<String>,
    closed: Arc<AtomicBool>,
    close_tx: watch::Sender<bool>,
}

impl SessionTransport {
    /// Open a live session: WebSocket upgrade, `setup`, then wait for the
    /// server's `setupComplete`. Resolves only once the handshake finished;
    /// the session does not count as open before that.
    ///
    /// Returns the transport handle and the inbound event stream. The
    /// stream always terminates with a single [`TransportEvent::Closed`].
    pub async fn connect(
        config: &TransportConfig,
    ) -> BridgeResult<(Self, ReceiverStream<TransportEvent>)> {
        let url = if config.api_key.is_empty() {
            config.endpoint.clone()
        } else {
            let separator = if config.endpoint.contains('?') { '&' } else { '?' };
            format!("{}{}key={}", config.endpoint, separator, config.api_key)
        };

        let (mut ws, _response) = connect_async(&url)
            .await
            .map_err(|e| BridgeError::Handshake(e.to_string()))?;
        debug!(endpoint = %config.endpoint, "websocket connected, sending setup");

        let setup = ClientMessage {
            setup: Some(Setup::from_config(config)),
            realtime_input: None,
        };
        let setup_json =
            serde_json::to_string(&setup).map_err(|e| BridgeError::Handshake(e.to_string()))?;
        ws.send(Message::Text(setup_json.into()))
            .await
            .map_err(|e| BridgeError::Handshake(e.to_string()))?;

        // The server acknowledges with setupComplete; anything else before
        // that (including a close) fails the handshake.
        loop {
            match ws.next().await {
                Some(Ok(message)) => {
                    if let Some(parsed) = parse_server_message(&message) {
                        if parsed.setup_complete.is_some() {
                            break;
                        }
                        warn!("server message before setupComplete; ignoring");
                    } else if matches!(message, Message::Close(_)) {
                        return Err(BridgeError::Handshake(
                            "server closed the connection during setup".to_string(),
                        ));
                    }
                }
                Some(Err(e)) => return Err(BridgeError::Handshake(e.to_string())),
                None => {
                    return Err(BridgeError::Handshake(
                        "connection ended during setup".to_string(),
                    ))
                }
            }
        }

        info!(model = %config.model, voice = %config.voice_name, "live session open");

        let (mut ws_tx, mut ws_rx) = ws.split();
        let (audio_tx, mut audio_rx) = mpsc::channel::<String>(OUTBOUND_AUDIO_BUFFER);
        let (event_tx, event_rx) = mpsc::channel::<TransportEvent>(INBOUND_EVENT_BUFFER);
        let (close_tx, close_rx) = watch::channel(false);
        let closed = Arc::new(AtomicBool::new(false));

        // Outbound: wrap each encoded frame and send without awaiting any
        // acknowledgment. A failed send means the connection is going down;
        // the receive side reports it.
        let mut send_close_rx = close_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = audio_rx.recv() => {
                        let Some(encoded) = frame else { break };
                        let input = ClientMessage {
                            setup: None,
                            realtime_input: Some(RealtimeInput {
                                media_chunks: vec![Blob {
                                    mime_type: OUTBOUND_MIME_TYPE.to_string(),
                                    data: encoded,
                                }],
                            }),
                        };
                        let json = match serde_json::to_string(&input) {
                            Ok(json) => json,
                            Err(e) => {
                                warn!("failed to serialize realtime input: {}", e);
                                continue;
                            }
                        };
                        if let Err(e) = ws_tx.send(Message::Text(json.into())).await {
                            debug!("dropping outbound frame on closing session: {}", e);
                            break;
                        }
                    }
                    _ = send_close_rx.changed() => {
                        let _ = ws_tx.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        });

        // Inbound: dispatch server messages until the connection ends, then
        // emit the final Closed event.
        let recv_closed = closed.clone();
        let mut recv_close_rx = close_rx;
        tokio::spawn(async move {
            let reason = 'recv: loop {
                tokio::select! {
                    message = ws_rx.next() => {
                        match message {
                            Some(Ok(Message::Close(frame))) => {
                                break 'recv frame.map(|f| f.reason.to_string());
                            }
                            Some(Ok(message)) => {
                                if let Some(parsed) = parse_server_message(&message) {
                                    for event in dispatch(parsed) {
                                        if event_tx.send(event).await.is_err() {
                                            break 'recv None;
                                        }
                                    }
                                }
                            }
                            Some(Err(e)) => break 'recv Some(e.to_string()),
                            None => break 'recv None,
                        }
                    }
                    _ = recv_close_rx.changed() => break 'recv None,
                }
            };

            recv_closed.store(true, Ordering::SeqCst);
            if let Some(ref reason) = reason {
                warn!(reason = %reason, "live session closed");
            } else {
                debug!("live session closed");
            }
            let _ = event_tx.send(TransportEvent::Closed { reason }).await;
        });

        Ok((
            Self {
                audio_tx,
                closed,
                close_tx,
            },
            ReceiverStream::new(event_rx),
        ))
    }

    /// Sender half of the outbound frame queue, for the capture stage.
    pub fn audio_sender(&self) -> mpsc::Sender<String> {
        self.audio_tx.clone()
    }

    /// Send one encoded frame. Swallowed (logged only) when the session is
    /// closed or congested; frames are never queued for retry.
    pub fn send_frame(&self, encoded: String) {
        if self.closed.load(Ordering::SeqCst) {
            debug!("dropping frame sent after close");
            return;
        }
        if self.audio_tx.try_send(encoded).is_err() {
            debug!("dropping frame; outbound queue unavailable");
        }
    }

    /// Whether the connection has ended (locally or remotely).
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Terminate the connection. Idempotent and infallible: calling it
    /// repeatedly, or when the session already ended, does nothing.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.close_tx.send(true);
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use futures_util::{SinkExt, StreamExt};
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message;

    /// Behavior of the scripted backend after the handshake.
    pub enum ServerScript {
        /// Complete setup, send the canned messages, then wait for client
        /// frames until the connection closes.
        Serve { messages: Vec<String> },
        /// Close the connection without ever acknowledging setup.
        RefuseSetup,
        /// Sleep before acknowledging setup, then idle.
        SlowSetup { delay_ms: u64 },
    }

    /// Spawn a one-connection scripted voice backend. Returns its ws:// URL
    /// and a channel yielding the raw text frames the client sent.
    pub async fn spawn_server(
        script: ServerScript,
    ) -> (String, tokio::sync::mpsc::UnboundedReceiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let (seen_tx, seen_rx) = tokio::sync::mpsc::unbounded_channel();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let mut ws = tokio_tungstenite::accept_async(stream).await.expect("upgrade");

            match script {
                ServerScript::RefuseSetup => {
                    // Read the setup, then slam the door.
                    let _ = ws.next().await;
                    let _ = ws.send(Message::Close(None)).await;
                    return;
                }
                ServerScript::SlowSetup { delay_ms } => {
                    let _ = ws.next().await;
                    tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                    let _ = ws
                        .send(Message::Text(r#"{"setupComplete":{}}"#.to_string().into()))
                        .await;
                }
                ServerScript::Serve { ref messages } => {
                    // First frame must be the setup message.
                    if let Some(Ok(Message::Text(setup))) = ws.next().await {
                        let _ = seen_tx.send(setup.to_string());
                    }
                    let _ = ws
                        .send(Message::Text(r#"{"setupComplete":{}}"#.to_string().into()))
                        .await;
                    for message in messages {
                        let _ = ws.send(Message::Text(message.clone().into())).await;
                    }
                }
            }

            // Relay any client frames until close.
            while let Some(Ok(message)) = ws.next().await {
                match message {
                    Message::Text(text) => {
                        let _ = seen_tx.send(text.to_string());
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        });

        (format!("ws://{}", addr), seen_rx)
    }
}
