//! Gemini Live WebSocket transport for the live voice session.
//!
//! Implements the bidirectional streaming protocol of the Gemini Live API
//! (BidiGenerateContent) behind [`LiveConnector`] / [`LiveTransport`].
//!
//! ## Protocol Overview
//!
//! 1. **Connect**: open WebSocket to the Live endpoint (`?key=`)
//! 2. **Setup**: send model, audio response modality, voice, system
//!    prompt and transcription flags; wait for `setupComplete`
//! 3. **Stream**: send microphone frames as `realtimeInput.mediaChunks`,
//!    receive audio, transcriptions and turn signals as `serverContent`
//! 4. **Close**: send `audioStreamEnd`, then a Close frame
//!
//! Gemini Live sends JSON control messages as Binary frames as well as
//! Text frames, so both are parsed the same way.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::codec::{AudioBlob, EncodedChunk};
use super::error::LiveError;
use super::transport::{LiveConnector, LiveSetup, LiveTransport};
use super::LiveEvent;

// ── Constants ──────────────────────────────────────────────────────

/// Gemini Live WebSocket endpoint.
pub const GEMINI_LIVE_WS_URL: &str =
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// How long to wait for `setupComplete` after sending the setup message.
pub const DEFAULT_SETUP_TIMEOUT: Duration = Duration::from_secs(15);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, WsMessage>;
type WsSource = SplitStream<WsStream>;

// ── Setup message (JSON sent as first frame) ───────────────────────

/// Top-level setup message for Gemini Live session initialization.
#[derive(Debug, Serialize)]
pub struct SetupMessage {
    pub setup: SetupPayload,
}

#[derive(Debug, Serialize)]
pub struct SetupPayload {
    pub model: String,
    #[serde(rename = "generationConfig")]
    pub generation_config: GenerationConfig,
    #[serde(rename = "systemInstruction", skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<SystemInstruction>,
    #[serde(rename = "inputAudioTranscription", skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<TranscriptionConfig>,
    #[serde(rename = "outputAudioTranscription", skip_serializing_if = "Option::is_none")]
    pub output_audio_transcription: Option<TranscriptionConfig>,
}

#[derive(Debug, Serialize)]
pub struct GenerationConfig {
    #[serde(rename = "responseModalities")]
    pub response_modalities: Vec<String>,
    #[serde(rename = "speechConfig", skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<SpeechConfig>,
}

#[derive(Debug, Serialize)]
pub struct SpeechConfig {
    #[serde(rename = "voiceConfig")]
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Serialize)]
pub struct VoiceConfig {
    #[serde(rename = "prebuiltVoiceConfig")]
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Serialize)]
pub struct PrebuiltVoiceConfig {
    #[serde(rename = "voiceName")]
    pub voice_name: String,
}

#[derive(Debug, Serialize)]
pub struct SystemInstruction {
    pub parts: Vec<TextPart>,
}

#[derive(Debug, Serialize)]
pub struct TextPart {
    pub text: String,
}

/// Empty object enabling transcription for one direction.
#[derive(Debug, Default, Serialize)]
pub struct TranscriptionConfig {}

/// Build the setup message for a live voice session.
pub fn build_setup_message(setup: &LiveSetup) -> SetupMessage {
    let model = if setup.model.starts_with("models/") {
        setup.model.clone()
    } else {
        format!("models/{}", setup.model)
    };

    SetupMessage {
        setup: SetupPayload {
            model,
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: (!setup.voice_name.is_empty()).then(|| SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: setup.voice_name.clone(),
                        },
                    },
                }),
            },
            system_instruction: (!setup.system_prompt.is_empty()).then(|| SystemInstruction {
                parts: vec![TextPart {
                    text: setup.system_prompt.clone(),
                }],
            }),
            input_audio_transcription: setup
                .input_transcription
                .then(TranscriptionConfig::default),
            output_audio_transcription: setup
                .output_transcription
                .then(TranscriptionConfig::default),
        },
    }
}

// ── Audio input message ────────────────────────────────────────────

/// Audio input message sent to Gemini Live.
///
/// API docs mark `mediaChunks` as deprecated in favor of `audio`, but the
/// official SDKs still put `mediaChunks` on the wire.
#[derive(Debug, Serialize)]
pub struct RealtimeInputMessage {
    #[serde(rename = "realtimeInput")]
    pub realtime_input: RealtimeInput,
}

#[derive(Debug, Serialize)]
pub struct RealtimeInput {
    #[serde(rename = "mediaChunks")]
    pub media_chunks: Vec<MediaChunk>,
}

/// Audio chunk with MIME type and base64-encoded data.
#[derive(Debug, Serialize)]
pub struct MediaChunk {
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    pub data: String,
}

/// Tells the server the microphone has stopped so it flushes buffered input.
#[derive(Debug, Serialize)]
pub struct AudioStreamEndMessage {
    #[serde(rename = "realtimeInput")]
    pub realtime_input: AudioStreamEndPayload,
}

#[derive(Debug, Serialize)]
pub struct AudioStreamEndPayload {
    #[serde(rename = "audioStreamEnd")]
    pub audio_stream_end: bool,
}

/// Wire format: `{"realtimeInput": {"mediaChunks": [{"mimeType": "audio/pcm;rate=16000", "data": "<base64>"}]}}`
pub fn build_audio_message(blob: &AudioBlob) -> RealtimeInputMessage {
    RealtimeInputMessage {
        realtime_input: RealtimeInput {
            media_chunks: vec![MediaChunk {
                mime_type: blob.mime_type.clone(),
                data: blob.data.as_str().to_string(),
            }],
        },
    }
}

pub fn build_audio_stream_end_message() -> AudioStreamEndMessage {
    AudioStreamEndMessage {
        realtime_input: AudioStreamEndPayload {
            audio_stream_end: true,
        },
    }
}

// ── Server messages ────────────────────────────────────────────────

/// Transcription text at `key`, looked up inside `serverContent` first and
/// at the top level second. Empty fragments are ignored.
fn transcription_text<'a>(value: &'a serde_json::Value, key: &str) -> Option<&'a str> {
    value
        .pointer(&format!("/serverContent/{key}/text"))
        .or_else(|| value.pointer(&format!("/{key}/text")))
        .and_then(|v| v.as_str())
        .filter(|text| !text.is_empty())
}

/// Parse one JSON frame from Gemini Live into session events.
///
/// A single frame can carry several events (e.g. audio plus a
/// transcription fragment). `interrupted` comes first so barge-in clears
/// the old turn before the new user speech lands; transcriptions and audio
/// come before `turnComplete` so it never clears text from the same frame.
pub fn parse_server_message(json_text: &str) -> Vec<LiveEvent> {
    let mut events = Vec::new();

    let value: serde_json::Value = match serde_json::from_str(json_text) {
        Ok(v) => v,
        Err(e) => {
            events.push(LiveEvent::Error {
                details: format!("Failed to parse server message: {e}"),
            });
            return events;
        }
    };

    let content = value.get("serverContent");
    if content.and_then(|c| c.get("interrupted")).and_then(|v| v.as_bool()) == Some(true) {
        events.push(LiveEvent::Interrupted);
    }

    if let Some(text) = transcription_text(&value, "inputTranscription") {
        events.push(LiveEvent::Transcription {
            text: text.to_string(),
            is_user: true,
        });
    }
    if let Some(text) = transcription_text(&value, "outputTranscription") {
        events.push(LiveEvent::Transcription {
            text: text.to_string(),
            is_user: false,
        });
    }

    if let Some(content) = content {
        if let Some(parts) = content
            .pointer("/modelTurn/parts")
            .and_then(|v| v.as_array())
        {
            for part in parts {
                if let Some(data) = part.pointer("/inlineData/data").and_then(|v| v.as_str()) {
                    events.push(LiveEvent::AudioData {
                        data: EncodedChunk::new(data),
                    });
                }
            }
        }
        if content.get("turnComplete").and_then(|v| v.as_bool()) == Some(true) {
            events.push(LiveEvent::TurnComplete);
        }
    }

    if let Some(err) = value.get("error") {
        let details = err
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("Unknown server error");
        events.push(LiveEvent::Error {
            details: details.to_string(),
        });
    }

    events
}

/// JSON text carried by a frame, whether it arrived as Text or Binary.
fn frame_json(msg: &WsMessage) -> Option<&str> {
    match msg {
        WsMessage::Text(text) => Some(text.as_str()),
        WsMessage::Binary(data) if data.first() == Some(&b'{') => std::str::from_utf8(data).ok(),
        _ => None,
    }
}

// ── Connector ──────────────────────────────────────────────────────

/// Opens Gemini Live sessions with an API key.
#[derive(Debug, Clone)]
pub struct GeminiLiveConnector {
    api_key: String,
    endpoint: String,
    setup_timeout: Duration,
}

impl GeminiLiveConnector {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            endpoint: GEMINI_LIVE_WS_URL.to_string(),
            setup_timeout: DEFAULT_SETUP_TIMEOUT,
        }
    }

    /// Override the WebSocket endpoint (proxies, local test servers).
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_setup_timeout(mut self, timeout: Duration) -> Self {
        self.setup_timeout = timeout;
        self
    }

    /// Wait for `setupComplete` on the unsplit stream.
    async fn await_setup_complete(ws: &mut WsStream, session_id: &str) -> Result<(), LiveError> {
        while let Some(msg) = ws.next().await {
            let msg = msg.map_err(|e| {
                LiveError::Transport(format!("WebSocket error before setupComplete: {e}"))
            })?;
            if let WsMessage::Close(frame) = &msg {
                return Err(LiveError::Transport(format!(
                    "Connection closed before setupComplete: {frame:?}"
                )));
            }
            let Some(text) = frame_json(&msg) else {
                tracing::debug!(session_id = %session_id, msg = ?msg, "Gemini Live setup phase: non-JSON frame");
                continue;
            };
            if text.contains("setupComplete") {
                tracing::info!(session_id = %session_id, "Gemini Live setup complete, ready to stream");
                return Ok(());
            }
            for event in parse_server_message(text) {
                if let LiveEvent::Error { details } = event {
                    return Err(LiveError::Transport(format!(
                        "Gemini Live rejected setup: {details}"
                    )));
                }
            }
        }
        Err(LiveError::Transport("Stream ended before setupComplete".into()))
    }
}

/// Map a handshake failure, treating 401/403 as an authorization refusal.
fn map_connect_error(err: tokio_tungstenite::tungstenite::Error) -> LiveError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match &err {
        WsError::Http(response) if matches!(response.status().as_u16(), 401 | 403) => {
            LiveError::PermissionDenied(format!("Gemini Live refused the API key: {err}"))
        }
        _ => LiveError::Transport(format!("Failed to connect to Gemini Live: {err}")),
    }
}

#[async_trait]
impl LiveConnector for GeminiLiveConnector {
    async fn connect(
        &self,
        session_id: &str,
        setup: &LiveSetup,
    ) -> Result<Arc<dyn LiveTransport>, LiveError> {
        let url = format!("{}?key={}", self.endpoint, self.api_key);

        tracing::info!(
            session_id = %session_id,
            model = %setup.model,
            voice = %setup.voice_name,
            "Connecting to Gemini Live"
        );

        let (mut ws_stream, _response) = tokio_tungstenite::connect_async(&url)
            .await
            .map_err(map_connect_error)?;

        let setup_json = serde_json::to_string(&build_setup_message(setup))
            .map_err(|e| LiveError::Transport(format!("Failed to encode setup message: {e}")))?;
        tracing::debug!(session_id = %session_id, setup = %setup_json, "Sending Gemini Live setup");
        ws_stream
            .send(WsMessage::text(setup_json))
            .await
            .map_err(|e| LiveError::Transport(format!("Failed to send setup message: {e}")))?;

        tokio::time::timeout(
            self.setup_timeout,
            Self::await_setup_complete(&mut ws_stream, session_id),
        )
        .await
        .map_err(|_| {
            LiveError::Transport(format!(
                "Gemini Live setupComplete timeout ({}s)",
                self.setup_timeout.as_secs()
            ))
        })??;

        Ok(Arc::new(GeminiLiveTransport::spawn(
            ws_stream,
            session_id.to_string(),
        )))
    }
}

// ── Transport ──────────────────────────────────────────────────────

/// Outbound message to send to the Gemini Live WebSocket.
#[derive(Debug)]
enum OutboundMessage {
    Audio(AudioBlob),
    Close,
}

/// An open Gemini Live session.
///
/// Two background tasks own the socket halves: the outbound loop encodes
/// queued frames, the inbound loop parses server frames into events.
pub struct GeminiLiveTransport {
    outbound_tx: mpsc::Sender<OutboundMessage>,
    event_rx: Mutex<mpsc::Receiver<LiveEvent>>,
    session_id: String,
}

impl GeminiLiveTransport {
    fn spawn(ws_stream: WsStream, session_id: String) -> Self {
        let (ws_sender, ws_receiver) = ws_stream.split();

        let (outbound_tx, outbound_rx) = mpsc::channel::<OutboundMessage>(256);
        let (event_tx, event_rx) = mpsc::channel::<LiveEvent>(256);

        let sid_out = session_id.clone();
        tokio::spawn(async move {
            outbound_loop(outbound_rx, ws_sender, sid_out).await;
        });

        let sid_in = session_id.clone();
        tokio::spawn(async move {
            inbound_loop(ws_receiver, event_tx, sid_in).await;
        });

        Self {
            outbound_tx,
            event_rx: Mutex::new(event_rx),
            session_id,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

#[async_trait]
impl LiveTransport for GeminiLiveTransport {
    async fn send_audio(&self, blob: AudioBlob) -> Result<(), LiveError> {
        if blob.data.as_str().is_empty() {
            return Ok(());
        }
        self.outbound_tx
            .send(OutboundMessage::Audio(blob))
            .await
            .map_err(|_| LiveError::Transport("Audio channel closed".into()))
    }

    async fn recv_event(&self) -> Option<LiveEvent> {
        self.event_rx.lock().await.recv().await
    }

    async fn close(&self) -> Result<(), LiveError> {
        // Outbound loop already gone means the socket is already closed.
        let _ = self.outbound_tx.send(OutboundMessage::Close).await;
        Ok(())
    }
}

/// Outbound loop: encode frames and write them to the socket.
async fn outbound_loop(
    mut rx: mpsc::Receiver<OutboundMessage>,
    mut ws_sender: WsSink,
    session_id: String,
) {
    let mut audio_chunk_count: u64 = 0;

    while let Some(msg) = rx.recv().await {
        match msg {
            OutboundMessage::Audio(blob) => {
                audio_chunk_count += 1;
                let json = match serde_json::to_string(&build_audio_message(&blob)) {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::error!(session_id = %session_id, error = %e, "Failed to serialize audio message");
                        continue;
                    }
                };
                if audio_chunk_count == 1 || audio_chunk_count.is_multiple_of(50) {
                    tracing::info!(
                        session_id = %session_id,
                        chunk = audio_chunk_count,
                        json_len = json.len(),
                        "Sending audio chunk to Gemini"
                    );
                }
                if ws_sender.send(WsMessage::text(json)).await.is_err() {
                    tracing::warn!(session_id = %session_id, "WebSocket send failed, closing outbound loop");
                    break;
                }
            }
            OutboundMessage::Close => {
                if let Ok(json) = serde_json::to_string(&build_audio_stream_end_message()) {
                    let _ = ws_sender.send(WsMessage::text(json)).await;
                }
                let _ = ws_sender.send(WsMessage::Close(None)).await;
                break;
            }
        }
    }

    tracing::debug!(session_id = %session_id, chunks = audio_chunk_count, "Outbound loop terminated");
}

/// Per-session counters for inbound logging.
struct InboundStats {
    started: Instant,
    audio_chunks: u64,
    turns: u64,
}

impl InboundStats {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            audio_chunks: 0,
            turns: 0,
        }
    }

    fn record(&mut self, event: &LiveEvent, session_id: &str) {
        let t = format!("{:.1}s", self.started.elapsed().as_secs_f32());
        match event {
            LiveEvent::AudioData { data } => {
                self.audio_chunks += 1;
                tracing::debug!(
                    session_id = %session_id,
                    t = %t,
                    audio_n = self.audio_chunks,
                    b64_len = data.as_str().len(),
                    "⬇ Gemini audio response"
                );
            }
            LiveEvent::TurnComplete => {
                self.turns += 1;
                tracing::info!(
                    session_id = %session_id,
                    t = %t,
                    turn = self.turns,
                    audio_chunks = self.audio_chunks,
                    "⬇ Turn complete"
                );
            }
            LiveEvent::Transcription { text, is_user } => {
                tracing::debug!(session_id = %session_id, t = %t, is_user, text = %text, "⬇ Transcription");
            }
            LiveEvent::Interrupted => {
                tracing::info!(session_id = %session_id, t = %t, "⬇ Interrupted");
            }
            LiveEvent::Error { details } => {
                tracing::warn!(session_id = %session_id, t = %t, details = %details, "⬇ Server error");
            }
            LiveEvent::Close => {}
        }
    }
}

/// Inbound loop: parse server frames and forward events.
///
/// Always finishes with exactly one [`LiveEvent::Close`] unless the event
/// receiver was dropped first.
async fn inbound_loop(
    mut ws_receiver: WsSource,
    event_tx: mpsc::Sender<LiveEvent>,
    session_id: String,
) {
    let mut stats = InboundStats::new();

    while let Some(msg_result) = ws_receiver.next().await {
        let msg = match msg_result {
            Ok(msg) => msg,
            Err(e) => {
                tracing::error!(session_id = %session_id, error = %e, "Gemini Live WebSocket error");
                let _ = event_tx
                    .send(LiveEvent::Error {
                        details: format!("WebSocket error: {e}"),
                    })
                    .await;
                break;
            }
        };

        if let WsMessage::Close(frame) = &msg {
            tracing::info!(session_id = %session_id, close_frame = ?frame, "Gemini Live connection closed");
            break;
        }

        let Some(text) = frame_json(&msg) else {
            if let WsMessage::Binary(data) = &msg {
                if !data.is_empty() {
                    tracing::warn!(
                        session_id = %session_id,
                        len = data.len(),
                        "Unexpected non-JSON binary frame from Gemini Live, skipping"
                    );
                }
            }
            continue;
        };

        for event in parse_server_message(text) {
            stats.record(&event, &session_id);
            if event_tx.send(event).await.is_err() {
                tracing::debug!(session_id = %session_id, "Event receiver dropped, closing inbound loop");
                return;
            }
        }
    }

    let _ = event_tx.send(LiveEvent::Close).await;
    tracing::debug!(session_id = %session_id, turns = stats.turns, "Inbound loop terminated");
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::codec::encode_frame;
    use tokio::net::TcpListener;

    fn setup() -> LiveSetup {
        LiveSetup {
            model: "gemini-2.5-flash-native-audio-preview-09-2025".into(),
            voice_name: "Puck".into(),
            system_prompt: "You are Bill.".into(),
            input_sample_rate: 16_000,
            input_transcription: true,
            output_transcription: true,
        }
    }

    #[test]
    fn setup_message_declares_audio_voice_and_transcription() {
        let json = serde_json::to_value(build_setup_message(&setup())).unwrap();

        assert_eq!(
            json["setup"]["model"],
            "models/gemini-2.5-flash-native-audio-preview-09-2025"
        );
        assert_eq!(json["setup"]["generationConfig"]["responseModalities"][0], "AUDIO");
        assert_eq!(
            json["setup"]["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]
                ["voiceName"],
            "Puck"
        );
        assert_eq!(json["setup"]["systemInstruction"]["parts"][0]["text"], "You are Bill.");
        assert!(json["setup"]["inputAudioTranscription"].is_object());
        assert!(json["setup"]["outputAudioTranscription"].is_object());
    }

    #[test]
    fn setup_message_omits_disabled_parts() {
        let mut s = setup();
        s.model = "models/custom".into();
        s.system_prompt.clear();
        s.input_transcription = false;
        let json = serde_json::to_string(&build_setup_message(&s)).unwrap();

        assert!(json.contains("\"models/custom\""));
        assert!(!json.contains("systemInstruction"));
        assert!(!json.contains("inputAudioTranscription"));
        assert!(json.contains("outputAudioTranscription"));
    }

    #[test]
    fn audio_message_wraps_blob() {
        let blob = AudioBlob::pcm(EncodedChunk::from_bytes(&[0, 1, 2, 3]), 16_000);
        let json = serde_json::to_value(build_audio_message(&blob)).unwrap();
        let chunk = &json["realtimeInput"]["mediaChunks"][0];
        assert_eq!(chunk["mimeType"], "audio/pcm;rate=16000");
        assert_eq!(chunk["data"], blob.data.as_str());
    }

    #[test]
    fn audio_stream_end_has_no_payload() {
        let json = serde_json::to_string(&build_audio_stream_end_message()).unwrap();
        assert_eq!(json, r#"{"realtimeInput":{"audioStreamEnd":true}}"#);
    }

    #[test]
    fn parse_audio_response() {
        let json = r#"{"serverContent": {"modelTurn": {"parts": [{"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "AAAB"}}]}}}"#;
        let events = parse_server_message(json);
        assert_eq!(
            events,
            vec![LiveEvent::AudioData {
                data: EncodedChunk::new("AAAB")
            }]
        );
    }

    #[test]
    fn parse_nested_and_top_level_transcriptions() {
        let nested = r#"{"serverContent": {"inputTranscription": {"text": "Γεια"}}}"#;
        assert_eq!(
            parse_server_message(nested),
            vec![LiveEvent::Transcription {
                text: "Γεια".into(),
                is_user: true
            }]
        );

        let top = r#"{"outputTranscription": {"text": "Hello"}}"#;
        assert_eq!(
            parse_server_message(top),
            vec![LiveEvent::Transcription {
                text: "Hello".into(),
                is_user: false
            }]
        );
    }

    #[test]
    fn parse_orders_text_before_turn_complete() {
        let json = r#"{"serverContent": {"outputTranscription": {"text": "bye"}, "turnComplete": true}}"#;
        assert_eq!(
            parse_server_message(json),
            vec![
                LiveEvent::Transcription {
                    text: "bye".into(),
                    is_user: false
                },
                LiveEvent::TurnComplete
            ]
        );
    }

    #[test]
    fn parse_puts_interrupted_before_new_user_speech() {
        let json = r#"{"serverContent": {"interrupted": true, "inputTranscription": {"text": "wait"}}}"#;
        assert_eq!(
            parse_server_message(json),
            vec![
                LiveEvent::Interrupted,
                LiveEvent::Transcription {
                    text: "wait".into(),
                    is_user: true
                }
            ]
        );
    }

    #[test]
    fn parse_interrupted() {
        let events = parse_server_message(r#"{"serverContent": {"interrupted": true}}"#);
        assert_eq!(events, vec![LiveEvent::Interrupted]);
    }

    #[test]
    fn parse_error_and_garbage() {
        let events = parse_server_message(r#"{"error": {"message": "Rate limit exceeded"}}"#);
        assert!(matches!(&events[0], LiveEvent::Error { details } if details.contains("Rate limit")));

        let events = parse_server_message("not json at all");
        assert!(matches!(&events[0], LiveEvent::Error { .. }));
    }

    #[test]
    fn parse_ignores_empty_transcription_and_setup_complete() {
        assert!(parse_server_message(r#"{"inputTranscription": {"text": ""}}"#).is_empty());
        assert!(parse_server_message(r#"{"setupComplete": {}}"#).is_empty());
    }

    async fn local_server() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/", listener.local_addr().unwrap());
        (listener, url)
    }

    #[tokio::test]
    async fn connect_streams_audio_and_events_over_websocket() {
        let (listener, url) = local_server().await;
        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();

            let setup_frame = ws.next().await.unwrap().unwrap();
            let setup: serde_json::Value =
                serde_json::from_str(setup_frame.to_text().unwrap()).unwrap();
            assert_eq!(setup["setup"]["generationConfig"]["responseModalities"][0], "AUDIO");

            ws.send(WsMessage::binary(br#"{"setupComplete": {}}"#.to_vec()))
                .await
                .unwrap();

            let audio_frame = ws.next().await.unwrap().unwrap();
            let audio: serde_json::Value =
                serde_json::from_str(audio_frame.to_text().unwrap()).unwrap();
            assert_eq!(
                audio["realtimeInput"]["mediaChunks"][0]["mimeType"],
                "audio/pcm;rate=16000"
            );

            ws.send(WsMessage::binary(
                br#"{"serverContent": {"inputTranscription": {"text": "hi"}}}"#.to_vec(),
            ))
            .await
            .unwrap();
            ws.send(WsMessage::text(r#"{"serverContent": {"turnComplete": true}}"#))
                .await
                .unwrap();
            ws.close(None).await.unwrap();
        });

        let connector = GeminiLiveConnector::new("test-key").with_endpoint(url);
        let transport = connector.connect("s1", &setup()).await.unwrap();
        transport
            .send_audio(AudioBlob::pcm(encode_frame(&[0.0; 8]), 16_000))
            .await
            .unwrap();

        assert_eq!(
            transport.recv_event().await,
            Some(LiveEvent::Transcription {
                text: "hi".into(),
                is_user: true
            })
        );
        assert_eq!(transport.recv_event().await, Some(LiveEvent::TurnComplete));
        assert_eq!(transport.recv_event().await, Some(LiveEvent::Close));

        server.await.unwrap();
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn connect_fails_when_server_closes_before_setup_complete() {
        let (listener, url) = local_server().await;
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let _ = ws.next().await;
            let _ = ws.close(None).await;
        });

        let connector = GeminiLiveConnector::new("k").with_endpoint(url);
        let err = match connector.connect("s2", &setup()).await {
            Err(e) => e,
            Ok(_) => panic!("connect should fail"),
        };
        assert!(matches!(err, LiveError::Transport(_)));
    }

    #[tokio::test]
    async fn connect_times_out_without_setup_complete() {
        let (listener, url) = local_server().await;
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let _ = ws.next().await;
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let connector = GeminiLiveConnector::new("k")
            .with_endpoint(url)
            .with_setup_timeout(Duration::from_millis(100));
        let err = match connector.connect("s3", &setup()).await {
            Err(e) => e,
            Ok(_) => panic!("connect should time out"),
        };
        assert!(err.to_string().contains("timeout"));
    }
}
