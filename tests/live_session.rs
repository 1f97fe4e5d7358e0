//! End-to-end live session against a local WebSocket server speaking the
//! Gemini Live protocol.

use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use billai::config::LiveConfig;
use billai::voice::device::SampleCallback;
use billai::voice::{
    AudioFrame, AudioInput, AudioOutput, AudioOutputFactory, CaptureStream, GeminiLiveConnector,
    LiveError, LiveSessionController, Mixer, SessionState,
};

#[derive(Default)]
struct SharedMic {
    callback: Mutex<Option<SampleCallback>>,
    stopped: Arc<AtomicBool>,
}

impl SharedMic {
    fn speak(&self, samples: &[f32]) {
        if let Some(callback) = self.callback.lock().as_mut() {
            callback(samples);
        }
    }
}

struct MicStream(Arc<AtomicBool>);

impl CaptureStream for MicStream {
    fn stop(&mut self) -> Result<(), LiveError> {
        self.0.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl AudioInput for SharedMic {
    fn open(
        &self,
        _sample_rate: u32,
        on_samples: SampleCallback,
    ) -> Result<Box<dyn CaptureStream>, LiveError> {
        *self.callback.lock() = Some(on_samples);
        Ok(Box::new(MicStream(Arc::clone(&self.stopped))))
    }
}

#[derive(Default)]
struct MixerOutputs(Mutex<Option<Mixer>>);

impl AudioOutputFactory for MixerOutputs {
    fn open(&self, sample_rate: u32) -> Result<Arc<dyn AudioOutput>, LiveError> {
        let mixer = Mixer::new(sample_rate);
        *self.0.lock() = Some(mixer.clone());
        Ok(Arc::new(mixer))
    }
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..400 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

/// Accepts one client, answers its first audio frame, then closes on signal.
async fn serve_one_turn(
    listener: TcpListener,
    audio_seen: mpsc::UnboundedSender<serde_json::Value>,
    close_rx: oneshot::Receiver<()>,
) {
    let (tcp, _) = listener.accept().await.unwrap();
    let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();

    let setup = ws.next().await.unwrap().unwrap();
    assert!(setup.to_text().unwrap().contains("\"setup\""));
    ws.send(WsMessage::binary(br#"{"setupComplete":{}}"#.to_vec()))
        .await
        .unwrap();

    loop {
        let frame = ws.next().await.unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_str(frame.to_text().unwrap()).unwrap();
        if value.pointer("/realtimeInput/mediaChunks").is_some() {
            audio_seen.send(value).unwrap();
            break;
        }
    }

    let reply = AudioFrame::new(vec![800; 2400], 24_000, 1).unwrap().encode();
    let turn = serde_json::json!({
        "serverContent": {
            "inputTranscription": { "text": "hello" },
            "outputTranscription": { "text": "Γεια" },
            "modelTurn": { "parts": [{ "inlineData": {
                "mimeType": "audio/pcm;rate=24000",
                "data": reply.as_str()
            }}]}
        }
    });
    ws.send(WsMessage::text(turn.to_string())).await.unwrap();

    let _ = close_rx.await;
    let _ = ws.close(None).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn live_turn_round_trips_through_websocket() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = format!("ws://{}/", listener.local_addr().unwrap());
    let (audio_tx, mut audio_rx) = mpsc::unbounded_channel();
    let (close_tx, close_rx) = oneshot::channel();
    let server = tokio::spawn(serve_one_turn(listener, audio_tx, close_rx));

    let mic = Arc::new(SharedMic::default());
    let outputs = Arc::new(MixerOutputs::default());
    let connector = GeminiLiveConnector::new("test-key").with_endpoint(endpoint);
    let controller = LiveSessionController::new(
        LiveConfig::default().session_config(),
        Arc::new(connector),
        mic.clone(),
        outputs.clone(),
    );

    controller.start().await.unwrap();
    assert_eq!(controller.state(), SessionState::Active);

    // 4096 silent samples delivered over uneven device callbacks: one frame.
    for chunk in [1000usize, 1000, 1000, 1000, 96] {
        mic.speak(&vec![0.0; chunk]);
    }

    let sent = tokio::time::timeout(Duration::from_secs(5), audio_rx.recv())
        .await
        .unwrap()
        .unwrap();
    let media = &sent["realtimeInput"]["mediaChunks"][0];
    assert_eq!(media["mimeType"], "audio/pcm;rate=16000");
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(media["data"].as_str().unwrap())
        .unwrap();
    assert_eq!(bytes.len(), 8192);
    assert!(bytes.iter().all(|&b| b == 0));

    let mixer = outputs.0.lock().clone().unwrap();
    assert!(eventually(|| mixer.pending_sources() == 1).await);
    assert!(eventually(|| controller.transcript().assistant == "Γεια").await);
    assert_eq!(controller.transcript().user, "hello");

    close_tx.send(()).unwrap();
    let mut states = controller.subscribe();
    tokio::time::timeout(
        Duration::from_secs(5),
        states.wait_for(|s| *s == SessionState::Idle),
    )
    .await
    .unwrap()
    .unwrap();

    assert!(mic.stopped.load(Ordering::SeqCst));
    assert!(mixer.is_closed());
    assert!(controller.last_error().is_some());
    server.await.unwrap();
}

#[tokio::test]
async fn unreachable_endpoint_leaves_controller_idle() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = format!("ws://{}/", listener.local_addr().unwrap());
    drop(listener);

    let mic = Arc::new(SharedMic::default());
    let controller = LiveSessionController::new(
        LiveConfig::default().session_config(),
        Arc::new(GeminiLiveConnector::new("k").with_endpoint(endpoint)),
        mic.clone(),
        Arc::new(MixerOutputs::default()),
    );

    let err = controller.start().await.unwrap_err();
    assert!(matches!(err, LiveError::Transport(_)));
    assert_eq!(controller.state(), SessionState::Idle);
    assert!(mic.stopped.load(Ordering::SeqCst));
}
