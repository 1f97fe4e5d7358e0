//! Live session controller: lifecycle state machine and event dispatch.
//!
//! ```text
//! Idle ──start()──▶ Connecting ──connected──▶ Active ──stop()/Close──▶ Closing ──▶ Idle
//!                       │
//!                       └──error / stop()──▶ Idle
//! ```
//!
//! Everything a running session owns (microphone stream, capture forwarder,
//! playback scheduler and output, transport, dispatcher task) lives in one
//! [`LiveSessionHandle`], released in a fixed order by `stop()`.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::capture::{forward_frames, CapturePipeline, TransportSlot, DEFAULT_FRAME_SIZE};
use super::device::{AudioInput, AudioOutputFactory, CaptureStream};
use super::error::LiveError;
use super::playback::{PlaybackScheduler, DEFAULT_PLAYBACK_RATE};
use super::transport::{LiveConnector, LiveSetup, LiveTransport};
use super::LiveEvent;

/// Lifecycle state of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Active,
    Closing,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Connecting => write!(f, "connecting"),
            Self::Active => write!(f, "active"),
            Self::Closing => write!(f, "closing"),
        }
    }
}

/// Settings for one live session.
#[derive(Debug, Clone)]
pub struct LiveSessionConfig {
    pub setup: LiveSetup,
    /// Samples per capture frame.
    pub frame_size: usize,
    /// Rate of the model's audio replies.
    pub output_sample_rate: u32,
}

impl LiveSessionConfig {
    pub fn new(setup: LiveSetup) -> Self {
        Self {
            setup,
            frame_size: DEFAULT_FRAME_SIZE,
            output_sample_rate: DEFAULT_PLAYBACK_RATE,
        }
    }
}

// ── Transcripts ──────────────────────────────────────────────────

/// Point-in-time copy of the current turn's transcripts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TranscriptSnapshot {
    pub user: String,
    pub assistant: String,
}

/// Accumulates partial transcriptions for the current turn.
#[derive(Debug, Default)]
pub struct TranscriptionBuffer {
    user: String,
    assistant: String,
}

impl TranscriptionBuffer {
    pub fn append(&mut self, text: &str, is_user: bool) {
        if is_user {
            self.user.push_str(text);
        } else {
            self.assistant.push_str(text);
        }
    }

    pub fn clear(&mut self) {
        self.user.clear();
        self.assistant.clear();
    }

    pub fn snapshot(&self) -> TranscriptSnapshot {
        TranscriptSnapshot {
            user: self.user.clone(),
            assistant: self.assistant.clone(),
        }
    }
}

// ── Session handle ───────────────────────────────────────────────

/// Every resource held by a running (or half-started) session.
pub struct LiveSessionHandle {
    session_id: String,
    capture: Option<Box<dyn CaptureStream>>,
    forwarder: Option<JoinHandle<()>>,
    playback: Arc<PlaybackScheduler>,
    transport: Option<Arc<dyn LiveTransport>>,
    dispatcher: Option<JoinHandle<()>>,
    slot: watch::Sender<TransportSlot>,
    cancel: CancellationToken,
}

impl LiveSessionHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Tear the session down: capture, forwarder, playback, transport.
    ///
    /// Every step runs even when an earlier one fails. Safe to call twice.
    /// The dispatcher is signalled through the cancellation token but not
    /// awaited, since it may be the task calling this.
    pub async fn release(&mut self) -> Result<(), LiveError> {
        let mut failures = Vec::new();

        if let Some(mut capture) = self.capture.take() {
            if let Err(e) = capture.stop() {
                failures.push(format!("capture: {e}"));
            }
        }

        self.cancel.cancel();
        self.slot.send_replace(None);
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }

        if let Err(e) = self.playback.close() {
            failures.push(format!("playback: {e}"));
        }

        if let Some(transport) = self.transport.take() {
            if let Err(e) = transport.close().await {
                failures.push(format!("transport: {e}"));
            }
        }
        self.dispatcher.take();

        if failures.is_empty() {
            tracing::info!(session_id = %self.session_id, "Live session released");
            Ok(())
        } else {
            tracing::warn!(
                session_id = %self.session_id,
                failures = ?failures,
                "Live session teardown partially failed"
            );
            Err(LiveError::TeardownPartialFailure { failures })
        }
    }
}

impl Drop for LiveSessionHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ── Controller ───────────────────────────────────────────────────

struct Inner {
    config: LiveSessionConfig,
    connector: Arc<dyn LiveConnector>,
    input: Arc<dyn AudioInput>,
    output: Arc<dyn AudioOutputFactory>,
    state: watch::Sender<SessionState>,
    /// Token of a start still in `Connecting`. Locked together with state
    /// reads in `stop()` so a cancel can't slip past `Connecting → Active`.
    pending: Mutex<Option<CancellationToken>>,
    handle: tokio::sync::Mutex<Option<LiveSessionHandle>>,
    playback: Mutex<Option<Arc<PlaybackScheduler>>>,
    transcript: Mutex<TranscriptionBuffer>,
    session_id: Mutex<Option<String>>,
    last_error: Mutex<Option<String>>,
}

/// Owns the live session lifecycle. Cheap to clone.
#[derive(Clone)]
pub struct LiveSessionController {
    inner: Arc<Inner>,
}

impl LiveSessionController {
    pub fn new(
        config: LiveSessionConfig,
        connector: Arc<dyn LiveConnector>,
        input: Arc<dyn AudioInput>,
        output: Arc<dyn AudioOutputFactory>,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            inner: Arc::new(Inner {
                config,
                connector,
                input,
                output,
                state,
                pending: Mutex::new(None),
                handle: tokio::sync::Mutex::new(None),
                playback: Mutex::new(None),
                transcript: Mutex::new(TranscriptionBuffer::default()),
                session_id: Mutex::new(None),
                last_error: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    /// Watch lifecycle transitions.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub fn transcript(&self) -> TranscriptSnapshot {
        self.inner.transcript.lock().snapshot()
    }

    /// Last error reported by the remote side or the teardown path.
    pub fn last_error(&self) -> Option<String> {
        self.inner.last_error.lock().clone()
    }

    /// Id of the current or most recent session.
    pub fn session_id(&self) -> Option<String> {
        self.inner.session_id.lock().clone()
    }

    /// Start a session. Only `Idle` accepts a start.
    pub async fn start(&self) -> Result<(), LiveError> {
        let cancel = CancellationToken::new();
        let claimed = {
            let mut pending = self.inner.pending.lock();
            let claimed = self.inner.state.send_if_modified(|state| {
                if *state == SessionState::Idle {
                    *state = SessionState::Connecting;
                    true
                } else {
                    false
                }
            });
            if claimed {
                *pending = Some(cancel.clone());
            }
            claimed
        };
        if !claimed {
            return Err(LiveError::SessionAlreadyRunning);
        }

        let session_id = Uuid::new_v4().to_string();
        *self.inner.session_id.lock() = Some(session_id.clone());
        *self.inner.last_error.lock() = None;
        self.inner.transcript.lock().clear();

        tracing::info!(session_id = %session_id, model = %self.inner.config.setup.model, "Starting live session");

        let handle = match Inner::open_session(&self.inner, &session_id, cancel.clone()).await {
            Ok(handle) => handle,
            Err(e) => {
                *self.inner.pending.lock() = None;
                self.inner.playback.lock().take();
                self.inner.state.send_replace(SessionState::Idle);
                tracing::warn!(session_id = %session_id, error = %e, "Live session failed to start");
                return Err(e);
            }
        };

        *self.inner.handle.lock().await = Some(handle);

        let activated = {
            let mut pending = self.inner.pending.lock();
            *pending = None;
            if cancel.is_cancelled() {
                false
            } else {
                self.inner.state.send_replace(SessionState::Active);
                true
            }
        };

        if activated {
            tracing::info!(session_id = %session_id, "Live session active");
            return Ok(());
        }

        // stop() landed between connect and activation.
        self.inner.playback.lock().take();
        if let Some(mut handle) = self.inner.handle.lock().await.take() {
            if let Err(e) = handle.release().await {
                tracing::warn!(session_id = %session_id, error = %e, "Cleanup after cancelled start");
            }
        }
        self.inner.state.send_replace(SessionState::Idle);
        Err(LiveError::Cancelled)
    }

    /// Stop the session. A no-op when idle or already closing.
    pub async fn stop(&self) -> Result<(), LiveError> {
        self.inner.stop().await
    }

    /// Apply one transport event to the session.
    pub async fn dispatch(&self, event: LiveEvent) {
        self.inner.dispatch(event).await;
    }
}

impl Inner {
    /// Acquire microphone, output and transport, in that order.
    ///
    /// On failure everything acquired so far is released before returning.
    async fn open_session(
        this: &Arc<Self>,
        session_id: &str,
        cancel: CancellationToken,
    ) -> Result<LiveSessionHandle, LiveError> {
        let input_rate = this.config.setup.input_sample_rate;

        let (pipeline, frames) = CapturePipeline::new(this.config.frame_size);
        let capture = this.input.open(input_rate, pipeline.into_callback())?;
        tracing::debug!(session_id = %session_id, rate = input_rate, "Microphone open");

        let (slot, slot_rx) = watch::channel::<TransportSlot>(None);
        let forwarder = tokio::spawn(forward_frames(
            frames,
            slot_rx,
            input_rate,
            cancel.clone(),
            session_id.to_string(),
        ));

        let output = match this.output.open(this.config.output_sample_rate) {
            Ok(output) => Some(output),
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "No playback output, replies will not be heard");
                None
            }
        };
        let playback = Arc::new(PlaybackScheduler::new(
            output,
            this.config.output_sample_rate,
            1,
        ));

        let mut handle = LiveSessionHandle {
            session_id: session_id.to_string(),
            capture: Some(capture),
            forwarder: Some(forwarder),
            playback: Arc::clone(&playback),
            transport: None,
            dispatcher: None,
            slot,
            cancel: cancel.clone(),
        };

        let connected = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(LiveError::Cancelled),
            result = this.connector.connect(session_id, &this.config.setup) => result,
        };
        let transport = match connected {
            Ok(transport) => transport,
            Err(e) => {
                if let Err(release_err) = handle.release().await {
                    tracing::warn!(session_id = %session_id, error = %release_err, "Cleanup after failed start");
                }
                return Err(e);
            }
        };

        handle.transport = Some(Arc::clone(&transport));
        handle.slot.send_replace(Some(Arc::clone(&transport)));
        // Published before the dispatcher runs so the first reply chunk has a scheduler.
        *this.playback.lock() = Some(playback);
        handle.dispatcher = Some(tokio::spawn(run_dispatcher(
            Arc::downgrade(this),
            transport,
            cancel,
            session_id.to_string(),
        )));

        Ok(handle)
    }

    async fn stop(&self) -> Result<(), LiveError> {
        {
            let pending = self.pending.lock();
            let state = *self.state.borrow();
            match state {
                SessionState::Idle | SessionState::Closing => return Ok(()),
                SessionState::Connecting => {
                    if let Some(token) = pending.as_ref() {
                        token.cancel();
                    }
                    return Ok(());
                }
                SessionState::Active => {
                    self.state.send_replace(SessionState::Closing);
                }
            }
        }

        let handle = self.handle.lock().await.take();
        self.playback.lock().take();

        let result = match handle {
            Some(mut handle) => handle.release().await,
            None => Ok(()),
        };
        if let Err(e) = &result {
            *self.last_error.lock() = Some(e.to_string());
        }

        self.state.send_replace(SessionState::Idle);
        tracing::info!(session_id = ?self.session_id.lock().as_deref(), "Live session stopped");
        result
    }

    async fn dispatch(&self, event: LiveEvent) {
        match event {
            LiveEvent::AudioData { data } => {
                let playback = self.playback.lock().clone();
                let Some(playback) = playback else {
                    tracing::debug!("Audio data with no running session, dropping");
                    return;
                };
                match playback.enqueue(&data) {
                    Ok(_) => {}
                    Err(LiveError::PlaybackDeviceUnavailable(reason)) => {
                        tracing::debug!(reason = %reason, "Skipping playback");
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Dropping audio chunk");
                    }
                }
            }
            LiveEvent::Interrupted => {
                let playback = self.playback.lock().clone();
                if let Some(playback) = playback {
                    playback.interrupt();
                }
                self.transcript.lock().clear();
            }
            LiveEvent::Transcription { text, is_user } => {
                self.transcript.lock().append(&text, is_user);
            }
            LiveEvent::TurnComplete => {
                self.transcript.lock().clear();
            }
            LiveEvent::Close => {
                if *self.state.borrow() == SessionState::Active {
                    tracing::info!("Remote side closed the live session");
                    *self.last_error.lock() = Some(LiveError::ChannelClosedUnexpectedly.to_string());
                }
                if let Err(e) = self.stop().await {
                    tracing::warn!(error = %e, "Teardown after remote close");
                }
            }
            LiveEvent::Error { details } => {
                tracing::error!(details = %details, "Live session error from server");
                *self.last_error.lock() = Some(details);
            }
        }
    }
}

/// Pump transport events into the controller until close or cancellation.
async fn run_dispatcher(
    inner: Weak<Inner>,
    transport: Arc<dyn LiveTransport>,
    cancel: CancellationToken,
    session_id: String,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = transport.recv_event() => event.unwrap_or(LiveEvent::Close),
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let closing = event == LiveEvent::Close;
        inner.dispatch(event).await;
        if closing {
            break;
        }
    }
    tracing::debug!(session_id = %session_id, "Event dispatcher stopped");
}
