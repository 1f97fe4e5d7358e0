//! Live voice pipeline for Bill AI.
//!
//! Streams microphone audio to the Gemini Live API and plays the spoken
//! replies back without gaps, with barge-in and live transcripts.
//!
//! ## Design
//! - Codec adapter between float samples, PCM16LE and base64 (`codec`)
//! - Fixed-size capture framing with deferred, ordered sending (`capture`)
//! - Cursor-based gapless playback with interruption (`playback`)
//! - Session state machine and event dispatch (`session`)
//! - Transport trait plus the Gemini Live WebSocket client (`transport`, `gemini_live`)
//! - Device traits and a software timeline mixer (`device`), with an
//!   optional cpal backend behind the `audio-device` feature

pub mod capture;
pub mod codec;
pub mod device;
#[cfg(feature = "audio-device")]
pub mod device_cpal;
pub mod error;
pub mod gemini_live;
pub mod playback;
pub mod session;
pub mod transport;

// ── Shared live event type ───────────────────────────────────────

/// Event produced by a live transport and consumed by the session controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveEvent {
    /// Spoken reply chunk (base64 PCM16LE, 24kHz mono).
    AudioData { data: codec::EncodedChunk },
    /// The user started speaking over the model.
    Interrupted,
    /// Partial transcription of either side of the conversation.
    Transcription { text: String, is_user: bool },
    /// Model finished a response turn.
    TurnComplete,
    /// The remote channel closed.
    Close,
    /// Error reported by the remote side.
    Error { details: String },
}

#[allow(unused_imports)]
pub use codec::{decode_chunk, encode_frame, AudioBlob, AudioBuffer, AudioFrame, EncodedChunk};
#[allow(unused_imports)]
pub use device::{AudioInput, AudioOutput, AudioOutputFactory, CaptureStream, Mixer};
#[allow(unused_imports)]
pub use error::{AudioError, LiveError};
#[allow(unused_imports)]
pub use gemini_live::GeminiLiveConnector;
#[allow(unused_imports)]
pub use playback::{PlaybackScheduler, PlaybackSource};
#[allow(unused_imports)]
pub use session::{LiveSessionConfig, LiveSessionController, SessionState, TranscriptSnapshot};
#[allow(unused_imports)]
pub use transport::{LiveConnector, LiveSetup, LiveTransport};
