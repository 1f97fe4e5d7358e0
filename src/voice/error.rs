//! Error taxonomy for the live voice pipeline.
//!
//! Only session-start failures reach the caller of
//! [`LiveSessionController::start`](super::session::LiveSessionController::start).
//! Everything else is logged where it happens and the session keeps going.

use thiserror::Error;

/// Codec-level failures. These never end a session; the offending chunk is dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AudioError {
    /// The payload is not valid base64, or its byte length does not split
    /// into whole 16-bit frames for the declared channel count.
    #[error("malformed audio chunk: {reason}")]
    MalformedAudioChunk { reason: String },

    /// Interleaved sample count is not a multiple of the channel count.
    #[error("audio frame of {len} samples is not aligned to {channels} channels")]
    MisalignedFrame { len: usize, channels: u16 },
}

/// Errors surfaced by the live session controller and its collaborators.
#[derive(Debug, Error)]
pub enum LiveError {
    /// Microphone or API authorization refused. Fatal to `start()`.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Decode-time data corruption. Non-fatal.
    #[error(transparent)]
    MalformedAudioChunk(#[from] AudioError),

    /// No usable output device. Playback is skipped, the session continues.
    #[error("playback device unavailable: {0}")]
    PlaybackDeviceUnavailable(String),

    /// The remote channel went away while the session was active.
    #[error("channel closed unexpectedly")]
    ChannelClosedUnexpectedly,

    /// One or more teardown steps failed; the rest still ran.
    #[error("teardown partially failed: {}", failures.join("; "))]
    TeardownPartialFailure { failures: Vec<String> },

    /// Failure on the duplex channel (connect, handshake, send).
    #[error("transport error: {0}")]
    Transport(String),

    /// `start()` was called while a session is connecting, active or closing.
    #[error("a live session is already running")]
    SessionAlreadyRunning,

    /// `stop()` arrived while `start()` was still connecting.
    #[error("session start was cancelled")]
    Cancelled,
}

impl LiveError {
    /// Whether this error should end the session rather than be logged and skipped.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::PermissionDenied(_) | Self::ChannelClosedUnexpectedly | Self::Transport(_)
        )
    }
}
