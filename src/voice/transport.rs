//! Duplex channel to the remote live service.
//!
//! The session controller only sees these traits. The Gemini Live
//! WebSocket client in [`super::gemini_live`] is the production
//! implementation; tests plug in scripted fakes.

use async_trait::async_trait;
use std::sync::Arc;

use super::codec::AudioBlob;
use super::error::LiveError;
use super::LiveEvent;

/// Everything the remote side needs to open a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveSetup {
    /// Model identifier, without the `models/` prefix.
    pub model: String,
    /// Prebuilt voice used for spoken replies.
    pub voice_name: String,
    pub system_prompt: String,
    /// Rate of the PCM frames the client will send.
    pub input_sample_rate: u32,
    /// Ask the service to transcribe the user's speech.
    pub input_transcription: bool,
    /// Ask the service to transcribe its own speech.
    pub output_transcription: bool,
}

/// An open duplex session.
#[async_trait]
pub trait LiveTransport: Send + Sync {
    /// Queue one encoded audio frame for the remote side.
    async fn send_audio(&self, blob: AudioBlob) -> Result<(), LiveError>;

    /// Next inbound event, `None` once the channel is fully drained.
    async fn recv_event(&self) -> Option<LiveEvent>;

    /// Close the channel. Safe to call more than once.
    async fn close(&self) -> Result<(), LiveError>;
}

/// Opens [`LiveTransport`]s.
#[async_trait]
pub trait LiveConnector: Send + Sync {
    async fn connect(
        &self,
        session_id: &str,
        setup: &LiveSetup,
    ) -> Result<Arc<dyn LiveTransport>, LiveError>;
}
