//! Bill AI: a Gemini-backed assistant with text chat and a real-time
//! live voice session.
//!
//! - [`voice`]: microphone capture, Gemini Live transport, gapless playback
//!   and the session state machine
//! - [`chat`]: conversation model and the `generateContent` client
//! - [`config`]: `config.toml` schema and loading

pub mod chat;
pub mod config;
pub mod voice;
