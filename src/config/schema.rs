//! Configuration schema, deserialized from `config.toml`.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::voice::capture::{DEFAULT_CAPTURE_RATE, DEFAULT_FRAME_SIZE};
use crate::voice::playback::DEFAULT_PLAYBACK_RATE;
use crate::voice::session::LiveSessionConfig;
use crate::voice::transport::LiveSetup;

/// Persona prompt shared by the chat and live sessions.
pub const DEFAULT_SYSTEM_PROMPT: &str = "Το όνομά σου είναι Bill. Είσαι ένας ευγενικός, έξυπνος και φιλικός AI βοηθός. Απαντάς πάντα στα Ελληνικά εκτός αν σου ζητηθεί κάτι άλλο. Χρησιμοποιείς Markdown για τη μορφοποίηση.";

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct Config {
    /// Gemini API key. `GEMINI_API_KEY` / `API_KEY` take precedence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default)]
    pub live: LiveConfig,

    #[serde(default)]
    pub chat: ChatConfig,
}

/// `[live]` section: voice session settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct LiveConfig {
    #[serde(default = "default_live_model")]
    pub model: String,

    /// Prebuilt voice for spoken replies.
    #[serde(default = "default_voice_name")]
    pub voice_name: String,

    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    /// Microphone rate sent to the service, in Hz.
    #[serde(default = "default_input_sample_rate")]
    pub input_sample_rate: u32,

    /// Rate of the spoken replies, in Hz.
    #[serde(default = "default_output_sample_rate")]
    pub output_sample_rate: u32,

    /// Samples per capture frame.
    #[serde(default = "default_frame_size")]
    pub frame_size: usize,

    #[serde(default = "default_true")]
    pub input_transcription: bool,

    #[serde(default = "default_true")]
    pub output_transcription: bool,

    /// Seconds to wait for the service to acknowledge setup.
    #[serde(default = "default_setup_timeout_secs")]
    pub setup_timeout_secs: u64,

    /// Override for the Live WebSocket endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

/// `[chat]` section: text chat settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ChatConfig {
    #[serde(default = "default_chat_model")]
    pub model: String,

    /// API base URL, without the `/v1beta` path.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    /// Token budget for deep thinking.
    #[serde(default = "default_thinking_budget")]
    pub thinking_budget: u32,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_live_model() -> String {
    "gemini-2.5-flash-native-audio-preview-09-2025".into()
}

fn default_voice_name() -> String {
    "Puck".into()
}

fn default_system_prompt() -> String {
    DEFAULT_SYSTEM_PROMPT.into()
}

fn default_input_sample_rate() -> u32 {
    DEFAULT_CAPTURE_RATE
}

fn default_output_sample_rate() -> u32 {
    DEFAULT_PLAYBACK_RATE
}

fn default_frame_size() -> usize {
    DEFAULT_FRAME_SIZE
}

fn default_true() -> bool {
    true
}

fn default_setup_timeout_secs() -> u64 {
    15
}

fn default_chat_model() -> String {
    "gemini-3-flash-preview".into()
}

fn default_base_url() -> String {
    "https://generativelanguage.googleapis.com".into()
}

fn default_thinking_budget() -> u32 {
    4000
}

fn default_request_timeout_secs() -> u64 {
    120
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            model: default_live_model(),
            voice_name: default_voice_name(),
            system_prompt: default_system_prompt(),
            input_sample_rate: default_input_sample_rate(),
            output_sample_rate: default_output_sample_rate(),
            frame_size: default_frame_size(),
            input_transcription: true,
            output_transcription: true,
            setup_timeout_secs: default_setup_timeout_secs(),
            endpoint: None,
        }
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            model: default_chat_model(),
            base_url: default_base_url(),
            system_prompt: default_system_prompt(),
            thinking_budget: default_thinking_budget(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl LiveConfig {
    pub fn setup(&self) -> LiveSetup {
        LiveSetup {
            model: self.model.clone(),
            voice_name: self.voice_name.clone(),
            system_prompt: self.system_prompt.clone(),
            input_sample_rate: self.input_sample_rate,
            input_transcription: self.input_transcription,
            output_transcription: self.output_transcription,
        }
    }

    pub fn session_config(&self) -> LiveSessionConfig {
        let mut config = LiveSessionConfig::new(self.setup());
        config.frame_size = self.frame_size;
        config.output_sample_rate = self.output_sample_rate;
        config
    }
}
