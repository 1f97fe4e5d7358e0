pub mod schema;

use anyhow::Context;
use directories::ProjectDirs;
use std::path::{Path, PathBuf};

#[allow(unused_imports)]
pub use schema::{ChatConfig, Config, LiveConfig, DEFAULT_SYSTEM_PROMPT};

/// Environment variables checked for the API key, in priority order.
const API_KEY_VARS: [&str; 2] = ["GEMINI_API_KEY", "API_KEY"];

/// `<platform config dir>/billai/config.toml`, if a home directory exists.
pub fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("ai", "bill", "billai").map(|dirs| dirs.config_dir().join("config.toml"))
}

impl Config {
    /// Load from `path`, or the default location when `None`.
    ///
    /// A missing file yields defaults. Environment overrides are applied last.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = path.map(Path::to_path_buf).or_else(default_config_path);
        let mut config = match &path {
            Some(path) if path.exists() => Self::from_file(path)?,
            _ => Self::default(),
        };
        config.apply_env_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Config = toml::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("Failed to parse config {}: {e}", path.display()))?;
        tracing::debug!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    /// Apply overrides from `lookup` (the process environment in production).
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = API_KEY_VARS
            .iter()
            .filter_map(|name| lookup(name))
            .find(|value| !value.trim().is_empty())
        {
            self.api_key = Some(key.trim().to_string());
        }
    }

    /// API key, or an error naming where to put one.
    pub fn require_api_key(&self) -> anyhow::Result<&str> {
        self.api_key
            .as_deref()
            .filter(|key| !key.is_empty())
            .ok_or_else(|| {
                anyhow::anyhow!("No API key configured; set GEMINI_API_KEY or api_key in config.toml")
            })
    }

    /// Effective config as TOML with the key masked.
    pub fn to_redacted_toml(&self) -> anyhow::Result<String> {
        let mut shown = self.clone();
        if let Some(key) = shown.api_key.as_mut() {
            *key = redact(key);
        }
        toml::to_string_pretty(&shown).context("Failed to serialize config")
    }

    /// JSON Schema of the config file.
    pub fn json_schema() -> anyhow::Result<String> {
        let schema = schemars::schema_for!(Config);
        serde_json::to_string_pretty(&schema).context("Failed to serialize config schema")
    }
}

fn redact(key: &str) -> String {
    let visible: String = key.chars().take(4).collect();
    if key.chars().count() <= 8 {
        "****".into()
    } else {
        format!("{visible}****")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_file_yields_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.api_key.is_none());
        assert_eq!(config.live.input_sample_rate, 16_000);
        assert_eq!(config.live.output_sample_rate, 24_000);
        assert_eq!(config.live.frame_size, 4096);
        assert!(config.live.input_transcription);
        assert_eq!(config.chat.thinking_budget, 4000);
        assert_eq!(config.chat.system_prompt, DEFAULT_SYSTEM_PROMPT);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let toml_str = r#"
api_key = "file-key"

[live]
voice_name = "Kore"
frame_size = 2048

[chat]
model = "gemini-custom"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.api_key.as_deref(), Some("file-key"));
        assert_eq!(config.live.voice_name, "Kore");
        assert_eq!(config.live.frame_size, 2048);
        assert_eq!(config.live.model, LiveConfig::default().model);
        assert_eq!(config.chat.model, "gemini-custom");
        assert_eq!(config.chat.base_url, "https://generativelanguage.googleapis.com");
    }

    #[test]
    fn load_reads_file_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[live]\nsetup_timeout_secs = 3").unwrap();
        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.live.setup_timeout_secs, 3);
    }

    #[test]
    fn load_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(config.live.voice_name, "Puck");
    }

    #[test]
    fn invalid_toml_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[live\nmodel = ").unwrap();
        assert!(Config::from_file(file.path()).is_err());
    }

    #[test]
    fn env_key_overrides_file_key() {
        let mut config = Config {
            api_key: Some("file-key".into()),
            ..Config::default()
        };
        config.apply_env_overrides(|name| match name {
            "GEMINI_API_KEY" => Some("  env-key ".into()),
            "API_KEY" => Some("fallback".into()),
            _ => None,
        });
        assert_eq!(config.api_key.as_deref(), Some("env-key"));
    }

    #[test]
    fn api_key_var_is_fallback_and_blank_is_ignored() {
        let mut config = Config::default();
        config.apply_env_overrides(|name| match name {
            "GEMINI_API_KEY" => Some("   ".into()),
            "API_KEY" => Some("fallback".into()),
            _ => None,
        });
        assert_eq!(config.require_api_key().unwrap(), "fallback");
    }

    #[test]
    fn missing_key_is_reported() {
        assert!(Config::default().require_api_key().is_err());
    }

    #[test]
    fn redacted_toml_hides_key() {
        let config = Config {
            api_key: Some("AIzaSyExampleKey123".into()),
            ..Config::default()
        };
        let shown = config.to_redacted_toml().unwrap();
        assert!(shown.contains("AIza****"));
        assert!(!shown.contains("ExampleKey123"));
        assert!(shown.contains("[live]"));
    }

    #[test]
    fn schema_lists_sections() {
        let schema = Config::json_schema().unwrap();
        assert!(schema.contains("LiveConfig"));
        assert!(schema.contains("thinking_budget"));
    }

    #[test]
    fn live_config_builds_session_config() {
        let live = LiveConfig {
            frame_size: 1024,
            ..LiveConfig::default()
        };
        let session = live.session_config();
        assert_eq!(session.frame_size, 1024);
        assert_eq!(session.output_sample_rate, 24_000);
        assert_eq!(session.setup.voice_name, "Puck");
        assert!(session.setup.output_transcription);
    }
}
