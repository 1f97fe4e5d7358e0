use anyhow::Context;
use base64::Engine;
use clap::{ArgAction, Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use billai::chat::{ChatClient, ChatSession, GenerationOptions, Message};
use billai::config::Config;

#[derive(Debug, Parser)]
#[command(name = "billai", version, about = "Bill AI: chat and live voice with Gemini")]
struct Cli {
    /// Path to config.toml (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Talk to Bill through the default microphone and speaker
    Live,
    /// Send one chat message and print the answer
    Chat {
        prompt: String,
        /// Ground the answer with Google Search
        #[arg(long)]
        search: bool,
        /// Enable deep thinking
        #[arg(long)]
        think: bool,
        /// Attach an image file
        #[arg(long)]
        image: Option<PathBuf>,
    },
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigCommand,
    },
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Print the effective configuration (API key masked)
    Show,
    /// Print the JSON Schema of config.toml
    Schema,
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "billai=info",
        1 => "billai=debug",
        _ => "billai=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    // tokio-tungstenite's rustls backend needs a process-wide crypto provider.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Command::Live => live::run(&config).await,
        Command::Chat {
            prompt,
            search,
            think,
            image,
        } => {
            let options = GenerationOptions {
                use_search: search,
                use_deep_thinking: think,
            };
            run_chat(&config, prompt, options, image.as_deref()).await
        }
        Command::Config { action } => {
            match action {
                ConfigCommand::Show => print!("{}", config.to_redacted_toml()?),
                ConfigCommand::Schema => println!("{}", Config::json_schema()?),
            }
            Ok(())
        }
    }
}

async fn run_chat(
    config: &Config,
    prompt: String,
    options: GenerationOptions,
    image: Option<&Path>,
) -> anyhow::Result<()> {
    let client = ChatClient::new(config.require_api_key()?, &config.chat)?;

    let mut message = Message::user(prompt);
    if let Some(path) = image {
        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed to read image {}", path.display()))?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
        message = message.with_attachment(format!("data:{};base64,{encoded}", image_mime(path)));
    }

    let mut session = ChatSession::new();
    let reply = session.exchange(&client, message, &options).await?;

    println!("{}", reply.content);
    if !reply.sources.is_empty() {
        println!();
        for (i, source) in reply.sources.iter().enumerate() {
            println!("[{}] {} <{}>", i + 1, source.title, source.uri);
        }
    }
    Ok(())
}

fn image_mime(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        _ => "image/jpeg",
    }
}

#[cfg(feature = "audio-device")]
mod live {
    use std::sync::Arc;
    use std::time::Duration;

    use billai::config::Config;
    use billai::voice::device_cpal::{CpalInput, CpalOutputFactory};
    use billai::voice::{GeminiLiveConnector, LiveSessionController, SessionState, TranscriptSnapshot};

    pub async fn run(config: &Config) -> anyhow::Result<()> {
        let mut connector = GeminiLiveConnector::new(config.require_api_key()?)
            .with_setup_timeout(Duration::from_secs(config.live.setup_timeout_secs));
        if let Some(endpoint) = &config.live.endpoint {
            connector = connector.with_endpoint(endpoint.clone());
        }

        let controller = LiveSessionController::new(
            config.live.session_config(),
            Arc::new(connector),
            Arc::new(CpalInput),
            Arc::new(CpalOutputFactory),
        );
        controller.start().await?;
        println!("Live session started. Talk to Bill, Ctrl-C to stop.");

        let mut states = controller.subscribe();
        let mut ticker = tokio::time::interval(Duration::from_millis(250));
        let mut shown = TranscriptSnapshot::default();
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                changed = states.changed() => {
                    if changed.is_err() || *states.borrow() == SessionState::Idle {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let current = controller.transcript();
                    if current != shown {
                        if !current.user.is_empty() && current.user != shown.user {
                            println!("You:  {}", current.user);
                        }
                        if !current.assistant.is_empty() && current.assistant != shown.assistant {
                            println!("Bill: {}", current.assistant);
                        }
                        shown = current;
                    }
                }
            }
        }

        controller.stop().await?;
        if let Some(err) = controller.last_error() {
            eprintln!("Session ended: {err}");
        }
        Ok(())
    }
}

#[cfg(not(feature = "audio-device"))]
mod live {
    use billai::config::Config;

    pub async fn run(_config: &Config) -> anyhow::Result<()> {
        anyhow::bail!("billai was built without audio devices; rebuild with `--features audio-device`")
    }
}
