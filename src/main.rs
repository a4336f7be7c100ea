use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing_subscriber::EnvFilter;

use voice_relay::config::file::config_file_path;
use voice_relay::daemon::build_services;
use voice_relay::protocol::{AudioFormat, AudioMerge};
use voice_relay::{Config, Daemon};

/// Voice relay - real-time voice assistant server with barge-in
#[derive(Parser)]
#[command(name = "voice-relay", version, about)]
struct Cli {
    /// Address to bind the voice socket on
    #[arg(long, env = "VOICE_RELAY_HOST")]
    host: Option<String>,

    /// Voice socket port
    #[arg(short, long, env = "VOICE_RELAY_PORT")]
    port: Option<u16>,

    /// Default audio format for new sessions
    #[arg(long, value_enum, env = "VOICE_RELAY_AUDIO_FORMAT")]
    audio_format: Option<AudioFormat>,

    /// Default sentence audio merging for new sessions
    #[arg(long, value_enum, env = "VOICE_RELAY_AUDIO_MERGE")]
    audio_merge: Option<AudioMerge>,

    /// HTTP API port
    #[arg(long, env = "VOICE_RELAY_API_PORT")]
    api_port: Option<u16>,

    /// Disable the HTTP API
    #[arg(long)]
    no_api: bool,

    /// Config file (defaults to ~/.config/voice-relay/config.toml)
    #[arg(short, long, env = "VOICE_RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Synthesize text with the configured TTS provider into an MP3 file
    TestTts {
        /// Text to speak
        #[arg(default_value = "Hello! This is a test of the text to speech system.")]
        text: String,

        /// Output file
        #[arg(short, long, default_value = "tts-test.mp3")]
        output: PathBuf,
    },
    /// Print the default config file path
    ConfigPath,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info",
        1 => "info,voice_relay=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    if let Some(Command::ConfigPath) = cli.command {
        match config_file_path() {
            Some(path) => println!("{}", path.display()),
            None => anyhow::bail!("could not determine config directory"),
        }
        return Ok(());
    }

    let mut config = Config::load(cli.config.as_deref())?;

    // CLI flags override env and file
    if let Some(host) = cli.host {
        config.listener.host = host;
    }
    if let Some(port) = cli.port {
        config.listener.port = port;
    }
    if let Some(format) = cli.audio_format {
        config.session.defaults.audio_format = format;
    }
    if let Some(merge) = cli.audio_merge {
        config.session.defaults.audio_merge = merge;
    }
    if let Some(port) = cli.api_port {
        config.api_server.port = port;
    }
    if cli.no_api {
        config.api_server.enabled = false;
    }

    if let Some(Command::TestTts { text, output }) = cli.command {
        return test_tts(&config, &text, &output).await;
    }

    Daemon::new(config).run().await?;
    Ok(())
}

async fn test_tts(config: &Config, text: &str, output: &Path) -> anyhow::Result<()> {
    let services = build_services(config)?;

    tracing::info!(text = %text, provider = ?config.tts.provider, "synthesizing");
    let mut chunks = services.synthesizer.synthesize_stream(text).await?;

    let mut file = tokio::fs::File::create(output).await?;
    let mut total = 0;
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk?;
        total += chunk.len();
        file.write_all(&chunk).await?;
    }
    file.flush().await?;

    tracing::info!(bytes = total, path = %output.display(), "audio written");
    Ok(())
}
