use std::process::ExitCode;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::io::AsyncReadExt;
use tracing_subscriber::EnvFilter;

use voicelink::config::{Config, ListeningMode};
use voicelink::protocol::FrameDecoder;
use voicelink::session::{AbortReason, Session};
use voicelink::{Daemon, TcpTransport, VoiceLink};

/// Voicelink - serial companion-module core for voice assistant devices
#[derive(Parser)]
#[command(name = "voicelink", version, about)]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long, env = "VOICELINK_CONFIG")]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon against a serial-to-TCP bridge
    Run {
        /// Bridge address, host:port
        #[arg(env = "VOICELINK_ADDR", default_value = "127.0.0.1:7777")]
        addr: String,
    },
    /// Decode a hex-encoded byte capture and print the frames
    Probe {
        /// Hex bytes, whitespace ignored (e.g. "aa55 0001 8001 4a cb")
        hex: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info,voicelink=info",
        1 => "info,voicelink=debug",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    match cli.command {
        Command::Run { addr } => run_daemon(config, &addr).await,
        Command::Probe { hex } => probe(&hex),
    }
}

async fn run_daemon(config: Config, addr: &str) -> anyhow::Result<()> {
    tracing::info!(addr, mode = ?config.link.mode, "connecting to serial bridge");
    let stream = tokio::net::TcpStream::connect(addr).await?;
    let (mut reader, writer) = stream.into_split();

    let transport = TcpTransport::new(writer);
    let (link, link_events) = VoiceLink::new(transport, config.link.clone());

    // Receive loop: pull from the bridge, feed the frame codec
    {
        let link = Arc::clone(&link);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) => {
                        tracing::warn!("serial bridge closed the connection");
                        return;
                    }
                    Ok(n) => link.on_receive(&buf[..n]).await,
                    Err(e) => {
                        tracing::error!(error = %e, "serial bridge read failed");
                        return;
                    }
                }
            }
        });
    }

    let session = Arc::new(ConsoleSession);
    let daemon = Daemon::new(link, link_events, session, config);
    let handle = daemon.handle();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.post(voicelink::AppEvent::Shutdown);
        }
    });

    tracing::info!("voicelink ready");
    daemon.run().await;
    Ok(())
}

/// Decode a hex capture offline.
fn probe(input: &str) -> anyhow::Result<()> {
    let cleaned: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = hex::decode(&cleaned)?;

    let mut decoder = FrameDecoder::new();
    let frames = decoder.feed(&bytes);
    for frame in &frames {
        println!(
            "cmd {:04x} ({:?}) payload {} bytes: {}",
            frame.cmd,
            frame.command(),
            frame.payload.len(),
            hex::encode(&frame.payload)
        );
    }
    println!("{} frame(s), {} byte(s) pending", frames.len(), decoder.pending());
    Ok(())
}

/// Session backend that logs instead of talking to a server, for bench runs
/// where only the module side is under test.
struct ConsoleSession;

#[async_trait::async_trait]
impl Session for ConsoleSession {
    async fn open_audio_channel(&self) -> voicelink::Result<()> {
        tracing::info!("session: audio channel opened");
        Ok(())
    }

    async fn close_audio_channel(&self) {
        tracing::info!("session: audio channel closed");
    }

    async fn is_audio_channel_open(&self) -> bool {
        true
    }

    async fn send_audio(&self, chunk: Vec<u8>) -> voicelink::Result<()> {
        tracing::trace!(len = chunk.len(), "session: audio chunk");
        Ok(())
    }

    async fn send_wake_word_detected(&self, wake_word: &str) -> voicelink::Result<()> {
        tracing::info!(wake_word, "session: wake word detected");
        Ok(())
    }

    async fn send_start_listening(&self, mode: ListeningMode) -> voicelink::Result<()> {
        tracing::info!(?mode, "session: start listening");
        Ok(())
    }

    async fn send_stop_listening(&self) -> voicelink::Result<()> {
        tracing::info!("session: stop listening");
        Ok(())
    }

    async fn send_abort(&self, reason: AbortReason) -> voicelink::Result<()> {
        tracing::info!(?reason, "session: abort");
        Ok(())
    }
}
