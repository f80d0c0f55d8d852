//! `voice-gateway`: hosts the Bridge Client connection and, once it is up,
//! runs the Channel Manager until told to stop.
//!
//! Only the components this crate actually implements (config, the Bridge
//! Client, the LLM Client) are wired up here. The Discord-side voice
//! credentials handshake, STT, TTS, wake-word, and the auth/routing store
//! are external collaborators (§6.1) supplied by the embedding deployment;
//! this binary is the process that would be handed concrete
//! implementations of those traits in a full deployment.

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;
use voice_gateway::{BridgeClient, GatewayConfig};

/// Full-duplex voice conversation gateway between Discord voice channels
/// and an LLM backend.
#[derive(Parser)]
#[command(name = "voice-gateway", version, about)]
struct Cli {
    /// Path to TOML configuration file.
    #[arg(short, long, default_value = "gateway.toml")]
    config: PathBuf,

    /// Optional directory for a daily-rolling log file, written alongside
    /// the stderr stream rather than instead of it.
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("voice_gateway=info"));
    // The non-blocking worker's guard must live for the whole process; a
    // dropped guard silently stops flushing the file appender.
    let _log_guard = match &cli.log_dir {
        Some(dir) => {
            let (file_writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "voice-gateway.log"));
            tracing_subscriber::fmt().with_env_filter(filter()).with_writer(std::io::stderr.and(file_writer)).init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter()).with_writer(std::io::stderr).init();
            None
        }
    };

    let config = GatewayConfig::load(&cli.config)?;

    tracing::info!(url = %config.bridge.url, "connecting to bridge");
    let bridge = BridgeClient::new(config.bridge.clone());
    bridge.start();

    bridge
        .wait_connected(std::time::Duration::from_secs(config.bridge.connect_timeout_secs))
        .await
        .map_err(|e| anyhow::anyhow!("bridge did not connect within {}s: {e}", config.bridge.connect_timeout_secs))?;
    tracing::info!("bridge connected; awaiting shutdown signal");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    bridge.stop().await;

    Ok(())
}
