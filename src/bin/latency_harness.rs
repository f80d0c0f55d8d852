//! Minimal latency harness: measures bridge-round-trip latency for
//! `play()` calls against a running bridge server, to catch regressions in
//! the WebSocket hop before they show up as user-perceived lag.

use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;
use voice_gateway::config::BridgeConfig;
use voice_gateway::wire::AudioFormat;
use voice_gateway::BridgeClient;

const SAMPLES: usize = 20;
const GUILD: &str = "latency-harness";
const SILENCE_WAV: &[u8] = &[];

#[derive(serde::Serialize)]
struct Report {
    samples: usize,
    min_ms: f64,
    max_ms: f64,
    mean_ms: f64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("voice_gateway=warn")))
        .init();

    let bridge = BridgeClient::new(BridgeConfig::default());
    bridge.start();
    bridge.wait_connected(Duration::from_secs(10)).await?;
    bridge.join(GUILD, "latency-harness-channel", "latency-harness-bot", "latency-harness-session")?;
    bridge.wait_ready(GUILD, Duration::from_secs(10)).await?;

    let mut samples_ms = Vec::with_capacity(SAMPLES);
    for _ in 0..SAMPLES {
        let start = Instant::now();
        bridge.play(GUILD, SILENCE_WAV, AudioFormat::Wav, Duration::from_secs(5)).await?;
        samples_ms.push(start.elapsed().as_secs_f64() * 1000.0);
    }

    bridge.disconnect(GUILD)?;
    bridge.stop().await;

    let report = Report {
        samples: samples_ms.len(),
        min_ms: samples_ms.iter().copied().fold(f64::INFINITY, f64::min),
        max_ms: samples_ms.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        mean_ms: samples_ms.iter().sum::<f64>() / samples_ms.len() as f64,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}
