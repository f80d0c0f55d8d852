//! Configuration types (§A.3 of SPEC_FULL.md).
//!
//! Nested `#[serde(default)]` structs, each with an `impl Default` carrying
//! the literal constants the specification hard-codes, so that a
//! zero-config run reproduces specified behavior exactly. Loaded from an
//! optional TOML file; a missing file falls back to defaults, a malformed
//! one is a `GatewayError::Config`.

use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Root configuration object.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct GatewayConfig {
    pub bridge: BridgeConfig,
    pub sink: SinkConfig,
    pub orchestrator: OrchestratorConfig,
    pub llm: LlmConfig,
    pub channel_manager: ChannelManagerConfig,
}

impl GatewayConfig {
    /// Load from a TOML file, falling back to defaults if it does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|e| GatewayError::Config(format!("{path:?}: {e}")))
    }
}

/// Bridge Client configuration (§4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub url: String,
    pub connect_timeout_secs: u64,
    /// `wait_ready` timeout (§4.5 step 6).
    pub ready_timeout_secs: u64,
    /// Reconnect backoff base (`BASE` in `min(BASE · 2^attempts, MAX)`).
    pub reconnect_base_secs: u64,
    /// Reconnect backoff cap.
    pub reconnect_max_secs: u64,
    /// `play()` await timeout for the matching `play_done` event.
    pub play_done_timeout_secs: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:7777".to_string(),
            connect_timeout_secs: 10,
            ready_timeout_secs: 15,
            reconnect_base_secs: 2,
            reconnect_max_secs: 60,
            play_done_timeout_secs: 30,
        }
    }
}

impl BridgeConfig {
    pub fn reconnect_base(&self) -> Duration {
        Duration::from_secs(self.reconnect_base_secs)
    }
    pub fn reconnect_max(&self) -> Duration {
        Duration::from_secs(self.reconnect_max_secs)
    }
}

/// Streaming Sink configuration (§4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    /// RMS threshold while the bot is not playing.
    pub silence_threshold: f64,
    /// RMS threshold while the bot is playing (echo suppression).
    pub playback_speech_threshold: f64,
    /// Streaming-path silence timer before an utterance is finalized.
    pub vad_silence_ms: u64,
    /// Per-user buffer cap, in seconds of 48 kHz stereo audio.
    pub buffer_cap_secs: f64,
    /// Minimum post-downsample utterance length, in bytes.
    pub min_utterance_bytes: usize,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            silence_threshold: 300.0,
            playback_speech_threshold: 1200.0,
            vad_silence_ms: 1000,
            buffer_cap_secs: 120.0,
            min_utterance_bytes: 16_000,
        }
    }
}

/// Pipeline Orchestrator configuration (§4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Forced-split length limit for the sentence splitter.
    pub max_sentence_chars: usize,
    /// Gap left between consecutive sentence playbacks.
    pub sentence_silence_ms: u64,
    /// Member count above which a configured wake-word becomes mandatory
    /// even for authorized users (§4.3 stage 1).
    pub wake_word_member_threshold: usize,
    pub thinking_sound_freq_hz: f32,
    pub thinking_sound_duration_ms: u64,
    pub thinking_sound_sample_rate: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_sentence_chars: 300,
            sentence_silence_ms: 150,
            wake_word_member_threshold: 2,
            thinking_sound_freq_hz: 220.0,
            thinking_sound_duration_ms: 600,
            thinking_sound_sample_rate: 24_000,
        }
    }
}

/// LLM Client configuration (§4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub default_agent_id: String,
    pub request_timeout_secs: u64,
    /// Best-effort timeout for `/compact` at session shutdown (§9, open
    /// question 5: shutdown must never block on backend latency).
    pub compact_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com".to_string(),
            api_key: String::new(),
            model: "gpt-4o-mini".to_string(),
            default_agent_id: String::new(),
            request_timeout_secs: 60,
            compact_timeout_secs: 3,
        }
    }
}

/// Channel Manager configuration (§4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelManagerConfig {
    /// Inactivity timeout once authorized humans remain absent (default 300 s).
    pub inactivity_timeout_secs: u64,
    /// Shorter timeout used when no authorized humans remain at all (30 s).
    pub no_auth_timeout_secs: u64,
    pub auto_join: bool,
}

impl Default for ChannelManagerConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout_secs: 300,
            no_auth_timeout_secs: 30,
            auto_join: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_constants() {
        let cfg = GatewayConfig::default();
        assert_eq!(cfg.sink.silence_threshold, 300.0);
        assert_eq!(cfg.sink.playback_speech_threshold, 1200.0);
        assert_eq!(cfg.sink.min_utterance_bytes, 16_000);
        assert_eq!(cfg.orchestrator.max_sentence_chars, 300);
        assert_eq!(cfg.bridge.reconnect_base_secs, 2);
        assert_eq!(cfg.bridge.reconnect_max_secs, 60);
        assert_eq!(cfg.bridge.ready_timeout_secs, 15);
        assert_eq!(cfg.channel_manager.inactivity_timeout_secs, 300);
        assert_eq!(cfg.channel_manager.no_auth_timeout_secs, 30);
    }

    #[test]
    fn load_missing_file_falls_back_to_default() {
        let cfg = GatewayConfig::load(Path::new("/nonexistent/path/gateway.toml")).unwrap();
        assert_eq!(cfg.sink.silence_threshold, 300.0);
    }

    #[test]
    fn load_malformed_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.toml");
        std::fs::write(&path, "not = [valid toml").unwrap();
        let err = GatewayConfig::load(&path).unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
    }
}
