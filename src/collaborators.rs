//! Contracts for external collaborators (§6.1).
//!
//! These are out of scope to implement (the spec treats them as already
//! existing elsewhere): the platform voice gateway, the ASR model, the TTS
//! synthesizer, the wake-word model, and the auth/routing store. We specify
//! only the trait boundary the core consumes, grounded on the
//! `async_trait`-based collaborator interfaces elsewhere in the pack
//! (`ChannelAdapter` in the discord channel adapter).

use crate::error::Result;
use async_trait::async_trait;

/// Speech-to-text collaborator: `transcribe(pcm16_mono_16khz) -> string`.
#[async_trait]
pub trait SpeechToText: Send + Sync {
    /// Transcribe 16 kHz mono 16-bit PCM, with a language hint. Must perform
    /// internal VAD and language-conditioned decoding; an empty result is a
    /// valid response, not an error.
    async fn transcribe(&self, pcm16_mono_16khz: &[u8], language_hint: Option<&str>) -> Result<String>;

    /// Eagerly load whatever model state is needed, so the first real
    /// transcription is not slowed by lazy initialization (§9, §4.5 step 4).
    async fn warm_up(&self) -> Result<()>;
}

/// Parameters that may steer synthesis for a given speaker.
#[derive(Debug, Clone, Default)]
pub struct TtsOptions {
    pub provider: Option<String>,
    pub voice_id: Option<String>,
    pub model: Option<String>,
}

/// Text-to-speech collaborator: `synthesize(text, opts?) -> wav_bytes`.
///
/// Implementations MUST strip markdown and emoji before synthesis (the
/// Orchestrator forwards the LLM's raw text unmodified so that logging and
/// interruption-context reconstruction keep the original); they MAY trim
/// leading silence from the returned WAV when configured to.
#[async_trait]
pub trait TextToSpeech: Send + Sync {
    async fn synthesize(&self, text: &str, opts: Option<TtsOptions>) -> Result<Vec<u8>>;
    async fn warm_up(&self) -> Result<()>;
}

/// Wake-word collaborator: stateful single-shot detector.
#[async_trait]
pub trait WakeWord: Send + Sync {
    async fn detect(&self, pcm16_mono_16khz: &[u8]) -> Result<bool>;
    /// Reset internal state after a positive detection.
    async fn reset(&self);
    /// Load weights ahead of first use (§4.5 step 4).
    async fn warm_up(&self) -> Result<()>;
}

/// A speaker's role and per-user overrides, as read from the auth/routing
/// store (read-mostly key-value over guild/channel/user).
#[derive(Debug, Clone, Default)]
pub struct UserAuth {
    pub authorized: bool,
    pub agent_id: Option<String>,
    pub voice_override: Option<String>,
}

/// Auth / routing store collaborator.
#[async_trait]
pub trait AuthStore: Send + Sync {
    async fn lookup(&self, guild: &str, channel: &str, user: &str) -> Result<UserAuth>;
    /// Whether wake-word is required for unauthorized speakers in this guild.
    async fn require_wake_word_for_unauthorized(&self, guild: &str) -> Result<bool>;
    /// Configured wake-word phrase for this guild, if any.
    async fn wake_word_phrase(&self, guild: &str) -> Result<Option<String>>;
    /// Whether the store holds no entries at all for this guild, i.e. auth
    /// is simply unconfigured rather than "nobody is authorized" (§4.6
    /// leave rules distinguish the two).
    async fn is_empty(&self, guild: &str) -> Result<bool>;
}

/// Read-only view of who is actually sitting in a voice channel right now,
/// for the Channel Manager's join/follow/leave decisions (§4.6).
#[async_trait]
pub trait MembershipView: Send + Sync {
    /// Non-bot members currently in `channel`.
    async fn human_count(&self, guild: &str, channel: &str) -> Result<usize>;
    /// Of those, how many are authorized per the auth store.
    async fn authorized_human_count(&self, guild: &str, channel: &str) -> Result<usize>;
}

/// The chat platform's own voice gateway (distinct from the bridge's
/// WebSocket): requests a channel join and surfaces the raw
/// `voice_state_update`/`voice_server_update` event bodies the Session
/// Controller must forward to the bridge (§4.5 step 5).
#[async_trait]
pub trait PlatformVoice: Send + Sync {
    /// Request the join and wait for both credential events to arrive.
    async fn join_and_await_credentials(
        &self,
        guild: &str,
        channel: &str,
    ) -> Result<(serde_json::Value, serde_json::Value)>;

    /// Re-send a voice-state change to follow the bot to a new channel
    /// within the same guild, without a full rejoin (§4.5 "Move-to-channel").
    async fn move_to_channel(&self, guild: &str, channel: &str) -> Result<()>;

    async fn disconnect(&self, guild: &str) -> Result<()>;
}
