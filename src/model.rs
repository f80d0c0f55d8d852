//! Core data-model types shared across the bridge, sink, and pipeline (§3).

use std::sync::atomic::{AtomicU64, Ordering};

/// Opaque identifier of one voice scope (a Discord guild).
pub type GuildKey = String;

/// Opaque identifier of a speaker.
pub type UserKey = String;

/// Opaque identifier of a joinable voice channel.
pub type ChannelKey = String;

/// Stable LLM session key for one speaker, derived deterministically from
/// `(guild, channel, user)`. Created on first utterance from that user and
/// reused across reconnects (§3 invariant 4, §8 property 8).
pub fn user_session_id(guild: &GuildKey, channel: &ChannelKey, user: &UserKey) -> String {
    format!("voice:{guild}:{channel}:{user}")
}

/// Stable per-channel LLM session key used for housekeeping commands
/// (`/new`, `/compact`) that are not tied to a single speaker (§4.5 step 3).
pub fn channel_session_id(guild: &GuildKey, channel: &ChannelKey) -> String {
    format!("voice:{guild}:{channel}")
}

/// Per-Sink monotonic counter identifying the validity window of a
/// `PipelineTask`. Bumped by `drain()`; tasks capture their creation epoch
/// and self-skip their STT/LLM/TTS work if the epoch has since moved on.
#[derive(Debug, Default)]
pub struct Epoch(AtomicU64);

impl Epoch {
    /// Current epoch value.
    pub fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    /// Bump the epoch and return the new value.
    pub fn bump(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Whether `captured` is still the current epoch.
    pub fn is_current(&self, captured: u64) -> bool {
        self.current() == captured
    }
}

/// One completed speech segment from one user, ready for the Orchestrator.
#[derive(Debug, Clone)]
pub struct Utterance {
    pub user: UserKey,
    /// 16 kHz mono 16-bit PCM, little-endian.
    pub pcm: Vec<u8>,
    pub sample_rate: u32,
    /// Epoch captured at dispatch time.
    pub epoch: u64,
}

/// Per-session barge-in / interruption state machine (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConversationState {
    #[default]
    Idle,
    Stt,
    Streaming,
    Speaking,
    Interrupted,
    Stopped,
}
