//! Inter-stage DTOs passed along the Pipeline Orchestrator's queues (§4.3).
//!
//! Grounded on the small plain-data message types the desktop pipeline used
//! to hand work between its capture/STT/LLM/TTS/playback stages, narrowed
//! here to the four things that actually cross a queue boundary in this
//! gateway: a finalized speech segment bound for STT, a sentence bound for
//! TTS, and the two audio outputs (thinking sound and synthesized speech)
//! bound for playback.

use crate::model::{ConversationState, Epoch};
use crate::wire::AudioFormat;

/// A finalized utterance handed from the Sink to the Orchestrator, already
/// downsampled to 16 kHz mono 16-bit PCM (§4.2, §4.3 stage 3).
#[derive(Debug, Clone)]
pub struct SpeechSegment {
    pub guild_id: String,
    pub user_id: String,
    pub channel_id: String,
    pub pcm_16k_mono: Vec<u8>,
}

/// STT result for one `SpeechSegment` (§4.3 stage 3).
#[derive(Debug, Clone)]
pub struct Transcription {
    pub text: String,
    pub sender_name: Option<String>,
}

/// One sentence queued for synthesis, tagged with the epoch it was produced
/// under so a late-arriving result from a drained turn can be recognized
/// and discarded (§4.3 stage 8, §8 property 2).
#[derive(Debug, Clone)]
pub struct SentenceChunk {
    pub text: String,
    pub sequence: usize,
    pub epoch: u64,
}

/// Synthesized audio queued for playback, carrying the same epoch as the
/// `SentenceChunk` it was produced from.
#[derive(Debug, Clone)]
pub struct SynthesizedAudio {
    pub audio: Vec<u8>,
    pub format: AudioFormat,
    pub sequence: usize,
    pub epoch: u64,
}

impl SynthesizedAudio {
    /// Whether this result is still relevant to play, given the turn's
    /// current epoch (it is not if a barge-in or a new utterance bumped the
    /// epoch after this result was queued for synthesis).
    pub fn is_current(&self, current: &Epoch) -> bool {
        current.is_current(self.epoch)
    }
}

/// A live conversational turn's bookkeeping: which epoch it runs under and
/// the running transcript of deltas emitted so far (used to build the
/// barge-in splice described in §4.4 / §8 property 7).
#[derive(Debug, Clone, Default)]
pub struct TurnState {
    pub epoch: u64,
    pub state: ConversationState,
    pub deltas_so_far: String,
}

impl TurnState {
    pub fn new(epoch: u64) -> Self {
        Self {
            epoch,
            state: ConversationState::Idle,
            deltas_so_far: String::new(),
        }
    }

    pub fn record_delta(&mut self, delta: &str) {
        self.deltas_so_far.push_str(delta);
    }

    /// The raw concatenation of every delta emitted so far this turn, or
    /// `None` if nothing had been emitted yet when the turn was cut off
    /// (§8 property 7). Framing this as an interruption notice is the
    /// caller's job — this is the bare prior-reply text.
    pub fn interrupted_partial(&self) -> Option<String> {
        let trimmed = self.deltas_so_far.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthesized_audio_is_current_only_under_matching_epoch() {
        let epoch = Epoch::default();
        let stale = SynthesizedAudio {
            audio: vec![],
            format: AudioFormat::Wav,
            sequence: 0,
            epoch: epoch.current(),
        };
        assert!(stale.is_current(&epoch));
        epoch.bump();
        assert!(!stale.is_current(&epoch));
    }

    #[test]
    fn interrupted_partial_is_none_when_nothing_spoken_yet() {
        let turn = TurnState::new(0);
        assert!(turn.interrupted_partial().is_none());
    }

    #[test]
    fn interrupted_partial_is_the_raw_delta_concatenation() {
        let mut turn = TurnState::new(0);
        turn.record_delta("The answer is ");
        turn.record_delta("forty-two.");
        assert_eq!(turn.interrupted_partial().unwrap(), "The answer is forty-two.");
    }
}
