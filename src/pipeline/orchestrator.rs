//! Pipeline Orchestrator (§4.3): auth/wake-word gate → thinking sound → STT
//! → LLM stream → sentence splitter → two-queue TTS/playback hand-off.
//!
//! Grounded on the producer/consumer worker-task split used for the local
//! chat pipeline's synthesis-ahead-of-playback stage, generalized to this
//! specification's single-flight-per-session run lock, epoch-gated
//! stale-echo detection, and barge-in state machine (§4.4).

use super::messages;
use super::sentence::SentenceSplitter;
use crate::bridge::BridgeClient;
use crate::collaborators::{AuthStore, SpeechToText, TextToSpeech, WakeWord};
use crate::config::OrchestratorConfig;
use crate::error::Result;
use crate::llm::LlmClient;
use crate::model::{user_session_id, ConversationState, UserKey, Utterance};
use crate::sink::Sink;
use crate::wire::AudioFormat;
use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use messages::{SentenceChunk, SynthesizedAudio, TurnState};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::warn;

enum SentenceCmd {
    Sentence(SentenceChunk),
    Done,
}

enum AudioCmd {
    Audio(SynthesizedAudio),
    Done,
}

struct Inner {
    config: OrchestratorConfig,
    bridge: BridgeClient,
    sink: Sink,
    stt: Arc<dyn SpeechToText>,
    tts: Arc<dyn TextToSpeech>,
    wake_word: Option<Arc<dyn WakeWord>>,
    auth_store: Arc<dyn AuthStore>,
    llm: Arc<LlmClient>,
    guild_id: String,
    channel_id: String,
    play_timeout: Duration,
    member_count: Arc<dyn Fn() -> usize + Send + Sync>,
    session_ids: Arc<Mutex<HashMap<UserKey, String>>>,
    thinking_sound: Vec<u8>,
    run_lock: tokio::sync::Mutex<()>,
    interrupted: AtomicBool,
    interrupted_partial: Mutex<Option<String>>,
    state: Mutex<ConversationState>,
}

/// One guild's STT→LLM→TTS→playback pipeline, run at most once
/// concurrently (§4.3 "single-flight per session").
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: OrchestratorConfig,
        bridge: BridgeClient,
        sink: Sink,
        stt: Arc<dyn SpeechToText>,
        tts: Arc<dyn TextToSpeech>,
        wake_word: Option<Arc<dyn WakeWord>>,
        auth_store: Arc<dyn AuthStore>,
        llm: Arc<LlmClient>,
        guild_id: String,
        channel_id: String,
        play_timeout: Duration,
        member_count: Arc<dyn Fn() -> usize + Send + Sync>,
        session_ids: Arc<Mutex<HashMap<UserKey, String>>>,
    ) -> Result<Self> {
        let thinking_sound = crate::audio::generate_thinking_sound_wav(
            config.thinking_sound_freq_hz,
            config.thinking_sound_duration_ms,
            config.thinking_sound_sample_rate,
        )?;
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                bridge,
                sink,
                stt,
                tts,
                wake_word,
                auth_store,
                llm,
                guild_id,
                channel_id,
                play_timeout,
                member_count,
                session_ids,
                thinking_sound,
                run_lock: tokio::sync::Mutex::new(()),
                interrupted: AtomicBool::new(false),
                interrupted_partial: Mutex::new(None),
                state: Mutex::new(ConversationState::Idle),
            }),
        })
    }

    pub fn state(&self) -> ConversationState {
        *self.inner.state.lock().unwrap()
    }

    fn set_state(&self, s: ConversationState) {
        *self.inner.state.lock().unwrap() = s;
    }

    /// Stable per-user LLM session-id, shared with the owning `Session` so
    /// its stop-time compaction loop (§4.5) covers every user who actually
    /// spoke (§3 invariant 4, §8 property 8).
    fn session_id_for(&self, user: &str) -> String {
        let mut ids = self.inner.session_ids.lock().unwrap();
        ids.entry(user.to_string())
            .or_insert_with(|| user_session_id(&self.inner.guild_id, &self.inner.channel_id, user))
            .clone()
    }

    /// Adapter handed to `Sink::new` so a dispatched utterance runs the
    /// full pipeline as its own independent task.
    pub fn as_sink_callback(&self) -> impl Fn(Utterance) -> BoxFuture<'static, ()> + Send + Sync + 'static {
        let this = self.clone();
        move |utterance: Utterance| {
            let this = this.clone();
            Box::pin(async move { this.run(utterance).await }) as BoxFuture<'static, ()>
        }
    }

    /// Called from the bridge's `speaking_start` callback and from the
    /// segmented audio path when loud speech arrives during playback
    /// (§4.4). Idempotent per run: the flag is set at most once and
    /// cleared only when the next run starts.
    pub fn trigger_barge_in(&self) {
        if self.inner.interrupted.swap(true, Ordering::SeqCst) {
            return;
        }
        self.set_state(ConversationState::Interrupted);
        let _ = self.inner.bridge.stop_playing(&self.inner.guild_id, true);
    }

    /// Session-stop teardown: stop any in-flight playback and mark the
    /// session's conversation state terminal.
    pub fn stop(&self) {
        self.inner.interrupted.store(true, Ordering::SeqCst);
        self.set_state(ConversationState::Stopped);
        let _ = self.inner.bridge.stop_playing(&self.inner.guild_id, false);
    }

    fn stop_thinking_sound(&self) {
        let _ = self.inner.bridge.stop_playing(&self.inner.guild_id, false);
    }

    async fn run(&self, utterance: Utterance) {
        // A new utterance arriving while a reply is in flight is itself a
        // barge-in signal on the segmented path (§4.4).
        if matches!(self.state(), ConversationState::Streaming | ConversationState::Speaking) {
            self.trigger_barge_in();
        }

        let _guard = self.inner.run_lock.lock().await;
        self.inner.interrupted.store(false, Ordering::SeqCst);
        self.set_state(ConversationState::Stt);

        // Stage 1: auth and wake-word gate.
        let auth = match self
            .inner
            .auth_store
            .lookup(&self.inner.guild_id, &self.inner.channel_id, &utterance.user)
            .await
        {
            Ok(a) => a,
            Err(e) => {
                warn!(error = %e, "auth store lookup failed");
                self.set_state(ConversationState::Idle);
                return;
            }
        };

        let needs_wake_word = if !auth.authorized {
            self.inner
                .auth_store
                .require_wake_word_for_unauthorized(&self.inner.guild_id)
                .await
                .unwrap_or(false)
        } else {
            let members = (self.inner.member_count)();
            let has_wake_word = self
                .inner
                .auth_store
                .wake_word_phrase(&self.inner.guild_id)
                .await
                .ok()
                .flatten()
                .is_some();
            members > self.inner.config.wake_word_member_threshold && has_wake_word
        };

        if needs_wake_word {
            let Some(wake_word) = self.inner.wake_word.as_ref() else {
                self.set_state(ConversationState::Idle);
                return; // required but absent: fast reject (§4.3 stage 1)
            };
            match wake_word.detect(&utterance.pcm).await {
                Ok(true) => wake_word.reset().await,
                _ => {
                    self.set_state(ConversationState::Idle);
                    return;
                }
            }
        }

        // Stage 2: thinking sound.
        if let Err(e) = self.inner.bridge.play_looping(&self.inner.guild_id, &self.inner.thinking_sound, AudioFormat::Wav) {
            warn!(error = %e, "failed to start thinking sound");
        }

        // Stage 3: STT, gated by the epoch captured at dispatch time so a
        // stale echo from before the last `drain()` never reaches the LLM
        // (§8 property 2, scenario S4).
        if !self.inner.sink.epoch().is_current(utterance.epoch) {
            self.stop_thinking_sound();
            self.set_state(ConversationState::Idle);
            return;
        }
        let text = match self.inner.stt.transcribe(&utterance.pcm, None).await {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "STT failed");
                self.stop_thinking_sound();
                self.set_state(ConversationState::Idle);
                return;
            }
        };
        if text.chars().filter(|c| !c.is_whitespace()).count() < 2 {
            self.stop_thinking_sound();
            self.set_state(ConversationState::Idle);
            return;
        }

        // Stage 4: interruption-context splice. `interrupted_partial` holds
        // the raw concatenation of last turn's deltas (§8 property 7); this
        // is the only place that wraps it into a preamble for the model.
        let prior_partial = self.inner.interrupted_partial.lock().unwrap().take();
        let user_text = match prior_partial {
            Some(partial) => format!(
                "(You were interrupted before finishing your last reply. What you had said so far: \"{partial}\") {text}"
            ),
            None => text,
        };

        // Stage 5: raise the echo-suppression threshold for the duration
        // of this reply.
        self.inner.sink.set_playback_active(true);
        self.set_state(ConversationState::Streaming);

        // Stage 6: two-queue decoupled synthesis/playback.
        let (sentence_tx, sentence_rx) = mpsc::unbounded_channel::<SentenceCmd>();
        let (audio_tx, audio_rx) = mpsc::unbounded_channel::<AudioCmd>();

        let tts_handle = tokio::spawn(self.clone().tts_worker(sentence_rx, audio_tx));
        let play_handle = tokio::spawn(self.clone().play_worker(audio_rx));

        let session_id = self.session_id_for(&utterance.user);
        let agent_id = auth.agent_id.clone();
        let turn_epoch = self.inner.sink.epoch().current();
        let mut turn = TurnState::new(turn_epoch);
        let mut splitter = SentenceSplitter::new(self.inner.config.max_sentence_chars);
        let mut sequence = 0usize;

        let mut stream = Box::pin(self.inner.llm.stream(session_id, user_text, None, agent_id));
        while let Some(delta) = stream.next().await {
            turn.record_delta(&delta);
            for sentence in splitter.push(&delta) {
                sequence += 1;
                let _ = sentence_tx.send(SentenceCmd::Sentence(SentenceChunk {
                    text: sentence,
                    sequence,
                    epoch: turn_epoch,
                }));
            }
            if self.inner.interrupted.load(Ordering::SeqCst) {
                break; // stage 8: stop reading further deltas
            }
        }

        if self.inner.interrupted.load(Ordering::SeqCst) {
            *self.inner.interrupted_partial.lock().unwrap() = turn.interrupted_partial();
        } else if let Some(residual) = splitter.finish() {
            sequence += 1;
            let _ = sentence_tx.send(SentenceCmd::Sentence(SentenceChunk {
                text: residual,
                sequence,
                epoch: turn_epoch,
            }));
        }
        let _ = sentence_tx.send(SentenceCmd::Done);
        drop(sentence_tx);

        let _ = tts_handle.await;
        let _ = play_handle.await;

        self.inner.sink.set_playback_active(false);
        if !self.inner.interrupted.load(Ordering::SeqCst) {
            self.set_state(ConversationState::Idle);
        }
    }

    async fn tts_worker(self, mut sentence_rx: mpsc::UnboundedReceiver<SentenceCmd>, audio_tx: mpsc::UnboundedSender<AudioCmd>) {
        while let Some(cmd) = sentence_rx.recv().await {
            let chunk = match cmd {
                SentenceCmd::Done => break,
                SentenceCmd::Sentence(chunk) => chunk,
            };
            if self.inner.interrupted.load(Ordering::SeqCst) {
                break; // discard remaining queued sentences (§4.4, scenario S3)
            }
            match self.inner.tts.synthesize(&chunk.text, None).await {
                Ok(audio) => {
                    let _ = audio_tx.send(AudioCmd::Audio(SynthesizedAudio {
                        audio,
                        format: AudioFormat::Wav,
                        sequence: chunk.sequence,
                        epoch: chunk.epoch,
                    }));
                }
                Err(e) => warn!(error = %e, sequence = chunk.sequence, "TTS synthesis failed; dropping sentence"),
            }
        }
        let _ = audio_tx.send(AudioCmd::Done);
    }

    async fn play_worker(self, mut audio_rx: mpsc::UnboundedReceiver<AudioCmd>) {
        let mut thinking_stopped = false;
        while let Some(cmd) = audio_rx.recv().await {
            let synth = match cmd {
                AudioCmd::Done => break,
                AudioCmd::Audio(synth) => synth,
            };
            if self.inner.interrupted.load(Ordering::SeqCst) {
                break; // discard queued audio (scenario S3)
            }
            if !thinking_stopped {
                self.stop_thinking_sound();
                thinking_stopped = true;
            }
            self.set_state(ConversationState::Speaking);
            if let Err(e) = self
                .inner
                .bridge
                .play(&self.inner.guild_id, &synth.audio, synth.format, self.inner.play_timeout)
                .await
            {
                warn!(error = %e, sequence = synth.sequence, "play failed; stopping this turn's playback");
                break;
            }
            self.inner.sink.drain();
            tokio::time::sleep(Duration::from_millis(self.inner.config.sentence_silence_ms)).await;
        }
        if !thinking_stopped {
            self.stop_thinking_sound();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{TtsOptions, UserAuth};
    use crate::config::{BridgeConfig, SinkConfig};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct EchoStt;
    #[async_trait]
    impl SpeechToText for EchoStt {
        async fn transcribe(&self, _pcm: &[u8], _lang: Option<&str>) -> Result<String> {
            Ok("hello there".to_string())
        }
        async fn warm_up(&self) -> Result<()> {
            Ok(())
        }
    }

    struct SilentTts;
    #[async_trait]
    impl TextToSpeech for SilentTts {
        async fn synthesize(&self, _text: &str, _opts: Option<TtsOptions>) -> Result<Vec<u8>> {
            crate::audio::generate_thinking_sound_wav(220.0, 50, 16_000)
        }
        async fn warm_up(&self) -> Result<()> {
            Ok(())
        }
    }

    struct OpenAuth;
    #[async_trait]
    impl AuthStore for OpenAuth {
        async fn lookup(&self, _g: &str, _c: &str, _u: &str) -> Result<UserAuth> {
            Ok(UserAuth { authorized: true, agent_id: None, voice_override: None })
        }
        async fn require_wake_word_for_unauthorized(&self, _g: &str) -> Result<bool> {
            Ok(false)
        }
        async fn wake_word_phrase(&self, _g: &str) -> Result<Option<String>> {
            Ok(None)
        }
        async fn is_empty(&self, _g: &str) -> Result<bool> {
            Ok(false)
        }
    }

    fn test_orchestrator(bridge: BridgeClient) -> Orchestrator {
        test_orchestrator_with_session_ids(bridge, Arc::new(Mutex::new(HashMap::new())))
    }

    fn test_orchestrator_with_session_ids(bridge: BridgeClient, session_ids: Arc<Mutex<HashMap<UserKey, String>>>) -> Orchestrator {
        let sink = Sink::new(SinkConfig::default(), |_u| Box::pin(async {}));
        let llm = Arc::new(LlmClient::new(crate::config::LlmConfig::default()));
        Orchestrator::new(
            OrchestratorConfig::default(),
            bridge,
            sink,
            Arc::new(EchoStt),
            Arc::new(SilentTts),
            None,
            Arc::new(OpenAuth),
            llm,
            "g1".into(),
            "c1".into(),
            Duration::from_secs(5),
            Arc::new(|| 1usize),
            session_ids,
        )
        .unwrap()
    }

    #[test]
    fn starts_idle() {
        let bridge = BridgeClient::new(BridgeConfig::default());
        let orch = test_orchestrator(bridge);
        assert_eq!(orch.state(), ConversationState::Idle);
    }

    #[test]
    fn trigger_barge_in_is_idempotent() {
        let bridge = BridgeClient::new(BridgeConfig::default());
        let orch = test_orchestrator(bridge);
        orch.trigger_barge_in();
        assert_eq!(orch.state(), ConversationState::Interrupted);
        let calls = Arc::new(AtomicUsize::new(0));
        // second call must be a no-op per the tie-break rule (§4.4); state
        // stays Interrupted either way so we just assert no panic/flip.
        orch.trigger_barge_in();
        assert_eq!(orch.state(), ConversationState::Interrupted);
        let _ = calls;
    }

    #[test]
    fn stop_sets_terminal_state() {
        let bridge = BridgeClient::new(BridgeConfig::default());
        let orch = test_orchestrator(bridge);
        orch.stop();
        assert_eq!(orch.state(), ConversationState::Stopped);
    }

    #[test]
    fn session_id_for_is_stable_and_recorded_in_the_shared_map() {
        let bridge = BridgeClient::new(BridgeConfig::default());
        let session_ids = Arc::new(Mutex::new(HashMap::new()));
        let orch = test_orchestrator_with_session_ids(bridge, Arc::clone(&session_ids));

        let a = orch.session_id_for("u1");
        let b = orch.session_id_for("u1");
        assert_eq!(a, b);
        assert_eq!(session_ids.lock().unwrap().get("u1"), Some(&a));
    }
}
