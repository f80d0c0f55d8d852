//! Session Controller (§4.5): owns one guild's bridge subscription, Sink,
//! Orchestrator, and per-user LLM session-ids, from join through graceful
//! shutdown.
//!
//! Grounded on the start/stop/reconnect lifecycle used for the persistent
//! remote-session handle elsewhere in the pack, generalized here to the
//! warm-up-before-join ordering and compact-on-stop behavior this
//! specification requires.

use crate::bridge::BridgeClient;
use crate::collaborators::{AuthStore, PlatformVoice, SpeechToText, TextToSpeech, WakeWord};
use crate::config::{BridgeConfig, OrchestratorConfig, SinkConfig};
use crate::error::{GatewayError, Result};
use crate::llm::LlmClient;
use crate::model::{channel_session_id, user_session_id, UserKey};
use crate::pipeline::Orchestrator;
use crate::sink::Sink;
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{info, warn};

type SinkCallback = Arc<dyn Fn(crate::model::Utterance) -> BoxFuture<'static, ()> + Send + Sync>;

/// Everything needed to start a Session, gathered up front so the start
/// sequence (§4.5) has no partially-constructed state to unwind.
///
/// Cheap to `Clone`: every field is itself a handle (an `Arc`-backed client
/// or a small config struct), so the Channel Manager keeps one template and
/// clones it per `Session::start` call.
#[derive(Clone)]
pub struct SessionDeps {
    pub bridge: BridgeClient,
    pub stt: Arc<dyn SpeechToText>,
    pub tts: Arc<dyn TextToSpeech>,
    pub wake_word: Option<Arc<dyn WakeWord>>,
    pub auth_store: Arc<dyn AuthStore>,
    pub llm: Arc<LlmClient>,
    pub platform: Arc<dyn PlatformVoice>,
    pub sink_config: SinkConfig,
    pub orchestrator_config: OrchestratorConfig,
    pub bridge_config: BridgeConfig,
    pub member_count: Arc<dyn Fn() -> usize + Send + Sync>,
}

/// One live conversation in one voice channel.
pub struct Session {
    guild_id: String,
    channel_id: String,
    bot_user_id: String,
    channel_session_id: String,
    start_time: Instant,
    is_active: AtomicBool,
    bridge: BridgeClient,
    sink: Sink,
    orchestrator: Orchestrator,
    llm: Arc<LlmClient>,
    platform: Arc<dyn PlatformVoice>,
    user_session_ids: Arc<Mutex<HashMap<UserKey, String>>>,
    voice_credentials: Mutex<Option<(serde_json::Value, serde_json::Value)>>,
    ready_timeout: Duration,
}

impl Session {
    /// Run the full start sequence (§4.5 steps 1-7) and return a session
    /// that is only now "auditorily ready": join handshake complete and
    /// callbacks registered.
    pub async fn start(deps: SessionDeps, guild_id: String, channel_id: String, bot_user_id: String) -> Result<Arc<Self>> {
        // Step 1.
        if !deps.bridge.is_connected() {
            return Err(GatewayError::NotConnected);
        }

        // Step 3.
        let channel_session_id = channel_session_id(&guild_id, &channel_id);

        // Step 4: warm up STT/TTS/wake-word in parallel. Thinking-sound
        // generation is folded into `Orchestrator::new` below, which runs
        // right after this and is cheap, synchronous CPU work.
        let wake_word_for_warmup = deps.wake_word.clone();
        let wake_word_warm: BoxFuture<'static, Result<()>> = match wake_word_for_warmup {
            Some(w) => Box::pin(async move { w.warm_up().await }),
            None => Box::pin(async { Ok(()) }),
        };
        let (stt_result, tts_result, wake_result) =
            tokio::join!(deps.stt.warm_up(), deps.tts.warm_up(), wake_word_warm);
        stt_result?;
        tts_result?;
        wake_result?;

        // Break the Sink/Orchestrator construction cycle: the Sink is built
        // with an indirect callback cell, filled in once the Orchestrator
        // (which needs the Sink) exists.
        let playback_speech_threshold = deps.sink_config.playback_speech_threshold;
        let callback_cell: Arc<Mutex<Option<SinkCallback>>> = Arc::new(Mutex::new(None));
        let cell_for_sink = Arc::clone(&callback_cell);
        let sink = Sink::new(deps.sink_config.clone(), move |utterance| {
            let cell = Arc::clone(&cell_for_sink);
            Box::pin(async move {
                let callback = cell.lock().unwrap().clone();
                match callback {
                    Some(cb) => cb(utterance).await,
                    None => warn!("utterance dispatched before orchestrator wiring completed; dropping"),
                }
            })
        });

        // Shared with the Orchestrator so each utterance's per-user LLM
        // session-id is recorded here as it is minted, letting the
        // stop-time compaction loop (step below) see every user who spoke.
        let user_session_ids: Arc<Mutex<HashMap<UserKey, String>>> = Arc::new(Mutex::new(HashMap::new()));

        let orchestrator = Orchestrator::new(
            deps.orchestrator_config,
            deps.bridge.clone(),
            sink.clone(),
            Arc::clone(&deps.stt),
            Arc::clone(&deps.tts),
            deps.wake_word.clone(),
            Arc::clone(&deps.auth_store),
            Arc::clone(&deps.llm),
            guild_id.clone(),
            channel_id.clone(),
            Duration::from_secs(deps.bridge_config.play_done_timeout_secs),
            Arc::clone(&deps.member_count),
            Arc::clone(&user_session_ids),
        )?;
        *callback_cell.lock().unwrap() = Some(Arc::new(orchestrator.as_sink_callback()));

        // Step 5: request the platform join and capture both voice
        // credential events.
        let (voice_state, voice_server) = deps.platform.join_and_await_credentials(&guild_id, &channel_id).await?;

        // Step 6: join the bridge, forward credentials, await ready.
        deps.bridge.join(&guild_id, &channel_id, &bot_user_id, &channel_session_id)?;
        deps.bridge.send_voice_state_update(voice_state.clone())?;
        deps.bridge.send_voice_server_update(voice_server.clone())?;
        let ready_timeout = Duration::from_secs(deps.bridge_config.ready_timeout_secs);
        deps.bridge.wait_ready(&guild_id, ready_timeout).await?;

        let session = Arc::new(Self {
            guild_id: guild_id.clone(),
            channel_id,
            bot_user_id,
            channel_session_id,
            start_time: Instant::now(),
            is_active: AtomicBool::new(true),
            bridge: deps.bridge.clone(),
            sink,
            orchestrator,
            llm: deps.llm,
            platform: deps.platform,
            user_session_ids,
            voice_credentials: Mutex::new(Some((voice_state, voice_server))),
            ready_timeout,
        });

        // Step 7: register callbacks. The reconnect callback closes over a
        // weak handle so a dropped Session doesn't leak a registration.
        let weak = Arc::downgrade(&session);
        deps.bridge.register_audio_callback(&guild_id, {
            let sink = session.sink.clone();
            move |user_id, pcm| sink.process_segment(&user_id, &pcm)
        });
        deps.bridge.register_speaking_callback(&guild_id, {
            let orchestrator = session.orchestrator.clone();
            move |_user_id, rms| {
                if rms > playback_speech_threshold {
                    orchestrator.trigger_barge_in();
                }
            }
        });
        deps.bridge.register_reconnect_callback(&guild_id, move || {
            if let Some(session) = weak.upgrade() {
                let session = Arc::clone(&session);
                tokio::spawn(async move { session.reconnect().await });
            }
        });

        info!(guild_id = %session.guild_id, channel_id = %session.channel_id, "session started");
        Ok(session)
    }

    pub fn is_active(&self) -> bool {
        self.is_active.load(Ordering::SeqCst)
    }

    pub fn guild_id(&self) -> &str {
        &self.guild_id
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Stable per-user LLM session-id, created at most once per Session
    /// lifetime (§3 invariant 4, §8 property 8).
    pub fn session_id_for(&self, user: &str) -> String {
        let mut ids = self.user_session_ids.lock().unwrap();
        ids.entry(user.to_string())
            .or_insert_with(|| user_session_id(&self.guild_id, &self.channel_id, user))
            .clone()
    }

    /// Bridge reconnect re-handshake (§4.5 "Reconnect").
    async fn reconnect(&self) {
        if !self.is_active() {
            return;
        }
        let credentials = self.voice_credentials.lock().unwrap().clone();
        let Some((voice_state, voice_server)) = credentials else {
            warn!(guild_id = %self.guild_id, "reconnect fired with no cached voice credentials");
            return;
        };
        if let Err(e) = self.bridge.join(&self.guild_id, &self.channel_id, &self.bot_user_id, &self.channel_session_id) {
            warn!(error = %e, "reconnect join failed");
            return;
        }
        let _ = self.bridge.send_voice_state_update(voice_state);
        let _ = self.bridge.send_voice_server_update(voice_server);
        if let Err(e) = self.bridge.wait_ready(&self.guild_id, self.ready_timeout).await {
            warn!(error = %e, "reconnect wait_ready failed");
        }
    }

    /// Follow an authorized user to a new channel within the same guild
    /// (§4.5 "Move-to-channel"): the bridge re-keys under the same guild
    /// scope, so only the platform-level voice state needs to change.
    pub async fn move_to_channel(&self, channel_id: &str) -> Result<()> {
        self.platform.move_to_channel(&self.guild_id, channel_id).await
    }

    /// Stop sequence (§4.5): deactivate, unregister callbacks, allow a
    /// bounded grace period for in-flight PipelineTasks, disconnect both
    /// the bridge and platform layers, then best-effort compact every
    /// per-user history before releasing the LLM client.
    pub async fn stop(&self) {
        self.is_active.store(false, Ordering::SeqCst);
        self.orchestrator.stop();
        self.bridge.unregister_guild(&self.guild_id);

        let deadline = Instant::now() + Duration::from_secs(2);
        while self.sink.pending_task_count() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let _ = self.bridge.stop_playing(&self.guild_id, false);
        let _ = self.bridge.disconnect(&self.guild_id);
        let _ = self.platform.disconnect(&self.guild_id).await;

        let session_ids: Vec<String> = self.user_session_ids.lock().unwrap().values().cloned().collect();
        for session_id in session_ids {
            self.llm.compact(&session_id, None).await;
        }
        self.llm.compact(&self.channel_session_id, None).await;

        info!(guild_id = %self.guild_id, "session stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_for_is_stable_per_user() {
        // Pure-function check against the model helper directly (§8 property 8);
        // the full Session requires async collaborators to construct.
        let a = user_session_id(&"g".to_string(), &"c".to_string(), &"u".to_string());
        let b = user_session_id(&"g".to_string(), &"c".to_string(), &"u".to_string());
        assert_eq!(a, b);
    }
}
