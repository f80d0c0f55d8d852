//! Bridge Client (§4.1): the single WebSocket connection to the external
//! voice-gateway process.
//!
//! Grounded on the remote-canvas session's connect/reconnect/backoff
//! skeleton (`Arc<Mutex<SharedState>>`, a background `connection_loop` task,
//! an unbounded outbound channel, `tokio_tungstenite::connect_async` +
//! `futures_util::{SinkExt, StreamExt}`), generalized here to per-guild
//! callback dispatch, a two-phase join/`wait_ready` handshake, and a
//! blocking `play()` that awaits the matching `play_done` event.

use crate::config::BridgeConfig;
use crate::error::{GatewayError, Result};
use crate::wire::{AudioFormat, InboundFrame, OutboundFrame};
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};

type AudioCallback = Arc<dyn Fn(String, Vec<u8>) + Send + Sync>;
type SpeakingCallback = Arc<dyn Fn(String, f64) + Send + Sync>;
type ReconnectCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct GuildState {
    dave: Option<bool>,
    ready_notify: Arc<Notify>,
    play_done: Option<oneshot::Sender<Result<()>>>,
    audio_cb: Option<AudioCallback>,
    speaking_cb: Option<SpeakingCallback>,
    reconnect_cb: Option<ReconnectCallback>,
}

struct Inner {
    config: BridgeConfig,
    connected: watch::Sender<bool>,
    outbound_tx: mpsc::UnboundedSender<OutboundFrame>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<OutboundFrame>>>,
    guilds: Mutex<HashMap<String, GuildState>>,
    run_handle: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
}

/// Owns the single WebSocket to the voice-gateway process.
#[derive(Clone)]
pub struct BridgeClient {
    inner: Arc<Inner>,
}

impl BridgeClient {
    /// Construct the client. Does not connect; call `start()` to spawn the
    /// connection loop (§4.1: "`start()`/`stop()`: idempotent").
    pub fn new(config: BridgeConfig) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (connected_tx, _) = watch::channel(false);
        let inner = Arc::new(Inner {
            config,
            connected: connected_tx,
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            guilds: Mutex::new(HashMap::new()),
            run_handle: Mutex::new(None),
            started: AtomicBool::new(false),
        });
        Self { inner }
    }

    /// Idempotent; spawns the background connection loop.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(outbound_rx) = self.inner.outbound_rx.lock().unwrap().take() else {
            return;
        };
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(connection_loop(inner, outbound_rx));
        *self.inner.run_handle.lock().unwrap() = Some(handle);
    }

    /// Idempotent; closes the socket and cancels the run loop.
    pub async fn stop(&self) {
        if let Some(handle) = self.inner.run_handle.lock().unwrap().take() {
            handle.abort();
        }
        let _ = self.inner.connected.send(false);
    }

    /// Fails with a timeout error if the socket has not reached the OPEN
    /// state within `timeout`.
    pub async fn wait_connected(&self, timeout: Duration) -> Result<()> {
        if *self.inner.connected.borrow() {
            return Ok(());
        }
        let mut rx = self.inner.connected.subscribe();
        tokio::time::timeout(timeout, async {
            loop {
                if *rx.borrow() {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        })
        .await
        .map_err(|_| GatewayError::Timeout("wait_connected".into()))
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.connected.borrow()
    }

    /// Send the join frame. Ready is a separate await via `wait_ready`.
    /// Callers MUST send the captured voice_state/voice_server frames after
    /// this and before `wait_ready`.
    pub fn join(&self, guild: &str, channel: &str, user: &str, session_id: &str) -> Result<()> {
        self.send(OutboundFrame::Join {
            guild_id: guild.to_string(),
            channel_id: channel.to_string(),
            user_id: user.to_string(),
            session_id: session_id.to_string(),
        })
    }

    pub fn send_voice_state_update(&self, d: serde_json::Value) -> Result<()> {
        self.send(OutboundFrame::VoiceStateUpdate { d })
    }

    pub fn send_voice_server_update(&self, d: serde_json::Value) -> Result<()> {
        self.send(OutboundFrame::VoiceServerUpdate { d })
    }

    /// Await the `ready` event for `guild`, returning its DAVE status.
    pub async fn wait_ready(&self, guild: &str, timeout: Duration) -> Result<bool> {
        if let Some(dave) = self.guild_dave(guild) {
            return Ok(dave);
        }
        let notify = self.guild_notify(guild);
        tokio::time::timeout(timeout, notify.notified())
            .await
            .map_err(|_| GatewayError::Timeout(format!("wait_ready({guild})")))?;
        Ok(self.guild_dave(guild).unwrap_or(false))
    }

    /// Send the play frame and block until the matching `play_done` event
    /// arrives or `timeout` expires. Concurrent plays for the same guild
    /// must be serialized by the caller.
    pub async fn play(
        &self,
        guild: &str,
        audio: &[u8],
        format: AudioFormat,
        timeout: Duration,
    ) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        {
            let mut guilds = self.inner.guilds.lock().unwrap();
            guilds.entry(guild.to_string()).or_default().play_done = Some(tx);
        }
        self.send(OutboundFrame::Play {
            guild_id: guild.to_string(),
            audio: base64::engine::general_purpose::STANDARD.encode(audio),
            format,
            loop_: None,
        })?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(GatewayError::Transport("play_done sender dropped".into())),
            Err(_) => Err(GatewayError::Timeout(format!("play_done({guild})"))),
        }
    }

    /// Send a looping play frame (used for the thinking sound) and return
    /// immediately; this never awaits `play_done` since the clip loops
    /// until explicitly stopped (§4.3 stage 2).
    pub fn play_looping(&self, guild: &str, audio: &[u8], format: AudioFormat) -> Result<()> {
        self.send(OutboundFrame::Play {
            guild_id: guild.to_string(),
            audio: base64::engine::general_purpose::STANDARD.encode(audio),
            format,
            loop_: Some(true),
        })
    }

    pub fn stop_playing(&self, guild: &str, fade: bool) -> Result<()> {
        self.send(OutboundFrame::Stop {
            guild_id: guild.to_string(),
            fade: Some(fade),
        })
    }

    pub fn disconnect(&self, guild: &str) -> Result<()> {
        self.send(OutboundFrame::Disconnect {
            guild_id: guild.to_string(),
        })
    }

    /// Register the audio callback for `guild`. Exactly one subscriber per
    /// kind per guild; re-registering is a programmer error (§7).
    pub fn register_audio_callback(&self, guild: &str, f: impl Fn(String, Vec<u8>) + Send + Sync + 'static) {
        let mut guilds = self.inner.guilds.lock().unwrap();
        let state = guilds.entry(guild.to_string()).or_default();
        debug_assert!(state.audio_cb.is_none(), "audio callback already registered for {guild}");
        state.audio_cb = Some(Arc::new(f));
    }

    pub fn register_speaking_callback(&self, guild: &str, f: impl Fn(String, f64) + Send + Sync + 'static) {
        let mut guilds = self.inner.guilds.lock().unwrap();
        let state = guilds.entry(guild.to_string()).or_default();
        debug_assert!(state.speaking_cb.is_none(), "speaking callback already registered for {guild}");
        state.speaking_cb = Some(Arc::new(f));
    }

    pub fn register_reconnect_callback(&self, guild: &str, f: impl Fn() + Send + Sync + 'static) {
        let mut guilds = self.inner.guilds.lock().unwrap();
        let state = guilds.entry(guild.to_string()).or_default();
        debug_assert!(state.reconnect_cb.is_none(), "reconnect callback already registered for {guild}");
        state.reconnect_cb = Some(Arc::new(f));
    }

    pub fn unregister_guild(&self, guild: &str) {
        self.inner.guilds.lock().unwrap().remove(guild);
    }

    /// End-to-end-encryption status reported by the most recent `ready`
    /// event for `guild`.
    pub fn is_dave_active(&self, guild: &str) -> bool {
        self.guild_dave(guild).unwrap_or(false)
    }

    fn guild_dave(&self, guild: &str) -> Option<bool> {
        self.inner.guilds.lock().unwrap().get(guild).and_then(|g| g.dave)
    }

    fn guild_notify(&self, guild: &str) -> Arc<Notify> {
        let mut guilds = self.inner.guilds.lock().unwrap();
        Arc::clone(&guilds.entry(guild.to_string()).or_default().ready_notify)
    }

    fn send(&self, frame: OutboundFrame) -> Result<()> {
        if !self.is_connected() {
            return Err(GatewayError::NotConnected);
        }
        self.inner
            .outbound_tx
            .send(frame)
            .map_err(|_| GatewayError::NotConnected)
    }
}

async fn connection_loop(inner: Arc<Inner>, mut outbound_rx: mpsc::UnboundedReceiver<OutboundFrame>) {
    let mut attempt: u32 = 0;
    loop {
        match try_connect(&inner, &mut outbound_rx, &mut attempt).await {
            ConnectOutcome::StoppedCleanly => break,
            ConnectOutcome::Lost(reason) => {
                warn!(reason = %reason, "bridge connection lost");
                let _ = inner.connected.send(false);
                fail_pending_play_dones(&inner, GatewayError::Transport(reason));
                let delay = std::cmp::min(
                    inner.config.reconnect_base() * 2u32.saturating_pow(attempt.min(5)),
                    inner.config.reconnect_max(),
                );
                attempt = attempt.saturating_add(1);
                tokio::time::sleep(delay).await;
            }
        }
    }
}

enum ConnectOutcome {
    StoppedCleanly,
    Lost(String),
}

async fn try_connect(
    inner: &Arc<Inner>,
    outbound_rx: &mut mpsc::UnboundedReceiver<OutboundFrame>,
    attempt: &mut u32,
) -> ConnectOutcome {
    info!(url = %inner.config.url, "connecting to voice bridge");
    let (ws, _) = match tokio_tungstenite::connect_async(&inner.config.url).await {
        Ok(pair) => pair,
        Err(e) => return ConnectOutcome::Lost(format!("connect failed: {e}")),
    };
    let (mut write, mut read) = ws.split();

    *attempt = 0;
    let _ = inner.connected.send(true);
    info!("voice bridge connected");
    invoke_reconnect_callbacks(inner);

    loop {
        tokio::select! {
            incoming = read.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => handle_inbound(inner, &text),
                    Some(Ok(Message::Close(_))) | None => {
                        return ConnectOutcome::Lost("connection closed by server".into());
                    }
                    Some(Ok(_)) => {} // ignore binary/ping/pong frames
                    Some(Err(e)) => return ConnectOutcome::Lost(format!("read error: {e}")),
                }
            }
            outgoing = outbound_rx.recv() => {
                match outgoing {
                    Some(frame) => {
                        let json = match serde_json::to_string(&frame) {
                            Ok(j) => j,
                            Err(e) => { warn!(error = %e, "failed to serialize outbound frame"); continue; }
                        };
                        if let Err(e) = write.send(Message::Text(json.into())).await {
                            return ConnectOutcome::Lost(format!("send error: {e}"));
                        }
                    }
                    None => return ConnectOutcome::StoppedCleanly,
                }
            }
        }
    }
}

fn invoke_reconnect_callbacks(inner: &Arc<Inner>) {
    let callbacks: Vec<ReconnectCallback> = {
        let guilds = inner.guilds.lock().unwrap();
        guilds.values().filter_map(|g| g.reconnect_cb.clone()).collect()
    };
    for cb in callbacks {
        cb();
    }
}

fn fail_pending_play_dones(inner: &Arc<Inner>, err: GatewayError) {
    let mut guilds = inner.guilds.lock().unwrap();
    for state in guilds.values_mut() {
        if let Some(tx) = state.play_done.take() {
            let _ = tx.send(Err(match &err {
                GatewayError::Transport(m) => GatewayError::Transport(m.clone()),
                other => GatewayError::Transport(other.to_string()),
            }));
        }
    }
}

fn handle_inbound(inner: &Arc<Inner>, text: &str) {
    let frame: InboundFrame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(e) => {
            warn!(error = %e, raw = %text, "invalid JSON from bridge; dropping frame");
            return;
        }
    };
    let guild = frame.guild_id().to_string();
    let mut guilds = inner.guilds.lock().unwrap();
    let Some(state) = guilds.get_mut(&guild) else {
        // Frame for a guild we have no registration for at all; drop.
        // (We still allow `ready` to create the entry lazily below.)
        if !matches!(frame, InboundFrame::Ready { .. }) {
            warn!(guild_id = %guild, "frame for unknown guild; dropping");
            return;
        }
        drop(guilds);
        let mut guilds = inner.guilds.lock().unwrap();
        guilds.entry(guild.clone()).or_default();
        return handle_inbound_registered(&mut guilds, &guild, frame);
    };
    handle_inbound_on(state, frame);
}

fn handle_inbound_registered(
    guilds: &mut HashMap<String, GuildState>,
    guild: &str,
    frame: InboundFrame,
) {
    if let Some(state) = guilds.get_mut(guild) {
        handle_inbound_on(state, frame);
    }
}

fn handle_inbound_on(state: &mut GuildState, frame: InboundFrame) {
    match frame {
        InboundFrame::Ready { dave, .. } => {
            state.dave = Some(dave);
            state.ready_notify.notify_waiters();
        }
        InboundFrame::Audio { user_id, pcm, .. } => {
            let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(pcm.as_bytes()) else {
                warn!("invalid base64 audio payload; dropping frame");
                return;
            };
            if let Some(cb) = state.audio_cb.clone() {
                cb(user_id, bytes);
            }
        }
        InboundFrame::SpeakingStart { user_id, rms, .. } => {
            if let Some(cb) = state.speaking_cb.clone() {
                cb(user_id, rms);
            }
        }
        InboundFrame::PlayDone { .. } => {
            if let Some(tx) = state.play_done.take() {
                let _ = tx.send(Ok(()));
            }
        }
        InboundFrame::Disconnected { guild_id } => {
            info!(guild_id = %guild_id, "bridge reported guild disconnected");
            state.dave = None;
            if let Some(tx) = state.play_done.take() {
                let _ = tx.send(Err(GatewayError::Transport("guild disconnected".into())));
            }
        }
        InboundFrame::Error { guild_id, message } => {
            tracing::error!(guild_id = %guild_id, message = %message, "bridge reported an error");
        }
    }
}
