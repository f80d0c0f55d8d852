//! Streaming Sink (§4.2): per-session speech segmentation, echo
//! suppression, and dispatch to the Pipeline Orchestrator.
//!
//! Grounded on the energy-gated buffering state machine used for RMS-based
//! voice activity detection elsewhere in the pack, generalized to the two
//! input paths this specification requires (pre-segmented vs. raw-chunk
//! streaming) and the epoch-based stale-task detection §9's "coroutine-heavy
//! pipeline" redesign flag calls for instead of cancellation.

use crate::audio::{compute_rms_i16le, downsample_48k_stereo_to_16k_mono};
use crate::config::SinkConfig;
use crate::model::{Epoch, UserKey, Utterance};
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

type PipelineCallback = Arc<dyn Fn(Utterance) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Default)]
struct UserBuffer {
    samples: Vec<u8>,
    speaking: bool,
    timer_pending: bool,
    generation: u64,
}

struct Inner {
    config: SinkConfig,
    epoch: Epoch,
    playback_active: AtomicBool,
    buffers: Mutex<HashMap<UserKey, UserBuffer>>,
    callback: PipelineCallback,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Owns one session's per-user audio buffers and dispatches completed
/// utterances to the Orchestrator as independent, uncancellable tasks.
#[derive(Clone)]
pub struct Sink {
    inner: Arc<Inner>,
}

impl Sink {
    pub fn new(
        config: SinkConfig,
        callback: impl Fn(Utterance) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                epoch: Epoch::default(),
                playback_active: AtomicBool::new(false),
                buffers: Mutex::new(HashMap::new()),
                callback: Arc::new(callback),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Echo-suppression lever: the Orchestrator raises this while a reply is
    /// playing and lowers it once playback ends (§4.3 stages 5 and 9).
    pub fn set_playback_active(&self, active: bool) {
        self.inner.playback_active.store(active, Ordering::SeqCst);
    }

    fn active_threshold(&self) -> f64 {
        if self.inner.playback_active.load(Ordering::SeqCst) {
            self.inner.config.playback_speech_threshold
        } else {
            self.inner.config.silence_threshold
        }
    }

    /// Current epoch, to be captured by a `PipelineTask` at dispatch time
    /// and re-checked by the Orchestrator before any STT/LLM work begins.
    pub fn epoch(&self) -> &Epoch {
        &self.inner.epoch
    }

    /// Segmented path (§4.2): the bridge already silence-segmented this
    /// audio. RMS-gate, downsample, and dispatch if long enough.
    pub fn process_segment(&self, user: &str, pcm_48k_stereo: &[u8]) {
        let rms = compute_rms_i16le(pcm_48k_stereo);
        if rms <= self.active_threshold() {
            return; // §8 property 3
        }
        self.downsample_and_dispatch(user, pcm_48k_stereo);
    }

    /// Streaming path (§4.2): raw ~20 ms PCM chunks requiring in-Sink VAD.
    pub fn write(&self, user: &str, pcm_chunk_48k_stereo: &[u8]) {
        let rms = compute_rms_i16le(pcm_chunk_48k_stereo);
        let threshold = self.active_threshold();

        let mut buffers = self.inner.buffers.lock().unwrap();
        let buf = buffers.entry(user.to_string()).or_default();

        if rms > threshold {
            buf.speaking = true;
            buf.generation += 1; // invalidates any timer scheduled before this speech
            buf.samples.extend_from_slice(pcm_chunk_48k_stereo);

            let cap_bytes = (self.inner.config.buffer_cap_secs * 48_000.0 * 4.0) as usize;
            if buf.samples.len() >= cap_bytes {
                let samples = std::mem::take(&mut buf.samples);
                buf.speaking = false;
                buf.timer_pending = false;
                drop(buffers);
                debug!(user, bytes = samples.len(), "sink buffer overflow; forcing flush");
                self.downsample_and_dispatch(user, &samples);
            }
            return;
        }

        if !buf.speaking {
            return; // pure silence outside any utterance; drop
        }

        // Trailing silence: still appended while we wait out the VAD timer
        // (§3 invariant 5).
        buf.samples.extend_from_slice(pcm_chunk_48k_stereo);
        if buf.timer_pending {
            return;
        }
        buf.timer_pending = true;
        let generation = buf.generation;
        drop(buffers);

        let sink = self.clone();
        let user = user.to_string();
        let delay = std::time::Duration::from_millis(self.inner.config.vad_silence_ms);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            sink.fire_silence_timer(&user, generation);
        });
    }

    fn fire_silence_timer(&self, user: &str, generation: u64) {
        let samples = {
            let mut buffers = self.inner.buffers.lock().unwrap();
            let Some(buf) = buffers.get_mut(user) else { return };
            if buf.generation != generation || !buf.timer_pending {
                return; // cancelled by new speech or a drain()
            }
            buf.speaking = false;
            buf.timer_pending = false;
            std::mem::take(&mut buf.samples)
        };
        self.downsample_and_dispatch(user, &samples);
    }

    fn downsample_and_dispatch(&self, user: &str, pcm_48k_stereo: &[u8]) {
        let mono16k = downsample_48k_stereo_to_16k_mono(pcm_48k_stereo);
        if mono16k.len() < self.inner.config.min_utterance_bytes {
            return; // §4.2 minimum utterance, §8 property 1
        }
        let utterance = Utterance {
            user: user.to_string(),
            pcm: mono16k,
            sample_rate: 16_000,
            epoch: self.inner.epoch.current(),
        };
        self.dispatch(utterance);
    }

    fn dispatch(&self, utterance: Utterance) {
        let callback = Arc::clone(&self.inner.callback);
        let handle = tokio::spawn(callback(utterance));
        let mut tasks = self.inner.tasks.lock().unwrap();
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
    }

    /// Bump the epoch, invalidate every pending silence timer, and clear
    /// all buffers. In-flight `PipelineTask`s are left running; they detect
    /// staleness themselves via the epoch they captured at dispatch.
    pub fn drain(&self) {
        self.inner.epoch.bump();
        let mut buffers = self.inner.buffers.lock().unwrap();
        for buf in buffers.values_mut() {
            buf.generation += 1;
            buf.timer_pending = false;
            buf.speaking = false;
            buf.samples.clear();
        }
    }

    /// Number of `PipelineTask`s dispatched but not yet finished, for the
    /// Session Controller's bounded stop-sequence wait (§4.5).
    pub fn pending_task_count(&self) -> usize {
        let mut tasks = self.inner.tasks.lock().unwrap();
        tasks.retain(|h| !h.is_finished());
        tasks.len()
    }
}

/// Test-only helper: a 48 kHz stereo 16-bit PCM buffer of `secs` seconds at
/// constant amplitude.
#[cfg(test)]
fn tone_48k_stereo(amplitude: i16, secs: f64) -> Vec<u8> {
    let n = (secs * 48_000.0) as usize;
    let mut out = Vec::with_capacity(n * 4);
    for _ in 0..n {
        out.extend_from_slice(&amplitude.to_le_bytes());
        out.extend_from_slice(&amplitude.to_le_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_sink(config: SinkConfig) -> (Sink, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let sink = Sink::new(config, move |_utt| {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        });
        (sink, count)
    }

    #[test]
    fn segment_below_threshold_is_dropped() {
        let (sink, count) = counting_sink(SinkConfig::default());
        let quiet = tone_48k_stereo(100, 1.0); // RMS well under 300
        sink.process_segment("u1", &quiet);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn segment_above_threshold_dispatches() {
        let (sink, count) = counting_sink(SinkConfig::default());
        let loud = tone_48k_stereo(20_000, 1.0);
        sink.process_segment("u1", &loud);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn playback_active_raises_threshold_for_echo_suppression() {
        let (sink, count) = counting_sink(SinkConfig::default());
        sink.set_playback_active(true);
        // RMS ~800, above the normal 300 threshold but below the 1200
        // playback threshold: must NOT dispatch (§8 property 3).
        let medium = tone_48k_stereo(800, 1.0);
        sink.process_segment("u1", &medium);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn too_short_segment_is_discarded_even_if_loud() {
        let (sink, count) = counting_sink(SinkConfig::default());
        let loud_but_brief = tone_48k_stereo(20_000, 0.1); // downsamples well under 16000 bytes
        sink.process_segment("u1", &loud_but_brief);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn drain_bumps_epoch() {
        let (sink, _count) = counting_sink(SinkConfig::default());
        let before = sink.epoch().current();
        sink.drain();
        assert_eq!(sink.epoch().current(), before + 1);
    }

    #[tokio::test]
    async fn streaming_path_dispatches_after_silence_timer_fires() {
        let mut config = SinkConfig::default();
        config.vad_silence_ms = 20;
        let (sink, count) = counting_sink(config);

        let loud_chunk = tone_48k_stereo(20_000, 1.0);
        sink.write("u1", &loud_chunk);
        let quiet_chunk = tone_48k_stereo(0, 0.02);
        sink.write("u1", &quiet_chunk);

        assert_eq!(count.load(Ordering::SeqCst), 0);
        tokio::time::sleep(std::time::Duration::from_millis(60)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn new_speech_cancels_pending_silence_timer() {
        let mut config = SinkConfig::default();
        config.vad_silence_ms = 30;
        let (sink, count) = counting_sink(config);

        let loud_chunk = tone_48k_stereo(20_000, 1.0);
        sink.write("u1", &loud_chunk);
        sink.write("u1", &tone_48k_stereo(0, 0.01)); // starts the timer
        sink.write("u1", &loud_chunk); // cancels it by bumping generation

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        // The timer that fired belonged to a stale generation and must have
        // been ignored; speech is still buffered and undispatched.
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn drain_invalidates_pending_silence_timer() {
        let mut config = SinkConfig::default();
        config.vad_silence_ms = 20;
        let (sink, count) = counting_sink(config);

        sink.write("u1", &tone_48k_stereo(20_000, 1.0));
        sink.write("u1", &tone_48k_stereo(0, 0.01));
        sink.drain();

        tokio::time::sleep(std::time::Duration::from_millis(60)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
