//! A full-duplex voice conversation gateway between Discord voice channels
//! and an LLM backend.
//!
//! # Architecture
//!
//! - **Bridge Client** (`bridge`): WebSocket link to the process that holds
//!   the actual Discord voice connection; reconnects with backoff and
//!   re-establishes guild state on reconnect.
//! - **Streaming Sink** (`sink`): turns per-user PCM frames from the bridge
//!   into complete utterances, via either segmented or streaming VAD.
//! - **Pipeline Orchestrator** (`pipeline`): STT → LLM → sentence-split →
//!   TTS → playback, with barge-in interruption.
//! - **Session Controller** (`session`): owns one guild's bridge
//!   subscription, Sink, and Orchestrator from join through shutdown.
//! - **Channel Manager** (`channel_manager`): auto-join, follow, and leave
//!   policy driven by platform voice-state-change events.
//! - **LLM Client** (`llm`): SSE-streaming HTTP client for the backend.

pub mod audio;
pub mod bridge;
pub mod channel_manager;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod llm;
pub mod model;
pub mod pipeline;
pub mod session;
pub mod sink;
pub mod wire;

pub use bridge::BridgeClient;
pub use channel_manager::{ChannelManager, VoiceStateChange};
pub use config::GatewayConfig;
pub use error::{GatewayError, Result};
pub use pipeline::Orchestrator;
pub use session::{Session, SessionDeps};
pub use sink::Sink;
