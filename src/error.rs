//! Crate-wide error type.
//!
//! Flat, string-carrying variants grouped by the error taxonomy in the
//! design notes: Transport, Protocol, Capacity, Timing, Backend, Model.
//! None of these are fatal to the process; call sites log and degrade per
//! the documented policy for each category rather than propagating panics.

/// Top-level error type for the voice gateway.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Bridge WebSocket closed, HTTP connection refused, SSE stream interrupted.
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed JSON, unknown op, missing fields.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Sink buffer overflow, pipeline queue blocked by stopped playback.
    #[error("capacity error: {0}")]
    Capacity(String),

    /// `wait_ready` timeout, `play_done` timeout.
    #[error("timeout: {0}")]
    Timeout(String),

    /// LLM 401/404/5xx or other backend failure.
    #[error("backend error: {0}")]
    Backend(String),

    /// STT/TTS/wake-word collaborator returned an unusable result.
    #[error("model error: {0}")]
    Model(String),

    /// Send attempted on a socket that is not connected.
    #[error("not connected")]
    NotConnected,

    /// Configuration file present but malformed.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, GatewayError>;
