//! Voice-bridge wire protocol (§6.2, bit-exact).
//!
//! Transport is a WebSocket carrying UTF-8 JSON text frames, each a single
//! object with an `op` discriminator. Mirrors the tagged-enum shape used for
//! the canvas remote protocol (`ClientMessage`/`ServerMessage`), but the op
//! strings and field names here are fixed by the specification, not free to
//! rename.

use serde::{Deserialize, Serialize};

/// Frames sent from this process to the voice-gateway bridge process.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum OutboundFrame {
    Join {
        guild_id: String,
        channel_id: String,
        user_id: String,
        session_id: String,
    },
    VoiceStateUpdate {
        d: serde_json::Value,
    },
    VoiceServerUpdate {
        d: serde_json::Value,
    },
    Play {
        guild_id: String,
        audio: String,
        format: AudioFormat,
        #[serde(rename = "loop", skip_serializing_if = "Option::is_none")]
        loop_: Option<bool>,
    },
    Stop {
        guild_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        fade: Option<bool>,
    },
    Disconnect {
        guild_id: String,
    },
}

/// Audio container format accepted by the `play` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    Wav,
    Ogg,
}

/// Frames received from the voice-gateway bridge process.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum InboundFrame {
    Ready {
        guild_id: String,
        dave: bool,
    },
    Audio {
        guild_id: String,
        user_id: String,
        /// base64 of 48 kHz stereo 16-bit little-endian PCM.
        pcm: String,
    },
    SpeakingStart {
        guild_id: String,
        user_id: String,
        rms: f64,
    },
    PlayDone {
        guild_id: String,
    },
    Disconnected {
        guild_id: String,
    },
    Error {
        guild_id: String,
        message: String,
    },
}

impl InboundFrame {
    /// The guild this frame pertains to, for dispatch.
    pub fn guild_id(&self) -> &str {
        match self {
            InboundFrame::Ready { guild_id, .. }
            | InboundFrame::Audio { guild_id, .. }
            | InboundFrame::SpeakingStart { guild_id, .. }
            | InboundFrame::PlayDone { guild_id }
            | InboundFrame::Disconnected { guild_id }
            | InboundFrame::Error { guild_id, .. } => guild_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_frame_serializes_with_op_discriminator() {
        let frame = OutboundFrame::Join {
            guild_id: "g1".into(),
            channel_id: "c1".into(),
            user_id: "u1".into(),
            session_id: "voice:g1:c1:u1".into(),
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"op\":\"join\""));
        assert!(json.contains("\"guild_id\":\"g1\""));
    }

    #[test]
    fn play_frame_omits_loop_when_absent() {
        let frame = OutboundFrame::Play {
            guild_id: "g1".into(),
            audio: "QQ==".into(),
            format: AudioFormat::Wav,
            loop_: None,
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(!json.contains("loop"));
    }

    #[test]
    fn play_frame_includes_loop_true() {
        let frame = OutboundFrame::Play {
            guild_id: "g1".into(),
            audio: "QQ==".into(),
            format: AudioFormat::Wav,
            loop_: Some(true),
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"loop\":true"));
    }

    #[test]
    fn parses_inbound_audio_frame() {
        let raw = r#"{"op":"audio","guild_id":"g1","user_id":"u1","pcm":"QQ=="}"#;
        let frame: InboundFrame = serde_json::from_str(raw).unwrap();
        match frame {
            InboundFrame::Audio {
                guild_id,
                user_id,
                pcm,
            } => {
                assert_eq!(guild_id, "g1");
                assert_eq!(user_id, "u1");
                assert_eq!(pcm, "QQ==");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn parses_inbound_speaking_start() {
        let raw = r#"{"op":"speaking_start","guild_id":"g1","user_id":"u1","rms":1500.0}"#;
        let frame: InboundFrame = serde_json::from_str(raw).unwrap();
        match frame {
            InboundFrame::SpeakingStart { rms, .. } => assert!((rms - 1500.0).abs() < f64::EPSILON),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn unknown_op_fails_to_parse() {
        let raw = r#"{"op":"something_else","guild_id":"g1"}"#;
        let result: std::result::Result<InboundFrame, _> = serde_json::from_str(raw);
        assert!(result.is_err());
    }

    #[test]
    fn guild_id_accessor_covers_all_variants() {
        let f = InboundFrame::PlayDone {
            guild_id: "g9".into(),
        };
        assert_eq!(f.guild_id(), "g9");
    }
}
