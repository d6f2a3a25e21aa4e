//! WebSocket wire protocol
//!
//! JSON text frames in both directions, discriminated by `type`. Unknown
//! inbound tags and malformed frames are logged and ignored by the handler;
//! the connection stays up. SDP offers, answers, and ICE candidates are
//! opaque values the server never inspects.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{ParticipantInfo, UserId};

/// Pipeline stage attached to error frames
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ErrorStage {
    Asr,
    Mt,
    Tts,
    Send,
}

/// Mute control actions
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    Mute,
    Unmute,
}

/// Client -> server frames
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "init_settings")]
    InitSettings {
        input_language: String,
        output_language: String,
        #[serde(default)]
        speaks_languages: Option<Vec<String>>,
        #[serde(default)]
        understands_languages: Option<Vec<String>>,
        #[serde(default)]
        voice_profile_exists: Option<bool>,
    },
    #[serde(rename = "language_update")]
    LanguageUpdate {
        input_language: String,
        output_language: String,
        #[serde(default)]
        speaks_languages: Option<Vec<String>>,
        #[serde(default)]
        understands_languages: Option<Vec<String>>,
    },
    #[serde(rename = "audio_chunk")]
    AudioChunk {
        /// Base64 PCM16 LE, 16 kHz mono
        audio_data: String,
        /// Client capture time, ms since epoch
        #[serde(default)]
        timestamp: Option<u64>,
    },
    #[serde(rename = "control")]
    Control { action: ControlAction },
    #[serde(rename = "webrtc_offer")]
    WebrtcOffer {
        target_user_id: UserId,
        offer: Value,
    },
    #[serde(rename = "webrtc_answer")]
    WebrtcAnswer {
        target_user_id: UserId,
        answer: Value,
    },
    #[serde(rename = "ice_candidate")]
    IceCandidate {
        target_user_id: UserId,
        candidate: Value,
    },
}

/// Audio payload carried by `translated_audio`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AudioPayload {
    /// Base64 PCM16 LE bytes
    pub data: String,
    pub encoding: String,
    pub sample_rate: u32,
}

impl AudioPayload {
    pub fn pcm_s16le(data: String, sample_rate: u32) -> Self {
        Self {
            data,
            encoding: "pcm_s16le".to_string(),
            sample_rate,
        }
    }
}

/// Server -> client frames
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "connected")]
    Connected { user_id: UserId },
    #[serde(rename = "participant_joined")]
    ParticipantJoined {
        user_id: UserId,
        user_name: String,
        participants: Vec<ParticipantInfo>,
    },
    #[serde(rename = "participant_left")]
    ParticipantLeft {
        user_id: UserId,
        participants: Vec<ParticipantInfo>,
    },
    /// Early caption for the speaker, before fan-out completes
    #[serde(rename = "partial_transcript")]
    PartialTranscript { text: String, timestamp: u64 },
    /// Early caption for a listener, before synthesis completes
    #[serde(rename = "partial_translation")]
    PartialTranslation { text: String, timestamp: u64 },
    #[serde(rename = "translated_audio")]
    TranslatedAudio {
        audio: AudioPayload,
        text: String,
        original_text: String,
        detected_language: String,
        /// Monotonic per (speaker, listener) for client-side reordering
        seq: u64,
        voice_fallback: bool,
        timestamp: u64,
    },
    #[serde(rename = "webrtc_offer")]
    WebrtcOffer { from_user_id: UserId, offer: Value },
    #[serde(rename = "webrtc_answer")]
    WebrtcAnswer {
        from_user_id: UserId,
        answer: Value,
    },
    #[serde(rename = "ice_candidate")]
    IceCandidate {
        from_user_id: UserId,
        candidate: Value,
    },
    #[serde(rename = "error")]
    Error {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        stage: Option<ErrorStage>,
    },
}

impl ServerMessage {
    pub fn error(text: impl Into<String>, stage: Option<ErrorStage>) -> Self {
        Self::Error {
            text: text.into(),
            stage,
        }
    }
}

/// Wall-clock milliseconds since the UNIX epoch, for outbound timestamps
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
