//! External collaborator ports
//!
//! The core never embeds ML models or account storage; it talks to them
//! through these traits. Adapters live in [`remote`] (HTTP inference
//! services), [`directory`] (in-memory lookups), `server::auth` (JWT), and
//! `voice::profile` (filesystem store). Results cross these boundaries as
//! values, never as panics.

pub mod dev;
pub mod directory;
pub mod loader;
pub mod remote;

use async_trait::async_trait;
use std::path::Path;
use thiserror::Error;

use crate::types::{RoomId, UserId, UserRecord};
use crate::voice::profile::VoiceProfile;

/// Error surface shared by the service ports
#[derive(Debug, Error)]
pub enum PortError {
    /// The backing model/service is not loaded and could not be loaded
    #[error("service unavailable: {0}")]
    Unavailable(String),
    /// The per-cycle deadline expired before the call completed
    #[error("deadline exceeded after {0:?}")]
    DeadlineExceeded(std::time::Duration),
    /// The remote service answered with an error
    #[error("remote error: {0}")]
    Remote(String),
    /// The token/credential was rejected
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// Malformed payload in either direction
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

/// Speech recognition output
#[derive(Debug, Clone, PartialEq)]
pub struct Transcription {
    pub text: String,
    /// Language the recognizer actually heard; wins over the hint
    pub detected_language: Option<String>,
    pub confidence: f32,
}

/// Speech synthesis output
#[derive(Debug, Clone, PartialEq)]
pub struct Synthesis {
    /// PCM16 LE mono bytes
    pub pcm: Vec<u8>,
    pub sample_rate: u32,
    /// Whether the provided voice reference was actually applied
    pub voice_reference_used: bool,
}

/// Audio → text
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AsrPort: Send + Sync {
    /// Transcribe a PCM16 mono block. `language_hint` of `None` means
    /// auto-detect; VAD filtering is the recognizer's responsibility.
    async fn transcribe<'a>(
        &self,
        pcm: &[u8],
        sample_rate: u32,
        language_hint: Option<&'a str>,
    ) -> Result<Transcription, PortError>;
}

/// Text → text across languages
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MtPort: Send + Sync {
    async fn translate(&self, text: &str, source: &str, target: &str)
        -> Result<String, PortError>;
}

/// Text → audio, optionally guided by a reference sample
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TtsPort: Send + Sync {
    async fn synthesize<'a>(
        &self,
        text: &str,
        language: &str,
        voice_reference: Option<&'a Path>,
    ) -> Result<Synthesis, PortError>;
}

/// Bearer token validation
#[async_trait]
pub trait AuthPort: Send + Sync {
    async fn validate(&self, token: &str) -> Result<UserId, PortError>;
}

/// Display name resolution
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn get(&self, user_id: UserId) -> Option<UserRecord>;
}

/// Room existence checks; lifecycle is owned elsewhere
#[async_trait]
pub trait RoomRegistry: Send + Sync {
    async fn exists(&self, room_id: &RoomId) -> bool;
}

/// Voice profile lookup with the two-step existence check
#[async_trait]
pub trait VoiceProfilePort: Send + Sync {
    async fn get(&self, user_id: UserId) -> Option<VoiceProfile>;
}
