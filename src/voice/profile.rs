//! Voice profile store
//!
//! A voice profile is a reference WAV the TTS service uses to clone a
//! speaker's timbre, plus a JSON sidecar with the owning user and language.
//! A profile only counts as present when both halves check out: the sidecar
//! must parse and the referenced audio must open as a WAV. Any partial
//! state reads as "absent" so the pipeline falls back to the default voice.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::models::VoiceProfilePort;
use crate::types::UserId;

/// Voice profile metadata, stored as `<user_id>.json` next to the WAV
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VoiceProfile {
    pub user_id: UserId,
    pub reference_audio_path: PathBuf,
    pub language: String,
    pub created_at: DateTime<Utc>,
}

/// Filesystem-backed profile store
#[derive(Debug, Clone)]
pub struct FsVoiceProfiles {
    dir: PathBuf,
}

impl FsVoiceProfiles {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn sidecar_path(&self, user_id: UserId) -> PathBuf {
        self.dir.join(format!("{user_id}.json"))
    }

    fn read_sidecar(&self, user_id: UserId) -> Option<VoiceProfile> {
        let path = self.sidecar_path(user_id);
        let raw = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str::<VoiceProfile>(&raw) {
            Ok(profile) => Some(profile),
            Err(e) => {
                warn!("Unreadable voice profile sidecar {}: {}", path.display(), e);
                None
            }
        }
    }

    /// The referenced audio must exist and parse as a WAV
    fn reference_is_usable(path: &Path) -> bool {
        match hound::WavReader::open(path) {
            Ok(reader) => reader.len() > 0,
            Err(e) => {
                debug!("Voice reference {} unusable: {}", path.display(), e);
                false
            }
        }
    }
}

#[async_trait]
impl VoiceProfilePort for FsVoiceProfiles {
    async fn get(&self, user_id: UserId) -> Option<VoiceProfile> {
        let profile = self.read_sidecar(user_id)?;
        // Sidecars may carry relative paths; resolve against the store dir
        let audio_path = if profile.reference_audio_path.is_absolute() {
            profile.reference_audio_path.clone()
        } else {
            self.dir.join(&profile.reference_audio_path)
        };
        if !Self::reference_is_usable(&audio_path) {
            return None;
        }
        Some(VoiceProfile {
            reference_audio_path: audio_path,
            ..profile
        })
    }
}

/// Always-empty store for deployments without cloned voices
#[derive(Debug, Clone, Default)]
pub struct NoVoiceProfiles;

#[async_trait]
impl VoiceProfilePort for NoVoiceProfiles {
    async fn get(&self, _user_id: UserId) -> Option<VoiceProfile> {
        None
    }
}
