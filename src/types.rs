//! Shared types used across the server

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque user identifier (128-bit)
pub type UserId = Uuid;

/// Room identifier as it appears in the WebSocket path
pub type RoomId = String;

/// Fallback language when a user record carries none
pub const DEFAULT_LANGUAGE: &str = "en";

/// A speaker's input language and listener output language for one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanguagePair {
    /// Language the user speaks (ASR hint); "auto" disables the hint
    pub input: String,
    /// Language the user wants to hear
    pub output: String,
}

impl Default for LanguagePair {
    fn default() -> Self {
        Self {
            input: DEFAULT_LANGUAGE.to_string(),
            output: DEFAULT_LANGUAGE.to_string(),
        }
    }
}

impl LanguagePair {
    pub fn new(input: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
        }
    }

    /// True when the ASR call should auto-detect instead of hinting
    pub fn auto_detect(&self) -> bool {
        self.input.is_empty() || self.input.eq_ignore_ascii_case("auto")
    }
}

/// Roster snapshot entry broadcast with join/leave events
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParticipantInfo {
    pub id: UserId,
    pub username: String,
    pub full_name: String,
    /// Short display name (first word of the full name, or the username)
    pub name: String,
}

impl ParticipantInfo {
    pub fn new(id: UserId, username: impl Into<String>, full_name: impl Into<String>) -> Self {
        let username = username.into();
        let full_name = full_name.into();
        let name = full_name
            .split_whitespace()
            .next()
            .unwrap_or(username.as_str())
            .to_string();
        Self {
            id,
            username,
            full_name,
            name,
        }
    }
}

/// User record as read from the directory; the core never writes these
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: UserId,
    pub username: String,
    pub full_name: String,
    /// Ordered, first entry is the authoritative input language
    #[serde(default = "default_languages")]
    pub speaks_languages: Vec<String>,
    /// Ordered, first entry is the authoritative output language
    #[serde(default = "default_languages")]
    pub understands_languages: Vec<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

fn default_languages() -> Vec<String> {
    vec![DEFAULT_LANGUAGE.to_string()]
}

impl UserRecord {
    /// Language pair derived from the record's ordered lists
    pub fn language_pair(&self) -> LanguagePair {
        LanguagePair {
            input: self
                .speaks_languages
                .first()
                .cloned()
                .unwrap_or_else(|| DEFAULT_LANGUAGE.to_string()),
            output: self
                .understands_languages
                .first()
                .cloned()
                .unwrap_or_else(|| DEFAULT_LANGUAGE.to_string()),
        }
    }
}
