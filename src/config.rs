//! Configuration management
//!
//! Loads server configuration from a TOML file with environment overrides.
//! Every tunable has a serde default so a missing or partial file still
//! yields a runnable configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// HTTP/WebSocket listener settings
    #[serde(default)]
    pub server: ServerConfig,
    /// Streaming pipeline tunables
    #[serde(default)]
    pub pipeline: PipelineConfig,
    /// Room and connection limits
    #[serde(default)]
    pub rooms: RoomsConfig,
    /// Bearer-token authentication
    #[serde(default)]
    pub auth: AuthConfig,
    /// Remote inference services (ASR/MT/TTS)
    #[serde(default)]
    pub inference: InferenceConfig,
    /// Voice profile storage
    #[serde(default)]
    pub voice_profiles: VoiceProfileConfig,
    /// Per-connection rate limits
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

/// HTTP listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8700
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Streaming pipeline tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Expected client PCM sample rate (Hz)
    #[serde(default = "default_input_sample_rate")]
    pub input_sample_rate: u32,
    /// TTS sample rate on the wire (Hz)
    #[serde(default = "default_output_sample_rate")]
    pub output_sample_rate: u32,
    /// Processor sleep between buffer drains (ms)
    #[serde(default = "default_cycle_interval_ms")]
    pub cycle_interval_ms: u64,
    /// Minimum audio accumulated before ASR runs (ms)
    #[serde(default = "default_min_block_ms")]
    pub min_block_ms: u64,
    /// Per-cycle cap on the audio block handed to ASR (ms)
    #[serde(default = "default_max_block_ms")]
    pub max_block_ms: u64,
    /// Chunk buffer overflow threshold (bytes)
    #[serde(default = "default_chunk_buffer_max_bytes")]
    pub chunk_buffer_max_bytes: usize,
    /// Per-listener outbound queue depth (messages)
    #[serde(default = "default_outbound_channel_depth")]
    pub outbound_channel_depth: usize,
    /// Combined ASR+MT+TTS budget per cycle (ms)
    #[serde(default = "default_cycle_deadline_ms")]
    pub cycle_deadline_ms: u64,
    /// Translation cache capacity (entries)
    #[serde(default = "default_translation_cache_size")]
    pub translation_cache_size: usize,
    /// Translation cache entry lifetime (secs)
    #[serde(default = "default_translation_cache_ttl_secs")]
    pub translation_cache_ttl_secs: u64,
}

fn default_input_sample_rate() -> u32 {
    16_000
}

fn default_output_sample_rate() -> u32 {
    22_050
}

fn default_cycle_interval_ms() -> u64 {
    500
}

fn default_min_block_ms() -> u64 {
    200
}

fn default_max_block_ms() -> u64 {
    3_000
}

fn default_chunk_buffer_max_bytes() -> usize {
    1024 * 1024
}

fn default_outbound_channel_depth() -> usize {
    32
}

fn default_cycle_deadline_ms() -> u64 {
    3_000
}

fn default_translation_cache_size() -> usize {
    10_000
}

fn default_translation_cache_ttl_secs() -> u64 {
    600
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: default_input_sample_rate(),
            output_sample_rate: default_output_sample_rate(),
            cycle_interval_ms: default_cycle_interval_ms(),
            min_block_ms: default_min_block_ms(),
            max_block_ms: default_max_block_ms(),
            chunk_buffer_max_bytes: default_chunk_buffer_max_bytes(),
            outbound_channel_depth: default_outbound_channel_depth(),
            cycle_deadline_ms: default_cycle_deadline_ms(),
            translation_cache_size: default_translation_cache_size(),
            translation_cache_ttl_secs: default_translation_cache_ttl_secs(),
        }
    }
}

impl PipelineConfig {
    pub fn cycle_interval(&self) -> Duration {
        Duration::from_millis(self.cycle_interval_ms)
    }

    pub fn cycle_deadline(&self) -> Duration {
        Duration::from_millis(self.cycle_deadline_ms)
    }

    /// Minimum ASR block in bytes (PCM16 mono at the input rate)
    pub fn min_block_bytes(&self) -> usize {
        pcm16_bytes_for(self.input_sample_rate, self.min_block_ms)
    }

    /// Maximum per-cycle block in bytes
    pub fn max_block_bytes(&self) -> usize {
        pcm16_bytes_for(self.input_sample_rate, self.max_block_ms)
    }
}

/// 2 bytes per sample, mono
fn pcm16_bytes_for(sample_rate: u32, ms: u64) -> usize {
    (sample_rate as u64 * ms / 1000) as usize * 2
}

/// Room and connection limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomsConfig {
    /// Hard cap on participants per room
    #[serde(default = "default_max_participants")]
    pub max_participants: usize,
    /// Bounded shutdown window for a connection's tasks (ms)
    #[serde(default = "default_shutdown_window_ms")]
    pub shutdown_window_ms: u64,
    /// Close connections with no inbound frames for this long (secs,
    /// 0 disables)
    #[serde(default)]
    pub idle_disconnect_secs: u64,
}

fn default_max_participants() -> usize {
    50
}

fn default_shutdown_window_ms() -> u64 {
    2_000
}

impl Default for RoomsConfig {
    fn default() -> Self {
        Self {
            max_participants: default_max_participants(),
            shutdown_window_ms: default_shutdown_window_ms(),
            idle_disconnect_secs: 0,
        }
    }
}

/// Bearer-token authentication settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HS256 secret; generated at startup when absent
    #[serde(default)]
    pub jwt_secret: Option<String>,
    /// Accept unexpired tokens only within this leeway (secs)
    #[serde(default = "default_jwt_leeway_secs")]
    pub leeway_secs: u64,
}

fn default_jwt_leeway_secs() -> u64 {
    30
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            leeway_secs: default_jwt_leeway_secs(),
        }
    }
}

/// Remote inference service endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    /// Base URL of the speech-recognition service
    #[serde(default = "default_asr_url")]
    pub asr_url: String,
    /// Base URL of the translation service
    #[serde(default = "default_mt_url")]
    pub mt_url: String,
    /// Base URL of the speech-synthesis service
    #[serde(default = "default_tts_url")]
    pub tts_url: String,
    /// Optional bearer token sent to the inference services
    #[serde(default)]
    pub api_key: Option<String>,
    /// Load all three models at startup instead of on first use
    #[serde(default)]
    pub preload: bool,
    /// Unload an idle model after this many seconds (0 disables)
    #[serde(default = "default_idle_unload_secs")]
    pub idle_unload_secs: u64,
}

fn default_asr_url() -> String {
    "http://127.0.0.1:9100".to_string()
}

fn default_mt_url() -> String {
    "http://127.0.0.1:9101".to_string()
}

fn default_tts_url() -> String {
    "http://127.0.0.1:9102".to_string()
}

fn default_idle_unload_secs() -> u64 {
    3_600
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            asr_url: default_asr_url(),
            mt_url: default_mt_url(),
            tts_url: default_tts_url(),
            api_key: None,
            preload: false,
            idle_unload_secs: default_idle_unload_secs(),
        }
    }
}

/// Voice profile storage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceProfileConfig {
    /// Directory holding reference WAVs and their JSON sidecars
    #[serde(default = "default_voice_profile_dir")]
    pub dir: PathBuf,
}

fn default_voice_profile_dir() -> PathBuf {
    PathBuf::from("voice_profiles")
}

impl Default for VoiceProfileConfig {
    fn default() -> Self {
        Self {
            dir: default_voice_profile_dir(),
        }
    }
}

/// Per-connection inbound rate limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Audio chunks accepted per second (0 disables)
    #[serde(default = "default_max_chunks_per_second")]
    pub max_chunks_per_second: u32,
    /// Audio bytes accepted per minute (0 disables)
    #[serde(default = "default_max_bytes_per_minute")]
    pub max_bytes_per_minute: usize,
}

fn default_max_chunks_per_second() -> u32 {
    60
}

fn default_max_bytes_per_minute() -> usize {
    // 60s of 16kHz PCM16 plus headroom for burst
    16_000 * 2 * 90
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_chunks_per_second: default_max_chunks_per_second(),
            max_bytes_per_minute: default_max_bytes_per_minute(),
        }
    }
}

impl Config {
    /// Load from an explicit path, or fall back to defaults when the file
    /// does not exist. Environment variables override the file.
    pub fn load(path: Option<&std::path::Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p)
                    .with_context(|| format!("Failed to read config file {}", p.display()))?;
                toml::from_str(&raw)
                    .with_context(|| format!("Failed to parse config file {}", p.display()))?
            }
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    /// Environment overrides for the options operators most often tune
    fn apply_env(&mut self) {
        if let Ok(host) = std::env::var("BABELROOM_HOST") {
            self.server.host = host;
        }
        if let Ok(port) = std::env::var("BABELROOM_PORT") {
            if let Ok(p) = port.parse() {
                self.server.port = p;
            }
        }
        if let Ok(secret) = std::env::var("BABELROOM_JWT_SECRET") {
            self.auth.jwt_secret = Some(secret);
        }
        if let Ok(url) = std::env::var("BABELROOM_ASR_URL") {
            self.inference.asr_url = url;
        }
        if let Ok(url) = std::env::var("BABELROOM_MT_URL") {
            self.inference.mt_url = url;
        }
        if let Ok(url) = std::env::var("BABELROOM_TTS_URL") {
            self.inference.tts_url = url;
        }
        if let Ok(key) = std::env::var("BABELROOM_INFERENCE_API_KEY") {
            self.inference.api_key = Some(key);
        }
        if let Ok(dir) = std::env::var("BABELROOM_VOICE_PROFILE_DIR") {
            self.voice_profiles.dir = PathBuf::from(dir);
        }
    }
}
