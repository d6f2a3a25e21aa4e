//! HTTP inference adapters
//!
//! JSON-over-HTTP clients for the ASR, MT, and TTS services. Each adapter
//! owns a shared reqwest client and a base URL; the loader health-checks
//! the endpoint before handing the adapter to the pipeline.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{AsrPort, MtPort, PortError, Synthesis, TtsPort, Transcription};

/// Connection details for one inference service
#[derive(Debug, Clone)]
pub struct InferenceEndpoint {
    /// Base URL, e.g. "http://asr.internal:9100"
    pub base_url: String,
    /// Optional bearer token
    pub api_key: Option<String>,
    /// Transport-level timeout; the pipeline applies its own cycle deadline
    pub request_timeout: Duration,
}

impl InferenceEndpoint {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key,
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Shared plumbing for the three adapters
#[derive(Clone)]
struct InferenceClient {
    client: Arc<Client>,
    endpoint: InferenceEndpoint,
}

impl InferenceClient {
    fn new(endpoint: InferenceEndpoint) -> Result<Self, PortError> {
        let client = Client::builder()
            .timeout(endpoint.request_timeout)
            .build()
            .map_err(|e| PortError::Unavailable(format!("http client: {e}")))?;
        Ok(Self {
            client: Arc::new(client),
            endpoint,
        })
    }

    async fn post_json<Req: Serialize, Resp: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &Req,
    ) -> Result<Resp, PortError> {
        let url = format!("{}{}", self.endpoint.base_url.trim_end_matches('/'), path);
        let mut request = self.client.post(&url).json(body);
        if let Some(key) = &self.endpoint.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .map_err(|e| PortError::Unavailable(format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(PortError::Remote(format!("{url} -> {status}: {detail}")));
        }
        response
            .json::<Resp>()
            .await
            .map_err(|e| PortError::InvalidPayload(format!("{url}: {e}")))
    }

    /// Used by the lazy loader to decide whether the service is reachable
    async fn health(&self) -> Result<(), PortError> {
        let url = format!("{}/healthz", self.endpoint.base_url.trim_end_matches('/'));
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| PortError::Unavailable(format!("{url}: {e}")))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(PortError::Unavailable(format!(
                "{url} -> {}",
                response.status()
            )))
        }
    }
}

// ─── ASR ─────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct AsrRequest<'a> {
    audio: String,
    sample_rate: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    language: Option<&'a str>,
    /// Ask the service to gate non-speech before transcribing
    vad_filter: bool,
}

#[derive(Debug, Deserialize)]
struct AsrResponse {
    text: String,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    confidence: f32,
}

/// Speech-recognition service client
pub struct HttpAsr {
    inner: InferenceClient,
}

impl HttpAsr {
    pub fn connect(endpoint: InferenceEndpoint) -> Result<Self, PortError> {
        Ok(Self {
            inner: InferenceClient::new(endpoint)?,
        })
    }

    pub async fn health(&self) -> Result<(), PortError> {
        self.inner.health().await
    }
}

#[async_trait]
impl AsrPort for HttpAsr {
    async fn transcribe<'a>(
        &self,
        pcm: &[u8],
        sample_rate: u32,
        language_hint: Option<&'a str>,
    ) -> Result<Transcription, PortError> {
        let request = AsrRequest {
            audio: BASE64.encode(pcm),
            sample_rate,
            language: language_hint,
            vad_filter: true,
        };
        let response: AsrResponse = self.inner.post_json("/v1/transcribe", &request).await?;
        debug!(
            "ASR: {} bytes -> {:?} ({} chars)",
            pcm.len(),
            response.language,
            response.text.len()
        );
        Ok(Transcription {
            text: response.text,
            detected_language: response.language,
            confidence: response.confidence,
        })
    }
}

// ─── MT ──────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct MtRequest<'a> {
    text: &'a str,
    source: &'a str,
    target: &'a str,
}

#[derive(Debug, Deserialize)]
struct MtResponse {
    text: String,
}

/// Translation service client
pub struct HttpMt {
    inner: InferenceClient,
}

impl HttpMt {
    pub fn connect(endpoint: InferenceEndpoint) -> Result<Self, PortError> {
        Ok(Self {
            inner: InferenceClient::new(endpoint)?,
        })
    }

    pub async fn health(&self) -> Result<(), PortError> {
        self.inner.health().await
    }
}

#[async_trait]
impl MtPort for HttpMt {
    async fn translate(
        &self,
        text: &str,
        source: &str,
        target: &str,
    ) -> Result<String, PortError> {
        let request = MtRequest {
            text,
            source,
            target,
        };
        let response: MtResponse = self.inner.post_json("/v1/translate", &request).await?;
        Ok(response.text)
    }
}

// ─── TTS ─────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct TtsRequest<'a> {
    text: &'a str,
    language: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    voice_reference: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TtsResponse {
    audio: String,
    sample_rate: u32,
    #[serde(default)]
    voice_reference_used: bool,
}

/// Speech-synthesis service client
pub struct HttpTts {
    inner: InferenceClient,
}

impl HttpTts {
    pub fn connect(endpoint: InferenceEndpoint) -> Result<Self, PortError> {
        Ok(Self {
            inner: InferenceClient::new(endpoint)?,
        })
    }

    pub async fn health(&self) -> Result<(), PortError> {
        self.inner.health().await
    }
}

#[async_trait]
impl TtsPort for HttpTts {
    async fn synthesize<'a>(
        &self,
        text: &str,
        language: &str,
        voice_reference: Option<&'a Path>,
    ) -> Result<Synthesis, PortError> {
        // The reference WAV ships inline; profiles are short samples
        let voice_reference = match voice_reference {
            Some(path) => {
                let bytes = tokio::fs::read(path).await.map_err(|e| {
                    PortError::InvalidPayload(format!("voice reference {}: {e}", path.display()))
                })?;
                Some(BASE64.encode(bytes))
            }
            None => None,
        };
        let request = TtsRequest {
            text,
            language,
            voice_reference,
        };
        let response: TtsResponse = self.inner.post_json("/v1/synthesize", &request).await?;
        let pcm = BASE64
            .decode(&response.audio)
            .map_err(|e| PortError::InvalidPayload(format!("tts audio: {e}")))?;
        Ok(Synthesis {
            pcm,
            sample_rate: response.sample_rate,
            voice_reference_used: response.voice_reference_used,
        })
    }
}
