//! Deterministic in-process adapters
//!
//! Stand-ins for the remote inference services so the full WebSocket loop
//! can be exercised without any model backend: the recognizer gates on RMS
//! energy and reports what it heard, the translator tags text with the
//! target language, and the synthesizer renders an audible tone whose
//! length tracks the text. Started with `babelroom serve --dev`.

use async_trait::async_trait;
use std::path::Path;

use super::{AsrPort, MtPort, PortError, Synthesis, Transcription, TtsPort};
use crate::voice::audio::{rms_energy, samples_to_bytes, BYTES_PER_SAMPLE};

/// RMS threshold below which a block counts as silence
const SPEECH_RMS_THRESHOLD: f32 = 200.0;

/// Energy-gated recognizer: silence becomes an empty transcript (which the
/// pipeline drops), speech becomes a synthetic utterance describing the
/// block.
#[derive(Debug, Clone, Default)]
pub struct DevAsr;

#[async_trait]
impl AsrPort for DevAsr {
    async fn transcribe<'a>(
        &self,
        pcm: &[u8],
        sample_rate: u32,
        language_hint: Option<&'a str>,
    ) -> Result<Transcription, PortError> {
        let rms = rms_energy(pcm);
        if rms < SPEECH_RMS_THRESHOLD {
            return Ok(Transcription {
                text: String::new(),
                detected_language: None,
                confidence: 0.0,
            });
        }
        let seconds = if sample_rate == 0 {
            0.0
        } else {
            pcm.len() as f64 / (BYTES_PER_SAMPLE as f64 * sample_rate as f64)
        };
        let language = language_hint.unwrap_or(crate::types::DEFAULT_LANGUAGE);
        Ok(Transcription {
            text: format!("speech {seconds:.1}s rms {rms:.0}"),
            detected_language: Some(language.to_string()),
            confidence: 1.0,
        })
    }
}

/// Tags the text instead of translating it
#[derive(Debug, Clone, Default)]
pub struct DevMt;

#[async_trait]
impl MtPort for DevMt {
    async fn translate(
        &self,
        text: &str,
        _source: &str,
        target: &str,
    ) -> Result<String, PortError> {
        Ok(format!("[{target}] {text}"))
    }
}

/// Renders a 440 Hz tone, 80 ms per word, so fan-out is audible end to end
#[derive(Debug, Clone)]
pub struct DevTts {
    pub sample_rate: u32,
}

impl Default for DevTts {
    fn default() -> Self {
        Self {
            sample_rate: 22_050,
        }
    }
}

#[async_trait]
impl TtsPort for DevTts {
    async fn synthesize<'a>(
        &self,
        text: &str,
        _language: &str,
        voice_reference: Option<&'a Path>,
    ) -> Result<Synthesis, PortError> {
        let words = text.split_whitespace().count().max(1);
        let samples_total = (self.sample_rate as usize * words * 80) / 1000;
        let samples: Vec<i16> = (0..samples_total)
            .map(|i| {
                let t = i as f32 / self.sample_rate as f32;
                ((t * 440.0 * 2.0 * std::f32::consts::PI).sin() * 8_000.0) as i16
            })
            .collect();
        Ok(Synthesis {
            pcm: samples_to_bytes(&samples),
            sample_rate: self.sample_rate,
            voice_reference_used: voice_reference.is_some(),
        })
    }
}
