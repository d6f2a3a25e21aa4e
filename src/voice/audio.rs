//! PCM16 helpers
//!
//! Everything on the wire is 16-bit signed little-endian mono PCM, base64
//! inside JSON. Input arrives at 16 kHz, synthesized output leaves at
//! 22.05 kHz. These helpers keep the byte/sample/duration math in one place.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

/// Bytes per PCM16 sample
pub const BYTES_PER_SAMPLE: usize = 2;

/// A block of raw PCM16 bytes tagged with its sample rate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcmBlock {
    pub bytes: Vec<u8>,
    pub sample_rate: u32,
}

impl PcmBlock {
    pub fn new(bytes: Vec<u8>, sample_rate: u32) -> Self {
        Self { bytes, sample_rate }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Duration of the block in seconds
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.bytes.len() as f64 / (BYTES_PER_SAMPLE as f64 * self.sample_rate as f64)
    }

    /// Decode to i16 samples; a trailing odd byte is ignored
    pub fn samples(&self) -> Vec<i16> {
        self.bytes
            .chunks_exact(BYTES_PER_SAMPLE)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect()
    }

    /// Base64 form for the wire payload
    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.bytes)
    }
}

/// Decode a base64 audio payload into raw bytes
pub fn decode_base64_audio(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    BASE64.decode(data)
}

/// Encode i16 samples as little-endian bytes
pub fn samples_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * BYTES_PER_SAMPLE);
    for s in samples {
        bytes.extend_from_slice(&s.to_le_bytes());
    }
    bytes
}

/// RMS energy of a PCM16 byte block, for diagnostics on suspect cycles
pub fn rms_energy(bytes: &[u8]) -> f32 {
    let samples: Vec<i16> = bytes
        .chunks_exact(BYTES_PER_SAMPLE)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect();
    if samples.is_empty() {
        return 0.0;
    }
    (samples.iter().map(|&s| (s as f32).powi(2)).sum::<f32>() / samples.len() as f32).sqrt()
}
