//! Stream processor
//!
//! One task per active speaker. Each cycle sleeps, drains the speaker's
//! chunk buffer, runs ASR on the aggregated block, then fans the result out
//! to every other room member in their own target language, consulting the
//! translation cache, synthesizing with the speaker's cloned voice when a
//! profile exists, and stamping a monotonic per-listener sequence number.
//!
//! Failure policy: an ASR error drops the cycle, an MT error skips that
//! listener, a TTS error retries once without the voice reference, a send
//! error drops the message. Only a missing model stalls the processor, and
//! then with capped exponential backoff. Nothing here ever blocks on a slow
//! listener.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::metrics::Metrics;
use crate::models::loader::ModelLoader;
use crate::models::{PortError, Synthesis, VoiceProfilePort};
use crate::pipeline::cache::TranslationCache;
use crate::pipeline::chunk_buffer::ChunkBuffer;
use crate::rooms::{Connection, ConnectionManager};
use crate::server::protocol::{now_millis, AudioPayload, ErrorStage, ServerMessage};
use crate::types::{RoomId, UserId};
use crate::voice::audio::PcmBlock;
use crate::voice::profile::VoiceProfile;

/// Errors that end or stall a processing cycle
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The loader could not produce the model; retried with backoff
    #[error("model unavailable: {0}")]
    ModelUnavailable(PortError),
    /// Recognition failed for this cycle's block
    #[error("asr failed: {0}")]
    Asr(PortError),
}

/// Shared dependencies handed to every processor task
#[derive(Clone)]
pub struct ProcessorContext {
    pub manager: Arc<ConnectionManager>,
    pub loader: Arc<ModelLoader>,
    pub cache: Arc<TranslationCache>,
    pub voice_profiles: Arc<dyn VoiceProfilePort>,
    pub metrics: Arc<Metrics>,
    pub config: PipelineConfig,
}

/// Capped exponential backoff for model-unavailable stalls
#[derive(Debug)]
struct Backoff {
    current: Duration,
}

impl Backoff {
    const INITIAL: Duration = Duration::from_secs(1);
    const MAX: Duration = Duration::from_secs(30);

    fn new() -> Self {
        Self {
            current: Self::INITIAL,
        }
    }

    fn next(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(Self::MAX);
        delay
    }

    fn reset(&mut self) {
        self.current = Self::INITIAL;
    }
}

/// Trivial ASR outputs that read as silence or noise
fn is_noise(text: &str) -> bool {
    text.chars()
        .all(|c| c.is_whitespace() || matches!(c, '.' | ',' | '?' | '!' | '…'))
}

/// Lifecycle of one processor task. Only `Running` consumes the buffer;
/// `Stopping` finishes the current cycle and the final drain, then exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorPhase {
    Idle,
    Running,
    Stopping,
    Stopped,
}

/// Shared cell the registry reads for status reporting
#[derive(Debug)]
pub struct PhaseCell(std::sync::Mutex<ProcessorPhase>);

impl PhaseCell {
    pub fn new() -> Self {
        Self(std::sync::Mutex::new(ProcessorPhase::Idle))
    }

    pub fn set(&self, phase: ProcessorPhase) {
        *self.0.lock().unwrap() = phase;
    }

    pub fn get(&self) -> ProcessorPhase {
        *self.0.lock().unwrap()
    }
}

impl Default for PhaseCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-speaker pipeline task
pub struct StreamProcessor {
    ctx: ProcessorContext,
    user_id: UserId,
    room_id: RoomId,
    conn: Arc<Connection>,
    buffer: Arc<ChunkBuffer>,
    stop_rx: watch::Receiver<bool>,
    phase: Arc<PhaseCell>,
    /// Monotonic counters per (this speaker -> listener) pair
    seq: HashMap<UserId, u64>,
}

impl StreamProcessor {
    pub fn new(
        ctx: ProcessorContext,
        conn: Arc<Connection>,
        buffer: Arc<ChunkBuffer>,
        stop_rx: watch::Receiver<bool>,
        phase: Arc<PhaseCell>,
    ) -> Self {
        Self {
            user_id: conn.user_id,
            room_id: conn.room_id.clone(),
            ctx,
            conn,
            buffer,
            stop_rx,
            phase,
            seq: HashMap::new(),
        }
    }

    /// Cycle loop; returns when stopped or the connection closes
    pub async fn run(mut self) {
        self.phase.set(ProcessorPhase::Running);
        info!(
            "Stream processor started for {} in room {}",
            self.user_id, self.room_id
        );
        let cycle_interval = self.ctx.config.cycle_interval();
        let min_block = self.ctx.config.min_block_bytes();
        let max_block = self.ctx.config.max_block_bytes();

        let mut close_rx = self.conn.close_signal();
        let mut stop_rx = self.stop_rx.clone();
        let mut pending: Vec<u8> = Vec::new();
        let mut backoff = Backoff::new();

        loop {
            tokio::select! {
                _ = tokio::time::sleep(cycle_interval) => {}
                _ = stop_rx.changed() => break,
                _ = close_rx.changed() => break,
            }

            pending.extend(self.buffer.drain());
            if self.conn.is_muted() {
                // Discard while muted so unmute does not replay a backlog
                pending.clear();
                continue;
            }
            if pending.len() < min_block {
                continue;
            }

            let take = pending.len().min(max_block);
            let block: Vec<u8> = pending.drain(..take).collect();
            match self.process_block(&block).await {
                Ok(()) => backoff.reset(),
                Err(PipelineError::ModelUnavailable(e)) => {
                    let delay = backoff.next();
                    warn!(
                        "Models unavailable for {}: {e}; retrying in {:?}",
                        self.user_id, delay
                    );
                    self.ctx.manager.send(
                        self.user_id,
                        ServerMessage::error(
                            "speech recognition temporarily unavailable",
                            Some(ErrorStage::Asr),
                        ),
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(PipelineError::Asr(e)) => {
                    Metrics::incr(&self.ctx.metrics.asr_failures);
                    let duration = PcmBlock::new(block, self.ctx.config.input_sample_rate)
                        .duration_secs();
                    warn!(
                        "ASR failed for {} ({duration:.1}s block): {e}; dropping cycle",
                        self.user_id
                    );
                }
            }
        }

        // Final drain: whatever is left goes through one last, possibly
        // short, cycle so trailing speech is not lost on a clean stop.
        self.phase.set(ProcessorPhase::Stopping);
        pending.extend(self.buffer.drain());
        if !pending.is_empty() && !self.conn.is_muted() {
            let take = pending.len().min(max_block);
            let block: Vec<u8> = pending.drain(..take).collect();
            if let Err(e) = self.process_block(&block).await {
                debug!("Final drain for {} dropped: {e}", self.user_id);
            }
        }
        self.phase.set(ProcessorPhase::Stopped);
        info!("Stream processor stopped for {}", self.user_id);
    }

    /// One cycle: ASR, noise gate, per-listener MT + TTS fan-out
    async fn process_block(&mut self, block: &[u8]) -> Result<(), PipelineError> {
        let deadline = Instant::now() + self.ctx.config.cycle_deadline();
        let languages = self.conn.languages();

        let asr = self
            .ctx
            .loader
            .asr()
            .await
            .map_err(PipelineError::ModelUnavailable)?;
        let hint = if languages.auto_detect() {
            None
        } else {
            Some(languages.input.as_str())
        };
        let transcription = deadline_call(
            deadline,
            asr.transcribe(block, self.ctx.config.input_sample_rate, hint),
        )
        .await
        .map_err(PipelineError::Asr)?;

        let text = transcription.text.trim().to_string();
        if is_noise(&text) {
            Metrics::incr(&self.ctx.metrics.cycles_dropped_noise);
            return Ok(());
        }

        // The recognizer's detection wins over the hint
        let detected = transcription
            .detected_language
            .filter(|l| !l.is_empty())
            .unwrap_or_else(|| {
                if languages.auto_detect() {
                    crate::types::DEFAULT_LANGUAGE.to_string()
                } else {
                    languages.input.clone()
                }
            });

        let timestamp = now_millis();
        self.ctx.manager.send(
            self.user_id,
            ServerMessage::PartialTranscript {
                text: text.clone(),
                timestamp,
            },
        );

        let voice_profile = self.ctx.voice_profiles.get(self.user_id).await;
        let listeners: Vec<UserId> = self
            .ctx
            .manager
            .get_room_users(&self.room_id)
            .into_iter()
            .filter(|&id| id != self.user_id)
            .collect();

        for listener_id in listeners {
            self.fan_out_to(
                listener_id,
                block,
                &text,
                &detected,
                voice_profile.as_ref(),
                deadline,
                timestamp,
            )
            .await;
        }

        Metrics::incr(&self.ctx.metrics.cycles_processed);
        Ok(())
    }

    /// Translate and synthesize for one listener. All failures are local:
    /// they log, count, and leave every other listener untouched.
    #[allow(clippy::too_many_arguments)]
    async fn fan_out_to(
        &mut self,
        listener_id: UserId,
        block: &[u8],
        original_text: &str,
        detected: &str,
        voice_profile: Option<&VoiceProfile>,
        deadline: Instant,
        timestamp: u64,
    ) {
        let Some(listener) = self.ctx.manager.get_connection(listener_id) else {
            return; // left mid-cycle
        };
        if listener.room_id != self.room_id {
            return;
        }
        let target = listener.languages().output;

        let same_language = target == detected;
        let translated = if same_language {
            original_text.to_string()
        } else {
            match self.translate(original_text, detected, &target, deadline).await {
                Ok(text) => text,
                Err(e) => {
                    Metrics::incr(&self.ctx.metrics.mt_failures);
                    warn!(
                        "MT {detected}->{target} failed for listener {listener_id}: {e}"
                    );
                    self.ctx.manager.send(
                        self.user_id,
                        ServerMessage::error(
                            format!("translation to {target} failed"),
                            Some(ErrorStage::Mt),
                        ),
                    );
                    return;
                }
            }
        };

        self.ctx.manager.send(
            listener_id,
            ServerMessage::PartialTranslation {
                text: translated.clone(),
                timestamp,
            },
        );

        // Same-language listeners hear the cloned voice when a profile
        // exists; otherwise the original audio passes through verbatim.
        let (payload, voice_fallback) = if same_language && voice_profile.is_none() {
            let passthrough = PcmBlock::new(block.to_vec(), self.ctx.config.input_sample_rate);
            (
                AudioPayload::pcm_s16le(passthrough.to_base64(), passthrough.sample_rate),
                true,
            )
        } else {
            match self
                .synthesize(&translated, &target, voice_profile, deadline)
                .await
            {
                Ok((synthesis, fallback)) => {
                    let pcm = PcmBlock::new(synthesis.pcm, synthesis.sample_rate);
                    (
                        AudioPayload::pcm_s16le(pcm.to_base64(), pcm.sample_rate),
                        fallback,
                    )
                }
                Err(e) => {
                    Metrics::incr(&self.ctx.metrics.tts_failures);
                    warn!("TTS for listener {listener_id} ({target}) failed: {e}; skipping");
                    return;
                }
            }
        };

        let seq = {
            let counter = self.seq.entry(listener_id).or_insert(0);
            *counter += 1;
            *counter
        };

        self.ctx.manager.send(
            listener_id,
            ServerMessage::TranslatedAudio {
                audio: payload,
                text: translated,
                original_text: original_text.to_string(),
                detected_language: detected.to_string(),
                seq,
                voice_fallback,
                timestamp,
            },
        );
    }

    /// Cache-first translation
    async fn translate(
        &self,
        text: &str,
        source: &str,
        target: &str,
        deadline: Instant,
    ) -> Result<String, PortError> {
        if let Some(hit) = self.ctx.cache.get(text, source, target) {
            Metrics::incr(&self.ctx.metrics.cache_hits);
            return Ok(hit);
        }
        Metrics::incr(&self.ctx.metrics.cache_misses);

        let mt = self.ctx.loader.mt().await?;
        let translated = deadline_call(deadline, mt.translate(text, source, target)).await?;
        self.ctx
            .cache
            .insert(text, source, target, translated.clone());
        Ok(translated)
    }

    /// Synthesis with one retry without the voice reference. Returns the
    /// synthesis and whether the default voice was used.
    async fn synthesize(
        &self,
        text: &str,
        language: &str,
        voice_profile: Option<&VoiceProfile>,
        deadline: Instant,
    ) -> Result<(Synthesis, bool), PortError> {
        let tts = self.ctx.loader.tts().await?;
        let reference = voice_profile.map(|p| p.reference_audio_path.as_path());

        if let Some(reference) = reference {
            match deadline_call(deadline, tts.synthesize(text, language, Some(reference))).await
            {
                Ok(synthesis) => {
                    let fallback = !synthesis.voice_reference_used;
                    return Ok((synthesis, fallback));
                }
                Err(e) => {
                    debug!("Cloned-voice synthesis failed ({e}); retrying with default voice");
                }
            }
        }

        let synthesis = deadline_call(deadline, tts.synthesize(text, language, None)).await?;
        let fallback = reference.is_some() || !synthesis.voice_reference_used;
        Ok((synthesis, fallback))
    }
}

/// Await a port call under the remaining cycle budget
async fn deadline_call<T>(
    deadline: Instant,
    fut: impl std::future::Future<Output = Result<T, PortError>>,
) -> Result<T, PortError> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    if remaining.is_zero() {
        return Err(PortError::DeadlineExceeded(Duration::ZERO));
    }
    match tokio::time::timeout(remaining, fut).await {
        Ok(result) => result,
        Err(_) => Err(PortError::DeadlineExceeded(remaining)),
    }
}
