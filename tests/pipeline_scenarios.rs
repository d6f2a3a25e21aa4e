//! End-to-end pipeline scenarios
//!
//! Drives the real connection manager, pipelines, translation cache, and
//! stream processors against scripted ASR/MT/TTS fakes, then asserts on
//! the frames each listener's outbound queue receives.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use babelroom::config::PipelineConfig;
use babelroom::metrics::Metrics;
use babelroom::models::directory::StaticDirectory;
use babelroom::models::loader::ModelLoader;
use babelroom::models::{AsrPort, MtPort, PortError, Synthesis, Transcription, TtsPort, VoiceProfilePort};
use babelroom::pipeline::{Pipelines, ProcessorContext, TranslationCache};
use babelroom::rooms::{Connection, ConnectionManager};
use babelroom::server::protocol::ServerMessage;
use babelroom::types::{LanguagePair, UserId};
use babelroom::voice::profile::VoiceProfile;

// ─── Scripted ports ──────────────────────────────────────────

/// Returns queued transcriptions in order, then silence
struct ScriptedAsr {
    script: Mutex<VecDeque<Transcription>>,
    calls: AtomicUsize,
}

impl ScriptedAsr {
    fn new(lines: Vec<(&str, &str)>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(
                lines
                    .into_iter()
                    .map(|(text, lang)| Transcription {
                        text: text.to_string(),
                        detected_language: Some(lang.to_string()),
                        confidence: 0.9,
                    })
                    .collect(),
            ),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl AsrPort for ScriptedAsr {
    async fn transcribe<'a>(
        &self,
        _pcm: &[u8],
        _sample_rate: u32,
        _language_hint: Option<&'a str>,
    ) -> Result<Transcription, PortError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.script.lock().unwrap().pop_front().unwrap_or(Transcription {
            text: String::new(),
            detected_language: None,
            confidence: 0.0,
        }))
    }
}

/// Dictionary translator that counts its calls
struct DictMt {
    entries: HashMap<(String, String, String), String>,
    calls: AtomicUsize,
}

impl DictMt {
    fn new(entries: Vec<(&str, &str, &str, &str)>) -> Arc<Self> {
        Arc::new(Self {
            entries: entries
                .into_iter()
                .map(|(text, src, tgt, out)| {
                    (
                        (text.to_string(), src.to_string(), tgt.to_string()),
                        out.to_string(),
                    )
                })
                .collect(),
            calls: AtomicUsize::new(0),
        })
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MtPort for DictMt {
    async fn translate(
        &self,
        text: &str,
        source: &str,
        target: &str,
    ) -> Result<String, PortError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let key = (text.to_string(), source.to_string(), target.to_string());
        Ok(self
            .entries
            .get(&key)
            .cloned()
            .unwrap_or_else(|| format!("{text} [{target}]")))
    }
}

/// Synthesizer that reports whether it honored the voice reference
struct FakeTts {
    calls: AtomicUsize,
}

impl FakeTts {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl TtsPort for FakeTts {
    async fn synthesize<'a>(
        &self,
        text: &str,
        _language: &str,
        voice_reference: Option<&'a Path>,
    ) -> Result<Synthesis, PortError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Synthesis {
            pcm: text.as_bytes().to_vec(),
            sample_rate: 22_050,
            voice_reference_used: voice_reference.is_some(),
        })
    }
}

/// Grants a (dummy-path) profile to the listed users
struct FixedProfiles {
    users: Vec<UserId>,
}

#[async_trait]
impl VoiceProfilePort for FixedProfiles {
    async fn get(&self, user_id: UserId) -> Option<VoiceProfile> {
        self.users.contains(&user_id).then(|| VoiceProfile {
            user_id,
            reference_audio_path: PathBuf::from("ref.wav"),
            language: "pt".to_string(),
            created_at: chrono::Utc::now(),
        })
    }
}

// ─── Harness ─────────────────────────────────────────────────

struct Harness {
    manager: Arc<ConnectionManager>,
    pipelines: Arc<Pipelines>,
    metrics: Arc<Metrics>,
}

fn fast_config() -> PipelineConfig {
    PipelineConfig {
        cycle_interval_ms: 20,
        min_block_ms: 10,
        max_block_ms: 1_000,
        cycle_deadline_ms: 1_000,
        outbound_channel_depth: 32,
        ..PipelineConfig::default()
    }
}

fn harness(
    asr: Arc<dyn AsrPort>,
    mt: Arc<dyn MtPort>,
    tts: Arc<dyn TtsPort>,
    profiles: Arc<dyn VoiceProfilePort>,
    config: PipelineConfig,
) -> Harness {
    let metrics = Arc::new(Metrics::new());
    let manager = Arc::new(ConnectionManager::new(
        Arc::new(StaticDirectory::new()),
        metrics.clone(),
        config.outbound_channel_depth,
        50,
    ));
    let cache = Arc::new(TranslationCache::new(
        config.translation_cache_size,
        Duration::from_secs(config.translation_cache_ttl_secs),
    ));
    let pipelines = Arc::new(Pipelines::new(
        ProcessorContext {
            manager: manager.clone(),
            loader: Arc::new(ModelLoader::preloaded(asr, mt, tts)),
            cache,
            voice_profiles: profiles,
            metrics: metrics.clone(),
            config,
        },
        Duration::from_secs(2),
    ));
    Harness {
        manager,
        pipelines,
        metrics,
    }
}

impl Harness {
    fn join(&self, room: &str, input: &str, output: &str) -> (UserId, Arc<Connection>) {
        let user_id = uuid::Uuid::new_v4();
        let outcome = self
            .manager
            .connect(
                user_id,
                "tester".to_string(),
                room.to_string(),
                LanguagePair::new(input, output),
            )
            .unwrap();
        (user_id, outcome.connection)
    }

    /// Half a second of 16 kHz PCM16; comfortably over the min block
    fn speak(&self, user_id: UserId) {
        self.pipelines.feed(user_id, &vec![0u8; 16_000], None);
    }
}

/// Pull frames until a `translated_audio` arrives
async fn next_translated(conn: &Arc<Connection>) -> ServerMessage {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let message = conn.next_outbound().await.expect("connection closed");
            if matches!(message, ServerMessage::TranslatedAudio { .. }) {
                return message;
            }
        }
    })
    .await
    .expect("no translated_audio within 2s")
}

/// True when nothing but captions/roster traffic arrives for `window`
async fn no_translated_audio_for(conn: &Arc<Connection>, window: Duration) -> bool {
    tokio::time::timeout(window, async {
        loop {
            match conn.next_outbound().await {
                Some(ServerMessage::TranslatedAudio { .. }) => return false,
                Some(_) => continue,
                None => return true,
            }
        }
    })
    .await
    .unwrap_or(true)
}

// ─── Scenarios ───────────────────────────────────────────────

/// Same-language listener hears the cloned voice with matching texts
#[tokio::test]
async fn same_language_passthrough() {
    let h = harness(
        ScriptedAsr::new(vec![("Olá mundo", "pt")]),
        DictMt::new(vec![]),
        FakeTts::new(),
        Arc::new(FixedProfiles { users: vec![] }),
        fast_config(),
    );

    let (speaker, speaker_conn) = h.join("room", "pt", "pt");
    let (_listener, listener_conn) = h.join("room", "en", "pt");

    h.pipelines.start_processing(&speaker_conn);
    h.speak(speaker);

    match next_translated(&listener_conn).await {
        ServerMessage::TranslatedAudio {
            text,
            original_text,
            detected_language,
            seq,
            ..
        } => {
            assert_eq!(text, "Olá mundo");
            assert_eq!(original_text, "Olá mundo");
            assert_eq!(detected_language, "pt");
            assert_eq!(seq, 1);
        }
        other => panic!("unexpected {other:?}"),
    }
}

/// With a voice profile, same-language output is synthesized and honest
/// about it
#[tokio::test]
async fn same_language_cloned_voice_sets_no_fallback() {
    let speaker_id = uuid::Uuid::new_v4();
    let h = harness(
        ScriptedAsr::new(vec![("Olá mundo", "pt")]),
        DictMt::new(vec![]),
        FakeTts::new(),
        Arc::new(FixedProfiles {
            users: vec![speaker_id],
        }),
        fast_config(),
    );

    let outcome = h
        .manager
        .connect(
            speaker_id,
            "ana".to_string(),
            "room".to_string(),
            LanguagePair::new("pt", "pt"),
        )
        .unwrap();
    let (_listener, listener_conn) = h.join("room", "en", "pt");

    h.pipelines.start_processing(&outcome.connection);
    h.speak(speaker_id);

    match next_translated(&listener_conn).await {
        ServerMessage::TranslatedAudio {
            voice_fallback,
            text,
            ..
        } => {
            assert!(!voice_fallback);
            assert_eq!(text, "Olá mundo");
        }
        other => panic!("unexpected {other:?}"),
    }
}

/// Without a profile, same-language listeners get the original audio and
/// voice_fallback is set
#[tokio::test]
async fn same_language_without_profile_passes_audio_through() {
    let h = harness(
        ScriptedAsr::new(vec![("Olá mundo", "pt")]),
        DictMt::new(vec![]),
        FakeTts::new(),
        Arc::new(FixedProfiles { users: vec![] }),
        fast_config(),
    );

    let (speaker, speaker_conn) = h.join("room", "pt", "pt");
    let (_listener, listener_conn) = h.join("room", "en", "pt");

    h.pipelines.start_processing(&speaker_conn);
    h.speak(speaker);

    match next_translated(&listener_conn).await {
        ServerMessage::TranslatedAudio {
            voice_fallback,
            audio,
            ..
        } => {
            assert!(voice_fallback);
            // Passthrough keeps the input rate rather than the TTS rate
            assert_eq!(audio.sample_rate, 16_000);
        }
        other => panic!("unexpected {other:?}"),
    }
}

/// One speaker, listeners wanting different languages, MT deduplicated by
/// the cache
#[tokio::test]
async fn cross_language_fan_out() {
    let mt = DictMt::new(vec![
        ("Bom dia", "pt", "en", "Good morning"),
        ("Bom dia", "pt", "es", "Buenos días"),
    ]);
    let h = harness(
        ScriptedAsr::new(vec![("Bom dia", "pt")]),
        mt.clone(),
        FakeTts::new(),
        Arc::new(FixedProfiles { users: vec![] }),
        fast_config(),
    );

    let (speaker, speaker_conn) = h.join("room", "pt", "pt");
    let (_l1, l1_conn) = h.join("room", "en", "en");
    let (_l2, l2_conn) = h.join("room", "es", "es");
    let (_l3, l3_conn) = h.join("room", "en", "en");

    h.pipelines.start_processing(&speaker_conn);
    h.speak(speaker);

    match next_translated(&l1_conn).await {
        ServerMessage::TranslatedAudio { text, .. } => assert_eq!(text, "Good morning"),
        other => panic!("unexpected {other:?}"),
    }
    match next_translated(&l2_conn).await {
        ServerMessage::TranslatedAudio { text, .. } => assert_eq!(text, "Buenos días"),
        other => panic!("unexpected {other:?}"),
    }
    match next_translated(&l3_conn).await {
        ServerMessage::TranslatedAudio { text, .. } => assert_eq!(text, "Good morning"),
        other => panic!("unexpected {other:?}"),
    }

    // Two unique (src, tgt) pairs -> exactly two MT calls; the third
    // listener was served from the cache
    assert_eq!(mt.call_count(), 2);
    assert_eq!(h.metrics.snapshot().cache_hits, 1);
}

/// Ten cycles of near-silence produce nothing
#[tokio::test]
async fn noise_cycles_are_dropped() {
    let lines: Vec<(&str, &str)> = (0..10).map(|_| ("...", "pt")).collect();
    let h = harness(
        ScriptedAsr::new(lines),
        DictMt::new(vec![]),
        FakeTts::new(),
        Arc::new(FixedProfiles { users: vec![] }),
        fast_config(),
    );

    let (speaker, speaker_conn) = h.join("room", "pt", "pt");
    let (_listener, listener_conn) = h.join("room", "en", "en");

    h.pipelines.start_processing(&speaker_conn);
    for _ in 0..10 {
        h.speak(speaker);
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    assert!(no_translated_audio_for(&listener_conn, Duration::from_millis(300)).await);
    assert!(h.metrics.snapshot().cycles_dropped_noise >= 1);
    assert_eq!(h.metrics.snapshot().cycles_processed, 0);
}

/// Sequence numbers increase strictly per (speaker, listener) pair
#[tokio::test]
async fn seq_is_monotonic_per_listener() {
    let h = harness(
        ScriptedAsr::new(vec![("um", "pt"), ("dois", "pt"), ("três", "pt")]),
        DictMt::new(vec![]),
        FakeTts::new(),
        Arc::new(FixedProfiles { users: vec![] }),
        fast_config(),
    );

    let (speaker, speaker_conn) = h.join("room", "pt", "pt");
    let (_listener, listener_conn) = h.join("room", "en", "en");

    h.pipelines.start_processing(&speaker_conn);

    let mut last_seq = 0;
    for _ in 0..3 {
        h.speak(speaker);
        match next_translated(&listener_conn).await {
            ServerMessage::TranslatedAudio { seq, .. } => {
                assert!(seq > last_seq, "seq {seq} not greater than {last_seq}");
                last_seq = seq;
            }
            other => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!(last_seq, 3);
}

/// An MT failure for one listener leaves the others untouched
#[tokio::test]
async fn mt_failure_skips_only_that_listener() {
    struct FlakyMt;
    #[async_trait]
    impl MtPort for FlakyMt {
        async fn translate(
            &self,
            text: &str,
            _source: &str,
            target: &str,
        ) -> Result<String, PortError> {
            if target == "de" {
                Err(PortError::Remote("no de model".to_string()))
            } else {
                Ok(format!("{text} [{target}]"))
            }
        }
    }

    let h = harness(
        ScriptedAsr::new(vec![("Bom dia", "pt")]),
        Arc::new(FlakyMt),
        FakeTts::new(),
        Arc::new(FixedProfiles { users: vec![] }),
        fast_config(),
    );

    let (speaker, speaker_conn) = h.join("room", "pt", "pt");
    let (_broken, broken_conn) = h.join("room", "de", "de");
    let (_healthy, healthy_conn) = h.join("room", "en", "en");

    h.pipelines.start_processing(&speaker_conn);
    h.speak(speaker);

    match next_translated(&healthy_conn).await {
        ServerMessage::TranslatedAudio { text, .. } => assert_eq!(text, "Bom dia [en]"),
        other => panic!("unexpected {other:?}"),
    }
    assert!(no_translated_audio_for(&broken_conn, Duration::from_millis(200)).await);
    assert_eq!(h.metrics.snapshot().mt_failures, 1);
}

/// A stalled listener loses its oldest frames; a healthy one sees all
#[tokio::test]
async fn slow_consumer_drops_oldest_without_blocking_others() {
    let lines: Vec<(&str, &str)> = vec![
        ("um", "pt"),
        ("dois", "pt"),
        ("três", "pt"),
        ("quatro", "pt"),
        ("cinco", "pt"),
        ("seis", "pt"),
    ];
    let config = PipelineConfig {
        outbound_channel_depth: 2,
        ..fast_config()
    };
    let h = harness(
        ScriptedAsr::new(lines),
        DictMt::new(vec![]),
        FakeTts::new(),
        Arc::new(FixedProfiles { users: vec![] }),
        config,
    );

    let (speaker, speaker_conn) = h.join("room", "pt", "pt");
    let (_stalled, stalled_conn) = h.join("room", "en", "en");
    let (_healthy, healthy_conn) = h.join("room", "es", "es");

    h.pipelines.start_processing(&speaker_conn);

    // Healthy listener drains every cycle; the stalled one never reads
    let mut healthy_seqs = Vec::new();
    for _ in 0..6 {
        h.speak(speaker);
        match next_translated(&healthy_conn).await {
            ServerMessage::TranslatedAudio { seq, .. } => healthy_seqs.push(seq),
            other => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!(healthy_seqs, vec![1, 2, 3, 4, 5, 6]);

    // The stalled queue kept only the newest frames
    assert!(h.metrics.snapshot().slow_consumer_drops > 0);
    let mut stalled_seqs = Vec::new();
    stalled_conn.close(babelroom::rooms::CloseReason::Normal);
    while let Some(message) = stalled_conn.next_outbound().await {
        if let ServerMessage::TranslatedAudio { seq, .. } = message {
            stalled_seqs.push(seq);
        }
    }
    assert!(!stalled_seqs.is_empty());
    assert!(stalled_seqs.len() <= 2);
    assert_eq!(*stalled_seqs.last().unwrap(), 6);
}

/// Mute suppresses the pipeline but keeps the processor alive
#[tokio::test]
async fn mute_suppresses_processing() {
    let h = harness(
        ScriptedAsr::new(vec![("segredo", "pt"), ("depois", "pt")]),
        DictMt::new(vec![]),
        FakeTts::new(),
        Arc::new(FixedProfiles { users: vec![] }),
        fast_config(),
    );

    let (speaker, speaker_conn) = h.join("room", "pt", "pt");
    let (_listener, listener_conn) = h.join("room", "en", "en");

    h.pipelines.start_processing(&speaker_conn);

    speaker_conn.set_muted(true);
    h.speak(speaker);
    assert!(no_translated_audio_for(&listener_conn, Duration::from_millis(150)).await);

    speaker_conn.set_muted(false);
    h.speak(speaker);
    match next_translated(&listener_conn).await {
        // The muted utterance was discarded, not replayed
        ServerMessage::TranslatedAudio { original_text, .. } => {
            assert_eq!(original_text, "segredo")
        }
        other => panic!("unexpected {other:?}"),
    }
}

/// A TTS engine that rejects voice references still serves listeners via
/// the default-voice retry, with voice_fallback set honestly
#[tokio::test]
async fn tts_retries_without_voice_reference() {
    struct NoCloneTts;
    #[async_trait]
    impl TtsPort for NoCloneTts {
        async fn synthesize<'a>(
            &self,
            text: &str,
            _language: &str,
            voice_reference: Option<&'a Path>,
        ) -> Result<Synthesis, PortError> {
            if voice_reference.is_some() {
                Err(PortError::Remote("cloning unsupported".to_string()))
            } else {
                Ok(Synthesis {
                    pcm: text.as_bytes().to_vec(),
                    sample_rate: 22_050,
                    voice_reference_used: false,
                })
            }
        }
    }

    let speaker_id = uuid::Uuid::new_v4();
    let h = harness(
        ScriptedAsr::new(vec![("Bom dia", "pt")]),
        DictMt::new(vec![("Bom dia", "pt", "en", "Good morning")]),
        Arc::new(NoCloneTts),
        Arc::new(FixedProfiles {
            users: vec![speaker_id],
        }),
        fast_config(),
    );

    let outcome = h
        .manager
        .connect(
            speaker_id,
            "ana".to_string(),
            "room".to_string(),
            LanguagePair::new("pt", "pt"),
        )
        .unwrap();
    let (_listener, listener_conn) = h.join("room", "en", "en");

    h.pipelines.start_processing(&outcome.connection);
    h.speak(speaker_id);

    match next_translated(&listener_conn).await {
        ServerMessage::TranslatedAudio {
            text,
            voice_fallback,
            ..
        } => {
            assert_eq!(text, "Good morning");
            assert!(voice_fallback);
        }
        other => panic!("unexpected {other:?}"),
    }
}

/// A language update on the listener takes effect on the next cycle
#[tokio::test]
async fn language_update_applies_next_cycle() {
    let mt = DictMt::new(vec![
        ("um", "pt", "en", "one"),
        ("dois", "pt", "fr", "deux"),
    ]);
    let h = harness(
        ScriptedAsr::new(vec![("um", "pt"), ("dois", "pt")]),
        mt,
        FakeTts::new(),
        Arc::new(FixedProfiles { users: vec![] }),
        fast_config(),
    );

    let (speaker, speaker_conn) = h.join("room", "pt", "pt");
    let (listener, listener_conn) = h.join("room", "en", "en");

    h.pipelines.start_processing(&speaker_conn);
    h.speak(speaker);
    match next_translated(&listener_conn).await {
        ServerMessage::TranslatedAudio { text, .. } => assert_eq!(text, "one"),
        other => panic!("unexpected {other:?}"),
    }

    h.pipelines
        .update_language(listener, LanguagePair::new("fr", "fr"));
    h.speak(speaker);
    match next_translated(&listener_conn).await {
        ServerMessage::TranslatedAudio { text, .. } => assert_eq!(text, "deux"),
        other => panic!("unexpected {other:?}"),
    }
}

/// A port that overruns the cycle deadline reads as a recoverable failure
#[tokio::test]
async fn deadline_expiry_drops_the_cycle() {
    struct StalledAsr;
    #[async_trait]
    impl AsrPort for StalledAsr {
        async fn transcribe<'a>(
            &self,
            _pcm: &[u8],
            _sample_rate: u32,
            _language_hint: Option<&'a str>,
        ) -> Result<Transcription, PortError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            unreachable!("the deadline fires first")
        }
    }

    let config = PipelineConfig {
        cycle_deadline_ms: 50,
        ..fast_config()
    };
    let h = harness(
        Arc::new(StalledAsr),
        DictMt::new(vec![]),
        FakeTts::new(),
        Arc::new(FixedProfiles { users: vec![] }),
        config,
    );

    let (speaker, speaker_conn) = h.join("room", "pt", "pt");
    let (_listener, listener_conn) = h.join("room", "en", "en");

    h.pipelines.start_processing(&speaker_conn);
    h.speak(speaker);

    assert!(no_translated_audio_for(&listener_conn, Duration::from_millis(300)).await);
    assert!(h.metrics.snapshot().asr_failures >= 1);
}

/// A listener who leaves mid-synthesis is skipped silently
#[tokio::test]
async fn listener_leaving_mid_cycle_is_dropped_silently() {
    let h = harness(
        ScriptedAsr::new(vec![("Bom dia", "pt"), ("Boa tarde", "pt")]),
        DictMt::new(vec![]),
        FakeTts::new(),
        Arc::new(FixedProfiles { users: vec![] }),
        fast_config(),
    );

    let (speaker, speaker_conn) = h.join("room", "pt", "pt");
    let (leaver, _leaver_conn) = h.join("room", "en", "en");
    let (_stays, stays_conn) = h.join("room", "es", "es");

    h.pipelines.start_processing(&speaker_conn);
    h.manager.disconnect(
        leaver,
        &"room".to_string(),
        babelroom::rooms::CloseReason::Normal,
    );

    h.speak(speaker);
    match next_translated(&stays_conn).await {
        ServerMessage::TranslatedAudio { .. } => {}
        other => panic!("unexpected {other:?}"),
    }
}
