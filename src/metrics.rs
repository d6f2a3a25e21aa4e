//! Process-wide counters
//!
//! Cheap atomic counters incremented from the hot paths and snapshotted
//! by the status endpoint. No histograms, no exporters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counter block shared across the connection manager and pipeline
#[derive(Debug, Default)]
pub struct Metrics {
    /// Messages dropped because a listener's outbound queue was full
    pub slow_consumer_drops: AtomicU64,
    /// Input bytes dropped by chunk buffer overflow
    pub chunk_bytes_dropped: AtomicU64,
    /// Audio frames rejected by rate limiting
    pub rate_limited_frames: AtomicU64,
    /// Processor cycles that produced fan-out
    pub cycles_processed: AtomicU64,
    /// Processor cycles dropped as silence/noise
    pub cycles_dropped_noise: AtomicU64,
    /// Translation cache hits
    pub cache_hits: AtomicU64,
    /// Translation cache misses
    pub cache_misses: AtomicU64,
    /// ASR port failures (including deadline expiry)
    pub asr_failures: AtomicU64,
    /// MT port failures
    pub mt_failures: AtomicU64,
    /// TTS port failures
    pub tts_failures: AtomicU64,
    /// Signaling frames forwarded peer-to-peer
    pub signaling_relayed: AtomicU64,
    /// Signaling frames dropped because the target was absent
    pub signaling_dropped: AtomicU64,
    /// Connections evicted by a reconnect for the same (user, room)
    pub connections_replaced: AtomicU64,
}

/// Point-in-time copy of every counter, serialized by the status route
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub slow_consumer_drops: u64,
    pub chunk_bytes_dropped: u64,
    pub rate_limited_frames: u64,
    pub cycles_processed: u64,
    pub cycles_dropped_noise: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub asr_failures: u64,
    pub mt_failures: u64,
    pub tts_failures: u64,
    pub signaling_relayed: u64,
    pub signaling_dropped: u64,
    pub connections_replaced: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            slow_consumer_drops: self.slow_consumer_drops.load(Ordering::Relaxed),
            chunk_bytes_dropped: self.chunk_bytes_dropped.load(Ordering::Relaxed),
            rate_limited_frames: self.rate_limited_frames.load(Ordering::Relaxed),
            cycles_processed: self.cycles_processed.load(Ordering::Relaxed),
            cycles_dropped_noise: self.cycles_dropped_noise.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            asr_failures: self.asr_failures.load(Ordering::Relaxed),
            mt_failures: self.mt_failures.load(Ordering::Relaxed),
            tts_failures: self.tts_failures.load(Ordering::Relaxed),
            signaling_relayed: self.signaling_relayed.load(Ordering::Relaxed),
            signaling_dropped: self.signaling_dropped.load(Ordering::Relaxed),
            connections_replaced: self.connections_replaced.load(Ordering::Relaxed),
        }
    }
}
