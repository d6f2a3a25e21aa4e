//! Per-connection inbound rate limiting
//!
//! Two fixed windows per connection: audio chunks per second and audio
//! bytes per minute. A frame over either cap is dropped; the violation is
//! logged once per window to keep a misbehaving client from flooding the
//! logs as well.

use std::time::{Duration, Instant};
use tracing::warn;

use crate::config::RateLimitConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Accept,
    /// Over the chunks/second cap
    TooManyChunks,
    /// Over the bytes/minute cap
    TooManyBytes,
}

/// Fixed-window counters for one connection. Not shared; each connection's
/// receive task owns its limiter.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    second_start: Instant,
    chunks_this_second: u32,
    minute_start: Instant,
    bytes_this_minute: usize,
    warned_this_window: bool,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let now = Instant::now();
        Self {
            config,
            second_start: now,
            chunks_this_second: 0,
            minute_start: now,
            bytes_this_minute: 0,
            warned_this_window: false,
        }
    }

    /// Account one audio chunk of `bytes` length
    pub fn check(&mut self, bytes: usize) -> RateDecision {
        let now = Instant::now();

        if now.duration_since(self.second_start) >= Duration::from_secs(1) {
            self.second_start = now;
            self.chunks_this_second = 0;
            self.warned_this_window = false;
        }
        if now.duration_since(self.minute_start) >= Duration::from_secs(60) {
            self.minute_start = now;
            self.bytes_this_minute = 0;
        }

        if self.config.max_chunks_per_second > 0
            && self.chunks_this_second >= self.config.max_chunks_per_second
        {
            self.warn_once("chunks/second");
            return RateDecision::TooManyChunks;
        }
        if self.config.max_bytes_per_minute > 0
            && self.bytes_this_minute + bytes > self.config.max_bytes_per_minute
        {
            self.warn_once("bytes/minute");
            return RateDecision::TooManyBytes;
        }

        self.chunks_this_second += 1;
        self.bytes_this_minute += bytes;
        RateDecision::Accept
    }

    fn warn_once(&mut self, which: &str) {
        if !self.warned_this_window {
            warn!("Rate limit exceeded ({which}); dropping audio frames");
            self.warned_this_window = true;
        }
    }
}
