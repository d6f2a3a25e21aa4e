//! Per-speaker streaming pipeline
//!
//! [`Pipelines`] is the registry the WebSocket handler drives: it spawns a
//! [`StreamProcessor`] task per active speaker, feeds inbound PCM into the
//! speaker's chunk buffer, hot-swaps languages, and stops processors within
//! a bounded shutdown window.

pub mod cache;
pub mod chunk_buffer;
pub mod processor;

pub use cache::TranslationCache;
pub use chunk_buffer::ChunkBuffer;
pub use processor::{
    PipelineError, ProcessorContext, ProcessorPhase, StreamProcessor,
};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::metrics::Metrics;
use crate::rooms::Connection;
use crate::types::{LanguagePair, UserId};

struct ActiveProcessor {
    buffer: Arc<ChunkBuffer>,
    stop_tx: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
    connection_id: uuid::Uuid,
    phase: Arc<processor::PhaseCell>,
}

/// Registry of running stream processors, one per active speaker
pub struct Pipelines {
    ctx: ProcessorContext,
    active: Mutex<HashMap<UserId, ActiveProcessor>>,
    shutdown_window: Duration,
}

impl Pipelines {
    pub fn new(ctx: ProcessorContext, shutdown_window: Duration) -> Self {
        Self {
            ctx,
            active: Mutex::new(HashMap::new()),
            shutdown_window,
        }
    }

    /// Spawn the processor for this connection. Idempotent: calling again
    /// for the same live connection is a no-op; a processor left over from
    /// a replaced connection is told to stop and superseded.
    pub fn start_processing(&self, conn: &Arc<Connection>) {
        let mut active = self.active.lock().unwrap();
        if let Some(existing) = active.get(&conn.user_id) {
            if existing.connection_id == conn.id {
                return;
            }
            // Stale processor from an evicted connection
            let _ = existing.stop_tx.send(true);
        }

        let buffer = Arc::new(ChunkBuffer::new(self.ctx.config.chunk_buffer_max_bytes));
        let (stop_tx, stop_rx) = watch::channel(false);
        let phase = Arc::new(processor::PhaseCell::new());
        let processor = StreamProcessor::new(
            self.ctx.clone(),
            conn.clone(),
            buffer.clone(),
            stop_rx,
            phase.clone(),
        );
        let task = tokio::spawn(processor.run());
        active.insert(
            conn.user_id,
            ActiveProcessor {
                buffer,
                stop_tx,
                task,
                connection_id: conn.id,
                phase,
            },
        );
    }

    /// Enqueue inbound PCM for the speaker. Overflow drops the oldest
    /// buffered bytes; the count lands in the metrics.
    pub fn feed(&self, user_id: UserId, pcm: &[u8], _timestamp_ms: Option<u64>) -> bool {
        let buffer = {
            let active = self.active.lock().unwrap();
            match active.get(&user_id) {
                Some(entry) => entry.buffer.clone(),
                None => return false,
            }
        };
        let dropped = buffer.push(pcm);
        if dropped > 0 {
            Metrics::add(&self.ctx.metrics.chunk_bytes_dropped, dropped as u64);
            debug!("Chunk buffer for {} overflowed; dropped {} bytes", user_id, dropped);
        }
        true
    }

    /// Hot-swap the speaker's languages; the next cycle uses the new pair.
    /// Idempotent in its arguments.
    pub fn update_language(&self, user_id: UserId, languages: LanguagePair) -> bool {
        match self.ctx.manager.get_connection(user_id) {
            Some(conn) => {
                if conn.languages() != languages {
                    conn.set_languages(languages);
                }
                true
            }
            None => false,
        }
    }

    /// Cooperative stop: signal the processor, let it finish its final
    /// drain, and abort it only if it overruns the shutdown window.
    pub async fn stop_processing(&self, user_id: UserId) {
        let entry = self.active.lock().unwrap().remove(&user_id);
        self.wait_stop(user_id, entry).await;
    }

    /// Stop the processor only if it still belongs to `conn`. A connection
    /// evicted by a replacement must not tear down its successor's
    /// processor.
    pub async fn stop_processing_conn(&self, conn: &Arc<Connection>) {
        let entry = {
            let mut active = self.active.lock().unwrap();
            let owns_slot = active
                .get(&conn.user_id)
                .map(|existing| existing.connection_id == conn.id)
                .unwrap_or(false);
            if owns_slot {
                active.remove(&conn.user_id)
            } else {
                None
            }
        };
        self.wait_stop(conn.user_id, entry).await;
    }

    async fn wait_stop(&self, user_id: UserId, entry: Option<ActiveProcessor>) {
        let Some(entry) = entry else {
            return;
        };
        let _ = entry.stop_tx.send(true);
        let mut task = entry.task;
        tokio::select! {
            _ = &mut task => debug!("Processor for {} stopped cleanly", user_id),
            _ = tokio::time::sleep(self.shutdown_window) => {
                warn!(
                    "Processor for {} exceeded the {}ms shutdown window; aborting",
                    user_id,
                    self.shutdown_window.as_millis()
                );
                task.abort();
            }
        }
    }

    pub fn is_active(&self, user_id: UserId) -> bool {
        self.active.lock().unwrap().contains_key(&user_id)
    }

    /// Current lifecycle phase of a speaker's processor, if one is
    /// registered
    pub fn phase(&self, user_id: UserId) -> Option<ProcessorPhase> {
        self.active
            .lock()
            .unwrap()
            .get(&user_id)
            .map(|entry| entry.phase.get())
    }

    pub fn count(&self) -> usize {
        self.active.lock().unwrap().len()
    }
}
