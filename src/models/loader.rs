//! Lazy model loader
//!
//! The three logical models (ASR, MT, TTS) load on first use. Concurrent
//! first callers await a single in-flight load; an optional startup preload
//! warms all three in parallel without failing startup; idle models can be
//! unloaded in the background and reload transparently on next use. Each
//! slot gates its own loads only; different kinds never serialize against
//! each other.

use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tracing::{debug, info, warn};

use super::{AsrPort, MtPort, PortError, TtsPort};
use crate::config::InferenceConfig;
use crate::models::remote::{HttpAsr, HttpMt, HttpTts, InferenceEndpoint};

/// The three logical models
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    Asr,
    Mt,
    Tts,
}

impl ModelKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Asr => "asr",
            Self::Mt => "mt",
            Self::Tts => "tts",
        }
    }
}

/// Lifecycle of one slot, surfaced on the status route
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelState {
    Unloaded,
    Loading,
    Ready,
    Unloading,
}

/// Async constructor for one service; invoked on (re)load
pub type Factory<T> = Box<dyn Fn() -> BoxFuture<'static, Result<Arc<T>, PortError>> + Send + Sync>;

/// One lazily loaded service
struct LazySlot<T: ?Sized + Send + Sync> {
    kind: ModelKind,
    factory: Factory<T>,
    service: RwLock<Option<Arc<T>>>,
    /// Serializes loads of this slot; concurrent callers queue here
    load_gate: AsyncMutex<()>,
    state: std::sync::Mutex<ModelState>,
    last_used: std::sync::Mutex<Instant>,
}

impl<T: ?Sized + Send + Sync> LazySlot<T> {
    fn new(kind: ModelKind, factory: Factory<T>) -> Self {
        Self {
            kind,
            factory,
            service: RwLock::new(None),
            load_gate: AsyncMutex::new(()),
            state: std::sync::Mutex::new(ModelState::Unloaded),
            last_used: std::sync::Mutex::new(Instant::now()),
        }
    }

    fn set_state(&self, state: ModelState) {
        *self.state.lock().unwrap() = state;
    }

    fn state(&self) -> ModelState {
        *self.state.lock().unwrap()
    }

    fn touch(&self) {
        *self.last_used.lock().unwrap() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_used.lock().unwrap().elapsed()
    }

    /// Returns the loaded service, loading it first if necessary
    async fn get(&self) -> Result<Arc<T>, PortError> {
        self.touch();
        if let Some(service) = self.service.read().await.clone() {
            return Ok(service);
        }

        let _gate = self.load_gate.lock().await;
        // A concurrent caller may have finished the load while we waited
        if let Some(service) = self.service.read().await.clone() {
            return Ok(service);
        }

        self.set_state(ModelState::Loading);
        info!("Loading {} model", self.kind.name());
        let started = Instant::now();
        match (self.factory)().await {
            Ok(service) => {
                *self.service.write().await = Some(service.clone());
                self.set_state(ModelState::Ready);
                info!(
                    "{} model ready in {:.1}s",
                    self.kind.name(),
                    started.elapsed().as_secs_f64()
                );
                Ok(service)
            }
            Err(e) => {
                self.set_state(ModelState::Unloaded);
                warn!("{} model failed to load: {}", self.kind.name(), e);
                Err(PortError::Unavailable(format!(
                    "{} load failed: {e}",
                    self.kind.name()
                )))
            }
        }
    }

    /// Drops the service if it has been idle long enough. In-flight calls
    /// hold their own Arc and finish undisturbed.
    async fn unload_if_idle(&self, idle_threshold: Duration) -> bool {
        if self.idle_for() < idle_threshold {
            return false;
        }
        let _gate = self.load_gate.lock().await;
        if self.idle_for() < idle_threshold {
            return false;
        }
        let mut slot = self.service.write().await;
        if slot.is_none() {
            return false;
        }
        self.set_state(ModelState::Unloading);
        *slot = None;
        self.set_state(ModelState::Unloaded);
        info!(
            "Unloaded idle {} model ({}s idle)",
            self.kind.name(),
            idle_threshold.as_secs()
        );
        true
    }
}

/// Loader owning the three slots
pub struct ModelLoader {
    asr: LazySlot<dyn AsrPort>,
    mt: LazySlot<dyn MtPort>,
    tts: LazySlot<dyn TtsPort>,
}

impl ModelLoader {
    pub fn new(
        asr_factory: Factory<dyn AsrPort>,
        mt_factory: Factory<dyn MtPort>,
        tts_factory: Factory<dyn TtsPort>,
    ) -> Self {
        Self {
            asr: LazySlot::new(ModelKind::Asr, asr_factory),
            mt: LazySlot::new(ModelKind::Mt, mt_factory),
            tts: LazySlot::new(ModelKind::Tts, tts_factory),
        }
    }

    /// Wire the HTTP adapters from configuration. "Loading" a model means
    /// constructing its client and passing the service health check.
    pub fn from_config(config: &InferenceConfig) -> Self {
        let asr_endpoint = InferenceEndpoint::new(&config.asr_url, config.api_key.clone());
        let mt_endpoint = InferenceEndpoint::new(&config.mt_url, config.api_key.clone());
        let tts_endpoint = InferenceEndpoint::new(&config.tts_url, config.api_key.clone());

        Self::new(
            Box::new(move || {
                let endpoint = asr_endpoint.clone();
                Box::pin(async move {
                    let service = HttpAsr::connect(endpoint)?;
                    service.health().await?;
                    Ok(Arc::new(service) as Arc<dyn AsrPort>)
                })
            }),
            Box::new(move || {
                let endpoint = mt_endpoint.clone();
                Box::pin(async move {
                    let service = HttpMt::connect(endpoint)?;
                    service.health().await?;
                    Ok(Arc::new(service) as Arc<dyn MtPort>)
                })
            }),
            Box::new(move || {
                let endpoint = tts_endpoint.clone();
                Box::pin(async move {
                    let service = HttpTts::connect(endpoint)?;
                    service.health().await?;
                    Ok(Arc::new(service) as Arc<dyn TtsPort>)
                })
            }),
        )
    }

    /// Build a loader around already-constructed services. Used by the test
    /// suite and by embedders that manage their own adapters.
    pub fn preloaded(
        asr: Arc<dyn AsrPort>,
        mt: Arc<dyn MtPort>,
        tts: Arc<dyn TtsPort>,
    ) -> Self {
        Self::new(
            Box::new(move || {
                let asr = asr.clone();
                Box::pin(async move { Ok(asr) })
            }),
            Box::new(move || {
                let mt = mt.clone();
                Box::pin(async move { Ok(mt) })
            }),
            Box::new(move || {
                let tts = tts.clone();
                Box::pin(async move { Ok(tts) })
            }),
        )
    }

    pub async fn asr(&self) -> Result<Arc<dyn AsrPort>, PortError> {
        self.asr.get().await
    }

    pub async fn mt(&self) -> Result<Arc<dyn MtPort>, PortError> {
        self.mt.get().await
    }

    pub async fn tts(&self) -> Result<Arc<dyn TtsPort>, PortError> {
        self.tts.get().await
    }

    /// Warm all three models in parallel. Failures are logged; endpoints
    /// that depend on a failed model degrade at call time instead.
    pub async fn preload(&self) {
        let (asr, mt, tts) = tokio::join!(self.asr.get(), self.mt.get(), self.tts.get());
        for (kind, result) in [
            (ModelKind::Asr, asr.map(|_| ())),
            (ModelKind::Mt, mt.map(|_| ())),
            (ModelKind::Tts, tts.map(|_| ())),
        ] {
            if let Err(e) = result {
                warn!("Preload of {} failed: {}", kind.name(), e);
            }
        }
    }

    /// Current lifecycle state per model
    pub fn states(&self) -> [(ModelKind, ModelState); 3] {
        [
            (ModelKind::Asr, self.asr.state()),
            (ModelKind::Mt, self.mt.state()),
            (ModelKind::Tts, self.tts.state()),
        ]
    }

    /// Background task that reclaims idle models. A zero threshold disables
    /// unloading entirely.
    pub fn spawn_idle_unloader(
        self: &Arc<Self>,
        idle_threshold: Duration,
    ) -> Option<tokio::task::JoinHandle<()>> {
        if idle_threshold.is_zero() {
            return None;
        }
        let loader = Arc::clone(self);
        // Check at a fraction of the threshold so unload lag stays bounded
        let check_every = (idle_threshold / 4).max(Duration::from_secs(1));
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(check_every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                loader.asr.unload_if_idle(idle_threshold).await;
                loader.mt.unload_if_idle(idle_threshold).await;
                loader.tts.unload_if_idle(idle_threshold).await;
                debug!("Idle unload sweep complete");
            }
        }))
    }
}
