//! Web server wiring
//!
//! Builds the shared application state from configuration and exposes the
//! axum router: the room WebSocket endpoint plus small status routes.
//! Everything stateful is an explicit dependency created at startup and
//! injected here; no module-level mutation anywhere.

pub mod auth;
pub mod protocol;
pub mod rate_limit;
pub mod signaling;
pub mod ws;

use anyhow::{Context, Result};
use axum::{
    extract::State,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::Config;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::models::directory::{StaticDirectory, StaticRoomRegistry};
use crate::models::loader::ModelLoader;
use crate::models::{AuthPort, RoomRegistry, UserDirectory, VoiceProfilePort};
use crate::pipeline::{Pipelines, ProcessorContext, TranslationCache};
use crate::rooms::ConnectionManager;
use crate::server::signaling::SignalingRelay;
use crate::voice::profile::FsVoiceProfiles;

/// Shared server state, cloned per request
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub manager: Arc<ConnectionManager>,
    pub pipelines: Arc<Pipelines>,
    pub relay: Arc<SignalingRelay>,
    pub loader: Arc<ModelLoader>,
    pub auth: Arc<dyn AuthPort>,
    pub directory: Arc<dyn UserDirectory>,
    pub rooms: Arc<dyn RoomRegistry>,
    pub metrics: Arc<Metrics>,
    pub started_at: Instant,
}

/// External collaborators injected at startup. `from_config` builds the
/// self-contained defaults; embedders swap in their own adapters.
pub struct Ports {
    pub auth: Arc<dyn AuthPort>,
    pub directory: Arc<dyn UserDirectory>,
    pub rooms: Arc<dyn RoomRegistry>,
    pub voice_profiles: Arc<dyn VoiceProfilePort>,
    pub loader: Arc<ModelLoader>,
}

impl Ports {
    pub fn from_config(config: &Config) -> Self {
        Self {
            auth: Self::auth_from_config(config),
            directory: Arc::new(StaticDirectory::new()),
            rooms: Arc::new(StaticRoomRegistry::open()),
            voice_profiles: Arc::new(FsVoiceProfiles::new(config.voice_profiles.dir.clone())),
            loader: Arc::new(ModelLoader::from_config(&config.inference)),
        }
    }

    /// Dev mode: deterministic in-process ASR/MT/TTS, no inference backend
    /// required. Everything else stays real.
    pub fn dev(config: &Config) -> Self {
        use crate::models::dev::{DevAsr, DevMt, DevTts};
        Self {
            auth: Self::auth_from_config(config),
            directory: Arc::new(StaticDirectory::new()),
            rooms: Arc::new(StaticRoomRegistry::open()),
            voice_profiles: Arc::new(FsVoiceProfiles::new(config.voice_profiles.dir.clone())),
            loader: Arc::new(ModelLoader::preloaded(
                Arc::new(DevAsr),
                Arc::new(DevMt),
                Arc::new(DevTts {
                    sample_rate: config.pipeline.output_sample_rate,
                }),
            )),
        }
    }

    fn auth_from_config(config: &Config) -> Arc<dyn AuthPort> {
        let secret = match &config.auth.jwt_secret {
            Some(secret) => secret.clone(),
            None => {
                warn!("No JWT secret configured; generating an ephemeral one");
                auth::generate_secret()
            }
        };
        Arc::new(auth::JwtAuth::new(&secret, config.auth.leeway_secs))
    }
}

/// Assemble the state graph: manager, pipelines, relay, metrics
pub fn build_state(config: Config, ports: Ports) -> AppState {
    let config = Arc::new(config);
    let metrics = Arc::new(Metrics::new());

    let manager = Arc::new(ConnectionManager::new(
        ports.directory.clone(),
        metrics.clone(),
        config.pipeline.outbound_channel_depth,
        config.rooms.max_participants,
    ));

    let cache = Arc::new(TranslationCache::new(
        config.pipeline.translation_cache_size,
        std::time::Duration::from_secs(config.pipeline.translation_cache_ttl_secs),
    ));

    let pipelines = Arc::new(Pipelines::new(
        ProcessorContext {
            manager: manager.clone(),
            loader: ports.loader.clone(),
            cache,
            voice_profiles: ports.voice_profiles.clone(),
            metrics: metrics.clone(),
            config: config.pipeline.clone(),
        },
        std::time::Duration::from_millis(config.rooms.shutdown_window_ms),
    ));

    let relay = Arc::new(SignalingRelay::new(manager.clone(), metrics.clone()));

    AppState {
        config,
        manager,
        pipelines,
        relay,
        loader: ports.loader,
        auth: ports.auth,
        directory: ports.directory,
        rooms: ports.rooms,
        metrics,
        started_at: Instant::now(),
    }
}

/// Build the router over the given state
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ws/audio/{room_id}", get(ws::ws_handler))
        .route("/healthz", get(healthz))
        .route("/api/status", get(status_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the server with the default port adapters and run until ctrl-c
pub async fn start(config: Config) -> Result<()> {
    let ports = Ports::from_config(&config);
    start_with_ports(config, ports).await
}

/// Start the server with caller-provided port adapters
pub async fn start_with_ports(config: Config, ports: Ports) -> Result<()> {
    let preload = config.inference.preload;
    let idle_unload = std::time::Duration::from_secs(config.inference.idle_unload_secs);
    let state = build_state(config, ports);

    if preload {
        info!("Preloading ASR/MT/TTS models");
        state.loader.preload().await;
    }
    let _unloader = state.loader.spawn_idle_unloader(idle_unload);
    let _sweeper = spawn_idle_sweeper(&state);

    let addr: SocketAddr = format!("{}:{}", state.config.server.host, state.config.server.port)
        .parse()
        .context("Invalid listen address")?;
    let app = router(state);

    info!("Listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await
        .context("Server error")?;

    Ok(())
}

/// Background task closing connections that stopped sending frames. The
/// close signal drives each connection's normal cleanup path, so rosters
/// and leave broadcasts stay consistent.
fn spawn_idle_sweeper(state: &AppState) -> Option<tokio::task::JoinHandle<()>> {
    let threshold = std::time::Duration::from_secs(state.config.rooms.idle_disconnect_secs);
    if threshold.is_zero() {
        return None;
    }
    let manager = state.manager.clone();
    let check_every = (threshold / 4).max(std::time::Duration::from_secs(1));
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(check_every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            for conn in manager.idle_connections(threshold) {
                info!(
                    "Closing idle connection for {} in room {} ({}s without frames)",
                    conn.user_id,
                    conn.room_id,
                    conn.idle_for().as_secs()
                );
                conn.close(crate::rooms::CloseReason::Normal);
            }
        }
    }))
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    version: &'static str,
    uptime_secs: u64,
    rooms: usize,
    connections: usize,
    active_processors: usize,
    models: Vec<ModelStatus>,
    metrics: MetricsSnapshot,
}

#[derive(Debug, Serialize)]
struct ModelStatus {
    kind: &'static str,
    state: &'static str,
}

async fn status_handler(State(state): State<AppState>) -> Json<StatusResponse> {
    use crate::models::loader::ModelState;

    let models = state
        .loader
        .states()
        .into_iter()
        .map(|(kind, model_state)| ModelStatus {
            kind: kind.name(),
            state: match model_state {
                ModelState::Unloaded => "unloaded",
                ModelState::Loading => "loading",
                ModelState::Ready => "ready",
                ModelState::Unloading => "unloading",
            },
        })
        .collect();

    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.started_at.elapsed().as_secs(),
        rooms: state.manager.room_count(),
        connections: state.manager.connection_count(),
        active_processors: state.pipelines.count(),
        models,
        metrics: state.metrics.snapshot(),
    })
}
