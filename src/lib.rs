//! Babelroom - Real-time speech translation conferencing core
//!
//! Server-side pipeline for multi-party speech translation:
//! - Authenticated room WebSocket carrying audio and signaling
//! - Per-speaker stream processors (ASR -> MT -> TTS fan-out)
//! - WebRTC signaling relay (the server never terminates media)
//! - Lazy loading of the abstract ASR/MT/TTS services
//!
//! # Example
//!
//! ```ignore
//! use babelroom::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load(None)?;
//!     babelroom::server::start(config).await
//! }
//! ```

pub mod cli;
pub mod config;
pub mod metrics;
pub mod models;
pub mod pipeline;
pub mod rooms;
pub mod server;
pub mod types;
pub mod voice;

// Re-export the types embedders touch most
pub use config::Config;
pub use metrics::Metrics;
pub use models::loader::ModelLoader;
pub use pipeline::{Pipelines, ProcessorContext, TranslationCache};
pub use rooms::{ConnectionManager, Connection};
pub use server::{build_state, router, start as start_server, start_with_ports, AppState, Ports};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
