//! # adc-queue-engine
//!
//! Queue and transfer engine for Direct Connect (NMDC) and Advanced Direct
//! Connect peer-to-peer file sharing.
//!
//! ## Design Philosophy
//!
//! - **Engine, not client** — no hub protocol, no UI; this crate owns
//!   download-queue state and hands connection-facing code a segment to
//!   request next.
//! - **Collaborator seams** — hashing, searching, UDP transport, and
//!   file-list matching are trait objects the host supplies; see
//!   [`collaborators`].
//! - **Event-driven** — consumers subscribe to [`types::Event`], no polling
//!   required for state changes.
//!
//! ## Quick Start
//!
//! ```no_run
//! use adc_queue_engine::{config::EngineConfig, engine::QueueEngine, types::Priority};
//!
//! #[tokio::main]
//! async fn main() {
//!     let engine = QueueEngine::new(EngineConfig::default(), adc_queue_engine::system_clock);
//!     let bundle = engine.add_bundle("/downloads/movie", Priority::Normal).await;
//!     engine
//!         .add_file(bundle, "/downloads/movie/movie.mkv", 0, "TTH", Priority::Normal)
//!         .await
//!         .unwrap();
//!
//!     let mut events = engine.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("event: {:?}", event);
//!         }
//!     });
//! }
//! ```

#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Bundle and path-info types.
pub mod bundle;
/// Bundle index and alternate-search priority queue.
pub mod bundle_queue;
/// Collaborator traits (hashing, search, UDP, file-list matching).
pub mod collaborators;
/// Engine configuration.
pub mod config;
/// Live transfer and connection state.
pub mod download;
/// The queue and transfer engine and its component submodules.
pub mod engine;
/// Error types.
pub mod error;
/// Flat file index.
pub mod file_queue;
/// A single queued file.
pub mod queued_file;
/// Byte-range segment arithmetic.
pub mod segment;
/// Source (peer) records.
pub mod source;
/// Core value types and events.
pub mod types;
/// Per-user file rotation index.
pub mod user_queue;

pub use config::EngineConfig;
pub use engine::QueueEngine;
pub use error::{Error, Result};
pub use types::{BundleToken, ConnectionToken, Event, FileToken, Priority};

/// Wall-clock source for [`QueueEngine::new`] outside of tests: UTC seconds
/// since the epoch. `QueueEngine` takes a bare `fn() -> i64` rather than
/// calling this directly so tests can supply a fixed clock instead.
#[must_use]
pub fn system_clock() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Runs `engine`'s background tasks until a termination signal arrives,
/// then returns so the caller can flush any remaining state.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal
///   registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
pub async fn run_with_shutdown(engine: std::sync::Arc<QueueEngine>) {
    let cancel = tokio_util::sync::CancellationToken::new();
    let _tasks = engine.spawn_background_tasks(cancel.clone());
    wait_for_signal().await;
    cancel.cancel();
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("received SIGTERM");
                }
                _ = sigint.recv() => {
                    tracing::info!("received SIGINT (Ctrl+C)");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("received SIGINT (Ctrl+C)");
            } else {
                tracing::error!("could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("received SIGTERM");
            } else {
                tracing::error!("could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("received Ctrl+C"),
        Err(e) => tracing::error!(error = %e, "failed to listen for Ctrl+C"),
    }
}
