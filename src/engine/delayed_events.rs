//! Delayed/coalesced events (spec §13): several rapid-fire mutations to the
//! same bundle (say, fifty files finishing within a second) should surface
//! as one listener event, not fifty. Each tracked key gets a single-shot
//! debounce timer; repeated triggers while a timer is pending just bump the
//! payload, they don't spawn a second timer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::sleep;

use crate::engine::QueueEngine;
use crate::types::{BundleToken, Event};

#[derive(Debug, Default)]
pub struct DelayedEventCoalescer {
    pending: Mutex<HashMap<BundleToken, PendingState>>,
}

#[derive(Debug)]
struct PendingState {
    status: crate::types::BundleStatus,
    /// Bumped on each new trigger; a fired timer only emits if it's still
    /// the most recent one scheduled for this bundle.
    generation: u64,
}

impl DelayedEventCoalescer {
    /// Schedules a `BundleStatusChanged` event for `bundle` to fire after
    /// `debounce`, coalescing with any still-pending timer for the same
    /// bundle into a single emission carrying the latest `status`.
    pub async fn schedule(self: Arc<Self>, engine: Arc<QueueEngine>, bundle: BundleToken, status: crate::types::BundleStatus, debounce: Duration) {
        let generation = {
            let mut pending = self.pending.lock().await;
            let entry = pending.entry(bundle).or_insert(PendingState { status, generation: 0 });
            entry.status = status;
            entry.generation += 1;
            entry.generation
        };

        let this = Arc::clone(&self);
        tokio::spawn(async move {
            sleep(debounce).await;
            let fire = {
                let mut pending = this.pending.lock().await;
                match pending.get(&bundle) {
                    Some(state) if state.generation == generation => {
                        let status = state.status;
                        pending.remove(&bundle);
                        Some(status)
                    }
                    _ => None,
                }
            };
            if let Some(status) = fire {
                let _ = engine.events.send(Event::BundleStatusChanged { bundle, status });
            }
        });
    }
}
