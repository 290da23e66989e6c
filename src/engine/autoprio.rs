//! Auto-priority controller (spec §4.10): periodically recomputes priority
//! for bundles/files that opted into automatic management, in one of two
//! modes.
//!
//! - `Progress`: priority tracks how close the bundle is to completion —
//!   nearly-done bundles get bumped so they clear out of the queue.
//! - `Balanced`: priority tracks current throughput and source count across
//!   the *whole* set of auto-priority bundles at once, ranked and split into
//!   three tiers, so well-seeded, fast bundles don't starve thin ones of
//!   slots. Files inside each bundle are ranked the same way, independently.

use std::collections::HashSet;

use crate::engine::transfer::TransferStateMachine;
use crate::engine::QueueEngine;
use crate::error::Result;
use crate::types::{AutoPrioMode, BundleToken, Event, FileToken, Priority};

#[derive(Debug, Default)]
pub struct AutoPrioController;

impl AutoPrioController {
    /// Recomputes priority across every auto-priority, non-paused bundle
    /// (spec §4.10). Progress mode recomputes each bundle on its own;
    /// Balanced mode ranks the whole collection together — a single
    /// bundle's tier placement depends on every other candidate bundle's
    /// speed and source count, so it can't be done one bundle at a time.
    pub async fn recompute_all(&self, engine: &QueueEngine) -> Result<()> {
        let mode = engine.config.scheduler.autoprio_type;
        if mode == AutoPrioMode::Disabled {
            return Ok(());
        }

        let bundles = engine.bundles.read().await;
        let candidates: Vec<BundleToken> = bundles
            .iter()
            .filter(|b| b.auto_priority && !b.is_paused())
            .map(|b| b.token)
            .collect();
        drop(bundles);

        if candidates.is_empty() {
            return Ok(());
        }

        if mode == AutoPrioMode::Progress {
            for bundle in candidates {
                self.recompute_bundle_progress(engine, bundle).await?;
            }
            Ok(())
        } else {
            self.recompute_balanced(engine, &candidates).await
        }
    }

    /// Progress-mode recompute for a single bundle: per-file priority from
    /// completion fraction, then cascades to the bundle as the max of its
    /// files' (spec §9 Open Question 1: auto-priority writes land before
    /// `rotateUserQueue` reads the bucket).
    async fn recompute_bundle_progress(&self, engine: &QueueEngine, bundle: BundleToken) -> Result<()> {
        let bundles = engine.bundles.read().await;
        let Some(b) = bundles.find_bundle(bundle) else {
            return Ok(());
        };
        let file_tokens: Vec<FileToken> = b.files.iter().copied().collect();
        drop(bundles);

        let files = engine.files.read().await;
        let mut computed = Vec::new();
        for token in file_tokens {
            if let Some(file) = files.find_file(token)
                && file.auto_priority
            {
                let priority = priority_by_progress(file.downloaded_fraction());
                computed.push((token, priority, file.sources.iter().map(|s| s.user.clone()).collect::<Vec<_>>()));
            }
        }
        drop(files);

        if computed.is_empty() {
            return Ok(());
        }

        self.apply_file_priorities(engine, &computed).await;

        let max_priority = computed.iter().map(|(_, p, _)| *p).max();
        if let Some(priority) = max_priority {
            let mut bundles = engine.bundles.write().await;
            if let Some(b) = bundles.find_bundle_mut(bundle) {
                b.priority = priority;
            }
        }

        Ok(())
    }

    /// Balanced-mode recompute across the whole candidate set: gathers
    /// `(speed, source-count)` per bundle, normalizes both to 0-100, scores
    /// and ranks into High/Normal/Low tiers, then applies each bundle's tier
    /// as its priority and, independently, ranks that bundle's own files the
    /// same way (spec §4.10 Balanced).
    async fn recompute_balanced(&self, engine: &QueueEngine, bundles: &[BundleToken]) -> Result<()> {
        let metrics = self.gather_bundle_metrics(engine, bundles).await;
        if metrics.is_empty() {
            return Ok(());
        }

        let speed_points = normalize_0_100(&metrics.iter().map(|(_, speed, _)| *speed).collect::<Vec<_>>());
        let source_points = normalize_0_100(&metrics.iter().map(|(_, _, sources)| *sources).collect::<Vec<_>>());
        let scored: Vec<(BundleToken, f64)> = metrics
            .iter()
            .zip(&speed_points)
            .zip(&source_points)
            .map(|(((token, _, _), sp), srcp)| (*token, sp + srcp))
            .collect();

        for (bundle, priority) in rank_into_tiers(scored) {
            self.apply_balanced_bundle(engine, bundle, priority).await;
        }
        Ok(())
    }

    async fn gather_bundle_metrics(&self, engine: &QueueEngine, bundles: &[BundleToken]) -> Vec<(BundleToken, f64, f64)> {
        let bundles_guard = engine.bundles.read().await;
        let files = engine.files.read().await;
        let downloads = engine.downloads.read().await;

        let mut metrics = Vec::new();
        for &token in bundles {
            let Some(b) = bundles_guard.find_bundle(token) else {
                continue;
            };
            let mut speed = 0i64;
            let mut sources = HashSet::new();
            for file_token in &b.files {
                let Some(f) = files.find_file(*file_token) else {
                    continue;
                };
                for source in &f.sources {
                    sources.insert(source.user.clone());
                }
                for connection in f.active_downloads.keys() {
                    if let Some(d) = downloads.get(connection) {
                        speed += d.current_speed;
                    }
                }
            }
            metrics.push((token, speed as f64, sources.len() as f64));
        }
        metrics
    }

    /// Applies one bundle's balanced tier, then ranks and applies its own
    /// auto-priority files independently against each other (spec §4.10:
    /// "Files inside each bundle are ranked independently by the same
    /// algorithm").
    async fn apply_balanced_bundle(&self, engine: &QueueEngine, bundle: BundleToken, bundle_priority: Priority) {
        let bundles = engine.bundles.read().await;
        let Some(b) = bundles.find_bundle(bundle) else {
            return;
        };
        let file_tokens: Vec<FileToken> = b.files.iter().copied().collect();
        drop(bundles);

        let files = engine.files.read().await;
        let downloads = engine.downloads.read().await;
        let mut metrics = Vec::new();
        for token in file_tokens {
            if let Some(f) = files.find_file(token)
                && f.auto_priority
            {
                let speed: i64 = f.active_downloads.keys().filter_map(|c| downloads.get(c)).map(|d| d.current_speed).sum();
                let sources = f.sources.len() as f64;
                let users: Vec<String> = f.sources.iter().map(|s| s.user.clone()).collect();
                metrics.push((token, speed as f64, sources, users));
            }
        }
        drop(downloads);
        drop(files);

        if !metrics.is_empty() {
            let speed_points = normalize_0_100(&metrics.iter().map(|(_, speed, _, _)| *speed).collect::<Vec<_>>());
            let source_points = normalize_0_100(&metrics.iter().map(|(_, _, sources, _)| *sources).collect::<Vec<_>>());
            let scored: Vec<(usize, f64)> = (0..metrics.len()).map(|i| (i, speed_points[i] + source_points[i])).collect();

            let mut computed = Vec::new();
            for (idx, priority) in rank_into_tiers(scored) {
                let (token, _, _, users) = &metrics[idx];
                computed.push((*token, priority, users.clone()));
            }
            self.apply_file_priorities(engine, &computed).await;
        }

        let mut bundles = engine.bundles.write().await;
        if let Some(b) = bundles.find_bundle_mut(bundle) {
            b.priority = bundle_priority;
        }
    }

    /// Writes computed `(file, new_priority, sources)` entries into
    /// `files`/`users` under their locks and fires the paused/reconnect
    /// transition side effects for whichever files actually changed.
    async fn apply_file_priorities(&self, engine: &QueueEngine, computed: &[(FileToken, Priority, Vec<String>)]) {
        let mut files = engine.files.write().await;
        let mut transitions = Vec::new();
        for (token, priority, _) in computed {
            if let Some(f) = files.find_file_mut(*token) {
                let old = f.priority;
                if old != *priority {
                    transitions.push((*token, old, *priority));
                }
                f.priority = *priority;
            }
        }
        drop(files);

        let mut users = engine.users.write().await;
        for (token, priority, sources) in computed {
            for user in sources {
                users.set_priority(user, *token, *priority);
            }
        }
        drop(users);

        for (token, old, new) in transitions {
            self.handle_priority_transition(engine, token, old, new).await;
        }
    }

    /// Spec-mandated side effects of a priority transition (§4.10: "Changing
    /// a bundle's priority to PAUSED_FORCE disconnects active downloads;
    /// raising from paused/LOWEST triggers source-reconnect attempts."),
    /// applied at file granularity so both the per-file autoprio path and
    /// `QueueEngine::set_file_priority`/`set_bundle_priority` can share it.
    pub(crate) async fn handle_priority_transition(&self, engine: &QueueEngine, file: FileToken, old: Priority, new: Priority) {
        if new == Priority::PausedForce {
            let connections: Vec<_> = {
                let files = engine.files.read().await;
                files.find_file(file).map(|f| f.active_downloads.keys().copied().collect()).unwrap_or_default()
            };
            let machine = TransferStateMachine;
            for connection in connections {
                machine.fail(engine, connection, "priority forced to paused".to_string()).await;
            }
        }

        let was_dormant = matches!(old, Priority::Paused | Priority::PausedForce | Priority::Lowest);
        let still_dormant = matches!(new, Priority::Paused | Priority::PausedForce);
        if was_dormant && new > old && !still_dormant {
            let sources: Vec<String> = {
                let files = engine.files.read().await;
                files.find_file(file).map(|f| f.sources.iter().map(|s| s.user.clone()).collect()).unwrap_or_default()
            };
            for nick in sources {
                let _ = engine.events.send(Event::SourceReconnect { file, nick });
            }
        }
    }
}

fn priority_by_progress(fraction: f64) -> Priority {
    if fraction >= 0.95 {
        Priority::Highest
    } else if fraction >= 0.75 {
        Priority::High
    } else if fraction >= 0.25 {
        Priority::Normal
    } else {
        Priority::Low
    }
}

/// Min-max normalizes `values` onto a 0-100 scale. All-equal inputs (including
/// the single-value case) map uniformly to 100.0 rather than collapsing to
/// zero, so a tied axis doesn't silently zero out the other candidates' score.
fn normalize_0_100(values: &[f64]) -> Vec<f64> {
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if (max - min).abs() < f64::EPSILON {
        return vec![100.0; values.len()];
    }
    values.iter().map(|v| (v - min) / (max - min) * 100.0).collect()
}

/// Sorts `items` descending by score and partitions them into High/Normal/Low
/// tiers. An equal-score run is never split across a tier boundary — ties
/// share a tier, and the next tier only starts once the current one's target
/// share of the collection has been placed (spec §4.10 Balanced).
fn rank_into_tiers<T: Copy>(mut items: Vec<(T, f64)>) -> Vec<(T, Priority)> {
    items.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    let n = items.len();
    let tiers = [Priority::High, Priority::Normal, Priority::Low];
    let mut result = Vec::with_capacity(n);
    let mut tier = 0usize;
    let mut i = 0usize;
    while i < n {
        let mut j = i + 1;
        while j < n && (items[j].1 - items[i].1).abs() < f64::EPSILON {
            j += 1;
        }
        for item in &items[i..j] {
            result.push((item.0, tiers[tier]));
        }
        i = j;
        let target = ((n * (tier + 1)) as f64 / 3.0).ceil() as usize;
        if i >= target && tier < 2 {
            tier += 1;
        }
    }
    result
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::download::Download;
    use crate::engine::QueueEngine;
    use crate::segment::Segment;
    use crate::types::{AutoPrioMode, ConnectionToken, DownloadType};

    fn clock() -> i64 {
        0
    }

    #[test]
    fn progress_mode_bumps_near_complete_files() {
        assert_eq!(priority_by_progress(0.99), Priority::Highest);
        assert_eq!(priority_by_progress(0.1), Priority::Low);
    }

    #[test]
    fn normalize_maps_equal_values_to_the_same_ceiling() {
        let points = normalize_0_100(&[5.0, 5.0, 5.0]);
        assert_eq!(points, vec![100.0, 100.0, 100.0]);
    }

    #[test]
    fn normalize_spreads_distinct_values_across_the_range() {
        let points = normalize_0_100(&[0.0, 50.0, 100.0]);
        assert_eq!(points, vec![0.0, 50.0, 100.0]);
    }

    #[test]
    fn rank_into_tiers_keeps_ties_in_the_same_tier() {
        let items = vec![("a", 10.0), ("b", 10.0), ("c", 10.0), ("d", 1.0), ("e", 1.0), ("f", 1.0)];
        let tiered = rank_into_tiers(items);
        // all six tie across two clusters of three; the first cluster fills
        // (and overshoots) the High tier's 2-item target, so it's placed
        // whole in High and the second cluster falls to the next tier.
        assert!(tiered.iter().take(3).all(|(_, p)| *p == Priority::High));
        assert!(tiered.iter().skip(3).all(|(_, p)| *p == Priority::Normal));
    }

    #[test]
    fn rank_into_tiers_splits_distinct_scores_into_three_groups() {
        let items = vec![("a", 90.0), ("b", 80.0), ("c", 50.0), ("d", 40.0), ("e", 10.0), ("f", 0.0)];
        let tiered = rank_into_tiers(items);
        assert_eq!(tiered[0].1, Priority::High);
        assert_eq!(tiered[1].1, Priority::High);
        assert_eq!(tiered[2].1, Priority::Normal);
        assert_eq!(tiered[3].1, Priority::Normal);
        assert_eq!(tiered[4].1, Priority::Low);
        assert_eq!(tiered[5].1, Priority::Low);
    }

    async fn auto_priority_bundle(engine: &QueueEngine, root: &str) -> crate::types::BundleToken {
        let bundle = engine.add_bundle(root, Priority::Normal).await;
        let mut bundles = engine.bundles.write().await;
        bundles.find_bundle_mut(bundle).unwrap().auto_priority = true;
        bundle
    }

    async fn auto_priority_file(engine: &QueueEngine, bundle: crate::types::BundleToken, target: &str, tth: &str) -> FileToken {
        let file = engine.add_file(bundle, target, 1024, tth, Priority::Normal).await.unwrap();
        let mut files = engine.files.write().await;
        files.find_file_mut(file).unwrap().auto_priority = true;
        file
    }

    #[tokio::test]
    async fn balanced_mode_ranks_across_the_whole_bundle_collection() {
        let mut config = EngineConfig::default();
        config.scheduler.autoprio_type = AutoPrioMode::Balanced;
        let engine = QueueEngine::new(config, clock);

        let fast = auto_priority_bundle(&engine, "/dl/fast").await;
        let fast_file = auto_priority_file(&engine, fast, "/dl/fast/a.bin", "TTHA").await;
        engine.add_source(fast_file, "u1", "adc://hub").await.unwrap();
        engine.add_source(fast_file, "u2", "adc://hub").await.unwrap();
        engine.add_source(fast_file, "u3", "adc://hub").await.unwrap();

        let slow = auto_priority_bundle(&engine, "/dl/slow").await;
        let slow_file = auto_priority_file(&engine, slow, "/dl/slow/a.bin", "TTHB").await;
        engine.add_source(slow_file, "u4", "adc://hub").await.unwrap();

        engine.autoprio.recompute_all(&engine).await.unwrap();

        let bundles = engine.bundles.read().await;
        let fast_priority = bundles.find_bundle(fast).unwrap().priority;
        let slow_priority = bundles.find_bundle(slow).unwrap().priority;
        assert!(fast_priority > slow_priority);
    }

    #[tokio::test]
    async fn balanced_mode_ranks_files_within_a_bundle_independently() {
        let mut config = EngineConfig::default();
        config.scheduler.autoprio_type = AutoPrioMode::Balanced;
        let engine = QueueEngine::new(config, clock);

        let bundle = auto_priority_bundle(&engine, "/dl/x").await;
        let popular = auto_priority_file(&engine, bundle, "/dl/x/a.bin", "TTHA").await;
        engine.add_source(popular, "u1", "adc://hub").await.unwrap();
        engine.add_source(popular, "u2", "adc://hub").await.unwrap();
        engine.add_source(popular, "u3", "adc://hub").await.unwrap();

        let thin = auto_priority_file(&engine, bundle, "/dl/x/b.bin", "TTHB").await;
        engine.add_source(thin, "u4", "adc://hub").await.unwrap();

        engine.autoprio.recompute_all(&engine).await.unwrap();

        let files = engine.files.read().await;
        assert!(files.find_file(popular).unwrap().priority > files.find_file(thin).unwrap().priority);
    }

    #[tokio::test]
    async fn forcing_paused_priority_disconnects_active_downloads() {
        let engine = QueueEngine::new(EngineConfig::default(), clock);
        let bundle = engine.add_bundle("/dl/x", Priority::Normal).await;
        let file = engine.add_file(bundle, "/dl/x/a.bin", 100, "TTH", Priority::Normal).await.unwrap();
        engine.add_source(file, "nick", "adc://hub").await.unwrap();

        {
            let mut downloads = engine.downloads.write().await;
            downloads.insert(
                ConnectionToken(1),
                Download::new(ConnectionToken(1), file, DownloadType::File, Segment::new(0, 100), 0),
            );
            let mut files = engine.files.write().await;
            files.find_file_mut(file).unwrap().active_downloads.insert(ConnectionToken(1), Segment::new(0, 100));
            drop(files);
            let mut users = engine.users.write().await;
            users.start_download(ConnectionToken(1), "nick", file);
        }

        engine.set_file_priority(file, Priority::PausedForce).await.unwrap();

        let downloads = engine.downloads.read().await;
        assert!(!downloads.contains_key(&ConnectionToken(1)));
    }

    #[tokio::test]
    async fn raising_from_lowest_triggers_source_reconnect() {
        let engine = QueueEngine::new(EngineConfig::default(), clock);
        let bundle = engine.add_bundle("/dl/x", Priority::Normal).await;
        let file = engine.add_file(bundle, "/dl/x/a.bin", 100, "TTH", Priority::Lowest).await.unwrap();
        engine.add_source(file, "nick", "adc://hub").await.unwrap();

        let mut events = engine.subscribe();
        engine.set_file_priority(file, Priority::Normal).await.unwrap();

        let mut saw_reconnect = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, Event::SourceReconnect { nick, .. } if nick == "nick") {
                saw_reconnect = true;
            }
        }
        assert!(saw_reconnect);
    }
}
