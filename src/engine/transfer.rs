//! Transfer state machine (spec §4.7): the sequence a single connection's
//! download goes through, from slot grant to either landing bytes in `done`
//! or failing out with a reason the scheduler and source-management layer
//! can act on.

use crate::download::Download;
use crate::engine::QueueEngine;
use crate::error::{Error, Result, SourceError};
use crate::segment::Segment;
use crate::types::{AutoDisconnectMode, ConnectionToken, DownloadFlags, DownloadType, Event, FileToken, SourceFlags};

/// Connection-local transfer phase (spec §4.7 `CONNECT -> SUPNICK -> INF ->
/// GET -> SND -> RUNNING -> IDLE/FAILED`). The handshake phases up to `Get`
/// belong to the connection layer; the engine only drives `Get` onward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Get,
    Snd,
    Running,
    Idle,
    Failed,
}

#[derive(Debug, Default)]
pub struct TransferStateMachine;

impl TransferStateMachine {
    /// Validates a peer's `SND` reply against the `GET` we issued (spec §4.7
    /// `SND handling`, §7 `SegmentMismatch`). `SND`'s size must echo our
    /// requested size exactly, or be `-1` (the filelist sentinel meaning
    /// "rest of stream"), and its range must overlap what we asked for.
    pub fn validate_snd(&self, requested: &Segment, snd_start: i64, snd_size: i64, file: FileToken) -> Result<Segment> {
        if snd_size != requested.size() && snd_size != -1 {
            return Err(SourceError::SegmentMismatch(file).into());
        }
        let granted_size = if snd_size == -1 { requested.size() } else { snd_size };
        let granted = Segment::new(snd_start, granted_size);
        if !granted.overlaps(requested) {
            return Err(SourceError::SegmentMismatch(file).into());
        }
        Ok(granted)
    }

    /// Feeds a chunk of downloaded bytes into `connection`'s running
    /// download, updating its speed estimate and the slow-source tick
    /// accumulator (spec §4.7 slow-source policy).
    pub async fn on_chunk(&self, engine: &QueueEngine, connection: ConnectionToken, bytes: i64, elapsed_ms: u64) {
        let mut downloads = engine.downloads.write().await;
        if let Some(d) = downloads.get_mut(&connection) {
            d.bytes_transferred += bytes;
            if elapsed_ms > 0 {
                d.current_speed = (bytes * 1000) / elapsed_ms as i64;
            }
        }
    }

    /// Completes a download, dispatching to the TREE or FILE branch of
    /// `endData` (spec §4.7). `finalized_tree_root` is the TTH root the host
    /// computed over the finished tree stream; it's ignored for FILE
    /// downloads, and a TREE completion with no root supplied is treated as
    /// a mismatch (a tree can't be accepted without verifying it).
    pub async fn complete(&self, engine: &QueueEngine, connection: ConnectionToken, finalized_tree_root: Option<&str>) -> Result<()> {
        let mut downloads = engine.downloads.write().await;
        let Some(download) = downloads.remove(&connection) else {
            return Ok(());
        };
        drop(downloads);

        let mut users = engine.users.write().await;
        let user = users.end_download(connection).map(|(u, _)| u);
        drop(users);

        match download.download_type {
            DownloadType::Tree => self.complete_tree(engine, connection, download, user, finalized_tree_root).await,
            DownloadType::File => self.complete_file(engine, connection, download).await,
            DownloadType::PartialList | DownloadType::FullList => Ok(()),
        }
    }

    /// TREE branch: verifies the finalized root against the file's recorded
    /// TTH instead of committing bytes into `done` — a tree download never
    /// advances file progress, only unlocks block-hash verification for
    /// later FILE segments (spec §4.7, §8 Scenario S2).
    async fn complete_tree(
        &self,
        engine: &QueueEngine,
        connection: ConnectionToken,
        download: Download,
        user: Option<String>,
        finalized_tree_root: Option<&str>,
    ) -> Result<()> {
        let mut files = engine.files.write().await;
        let f = files
            .find_file_mut(download.file)
            .ok_or_else(|| Error::NotFound(format!("file {}", download.file)))?;
        f.active_downloads.remove(&connection);
        let expected_tth = f.tth.clone();
        drop(files);

        if finalized_tree_root == Some(expected_tth.as_str()) {
            return Ok(());
        }

        if let Some(user) = user {
            let mut files = engine.files.write().await;
            if let Some(f) = files.find_file_mut(download.file) {
                f.mark_source_bad_tree(&user);
            }
            drop(files);
            let _ = engine.events.send(Event::SourceBad {
                file: download.file,
                nick: user,
                flags: SourceFlags::BAD_TREE,
            });
        }
        Err(SourceError::TreeMismatch(download.file).into())
    }

    /// FILE branch: commits the segment into `done`, cancels any other
    /// connection still running a segment this commit now overlaps (spec
    /// §4.6 rule 5, §8 invariant 7 — "a segment is committed once"), and
    /// marks the bundle's file finished when `done` now covers the file.
    async fn complete_file(&self, engine: &QueueEngine, connection: ConnectionToken, download: Download) -> Result<()> {
        let mut files = engine.files.write().await;
        let f = files
            .find_file_mut(download.file)
            .ok_or_else(|| Error::NotFound(format!("file {}", download.file)))?;
        f.active_downloads.remove(&connection);

        let overlapping: Vec<ConnectionToken> = f
            .active_downloads
            .iter()
            .filter(|(_, seg)| seg.overlaps(&download.segment))
            .map(|(&c, _)| c)
            .collect();
        for c in &overlapping {
            f.active_downloads.remove(c);
        }

        f.add_finished_segment(download.segment);
        let bundle = f.bundle;
        let finished = f.is_finished();
        drop(files);

        for c in overlapping {
            let mut downloads = engine.downloads.write().await;
            downloads.remove(&c);
            drop(downloads);
            let mut users = engine.users.write().await;
            users.end_download(c);
            drop(users);
            let _ = engine.events.send(Event::DownloadCancelled { file: download.file, connection: c });
        }

        if finished && let Some(bundle) = bundle {
            let mut bundles = engine.bundles.write().await;
            if let Some(b) = bundles.find_bundle_mut(bundle) {
                b.mark_file_finished(download.file);
            }
        }

        Ok(())
    }

    /// Marks a connection's download as failed (transport error, access
    /// denial, disk failure — spec §7), removing the running-segment
    /// reservation so the scheduler can reassign it.
    pub async fn fail(&self, engine: &QueueEngine, connection: ConnectionToken, reason: String) {
        let mut downloads = engine.downloads.write().await;
        let Some(download) = downloads.remove(&connection) else {
            return;
        };
        drop(downloads);

        let mut files = engine.files.write().await;
        if let Some(f) = files.find_file_mut(download.file) {
            f.active_downloads.remove(&connection);
        }
        drop(files);

        let mut users = engine.users.write().await;
        users.end_download(connection);
        drop(users);

        let _ = engine.events.send(Event::DownloadFailed {
            file: download.file,
            connection,
            reason,
        });
    }

    /// Per-tick slow-source sweep (spec §4.7, §5 "slow-source timeout is
    /// measured in ticks accumulated under the running segment"). Grounded
    /// on `DownloadManager::on(TimerManagerListener::Second, ...)` plus
    /// `QueueManager::checkDropSlowSource`/`handleSlowDisconnect`: every
    /// running download's speed sample is checked against
    /// `slow_source_speed_threshold`; once it's stayed below that for
    /// `slow_source_disconnect_time`, the source is flagged `SLOWUSER` and
    /// evicted per `dl_auto_disconnect_mode`.
    ///
    /// A file with exactly one source is never evicted this way (that would
    /// strand it with zero sources) — the same single-source exclusion the
    /// donor applies for `DL_AUTO_DISCONNECT_MODE=ALL`, generalized here to
    /// every mode since stranding a file is never the intent of a
    /// throughput policy.
    pub async fn sweep_slow_sources(&self, engine: &QueueEngine) {
        let now = engine.now();
        let threshold = engine.config.queue.slow_source_speed_threshold;
        let sustained_for = engine.config.queue.slow_source_disconnect_time.as_secs() as i64;

        let mut slow: Vec<(ConnectionToken, FileToken)> = Vec::new();
        {
            let mut downloads = engine.downloads.write().await;
            for (connection, download) in downloads.iter_mut() {
                if download.download_type != DownloadType::File {
                    continue;
                }
                if download.record_speed_sample(now, threshold, sustained_for) {
                    download.flags.insert(DownloadFlags::SLOWUSER);
                    slow.push((*connection, download.file));
                }
            }
        }

        for (connection, file) in slow {
            let user = {
                let users = engine.users.read().await;
                users.running(connection).map(|(u, _)| u)
            };
            let Some(user) = user else { continue };

            let files = engine.files.read().await;
            let Some(f) = files.find_file(file) else { continue };
            if f.sources.len() <= 1 {
                continue;
            }
            let bundle = f.bundle;
            drop(files);

            match engine.config.scheduler.dl_auto_disconnect_mode {
                AutoDisconnectMode::File => self.evict_slow_source(engine, file, &user).await,
                AutoDisconnectMode::Bundle => {
                    let Some(bundle) = bundle else { continue };
                    let file_tokens: Vec<FileToken> = {
                        let bundles = engine.bundles.read().await;
                        bundles.find_bundle(bundle).map(|b| b.files.iter().copied().collect()).unwrap_or_default()
                    };
                    for f in file_tokens {
                        self.evict_slow_source(engine, f, &user).await;
                    }
                }
                AutoDisconnectMode::All => {
                    let candidates: Vec<FileToken> = {
                        let files = engine.files.read().await;
                        files.iter().filter(|f| f.is_source(&user) && f.sources.len() > 1).map(|f| f.token).collect()
                    };
                    for f in candidates {
                        self.evict_slow_source(engine, f, &user).await;
                    }
                }
            }
        }
    }

    async fn evict_slow_source(&self, engine: &QueueEngine, file: FileToken, user: &str) {
        let connections = {
            let mut files = engine.files.write().await;
            let Some(f) = files.find_file_mut(file) else { return };
            if f.sources.len() <= 1 || !f.is_source(user) {
                return;
            }
            f.remove_source(user);
            drop(files);
            let users = engine.users.read().await;
            users.connections_for(user, file)
        };

        let mut users = engine.users.write().await;
        users.remove_file(user, file);
        drop(users);

        for connection in connections {
            self.fail(engine, connection, "slow source disconnected".to_string()).await;
        }

        let _ = engine.events.send(Event::SourceRemoved {
            file,
            nick: user.to_string(),
            flags: SourceFlags::SLOW_SOURCE,
        });
    }

    #[must_use]
    pub fn classify(&self, download_type: DownloadType) -> TransferState {
        match download_type {
            DownloadType::Tree | DownloadType::File | DownloadType::PartialList | DownloadType::FullList => {
                TransferState::Get
            }
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::QueueEngine;
    use crate::types::Priority;

    fn clock() -> i64 {
        0
    }

    #[test]
    fn validate_snd_rejects_non_overlapping_reply() {
        let machine = TransferStateMachine;
        let requested = Segment::new(0, 100);
        let err = machine.validate_snd(&requested, 500, 100, FileToken(1)).unwrap_err();
        assert!(matches!(err, Error::Source(SourceError::SegmentMismatch(_))));
    }

    #[test]
    fn validate_snd_accepts_overlapping_reply() {
        let machine = TransferStateMachine;
        let requested = Segment::new(0, 100);
        let granted = machine.validate_snd(&requested, 0, 100, FileToken(1)).unwrap();
        assert_eq!(granted, Segment::new(0, 100));
    }

    #[test]
    fn validate_snd_rejects_size_that_does_not_match_request() {
        let machine = TransferStateMachine;
        let requested = Segment::new(0, 100);
        let err = machine.validate_snd(&requested, 0, 50, FileToken(1)).unwrap_err();
        assert!(matches!(err, Error::Source(SourceError::SegmentMismatch(_))));
    }

    #[test]
    fn validate_snd_accepts_filelist_sentinel_size() {
        let machine = TransferStateMachine;
        let requested = Segment::new(0, 100);
        let granted = machine.validate_snd(&requested, 0, -1, FileToken(1)).unwrap();
        assert_eq!(granted, Segment::new(0, 100));
    }

    #[tokio::test]
    async fn complete_commits_segment_and_clears_running() {
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

        let machine = TransferStateMachine;
        machine.complete(&engine, ConnectionToken(1), None).await.unwrap();

        let files = engine.files.read().await;
        assert!(files.find_file(file).unwrap().is_finished());
        drop(files);
        let users = engine.users.read().await;
        assert_eq!(users.running(ConnectionToken(1)), None);
    }

    #[tokio::test]
    async fn tree_mismatch_moves_source_to_bad_sources() {
        let engine = QueueEngine::new(EngineConfig::default(), clock);
        let bundle = engine.add_bundle("/dl/x", Priority::Normal).await;
        let file = engine.add_file(bundle, "/dl/x/a.bin", 100, "REALTTH", Priority::Normal).await.unwrap();
        engine.add_source(file, "nick", "adc://hub").await.unwrap();

        {
            let mut downloads = engine.downloads.write().await;
            downloads.insert(
                ConnectionToken(1),
                Download::new(ConnectionToken(1), file, DownloadType::Tree, Segment::new(0, 0), 0),
            );
            let mut users = engine.users.write().await;
            users.start_download(ConnectionToken(1), "nick", file);
        }

        let machine = TransferStateMachine;
        let err = machine.complete(&engine, ConnectionToken(1), Some("WRONGTTH")).await.unwrap_err();
        assert!(matches!(err, Error::Source(SourceError::TreeMismatch(_))));

        let files = engine.files.read().await;
        let f = files.find_file(file).unwrap();
        assert!(!f.is_source("nick"));
        assert!(f.is_bad_source("nick"));
    }

    #[tokio::test]
    async fn tree_match_leaves_sources_untouched() {
        let engine = QueueEngine::new(EngineConfig::default(), clock);
        let bundle = engine.add_bundle("/dl/x", Priority::Normal).await;
        let file = engine.add_file(bundle, "/dl/x/a.bin", 100, "REALTTH", Priority::Normal).await.unwrap();
        engine.add_source(file, "nick", "adc://hub").await.unwrap();

        {
            let mut downloads = engine.downloads.write().await;
            downloads.insert(
                ConnectionToken(1),
                Download::new(ConnectionToken(1), file, DownloadType::Tree, Segment::new(0, 0), 0),
            );
        }

        let machine = TransferStateMachine;
        machine.complete(&engine, ConnectionToken(1), Some("REALTTH")).await.unwrap();

        let files = engine.files.read().await;
        let f = files.find_file(file).unwrap();
        assert!(f.is_source("nick"));
        assert!(!f.segments_done());
    }

    #[tokio::test]
    async fn completing_a_segment_cancels_overlapping_downloads() {
        let engine = QueueEngine::new(EngineConfig::default(), clock);
        let bundle = engine.add_bundle("/dl/x", Priority::Normal).await;
        let file = engine.add_file(bundle, "/dl/x/a.bin", 100, "TTH", Priority::Normal).await.unwrap();
        engine.add_source(file, "u1", "adc://hub").await.unwrap();
        engine.add_source(file, "u2", "adc://hub").await.unwrap();

        {
            let mut downloads = engine.downloads.write().await;
            downloads.insert(
                ConnectionToken(1),
                Download::new(ConnectionToken(1), file, DownloadType::File, Segment::new(0, 100), 0),
            );
            downloads.insert(
                ConnectionToken(2),
                Download::new(ConnectionToken(2), file, DownloadType::File, Segment::new(0, 100), 0),
            );
            let mut files = engine.files.write().await;
            let f = files.find_file_mut(file).unwrap();
            f.active_downloads.insert(ConnectionToken(1), Segment::new(0, 100));
            f.active_downloads.insert(ConnectionToken(2), Segment::new(0, 100));
            drop(files);
            let mut users = engine.users.write().await;
            users.start_download(ConnectionToken(1), "u1", file);
            users.start_download(ConnectionToken(2), "u2", file);
        }

        let mut events = engine.subscribe();
        let machine = TransferStateMachine;
        machine.complete(&engine, ConnectionToken(1), None).await.unwrap();

        let downloads = engine.downloads.read().await;
        assert!(!downloads.contains_key(&ConnectionToken(2)));
        drop(downloads);

        let mut saw_cancel = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, Event::DownloadCancelled { connection, .. } if connection == ConnectionToken(2)) {
                saw_cancel = true;
            }
        }
        assert!(saw_cancel);
    }

    #[tokio::test]
    async fn sweep_slow_sources_evicts_after_sustained_low_throughput() {
        let mut config = EngineConfig::default();
        config.queue.slow_source_speed_threshold = 1024;
        config.queue.slow_source_disconnect_time = std::time::Duration::from_secs(40);
        let engine = QueueEngine::new(config, clock);
        let bundle = engine.add_bundle("/dl/x", Priority::Normal).await;
        let file = engine.add_file(bundle, "/dl/x/a.bin", 4 * 1024 * 1024, "TTH", Priority::Normal).await.unwrap();
        engine.add_source(file, "slow", "adc://hub").await.unwrap();
        engine.add_source(file, "other", "adc://hub").await.unwrap();

        {
            let mut downloads = engine.downloads.write().await;
            let mut d = Download::new(ConnectionToken(1), file, DownloadType::File, Segment::new(0, 1024), 0);
            d.current_speed = 100;
            downloads.insert(ConnectionToken(1), d);
            let mut users = engine.users.write().await;
            users.start_download(ConnectionToken(1), "slow", file);
        }

        let machine = TransferStateMachine;
        machine.sweep_slow_sources(&engine).await; // first sample: starts the clock, no eviction yet

        let files = engine.files.read().await;
        assert!(files.find_file(file).unwrap().is_source("slow"));
        drop(files);

        // fast-forward the clock far past the sustained-low threshold
        let mut config = EngineConfig::default();
        config.queue.slow_source_speed_threshold = 1024;
        config.queue.slow_source_disconnect_time = std::time::Duration::from_secs(40);
        fn late_clock() -> i64 {
            41
        }
        let engine2 = QueueEngine::new(config, late_clock);
        let bundle2 = engine2.add_bundle("/dl/x", Priority::Normal).await;
        let file2 = engine2.add_file(bundle2, "/dl/x/a.bin", 4 * 1024 * 1024, "TTH", Priority::Normal).await.unwrap();
        engine2.add_source(file2, "slow", "adc://hub").await.unwrap();
        engine2.add_source(file2, "other", "adc://hub").await.unwrap();
        {
            let mut downloads = engine2.downloads.write().await;
            let mut d = Download::new(ConnectionToken(1), file2, DownloadType::File, Segment::new(0, 1024), 0);
            d.current_speed = 100;
            d.low_speed_since = Some(0);
            downloads.insert(ConnectionToken(1), d);
            let mut users = engine2.users.write().await;
            users.start_download(ConnectionToken(1), "slow", file2);
        }
        machine.sweep_slow_sources(&engine2).await;

        let files = engine2.files.read().await;
        assert!(!files.find_file(file2).unwrap().is_source("slow"));
    }

    #[tokio::test]
    async fn sweep_slow_sources_never_strands_a_single_source_file() {
        let mut config = EngineConfig::default();
        config.queue.slow_source_speed_threshold = 1024;
        config.queue.slow_source_disconnect_time = std::time::Duration::from_secs(40);
        fn late_clock() -> i64 {
            100
        }
        let engine = QueueEngine::new(config, late_clock);
        let bundle = engine.add_bundle("/dl/x", Priority::Normal).await;
        let file = engine.add_file(bundle, "/dl/x/a.bin", 4 * 1024 * 1024, "TTH", Priority::Normal).await.unwrap();
        engine.add_source(file, "only", "adc://hub").await.unwrap();

        {
            let mut downloads = engine.downloads.write().await;
            let mut d = Download::new(ConnectionToken(1), file, DownloadType::File, Segment::new(0, 1024), 0);
            d.current_speed = 100;
            d.low_speed_since = Some(0);
            downloads.insert(ConnectionToken(1), d);
            let mut users = engine.users.write().await;
            users.start_download(ConnectionToken(1), "only", file);
        }

        let machine = TransferStateMachine;
        machine.sweep_slow_sources(&engine).await;

        let files = engine.files.read().await;
        assert!(files.find_file(file).unwrap().is_source("only"));
    }
}
