//! Download scheduler (spec §4.5): decides what a newly-slotted connection
//! should download next, gating on global/bundle slot and speed policy
//! before handing back a concrete segment request.

use crate::engine::QueueEngine;
use crate::source::Source;
use crate::types::{ConnectionToken, Event, FileToken, GateReason, Priority, SourceFlags, StartDownloadResult};

#[derive(Debug, Default)]
pub struct DownloadScheduler;

impl DownloadScheduler {
    /// Picks the next file this user could start, without yet checking slot
    /// gating (spec §4.5 step 1, delegates rotation to
    /// [`crate::user_queue::UserQueue::peek_next`]).
    pub async fn next_candidate(&self, engine: &QueueEngine, user: &str) -> Option<FileToken> {
        let users = engine.users.read().await;
        users.peek_next(user)
    }

    /// Slot/priority gate (spec §4.5 `allowStartQI`): refuses to start a
    /// download when the global slot ceiling is hit, the speed ceiling is
    /// hit, or a LOWEST-priority file wants to run while other bundles (or
    /// other files in the same bundle) still have work in flight.
    ///
    /// `extra_download_slots` raises both ceilings for `Highest`-priority
    /// files: the slot ceiling by that many extra concurrent downloads, and
    /// the speed ceiling by exempting `Highest` files from it outright once
    /// they're within that extra allowance (the spec ties the allowance to
    /// slot count and gives no formula for scaling a byte/sec ceiling by it).
    pub async fn allow_start(&self, engine: &QueueEngine, file: FileToken) -> Result<(), GateReason> {
        let files = engine.files.read().await;
        let Some(target) = files.find_file(file) else {
            return Ok(());
        };
        if target.priority.is_paused() {
            return Err(GateReason::NoFreeSlots);
        }
        let target_priority = target.priority;
        let target_bundle = target.bundle;
        drop(files);

        let extra_slots = if target_priority == Priority::Highest {
            engine.config.queue.extra_download_slots
        } else {
            0
        };

        let downloads = engine.downloads.read().await;
        let running = downloads.len() as u32;
        let max_running = engine.config.queue.max_running_downloads;
        if max_running > 0 && running >= max_running + extra_slots {
            return Err(GateReason::NoFreeSlots);
        }

        let max_speed = engine.config.queue.max_speed_bytes_per_sec;
        if max_speed > 0 && target_priority != Priority::Highest {
            let total_speed: i64 = downloads.values().map(|d| d.current_speed).sum();
            if total_speed as u64 >= max_speed {
                return Err(GateReason::SpeedCeilingReached);
            }
        }
        drop(downloads);

        if target_priority == Priority::Lowest {
            let files = engine.files.read().await;

            let other_bundle_running = files
                .iter()
                .any(|f| f.bundle != target_bundle && !f.active_downloads.is_empty());
            if other_bundle_running {
                return Err(GateReason::LowestPrioOtherBundlesRunning);
            }

            if let Some(bundle) = target_bundle {
                let bundles = engine.bundles.read().await;
                if let Some(b) = bundles.find_bundle(bundle) {
                    let sibling_running = b
                        .files
                        .iter()
                        .filter(|&&other| other != file)
                        .filter_map(|&other| files.find_file(other))
                        .any(|other| !other.active_downloads.is_empty());
                    if sibling_running {
                        return Err(GateReason::LowestPrioOtherFilesRunningInBundle);
                    }
                }
            }
        }

        Ok(())
    }

    /// Full start-download decision for `user` on `connection` (spec §4.5):
    /// picks a candidate file, gates it, and if clear, picks a segment.
    ///
    /// A `PARTIAL` source that advertises none of the file's remaining parts
    /// is removed outright and the connection told to disconnect (spec §4.5
    /// step 3, `NO_NEED_PARTS`); a missing temp target with recorded progress
    /// resets `done` before the segment is computed (spec §4.5 step 4).
    pub async fn start_download(
        &self,
        engine: &QueueEngine,
        connection: ConnectionToken,
        user: &str,
        wanted_size: i64,
        last_speed: i64,
    ) -> StartDownloadResult {
        let Some(file) = self.next_candidate(engine, user).await else {
            return StartDownloadResult::NoWork;
        };

        if let Err(reason) = self.allow_start(engine, file).await {
            return StartDownloadResult::Gated { file, reason };
        }

        let files = engine.files.read().await;
        let Some(f) = files.find_file(file) else {
            return StartDownloadResult::NoWork;
        };
        let block_size = if f.block_size > 0 {
            f.block_size
        } else {
            crate::collaborators::default_block_size(f.size)
        };
        let source_is_partial = f.sources.iter().find(|s| s.user == user).is_some_and(Source::is_partial);
        let partial = f.sources.iter().find(|s| s.user == user).and_then(|s| s.partial.as_ref().map(|p| &p.partial_info));
        let probe = f.get_next_segment(block_size, wanted_size, last_speed, partial, false);
        drop(files);

        if probe.is_empty() && source_is_partial {
            let mut files = engine.files.write().await;
            if let Some(f) = files.find_file_mut(file) {
                f.remove_source(user);
            }
            drop(files);

            let mut users = engine.users.write().await;
            users.remove_file(user, file);
            drop(users);

            let _ = engine.events.send(Event::SourceRemoved {
                file,
                nick: user.to_string(),
                flags: SourceFlags::NO_NEED_PARTS,
            });
            return StartDownloadResult::Disconnect {
                reason: "no needed part available from this source".to_string(),
            };
        }

        let files = engine.files.read().await;
        let Some(f) = files.find_file(file) else {
            return StartDownloadResult::NoWork;
        };
        let downloaded_bytes = f.downloaded_bytes();
        let temp_target = f.temp_target.clone();
        drop(files);

        if downloaded_bytes > 0 && !tokio::fs::try_exists(&temp_target).await.unwrap_or(true) {
            let mut files = engine.files.write().await;
            if let Some(f) = files.find_file_mut(file) {
                f.reset_downloaded();
            }
            drop(files);
        }

        let files = engine.files.read().await;
        let Some(f) = files.find_file(file) else {
            return StartDownloadResult::NoWork;
        };
        let partial = f.sources.iter().find(|s| s.user == user).and_then(|s| s.partial.as_ref().map(|p| &p.partial_info));
        let segment = f.get_next_segment(block_size, wanted_size, last_speed, partial, false);
        drop(files);

        if segment.is_empty() {
            return StartDownloadResult::NoWork;
        }

        let mut files = engine.files.write().await;
        if let Some(f) = files.find_file_mut(file) {
            f.active_downloads.insert(connection, segment);
        }
        drop(files);

        let mut users = engine.users.write().await;
        users.start_download(connection, user, file);
        drop(users);

        StartDownloadResult::Ready { file }
    }
}
