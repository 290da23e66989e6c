//! A single queued file and its segment/source bookkeeping (spec §3 `QueuedFile`, §4.6).

use crate::segment::Segment;
use crate::source::{PartsInfo, Source};
use crate::types::{BundleToken, ConnectionToken, DownloadType, FileFlags, FileToken, SourceFlags};
use std::collections::BTreeSet;

/// A file being downloaded: path, hash, priority, and the segment/source
/// state the scheduler and transfer state machine mutate.
#[derive(Debug, Clone)]
pub struct QueuedFile {
    pub token: FileToken,
    pub target: String,
    pub temp_target: String,
    pub size: i64,
    pub tth: String,
    pub priority: crate::types::Priority,
    pub auto_priority: bool,
    pub flags: FileFlags,
    /// Disjoint, sorted byte ranges already downloaded and verified.
    pub done: BTreeSet<Segment>,
    /// Segments currently assigned to a live connection.
    pub active_downloads: std::collections::BTreeMap<ConnectionToken, Segment>,
    pub sources: Vec<Source>,
    pub bad_sources: Vec<Source>,
    pub max_segments: u8,
    /// Tree-derived block size; `-1` until a tree has been downloaded.
    pub block_size: i64,
    pub bundle: Option<BundleToken>,
    pub added_at: i64,
    pub finished_at: Option<i64>,
}

impl QueuedFile {
    #[must_use]
    pub fn new(
        token: FileToken,
        target: impl Into<String>,
        size: i64,
        tth: impl Into<String>,
        priority: crate::types::Priority,
        added_at: i64,
    ) -> Self {
        let target = target.into();
        Self {
            token,
            temp_target: format!("{target}.dctmp"),
            target,
            size,
            tth: tth.into(),
            priority,
            auto_priority: false,
            flags: FileFlags::NONE,
            done: BTreeSet::new(),
            active_downloads: std::collections::BTreeMap::new(),
            sources: Vec::new(),
            bad_sources: Vec::new(),
            max_segments: 1,
            block_size: -1,
            bundle: None,
            added_at,
            finished_at: None,
        }
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.priority.is_paused()
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.flags.contains(FileFlags::FINISHED)
    }

    #[must_use]
    pub fn is_source(&self, user: &str) -> bool {
        self.sources.iter().any(|s| s.user == user)
    }

    #[must_use]
    pub fn is_bad_source(&self, user: &str) -> bool {
        self.bad_sources.iter().any(|s| s.user == user)
    }

    pub fn source_mut(&mut self, user: &str) -> Option<&mut Source> {
        self.sources.iter_mut().find(|s| s.user == user)
    }

    /// Moves `user`'s source record into `bad_sources` flagged `BAD_TREE`,
    /// for a tree download whose finalized root didn't match `tth` (spec
    /// §4.7 `endData` TREE branch, §7 `TreeMismatch`).
    pub fn mark_source_bad_tree(&mut self, user: &str) -> bool {
        let Some(pos) = self.sources.iter().position(|s| s.user == user) else {
            return false;
        };
        let mut source = self.sources.remove(pos);
        source.flags.insert(SourceFlags::BAD_TREE);
        self.bad_sources.push(source);
        true
    }

    /// Removes `user` from `sources` outright — used for the PARTIAL
    /// zero-segment eviction (spec §4.5 step 3) and slow-source eviction
    /// (spec §4.7), neither of which is a permanent "bad" verdict the way
    /// `mark_source_bad_tree` is.
    pub fn remove_source(&mut self, user: &str) -> Option<Source> {
        let pos = self.sources.iter().position(|s| s.user == user)?;
        Some(self.sources.remove(pos))
    }

    /// Bytes verified into `done`, not counting in-flight segments.
    #[must_use]
    pub fn downloaded_bytes(&self) -> i64 {
        self.done.iter().map(Segment::size).sum()
    }

    #[must_use]
    pub fn downloaded_fraction(&self) -> f64 {
        if self.size == 0 {
            return 1.0;
        }
        self.downloaded_bytes() as f64 / self.size as f64
    }

    /// True once `done` covers `[0, size)` exactly (spec §8 invariant 6).
    #[must_use]
    pub fn segments_done(&self) -> bool {
        if self.size == 0 {
            return false;
        }
        let mut cursor = 0i64;
        for seg in &self.done {
            if seg.start() > cursor {
                return false;
            }
            cursor = cursor.max(seg.end());
        }
        cursor >= self.size
    }

    /// Commits a completed segment into `done`, merging with adjacent
    /// entries is left to callers that rebuild the set; here we simply
    /// insert and rely on `BTreeSet<Segment>` ordering for `segments_done`.
    pub fn add_finished_segment(&mut self, segment: Segment) {
        self.done.insert(segment);
        if self.segments_done() {
            self.flags.insert(FileFlags::FINISHED);
            self.finished_at = Some(self.added_at); // caller overwrites with real clock
        }
    }

    pub fn reset_downloaded(&mut self) {
        self.done.clear();
        self.flags.remove(FileFlags::FINISHED);
        self.finished_at = None;
    }

    /// Whether the remote's advertised `parts` contains byte ranges this
    /// file still needs, i.e. blocks not already in `done` (spec §4.8
    /// `isNeededPart`).
    #[must_use]
    pub fn is_needed_part(&self, parts: &PartsInfo, block_size: i64) -> bool {
        if block_size <= 0 {
            return false;
        }
        for &(start_block, end_block) in &parts.0 {
            let candidate = Segment::new(
                i64::from(start_block) * block_size,
                i64::from(end_block - start_block) * block_size,
            );
            if !candidate.in_set(&self.done) {
                return true;
            }
        }
        false
    }

    /// This file's own completed ranges expressed as a capped `PartsInfo`
    /// (spec §4.8 `getPartialInfo`).
    #[must_use]
    pub fn get_partial_info(&self, block_size: i64) -> PartsInfo {
        PartsInfo::from_done_segments(&self.done, block_size)
    }

    /// Picks the next segment to request (spec §4.6).
    ///
    /// `allow_overlap` permits duplicating an already-running segment when
    /// its estimated time remaining exceeds the configured threshold; the
    /// caller (scheduler) decides when that is permitted and flags the
    /// resulting [`Segment`] with [`Segment::new_overlapped`].
    #[must_use]
    pub fn get_next_segment(
        &self,
        block_size: i64,
        wanted_size: i64,
        last_speed: i64,
        partial: Option<&PartsInfo>,
        allow_overlap: bool,
    ) -> Segment {
        if self.is_paused() || self.size == 0 || block_size <= 0 {
            return Segment::empty();
        }

        let chunk_cap = (i64::from(self.max_segments) * block_size).max(block_size);
        let target_len = block_size.max(wanted_size).min(chunk_cap).max(block_size);
        let _ = last_speed; // reserved for future chunk-estimate tuning

        // Walk [0, size) in block-sized steps, skipping finished and
        // currently-running (non-overlap) regions.
        let mut cursor = 0i64;
        while cursor < self.size {
            let candidate_size = target_len.min(self.size - cursor);
            let mut candidate = Segment::new(cursor, candidate_size);

            // Clip against finished regions.
            let mut advanced = false;
            for done_seg in &self.done {
                if candidate.overlaps(done_seg) {
                    cursor = done_seg.end().max(cursor + block_size);
                    advanced = true;
                    break;
                }
            }
            if advanced {
                continue;
            }

            // Clip against running segments unless overlap is both allowed
            // and the running segment is estimated to be slow.
            let mut blocked_by_running = false;
            for running in self.active_downloads.values() {
                if candidate.overlaps(running) {
                    if allow_overlap {
                        candidate = Segment::new_overlapped(candidate.start(), candidate.size());
                    } else {
                        blocked_by_running = true;
                        break;
                    }
                }
            }
            if blocked_by_running {
                cursor += block_size;
                continue;
            }

            if let Some(parts) = partial {
                candidate = intersect_with_parts(&candidate, parts, block_size);
                if candidate.is_empty() {
                    cursor += block_size;
                    continue;
                }
            }

            if !candidate.is_empty() {
                return candidate;
            }
            cursor += block_size;
        }

        Segment::empty()
    }

    /// Tests whether `hasSegment` (spec §4.4) would succeed for `user` on
    /// this file: not paused, not blocked on every online hub, user is a
    /// registered source, and a non-empty segment is available.
    #[must_use]
    pub fn has_segment(
        &self,
        user: &str,
        online_hubs: &[String],
        wanted_size: i64,
        last_speed: i64,
        _dl_type: DownloadType,
        allow_overlap: bool,
    ) -> bool {
        if self.is_paused() || !self.is_source(user) {
            return false;
        }
        let source = self.sources.iter().find(|s| s.user == user);
        if let Some(source) = source
            && !online_hubs.is_empty()
            && online_hubs.iter().all(|h| source.is_blocked_on(h))
        {
            return false;
        }
        let partial = source.and_then(|s| s.partial.as_ref().map(|p| &p.partial_info));
        let block_size = if self.block_size > 0 {
            self.block_size
        } else {
            crate::collaborators::default_block_size(self.size)
        };
        !self
            .get_next_segment(block_size, wanted_size, last_speed, partial, allow_overlap)
            .is_empty()
    }
}

fn intersect_with_parts(candidate: &Segment, parts: &PartsInfo, block_size: i64) -> Segment {
    let start_block = (candidate.start() / block_size) as u16;
    let end_block = candidate.end().div_ceil(block_size) as u16;
    for block in start_block..end_block {
        if !parts.has_block(block) {
            // Trim candidate to end at this block's start.
            let trim_end = i64::from(block) * block_size;
            if trim_end <= candidate.start() {
                return Segment::empty();
            }
            return Segment::new(candidate.start(), trim_end - candidate.start());
        }
    }
    *candidate
}
