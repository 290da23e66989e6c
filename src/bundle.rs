//! Bundle: a group of queued files sharing a common target directory,
//! downloaded and validated together (spec §3 `Bundle`, §4.3).

use crate::types::{BundleStatus, BundleToken, FileToken, Priority};
use std::collections::BTreeSet;

/// The local/remote directory pairing a bundle is rooted at (spec §3
/// `PathInfo`).
#[derive(Debug, Clone)]
pub struct PathInfo {
    pub local_root: String,
    /// NMDC doesn't have a native notion of directories as addressable
    /// queue entities; this records the virtual path used to detect
    /// duplicate NMDC-style bundle adds (spec §4.3 `isNmdcDirQueued`).
    pub nmdc_virtual_path: Option<String>,
}

impl PathInfo {
    #[must_use]
    pub fn new(local_root: impl Into<String>) -> Self {
        Self {
            local_root: local_root.into(),
            nmdc_virtual_path: None,
        }
    }
}

/// A group of files downloaded and validated as a unit.
#[derive(Debug, Clone)]
pub struct Bundle {
    pub token: BundleToken,
    pub path: PathInfo,
    pub status: BundleStatus,
    pub priority: Priority,
    pub auto_priority: bool,
    pub files: BTreeSet<FileToken>,
    pub finished_files: BTreeSet<FileToken>,
    pub added_at: i64,
    pub finished_at: Option<i64>,
    /// Set once every file has reported done and the validation hook has
    /// been invoked successfully (spec §4.3 status transition to `Shared`).
    pub validated: bool,
}

impl Bundle {
    #[must_use]
    pub fn new(token: BundleToken, path: PathInfo, priority: Priority, added_at: i64) -> Self {
        Self {
            token,
            path,
            status: BundleStatus::New,
            priority,
            auto_priority: false,
            files: BTreeSet::new(),
            finished_files: BTreeSet::new(),
            added_at,
            finished_at: None,
            validated: false,
        }
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.priority.is_paused()
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        !self.files.is_empty() && self.finished_files.len() == self.files.len()
    }

    pub fn add_file(&mut self, token: FileToken) {
        self.files.insert(token);
    }

    /// Removes a file from the bundle, returning whether the bundle is now
    /// empty (caller should drop it — spec §4.3 `removeBundleItem`).
    pub fn remove_file(&mut self, token: FileToken) -> bool {
        self.files.remove(&token);
        self.finished_files.remove(&token);
        self.files.is_empty()
    }

    pub fn mark_file_finished(&mut self, token: FileToken) {
        if self.files.contains(&token) {
            self.finished_files.insert(token);
        }
    }

    #[must_use]
    pub fn progress(&self) -> f64 {
        if self.files.is_empty() {
            return 0.0;
        }
        self.finished_files.len() as f64 / self.files.len() as f64
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn bundle() -> Bundle {
        Bundle::new(BundleToken(1), PathInfo::new("/downloads/x"), Priority::Normal, 0)
    }

    #[test]
    fn empty_bundle_is_not_finished() {
        let b = bundle();
        assert!(!b.is_finished());
    }

    #[test]
    fn finishes_when_every_file_marked_done() {
        let mut b = bundle();
        b.add_file(FileToken(1));
        b.add_file(FileToken(2));
        b.mark_file_finished(FileToken(1));
        assert!(!b.is_finished());
        b.mark_file_finished(FileToken(2));
        assert!(b.is_finished());
    }

    #[test]
    fn remove_file_reports_empty_bundle() {
        let mut b = bundle();
        b.add_file(FileToken(1));
        assert!(b.remove_file(FileToken(1)));
    }

    #[test]
    fn progress_tracks_finished_fraction() {
        let mut b = bundle();
        b.add_file(FileToken(1));
        b.add_file(FileToken(2));
        b.mark_file_finished(FileToken(1));
        assert!((b.progress() - 0.5).abs() < f64::EPSILON);
    }
}
