//! Flat file index: every [`QueuedFile`] keyed by token, path, and TTH
//! (spec §4.2). Holds no scheduling logic — that's the user queue and
//! scheduler's job — just the lookup maps a single bundle or file-level
//! operation needs.

use crate::error::{Error, Result};
use crate::queued_file::QueuedFile;
use crate::types::FileToken;
use std::collections::{HashMap, HashSet};

/// Owns every queued file and the secondary indexes over it.
#[derive(Debug, Default)]
pub struct FileQueue {
    files: HashMap<FileToken, QueuedFile>,
    by_target: HashMap<String, FileToken>,
    by_tth: HashMap<String, HashSet<FileToken>>,
}

impl FileQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new file. Errors if `target` is already queued (spec §8
    /// invariant: one queued file per target path).
    pub fn add(&mut self, file: QueuedFile) -> Result<FileToken> {
        if self.by_target.contains_key(&file.target) {
            return Err(Error::Duplicate(format!(
                "file already queued at target {}",
                file.target
            )));
        }
        let token = file.token;
        self.by_tth.entry(file.tth.clone()).or_default().insert(token);
        self.by_target.insert(file.target.clone(), token);
        self.files.insert(token, file);
        Ok(token)
    }

    #[must_use]
    pub fn find_file(&self, token: FileToken) -> Option<&QueuedFile> {
        self.files.get(&token)
    }

    pub fn find_file_mut(&mut self, token: FileToken) -> Option<&mut QueuedFile> {
        self.files.get_mut(&token)
    }

    #[must_use]
    pub fn find_by_target(&self, target: &str) -> Option<&QueuedFile> {
        self.by_target.get(target).and_then(|t| self.files.get(t))
    }

    #[must_use]
    pub fn find_files_by_tth(&self, tth: &str) -> Vec<&QueuedFile> {
        self.by_tth
            .get(tth)
            .into_iter()
            .flat_map(|tokens| tokens.iter())
            .filter_map(|t| self.files.get(t))
            .collect()
    }

    #[must_use]
    pub fn is_file_queued(&self, target: &str) -> bool {
        self.by_target.contains_key(target)
    }

    /// Removes a file entirely, returning it so the caller can fire a
    /// `FileRemoved` event and detach it from its bundle.
    pub fn remove(&mut self, token: FileToken) -> Option<QueuedFile> {
        let file = self.files.remove(&token)?;
        self.by_target.remove(&file.target);
        if let Some(set) = self.by_tth.get_mut(&file.tth) {
            set.remove(&token);
            if set.is_empty() {
                self.by_tth.remove(&file.tth);
            }
        }
        Some(file)
    }

    /// Candidate files a partial-source query or PSR reply might refer to,
    /// i.e. every queued file sharing the given TTH that isn't finished yet
    /// (spec §4.8 `findPFSSources`).
    #[must_use]
    pub fn find_pfs_candidates(&self, tth: &str) -> Vec<&QueuedFile> {
        self.find_files_by_tth(tth)
            .into_iter()
            .filter(|f| !f.is_finished())
            .collect()
    }

    /// Files a file-list listing at `path` (posted by `user`) would match,
    /// delegating the actual listing parse to the
    /// [`crate::collaborators::FileListMatcher`] collaborator and mapping
    /// the matched tokens back to live entries (spec §4.2 `matchListing`).
    #[must_use]
    pub fn resolve_matches(&self, tokens: &[FileToken]) -> Vec<&QueuedFile> {
        tokens.iter().filter_map(|t| self.files.get(t)).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueuedFile> {
        self.files.values()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Priority;

    fn file(token: u32, target: &str, tth: &str) -> QueuedFile {
        QueuedFile::new(FileToken(token), target, 100, tth, Priority::Normal, 0)
    }

    #[test]
    fn add_then_find_by_target_and_tth() {
        let mut q = FileQueue::new();
        q.add(file(1, "/a", "TTH1")).unwrap();
        assert!(q.find_by_target("/a").is_some());
        assert_eq!(q.find_files_by_tth("TTH1").len(), 1);
    }

    #[test]
    fn duplicate_target_is_rejected() {
        let mut q = FileQueue::new();
        q.add(file(1, "/a", "TTH1")).unwrap();
        let err = q.add(file(2, "/a", "TTH2")).unwrap_err();
        assert!(matches!(err, Error::Duplicate(_)));
    }

    #[test]
    fn remove_clears_all_indexes() {
        let mut q = FileQueue::new();
        q.add(file(1, "/a", "TTH1")).unwrap();
        let removed = q.remove(FileToken(1)).unwrap();
        assert_eq!(removed.target, "/a");
        assert!(q.find_by_target("/a").is_none());
        assert!(q.find_files_by_tth("TTH1").is_empty());
    }

    #[test]
    fn multiple_files_share_tth() {
        let mut q = FileQueue::new();
        q.add(file(1, "/a", "TTH1")).unwrap();
        q.add(file(2, "/b", "TTH1")).unwrap();
        assert_eq!(q.find_files_by_tth("TTH1").len(), 2);
    }

    #[test]
    fn pfs_candidates_exclude_finished_files() {
        let mut q = FileQueue::new();
        q.add(file(1, "/a", "TTH1")).unwrap();
        q.find_file_mut(FileToken(1))
            .unwrap()
            .add_finished_segment(crate::segment::Segment::new(0, 100));
        assert!(q.find_pfs_candidates("TTH1").is_empty());
    }
}
