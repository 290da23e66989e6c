//! Bundle index plus the recent/old priority split the alternate-search
//! driver reads from (spec §4.3, §4.11).

use crate::bundle::Bundle;
use crate::error::{Error, Result};
use crate::types::{BundleToken, FileToken};
use std::collections::{BinaryHeap, HashMap, HashSet};

/// Owns every [`Bundle`] plus the indexes needed to find one by file or by
/// NMDC virtual directory path.
#[derive(Debug, Default)]
pub struct BundleQueue {
    bundles: HashMap<BundleToken, Bundle>,
    file_to_bundle: HashMap<FileToken, BundleToken>,
    nmdc_dirs: HashMap<String, BundleToken>,
}

impl BundleQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_bundle(&mut self, bundle: Bundle) -> Result<BundleToken> {
        if let Some(dir) = bundle.path.nmdc_virtual_path.clone()
            && self.nmdc_dirs.contains_key(&dir)
        {
            return Err(Error::Duplicate(format!("nmdc directory already queued: {dir}")));
        }
        let token = bundle.token;
        if let Some(dir) = &bundle.path.nmdc_virtual_path {
            self.nmdc_dirs.insert(dir.clone(), token);
        }
        self.bundles.insert(token, bundle);
        Ok(token)
    }

    #[must_use]
    pub fn find_bundle(&self, token: BundleToken) -> Option<&Bundle> {
        self.bundles.get(&token)
    }

    pub fn find_bundle_mut(&mut self, token: BundleToken) -> Option<&mut Bundle> {
        self.bundles.get_mut(&token)
    }

    pub fn add_bundle_item(&mut self, bundle_token: BundleToken, file: FileToken) -> Result<()> {
        let bundle = self
            .bundles
            .get_mut(&bundle_token)
            .ok_or_else(|| Error::NotFound(format!("bundle {bundle_token}")))?;
        bundle.add_file(file);
        self.file_to_bundle.insert(file, bundle_token);
        Ok(())
    }

    /// Detaches a file from its bundle. If the bundle becomes empty it is
    /// dropped and its token returned (spec §4.3 `removeBundleItem`).
    pub fn remove_bundle_item(&mut self, file: FileToken) -> Option<BundleToken> {
        let bundle_token = self.file_to_bundle.remove(&file)?;
        let emptied = self
            .bundles
            .get_mut(&bundle_token)
            .map(|b| b.remove_file(file))
            .unwrap_or(false);
        if emptied {
            if let Some(b) = self.bundles.remove(&bundle_token)
                && let Some(dir) = b.path.nmdc_virtual_path
            {
                self.nmdc_dirs.remove(&dir);
            }
            Some(bundle_token)
        } else {
            None
        }
    }

    #[must_use]
    pub fn find_bundle_for_file(&self, file: FileToken) -> Option<BundleToken> {
        self.file_to_bundle.get(&file).copied()
    }

    #[must_use]
    pub fn is_nmdc_dir_queued(&self, dir: &str) -> bool {
        self.nmdc_dirs.contains_key(dir)
    }

    /// Bundles sharing a target directory with `bundle_token`, i.e. the set
    /// a merge operation would fold together (spec §4.3 `getMergeBundle`).
    #[must_use]
    pub fn get_merge_bundle(&self, bundle_token: BundleToken) -> Option<BundleToken> {
        let target = &self.bundles.get(&bundle_token)?.path.local_root;
        self.bundles
            .iter()
            .find(|(token, b)| **token != bundle_token && &b.path.local_root == target)
            .map(|(token, _)| *token)
    }

    /// Bundles rooted underneath `bundle_token`'s directory (spec §4.3
    /// `getSubBundles`).
    #[must_use]
    pub fn get_sub_bundles(&self, bundle_token: BundleToken) -> Vec<BundleToken> {
        let Some(root) = self.bundles.get(&bundle_token).map(|b| b.path.local_root.clone()) else {
            return Vec::new();
        };
        self.bundles
            .iter()
            .filter(|(token, b)| **token != bundle_token && b.path.local_root.starts_with(&root))
            .map(|(token, _)| *token)
            .collect()
    }

    pub fn remove_bundle(&mut self, token: BundleToken) -> Option<Bundle> {
        let bundle = self.bundles.remove(&token)?;
        for file in &bundle.files {
            self.file_to_bundle.remove(file);
        }
        if let Some(dir) = &bundle.path.nmdc_virtual_path {
            self.nmdc_dirs.remove(dir);
        }
        Some(bundle)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Bundle> {
        self.bundles.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bundles.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bundles.is_empty()
    }
}

/// A bundle's position in the search rotation, recent bundles are searched
/// more aggressively than old ones (spec §4.11).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SearchEntry {
    bundle: BundleToken,
    /// Lower sorts first: recency rank, then insertion order as tiebreak.
    next_search_at: i64,
    sequence: u64,
}

impl Ord for SearchEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; reverse so earliest next_search_at pops first.
        other
            .next_search_at
            .cmp(&self.next_search_at)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for SearchEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Two priority queues of bundles awaiting an alternate-source search:
/// `recent` for bundles added inside the configured recent window, `old`
/// for everything else (spec §4.11, search-tick rotation).
#[derive(Debug, Default)]
pub struct PrioritySearchQueue {
    recent: BinaryHeap<SearchEntry>,
    old: BinaryHeap<SearchEntry>,
    tracked: HashSet<BundleToken>,
    sequence: u64,
}

impl PrioritySearchQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bundle: BundleToken, next_search_at: i64, recent: bool) {
        self.tracked.insert(bundle);
        let seq = self.sequence;
        self.sequence += 1;
        let entry = SearchEntry {
            bundle,
            next_search_at,
            sequence: seq,
        };
        if recent {
            self.recent.push(entry);
        } else {
            self.old.push(entry);
        }
    }

    /// Pops the earliest-due bundle across both queues whose
    /// `next_search_at` is `<= now`, preferring `recent` on a tie.
    pub fn pop_due(&mut self, now: i64) -> Option<BundleToken> {
        let recent_ready = self.recent.peek().is_some_and(|e| e.next_search_at <= now);
        if recent_ready {
            let entry = self.recent.pop()?;
            self.tracked.remove(&entry.bundle);
            return Some(entry.bundle);
        }
        let old_ready = self.old.peek().is_some_and(|e| e.next_search_at <= now);
        if old_ready {
            let entry = self.old.pop()?;
            self.tracked.remove(&entry.bundle);
            return Some(entry.bundle);
        }
        None
    }

    #[must_use]
    pub fn contains(&self, bundle: BundleToken) -> bool {
        self.tracked.contains(&bundle)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.recent.len() + self.old.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::PathInfo;
    use crate::types::Priority;

    fn bundle(token: u32, root: &str) -> Bundle {
        Bundle::new(BundleToken(token), PathInfo::new(root), Priority::Normal, 0)
    }

    #[test]
    fn add_bundle_item_links_file_to_bundle() {
        let mut q = BundleQueue::new();
        q.add_bundle(bundle(1, "/dl/x")).unwrap();
        q.add_bundle_item(BundleToken(1), FileToken(1)).unwrap();
        assert_eq!(q.find_bundle_for_file(FileToken(1)), Some(BundleToken(1)));
    }

    #[test]
    fn remove_last_item_drops_bundle() {
        let mut q = BundleQueue::new();
        q.add_bundle(bundle(1, "/dl/x")).unwrap();
        q.add_bundle_item(BundleToken(1), FileToken(1)).unwrap();
        let dropped = q.remove_bundle_item(FileToken(1));
        assert_eq!(dropped, Some(BundleToken(1)));
        assert!(q.find_bundle(BundleToken(1)).is_none());
    }

    #[test]
    fn get_sub_bundles_matches_path_prefix() {
        let mut q = BundleQueue::new();
        q.add_bundle(bundle(1, "/dl/parent")).unwrap();
        q.add_bundle(bundle(2, "/dl/parent/child")).unwrap();
        q.add_bundle(bundle(3, "/dl/other")).unwrap();
        let subs = q.get_sub_bundles(BundleToken(1));
        assert_eq!(subs, vec![BundleToken(2)]);
    }

    #[test]
    fn search_queue_prefers_recent_on_tie() {
        let mut q = PrioritySearchQueue::new();
        q.push(BundleToken(1), 100, false);
        q.push(BundleToken(2), 100, true);
        assert_eq!(q.pop_due(100), Some(BundleToken(2)));
        assert_eq!(q.pop_due(100), Some(BundleToken(1)));
    }

    #[test]
    fn search_queue_withholds_entries_not_yet_due() {
        let mut q = PrioritySearchQueue::new();
        q.push(BundleToken(1), 200, true);
        assert_eq!(q.pop_due(100), None);
        assert_eq!(q.pop_due(200), Some(BundleToken(1)));
    }
}
