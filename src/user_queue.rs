//! Per-user, per-priority file rotation (spec §4.4, §4.5 step 1).
//!
//! The scheduler asks "what can I download from this user right now", not
//! "what's next in this file's source list" — so the index is organized the
//! other way round from [`crate::file_queue::FileQueue`]: priority bucket,
//! then user, then a round-robin queue of that user's files at that
//! priority. `rotate_user_queue` is what keeps one file from hogging a
//! user's slot forever when several of that user's files are equally
//! eligible.

use crate::types::{ConnectionToken, FileToken, Priority};
use std::collections::{HashMap, VecDeque};

/// `user -> [FileToken]` round-robin queue for one priority bucket.
type UserBucket = HashMap<String, VecDeque<FileToken>>;

/// Tracks which users have which files queued, partitioned by priority, and
/// which `(user, file)` pairs are currently downloading.
#[derive(Debug, Default)]
pub struct UserQueue {
    buckets: HashMap<Priority, UserBucket>,
    /// `(user, file) -> priority`, so `remove_file` doesn't need a bucket scan.
    location: HashMap<(String, FileToken), Priority>,
    running: HashMap<ConnectionToken, (String, FileToken)>,
}

impl UserQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `file` as available from `user` at `priority`. A no-op if
    /// already present (sources are added once per file; callers dedupe
    /// before calling this).
    pub fn add_file(&mut self, user: impl Into<String>, file: FileToken, priority: Priority) {
        let user = user.into();
        if self.location.contains_key(&(user.clone(), file)) {
            return;
        }
        self.buckets
            .entry(priority)
            .or_default()
            .entry(user.clone())
            .or_default()
            .push_back(file);
        self.location.insert((user, file), priority);
    }

    /// Removes `file` from `user`'s rotation entirely (source removed, file
    /// finished, or priority changing — callers re-add at the new priority).
    pub fn remove_file(&mut self, user: &str, file: FileToken) {
        let Some(priority) = self.location.remove(&(user.to_string(), file)) else {
            return;
        };
        if let Some(bucket) = self.buckets.get_mut(&priority)
            && let Some(queue) = bucket.get_mut(user)
        {
            queue.retain(|&f| f != file);
            if queue.is_empty() {
                bucket.remove(user);
            }
        }
    }

    /// Moves `file` from its current priority bucket to `new_priority`,
    /// preserving its position at the back of the new bucket's rotation
    /// (spec §4.4 `setQIPriority`).
    pub fn set_priority(&mut self, user: &str, file: FileToken, new_priority: Priority) {
        if self.location.get(&(user.to_string(), file)).copied() == Some(new_priority) {
            return;
        }
        self.remove_file(user, file);
        self.add_file(user.to_string(), file, new_priority);
    }

    /// Reprioritizes every file belonging to `bundle_files` across all users
    /// (spec §4.4 `setBundlePriority`, applied by the caller per file).
    pub fn set_bundle_priority(&mut self, bundle_files: &[(String, FileToken)], new_priority: Priority) {
        for (user, file) in bundle_files {
            self.set_priority(user, *file, new_priority);
        }
    }

    /// The next file this user could download, scanning priority buckets
    /// highest-to-lowest and skipping paused ones, without mutating
    /// rotation order (peek only — the scheduler calls `start_download`
    /// once it has actually started the segment, which rotates).
    #[must_use]
    pub fn peek_next(&self, user: &str) -> Option<FileToken> {
        for &priority in Priority::ORDERED_HIGH_TO_LOW.iter() {
            if priority.is_paused() {
                continue;
            }
            if let Some(queue) = self.buckets.get(&priority).and_then(|b| b.get(user))
                && let Some(&file) = queue.front()
            {
                return Some(file);
            }
        }
        None
    }

    /// Records that `connection` is now downloading `file` from `user`, and
    /// rotates that file to the back of its priority bucket so the next
    /// `peek_next` call offers a different one of this user's files (spec
    /// §4.5 step 1 round-robin fairness).
    pub fn start_download(&mut self, connection: ConnectionToken, user: impl Into<String>, file: FileToken) {
        let user = user.into();
        self.rotate_user_queue(&user, file);
        self.running.insert(connection, (user, file));
    }

    pub fn end_download(&mut self, connection: ConnectionToken) -> Option<(String, FileToken)> {
        self.running.remove(&connection)
    }

    #[must_use]
    pub fn running_file(&self, connection: ConnectionToken) -> Option<FileToken> {
        self.running.get(&connection).map(|(_, f)| *f)
    }

    /// The `(user, file)` pair running on `connection`, if any — needed by
    /// callers that only hold a connection token and must resolve which
    /// source record to demote or evict (spec §4.7 tree-mismatch and
    /// slow-source handling).
    #[must_use]
    pub fn running(&self, connection: ConnectionToken) -> Option<(String, FileToken)> {
        self.running.get(&connection).cloned()
    }

    /// Every connection currently running `file` for `user`, for slow-source
    /// eviction's "disconnect every connection this source holds" step.
    #[must_use]
    pub fn connections_for(&self, user: &str, file: FileToken) -> Vec<ConnectionToken> {
        self.running
            .iter()
            .filter(|(_, (u, f))| u == user && *f == file)
            .map(|(c, _)| *c)
            .collect()
    }

    /// Moves `file` to the back of `user`'s current-priority rotation.
    fn rotate_user_queue(&mut self, user: &str, file: FileToken) {
        let Some(&priority) = self.location.get(&(user.to_string(), file)) else {
            return;
        };
        if let Some(queue) = self.buckets.get_mut(&priority).and_then(|b| b.get_mut(user)) {
            if let Some(pos) = queue.iter().position(|&f| f == file) {
                queue.remove(pos);
                queue.push_back(file);
            }
        }
    }

    #[must_use]
    pub fn has_file(&self, user: &str, file: FileToken) -> bool {
        self.location.contains_key(&(user.to_string(), file))
    }
}
