//! External collaborator seams (spec §6.6): the engine owns queue state but
//! delegates hashing, searching, UDP transport, and file-list matching to
//! whatever hosts it (a hub client, a test harness). Mirrors the donor's
//! `NoOpParityHandler` pattern — a trait object field with a no-op default
//! so the engine is constructible and testable without a real client.

use crate::types::{BundleToken, FileToken};
use async_trait::async_trait;

/// Looks up or computes TTH tree data for queued files.
#[async_trait]
pub trait HashStore: Send + Sync {
    /// Root TTH for a file already on disk, if known.
    async fn get_root(&self, path: &str) -> Option<String>;

    /// Per-block leaf hashes for `tth`, used to verify downloaded blocks
    /// against the tree (spec §4.7 tree verification).
    async fn get_leaves(&self, tth: &str) -> Option<Vec<String>>;

    /// Derived block size for a tree, when already known (tree not
    /// downloaded yet returns `None`, and callers fall back to
    /// [`default_block_size`]).
    async fn get_block_size(&self, tth: &str) -> Option<i64>;
}

/// Issues and receives search requests on behalf of the alternate-source
/// search driver (spec §4.11).
#[async_trait]
pub trait SearchService: Send + Sync {
    /// Starts a TTH search; results arrive asynchronously through whatever
    /// channel the host uses to feed [`crate::engine::search_driver`].
    async fn search_tth(&self, tth: &str, token: BundleToken);
}

/// Sends UDP datagrams to partial-source peers (PSR requests, UBN/UBD/PBD
/// notifications, spec §6.2, §6.3).
#[async_trait]
pub trait UdpTransport: Send + Sync {
    async fn send(&self, ip: &str, port: &str, payload: Vec<u8>) -> std::io::Result<()>;
}

/// Matches a peer's advertised file list against queued files still needing
/// sources (spec §4.2 `matchListing`).
#[async_trait]
pub trait FileListMatcher: Send + Sync {
    /// Returns tokens of queued files found in the listing at `path`.
    async fn match_listing(&self, user: &str, path: &str) -> Vec<FileToken>;
}

/// No-op [`HashStore`] for engines run without a hashing backend (tests,
/// headless queue replay).
#[derive(Debug, Default)]
pub struct NoopHashStore;

#[async_trait]
impl HashStore for NoopHashStore {
    async fn get_root(&self, _path: &str) -> Option<String> {
        None
    }

    async fn get_leaves(&self, _tth: &str) -> Option<Vec<String>> {
        None
    }

    async fn get_block_size(&self, _tth: &str) -> Option<i64> {
        None
    }
}

#[derive(Debug, Default)]
pub struct NoopSearchService;

#[async_trait]
impl SearchService for NoopSearchService {
    async fn search_tth(&self, _tth: &str, _token: BundleToken) {}
}

#[derive(Debug, Default)]
pub struct NoopUdpTransport;

#[async_trait]
impl UdpTransport for NoopUdpTransport {
    async fn send(&self, _ip: &str, _port: &str, _payload: Vec<u8>) -> std::io::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct NoopFileListMatcher;

#[async_trait]
impl FileListMatcher for NoopFileListMatcher {
    async fn match_listing(&self, _user: &str, _path: &str) -> Vec<FileToken> {
        Vec::new()
    }
}

/// Smallest power-of-two block size `>= 1024` such that
/// `blocks * block_size >= file_size` stays within a reasonable tree depth
/// (spec §6.1). Used whenever a file's tree hasn't been downloaded yet and
/// no [`HashStore::get_block_size`] answer is available.
#[must_use]
pub fn default_block_size(file_size: i64) -> i64 {
    const MIN_BLOCK_SIZE: i64 = 1024;
    const MAX_BLOCKS: i64 = 1 << 20; // cap tree depth for very large files

    if file_size <= MIN_BLOCK_SIZE {
        return MIN_BLOCK_SIZE;
    }

    let mut block_size = MIN_BLOCK_SIZE;
    while file_size / block_size > MAX_BLOCKS {
        block_size *= 2;
    }
    block_size
}
