//! Error taxonomy for the queue and transfer engine (spec §7).
//!
//! Errors here are all *recoverable by construction*: per spec §7, a
//! recoverable condition never propagates above the connection layer — it
//! mutates index state and fires a listener event. The [`Error`] enum is
//! what connection-facing and persistence-facing call sites return; the
//! engine's internal handlers match on it to decide which index mutation
//! to perform, then usually just log the outcome rather than bubble it
//! further.

use crate::types::{BundleToken, FileToken};
use thiserror::Error as ThisError;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Transport-level failures on a connection (spec §7 `TransportFailed`, `NoSlots`).
#[derive(Debug, ThisError)]
pub enum TransportError {
    #[error("connection {0} disconnected")]
    Disconnected(u64),
    #[error("protocol parse error on connection {0}: {1}")]
    ParseError(u64, String),
    #[error("remote reported no free slots (MAXEDOUT)")]
    NoSlots,
}

/// Reasons a source gets demoted, blocked, or removed (spec §7 `FileUnavailable`,
/// `AccessDenied`, `TreeMismatch`, `SegmentMismatch`, `HashMismatch`).
#[derive(Debug, ThisError)]
pub enum SourceError {
    #[error("file {0} not available from remote 51")]
    FileUnavailable(FileToken),
    #[error("access denied (remote 53) on hub {1} for file {0}")]
    AccessDenied(FileToken, String),
    #[error("tree root mismatch for file {0}")]
    TreeMismatch(FileToken),
    #[error("SND segment did not match GET for file {0}")]
    SegmentMismatch(FileToken),
    #[error("hash mismatch in downloaded block for file {0}, range [{1}, {2})")]
    HashMismatch(FileToken, i64, i64),
}

/// Bundle-level faults (spec §7 `DiskFull/WriteFailed`, `ValidationHookRejected`).
#[derive(Debug, ThisError)]
pub enum BundleError {
    #[error("disk write failed for bundle {0}: {1}")]
    WriteFailed(BundleToken, String),
    #[error("insufficient disk space for bundle {0}, need {1} more bytes")]
    DiskFull(BundleToken, i64),
    #[error("validation hook rejected bundle {0}: {1}")]
    ValidationRejected(BundleToken, String),
}

/// Queue-persistence failures (spec §4.12, §6.4).
#[derive(Debug, ThisError)]
pub enum PersistenceError {
    #[error("io error persisting bundle {0}: {1}")]
    Io(BundleToken, #[source] std::io::Error),
    #[error("xml error persisting bundle {0}: {1}")]
    Xml(BundleToken, String),
    #[error("unsupported schema version {0} in bundle file for {1}")]
    UnsupportedVersion(u32, BundleToken),
    #[error("bundle file failed invariant check: {0}")]
    InvariantViolation(String),
}

/// Top-level error enum.
#[derive(Debug, ThisError)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Bundle(#[from] BundleError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("duplicate: {0}")]
    Duplicate(String),
    #[error("internal invariant broken: {0}")]
    Invariant(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
