//! Core value types and events shared across the queue and transfer engine.
//!
//! ## Submodules
//!
//! The stateful records (queued files, bundles, sources, indexes) live in
//! their own modules; this file holds the small value types and identifiers
//! that those modules and the public API share.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Stable, process-wide unique identifier for a queued file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileToken(pub u32);

/// Stable, process-wide unique identifier for a bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BundleToken(pub u32);

/// Identifier for a live transfer connection. Unique process-wide; inserting
/// a duplicate into the download registry is a programmer error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionToken(pub u64);

macro_rules! token_boilerplate {
    ($name:ident, $inner:ty) => {
        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<$inner> for $name {
            fn from(value: $inner) -> Self {
                Self(value)
            }
        }

        impl From<$name> for $inner {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.parse()?))
            }
        }
    };
}

token_boilerplate!(FileToken, u32);
token_boilerplate!(BundleToken, u32);
token_boilerplate!(ConnectionToken, u64);

/// Download priority. Ordinal order matches spec: PausedForce is the lowest,
/// Highest the highest. `auto` tracks whether the auto-priority controller
/// (§4.10) is allowed to adjust this value; it is orthogonal to the ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(i8)]
pub enum Priority {
    /// Forcibly paused; never auto-resumed.
    PausedForce = -2,
    /// Paused by the user or the auto-priority controller.
    Paused = -1,
    Lowest = 0,
    Low = 1,
    Normal = 2,
    High = 3,
    Highest = 4,
}

impl Priority {
    /// All priority buckets, from highest to lowest — the order the
    /// scheduler walks them in (spec §4.4 `getNext`).
    pub const ORDERED_HIGH_TO_LOW: [Priority; 7] = [
        Priority::Highest,
        Priority::High,
        Priority::Normal,
        Priority::Low,
        Priority::Lowest,
        Priority::Paused,
        Priority::PausedForce,
    ];

    /// True for priorities that prevent the scheduler from selecting this item.
    #[must_use]
    pub fn is_paused(self) -> bool {
        matches!(self, Priority::Paused | Priority::PausedForce)
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// Download request kind (spec §3 `Download`, §6.1 wire protocol).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownloadType {
    /// Tiger-tree leaves (`GET tthl ...`).
    Tree,
    /// A byte-range segment of file content.
    File,
    /// A partial (filtered) filelist download.
    PartialList,
    /// A complete filelist download.
    FullList,
}

bitflags::bitflags! {
    /// Per-file flags (spec §3 `QueuedFile`, donor of the naming from
    /// `QueueItem::FileFlags` in the original source).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct FileFlags: u32 {
        const NONE          = 0x00;
        const USER_LIST     = 0x01;
        const PARTIAL_LIST  = 0x02;
        const FINISHED      = 0x04;
        const MOVED         = 0x08;
        const HASHED        = 0x10;
        const PRIVATE       = 0x20;
        const CLIENT_VIEW   = 0x40;
        const TEXT          = 0x80;
        const MATCH_QUEUE   = 0x100;
    }
}

bitflags::bitflags! {
    /// Per-source flags (spec §3 `Source`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct SourceFlags: u32 {
        const NONE              = 0x00;
        const FILE_NOT_AVAILABLE = 0x01;
        const NO_FILE_ACCESS     = 0x02;
        const BAD_TREE           = 0x04;
        const SLOW_SOURCE        = 0x08;
        const PARTIAL            = 0x10;
        const NO_NEED_PARTS      = 0x20;
        const TTH_INCONSISTENCY  = 0x40;
    }
}

bitflags::bitflags! {
    /// Per-download flags (spec §3 `Download`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct DownloadFlags: u32 {
        const NONE          = 0x00;
        const XML_BZ_LIST   = 0x01;
        const TTHLIST       = 0x02;
        const SLOWUSER      = 0x04;
        const OVERLAP       = 0x08;
        const CHUNKED       = 0x10;
        const HIGHEST_PRIO  = 0x20;
    }
}

/// Bundle lifecycle status (spec §3 `Bundle`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BundleStatus {
    New,
    Queued,
    DownloadError,
    Downloaded,
    ValidationRunning,
    ValidationError,
    Completed,
    Shared,
}

/// Classification of whether a file/directory is already (partially) queued
/// or finished locally (spec §4.2 `isFileQueued`, GLOSSARY "Dupe").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DupeType {
    None,
    QueuePartial,
    QueueFull,
    FinishedPartial,
    FinishedFull,
}

/// Auto-priority controller mode (spec §4.10, §6.5 `autoprio_type`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AutoPrioMode {
    Disabled,
    Progress,
    Balanced,
}

/// Scope of slow-source eviction (spec §4.7, §6.5 `dl_auto_disconnect_mode`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AutoDisconnectMode {
    File,
    Bundle,
    All,
}

/// Result of `startDownload`'s combined source-pick + slot-gate (spec §4.5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartDownloadResult {
    /// No assignable work was found for this user.
    NoWork,
    /// Work exists but is currently gated (e.g. slot/priority policy).
    Gated { file: FileToken, reason: GateReason },
    /// Work exists and may start immediately.
    Ready { file: FileToken },
    /// A PARTIAL source advertises none of this file's remaining parts; the
    /// source has been removed and flagged `NO_NEED_PARTS` and the caller
    /// should disconnect the connection (spec §4.5 step 3).
    Disconnect { reason: String },
}

/// Why `allowStartQI` refused to start a download right now (spec §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateReason {
    NoFreeSlots,
    SpeedCeilingReached,
    LowestPrioOtherBundlesRunning,
    LowestPrioOtherFilesRunningInBundle,
}

/// Lifecycle and progress events fired by the engine. Listener callbacks are
/// enqueue-only (spec §9 design note): consumers receive these over a
/// `tokio::sync::broadcast` channel after the emitting lock has been released.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    FileAdded {
        file: FileToken,
        bundle: BundleToken,
    },
    FileFinished {
        file: FileToken,
        bundle: BundleToken,
    },
    FileRemoved {
        file: FileToken,
    },
    BundleAdded {
        bundle: BundleToken,
    },
    BundleStatusChanged {
        bundle: BundleToken,
        status: BundleStatus,
    },
    BundleRemoved {
        bundle: BundleToken,
    },
    SourceAdded {
        file: FileToken,
        nick: String,
    },
    SourceRemoved {
        file: FileToken,
        nick: String,
        flags: SourceFlags,
    },
    SourceBad {
        file: FileToken,
        nick: String,
        flags: SourceFlags,
    },
    DownloadStarted {
        file: FileToken,
        connection: ConnectionToken,
        start: i64,
        size: i64,
    },
    DownloadFailed {
        file: FileToken,
        connection: ConnectionToken,
        reason: String,
    },
    /// An overlapping download of the same segment on another connection was
    /// cancelled once its sibling committed first (spec §4.6 rule 5, §8
    /// invariant 7).
    DownloadCancelled {
        file: FileToken,
        connection: ConnectionToken,
    },
    PriorityChanged {
        bundle: BundleToken,
        priority: Priority,
    },
    FilePriorityChanged {
        file: FileToken,
        priority: Priority,
    },
    /// A source just became eligible to run again after sitting at
    /// paused/LOWEST priority; the host should attempt to (re)connect to it
    /// (spec §4.10 "raising from paused/LOWEST triggers source-reconnect
    /// attempts").
    SourceReconnect {
        file: FileToken,
        nick: String,
    },
    UbnSent {
        bundle: BundleToken,
        nick: String,
        kind: String,
    },
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_ordinal_order_matches_spec() {
        assert!(Priority::PausedForce < Priority::Paused);
        assert!(Priority::Paused < Priority::Lowest);
        assert!(Priority::Lowest < Priority::Low);
        assert!(Priority::Low < Priority::Normal);
        assert!(Priority::Normal < Priority::High);
        assert!(Priority::High < Priority::Highest);
    }

    #[test]
    fn priority_is_paused() {
        assert!(Priority::Paused.is_paused());
        assert!(Priority::PausedForce.is_paused());
        assert!(!Priority::Lowest.is_paused());
        assert!(!Priority::Normal.is_paused());
    }

    #[test]
    fn file_token_roundtrips_through_display_and_fromstr() {
        let t = FileToken(42);
        let s = t.to_string();
        assert_eq!(s, "42");
        assert_eq!(s.parse::<FileToken>().unwrap(), t);
    }

    #[test]
    fn file_flags_bitwise_ops() {
        let mut flags = FileFlags::USER_LIST;
        flags.insert(FileFlags::FINISHED);
        assert!(flags.contains(FileFlags::USER_LIST));
        assert!(flags.contains(FileFlags::FINISHED));
        assert!(!flags.contains(FileFlags::PRIVATE));
    }
}
