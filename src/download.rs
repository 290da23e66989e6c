//! Live transfer state (spec §3 `Download`, `UserConnection`, §4.7).

use crate::segment::Segment;
use crate::types::{ConnectionToken, DownloadFlags, DownloadType, FileToken};

/// One in-flight request/response on a connection: a tree fetch, a file
/// segment, or a filelist fetch.
#[derive(Debug, Clone)]
pub struct Download {
    pub connection: ConnectionToken,
    pub file: FileToken,
    pub download_type: DownloadType,
    pub segment: Segment,
    pub flags: DownloadFlags,
    pub started_at: i64,
    pub bytes_transferred: i64,
    /// Rolling estimate in bytes/sec, updated by the transfer state machine
    /// on each chunk (spec §4.7 slow-source detection).
    pub current_speed: i64,
    /// Clock time the speed first dropped below
    /// `slow_source_speed_threshold`, reset to `None` on any sample at or
    /// above it (spec §5 "Slow-source timeout is measured in ticks
    /// accumulated under the running segment; reset on any ≥ threshold
    /// throughput sample").
    pub low_speed_since: Option<i64>,
}

impl Download {
    #[must_use]
    pub fn new(
        connection: ConnectionToken,
        file: FileToken,
        download_type: DownloadType,
        segment: Segment,
        started_at: i64,
    ) -> Self {
        Self {
            connection,
            file,
            download_type,
            segment,
            flags: DownloadFlags::NONE,
            started_at,
            bytes_transferred: 0,
            current_speed: 0,
            low_speed_since: None,
        }
    }

    #[must_use]
    pub fn is_slow(&self, threshold: i64) -> bool {
        self.flags.contains(DownloadFlags::SLOWUSER) || self.current_speed < threshold
    }

    /// Updates the low-speed tick accumulator for one sample at `now` (spec
    /// §4.7 slow-source policy, §5 timeout reset rule). Returns `true` once
    /// the sample has been below `threshold` continuously for at least
    /// `sustained_for` seconds.
    pub fn record_speed_sample(&mut self, now: i64, threshold: i64, sustained_for: i64) -> bool {
        if self.current_speed >= threshold {
            self.low_speed_since = None;
            return false;
        }
        let since = *self.low_speed_since.get_or_insert(now);
        now - since >= sustained_for
    }

    #[must_use]
    pub fn remaining(&self) -> i64 {
        (self.segment.size() - self.bytes_transferred).max(0)
    }

    /// Estimated seconds left at `current_speed`, `None` if stalled.
    #[must_use]
    pub fn estimated_seconds_left(&self) -> Option<u64> {
        if self.current_speed <= 0 {
            return None;
        }
        Some((self.remaining() / self.current_speed).max(0) as u64)
    }
}

/// Per-peer connection metadata the transfer state machine and scheduler
/// consult when deciding what a connection is allowed to do next (spec §3
/// `UserConnection`).
#[derive(Debug, Clone)]
pub struct UserConnection {
    pub token: ConnectionToken,
    pub user: String,
    pub hub_url: String,
    pub download_slot: bool,
    pub supports_tthl: bool,
    pub supports_zlib_get: bool,
    pub supports_minislots: bool,
}

impl UserConnection {
    #[must_use]
    pub fn new(token: ConnectionToken, user: impl Into<String>, hub_url: impl Into<String>) -> Self {
        Self {
            token,
            user: user.into(),
            hub_url: hub_url.into(),
            download_slot: false,
            supports_tthl: false,
            supports_zlib_get: false,
            supports_minislots: false,
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_slow_when_below_threshold() {
        let mut d = Download::new(ConnectionToken(1), FileToken(1), DownloadType::File, Segment::new(0, 100), 0);
        d.current_speed = 500;
        assert!(d.is_slow(1000));
        assert!(!d.is_slow(100));
    }

    #[test]
    fn remaining_never_negative() {
        let mut d = Download::new(ConnectionToken(1), FileToken(1), DownloadType::File, Segment::new(0, 100), 0);
        d.bytes_transferred = 150;
        assert_eq!(d.remaining(), 0);
    }

    #[test]
    fn estimated_seconds_left_none_when_stalled() {
        let d = Download::new(ConnectionToken(1), FileToken(1), DownloadType::File, Segment::new(0, 100), 0);
        assert_eq!(d.estimated_seconds_left(), None);
    }

    #[test]
    fn record_speed_sample_requires_sustained_low_throughput() {
        let mut d = Download::new(ConnectionToken(1), FileToken(1), DownloadType::File, Segment::new(0, 100), 0);
        d.current_speed = 100;
        assert!(!d.record_speed_sample(0, 1024, 40));
        assert!(!d.record_speed_sample(20, 1024, 40));
        assert!(d.record_speed_sample(41, 1024, 40));
    }

    #[test]
    fn record_speed_sample_resets_on_fast_tick() {
        let mut d = Download::new(ConnectionToken(1), FileToken(1), DownloadType::File, Segment::new(0, 100), 0);
        d.current_speed = 100;
        assert!(!d.record_speed_sample(0, 1024, 40));
        d.current_speed = 2048;
        assert!(!d.record_speed_sample(20, 1024, 40));
        d.current_speed = 100;
        assert!(!d.record_speed_sample(21, 1024, 40));
        assert!(d.record_speed_sample(62, 1024, 40));
    }
}
