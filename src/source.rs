//! Source records: peers known to serve a queued file (spec §3 `Source`, §4.8).

use crate::segment::Segment;
use crate::types::SourceFlags;
use std::collections::BTreeSet;

/// Offsets into block-sized chunks describing which ranges a partial source
/// has, as alternating (start, end) block-index pairs. Capped at 255 pairs
/// (spec §4.8, Open Question resolution in SPEC_FULL.md §9.2).
pub const MAX_PARTS_INFO_PAIRS: usize = 255;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartsInfo(pub Vec<(u16, u16)>);

impl PartsInfo {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether block `index` falls inside any advertised `[start, end)` pair.
    #[must_use]
    pub fn has_block(&self, index: u16) -> bool {
        self.0.iter().any(|&(s, e)| index >= s && index < e)
    }

    /// Builds a `PartsInfo` from the disjoint, sorted segment set `done`,
    /// expressed in units of `block_size`, capped to
    /// [`MAX_PARTS_INFO_PAIRS`] pairs (spec §4.8 `handlePartialResult`).
    #[must_use]
    pub fn from_done_segments(done: &BTreeSet<Segment>, block_size: i64) -> Self {
        let mut pairs = Vec::new();
        for seg in done {
            if seg.is_empty() || block_size <= 0 {
                continue;
            }
            let start_block = (seg.start() / block_size) as u16;
            let end_block = seg.end().div_ceil(block_size) as u16;
            if end_block > start_block {
                pairs.push((start_block, end_block));
            }
            if pairs.len() >= MAX_PARTS_INFO_PAIRS {
                break;
            }
        }
        Self(pairs)
    }
}

/// Partial-source bookkeeping carried alongside a [`Source`] when the peer
/// advertises a `PartsInfo` (spec §3 `Source`).
#[derive(Debug, Clone)]
pub struct PartialSource {
    pub partial_info: PartsInfo,
    /// NMDC nick echo, used for NMDC-only UDP reply framing.
    pub my_nick: String,
    pub hub_ip_port: String,
    pub ip: String,
    pub udp_port: String,
    /// Next time this source may be queried again; fixed 5-minute backoff
    /// (spec §5 "Cancellation and timeouts").
    pub next_query_time: i64,
    pub pending_query_count: u8,
}

impl PartialSource {
    #[must_use]
    pub fn new(my_nick: String, hub_ip_port: String, ip: String, udp_port: String) -> Self {
        Self {
            partial_info: PartsInfo::new(),
            my_nick,
            hub_ip_port,
            ip,
            udp_port,
            next_query_time: 0,
            pending_query_count: 0,
        }
    }
}

/// A `(user, flags)` pair for a given queued file, plus optional partial
/// source data. Identity is the user's nick/CID — resolution against the
/// live hub/client state is an external collaborator's job (spec §1).
#[derive(Debug, Clone)]
pub struct Source {
    pub user: String,
    pub hub_url: String,
    pub flags: SourceFlags,
    pub partial: Option<PartialSource>,
    /// Hubs this source is blocked on for this file (spec §4.5 step 2).
    pub blocked_hubs: BTreeSet<String>,
}

impl Source {
    #[must_use]
    pub fn new(user: impl Into<String>, hub_url: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            hub_url: hub_url.into(),
            flags: SourceFlags::NONE,
            partial: None,
            blocked_hubs: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn is_partial(&self) -> bool {
        self.flags.contains(SourceFlags::PARTIAL) && self.partial.is_some()
    }

    #[must_use]
    pub fn is_blocked_on(&self, hub: &str) -> bool {
        self.blocked_hubs.contains(hub)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parts_info_from_done_segments_groups_into_block_units() {
        let mut done = BTreeSet::new();
        done.insert(Segment::new(0, 3 * 1024 * 1024));
        let parts = PartsInfo::from_done_segments(&done, 1024 * 1024);
        assert_eq!(parts.0, vec![(0, 3)]);
    }

    #[test]
    fn parts_info_caps_at_max_pairs() {
        let mut done = BTreeSet::new();
        for i in 0..300i64 {
            // disjoint single-block segments, each its own pair
            done.insert(Segment::new(i * 1024 * 1024 * 2, 1024 * 1024));
        }
        let parts = PartsInfo::from_done_segments(&done, 1024 * 1024);
        assert!(parts.0.len() <= MAX_PARTS_INFO_PAIRS);
    }

    #[test]
    fn has_block_checks_membership() {
        let parts = PartsInfo(vec![(2, 5), (7, 9)]);
        assert!(parts.has_block(2));
        assert!(parts.has_block(4));
        assert!(!parts.has_block(5));
        assert!(parts.has_block(7));
        assert!(!parts.has_block(9));
    }

    #[test]
    fn source_default_state_is_unblocked_and_non_partial() {
        let s = Source::new("nick", "adc://hub");
        assert!(!s.is_partial());
        assert!(!s.is_blocked_on("adc://hub"));
    }
}
