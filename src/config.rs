//! Engine configuration (spec §6.5), layered the way the donor library's
//! `config.rs` layers its sub-configs: one struct per component, composed
//! into a top-level [`EngineConfig`], each field defaulted via a named
//! `default_*` function so partial JSON/TOML documents deserialize cleanly.

use crate::types::{AutoDisconnectMode, AutoPrioMode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_min_segment_size() -> i64 {
    256 * 1024
}

fn default_new_segment_min_speed() -> i64 {
    10 * 1024 // bytes/sec; below this, a second parallel segment isn't started
}

fn default_true() -> bool {
    true
}

fn default_extra_download_slots() -> u32 {
    3
}

/// Segment/slot policy (spec §6.5 `min_segment_size`, `new_segment_min_speed`,
/// `allow_slow_overlap`, `extra_download_slots`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    #[serde(default = "default_min_segment_size")]
    pub min_segment_size: i64,
    #[serde(default = "default_new_segment_min_speed")]
    pub new_segment_min_speed: i64,
    #[serde(default = "default_true")]
    pub allow_slow_overlap: bool,
    #[serde(default = "default_extra_download_slots")]
    pub extra_download_slots: u32,
    /// Global concurrent-download slot ceiling (0 = unlimited).
    pub max_running_downloads: u32,
    /// Global outbound speed ceiling in bytes/sec (0 = unlimited).
    pub max_speed_bytes_per_sec: u64,
    /// Seconds of sustained sub-threshold throughput before a source is
    /// flagged `SLOWUSER` (spec §4.7, §5).
    #[serde(with = "duration_secs")]
    pub slow_source_disconnect_time: Duration,
    /// Throughput below which a source counts as slow, bytes/sec.
    pub slow_source_speed_threshold: i64,
    /// Seconds of estimated time-left a running segment must exceed before
    /// it becomes eligible for overlap duplication (spec §4.6 rule 5).
    pub overlap_threshold_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            min_segment_size: default_min_segment_size(),
            new_segment_min_speed: default_new_segment_min_speed(),
            allow_slow_overlap: true,
            extra_download_slots: default_extra_download_slots(),
            max_running_downloads: 0,
            max_speed_bytes_per_sec: 0,
            slow_source_disconnect_time: Duration::from_secs(40),
            slow_source_speed_threshold: 1024,
            overlap_threshold_secs: 45,
        }
    }
}

fn default_autoprio_interval() -> Duration {
    Duration::from_secs(10 * 60)
}

/// Auto-priority controller configuration (spec §4.10, §6.5 `autoprio_type`,
/// `dl_auto_disconnect_mode`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub autoprio_type: AutoPrioMode,
    #[serde(with = "duration_secs")]
    pub autoprio_interval: Duration,
    pub dl_auto_disconnect_mode: AutoDisconnectMode,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            autoprio_type: AutoPrioMode::Balanced,
            autoprio_interval: default_autoprio_interval(),
            dl_auto_disconnect_mode: AutoDisconnectMode::Bundle,
        }
    }
}

fn default_search_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_max_auto_match_sources() -> u32 {
    10
}

fn default_result_debounce() -> Duration {
    Duration::from_secs(2)
}

fn default_recent_window() -> Duration {
    Duration::from_secs(7 * 24 * 60 * 60)
}

/// Alternate-source search driver configuration (spec §4.11, §6.5 `auto_search`,
/// `auto_add_source`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    #[serde(default = "default_true")]
    pub auto_search: bool,
    #[serde(default = "default_true")]
    pub auto_add_source: bool,
    #[serde(with = "duration_secs")]
    pub search_tick_interval: Duration,
    pub max_auto_match_sources: u32,
    #[serde(with = "duration_secs")]
    pub result_debounce: Duration,
    /// Bundles added more recently than this are searched more aggressively
    /// (spec §4.11 recent/old split).
    #[serde(with = "duration_secs")]
    pub recent_window: Duration,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            auto_search: true,
            auto_add_source: true,
            search_tick_interval: default_search_interval(),
            max_auto_match_sources: default_max_auto_match_sources(),
            result_debounce: default_result_debounce(),
            recent_window: default_recent_window(),
        }
    }
}

fn default_save_interval() -> Duration {
    Duration::from_secs(10)
}

/// Queue persistence configuration (spec §4.12, §6.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub queue_dir: std::path::PathBuf,
    #[serde(with = "duration_secs")]
    pub save_interval: Duration,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            queue_dir: std::path::PathBuf::from("./queue"),
            save_interval: default_save_interval(),
        }
    }
}

fn default_partial_share_min_size() -> i64 {
    20 * 1024 * 1024
}

fn default_pfs_refresh_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

/// Partial file sharing configuration (spec §4.8, §6.5 `partial_share_min_size`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PartialShareConfig {
    #[serde(default = "default_partial_share_min_size")]
    pub partial_share_min_size: i64,
    #[serde(with = "duration_secs")]
    pub refresh_interval: Duration,
    pub max_refresh_batch: usize,
}

impl Default for PartialShareConfig {
    fn default() -> Self {
        Self {
            partial_share_min_size: default_partial_share_min_size(),
            refresh_interval: default_pfs_refresh_interval(),
            max_refresh_batch: 10,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub queue: QueueConfig,
    pub scheduler: SchedulerConfig,
    pub search: SearchConfig,
    pub persistence: PersistenceConfig,
    pub partial_share: PartialShareConfig,
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

impl Default for AutoPrioMode {
    fn default() -> Self {
        AutoPrioMode::Disabled
    }
}

impl Default for AutoDisconnectMode {
    fn default() -> Self {
        AutoDisconnectMode::Bundle
    }
}
