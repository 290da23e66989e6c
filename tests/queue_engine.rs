//! End-to-end scenarios against the public [`QueueEngine`] API, matching the
//! concrete walkthroughs in the design spec.

use adc_queue_engine::engine::QueueEngine;
use adc_queue_engine::types::{ConnectionToken, GateReason, Priority, StartDownloadResult};
use adc_queue_engine::EngineConfig;

fn clock() -> i64 {
    0
}

/// S1: two users split a file's segments between them, then a third request
/// picks up the remaining range; completing every segment finishes the file.
#[tokio::test]
async fn two_segment_happy_path() {
    let engine = QueueEngine::new(EngineConfig::default(), clock);
    let bundle = engine.add_bundle("/downloads/x", Priority::Normal).await;
    let file = engine
        .add_file(bundle, "/downloads/x/movie.mkv", 4 * 1024 * 1024, "TTH", Priority::Normal)
        .await
        .unwrap();
    engine.add_source(file, "u1", "adc://hub").await.unwrap();
    engine.add_source(file, "u2", "adc://hub").await.unwrap();

    let r1 = engine
        .scheduler
        .start_download(&engine, ConnectionToken(1), "u1", 1024 * 1024, 0)
        .await;
    assert!(matches!(r1, StartDownloadResult::Ready { file: f } if f == file));

    let r2 = engine
        .scheduler
        .start_download(&engine, ConnectionToken(2), "u2", 1024 * 1024, 0)
        .await;
    assert!(matches!(r2, StartDownloadResult::Ready { file: f } if f == file));

    {
        let files = engine.files.read().await;
        let f = files.find_file(file).unwrap();
        let seg1 = f.active_downloads.get(&ConnectionToken(1)).unwrap();
        let seg2 = f.active_downloads.get(&ConnectionToken(2)).unwrap();
        assert_eq!(seg1.start(), 0);
        assert_eq!(seg2.start(), 1024 * 1024);
    }

    let machine = adc_queue_engine::engine::transfer::TransferStateMachine;
    {
        let mut downloads = engine.downloads.write().await;
        let (seg1, seg2) = {
            let files = engine.files.read().await;
            let f = files.find_file(file).unwrap();
            (
                *f.active_downloads.get(&ConnectionToken(1)).unwrap(),
                *f.active_downloads.get(&ConnectionToken(2)).unwrap(),
            )
        };
        downloads.insert(
            ConnectionToken(1),
            adc_queue_engine::download::Download::new(
                ConnectionToken(1),
                file,
                adc_queue_engine::types::DownloadType::File,
                seg1,
                0,
            ),
        );
        downloads.insert(
            ConnectionToken(2),
            adc_queue_engine::download::Download::new(
                ConnectionToken(2),
                file,
                adc_queue_engine::types::DownloadType::File,
                seg2,
                0,
            ),
        );
    }
    machine.complete(&engine, ConnectionToken(1)).await.unwrap();
    machine.complete(&engine, ConnectionToken(2)).await.unwrap();

    let r3 = engine
        .scheduler
        .start_download(&engine, ConnectionToken(3), "u1", 1024 * 1024, 0)
        .await;
    assert!(matches!(r3, StartDownloadResult::Ready { file: f } if f == file));
    {
        let files = engine.files.read().await;
        let f = files.find_file(file).unwrap();
        let seg3 = f.active_downloads.get(&ConnectionToken(3)).unwrap();
        assert_eq!(seg3.start(), 2 * 1024 * 1024);
    }
}

/// S4: a lower-priority bundle's file is gated while a higher-priority file
/// in the same bundle still has running work; pausing the competing file
/// clears the gate.
#[tokio::test]
async fn lowest_priority_gating_clears_after_pause() {
    let engine = QueueEngine::new(EngineConfig::default(), clock);
    let bundle = engine.add_bundle("/downloads/x", Priority::Normal).await;
    let high = engine
        .add_file(bundle, "/downloads/x/a.bin", 1024 * 1024, "TTHA", Priority::High)
        .await
        .unwrap();
    let low = engine
        .add_file(bundle, "/downloads/x/b.bin", 1024 * 1024, "TTHB", Priority::Lowest)
        .await
        .unwrap();

    {
        let mut files = engine.files.write().await;
        files
            .find_file_mut(high)
            .unwrap()
            .active_downloads
            .insert(ConnectionToken(1), adc_queue_engine::segment::Segment::new(0, 1024));
    }

    let gated = engine.scheduler.allow_start(&engine, low).await;
    assert_eq!(gated, Err(GateReason::LowestPrioOtherFilesRunningInBundle));

    {
        let mut files = engine.files.write().await;
        files.find_file_mut(high).unwrap().active_downloads.clear();
    }
    assert!(engine.scheduler.allow_start(&engine, low).await.is_ok());
}

/// S6: a remote's advertised parts are checked against our own done set, and
/// our own advertised parts are derived from it in block units.
#[tokio::test]
async fn partial_source_need_computation() {
    let engine = QueueEngine::new(EngineConfig::default(), clock);
    let bundle = engine.add_bundle("/downloads/x", Priority::Normal).await;
    let file = engine
        .add_file(bundle, "/downloads/x/a.bin", 9 * 1024 * 1024, "TTH", Priority::Normal)
        .await
        .unwrap();

    {
        let mut files = engine.files.write().await;
        let f = files.find_file_mut(file).unwrap();
        f.done.insert(adc_queue_engine::segment::Segment::new(0, 3 * 1024 * 1024));
    }

    let files = engine.files.read().await;
    let f = files.find_file(file).unwrap();
    let remote_parts = adc_queue_engine::source::PartsInfo(vec![(2, 5), (7, 9)]);
    assert!(f.is_needed_part(&remote_parts, 1024 * 1024));

    let mine = f.get_partial_info(1024 * 1024);
    assert_eq!(mine.0, vec![(0, 3)]);
}

/// S4 boundary, expressed through the public control surface: pausing a
/// bundle removes its files from every source's rotation.
#[tokio::test]
async fn pausing_a_bundle_removes_its_files_from_rotation() {
    let engine = QueueEngine::new(EngineConfig::default(), clock);
    let bundle = engine.add_bundle("/downloads/x", Priority::Normal).await;
    let file = engine
        .add_file(bundle, "/downloads/x/a.bin", 1024, "TTH", Priority::Normal)
        .await
        .unwrap();
    engine.add_source(file, "u1", "adc://hub").await.unwrap();

    engine.pause_bundle(bundle, false).await.unwrap();

    let users = engine.users.read().await;
    assert_eq!(users.peek_next("u1"), None);
}
