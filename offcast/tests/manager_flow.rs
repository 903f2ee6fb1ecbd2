//! Scheduler and worker lifecycle tests against a stub origin.

mod support;

use offcast::manager::{DownloadEvent, DownloadManager, ManagerOptions};
use offcast::session::{DownloadStatus, SessionStore};
use offcast::upstream::TranscodePreset;
use saveio_engine::{DownloadError, Remuxer};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use support::*;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(20);

async fn start(manager: &Arc<DownloadManager>, item: &str) -> String {
    manager
        .start_download(item, None, TranscodePreset::P720, None)
        .await
        .unwrap()
        .id
}

#[tokio::test]
async fn happy_path_produces_one_final_file() {
    let origin = StubOrigin::new(5, true);
    let master = origin.start().await;
    let root = tempfile::tempdir().unwrap();
    let manager = build_manager(root.path(), &master, 2).await;
    let mut events = manager.subscribe();

    let id = start(&manager, "item-1").await;
    let session = wait_until(&manager, &id, WAIT, |s| {
        s.status == DownloadStatus::Completed
    })
    .await;

    assert_eq!(session.completed_segments, 5);
    assert_eq!(session.total_segments, 5);
    assert_eq!(session.completed_indexes.len(), 5);
    assert!(session.completed_at.is_some());

    // Final file is the concat of init + 5 segments; scratch is gone.
    let dir = manager.store().session_dir(&id);
    let final_path = dir.join(&session.filename);
    assert_eq!(
        std::fs::metadata(&final_path).unwrap().len(),
        6 * SEGMENT_LEN as u64
    );
    let mut names: Vec<String> = std::fs::read_dir(&dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    assert_eq!(
        names,
        vec![
            session.filename.clone(),
            "retention.json".to_string(),
            "session.json".to_string()
        ]
    );

    // The lifecycle was broadcast: queued, started, per-segment progress,
    // completed. The Completed event may trail the persisted status write,
    // so drain until it arrives.
    let mut kinds = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let event = tokio::time::timeout_at(deadline, events.recv())
            .await
            .expect("timed out waiting for the completed event")
            .unwrap();
        let kind = match event {
            DownloadEvent::Queued { .. } => "queued",
            DownloadEvent::Started { .. } => "started",
            DownloadEvent::SegmentCompleted { .. } => "segment",
            DownloadEvent::Progress { .. } => "progress",
            DownloadEvent::Completed { .. } => "completed",
            _ => "other",
        };
        kinds.push(kind);
        if kind == "completed" {
            break;
        }
    }
    assert_eq!(kinds.first(), Some(&"queued"));
    assert_eq!(kinds.iter().filter(|k| **k == "segment").count(), 5);
    assert!(kinds.contains(&"started"));
}

#[tokio::test]
async fn concurrency_cap_is_enforced_and_queue_is_fifo() {
    let origin = StubOrigin::new(3, false);
    origin.gate.block(0);
    let master = origin.start().await;
    let root = tempfile::tempdir().unwrap();
    let manager = build_manager(root.path(), &master, 1).await;

    let a = start(&manager, "a").await;
    wait_until(&manager, &a, WAIT, |s| s.status == DownloadStatus::Downloading).await;

    let b = start(&manager, "b").await;
    let c = start(&manager, "c").await;

    let info = manager.queue_info().await;
    assert_eq!(info.active, 1);
    assert_eq!(info.queued, 2);
    assert_eq!(info.max_concurrent, 1);

    let b_session = manager.get_progress(&b).await.unwrap();
    let c_session = manager.get_progress(&c).await.unwrap();
    assert_eq!(b_session.queue_position, Some(1));
    assert_eq!(c_session.queue_position, Some(2));

    origin.gate.release_all();
    let a_done = wait_until(&manager, &a, WAIT, |s| s.status == DownloadStatus::Completed).await;
    let b_done = wait_until(&manager, &b, WAIT, |s| s.status == DownloadStatus::Completed).await;
    let c_done = wait_until(&manager, &c, WAIT, |s| s.status == DownloadStatus::Completed).await;

    // FIFO promotion: a before b before c.
    assert!(a_done.started_at.unwrap() <= b_done.started_at.unwrap());
    assert!(b_done.started_at.unwrap() <= c_done.started_at.unwrap());
}

#[tokio::test]
async fn move_to_front_reorders_promotion() {
    let origin = StubOrigin::new(3, false);
    origin.gate.block(0);
    let master = origin.start().await;
    let root = tempfile::tempdir().unwrap();
    let manager = build_manager(root.path(), &master, 1).await;

    let a = start(&manager, "a").await;
    wait_until(&manager, &a, WAIT, |s| s.status == DownloadStatus::Downloading).await;
    let b = start(&manager, "b").await;
    let c = start(&manager, "c").await;

    manager.move_to_front(&c).await.unwrap();

    // Positions renumber contiguously from 1.
    assert_eq!(
        manager.get_progress(&c).await.unwrap().queue_position,
        Some(1)
    );
    assert_eq!(
        manager.get_progress(&b).await.unwrap().queue_position,
        Some(2)
    );

    origin.gate.release_all();
    let b_done = wait_until(&manager, &b, WAIT, |s| s.status == DownloadStatus::Completed).await;
    let c_done = wait_until(&manager, &c, WAIT, |s| s.status == DownloadStatus::Completed).await;
    assert!(c_done.started_at.unwrap() <= b_done.started_at.unwrap());
}

#[tokio::test]
async fn pause_keeps_progress_and_resume_does_not_refetch() {
    let origin = StubOrigin::new(5, false);
    origin.gate.block(3);
    origin.gate.block(4);
    let master = origin.start().await;
    let root = tempfile::tempdir().unwrap();
    let manager = build_manager(root.path(), &master, 1).await;

    let id = start(&manager, "item").await;
    wait_until(&manager, &id, WAIT, |s| s.completed_segments >= 3).await;

    manager.pause_download(&id).await.unwrap();
    let paused = manager.get_progress(&id).await.unwrap();
    assert_eq!(paused.status, DownloadStatus::Paused);
    assert!(paused.completed_segments >= 3);

    // Files for completed segments survive the pause.
    let dir = manager.store().session_dir(&id);
    for index in &paused.completed_indexes {
        assert!(dir.join(format!("{index}.mp4")).exists());
    }

    origin.gate.release_all();
    manager.resume_paused_download(&id).await.unwrap();
    let done = wait_until(&manager, &id, WAIT, |s| s.status == DownloadStatus::Completed).await;
    assert_eq!(done.completed_segments, 5);

    // Segments finished before the pause were fetched exactly once.
    for index in paused.completed_indexes {
        assert_eq!(
            origin.hits.get(&format!("{index}.mp4")),
            1,
            "segment {index} was re-fetched"
        );
    }
}

#[tokio::test]
async fn cancel_removes_files_and_frees_the_slot() {
    let origin = StubOrigin::new(5, false);
    origin.gate.block(2);
    origin.gate.block(3);
    origin.gate.block(4);
    let master = origin.start().await;
    let root = tempfile::tempdir().unwrap();
    let manager = build_manager(root.path(), &master, 1).await;

    let a = start(&manager, "a").await;
    wait_until(&manager, &a, WAIT, |s| s.completed_segments >= 2).await;
    let b = start(&manager, "b").await;

    manager.cancel_download(&a).await.unwrap();

    let cancelled = manager.get_progress(&a).await.unwrap();
    assert_eq!(cancelled.status, DownloadStatus::Cancelled);
    assert!(!manager.store().session_dir(&a).exists());

    // The freed slot goes to the next queued download.
    let promoted = wait_until(&manager, &b, Duration::from_secs(2), |s| {
        s.status != DownloadStatus::Queued
    })
    .await;
    assert_eq!(promoted.status, DownloadStatus::Downloading);

    // Cancel is idempotent.
    manager.cancel_download(&a).await.unwrap();

    origin.gate.release_all();
    wait_until(&manager, &b, WAIT, |s| s.status == DownloadStatus::Completed).await;
}

#[tokio::test]
async fn remove_is_refused_while_active_and_allowed_after() {
    let origin = StubOrigin::new(3, false);
    origin.gate.block(0);
    let master = origin.start().await;
    let root = tempfile::tempdir().unwrap();
    let manager = build_manager(root.path(), &master, 1).await;

    let id = start(&manager, "item").await;
    wait_until(&manager, &id, WAIT, |s| s.status == DownloadStatus::Downloading).await;

    let err = manager.remove_download(&id).await.unwrap_err();
    assert!(matches!(err, offcast::Error::InvalidStateTransition { .. }));

    origin.gate.release_all();
    wait_until(&manager, &id, WAIT, |s| s.status == DownloadStatus::Completed).await;
    manager.remove_download(&id).await.unwrap();
    assert!(manager.get_progress(&id).await.is_err());
    assert!(!manager.store().session_dir(&id).exists());
}

/// Remuxer that fails its first invocation, then behaves.
struct FailOnceRemuxer {
    failed: AtomicBool,
    calls: AtomicU32,
}

#[async_trait::async_trait]
impl Remuxer for FailOnceRemuxer {
    async fn remux(
        &self,
        input: &Path,
        output: &Path,
        _token: &CancellationToken,
    ) -> Result<(), DownloadError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.failed.swap(true, Ordering::SeqCst) {
            return Err(DownloadError::RemuxFailed {
                exit: "exit status: 1".to_string(),
                stderr_tail: "moov atom not found".to_string(),
            });
        }
        tokio::fs::copy(input, output).await?;
        Ok(())
    }
}

#[tokio::test]
async fn resume_after_remux_failure_retries_only_the_remux() {
    let origin = StubOrigin::new(4, false);
    let master = origin.start().await;
    let root = tempfile::tempdir().unwrap();

    let store = Arc::new(SessionStore::load(root.path()).await.unwrap());
    let manager = DownloadManager::new(
        store,
        Arc::new(StubMediaServer {
            hls_url: master.clone(),
            duration_seconds: 30.0,
        }),
        Arc::new(FailOnceRemuxer {
            failed: AtomicBool::new(false),
            calls: AtomicU32::new(0),
        }),
        ManagerOptions {
            max_concurrent_downloads: 1,
            default_retention_days: None,
            engine: fast_engine_config(),
        },
    );

    let id = start(&manager, "item").await;
    let failed = wait_until(&manager, &id, WAIT, |s| s.status == DownloadStatus::Failed).await;
    assert!(failed.error.as_deref().unwrap().contains("remux failed"));
    // All segments were fetched; they are retained for the retry.
    assert_eq!(failed.completed_segments, 4);

    manager.resume_download(&id).await.unwrap();
    wait_until(&manager, &id, WAIT, |s| s.status == DownloadStatus::Completed).await;

    // The retry re-fetched nothing.
    for index in 0..4 {
        assert_eq!(origin.hits.get(&format!("{index}.mp4")), 1);
    }
}

#[tokio::test]
async fn raising_the_cap_promotes_more_queued_downloads() {
    let origin = StubOrigin::new(3, false);
    origin.gate.block(0);
    let master = origin.start().await;
    let root = tempfile::tempdir().unwrap();
    let manager = build_manager(root.path(), &master, 1).await;

    let a = start(&manager, "a").await;
    wait_until(&manager, &a, WAIT, |s| s.status == DownloadStatus::Downloading).await;
    let b = start(&manager, "b").await;
    assert_eq!(
        manager.get_progress(&b).await.unwrap().status,
        DownloadStatus::Queued
    );

    manager.set_max_concurrent(2).await;
    wait_until(&manager, &b, Duration::from_secs(2), |s| {
        s.status == DownloadStatus::Downloading
    })
    .await;
    assert_eq!(manager.queue_info().await.active, 2);

    origin.gate.release_all();
    wait_until(&manager, &a, WAIT, |s| s.status == DownloadStatus::Completed).await;
    wait_until(&manager, &b, WAIT, |s| s.status == DownloadStatus::Completed).await;
}
