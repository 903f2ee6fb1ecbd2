//! The per-download worker: playlist resolution, segment driving,
//! concatenation and remux for one promoted session.

use super::DownloadManager;
use crate::error::{Error, Result};
use crate::manager::DownloadEvent;
use crate::retention::{self, RetentionMeta};
use async_trait::async_trait;
use chrono::Utc;
use saveio_engine::{
    DownloadError, ProgressSink, SegmentDriver, concat_segments, load_segment_list, remove_scratch,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

/// Whether a worker error is the cooperative-stop signal rather than a
/// failure. The scheduler has already written the Paused/Cancelled status
/// in that case.
pub(super) fn is_cancel(err: &Error) -> bool {
    matches!(err, Error::Download(DownloadError::Cancelled))
}

/// Bridges driver progress into the session store and the event channel.
/// This is the only authoritative progress side-effect: resume state is
/// persisted here, one write per completed segment.
struct SessionProgressSink {
    manager: Arc<DownloadManager>,
    session_id: String,
}

#[async_trait]
impl ProgressSink for SessionProgressSink {
    async fn segment_completed(&self, index: u32) {
        let _ = self
            .manager
            .store()
            .update(&self.session_id, |s| s.record_segment(index))
            .await;
        self.manager.emit(DownloadEvent::SegmentCompleted {
            session_id: self.session_id.clone(),
            index,
        });
    }

    async fn progress(&self, done: u32, total: u32) {
        self.manager.emit(DownloadEvent::Progress {
            session_id: self.session_id.clone(),
            completed_segments: done,
            total_segments: total,
        });
    }
}

pub(super) async fn run(
    manager: &Arc<DownloadManager>,
    id: &str,
    token: &CancellationToken,
) -> Result<()> {
    let session = manager
        .store()
        .update(id, |s| s.started_at = Some(Utc::now()))
        .await?;
    let dir = manager.store().session_dir(id);

    let hls_url = Url::parse(&session.hls_url)
        .map_err(|e| Error::Validation(format!("session has invalid HLS URL: {e}")))?;
    let list = load_segment_list(&manager.client, &hls_url, &manager.engine_config.playlist).await?;
    let total = list.total_segments();
    info!(id, total, "Resolved segment list");

    let session = manager
        .store()
        .update(id, |s| {
            s.total_segments = total;
            s.completed_segments = s.completed_indexes.len() as u32;
        })
        .await?;

    // Retention starts counting from the first download attempt; later
    // attempts keep the original clock.
    if retention::read_meta(&dir).await.is_none() {
        let meta = RetentionMeta::new(id, manager.default_retention_days);
        retention::write_meta(&dir, &meta).await?;
    }

    let sink = Arc::new(SessionProgressSink {
        manager: manager.clone(),
        session_id: id.to_string(),
    });
    let driver = SegmentDriver::new(
        manager.client.clone(),
        manager.engine_config.clone(),
        token.clone(),
    );
    driver
        .run(&list, &dir, &session.completed_indexes, sink)
        .await?;

    if token.is_cancelled() {
        return Err(DownloadError::Cancelled.into());
    }

    debug!(id, "Concatenating segments");
    let concat = concat_segments(&dir, total).await?;
    let final_path = dir.join(&session.filename);
    manager.remuxer.remux(&concat, &final_path, token).await?;
    // Scratch is only removed once the final file is in place; a remux
    // failure keeps the segments so a resume retries just this step.
    remove_scratch(&dir, total).await?;

    manager
        .store()
        .update(id, |s| {
            s.status = crate::session::DownloadStatus::Completed;
            s.completed_at = Some(Utc::now());
            s.error = None;
        })
        .await?;
    Ok(())
}
