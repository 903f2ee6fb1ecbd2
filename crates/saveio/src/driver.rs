// Parallel segment driver: a fixed pool of fetch workers over a shared
// pending queue, resume-aware.
//
// Segments may complete out of order; concatenation order is enforced later
// by index. The `ProgressSink` callbacks are the only authoritative progress
// side-effect — the in-memory counter exists for reporting only.

use crate::config::EngineConfig;
use crate::error::DownloadError;
use crate::fetcher::SegmentFetcher;
use crate::layout;
use crate::playlist::{HlsSegment, SegmentList};
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use std::collections::{BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Receives progress from the driver as segments land on disk.
///
/// `segment_completed` fires once per newly written segment, after the file
/// has been renamed into place; implementations persist resume state here.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn segment_completed(&self, index: u32);
    async fn progress(&self, done: u32, total: u32);
}

/// A sink for callers that do not care about progress.
pub struct NullSink;

#[async_trait]
impl ProgressSink for NullSink {
    async fn segment_completed(&self, _index: u32) {}
    async fn progress(&self, _done: u32, _total: u32) {}
}

pub struct SegmentDriver {
    client: Client,
    config: Arc<EngineConfig>,
    token: CancellationToken,
}

impl SegmentDriver {
    pub fn new(client: Client, config: Arc<EngineConfig>, token: CancellationToken) -> Self {
        Self {
            client,
            config,
            token,
        }
    }

    /// Download every segment in `list` that is not already on disk into
    /// `dir`, with `segment_concurrency` workers sharing one FIFO.
    ///
    /// `completed` is the persisted resume state. It is trusted only as far
    /// as the files back it up: an index whose file is missing or under the
    /// minimum size is re-queued (the lazy fsck on resume).
    pub async fn run(
        &self,
        list: &SegmentList,
        dir: &Path,
        completed: &BTreeSet<u32>,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<(), DownloadError> {
        let total = list.total_segments();

        // One token for this run: an external cancel propagates in, and the
        // first fatal worker error aborts the siblings' in-flight fetches.
        let child = self.token.child_token();
        let fetcher = Arc::new(SegmentFetcher::new(
            self.client.clone(),
            self.config.clone(),
            child.clone(),
        ));

        if let Some(init_url) = &list.init_url {
            let init_path = layout::init_path(dir);
            if !file_meets_minimum(&init_path, self.config.fetcher.min_segment_bytes) {
                debug!(url = %init_url, "Fetching init segment");
                fetcher.fetch_to_file(init_url, &init_path).await?;
            }
        }

        let pending = self.pending_segments(list, dir, completed);
        let done = AtomicU32::new(total - pending.len() as u32);
        if pending.is_empty() {
            info!(total, "All segments already on disk, nothing to fetch");
            sink.progress(total, total).await;
            return Ok(());
        }

        info!(
            total,
            pending = pending.len(),
            concurrency = self.config.driver.segment_concurrency,
            "Driving segment downloads"
        );

        let queue: Arc<Mutex<VecDeque<HlsSegment>>> = Arc::new(Mutex::new(pending.into()));
        let done = Arc::new(done);
        let worker_count = self
            .config
            .driver
            .segment_concurrency
            .max(1)
            .min(queue.lock().len());

        let mut workers: JoinSet<Result<(), DownloadError>> = JoinSet::new();
        for _ in 0..worker_count {
            let fetcher = fetcher.clone();
            let queue = queue.clone();
            let sink = sink.clone();
            let child = child.clone();
            let done = done.clone();
            let dir: PathBuf = dir.to_path_buf();
            workers.spawn(async move {
                loop {
                    if child.is_cancelled() {
                        return Err(DownloadError::Cancelled);
                    }
                    let Some(segment) = queue.lock().pop_front() else {
                        return Ok(());
                    };
                    let out_path = layout::segment_path(&dir, segment.index);
                    fetcher.fetch_to_file(&segment.url, &out_path).await?;
                    sink.segment_completed(segment.index).await;
                    let now_done = done.fetch_add(1, Ordering::SeqCst) + 1;
                    sink.progress(now_done, total).await;
                }
            });
        }

        // The first fatal error cancels the siblings; partial results stay
        // on disk and drive a later resume.
        let mut first_error: Option<DownloadError> = None;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    if first_error.is_none() {
                        warn!(error = %err, "Segment worker failed, cancelling siblings");
                        child.cancel();
                        first_error = Some(err);
                    }
                }
                Err(join_err) => {
                    if first_error.is_none() {
                        child.cancel();
                        first_error = Some(DownloadError::internal(format!(
                            "segment worker panicked: {join_err}"
                        )));
                    }
                }
            }
        }

        match first_error {
            None => Ok(()),
            // Report an external cancel as such, not as a worker failure.
            Some(_) if self.token.is_cancelled() => Err(DownloadError::Cancelled),
            Some(err) => Err(err),
        }
    }

    /// Segments still needing a fetch: not recorded as complete, or recorded
    /// but with a missing/undersized file on disk.
    fn pending_segments(
        &self,
        list: &SegmentList,
        dir: &Path,
        completed: &BTreeSet<u32>,
    ) -> Vec<HlsSegment> {
        let min = self.config.fetcher.min_segment_bytes;
        list.segments
            .iter()
            .filter(|segment| {
                if !completed.contains(&segment.index) {
                    return true;
                }
                let ok = file_meets_minimum(&layout::segment_path(dir, segment.index), min);
                if !ok {
                    warn!(
                        index = segment.index,
                        "Recorded segment is missing or truncated on disk, re-queueing"
                    );
                }
                !ok
            })
            .cloned()
            .collect()
    }
}

fn file_meets_minimum(path: &Path, min_bytes: usize) -> bool {
    std::fs::metadata(path)
        .map(|m| m.len() >= min_bytes as u64)
        .unwrap_or(false)
}
