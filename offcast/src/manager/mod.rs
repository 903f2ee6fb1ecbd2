//! Download manager: the single concurrency authority.
//!
//! Owns the queue, enforces the global download cap, and is the only place
//! that decides status transitions. Workers report back through the session
//! store and the event channel; every worker exit re-evaluates promotion.

mod worker;

use crate::error::{Error, Result};
use crate::retention::{self, RetentionMeta};
use crate::session::{DownloadSession, DownloadStatus, SessionStore};
use crate::upstream::{MediaServer, TranscodePreset};
use crate::utils::filename::output_file_name;
use chrono::Utc;
use parking_lot::Mutex;
use saveio_engine::{EngineConfig, Remuxer};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Capacity of the event broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Manager construction options.
#[derive(Clone)]
pub struct ManagerOptions {
    pub max_concurrent_downloads: usize,
    pub default_retention_days: Option<u32>,
    pub engine: EngineConfig,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: 2,
            default_retention_days: None,
            engine: EngineConfig::default(),
        }
    }
}

/// Events emitted as downloads move through their lifecycle. Delivery is
/// the subscriber's problem; a lagging receiver only loses events.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum DownloadEvent {
    Queued {
        session_id: String,
    },
    Started {
        session_id: String,
    },
    Progress {
        session_id: String,
        completed_segments: u32,
        total_segments: u32,
    },
    SegmentCompleted {
        session_id: String,
        index: u32,
    },
    Completed {
        session_id: String,
    },
    Failed {
        session_id: String,
        error: String,
    },
    Cancelled {
        session_id: String,
    },
    Paused {
        session_id: String,
    },
}

/// Queue summary returned by [`DownloadManager::queue_info`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueInfo {
    pub active: usize,
    pub queued: usize,
    pub max_concurrent: usize,
}

struct ActiveWorker {
    token: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

pub struct DownloadManager {
    store: Arc<SessionStore>,
    upstream: Arc<dyn MediaServer>,
    remuxer: Arc<dyn Remuxer>,
    engine_config: Arc<EngineConfig>,
    client: reqwest::Client,
    /// Global cap; hot-swappable at runtime.
    max_concurrent: AtomicUsize,
    default_retention_days: Option<u32>,
    /// Workers currently owning a session. Guarded by a plain mutex; never
    /// held across await.
    active: Mutex<HashMap<String, ActiveWorker>>,
    /// Serializes every state-changing operation and promotion decision.
    sched: tokio::sync::Mutex<()>,
    event_tx: broadcast::Sender<DownloadEvent>,
    shutdown_token: CancellationToken,
}

impl DownloadManager {
    pub fn new(
        store: Arc<SessionStore>,
        upstream: Arc<dyn MediaServer>,
        remuxer: Arc<dyn Remuxer>,
        options: ManagerOptions,
    ) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            store,
            upstream,
            remuxer,
            engine_config: Arc::new(options.engine),
            client: reqwest::Client::new(),
            max_concurrent: AtomicUsize::new(options.max_concurrent_downloads.max(1)),
            default_retention_days: options.default_retention_days,
            active: Mutex::new(HashMap::new()),
            sched: tokio::sync::Mutex::new(()),
            event_tx,
            shutdown_token: CancellationToken::new(),
        })
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Subscribe to lifecycle and progress events.
    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.event_tx.subscribe()
    }

    fn emit(&self, event: DownloadEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Change the global download cap and re-evaluate promotion.
    pub async fn set_max_concurrent(self: &Arc<Self>, max: usize) {
        self.max_concurrent.store(max.max(1), Ordering::SeqCst);
        self.schedule().await;
    }

    /// Create a new queued session for an upstream item and trigger
    /// promotion.
    pub async fn start_download(
        self: &Arc<Self>,
        item_id: &str,
        media_source_id: Option<&str>,
        preset: TranscodePreset,
        audio_stream_index: Option<u32>,
    ) -> Result<DownloadSession> {
        let resolved = self
            .upstream
            .resolve_item(item_id, media_source_id, preset, audio_stream_index)
            .await?;

        let session = {
            let _guard = self.sched.lock().await;
            let tail = self.queued_count().await as u32 + 1;
            let session = DownloadSession {
                id: Uuid::new_v4().to_string(),
                item_id: item_id.to_string(),
                media_source_id: resolved.media_source_id.clone(),
                title: resolved.title.clone(),
                filename: output_file_name(&resolved.title),
                hls_url: resolved.hls_url.clone(),
                duration_seconds: resolved.duration_seconds,
                status: DownloadStatus::Queued,
                total_segments: 0,
                completed_segments: 0,
                completed_indexes: Default::default(),
                error: None,
                created_at: Utc::now(),
                started_at: None,
                completed_at: None,
                queue_position: Some(tail),
            };
            self.store.create(session.clone()).await?;
            session
        };

        info!(id = %session.id, title = %session.title, preset = %preset, "Download queued");
        self.emit(DownloadEvent::Queued {
            session_id: session.id.clone(),
        });
        self.schedule().await;
        Ok(session)
    }

    /// Cancel a download. Idempotent: cancelling a terminal session is a
    /// no-op. Files are removed; the record stays listed until removed.
    pub async fn cancel_download(self: &Arc<Self>, id: &str) -> Result<()> {
        let stopped = {
            let _guard = self.sched.lock().await;
            let session = self.store.get(id).await?;
            match session.status {
                DownloadStatus::Cancelled | DownloadStatus::Completed => return Ok(()),
                DownloadStatus::Downloading => {
                    let taken = self.active.lock().remove(id);
                    self.store
                        .update(id, |s| {
                            s.status = DownloadStatus::Cancelled;
                            s.queue_position = None;
                        })
                        .await?;
                    taken
                }
                DownloadStatus::Queued | DownloadStatus::Paused | DownloadStatus::Failed => {
                    self.store
                        .update(id, |s| {
                            s.status = DownloadStatus::Cancelled;
                            s.queue_position = None;
                        })
                        .await?;
                    self.renumber_queued().await;
                    None
                }
            }
        };

        if let Some(worker) = stopped {
            worker.token.cancel();
            let _ = worker.handle.await;
        }
        self.store.delete_dir(id).await?;

        info!(id, "Download cancelled");
        self.emit(DownloadEvent::Cancelled {
            session_id: id.to_string(),
        });
        self.schedule().await;
        Ok(())
    }

    /// Pause a queued or active download, keeping its files for resume.
    pub async fn pause_download(self: &Arc<Self>, id: &str) -> Result<()> {
        let stopped = {
            let _guard = self.sched.lock().await;
            let session = self.store.get(id).await?;
            match session.status {
                DownloadStatus::Queued => {
                    self.store
                        .update(id, |s| {
                            s.status = DownloadStatus::Paused;
                            s.queue_position = None;
                        })
                        .await?;
                    self.renumber_queued().await;
                    None
                }
                DownloadStatus::Downloading => {
                    let taken = self.active.lock().remove(id);
                    self.store
                        .update(id, |s| {
                            s.status = DownloadStatus::Paused;
                            s.queue_position = None;
                        })
                        .await?;
                    taken
                }
                status => {
                    return Err(Error::invalid_transition("pause", status.as_str()));
                }
            }
        };

        if let Some(worker) = stopped {
            worker.token.cancel();
            let _ = worker.handle.await;
        }

        info!(id, "Download paused");
        self.emit(DownloadEvent::Paused {
            session_id: id.to_string(),
        });
        self.schedule().await;
        Ok(())
    }

    /// Move a paused download back to the queue tail.
    pub async fn resume_paused_download(self: &Arc<Self>, id: &str) -> Result<()> {
        self.requeue(id, DownloadStatus::Paused, "unpause").await
    }

    /// Retry a failed download. The worker re-enters the segment driver
    /// with the persisted index set, so only missing work is redone; a
    /// download that failed in the remux step retries just the remux.
    pub async fn resume_download(self: &Arc<Self>, id: &str) -> Result<()> {
        self.requeue(id, DownloadStatus::Failed, "resume").await
    }

    async fn requeue(
        self: &Arc<Self>,
        id: &str,
        expected: DownloadStatus,
        operation: &str,
    ) -> Result<()> {
        {
            let _guard = self.sched.lock().await;
            let session = self.store.get(id).await?;
            if session.status != expected {
                return Err(Error::invalid_transition(operation, session.status.as_str()));
            }
            let tail = self.queued_count().await as u32 + 1;
            self.store
                .update(id, |s| {
                    s.status = DownloadStatus::Queued;
                    s.queue_position = Some(tail);
                    s.error = None;
                })
                .await?;
        }

        info!(id, operation, "Download re-queued");
        self.emit(DownloadEvent::Queued {
            session_id: id.to_string(),
        });
        self.schedule().await;
        Ok(())
    }

    /// Move a queued download to the front of the queue.
    pub async fn move_to_front(self: &Arc<Self>, id: &str) -> Result<()> {
        self.reorder_queue(id, 1).await
    }

    /// Move a queued download to a 1-based position, clamped to the queue
    /// bounds. Positions renumber contiguously from 1.
    pub async fn reorder_queue(self: &Arc<Self>, id: &str, position: u32) -> Result<()> {
        let _guard = self.sched.lock().await;
        let session = self.store.get(id).await?;
        if session.status != DownloadStatus::Queued {
            return Err(Error::invalid_transition("reorder", session.status.as_str()));
        }

        let mut queued = self.queued_ids().await;
        queued.retain(|queued_id| queued_id != id);
        let slot = (position.max(1) as usize - 1).min(queued.len());
        queued.insert(slot, id.to_string());

        for (index, queued_id) in queued.iter().enumerate() {
            self.store
                .update(queued_id, |s| s.queue_position = Some(index as u32 + 1))
                .await?;
        }
        debug!(id, position, "Queue reordered");
        Ok(())
    }

    /// Remove a download from the list. Refused while the session is
    /// queued or actively downloading.
    pub async fn remove_download(self: &Arc<Self>, id: &str) -> Result<()> {
        let _guard = self.sched.lock().await;
        let session = self.store.get(id).await?;
        if !session.status.is_removable() {
            return Err(Error::invalid_transition("remove", session.status.as_str()));
        }
        self.store.remove(id).await?;
        info!(id, "Download removed");
        Ok(())
    }

    /// Apply (or clear) a per-file retention override.
    pub async fn set_retention(self: &Arc<Self>, id: &str, days: Option<u32>) -> Result<RetentionMeta> {
        let session = self.store.get(id).await?;
        let dir = self.store.session_dir(&session.id);
        let mut meta = retention::read_meta(&dir)
            .await
            .unwrap_or_else(|| RetentionMeta::new(&session.id, self.default_retention_days));
        meta.set_override(days, self.default_retention_days);
        retention::write_meta(&dir, &meta).await?;
        Ok(meta)
    }

    /// Snapshot of all sessions, newest first.
    pub async fn get_all_downloads(&self) -> Vec<DownloadSession> {
        let mut sessions = self.store.list().await;
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        sessions
    }

    /// Snapshot of one session.
    pub async fn get_progress(&self, id: &str) -> Result<DownloadSession> {
        self.store.get(id).await
    }

    pub async fn queue_info(&self) -> QueueInfo {
        let active = self.active.lock().len();
        let queued = self.queued_count().await;
        QueueInfo {
            active,
            queued,
            max_concurrent: self.max_concurrent.load(Ordering::SeqCst),
        }
    }

    /// Promote queued sessions while there is capacity, smallest queue
    /// position first. Runs after every state change and worker exit.
    pub async fn schedule(self: &Arc<Self>) {
        if self.shutdown_token.is_cancelled() {
            return;
        }
        let _guard = self.sched.lock().await;
        loop {
            let active_count = self.active.lock().len();
            let max = self.max_concurrent.load(Ordering::SeqCst);
            if active_count >= max {
                break;
            }

            let mut queued: Vec<DownloadSession> = self
                .store
                .list()
                .await
                .into_iter()
                .filter(|s| s.status == DownloadStatus::Queued)
                .collect();
            if queued.is_empty() {
                break;
            }
            queued.sort_by_key(|s| s.queue_position.unwrap_or(u32::MAX));
            let next_id = queued[0].id.clone();

            let promoted = self
                .store
                .update(&next_id, |s| {
                    s.status = DownloadStatus::Downloading;
                    s.queue_position = None;
                })
                .await;
            if let Err(e) = promoted {
                warn!(id = %next_id, error = %e, "Failed to promote queued download");
                break;
            }
            self.renumber_queued().await;
            self.spawn_worker(next_id);
        }
    }

    /// Cancel every worker and wait for them to exit.
    pub async fn shutdown(&self) {
        self.shutdown_token.cancel();
        let workers: Vec<ActiveWorker> = {
            let mut active = self.active.lock();
            active.drain().map(|(_, worker)| worker).collect()
        };
        for worker in workers {
            worker.token.cancel();
            let _ = worker.handle.await;
        }
        info!("Download manager stopped");
    }

    fn spawn_worker(self: &Arc<Self>, id: String) {
        let token = self.shutdown_token.child_token();
        let manager = self.clone();
        let worker_token = token.clone();
        let worker_id = id.clone();
        // The task waits for its registration so the active map never
        // misses a running worker.
        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let _ = ready_rx.await;
            manager.run_worker(worker_id, worker_token).await;
        });
        self.active
            .lock()
            .insert(id, ActiveWorker { token, handle });
        let _ = ready_tx.send(());
    }

    async fn run_worker(self: Arc<Self>, id: String, token: CancellationToken) {
        self.emit(DownloadEvent::Started {
            session_id: id.clone(),
        });

        let result = worker::run(&self, &id, &token).await;
        self.active.lock().remove(&id);

        match result {
            Ok(()) => {
                info!(id, "Download completed");
                self.emit(DownloadEvent::Completed { session_id: id.clone() });
            }
            Err(e) if worker::is_cancel(&e) => {
                // Pause or cancel already set the status; nothing to write.
                debug!(id, "Worker stopped cooperatively");
            }
            Err(e) => {
                let message = e.to_string();
                warn!(id, error = %message, "Download failed");
                // A concurrent cancel wins over the failure.
                let _ = self
                    .store
                    .update(&id, |s| {
                        if s.status == DownloadStatus::Downloading {
                            s.status = DownloadStatus::Failed;
                            s.error = Some(message.clone());
                        }
                    })
                    .await;
                self.emit(DownloadEvent::Failed {
                    session_id: id.clone(),
                    error: e.to_string(),
                });
            }
        }

        self.schedule().await;
    }

    async fn queued_count(&self) -> usize {
        self.store
            .list()
            .await
            .iter()
            .filter(|s| s.status == DownloadStatus::Queued)
            .count()
    }

    async fn queued_ids(&self) -> Vec<String> {
        let mut queued: Vec<DownloadSession> = self
            .store
            .list()
            .await
            .into_iter()
            .filter(|s| s.status == DownloadStatus::Queued)
            .collect();
        queued.sort_by_key(|s| s.queue_position.unwrap_or(u32::MAX));
        queued.into_iter().map(|s| s.id).collect()
    }

    /// Renumber queued sessions contiguously from 1, preserving order.
    async fn renumber_queued(&self) {
        for (index, id) in self.queued_ids().await.iter().enumerate() {
            let _ = self
                .store
                .update(id, |s| s.queue_position = Some(index as u32 + 1))
                .await;
        }
    }
}
