//! Time-based retention for completed downloads.
//!
//! Each download carries a `retention.json` next to its session record. The
//! effective retention is the per-file override when set, else the global
//! default; `expiresAt` is always derived from `downloadedAt`, never from
//! the time of the edit. The sweeper deletes expired completed downloads on
//! an interval and once at boot.

use crate::error::Result;
use crate::session::{DownloadStatus, SessionStore};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const RETENTION_FILE: &str = "retention.json";

/// How recently a stream request must have touched a session for the
/// sweeper to consider it "currently being served".
const STREAM_LEASE_TTL: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionMeta {
    pub session_id: String,
    pub downloaded_at: DateTime<Utc>,
    /// Per-file override; `None` inherits the global default.
    pub retention_days: Option<u32>,
    /// Derived from `downloaded_at` + the effective days at write time;
    /// `None` means keep forever.
    pub expires_at: Option<DateTime<Utc>>,
}

impl RetentionMeta {
    pub fn new(session_id: impl Into<String>, global_days: Option<u32>) -> Self {
        let downloaded_at = Utc::now();
        let mut meta = Self {
            session_id: session_id.into(),
            downloaded_at,
            retention_days: None,
            expires_at: None,
        };
        meta.recompute(global_days);
        meta
    }

    /// The days that actually apply, given the global default.
    pub fn effective_days(&self, global_days: Option<u32>) -> Option<u32> {
        self.retention_days.or(global_days)
    }

    /// Recompute `expires_at` from `downloaded_at`, not from now.
    pub fn recompute(&mut self, global_days: Option<u32>) {
        self.expires_at = self
            .effective_days(global_days)
            .map(|days| self.downloaded_at + ChronoDuration::days(days as i64));
    }

    /// Apply a per-file override (or clear it with `None`) and rederive the
    /// expiry.
    pub fn set_override(&mut self, days: Option<u32>, global_days: Option<u32>) {
        self.retention_days = days;
        self.recompute(global_days);
    }

    pub fn is_expired(&self, now: DateTime<Utc>, global_days: Option<u32>) -> bool {
        match self.effective_days(global_days) {
            Some(days) => now > self.downloaded_at + ChronoDuration::days(days as i64),
            None => false,
        }
    }
}

fn meta_path(session_dir: &Path) -> PathBuf {
    session_dir.join(RETENTION_FILE)
}

pub async fn read_meta(session_dir: &Path) -> Option<RetentionMeta> {
    let bytes = tokio::fs::read(meta_path(session_dir)).await.ok()?;
    serde_json::from_slice(&bytes).ok()
}

pub async fn write_meta(session_dir: &Path, meta: &RetentionMeta) -> Result<()> {
    let path = meta_path(session_dir);
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, serde_json::to_vec_pretty(meta)?).await?;
    tokio::fs::rename(&tmp, &path).await?;
    Ok(())
}

/// Tracks which sessions have been streamed recently so the sweeper does
/// not delete a file out from under an active client.
#[derive(Default)]
pub struct StreamLeases {
    last_served: DashMap<String, Instant>,
}

impl StreamLeases {
    pub fn touch(&self, id: &str) {
        self.last_served.insert(id.to_string(), Instant::now());
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.last_served
            .get(id)
            .map(|at| at.elapsed() < STREAM_LEASE_TTL)
            .unwrap_or(false)
    }

    pub fn forget(&self, id: &str) {
        self.last_served.remove(id);
    }
}

/// One sweep over every session: delete expired completed downloads.
pub async fn sweep(
    store: &SessionStore,
    leases: &StreamLeases,
    global_days: Option<u32>,
) -> Vec<String> {
    let now = Utc::now();
    let mut removed = Vec::new();

    for session in store.list().await {
        if session.status != DownloadStatus::Completed {
            continue;
        }
        let dir = store.session_dir(&session.id);
        let Some(meta) = read_meta(&dir).await else {
            continue;
        };
        if !meta.is_expired(now, global_days) {
            continue;
        }
        if leases.is_active(&session.id) {
            info!(id = %session.id, "Retention expired but session is being streamed, skipping");
            continue;
        }

        match store.remove(&session.id).await {
            Ok(()) => {
                info!(id = %session.id, title = %session.title, "Removed expired download");
                leases.forget(&session.id);
                removed.push(session.id);
            }
            Err(e) => warn!(id = %session.id, error = %e, "Failed to remove expired download"),
        }
    }

    removed
}

/// Spawn the periodic sweeper. Runs once immediately, then on the interval,
/// until the token fires.
pub fn spawn_sweeper(
    store: Arc<SessionStore>,
    leases: Arc<StreamLeases>,
    global_days: Option<u32>,
    interval: Duration,
    token: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    sweep(&store, &leases, global_days).await;
                }
            }
        }
    })
}
