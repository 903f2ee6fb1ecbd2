//! The persisted per-download record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Lifecycle state of a download session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownloadStatus {
    Queued,
    Downloading,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl DownloadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "Queued",
            Self::Downloading => "Downloading",
            Self::Paused => "Paused",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Cancelled => "Cancelled",
        }
    }

    /// Whether a worker may currently own this session.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Downloading)
    }

    /// Whether the session may be removed from the list.
    pub fn is_removable(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Paused
        )
    }
}

impl std::fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One download, persisted as JSON at `<downloadsDir>/<id>/session.json`.
///
/// `completed_indexes` is the source of truth for resume;
/// `completed_segments` is always derived from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadSession {
    pub id: String,
    pub item_id: String,
    pub media_source_id: String,
    pub title: String,
    pub filename: String,
    pub hls_url: String,
    pub duration_seconds: f64,
    pub status: DownloadStatus,
    pub total_segments: u32,
    pub completed_segments: u32,
    pub completed_indexes: BTreeSet<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// 1-based rank among queued sessions; only meaningful while Queued.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<u32>,
}

impl DownloadSession {
    /// Record a completed segment and rederive the counter.
    pub fn record_segment(&mut self, index: u32) {
        self.completed_indexes.insert(index);
        self.completed_segments = self.completed_indexes.len() as u32;
    }
}
