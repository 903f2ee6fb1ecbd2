//! File-backed session store.
//!
//! One directory per download under the downloads root, each holding a
//! `session.json`. Writes are atomic (temp file + rename) and serialized
//! by a per-session mutex; the scheduler and the worker owning a session
//! both mutate it only through [`SessionStore::update`].

use crate::error::{Error, Result};
use crate::session::model::{DownloadSession, DownloadStatus};
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

const SESSION_FILE: &str = "session.json";

pub struct SessionStore {
    root: PathBuf,
    sessions: DashMap<String, Arc<Mutex<DownloadSession>>>,
}

impl SessionStore {
    /// Scan the downloads root, load every persisted session, and reconcile
    /// records orphaned by a crash: a session that claims to be downloading
    /// has no worker anymore and becomes Failed so the client can resume it.
    pub async fn load(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;

        let store = Self {
            root,
            sessions: DashMap::new(),
        };

        let mut entries = tokio::fs::read_dir(&store.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let session_path = entry.path().join(SESSION_FILE);
            let mut session = match read_session(&session_path).await {
                Some(session) => session,
                // Partial or missing files mean the session does not exist.
                None => continue,
            };

            if session.status == DownloadStatus::Downloading {
                warn!(id = %session.id, "Download interrupted by restart, marking failed");
                session.status = DownloadStatus::Failed;
                session.error = Some("download interrupted by restart".to_string());
                session.queue_position = None;
                write_session(&session_path, &session).await?;
            }

            store
                .sessions
                .insert(session.id.clone(), Arc::new(Mutex::new(session)));
        }

        info!(count = store.sessions.len(), root = %store.root.display(), "Session store loaded");
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    fn session_path(&self, id: &str) -> PathBuf {
        self.session_dir(id).join(SESSION_FILE)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    /// Create the session directory and persist a new record.
    pub async fn create(&self, session: DownloadSession) -> Result<()> {
        let id = session.id.clone();
        if self.sessions.contains_key(&id) {
            return Err(Error::validation(format!("session {id} already exists")));
        }
        tokio::fs::create_dir_all(self.session_dir(&id)).await?;
        write_session(&self.session_path(&id), &session).await?;
        self.sessions.insert(id, Arc::new(Mutex::new(session)));
        Ok(())
    }

    fn entry(&self, id: &str) -> Result<Arc<Mutex<DownloadSession>>> {
        self.sessions
            .get(id)
            .map(|e| e.value().clone())
            .ok_or_else(|| Error::not_found("DownloadSession", id))
    }

    /// Snapshot of one session.
    pub async fn get(&self, id: &str) -> Result<DownloadSession> {
        let entry = self.entry(id)?;
        let session = entry.lock().await;
        Ok(session.clone())
    }

    /// Mutate a session under its mutex and persist the result atomically.
    /// Returns a snapshot of the updated record.
    pub async fn update<F>(&self, id: &str, mutate: F) -> Result<DownloadSession>
    where
        F: FnOnce(&mut DownloadSession),
    {
        let entry = self.entry(id)?;
        let mut session = entry.lock().await;
        mutate(&mut session);
        write_session(&self.session_path(id), &session).await?;
        Ok(session.clone())
    }

    /// Delete the session directory but keep the in-memory record.
    /// Used by cancel, which removes files while the entry stays listed.
    pub async fn delete_dir(&self, id: &str) -> Result<()> {
        let dir = self.session_dir(id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a session entirely: directory and record.
    pub async fn remove(&self, id: &str) -> Result<()> {
        if !self.sessions.contains_key(id) {
            return Err(Error::not_found("DownloadSession", id));
        }
        self.delete_dir(id).await?;
        self.sessions.remove(id);
        Ok(())
    }

    /// Snapshot of every session.
    pub async fn list(&self) -> Vec<DownloadSession> {
        let entries: Vec<Arc<Mutex<DownloadSession>>> = self
            .sessions
            .iter()
            .map(|e| e.value().clone())
            .collect();
        let mut sessions = Vec::with_capacity(entries.len());
        for entry in entries {
            sessions.push(entry.lock().await.clone());
        }
        sessions
    }
}

async fn read_session(path: &Path) -> Option<DownloadSession> {
    let bytes = tokio::fs::read(path).await.ok()?;
    match serde_json::from_slice(&bytes) {
        Ok(session) => Some(session),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Ignoring unreadable session record");
            None
        }
    }
}

/// Atomic write: a torn write leaves either the previous file or the new
/// one, never a corrupt record.
async fn write_session(path: &Path, session: &DownloadSession) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    let bytes = serde_json::to_vec_pretty(session)?;
    tokio::fs::write(&tmp, &bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeSet;

    fn session(id: &str, status: DownloadStatus) -> DownloadSession {
        DownloadSession {
            id: id.into(),
            item_id: "item".into(),
            media_source_id: "ms".into(),
            title: "Title".into(),
            filename: "Title.mp4".into(),
            hls_url: "http://upstream/master.m3u8".into(),
            duration_seconds: 60.0,
            status,
            total_segments: 5,
            completed_segments: 0,
            completed_indexes: BTreeSet::new(),
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            queue_position: None,
        }
    }

    #[tokio::test]
    async fn create_get_update_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::load(dir.path()).await.unwrap();

        store
            .create(session("a", DownloadStatus::Queued))
            .await
            .unwrap();
        let updated = store
            .update("a", |s| s.record_segment(2))
            .await
            .unwrap();
        assert_eq!(updated.completed_segments, 1);

        // A fresh store sees the persisted state.
        let store2 = SessionStore::load(dir.path()).await.unwrap();
        let loaded = store2.get("a").await.unwrap();
        assert!(loaded.completed_indexes.contains(&2));
    }

    #[tokio::test]
    async fn update_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::load(dir.path()).await.unwrap();
        store
            .create(session("a", DownloadStatus::Queued))
            .await
            .unwrap();
        store.update("a", |s| s.record_segment(0)).await.unwrap();

        let names: Vec<String> = std::fs::read_dir(store.session_dir("a"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["session.json".to_string()]);
    }

    #[tokio::test]
    async fn reconciles_interrupted_downloads_on_load() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = SessionStore::load(dir.path()).await.unwrap();
            store
                .create(session("a", DownloadStatus::Downloading))
                .await
                .unwrap();
            store
                .create(session("b", DownloadStatus::Completed))
                .await
                .unwrap();
        }

        let store = SessionStore::load(dir.path()).await.unwrap();
        let a = store.get("a").await.unwrap();
        assert_eq!(a.status, DownloadStatus::Failed);
        assert_eq!(a.error.as_deref(), Some("download interrupted by restart"));
        let b = store.get("b").await.unwrap();
        assert_eq!(b.status, DownloadStatus::Completed);
    }

    #[tokio::test]
    async fn corrupt_records_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("broken")).unwrap();
        std::fs::write(dir.path().join("broken/session.json"), b"{ not json").unwrap();

        let store = SessionStore::load(dir.path()).await.unwrap();
        assert!(store.list().await.is_empty());
    }

    #[tokio::test]
    async fn remove_deletes_directory_and_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::load(dir.path()).await.unwrap();
        store
            .create(session("a", DownloadStatus::Completed))
            .await
            .unwrap();
        let session_dir = store.session_dir("a");
        assert!(session_dir.exists());

        store.remove("a").await.unwrap();
        assert!(!session_dir.exists());
        assert!(store.get("a").await.is_err());
    }

    #[tokio::test]
    async fn delete_dir_keeps_the_record_listed() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::load(dir.path()).await.unwrap();
        store
            .create(session("a", DownloadStatus::Cancelled))
            .await
            .unwrap();
        store.delete_dir("a").await.unwrap();
        assert!(!store.session_dir("a").exists());
        assert_eq!(store.list().await.len(), 1);
    }
}
