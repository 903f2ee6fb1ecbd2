//! Shared fixtures: a stub transcoding origin, a canned upstream media
//! server, and a pass-through remuxer so tests do not need ffmpeg.
#![allow(dead_code)]

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::extract::{Path as AxumPath, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use offcast::error::Result;
use offcast::manager::{DownloadManager, ManagerOptions};
use offcast::session::{DownloadSession, SessionStore};
use offcast::upstream::{MediaServer, ResolvedMedia, TranscodePreset};
use parking_lot::Mutex;
use saveio_engine::{DownloadError, EngineConfig, Remuxer};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

pub const SEGMENT_LEN: usize = 4096;

pub fn styp_segment(index: u32) -> Vec<u8> {
    let mut body = vec![0u8; SEGMENT_LEN];
    body[0..4].copy_from_slice(&(SEGMENT_LEN as u32).to_be_bytes());
    body[4..8].copy_from_slice(b"styp");
    body[8] = index as u8;
    body
}

pub fn init_segment() -> Vec<u8> {
    let mut body = vec![0u8; SEGMENT_LEN];
    body[0..4].copy_from_slice(&(SEGMENT_LEN as u32).to_be_bytes());
    body[4..8].copy_from_slice(b"ftyp");
    body
}

/// Request counter keyed by path.
#[derive(Default)]
pub struct HitCounter(Mutex<HashMap<String, u32>>);

impl HitCounter {
    pub fn bump(&self, key: &str) -> u32 {
        let mut map = self.0.lock();
        let count = map.entry(key.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn get(&self, key: &str) -> u32 {
        self.0.lock().get(key).copied().unwrap_or(0)
    }
}

/// Segment indexes the origin refuses to serve until released.
#[derive(Default)]
pub struct Gate(Mutex<HashSet<u32>>);

impl Gate {
    pub fn block(&self, index: u32) {
        self.0.lock().insert(index);
    }

    pub fn release(&self, index: u32) {
        self.0.lock().remove(&index);
    }

    pub fn release_all(&self) {
        self.0.lock().clear();
    }

    fn is_blocked(&self, index: u32) -> bool {
        self.0.lock().contains(&index)
    }
}

#[derive(Clone)]
pub struct StubOrigin {
    pub segment_count: u32,
    pub with_init: bool,
    pub hits: Arc<HitCounter>,
    pub gate: Arc<Gate>,
}

impl StubOrigin {
    pub fn new(segment_count: u32, with_init: bool) -> Self {
        Self {
            segment_count,
            with_init,
            hits: Arc::default(),
            gate: Arc::default(),
        }
    }

    /// Start serving on an ephemeral port; returns the master playlist URL.
    pub async fn start(&self) -> String {
        let app = Router::new()
            .route("/videos/master.m3u8", get(serve_master))
            .route("/videos/main.m3u8", get(serve_media))
            .route("/videos/{name}", get(serve_segment))
            .with_state(self.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/videos/master.m3u8")
    }
}

async fn serve_master(State(_origin): State<StubOrigin>) -> Response {
    playlist("#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=2000000\nmain.m3u8\n")
}

async fn serve_media(State(origin): State<StubOrigin>) -> Response {
    let mut body = String::from("#EXTM3U\n#EXT-X-VERSION:7\n#EXT-X-TARGETDURATION:6\n");
    if origin.with_init {
        body.push_str("#EXT-X-MAP:URI=\"init.mp4\"\n");
    }
    for index in 0..origin.segment_count {
        body.push_str(&format!("#EXTINF:6.0,\n{index}.mp4\n"));
    }
    body.push_str("#EXT-X-ENDLIST\n");
    playlist(&body)
}

fn playlist(body: &str) -> Response {
    (
        [(header::CONTENT_TYPE, "application/vnd.apple.mpegurl")],
        body.to_string(),
    )
        .into_response()
}

async fn serve_segment(State(origin): State<StubOrigin>, AxumPath(name): AxumPath<String>) -> Response {
    origin.hits.bump(&name);

    if name == "init.mp4" {
        return media(init_segment());
    }
    let Some(index) = name.strip_suffix(".mp4").and_then(|s| s.parse::<u32>().ok()) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    // A blocked segment stalls like a transcoder that has not produced it
    // yet; released segments come back immediately.
    let waited = Instant::now();
    while origin.gate.is_blocked(index) {
        if waited.elapsed() > Duration::from_secs(30) {
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    media(styp_segment(index))
}

fn media(body: Vec<u8>) -> Response {
    ([(header::CONTENT_TYPE, "video/mp4")], Body::from(body)).into_response()
}

/// Upstream media server answering every item with one canned source
/// pointing at the stub origin.
pub struct StubMediaServer {
    pub hls_url: String,
    pub duration_seconds: f64,
}

#[async_trait]
impl MediaServer for StubMediaServer {
    async fn resolve_item(
        &self,
        item_id: &str,
        media_source_id: Option<&str>,
        _preset: TranscodePreset,
        _audio_stream_index: Option<u32>,
    ) -> Result<ResolvedMedia> {
        Ok(ResolvedMedia {
            title: format!("Title {item_id}"),
            media_source_id: media_source_id.unwrap_or("source-1").to_string(),
            duration_seconds: self.duration_seconds,
            hls_url: self.hls_url.clone(),
        })
    }
}

/// Remuxer that copies the concat file instead of invoking ffmpeg.
pub struct PassthroughRemuxer;

#[async_trait]
impl Remuxer for PassthroughRemuxer {
    async fn remux(
        &self,
        input: &Path,
        output: &Path,
        token: &CancellationToken,
    ) -> std::result::Result<(), DownloadError> {
        if token.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }
        tokio::fs::copy(input, output).await?;
        Ok(())
    }
}

/// Engine configuration with test-friendly retry delays.
pub fn fast_engine_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.fetcher.retry_delay_step = Duration::from_millis(5);
    config.fetcher.max_retry_delay = Duration::from_millis(20);
    config
}

/// A manager wired to the stub origin with a pass-through remuxer.
pub async fn build_manager(
    root: &Path,
    master_url: &str,
    max_concurrent: usize,
) -> Arc<DownloadManager> {
    let store = Arc::new(SessionStore::load(root).await.unwrap());
    DownloadManager::new(
        store,
        Arc::new(StubMediaServer {
            hls_url: master_url.to_string(),
            duration_seconds: 30.0,
        }),
        Arc::new(PassthroughRemuxer),
        ManagerOptions {
            max_concurrent_downloads: max_concurrent,
            default_retention_days: None,
            engine: fast_engine_config(),
        },
    )
}

/// Poll a session until the predicate holds or the timeout elapses.
pub async fn wait_until<F>(
    manager: &Arc<DownloadManager>,
    id: &str,
    timeout: Duration,
    predicate: F,
) -> DownloadSession
where
    F: Fn(&DownloadSession) -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        let session = manager
            .get_progress(id)
            .await
            .expect("session disappeared while waiting");
        if predicate(&session) {
            return session;
        }
        if Instant::now() > deadline {
            panic!(
                "timed out waiting for session {id}: status={} completed={}/{}",
                session.status, session.completed_segments, session.total_segments
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
