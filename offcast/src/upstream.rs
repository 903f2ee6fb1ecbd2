//! Upstream media-server client.
//!
//! The downloader consumes a fully built HLS master URL; this module is the
//! seam that produces one. The production implementation speaks the
//! Jellyfin-compatible REST surface: item lookup for the title and runtime,
//! then a `master.m3u8` URL with the preset's transcode parameters and the
//! API key baked in.

use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::Deserialize;
use url::Url;

/// A named bundle of transcode parameters baked into the HLS URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscodePreset {
    /// 1080p cap, 8 Mbps video.
    P1080,
    /// 720p cap, 4 Mbps video.
    P720,
    /// 480p cap, 2 Mbps video.
    P480,
}

impl TranscodePreset {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "1080p" => Some(Self::P1080),
            "720p" => Some(Self::P720),
            "480p" => Some(Self::P480),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::P1080 => "1080p",
            Self::P720 => "720p",
            Self::P480 => "480p",
        }
    }

    pub fn max_width(&self) -> u32 {
        match self {
            Self::P1080 => 1920,
            Self::P720 => 1280,
            Self::P480 => 854,
        }
    }

    pub fn video_bitrate(&self) -> u64 {
        match self {
            Self::P1080 => 8_000_000,
            Self::P720 => 4_000_000,
            Self::P480 => 2_000_000,
        }
    }

    pub fn audio_bitrate(&self) -> u64 {
        192_000
    }

    /// Rough final file size for a given runtime, used only for the
    /// response estimate shown before any segment exists.
    pub fn estimated_size_bytes(&self, duration_seconds: f64) -> u64 {
        let bits_per_second = (self.video_bitrate() + self.audio_bitrate()) as f64;
        (duration_seconds * bits_per_second / 8.0) as u64
    }
}

impl std::fmt::Display for TranscodePreset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the downloader needs to know about one item before it can queue it.
#[derive(Debug, Clone)]
pub struct ResolvedMedia {
    pub title: String,
    pub media_source_id: String,
    pub duration_seconds: f64,
    pub hls_url: String,
}

/// The upstream media server, as far as the downloader is concerned.
#[async_trait]
pub trait MediaServer: Send + Sync {
    async fn resolve_item(
        &self,
        item_id: &str,
        media_source_id: Option<&str>,
        preset: TranscodePreset,
        audio_stream_index: Option<u32>,
    ) -> Result<ResolvedMedia>;
}

/// Item payload subset returned by the upstream `/Items/{id}` endpoint.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct UpstreamItem {
    name: Option<String>,
    run_time_ticks: Option<u64>,
    #[serde(default)]
    media_sources: Vec<UpstreamMediaSource>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct UpstreamMediaSource {
    id: String,
    run_time_ticks: Option<u64>,
}

/// Upstream runtimes are expressed in 100 ns ticks.
const TICKS_PER_SECOND: f64 = 10_000_000.0;

pub struct HttpMediaServer {
    base_url: Url,
    api_key: String,
    client: reqwest::Client,
}

impl HttpMediaServer {
    pub fn new(base_url: &str, api_key: impl Into<String>, client: reqwest::Client) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| Error::config(format!("invalid upstream URL `{base_url}`: {e}")))?;
        Ok(Self {
            base_url,
            api_key: api_key.into(),
            client,
        })
    }

    fn item_url(&self, item_id: &str) -> Result<Url> {
        let mut url = self
            .base_url
            .join(&format!("Items/{item_id}"))
            .map_err(|e| Error::Upstream(format!("cannot build item URL: {e}")))?;
        url.query_pairs_mut().append_pair("api_key", &self.api_key);
        Ok(url)
    }

    fn hls_url(
        &self,
        item_id: &str,
        media_source_id: &str,
        preset: TranscodePreset,
        audio_stream_index: Option<u32>,
    ) -> Result<String> {
        let mut url = self
            .base_url
            .join(&format!("Videos/{item_id}/master.m3u8"))
            .map_err(|e| Error::Upstream(format!("cannot build HLS URL: {e}")))?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("MediaSourceId", media_source_id)
                .append_pair("VideoCodec", "h264")
                .append_pair("AudioCodec", "aac")
                .append_pair("MaxWidth", &preset.max_width().to_string())
                .append_pair("VideoBitrate", &preset.video_bitrate().to_string())
                .append_pair("AudioBitrate", &preset.audio_bitrate().to_string())
                .append_pair("SegmentContainer", "mp4")
                .append_pair("api_key", &self.api_key);
            if let Some(index) = audio_stream_index {
                query.append_pair("AudioStreamIndex", &index.to_string());
            }
        }
        Ok(url.into())
    }
}

#[async_trait]
impl MediaServer for HttpMediaServer {
    async fn resolve_item(
        &self,
        item_id: &str,
        media_source_id: Option<&str>,
        preset: TranscodePreset,
        audio_stream_index: Option<u32>,
    ) -> Result<ResolvedMedia> {
        let url = self.item_url(item_id)?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::Upstream(format!("item lookup failed: {e}")))?;

        match response.status() {
            status if status.is_success() => {}
            reqwest::StatusCode::UNAUTHORIZED => {
                return Err(Error::UpstreamAuth("item lookup returned 401".into()));
            }
            reqwest::StatusCode::NOT_FOUND => {
                return Err(Error::not_found("Item", item_id));
            }
            status => {
                return Err(Error::Upstream(format!("item lookup returned {status}")));
            }
        }

        let item: UpstreamItem = response
            .json()
            .await
            .map_err(|e| Error::Upstream(format!("cannot decode item payload: {e}")))?;

        let source = match media_source_id {
            Some(wanted) => item
                .media_sources
                .iter()
                .find(|s| s.id == wanted)
                .ok_or_else(|| {
                    Error::validation(format!("item {item_id} has no media source {wanted}"))
                })?,
            None => item.media_sources.first().ok_or_else(|| {
                Error::Upstream(format!("item {item_id} has no media sources"))
            })?,
        };

        let ticks = source.run_time_ticks.or(item.run_time_ticks).unwrap_or(0);
        let hls_url = self.hls_url(item_id, &source.id, preset, audio_stream_index)?;

        Ok(ResolvedMedia {
            title: item.name.unwrap_or_else(|| item_id.to_string()),
            media_source_id: source.id.clone(),
            duration_seconds: ticks as f64 / TICKS_PER_SECOND,
            hls_url,
        })
    }
}
