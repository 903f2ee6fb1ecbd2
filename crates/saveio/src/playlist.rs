// HLS playlist handling: fetch master + variant playlists and flatten them
// into the ordered segment list a download is driven from.

use crate::config::PlaylistConfig;
use crate::error::DownloadError;
use m3u8_rs::{MediaPlaylist, Playlist, parse_playlist_res};
use reqwest::Client;
use tracing::debug;
use url::Url;

/// One media segment, numbered in playlist order. The index defines
/// concatenation order regardless of fetch completion order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HlsSegment {
    pub index: u32,
    pub url: Url,
}

/// The flattened result of resolving a master playlist URL.
#[derive(Debug, Clone)]
pub struct SegmentList {
    /// `EXT-X-MAP` init segment, when the stream carries one.
    pub init_url: Option<Url>,
    pub segments: Vec<HlsSegment>,
}

impl SegmentList {
    pub fn total_segments(&self) -> u32 {
        self.segments.len() as u32
    }
}

/// Resolve a possibly-relative playlist URI against the playlist it came from.
fn resolve(base: &Url, uri: &str) -> Result<Url, DownloadError> {
    if let Ok(absolute) = Url::parse(uri) {
        return Ok(absolute);
    }
    base.join(uri)
        .map_err(|e| DownloadError::playlist(format!("cannot resolve URI `{uri}`: {e}")))
}

/// Extract the variant URI from a master playlist.
///
/// The upstream transcoder emits exactly one variant configured to the
/// requested preset; if several are present the first is used.
pub fn select_variant(master: &m3u8_rs::MasterPlaylist) -> Result<&str, DownloadError> {
    let variant = master
        .variants
        .first()
        .ok_or_else(|| DownloadError::playlist("master playlist has no variants"))?;
    Ok(&variant.uri)
}

/// Flatten a media playlist into the init URL and ordered segment URLs.
pub fn flatten_media_playlist(
    media: &MediaPlaylist,
    playlist_url: &Url,
) -> Result<SegmentList, DownloadError> {
    if media.segments.is_empty() {
        return Err(DownloadError::playlist("media playlist has no segments"));
    }

    let init_url = media
        .segments
        .iter()
        .find_map(|s| s.map.as_ref())
        .map(|map| resolve(playlist_url, &map.uri))
        .transpose()?;

    let segments = media
        .segments
        .iter()
        .enumerate()
        .map(|(index, segment)| {
            Ok(HlsSegment {
                index: index as u32,
                url: resolve(playlist_url, &segment.uri)?,
            })
        })
        .collect::<Result<Vec<_>, DownloadError>>()?;

    Ok(SegmentList { init_url, segments })
}

async fn fetch_playlist_bytes(
    client: &Client,
    url: &Url,
    config: &PlaylistConfig,
) -> Result<Vec<u8>, DownloadError> {
    let response = client
        .get(url.clone())
        .timeout(config.fetch_timeout)
        .send()
        .await?;

    let status = response.status();
    if status == reqwest::StatusCode::UNAUTHORIZED {
        return Err(DownloadError::AuthExpired {
            url: url.to_string(),
        });
    }
    if !status.is_success() {
        return Err(DownloadError::http_status(status, url.as_str(), "playlist"));
    }

    Ok(response.bytes().await?.to_vec())
}

/// Fetch the master playlist, select its variant, fetch the media playlist,
/// and flatten it into a [`SegmentList`].
pub async fn load_segment_list(
    client: &Client,
    master_url: &Url,
    config: &PlaylistConfig,
) -> Result<SegmentList, DownloadError> {
    let master_bytes = fetch_playlist_bytes(client, master_url, config).await?;
    match parse_playlist_res(&master_bytes) {
        Ok(Playlist::MasterPlaylist(master)) => {
            let variant_uri = select_variant(&master)?;
            let variant_url = resolve(master_url, variant_uri)?;
            debug!(variant = %variant_url, "Selected variant playlist");

            let media_bytes = fetch_playlist_bytes(client, &variant_url, config).await?;
            match parse_playlist_res(&media_bytes) {
                Ok(Playlist::MediaPlaylist(media)) => flatten_media_playlist(&media, &variant_url),
                Ok(Playlist::MasterPlaylist(_)) => Err(DownloadError::playlist(
                    "variant URL resolved to another master playlist",
                )),
                Err(e) => Err(DownloadError::playlist(format!(
                    "cannot parse media playlist: {e}"
                ))),
            }
        }
        // Some origins answer the master URL with the media playlist directly.
        Ok(Playlist::MediaPlaylist(media)) => flatten_media_playlist(&media, master_url),
        Err(e) => Err(DownloadError::playlist(format!(
            "cannot parse master playlist: {e}"
        ))),
    }
}
