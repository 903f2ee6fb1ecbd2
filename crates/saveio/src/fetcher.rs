// Segment fetcher: raw download of individual media segments with retry
// logic and body validation.
//
// The transcoding origin produces segments just-in-time and will happily
// answer a segment request with a 404, an empty body, or a JSON error while
// the encoder catches up. All of those are retried inside the budget; only
// an expired upstream session (401) or local I/O failure is fatal here.

use crate::config::EngineConfig;
use crate::error::{DownloadError, is_retryable_reqwest_error};
use crate::retry::{RetryAction, RetryPolicy, retry_with_backoff};
use bytes::Bytes;
use reqwest::Client;
use reqwest::header::CONTENT_TYPE;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use url::Url;

pub struct SegmentFetcher {
    client: Client,
    config: Arc<EngineConfig>,
    token: CancellationToken,
}

impl SegmentFetcher {
    pub fn new(client: Client, config: Arc<EngineConfig>, token: CancellationToken) -> Self {
        Self {
            client,
            config,
            token,
        }
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.config.fetcher.max_attempts,
            delay_step: self.config.fetcher.retry_delay_step,
            max_delay: self.config.fetcher.max_retry_delay,
        }
    }

    /// Download one segment and write it to `out_path` atomically
    /// (temp file + rename). Returns the number of bytes written.
    pub async fn fetch_to_file(&self, url: &Url, out_path: &Path) -> Result<u64, DownloadError> {
        let policy = self.retry_policy();
        let bytes = retry_with_backoff(&policy, &self.token, |attempt| async move {
            trace!(url = %url, attempt, "Fetching segment");
            self.fetch_once(url).await
        })
        .await?;

        let len = bytes.len() as u64;
        write_atomic(out_path, &bytes).await?;
        debug!(url = %url, bytes = len, path = %out_path.display(), "Segment written");
        Ok(len)
    }

    /// One fetch attempt: request, status classification, body validation.
    async fn fetch_once(&self, url: &Url) -> RetryAction<Bytes> {
        let response = tokio::select! {
            _ = self.token.cancelled() => {
                return RetryAction::Fail(DownloadError::Cancelled);
            }
            response = self
                .client
                .get(url.clone())
                .timeout(self.config.fetcher.segment_timeout)
                .send() => response,
        };

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                return if is_retryable_reqwest_error(&e) {
                    RetryAction::Retry(DownloadError::from(e))
                } else {
                    RetryAction::Fail(DownloadError::from(e))
                };
            }
        };

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return RetryAction::Fail(DownloadError::AuthExpired {
                url: url.to_string(),
            });
        }
        if !status.is_success() {
            return RetryAction::Retry(DownloadError::http_status(status, url.as_str(), "segment"));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);

        let bytes = tokio::select! {
            _ = self.token.cancelled() => {
                return RetryAction::Fail(DownloadError::Cancelled);
            }
            bytes = response.bytes() => bytes,
        };
        let bytes = match bytes {
            Ok(bytes) => bytes,
            Err(e) => return RetryAction::Retry(DownloadError::from(e)),
        };

        match validate_segment_body(&bytes, content_type.as_deref(), self.config.fetcher.min_segment_bytes)
        {
            Ok(()) => RetryAction::Success(bytes),
            Err(err) => RetryAction::Retry(err),
        }
    }
}

/// Validate that a response body is a plausible fMP4 segment.
///
/// Every rejection here is retryable: short, JSON, and non-box bodies all
/// mean the origin has not finished producing the segment.
pub fn validate_segment_body(
    body: &[u8],
    content_type: Option<&str>,
    min_bytes: usize,
) -> Result<(), DownloadError> {
    if body.len() < min_bytes {
        return Err(DownloadError::not_ready(format!(
            "segment body is {} bytes, expected at least {min_bytes}",
            body.len()
        )));
    }

    if let Some(ct) = content_type
        && (ct.contains("json") || ct.starts_with("text/"))
    {
        return Err(DownloadError::not_ready(upstream_error_message(body)));
    }

    if !fmp4::is_segment(body) {
        if looks_like_json(body) {
            return Err(DownloadError::not_ready(upstream_error_message(body)));
        }
        let observed = fmp4::leading_fourcc(body)
            .map(fmp4::fourcc_display)
            .unwrap_or_else(|| "<none>".to_string());
        return Err(DownloadError::SegmentFetch {
            reason: format!("body is not an fMP4 segment (leading box `{observed}`)"),
            retryable: true,
        });
    }

    Ok(())
}

fn looks_like_json(body: &[u8]) -> bool {
    matches!(
        body.iter().find(|b| !b.is_ascii_whitespace()),
        Some(b'{') | Some(b'[')
    )
}

/// Pull a human-readable message out of an upstream JSON error body.
fn upstream_error_message(body: &[u8]) -> String {
    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) {
        for key in ["message", "error"] {
            if let Some(message) = value.get(key).and_then(|v| v.as_str()) {
                return format!("upstream error: {message}");
            }
        }
    }
    "upstream returned a non-media body".to_string()
}

/// Write `bytes` to `path` via a sibling temp file and rename, so a crash
/// never leaves a truncated segment that a resume would trust.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), DownloadError> {
    let tmp = path.with_extension("mp4.tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
