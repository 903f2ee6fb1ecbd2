use reqwest::StatusCode;

/// Errors produced by the download engine.
///
/// Transient kinds are absorbed by the fetcher's retry envelope; only fatal
/// kinds escape to the caller driving a download.
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("download cancelled")]
    Cancelled,

    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("request failed with HTTP {status} during {operation} for {url}")]
    HttpStatus {
        status: StatusCode,
        url: String,
        operation: &'static str,
    },

    #[error("upstream session expired (HTTP 401) for {url}")]
    AuthExpired { url: String },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("playlist error: {reason}")]
    Playlist { reason: String },

    #[error("segment fetch error: {reason}")]
    SegmentFetch { reason: String, retryable: bool },

    #[error("upstream transcoder not ready: {reason}")]
    UpstreamNotReady { reason: String },

    #[error("remux failed with {exit}: {stderr_tail}")]
    RemuxFailed { exit: String, stderr_tail: String },

    #[error("ffmpeg binary not found on PATH")]
    FfmpegMissing,

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl DownloadError {
    pub fn playlist(reason: impl Into<String>) -> Self {
        Self::Playlist {
            reason: reason.into(),
        }
    }

    pub fn not_ready(reason: impl Into<String>) -> Self {
        Self::UpstreamNotReady {
            reason: reason.into(),
        }
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }

    pub fn http_status(
        status: StatusCode,
        url: impl Into<String>,
        operation: &'static str,
    ) -> Self {
        Self::HttpStatus {
            status,
            url: url.into(),
            operation,
        }
    }

    /// Whether the fetcher may retry after this error.
    ///
    /// 401 means the upstream session is gone and no amount of waiting will
    /// bring it back; everything else the transcoding origin serves mid-run
    /// (404, 5xx, short or JSON bodies) usually means "not produced yet".
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Cancelled
            | Self::AuthExpired { .. }
            | Self::Playlist { .. }
            | Self::RemuxFailed { .. }
            | Self::FfmpegMissing
            | Self::Io { .. }
            | Self::Internal { .. } => false,
            Self::HttpStatus { status, .. } => *status != StatusCode::UNAUTHORIZED,
            Self::SegmentFetch { retryable, .. } => *retryable,
            Self::Network { .. } | Self::UpstreamNotReady { .. } => true,
        }
    }
}

/// Classify a reqwest error as retryable or non-retryable.
///
/// Retryable: connect, timeout, request, body read, and decode errors.
/// Non-retryable: redirect and builder errors.
pub fn is_retryable_reqwest_error(e: &reqwest::Error) -> bool {
    e.is_connect() || e.is_timeout() || e.is_request() || e.is_body() || e.is_decode()
}
