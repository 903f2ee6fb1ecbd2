use std::time::Duration;

/// Top-level engine configuration.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub playlist: PlaylistConfig,
    pub fetcher: FetcherConfig,
    pub driver: DriverConfig,
}

/// Playlist fetching configuration.
#[derive(Debug, Clone)]
pub struct PlaylistConfig {
    pub fetch_timeout: Duration,
}

impl Default for PlaylistConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(60),
        }
    }
}

/// Segment fetcher configuration.
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// Per-attempt download timeout.
    pub segment_timeout: Duration,
    /// Total attempts per segment, counting the first.
    pub max_attempts: u32,
    /// Backoff ramp step. Delay after attempt `n` is `(n + 1) * step`,
    /// capped at `max_retry_delay`. The transcoding origin produces segments
    /// just-in-time, so long waits between attempts are correct.
    pub retry_delay_step: Duration,
    /// Hard cap on the computed backoff delay.
    pub max_retry_delay: Duration,
    /// Bodies shorter than this are not plausible media segments.
    pub min_segment_bytes: usize,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            segment_timeout: Duration::from_secs(60),
            max_attempts: 8,
            retry_delay_step: Duration::from_secs(3),
            max_retry_delay: Duration::from_secs(15),
            min_segment_bytes: 1024,
        }
    }
}

/// Parallel segment driver configuration.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Max concurrent segment downloads within one download.
    pub segment_concurrency: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            segment_concurrency: 3,
        }
    }
}
