//! Environment-driven application settings.

use crate::error::{Error, Result};
use saveio_engine::EngineConfig;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Application settings, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub bind_addr: SocketAddr,
    pub downloads_dir: PathBuf,
    /// Global cap on simultaneously downloading sessions.
    pub max_concurrent_downloads: usize,
    /// Segment fetch concurrency within one download.
    pub max_concurrent_segments: usize,
    pub segment_timeout: Duration,
    pub max_segment_attempts: u32,
    /// Default retention for completed downloads; `None` keeps files forever.
    pub default_retention_days: Option<u32>,
    pub sweep_interval: Duration,
    pub upstream_url: String,
    pub upstream_api_key: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: ([0, 0, 0, 0], 8096).into(),
            downloads_dir: PathBuf::from("downloads"),
            max_concurrent_downloads: 2,
            max_concurrent_segments: 3,
            segment_timeout: Duration::from_secs(60),
            max_segment_attempts: 8,
            default_retention_days: None,
            sweep_interval: Duration::from_secs(3600),
            upstream_url: String::new(),
            upstream_api_key: String::new(),
        }
    }
}

fn parsed<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| Error::config(format!("{key} has invalid value `{raw}`"))),
        Err(_) => Ok(None),
    }
}

impl Settings {
    /// Load settings from the environment, falling back to defaults.
    ///
    /// The upstream URL and API key have no sensible defaults and are
    /// required.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let upstream_url = std::env::var("OFFCAST_UPSTREAM_URL")
            .map_err(|_| Error::config("OFFCAST_UPSTREAM_URL is required"))?;
        let upstream_api_key = std::env::var("OFFCAST_UPSTREAM_API_KEY")
            .map_err(|_| Error::config("OFFCAST_UPSTREAM_API_KEY is required"))?;

        Ok(Self {
            bind_addr: parsed("OFFCAST_BIND_ADDR")?.unwrap_or(defaults.bind_addr),
            downloads_dir: parsed::<PathBuf>("OFFCAST_DOWNLOADS_DIR")?
                .unwrap_or(defaults.downloads_dir),
            max_concurrent_downloads: parsed("OFFCAST_MAX_CONCURRENT_DOWNLOADS")?
                .unwrap_or(defaults.max_concurrent_downloads),
            max_concurrent_segments: parsed("OFFCAST_MAX_CONCURRENT_SEGMENTS")?
                .unwrap_or(defaults.max_concurrent_segments),
            segment_timeout: parsed("OFFCAST_SEGMENT_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.segment_timeout),
            max_segment_attempts: parsed("OFFCAST_MAX_SEGMENT_ATTEMPTS")?
                .unwrap_or(defaults.max_segment_attempts),
            default_retention_days: parsed("OFFCAST_RETENTION_DAYS")?,
            sweep_interval: parsed("OFFCAST_SWEEP_INTERVAL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.sweep_interval),
            upstream_url,
            upstream_api_key,
        })
    }

    /// Engine configuration derived from these settings.
    pub fn engine_config(&self) -> EngineConfig {
        let mut config = EngineConfig::default();
        config.fetcher.segment_timeout = self.segment_timeout;
        config.fetcher.max_attempts = self.max_segment_attempts;
        config.driver.segment_concurrency = self.max_concurrent_segments;
        config
    }
}
