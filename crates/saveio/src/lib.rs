//! saveio-engine: turns an HLS transcoding stream into a single local file.
//!
//! The engine is deliberately session-agnostic: it knows how to resolve a
//! playlist into segments, fetch those segments with patience for a
//! just-in-time transcoder, lay them down on disk, and fold them into one
//! faststart MP4. Queueing, persistence, and HTTP live in the application
//! on top.

pub mod config;
pub mod driver;
pub mod error;
pub mod fetcher;
pub mod layout;
pub mod playlist;
pub mod remux;
pub mod retry;

pub use config::{DriverConfig, EngineConfig, FetcherConfig, PlaylistConfig};
pub use driver::{NullSink, ProgressSink, SegmentDriver};
pub use error::DownloadError;
pub use fetcher::SegmentFetcher;
pub use playlist::{HlsSegment, SegmentList, load_segment_list};
pub use remux::{FfmpegRemuxer, Remuxer, concat_segments, remove_scratch};
