//! Naming scheme for the per-download scratch directory.

use std::path::{Path, PathBuf};

/// Init segment file name, present when the stream carries an `EXT-X-MAP`.
pub const INIT_FILE: &str = "init.mp4";

/// Scratch file the segments are concatenated into before the remux.
pub const CONCAT_FILE: &str = "concat.mp4";

/// File name for a media segment by playlist index.
pub fn segment_file_name(index: u32) -> String {
    format!("{index}.mp4")
}

pub fn segment_path(dir: &Path, index: u32) -> PathBuf {
    dir.join(segment_file_name(index))
}

pub fn init_path(dir: &Path) -> PathBuf {
    dir.join(INIT_FILE)
}

pub fn concat_path(dir: &Path) -> PathBuf {
    dir.join(CONCAT_FILE)
}
