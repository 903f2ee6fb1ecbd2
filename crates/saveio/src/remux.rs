// Concatenation and faststart remux.
//
// fMP4 segments are byte-concatenable: init segment first, then every media
// segment in ascending index order. ffmpeg then rewrites the container once
// with `-movflags +faststart` so the moov atom lands at the front and the
// file streams progressively.

use crate::error::DownloadError;
use crate::layout;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncReadExt, BufReader, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Buffer size for the chunked concat copies.
const COPY_BUFFER_BYTES: usize = 1024 * 1024;

/// How much trailing stderr to attach to a remux failure.
const STDERR_TAIL_BYTES: usize = 500;

/// Binary-concatenate the init segment (if present) and `total` media
/// segments from `dir` into the concat scratch file. Returns its path.
pub async fn concat_segments(dir: &Path, total: u32) -> Result<PathBuf, DownloadError> {
    let concat = layout::concat_path(dir);
    let out = tokio::fs::File::create(&concat).await?;
    let mut writer = BufWriter::with_capacity(COPY_BUFFER_BYTES, out);

    let init = layout::init_path(dir);
    let mut inputs: Vec<PathBuf> = Vec::with_capacity(total as usize + 1);
    if tokio::fs::try_exists(&init).await? {
        inputs.push(init);
    }
    inputs.extend((0..total).map(|index| layout::segment_path(dir, index)));

    let mut written: u64 = 0;
    for input in &inputs {
        let file = tokio::fs::File::open(input).await?;
        let mut reader = BufReader::with_capacity(COPY_BUFFER_BYTES, file);
        written += tokio::io::copy_buf(&mut reader, &mut writer).await?;
    }
    tokio::io::AsyncWriteExt::flush(&mut writer).await?;

    debug!(
        parts = inputs.len(),
        bytes = written,
        path = %concat.display(),
        "Concatenated segments"
    );
    Ok(concat)
}

/// Remove the concat scratch, the init segment, and every per-segment file.
/// Called only after the final file is safely in place.
pub async fn remove_scratch(dir: &Path, total: u32) -> Result<(), DownloadError> {
    let mut paths = vec![layout::concat_path(dir), layout::init_path(dir)];
    paths.extend((0..total).map(|index| layout::segment_path(dir, index)));
    for path in paths {
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Rewrites a concatenated fMP4 into its final, streamable form.
#[async_trait]
pub trait Remuxer: Send + Sync {
    async fn remux(
        &self,
        input: &Path,
        output: &Path,
        token: &CancellationToken,
    ) -> Result<(), DownloadError>;
}

/// The production remuxer: one ffmpeg subprocess per download.
pub struct FfmpegRemuxer {
    program: String,
}

impl FfmpegRemuxer {
    pub fn new() -> Self {
        Self {
            program: "ffmpeg".to_string(),
        }
    }

    /// Use a specific binary instead of `ffmpeg` from `PATH`.
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for FfmpegRemuxer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Remuxer for FfmpegRemuxer {
    async fn remux(
        &self,
        input: &Path,
        output: &Path,
        token: &CancellationToken,
    ) -> Result<(), DownloadError> {
        info!(input = %input.display(), output = %output.display(), "Remuxing with faststart");

        let spawned = tokio::process::Command::new(&self.program)
            .arg("-i")
            .arg(input)
            .arg("-c")
            .arg("copy")
            .arg("-movflags")
            .arg("+faststart")
            .arg("-y")
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DownloadError::FfmpegMissing);
            }
            Err(e) => return Err(e.into()),
        };

        // Drain stderr while waiting so the pipe never fills.
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| DownloadError::internal("ffmpeg stderr not captured"))?;
        let drain = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stderr.read_to_end(&mut buf).await;
            buf
        });

        let status = tokio::select! {
            _ = token.cancelled() => {
                warn!("Remux cancelled, killing ffmpeg");
                let _ = child.kill().await;
                drain.abort();
                return Err(DownloadError::Cancelled);
            }
            status = child.wait() => status?,
        };

        let stderr_buf = drain.await.unwrap_or_default();
        if status.success() {
            Ok(())
        } else {
            Err(DownloadError::RemuxFailed {
                exit: status.to_string(),
                stderr_tail: stderr_tail(&stderr_buf),
            })
        }
    }
}

fn stderr_tail(buf: &[u8]) -> String {
    let start = buf.len().saturating_sub(STDERR_TAIL_BYTES);
    String::from_utf8_lossy(&buf[start..]).into_owned()
}
