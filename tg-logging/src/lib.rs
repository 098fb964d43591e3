//! tg-logging: NDJSON event sink for search post-mortems.
//!
//! Events append as one JSON object per line. The writer keeps a byte
//! count of the live file and, when a size limit is configured, moves
//! one full generation aside (`<path>.1`) before starting over, so
//! unattended self-play runs keep a bounded footprint.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use thiserror::Error;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Error)]
pub enum LogError {
    #[error("log io error: {0}")]
    Io(#[from] io::Error),
    #[error("event serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Milliseconds since the Unix epoch, for event timestamps.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Periodic in-search progress report.
#[derive(Debug, Clone, Serialize)]
pub struct SearchProgressV1 {
    pub event: &'static str,
    pub ts_ms: u64,
    pub movenum: u32,
    pub playouts: u32,
    pub visits: u32,
    pub nodes: usize,
    /// Winrate for the side to move, in [0,1].
    pub winrate: f32,
    pub pv: String,
}

impl SearchProgressV1 {
    pub const EVENT: &'static str = "search_progress_v1";
}

/// One record per completed `think` call.
#[derive(Debug, Clone, Serialize)]
pub struct SearchSummaryV1 {
    pub event: &'static str,
    pub ts_ms: u64,
    pub movenum: u32,
    pub chosen: String,
    pub visits: u32,
    pub nodes: usize,
    pub playouts: u32,
    pub playouts_per_s: f32,
    /// Winrate for Black at the root, in [0,1].
    pub black_winrate: f32,
    /// Score head at the root, Black's perspective, komi included.
    pub alpkt: f32,
    pub beta: f32,
    /// Exploration bonus offset chosen at the root.
    pub x_bar: f32,
    pub avg_depth: f32,
    pub max_depth: usize,
}

impl SearchSummaryV1 {
    pub const EVENT: &'static str = "search_summary_v1";
}

/// Durability and retention policy for an [`EventWriter`].
#[derive(Debug, Clone, Copy, Default)]
pub struct WriterLimits {
    /// Flush once this many lines are buffered; 0 flushes every append.
    pub flush_every_lines: u64,
    /// Rotate the file before it would exceed this many bytes;
    /// 0 disables rotation.
    pub rotate_at_bytes: u64,
}

/// Append-only NDJSON writer with size-capped single-generation
/// rotation.
///
/// Every `append` writes exactly one JSON object and a newline; a line
/// is never split across a rotation.
pub struct EventWriter {
    path: PathBuf,
    out: BufWriter<File>,
    bytes_in_file: u64,
    unflushed_lines: u64,
    limits: WriterLimits,
}

impl EventWriter {
    /// Open `path` for appending, creating it if needed. Picks up the
    /// size of whatever is already there so rotation limits hold
    /// across restarts.
    pub fn open(path: impl AsRef<Path>, limits: WriterLimits) -> Result<Self, LogError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let bytes_in_file = file.metadata()?.len();
        Ok(Self {
            path,
            out: BufWriter::new(file),
            bytes_in_file,
            unflushed_lines: 0,
            limits,
        })
    }

    pub fn append<T: Serialize>(&mut self, event: &T) -> Result<(), LogError> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        let len = line.len() as u64;

        if self.limits.rotate_at_bytes > 0
            && self.bytes_in_file > 0
            && self.bytes_in_file + len > self.limits.rotate_at_bytes
        {
            self.rotate()?;
        }

        self.out.write_all(&line)?;
        self.bytes_in_file += len;
        self.unflushed_lines += 1;
        if self.unflushed_lines > self.limits.flush_every_lines {
            self.flush()?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), LogError> {
        self.out.flush()?;
        self.unflushed_lines = 0;
        Ok(())
    }

    /// Move the live file to `<path>.1` (replacing any previous
    /// generation) and start a fresh one.
    fn rotate(&mut self) -> Result<(), LogError> {
        self.flush()?;
        let mut rotated = self.path.clone().into_os_string();
        rotated.push(".1");
        fs::rename(&self.path, &rotated)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.out = BufWriter::new(file);
        self.bytes_in_file = 0;
        Ok(())
    }
}
