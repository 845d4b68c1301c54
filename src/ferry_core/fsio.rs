use std::fs;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::ferry_core::domain::now_ms;

/// One read from [`LimitedLineReader`]. `consumed` always includes the
/// terminating newline byte when one was present.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum LineRead {
    Line { consumed: u64, line: Vec<u8> },
    /// The line exceeded the buffer bound; its bytes were discarded but
    /// fully consumed so the stream stays aligned.
    Oversized { consumed: u64 },
    Eof,
}

/// Line reader with a hard per-line buffer bound.
pub(crate) struct LimitedLineReader<R: BufRead> {
    inner: R,
    max_line_bytes: usize,
}

impl<R: BufRead> LimitedLineReader<R> {
    pub(crate) fn new(inner: R, max_line_bytes: usize) -> Self {
        Self {
            inner,
            max_line_bytes,
        }
    }

    pub(crate) fn next_line(&mut self) -> io::Result<LineRead> {
        let mut line: Vec<u8> = Vec::new();
        let mut consumed: u64 = 0;
        let mut oversized = false;
        loop {
            let available = self.inner.fill_buf()?;
            if available.is_empty() {
                return Ok(if consumed == 0 {
                    LineRead::Eof
                } else if oversized {
                    LineRead::Oversized { consumed }
                } else {
                    LineRead::Line { consumed, line }
                });
            }
            let newline = available.iter().position(|b| *b == b'\n');
            let take = newline.map_or(available.len(), |pos| pos + 1);
            if !oversized {
                let keep = newline.map_or(take, |pos| pos);
                line.extend_from_slice(&available[..keep]);
                if line.len() > self.max_line_bytes {
                    oversized = true;
                    line.clear();
                }
            }
            self.inner.consume(take);
            consumed += take as u64;
            if newline.is_some() {
                return Ok(if oversized {
                    LineRead::Oversized { consumed }
                } else {
                    LineRead::Line { consumed, line }
                });
            }
        }
    }
}

/// Reads and deserializes a JSON file into the specified type.
pub(crate) fn read_json_file<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let file = fs::File::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let reader = BufReader::new(file);
    serde_json::from_reader(reader)
        .with_context(|| format!("failed to parse JSON from {}", path.display()))
}

/// Serializes a value to a JSON file atomically: the parent directory is
/// created if missing, the payload is written to a temp sibling, then
/// renamed over the target.
pub(crate) fn write_json_file<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }
    let file = fs::File::create(&tmp_path)
        .with_context(|| format!("failed to create temp file {}", tmp_path.display()))?;
    if let Err(err) = serde_json::to_writer_pretty(&file, value) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err)
            .with_context(|| format!("failed to write JSON to {}", tmp_path.display()));
    }
    drop(file);
    fs::rename(&tmp_path, path).with_context(|| {
        format!(
            "failed to atomically rename {} -> {}",
            tmp_path.display(),
            path.display()
        )
    })
}

static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Collision-free scratch path inside `dir`, without touching the disk.
pub(crate) fn unique_temp_path(dir: &Path, prefix: &str, suffix: &str) -> PathBuf {
    let seq = TEMP_SEQ.fetch_add(1, Ordering::Relaxed);
    dir.join(format!(
        "{prefix}-{}-{}-{seq}{suffix}",
        std::process::id(),
        now_ms()
    ))
}
