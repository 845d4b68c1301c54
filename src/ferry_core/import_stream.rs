use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{BufReader, Seek, SeekFrom};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use reqwest::header::CONTENT_TYPE;

use crate::ferry_core::domain::{ImportSummary, MAX_LINE_BYTES, UploadResult};
use crate::ferry_core::endpoint::apply_request_headers;
use crate::ferry_core::fsio::{LimitedLineReader, LineRead};
use crate::ferry_core::httpc::{IMPORT_HTTP_TIMEOUT, build_client};
use crate::ferry_core::normalize::{
    LineOutcome, NormalizeOptions, NormalizedLine, normalize_line, parse_metric_line,
};

/// How much of an error response body is kept for diagnostics.
const ERROR_BODY_CAP: usize = 64 * 1024;

/// Errors out of one streaming import run. Commit failures leave the
/// committed offset valid for resume; a cancel is only worth resuming
/// once at least one chunk has landed; everything else is fatal.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("chunk upload failed: {detail}")]
    Commit {
        status: Option<u16>,
        detail: String,
    },
    #[error("import canceled")]
    Canceled {
        /// Chunks committed (across all attempts) when the cancel landed.
        committed_chunks: u64,
    },
    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
}

impl StreamError {
    /// Whether re-running from the committed offset can make progress.
    /// A cancel with nothing committed is a plain failure: there is no
    /// offset worth coming back to.
    pub fn is_resumable(&self) -> bool {
        match self {
            Self::Commit { .. } => true,
            Self::Canceled { committed_chunks } => *committed_chunks > 0,
            Self::Fatal(_) => false,
        }
    }
}

/// Import-side HTTP client bound to one target URL plus its headers.
pub struct TargetClient {
    client: reqwest::blocking::Client,
    import_url: String,
    conn: crate::ferry_core::domain::ConnectionConfig,
}

impl TargetClient {
    pub fn new(
        conn: crate::ferry_core::domain::ConnectionConfig,
        import_url: String,
    ) -> Result<Self> {
        let client = build_client(&conn, IMPORT_HTTP_TIMEOUT)?;
        Ok(Self {
            client,
            import_url,
            conn,
        })
    }

    fn post_chunk(&self, body: Vec<u8>) -> Result<(), StreamError> {
        let request = self
            .client
            .post(&self.import_url)
            .header(CONTENT_TYPE, "application/jsonl")
            .body(body);
        let response = apply_request_headers(request, &self.conn)
            .send()
            .map_err(|err| StreamError::Commit {
                status: None,
                detail: format!("{err:#}"),
            })?;
        let status = response.status();
        if status.as_u16() < 300 {
            return Ok(());
        }
        let mut body = response.text().unwrap_or_default();
        if body.len() > ERROR_BODY_CAP {
            let mut cut = ERROR_BODY_CAP;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
        }
        Err(StreamError::Commit {
            status: Some(status.as_u16()),
            detail: format!("target returned HTTP {status}: {}", body.trim()),
        })
    }
}

/// Owns the in-flight chunk: buffered body, counters, the file offset a
/// successful POST will commit.
#[derive(Debug)]
pub(crate) struct ChunkAssembler {
    max_chunk_bytes: usize,
    buf: Vec<u8>,
    points: u64,
    min_ts: Option<i64>,
    max_ts: Option<i64>,
    metric: String,
    labels: BTreeMap<String, String>,
    examples: Vec<BTreeMap<String, String>>,
    /// File offset just past the newline of the last buffered line.
    end_offset: u64,
}

pub(crate) struct PendingChunk {
    pub body: Vec<u8>,
    pub points: u64,
    pub min_ts: Option<i64>,
    pub max_ts: Option<i64>,
    pub metric: String,
    pub labels: BTreeMap<String, String>,
    pub examples: Vec<BTreeMap<String, String>>,
    pub end_offset: u64,
}

impl ChunkAssembler {
    pub(crate) fn new(max_chunk_bytes: usize) -> Self {
        Self {
            max_chunk_bytes: max_chunk_bytes.max(1),
            buf: Vec::new(),
            points: 0,
            min_ts: None,
            max_ts: None,
            metric: String::new(),
            labels: BTreeMap::new(),
            examples: Vec::new(),
            end_offset: 0,
        }
    }

    pub(crate) fn push(&mut self, line: &NormalizedLine, canonical: &str, line_end_offset: u64) {
        self.buf.extend_from_slice(canonical.as_bytes());
        self.buf.push(b'\n');
        self.points += line.timestamps.len() as u64;
        if let (Some(&min_ts), Some(&max_ts)) =
            (line.timestamps.iter().min(), line.timestamps.iter().max())
        {
            self.min_ts = Some(self.min_ts.map_or(min_ts, |cur| cur.min(min_ts)));
            self.max_ts = Some(self.max_ts.map_or(max_ts, |cur| cur.max(max_ts)));
        }
        if self.metric.is_empty() {
            self.metric = line.metric_name().to_string();
            self.labels = line.labels.clone();
        }
        if self.examples.len() < 5 {
            self.examples.push(line.labels.clone());
        }
        self.end_offset = line_end_offset;
    }

    pub(crate) fn is_full(&self) -> bool {
        self.buf.len() >= self.max_chunk_bytes
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub(crate) fn take(&mut self) -> PendingChunk {
        PendingChunk {
            body: std::mem::take(&mut self.buf),
            points: std::mem::take(&mut self.points),
            min_ts: self.min_ts.take(),
            max_ts: self.max_ts.take(),
            metric: std::mem::take(&mut self.metric),
            labels: std::mem::take(&mut self.labels),
            examples: std::mem::take(&mut self.examples),
            end_offset: self.end_offset,
        }
    }
}

/// Knobs for one streaming run, frozen by the job runner.
pub struct StreamConfig<'a> {
    pub target: &'a TargetClient,
    pub cancel: &'a AtomicBool,
    pub max_chunk_bytes: usize,
    pub cutoff_ms: i64,
    pub shift_ms: i64,
    pub drop_labels: BTreeSet<String>,
    pub start_offset: u64,
}

fn commit(
    assembler: &mut ChunkAssembler,
    cfg: &StreamConfig<'_>,
    summary: &mut ImportSummary,
    committed: &mut u64,
    progress: &mut dyn FnMut(u64),
) -> Result<(), StreamError> {
    let chunk = assembler.take();
    let body_len = chunk.body.len() as u64;
    cfg.target.post_chunk(chunk.body)?;

    summary.bytes += body_len;
    summary.points += chunk.points;
    summary.chunks += 1;
    summary.chunk_bytes = summary.chunk_bytes.max(body_len);
    *committed = chunk.end_offset;
    summary.processed_bytes = *committed;
    if let (Some(min_ts), Some(max_ts)) = (chunk.min_ts, chunk.max_ts) {
        summary.widen_range(min_ts, max_ts);
    }
    if summary.metric_name.is_empty() {
        summary.metric_name = chunk.metric;
    }
    if summary.labels.is_empty() {
        summary.labels = chunk.labels;
    }
    for example in chunk.examples {
        if summary.examples.len() >= 5 {
            break;
        }
        summary.examples.push(example);
    }
    progress(summary.chunks);
    Ok(())
}

/// Stream a metrics file into the target as sequential chunk POSTs.
///
/// Lines are read under a hard 16 MiB bound, normalized, buffered up to
/// the chunk budget, and committed in file order. The committed offset
/// only ever advances on an accepted POST; on any error it is left at the
/// last commit so a follow-up run can resume from it.
pub fn stream_import(
    metrics_path: &Path,
    cfg: &StreamConfig<'_>,
    summary: &mut ImportSummary,
    progress: &mut dyn FnMut(u64),
) -> Result<UploadResult, StreamError> {
    let mut file = fs::File::open(metrics_path).map_err(|err| {
        StreamError::Fatal(anyhow::Error::new(err).context(format!(
            "failed to open metrics file {}",
            metrics_path.display()
        )))
    })?;
    file.seek(SeekFrom::Start(cfg.start_offset)).map_err(|err| {
        StreamError::Fatal(
            anyhow::Error::new(err).context(format!("failed to seek to offset {}", cfg.start_offset)),
        )
    })?;
    let mut reader = LimitedLineReader::new(BufReader::new(file), MAX_LINE_BYTES);

    let normalize_opts = NormalizeOptions {
        cutoff_ms: cfg.cutoff_ms,
        shift_ms: cfg.shift_ms,
        drop_labels: cfg.drop_labels.clone(),
    };
    let mut assembler = ChunkAssembler::new(cfg.max_chunk_bytes);
    let mut committed = cfg.start_offset;
    let mut current = cfg.start_offset;
    summary.processed_bytes = summary.processed_bytes.max(committed);

    loop {
        if cfg.cancel.load(Ordering::SeqCst) {
            return Err(StreamError::Canceled {
                committed_chunks: summary.chunks,
            });
        }
        let (consumed, line) = match reader
            .next_line()
            .map_err(|err| StreamError::Fatal(anyhow::Error::new(err).context("read failed")))?
        {
            LineRead::Eof => break,
            LineRead::Oversized { consumed } => {
                current += consumed;
                summary.skipped_lines += 1;
                continue;
            }
            LineRead::Line { consumed, line } => (consumed, line),
        };
        current += consumed;

        let Ok(text) = std::str::from_utf8(&line) else {
            summary.skipped_lines += 1;
            continue;
        };
        let text = text.trim();
        if text.is_empty() {
            continue;
        }
        let raw = match parse_metric_line(text) {
            Ok(raw) => raw,
            Err(_) => {
                summary.skipped_lines += 1;
                continue;
            }
        };
        let normalized = match normalize_line(&raw, &normalize_opts) {
            LineOutcome::Emitted(normalized) => normalized,
            LineOutcome::Skipped { dropped_old } => {
                summary.dropped_old += dropped_old;
                if dropped_old == 0 {
                    summary.skipped_lines += 1;
                }
                continue;
            }
        };
        summary.dropped_old += normalized.dropped_old;
        summary.normalized_ts |= normalized.normalized_ts;

        let canonical = normalized
            .to_jsonl()
            .map_err(|err| StreamError::Fatal(anyhow::Error::new(err).context("serialize failed")))?;
        assembler.push(&normalized, &canonical, current);
        if assembler.is_full() {
            if cfg.cancel.load(Ordering::SeqCst) {
                return Err(StreamError::Canceled {
                    committed_chunks: summary.chunks,
                });
            }
            commit(&mut assembler, cfg, summary, &mut committed, progress)?;
        }
    }

    if !assembler.is_empty() {
        commit(&mut assembler, cfg, summary, &mut committed, progress)?;
    }

    Ok(UploadResult {
        chunks: summary.chunks,
        bytes: summary.bytes,
        committed_offset: committed,
    })
}
