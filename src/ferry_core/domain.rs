use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Label keys that survive every drop request. `__`-prefixed keys are
/// structurally protected on top of this set.
pub const PROTECTED_LABELS: [&str; 3] = ["__name__", "job", "instance"];

/// Upper bound for a single JSONL line read from a bundle.
pub const MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

/// Default byte budget for one import chunk POST.
pub const DEFAULT_MAX_CHUNK_BYTES: usize = 512 * 1024;

/// Default number of lines scanned by a sample-mode preflight.
pub const DEFAULT_SAMPLE_LIMIT: u64 = 2000;

/// Per-analysis cap on series tracked for label-drop simulation.
pub const SIMULATION_SERIES_CAP: usize = 1000;

/// Hard cap on distinct label names reported in the label universe.
pub const LABEL_UNIVERSE_CAP: usize = 48 * SIMULATION_SERIES_CAP;

/// Top-N label names reported in `labelStats`.
pub const LABEL_STATS_TOP_N: usize = 10;

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Queued,
    Extracting,
    Importing,
    Verifying,
    Completed,
    Failed,
    Canceled,
}

impl Stage {
    /// Human-facing counterpart kept alongside the enum so the UI never
    /// parses stage identifiers.
    pub fn human(self) -> &'static str {
        match self {
            Self::Queued => "Waiting to start",
            Self::Extracting => "Unpacking bundle",
            Self::Importing => "Streaming chunks to target",
            Self::Verifying => "Verifying ingested series",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Canceled => "Canceled",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuthKind {
    #[default]
    None,
    Basic,
    Bearer,
    Header,
}

/// Where and how to talk to the target VM cluster. Frozen at job start.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub endpoint: String,
    #[serde(default)]
    pub tenant_id: String,
    #[serde(default)]
    pub auth_type: AuthKind,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub custom_header_name: String,
    #[serde(default)]
    pub custom_header_value: String,
    #[serde(default)]
    pub skip_tls_verify: bool,
}

/// What happens to each sample between parse and emission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionPolicy {
    #[serde(default = "default_true")]
    pub drop_old: bool,
    #[serde(default)]
    pub time_shift_ms: i64,
    #[serde(default)]
    pub max_labels_override: u32,
    #[serde(default)]
    pub drop_labels: Vec<String>,
}

impl Default for IngestionPolicy {
    fn default() -> Self {
        Self {
            drop_old: true,
            time_shift_ms: 0,
            max_labels_override: 0,
            drop_labels: Vec::new(),
        }
    }
}

impl IngestionPolicy {
    /// Drop set with protected and `__`-prefixed keys removed. The UI may
    /// request anything; the pipeline only ever honors this sanitized view.
    pub fn sanitized_drop_labels(&self) -> std::collections::BTreeSet<String> {
        self.drop_labels
            .iter()
            .filter(|key| !key.starts_with("__"))
            .filter(|key| !PROTECTED_LABELS.contains(&key.as_str()))
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchingConfig {
    #[serde(default = "default_metric_step")]
    pub metric_step_seconds: u64,
    #[serde(default)]
    pub batch_window_seconds: Option<u64>,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            metric_step_seconds: 60,
            batch_window_seconds: None,
        }
    }
}

impl BatchingConfig {
    /// Effective export window length. An explicit window wins; otherwise
    /// derive a window that keeps roughly one thousand steps per batch.
    pub fn window_seconds(&self) -> u64 {
        match self.batch_window_seconds {
            Some(explicit) if explicit > 0 => explicit,
            _ => self.metric_step_seconds.max(1).saturating_mul(1000),
        }
    }
}

/// Frozen configuration for one import job. Flat on the wire; the nested
/// sections are flattened into one key space.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    #[serde(flatten)]
    pub connection: ConnectionConfig,
    #[serde(flatten)]
    pub ingestion: IngestionPolicy,
    #[serde(flatten)]
    pub batching: BatchingConfig,
    /// Chunk byte budget; overridable so tests can force multi-chunk runs.
    #[serde(default = "default_max_chunk_bytes")]
    pub max_chunk_bytes: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            ingestion: IngestionPolicy::default(),
            batching: BatchingConfig::default(),
            max_chunk_bytes: DEFAULT_MAX_CHUNK_BYTES,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimeRangeMs {
    pub start_ms: i64,
    pub end_ms: i64,
}

/// Frozen configuration for one export job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    #[serde(flatten)]
    pub connection: ConnectionConfig,
    #[serde(flatten)]
    pub batching: BatchingConfig,
    pub time_range: TimeRangeMs,
    #[serde(default = "default_match_expr")]
    pub match_expr: String,
    #[serde(default = "default_true")]
    pub obfuscate: bool,
    /// Additional label keys obfuscated with stable opaque tokens.
    #[serde(default)]
    pub obfuscate_labels: Vec<String>,
    #[serde(default)]
    pub staging_file: Option<String>,
    #[serde(default)]
    pub output_dir: Option<String>,
    #[serde(default)]
    pub resume_from_batch: u64,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            batching: BatchingConfig::default(),
            time_range: TimeRangeMs::default(),
            match_expr: default_match_expr(),
            obfuscate: true,
            obfuscate_labels: Vec::new(),
            staging_file: None,
            output_dir: None,
            resume_from_batch: 0,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_metric_step() -> u64 {
    60
}

fn default_max_chunk_bytes() -> usize {
    DEFAULT_MAX_CHUNK_BYTES
}

fn default_match_expr() -> String {
    "{__name__!=\"\"}".to_string()
}

/// Accumulated while streaming an import; survives across resume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    pub metric_name: String,
    pub labels: BTreeMap<String, String>,
    #[serde(rename = "start")]
    pub start_ms: Option<i64>,
    #[serde(rename = "end")]
    pub end_ms: Option<i64>,
    pub points: u64,
    pub skipped_lines: u64,
    pub dropped_old: u64,
    pub normalized_ts: bool,
    /// Bytes accepted by the target across committed chunks.
    pub bytes: u64,
    pub source_bytes: u64,
    pub inflated_bytes: u64,
    pub chunks: u64,
    pub chunk_bytes: u64,
    /// Committed byte offset into the extracted metrics file.
    pub processed_bytes: u64,
    pub examples: Vec<BTreeMap<String, String>>,
    /// True when bundle metadata pinned the time range explicitly.
    pub range_pinned: bool,
}

impl ImportSummary {
    /// Widen the observed time range monotonically: start only moves down,
    /// end only moves up.
    pub fn widen_range(&mut self, min_ts: i64, max_ts: i64) {
        self.start_ms = Some(self.start_ms.map_or(min_ts, |cur| cur.min(min_ts)));
        self.end_ms = Some(self.end_ms.map_or(max_ts, |cur| cur.max(max_ts)));
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResult {
    pub chunks: u64,
    pub bytes: u64,
    pub committed_offset: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationResult {
    pub verified: bool,
    pub query: String,
    pub series_seen: u64,
    /// Unix seconds bounding the verification window.
    pub start: i64,
    pub end: i64,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LabelFrequency {
    pub name: String,
    pub count: u64,
}

/// Fixed-width bitset over the analyzer's label universe. Bit `i` maps to
/// `labelUniverse[i]`; bytes travel base64-encoded.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BitSet {
    #[serde(with = "b64_bytes")]
    pub bytes: Vec<u8>,
    pub width: usize,
}

impl BitSet {
    pub fn with_width(width: usize) -> Self {
        Self {
            bytes: vec![0u8; width.div_ceil(8)],
            width,
        }
    }

    pub fn set(&mut self, idx: usize) {
        if idx >= self.width {
            self.width = idx + 1;
        }
        let byte = idx / 8;
        if byte >= self.bytes.len() {
            self.bytes.resize(byte + 1, 0);
        }
        self.bytes[byte] |= 1 << (idx % 8);
    }

    pub fn has_bit(&self, idx: usize) -> bool {
        self.bytes
            .get(idx / 8)
            .is_some_and(|b| b & (1 << (idx % 8)) != 0)
    }
}

mod b64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD
            .decode(text.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Preflight output: one streaming pass over a metrics file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisSummary {
    pub metric_name: String,
    #[serde(rename = "start")]
    pub start_ms: Option<i64>,
    #[serde(rename = "end")]
    pub end_ms: Option<i64>,
    pub range_pinned: bool,
    pub scanned_lines: u64,
    pub analyzed_lines: u64,
    pub skipped_lines: u64,
    pub dropped_old: u64,
    pub normalized_ts: bool,
    /// Points surviving the retention filter.
    pub points: u64,
    /// Points observed before retention filtering.
    pub total_points: u64,
    pub max_labels_seen: u32,
    /// Series whose label count exceeds the active limit (0 when the limit
    /// is unknown).
    pub over_label_limit: u64,
    pub max_labels_limit: u32,
    /// Distinct label names observed in the scanned portion.
    pub total_labels: u64,
    pub label_stats: Vec<LabelFrequency>,
    pub label_universe: Vec<String>,
    pub series_label_bitsets: Vec<BitSet>,
    pub series_label_counts: Vec<u32>,
    pub series_point_counts: Vec<u64>,
    pub sample_cut: bool,
    pub sample_limit: u64,
    pub sim_series: u64,
    pub simulation_series_capped: bool,
    pub examples: Vec<BTreeMap<String, String>>,
    pub warnings: Vec<String>,
}

/// One import job as the manager tracks it. Snapshots handed to callers
/// are deep copies; pipelines mutate only through the manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportJob {
    pub id: String,
    pub state: JobState,
    pub stage: Stage,
    pub stage_message: String,
    pub percent: f64,
    pub source_bytes: u64,
    pub inflated_bytes: u64,
    pub chunks_completed: u64,
    pub chunks_total: u64,
    pub chunk_size: u64,
    pub summary: Option<ImportSummary>,
    pub verification: Option<VerificationResult>,
    /// Original file name supplied by the uploader.
    pub remote_path: Option<String>,
    pub error: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
    pub import_url: String,
    pub query_url: String,
    /// Uploaded temp file on local disk; kept alive while resumable.
    pub bundle_path: String,
    /// Extracted metrics file the stream reads from; set after extraction.
    pub metrics_path: Option<String>,
    pub resume_offset: u64,
    pub resume_ready: bool,
    /// Set when temp artifacts may be removed (terminal, non-resumable).
    pub cleanup_pending: bool,
    pub config: UploadConfig,
}

impl ImportJob {
    pub fn new(id: String, bundle_path: String, remote_path: Option<String>, source_bytes: u64, config: UploadConfig) -> Self {
        let now = now_ms();
        Self {
            id,
            state: JobState::Queued,
            stage: Stage::Queued,
            stage_message: Stage::Queued.human().to_string(),
            percent: 0.0,
            source_bytes,
            inflated_bytes: 0,
            chunks_completed: 0,
            chunks_total: 0,
            chunk_size: config.max_chunk_bytes as u64,
            summary: None,
            verification: None,
            remote_path,
            error: None,
            created_at: now,
            updated_at: now,
            import_url: String::new(),
            query_url: String::new(),
            bundle_path,
            metrics_path: None,
            resume_offset: 0,
            resume_ready: false,
            cleanup_pending: false,
            config,
        }
    }

    pub fn set_stage(&mut self, stage: Stage) {
        self.stage = stage;
        self.stage_message = stage.human().to_string();
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaTimeRange {
    pub start: String,
    pub end: String,
}

/// Sidecar metadata carried inside a bundle ZIP (wire keys per the
/// on-disk format, not the snapshot surface).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BundleMetadata {
    #[serde(default)]
    pub export_id: String,
    #[serde(default)]
    pub time_range: Option<MetaTimeRange>,
    #[serde(default)]
    pub metrics_count: u64,
    #[serde(default)]
    pub jobs: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportResult {
    pub export_id: String,
    pub archive_path: String,
    pub sha256: String,
    pub size_bytes: u64,
    pub metrics_count: u64,
    pub time_range: MetaTimeRange,
    /// Distinct (post-obfuscation) `job` label values seen in the export.
    pub jobs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportJob {
    pub id: String,
    pub state: JobState,
    pub total_batches: u64,
    pub completed_batches: u64,
    pub metrics_processed: u64,
    /// 0.0..1.0; `completedBatches / totalBatches` once totals are known.
    pub progress: f64,
    pub staging_path: String,
    pub average_batch_seconds: f64,
    pub last_batch_duration_seconds: f64,
    pub result: Option<ExportResult>,
    pub resume_from: u64,
    pub obfuscation_enabled: bool,
    pub error: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
    pub config: ExportConfig,
}

impl ExportJob {
    pub fn new(id: String, staging_path: String, config: ExportConfig) -> Self {
        let now = now_ms();
        Self {
            id,
            state: JobState::Queued,
            total_batches: 0,
            completed_batches: 0,
            metrics_processed: 0,
            progress: 0.0,
            staging_path,
            average_batch_seconds: 0.0,
            last_batch_duration_seconds: 0.0,
            result: None,
            resume_from: config.resume_from_batch,
            obfuscation_enabled: config.obfuscate,
            error: None,
            created_at: now,
            updated_at: now,
            config,
        }
    }
}

/// One completed export batch, published through the progress sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchProgress {
    pub job_id: String,
    pub batch_index: u64,
    pub total_batches: u64,
    pub metrics: u64,
    pub duration_seconds: f64,
    pub time_range: TimeRangeMs,
}

#[derive(Debug, Clone)]
pub enum ProgressEvent {
    ImportChunk {
        job_id: String,
        chunks_completed: u64,
        chunks_total: u64,
    },
    ExportBatch(BatchProgress),
}

/// Capability handed to pipelines for progress publication. One method so
/// the manager can batch, throttle, or drop duplicates behind it.
pub trait ProgressSink: Send + Sync {
    fn publish(&self, event: &ProgressEvent);
}

impl<F> ProgressSink for F
where
    F: Fn(&ProgressEvent) + Send + Sync,
{
    fn publish(&self, event: &ProgressEvent) {
        self(event)
    }
}
