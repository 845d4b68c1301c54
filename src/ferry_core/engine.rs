//! Job manager: in-memory import/export registries, a shared concurrency
//! budget, cancellation, and resume. Pipelines run on their own threads
//! and mutate jobs only through the registry update primitives.

mod export_runner;
mod import_runner;
mod state;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;

use anyhow::{Context, Result};
use tracing::warn;

pub use state::EngineOptions;
use state::{
    Inner, acquire_slot, allocate_job_id, cancel_flag_for, drop_cancel_flag, snapshot_export,
    snapshot_import, update_export, update_import,
};

use crate::ferry_core::analyze::{AnalysisMode, AnalyzeOptions, analyze};
use crate::ferry_core::bundle;
use crate::ferry_core::domain::{
    AnalysisSummary, ExportConfig, ExportJob, ImportJob, JobState, ProgressSink, Stage,
    UploadConfig,
};
use crate::ferry_core::endpoint::resolve_endpoints;
use crate::ferry_core::export_stream::partition_batches;
use crate::ferry_core::httpc::{PROBE_HTTP_TIMEOUT, build_client};
use crate::ferry_core::profiles::RecentProfiles;
use crate::ferry_core::retention::{discover_max_labels_limit, discover_retention_cutoff_ms};
use crate::ferry_core::vmclient::{HttpVmExporter, VmExporter};
use crate::sync_ext::{MutexExt, RwLockExt};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid request: {0}")]
    BadRequest(String),
    #[error("concurrent job limit reached")]
    ConcurrencyLimit,
    #[error("job {0} not found")]
    NotFound(String),
    #[error("job {0} is not resumable")]
    NotResumable(String),
}

/// One uploaded bundle handed to `start_import`. The file at
/// `bundle_path` is owned by the job from this point on.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub bundle_path: PathBuf,
    pub original_name: String,
    pub size_bytes: u64,
    pub config: UploadConfig,
}

/// The engine facade. Cheap to clone; all state lives behind one shared
/// `Inner`.
#[derive(Clone)]
pub struct FerryEngine {
    inner: Arc<Inner>,
}

impl FerryEngine {
    pub fn new(opts: EngineOptions) -> Result<Self> {
        fs::create_dir_all(&opts.work_dir)
            .with_context(|| format!("failed to create work dir {}", opts.work_dir.display()))?;
        Ok(Self {
            inner: Arc::new(Inner::new(opts)),
        })
    }

    pub fn add_progress_sink(&self, sink: Arc<dyn ProgressSink>) {
        self.inner.sinks.lock_unpoisoned().push(sink);
    }

    pub fn recent_profiles(&self) -> RecentProfiles {
        self.inner
            .profiles
            .as_ref()
            .map(|store| store.load())
            .unwrap_or_default()
    }

    fn record_profile(&self, config: &UploadConfig) {
        if let Some(store) = self.inner.profiles.as_ref()
            && let Err(err) = store.record(config)
        {
            warn!("failed to persist recent profile: {err:#}");
        }
    }

    fn spawn_job(&self, name: String, body: impl FnOnce() + Send + 'static) {
        if let Err(err) = thread::Builder::new().name(name.clone()).spawn(body) {
            warn!(job = %name, "failed to spawn job thread: {err:#}");
        }
    }

    /// Create an import job for an uploaded bundle and start it. Fails
    /// synchronously on config errors and when the concurrency budget is
    /// exhausted; everything later is reported through the job snapshot.
    pub fn start_import(&self, upload: UploadRequest) -> Result<String, EngineError> {
        let conn = &upload.config.connection;
        let resolved = resolve_endpoints(&conn.endpoint, &conn.tenant_id)
            .map_err(|err| EngineError::BadRequest(format!("{err:#}")))?;
        let slot = acquire_slot(&self.inner).ok_or(EngineError::ConcurrencyLimit)?;
        self.record_profile(&upload.config);

        let id = allocate_job_id(&self.inner, "import");
        let mut job = ImportJob::new(
            id.clone(),
            upload.bundle_path.to_string_lossy().into_owned(),
            Some(upload.original_name),
            upload.size_bytes,
            upload.config,
        );
        job.import_url = resolved.import_url;
        job.query_url = resolved.query_url;
        self.inner
            .imports
            .write_unpoisoned()
            .insert(id.clone(), job);

        let inner = Arc::clone(&self.inner);
        let job_id = id.clone();
        self.spawn_job(id.clone(), move || {
            import_runner::run_import_job(&inner, &job_id, slot, 0);
        });
        Ok(id)
    }

    /// Restart a failed import from its committed offset. Requires the
    /// engine to have marked the job resumable.
    pub fn resume_import(&self, job_id: &str) -> Result<(), EngineError> {
        let job = snapshot_import(&self.inner, job_id)
            .ok_or_else(|| EngineError::NotFound(job_id.to_string()))?;
        if job.state != JobState::Failed || !job.resume_ready {
            return Err(EngineError::NotResumable(job_id.to_string()));
        }
        let slot = acquire_slot(&self.inner).ok_or(EngineError::ConcurrencyLimit)?;

        // Guard against double resume before the thread takes over.
        drop_cancel_flag(&self.inner, job_id);
        update_import(&self.inner, job_id, |job| {
            job.state = JobState::Queued;
            job.set_stage(Stage::Queued);
            job.percent = 0.0;
            job.error = None;
            job.resume_ready = false;
        });

        let inner = Arc::clone(&self.inner);
        let id = job_id.to_string();
        let offset = job.resume_offset;
        self.spawn_job(format!("{job_id}-resume"), move || {
            import_runner::run_import_job(&inner, &id, slot, offset);
        });
        Ok(())
    }

    pub fn import_status(&self, job_id: &str) -> Option<ImportJob> {
        snapshot_import(&self.inner, job_id)
    }

    pub fn list_import_jobs(&self) -> Vec<ImportJob> {
        let mut jobs: Vec<ImportJob> = self.inner.imports.read_unpoisoned().values().cloned().collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        jobs
    }

    /// Start an export job against the configured cluster.
    pub fn start_export(&self, config: ExportConfig) -> Result<String, EngineError> {
        let conn = &config.connection;
        let resolved = resolve_endpoints(&conn.endpoint, &conn.tenant_id)
            .map_err(|err| EngineError::BadRequest(format!("{err:#}")))?;
        let exporter = HttpVmExporter::new(conn.clone(), resolved.export_url())
            .map_err(|err| EngineError::BadRequest(format!("{err:#}")))?;
        self.start_export_with(config, Arc::new(exporter))
    }

    /// Start an export job with an explicit VM client collaborator.
    pub fn start_export_with(
        &self,
        config: ExportConfig,
        exporter: Arc<dyn VmExporter>,
    ) -> Result<String, EngineError> {
        if partition_batches(config.time_range, config.batching.window_seconds()) == 0 {
            return Err(EngineError::BadRequest("export time range is empty".to_string()));
        }
        let slot = acquire_slot(&self.inner).ok_or(EngineError::ConcurrencyLimit)?;
        self.record_profile(&UploadConfig {
            connection: config.connection.clone(),
            batching: config.batching.clone(),
            ..UploadConfig::default()
        });

        let id = allocate_job_id(&self.inner, "export");
        let staging_path = config
            .staging_file
            .clone()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.inner.opts.work_dir.join(format!("{id}-staging.jsonl")));
        let job = ExportJob::new(
            id.clone(),
            staging_path.to_string_lossy().into_owned(),
            config,
        );
        self.inner
            .exports
            .write_unpoisoned()
            .insert(id.clone(), job);
        self.inner
            .exporters
            .lock_unpoisoned()
            .insert(id.clone(), Arc::clone(&exporter));

        let inner = Arc::clone(&self.inner);
        let job_id = id.clone();
        self.spawn_job(id.clone(), move || {
            export_runner::run_export_job(&inner, &job_id, slot, exporter);
        });
        Ok(id)
    }

    /// Restart a canceled or failed export from its last completed batch,
    /// reusing the same staging file.
    pub fn resume_export(&self, job_id: &str) -> Result<(), EngineError> {
        let job = snapshot_export(&self.inner, job_id)
            .ok_or_else(|| EngineError::NotFound(job_id.to_string()))?;
        if !matches!(job.state, JobState::Canceled | JobState::Failed) {
            return Err(EngineError::NotResumable(job_id.to_string()));
        }
        let exporter = {
            let exporters = self.inner.exporters.lock_unpoisoned();
            exporters.get(job_id).cloned()
        };
        let exporter = match exporter {
            Some(exporter) => exporter,
            None => {
                let conn = &job.config.connection;
                let resolved = resolve_endpoints(&conn.endpoint, &conn.tenant_id)
                    .map_err(|err| EngineError::BadRequest(format!("{err:#}")))?;
                Arc::new(
                    HttpVmExporter::new(conn.clone(), resolved.export_url())
                        .map_err(|err| EngineError::BadRequest(format!("{err:#}")))?,
                )
            }
        };
        let slot = acquire_slot(&self.inner).ok_or(EngineError::ConcurrencyLimit)?;

        drop_cancel_flag(&self.inner, job_id);
        let resume_from = job.completed_batches;
        update_export(&self.inner, job_id, |job| {
            job.state = JobState::Queued;
            job.error = None;
            job.resume_from = resume_from;
            job.config.resume_from_batch = resume_from;
        });

        let inner = Arc::clone(&self.inner);
        let id = job_id.to_string();
        self.spawn_job(format!("{job_id}-resume"), move || {
            export_runner::run_export_job(&inner, &id, slot, exporter);
        });
        Ok(())
    }

    pub fn export_status(&self, job_id: &str) -> Option<ExportJob> {
        snapshot_export(&self.inner, job_id)
    }

    pub fn list_export_jobs(&self) -> Vec<ExportJob> {
        let mut jobs: Vec<ExportJob> = self.inner.exports.read_unpoisoned().values().cloned().collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        jobs
    }

    /// Ask a running job to stop at its next safe point. Canceling a
    /// terminal job is a no-op that still reports success; only unknown
    /// ids return `false`.
    pub fn cancel_job(&self, job_id: &str) -> bool {
        if let Some(job) = snapshot_import(&self.inner, job_id) {
            if !job.state.is_terminal() {
                cancel_flag_for(&self.inner, job_id).store(true, Ordering::SeqCst);
            }
            return true;
        }
        if let Some(job) = snapshot_export(&self.inner, job_id) {
            if !job.state.is_terminal() {
                cancel_flag_for(&self.inner, job_id).store(true, Ordering::SeqCst);
            }
            return true;
        }
        false
    }

    /// Preflight: open a bundle, probe the target for retention and label
    /// limits, and run one analyzer pass. The extracted temp file is
    /// removed before returning.
    pub fn analyze_bundle(
        &self,
        bundle_path: &Path,
        original_name: &str,
        config: &UploadConfig,
        mode: AnalysisMode,
    ) -> Result<AnalysisSummary> {
        let size_bytes = fs::metadata(bundle_path)
            .with_context(|| format!("failed to stat {}", bundle_path.display()))?
            .len();
        let mut prepared =
            bundle::prepare(bundle_path, original_name, size_bytes, &self.inner.opts.work_dir)?;

        let conn = &config.connection;
        let (cutoff_ms, discovered_limit) = match resolve_endpoints(&conn.endpoint, &conn.tenant_id)
        {
            Ok(resolved) => match build_client(conn, PROBE_HTTP_TIMEOUT) {
                Ok(client) => {
                    let cutoff = if config.ingestion.drop_old {
                        discover_retention_cutoff_ms(&client, &resolved, conn)
                    } else {
                        0
                    };
                    (cutoff, discover_max_labels_limit(&client, &resolved, conn))
                }
                Err(_) => (0, 0),
            },
            Err(_) => (0, 0),
        };
        // A manual override always replaces the discovered limit.
        let max_labels_limit = if config.ingestion.max_labels_override > 0 {
            config.ingestion.max_labels_override
        } else {
            discovered_limit
        };

        let result = analyze(&prepared.metrics_path, &AnalyzeOptions {
            mode,
            sample_limit: 0,
            cutoff_ms,
            shift_ms: config.ingestion.time_shift_ms,
            max_labels_limit,
            metadata: prepared.metadata.clone(),
        });
        prepared.cleanup.invoke();
        result
    }
}
