use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::ferry_core::domain::{
    ExportJob, ImportJob, ProgressEvent, ProgressSink, now_ms,
};
use crate::ferry_core::profiles::ProfileStore;
use crate::ferry_core::vmclient::VmExporter;
use crate::sync_ext::{MutexExt, RwLockExt};

/// Engine construction knobs.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Running-job budget shared by imports and exports.
    pub max_concurrent_jobs: usize,
    /// Scratch directory for extracted bundles and staging files.
    pub work_dir: PathBuf,
    /// Recent-profiles file; `None` disables profile persistence.
    pub profiles_path: Option<PathBuf>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 1,
            work_dir: std::env::temp_dir().join("vmferry"),
            profiles_path: None,
        }
    }
}

pub(crate) struct Inner {
    pub(crate) opts: EngineOptions,
    pub(crate) imports: RwLock<HashMap<String, ImportJob>>,
    pub(crate) exports: RwLock<HashMap<String, ExportJob>>,
    pub(crate) cancel_flags: Mutex<HashMap<String, Arc<AtomicBool>>>,
    /// Exporter collaborators pinned per export job so resume reuses the
    /// same client a job was started with.
    pub(crate) exporters: Mutex<HashMap<String, Arc<dyn VmExporter>>>,
    pub(crate) running: Mutex<usize>,
    pub(crate) next_job_id: AtomicU64,
    pub(crate) sinks: Mutex<Vec<Arc<dyn ProgressSink>>>,
    pub(crate) profiles: Option<ProfileStore>,
}

impl Inner {
    pub(crate) fn new(opts: EngineOptions) -> Self {
        let profiles = opts.profiles_path.clone().map(ProfileStore::new);
        Self {
            opts,
            imports: RwLock::new(HashMap::new()),
            exports: RwLock::new(HashMap::new()),
            cancel_flags: Mutex::new(HashMap::new()),
            exporters: Mutex::new(HashMap::new()),
            running: Mutex::new(0),
            next_job_id: AtomicU64::new(1),
            sinks: Mutex::new(Vec::new()),
            profiles,
        }
    }
}

pub(crate) fn allocate_job_id(inner: &Inner, prefix: &str) -> String {
    let seq = inner.next_job_id.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}-{seq}")
}

/// Guard for one unit of the concurrency budget; released on drop.
pub(crate) struct RunningSlot {
    inner: Arc<Inner>,
}

impl Drop for RunningSlot {
    fn drop(&mut self) {
        let mut running = self.inner.running.lock_unpoisoned();
        *running = running.saturating_sub(1);
    }
}

/// Claim one running-job slot, failing synchronously when the budget is
/// exhausted.
pub(crate) fn acquire_slot(inner: &Arc<Inner>) -> Option<RunningSlot> {
    let mut running = inner.running.lock_unpoisoned();
    if *running >= inner.opts.max_concurrent_jobs.max(1) {
        return None;
    }
    *running += 1;
    Some(RunningSlot {
        inner: Arc::clone(inner),
    })
}

pub(crate) fn cancel_flag_for(inner: &Inner, job_id: &str) -> Arc<AtomicBool> {
    let mut flags = inner.cancel_flags.lock_unpoisoned();
    Arc::clone(
        flags
            .entry(job_id.to_string())
            .or_insert_with(|| Arc::new(AtomicBool::new(false))),
    )
}

pub(crate) fn drop_cancel_flag(inner: &Inner, job_id: &str) {
    inner.cancel_flags.lock_unpoisoned().remove(job_id);
}

/// The only mutation primitive pipelines may use for import jobs.
pub(crate) fn update_import<F>(inner: &Inner, job_id: &str, mutate: F)
where
    F: FnOnce(&mut ImportJob),
{
    let mut jobs = inner.imports.write_unpoisoned();
    if let Some(job) = jobs.get_mut(job_id) {
        mutate(job);
        job.updated_at = now_ms();
    }
}

pub(crate) fn update_export<F>(inner: &Inner, job_id: &str, mutate: F)
where
    F: FnOnce(&mut ExportJob),
{
    let mut jobs = inner.exports.write_unpoisoned();
    if let Some(job) = jobs.get_mut(job_id) {
        mutate(job);
        job.updated_at = now_ms();
    }
}

/// Deep-copied snapshot; callers never see live registry state.
pub(crate) fn snapshot_import(inner: &Inner, job_id: &str) -> Option<ImportJob> {
    inner.imports.read_unpoisoned().get(job_id).cloned()
}

pub(crate) fn snapshot_export(inner: &Inner, job_id: &str) -> Option<ExportJob> {
    inner.exports.read_unpoisoned().get(job_id).cloned()
}

pub(crate) fn publish_progress(inner: &Inner, event: &ProgressEvent) {
    let sinks = inner.sinks.lock_unpoisoned().clone();
    for sink in &sinks {
        sink.publish(event);
    }
}
