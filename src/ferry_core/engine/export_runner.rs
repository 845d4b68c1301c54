use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use super::state::{
    Inner, RunningSlot, cancel_flag_for, drop_cancel_flag, publish_progress, snapshot_export,
    update_export,
};
use crate::ferry_core::domain::{JobState, ProgressEvent};
use crate::ferry_core::export_stream::{ExportRun, execute_export, partition_batches};
use crate::ferry_core::vmclient::VmExporter;
use crate::sync_ext::MutexExt;

/// Export job lifecycle around the streaming engine: batch progress
/// bookkeeping, cancel → `canceled` with a resume point, completion →
/// bundle attachment.
pub(super) fn run_export_job(
    inner: &Arc<Inner>,
    job_id: &str,
    _slot: RunningSlot,
    exporter: Arc<dyn VmExporter>,
) {
    let cancel = cancel_flag_for(inner, job_id);
    let Some(job) = snapshot_export(inner, job_id) else {
        return;
    };
    let cfg = job.config.clone();
    let staging_path = PathBuf::from(&job.staging_path);

    let total_batches = partition_batches(cfg.time_range, cfg.batching.window_seconds());
    update_export(inner, job_id, |job| {
        job.state = JobState::Running;
        job.total_batches = total_batches;
        job.completed_batches = cfg.resume_from_batch.min(total_batches);
        if total_batches > 0 {
            job.progress = job.completed_batches as f64 / total_batches as f64;
        }
    });
    info!(
        job = job_id,
        total_batches,
        resume_from = cfg.resume_from_batch,
        "export started"
    );

    let mut duration_sum = 0.0f64;
    let mut batches_this_run = 0u64;
    let outcome = execute_export(
        job_id,
        &cfg,
        exporter.as_ref(),
        &staging_path,
        &cancel,
        &mut |progress| {
            batches_this_run += 1;
            duration_sum += progress.duration_seconds;
            let average = duration_sum / batches_this_run as f64;
            update_export(inner, job_id, |job| {
                job.completed_batches = progress.batch_index + 1;
                job.metrics_processed += progress.metrics;
                job.progress = job.completed_batches as f64 / progress.total_batches as f64;
                job.last_batch_duration_seconds = progress.duration_seconds;
                job.average_batch_seconds = average;
            });
            publish_progress(inner, &ProgressEvent::ExportBatch(progress.clone()));
        },
    );

    match outcome {
        Ok(ExportRun::Completed(result)) => {
            update_export(inner, job_id, |job| {
                job.state = JobState::Completed;
                job.progress = 1.0;
                job.result = Some(result.clone());
            });
            inner.exporters.lock_unpoisoned().remove(job_id);
            info!(
                job = job_id,
                archive = %result.archive_path,
                sha256 = %result.sha256,
                "export completed"
            );
        }
        Ok(ExportRun::Canceled { completed_batches }) => {
            update_export(inner, job_id, |job| {
                job.state = JobState::Canceled;
                job.completed_batches = completed_batches;
                job.resume_from = completed_batches;
            });
            info!(job = job_id, completed_batches, "export canceled; staging kept");
        }
        Err(err) => {
            warn!(job = job_id, "export failed: {err:#}");
            update_export(inner, job_id, |job| {
                job.state = JobState::Failed;
                job.resume_from = job.completed_batches;
                job.error = Some(format!("{err:#}"));
            });
        }
    }
    drop_cancel_flag(inner, job_id);
}
