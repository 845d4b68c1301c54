use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use super::state::{
    Inner, RunningSlot, cancel_flag_for, drop_cancel_flag, publish_progress, snapshot_import,
    update_import,
};
use crate::ferry_core::bundle;
use crate::ferry_core::domain::{JobState, ProgressEvent, Stage};
use crate::ferry_core::endpoint::ResolvedEndpoints;
use crate::ferry_core::httpc::{PROBE_HTTP_TIMEOUT, build_client};
use crate::ferry_core::import_stream::{StreamConfig, TargetClient, stream_import};
use crate::ferry_core::retention::discover_retention_cutoff_ms;
use crate::ferry_core::verify::verify_import;

/// Upper bound on user-visible error strings.
const ERROR_MESSAGE_CAP: usize = 1024;

fn truncate_error(message: String) -> String {
    if message.len() <= ERROR_MESSAGE_CAP {
        message
    } else {
        let mut cut = ERROR_MESSAGE_CAP;
        while !message.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}…", &message[..cut])
    }
}

fn remove_job_artifacts(inner: &Inner, job_id: &str) {
    let Some(job) = snapshot_import(inner, job_id) else {
        return;
    };
    if let Some(metrics_path) = job.metrics_path.as_deref()
        && metrics_path != job.bundle_path
    {
        let _ = fs::remove_file(metrics_path);
    }
    let _ = fs::remove_file(&job.bundle_path);
}

fn fail_import(inner: &Inner, job_id: &str, message: String, resumable: bool, processed: u64) {
    warn!(job = job_id, resumable, "import failed: {message}");
    // Artifacts go first so a terminal snapshot never precedes cleanup.
    if !resumable {
        remove_job_artifacts(inner, job_id);
    }
    update_import(inner, job_id, |job| {
        job.state = JobState::Failed;
        job.set_stage(Stage::Failed);
        job.percent = 100.0;
        job.error = Some(truncate_error(message));
        if resumable {
            job.resume_offset = processed;
            job.resume_ready = true;
        } else {
            job.cleanup_pending = true;
        }
    });
    drop_cancel_flag(inner, job_id);
}

/// Reuse the extracted metrics file from a previous attempt when it is
/// still on disk; offsets stay valid because extraction is deterministic.
fn reusable_metrics(inner: &Inner, job_id: &str, start_offset: u64) -> Option<(PathBuf, u64)> {
    if start_offset == 0 {
        return None;
    }
    let job = snapshot_import(inner, job_id)?;
    let path = PathBuf::from(job.metrics_path?);
    let len = fs::metadata(&path).ok()?.len();
    Some((path, len))
}

/// Import job state machine: extract, probe retention, stream chunks,
/// verify, finish. Percent runs from 5 to 85 while streaming, holds at 92
/// while verifying, and lands on 100 in every terminal state.
pub(super) fn run_import_job(
    inner: &Arc<Inner>,
    job_id: &str,
    _slot: RunningSlot,
    start_offset: u64,
) {
    let cancel = cancel_flag_for(inner, job_id);
    let Some(job) = snapshot_import(inner, job_id) else {
        return;
    };
    let cfg = job.config.clone();
    let conn = cfg.connection.clone();
    let resolved = ResolvedEndpoints {
        import_url: job.import_url.clone(),
        query_url: job.query_url.clone(),
    };

    update_import(inner, job_id, |job| {
        job.state = JobState::Running;
        job.set_stage(Stage::Extracting);
        job.percent = 2.0;
    });

    // A cancel before any chunk committed is a plain failure; there is no
    // offset worth resuming from.
    if cancel.load(std::sync::atomic::Ordering::SeqCst) {
        fail_import(inner, job_id, "import canceled".to_string(), false, 0);
        return;
    }

    let (metrics_path, inflated_bytes, metadata) =
        match reusable_metrics(inner, job_id, start_offset) {
            Some((path, len)) => (path, len, None),
            None => {
                let original_name = job.remote_path.clone().unwrap_or_default();
                match bundle::prepare(
                    Path::new(&job.bundle_path),
                    &original_name,
                    job.source_bytes,
                    &inner.opts.work_dir,
                ) {
                    Ok(mut prepared) => {
                        let path = prepared
                            .cleanup
                            .disarm()
                            .unwrap_or_else(|| prepared.metrics_path.clone());
                        (path, prepared.extracted_bytes, prepared.metadata.take())
                    }
                    Err(err) => {
                        fail_import(inner, job_id, format!("bundle preparation failed: {err:#}"), false, 0);
                        return;
                    }
                }
            }
        };

    let chunks_total = inflated_bytes.div_ceil(cfg.max_chunk_bytes.max(1) as u64).max(1);
    let range_pinned = metadata.as_ref().is_some_and(|m| m.time_range.is_some());
    update_import(inner, job_id, |job| {
        job.metrics_path = Some(metrics_path.to_string_lossy().into_owned());
        job.inflated_bytes = inflated_bytes;
        job.chunks_total = chunks_total;
    });

    let probe_client = match build_client(&conn, PROBE_HTTP_TIMEOUT) {
        Ok(client) => client,
        Err(err) => {
            fail_import(inner, job_id, format!("{err:#}"), false, 0);
            return;
        }
    };
    let cutoff_ms = if cfg.ingestion.drop_old {
        discover_retention_cutoff_ms(&probe_client, &resolved, &conn)
    } else {
        0
    };

    let target = match TargetClient::new(conn.clone(), resolved.import_url.clone()) {
        Ok(target) => target,
        Err(err) => {
            fail_import(inner, job_id, format!("{err:#}"), false, 0);
            return;
        }
    };

    // A resumed job keeps accumulating into the summary of its earlier
    // attempts; verification later covers pre-failure chunks too.
    let mut summary = job.summary.clone().unwrap_or_default();
    summary.source_bytes = job.source_bytes;
    summary.inflated_bytes = inflated_bytes;
    summary.range_pinned = summary.range_pinned || range_pinned;

    update_import(inner, job_id, |job| {
        job.set_stage(Stage::Importing);
        job.percent = 5.0;
    });
    info!(
        job = job_id,
        offset = start_offset,
        chunks_total,
        "streaming bundle to {}",
        resolved.import_url
    );

    let stream_cfg = StreamConfig {
        target: &target,
        cancel: &cancel,
        max_chunk_bytes: cfg.max_chunk_bytes,
        cutoff_ms,
        shift_ms: cfg.ingestion.time_shift_ms,
        drop_labels: cfg.ingestion.sanitized_drop_labels(),
        start_offset,
    };
    let outcome = stream_import(&metrics_path, &stream_cfg, &mut summary, &mut |chunks| {
        let percent = 5.0 + 80.0 * (chunks.min(chunks_total) as f64) / (chunks_total as f64);
        update_import(inner, job_id, |job| {
            job.chunks_completed = chunks;
            job.percent = percent.min(85.0);
        });
        publish_progress(
            inner,
            &ProgressEvent::ImportChunk {
                job_id: job_id.to_string(),
                chunks_completed: chunks,
                chunks_total,
            },
        );
    });

    let processed = summary.processed_bytes;
    update_import(inner, job_id, |job| {
        job.summary = Some(summary.clone());
    });

    match outcome {
        Ok(_) => {}
        Err(err) => {
            let resumable = err.is_resumable();
            fail_import(inner, job_id, format!("{err:#}"), resumable, processed);
            return;
        }
    }

    update_import(inner, job_id, |job| {
        job.set_stage(Stage::Verifying);
        job.percent = 92.0;
    });
    let verification = verify_import(&probe_client, &conn, &resolved.query_url, &summary, &cancel);

    remove_job_artifacts(inner, job_id);
    update_import(inner, job_id, |job| {
        job.state = JobState::Completed;
        job.set_stage(Stage::Completed);
        job.percent = 100.0;
        job.verification = Some(verification.clone());
        job.cleanup_pending = true;
    });
    drop_cancel_flag(inner, job_id);
    info!(
        job = job_id,
        points = summary.points,
        chunks = summary.chunks,
        verified = verification.verified,
        "import completed"
    );
}
