use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use anyhow::{Context, Result, bail};
use chrono::{SecondsFormat, TimeZone, Utc};

use crate::ferry_core::bundle;
use crate::ferry_core::domain::{
    BatchProgress, BundleMetadata, ExportConfig, ExportResult, MetaTimeRange, TimeRangeMs,
};
use crate::ferry_core::obfuscate::Obfuscator;
use crate::ferry_core::vmclient::VmExporter;

/// Outcome of one export run. A cancel between batches leaves the staging
/// file intact and reports how far it got.
#[derive(Debug)]
pub enum ExportRun {
    Completed(ExportResult),
    Canceled { completed_batches: u64 },
}

/// Number of whole windows covering `[start, end)`.
pub fn partition_batches(range: TimeRangeMs, window_seconds: u64) -> u64 {
    let span_ms = range.end_ms.saturating_sub(range.start_ms);
    if span_ms <= 0 {
        return 0;
    }
    let window_ms = (window_seconds.max(1) as i64).saturating_mul(1000);
    (span_ms as u64).div_ceil(window_ms as u64)
}

fn rfc3339(ms: i64) -> String {
    Utc.timestamp_millis_opt(ms)
        .single()
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_default()
}

fn job_label_of(line: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(line).ok()?;
    value
        .get("metric")?
        .get("job")?
        .as_str()
        .map(str::to_string)
}

/// Stream one export job: partition the configured range into windows,
/// pull each window through the VM client, obfuscate, and append to the
/// staging file. Batches are appended strictly in time order; a batch is
/// only reported complete after its bytes are flushed.
pub fn execute_export(
    job_id: &str,
    cfg: &ExportConfig,
    exporter: &dyn VmExporter,
    staging_path: &Path,
    cancel: &AtomicBool,
    progress: &mut dyn FnMut(&BatchProgress),
) -> Result<ExportRun> {
    let window_seconds = cfg.batching.window_seconds();
    let total_batches = partition_batches(cfg.time_range, window_seconds);
    if total_batches == 0 {
        bail!("export time range is empty");
    }
    if cfg.resume_from_batch > total_batches {
        bail!(
            "resume batch {} is past the end of the range ({total_batches} batches)",
            cfg.resume_from_batch
        );
    }

    // A fresh run starts a clean staging file; a resumed run trusts the
    // bytes already present for the skipped batches.
    let staging = fs::OpenOptions::new()
        .create(true)
        .append(cfg.resume_from_batch > 0)
        .truncate(cfg.resume_from_batch == 0)
        .write(true)
        .open(staging_path)
        .with_context(|| format!("failed to open staging file {}", staging_path.display()))?;
    let mut writer = BufWriter::new(staging);

    let mut obfuscator = cfg
        .obfuscate
        .then(|| Obfuscator::new(cfg.obfuscate_labels.iter().cloned()));
    let mut jobs_seen: Vec<String> = Vec::new();
    let mut metrics_count = 0u64;
    let window_ms = (window_seconds as i64).saturating_mul(1000);

    for batch_index in cfg.resume_from_batch..total_batches {
        if cancel.load(Ordering::SeqCst) {
            writer
                .flush()
                .context("failed to flush staging file on cancel")?;
            return Ok(ExportRun::Canceled {
                completed_batches: batch_index,
            });
        }

        let batch_start = cfg.time_range.start_ms + (batch_index as i64) * window_ms;
        let batch_end = (batch_start + window_ms).min(cfg.time_range.end_ms);
        let started = Instant::now();

        let batch_metrics = exporter.export_window(
            &cfg.match_expr,
            batch_start,
            batch_end,
            &mut |line| {
                let staged = match obfuscator.as_mut() {
                    Some(obfuscator) => obfuscator.obfuscate_line(line)?,
                    None => {
                        if let Some(job) = job_label_of(line)
                            && !jobs_seen.contains(&job)
                        {
                            jobs_seen.push(job);
                        }
                        line.to_string()
                    }
                };
                writer
                    .write_all(staged.as_bytes())
                    .context("failed to append to staging file")?;
                writer
                    .write_all(b"\n")
                    .context("failed to append to staging file")
            },
        )?;
        writer.flush().context("failed to flush staging file")?;

        metrics_count += batch_metrics;
        progress(&BatchProgress {
            job_id: job_id.to_string(),
            batch_index,
            total_batches,
            metrics: batch_metrics,
            duration_seconds: started.elapsed().as_secs_f64(),
            time_range: TimeRangeMs {
                start_ms: batch_start,
                end_ms: batch_end,
            },
        });
    }
    drop(writer);

    let mut jobs = match obfuscator.as_ref() {
        Some(obfuscator) => obfuscator.jobs_seen(),
        None => {
            jobs_seen.sort();
            jobs_seen
        }
    };
    jobs.dedup();

    let export_id = job_id.to_string();
    let metadata = BundleMetadata {
        export_id: export_id.clone(),
        time_range: Some(MetaTimeRange {
            start: rfc3339(cfg.time_range.start_ms),
            end: rfc3339(cfg.time_range.end_ms),
        }),
        metrics_count,
        jobs: jobs.clone(),
    };

    let output_dir = cfg
        .output_dir
        .as_deref()
        .map(Path::new)
        .or_else(|| staging_path.parent())
        .unwrap_or_else(|| Path::new("."));
    let archive_path = output_dir.join(format!("{export_id}.zip"));
    let written = bundle::write_bundle(staging_path, &metadata, &archive_path)?;

    Ok(ExportRun::Completed(ExportResult {
        export_id,
        archive_path: written.archive_path.to_string_lossy().into_owned(),
        sha256: written.sha256,
        size_bytes: written.size_bytes,
        metrics_count,
        time_range: MetaTimeRange {
            start: rfc3339(cfg.time_range.start_ms),
            end: rfc3339(cfg.time_range.end_ms),
        },
        jobs,
    }))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tempfile::tempdir;

    use super::*;
    use crate::ferry_core::domain::BatchingConfig;
    use crate::sync_ext::MutexExt;

    /// Deterministic in-memory stand-in for the VM export endpoint.
    struct FakeExporter {
        windows: Mutex<Vec<(i64, i64)>>,
        series_per_window: u64,
    }

    impl FakeExporter {
        fn new(series_per_window: u64) -> Self {
            Self {
                windows: Mutex::new(Vec::new()),
                series_per_window,
            }
        }
    }

    impl VmExporter for FakeExporter {
        fn export_window(
            &self,
            _match_expr: &str,
            start_ms: i64,
            end_ms: i64,
            sink: &mut dyn FnMut(&str) -> Result<()>,
        ) -> Result<u64> {
            let mut windows = self.windows.lock_unpoisoned();
            windows.push((start_ms, end_ms));
            for i in 0..self.series_per_window {
                sink(&format!(
                    "{{\"metric\":{{\"__name__\":\"up\",\"job\":\"node-exporter\",\"instance\":\"10.0.0.{i}:9100\"}},\"values\":[1],\"timestamps\":[{start_ms}]}}"
                ))?;
            }
            Ok(self.series_per_window)
        }
    }

    fn config(start_ms: i64, end_ms: i64, window_seconds: u64) -> ExportConfig {
        ExportConfig {
            time_range: TimeRangeMs { start_ms, end_ms },
            batching: BatchingConfig {
                metric_step_seconds: 60,
                batch_window_seconds: Some(window_seconds),
            },
            ..ExportConfig::default()
        }
    }

    #[test]
    fn range_partitioning_rounds_up() {
        let range = TimeRangeMs {
            start_ms: 0,
            end_ms: 10 * 60_000,
        };
        assert_eq!(partition_batches(range, 600), 1);
        assert_eq!(partition_batches(range, 240), 3);
        assert_eq!(
            partition_batches(TimeRangeMs { start_ms: 5, end_ms: 5 }, 60),
            0
        );
    }

    #[test]
    fn batches_cover_the_range_in_order_and_build_a_bundle() {
        let dir = tempdir().expect("temp dir");
        let staging = dir.path().join("staging.jsonl");
        let exporter = FakeExporter::new(2);
        let cfg = config(0, 150_000, 60);
        let cancel = AtomicBool::new(false);

        let mut seen: Vec<BatchProgress> = Vec::new();
        let run = execute_export(
            "export-1",
            &cfg,
            &exporter,
            &staging,
            &cancel,
            &mut |progress| seen.push(progress.clone()),
        )
        .expect("export");

        let result = match run {
            ExportRun::Completed(result) => result,
            ExportRun::Canceled { .. } => panic!("unexpected cancel"),
        };
        assert_eq!(result.metrics_count, 6);
        assert_eq!(result.export_id, "export-1");
        assert_eq!(result.time_range.start, "1970-01-01T00:00:00Z");
        assert_eq!(seen.len(), 3);
        assert!(seen.iter().enumerate().all(|(i, p)| p.batch_index == i as u64));
        assert_eq!(seen[2].time_range.end_ms, 150_000, "last window is clamped");

        let windows = exporter.windows.lock_unpoisoned().clone();
        assert_eq!(windows, vec![(0, 60_000), (60_000, 120_000), (120_000, 150_000)]);

        // Obfuscation is on by default: hosts are masked, jobs tokenized.
        let staged = fs::read_to_string(&staging).expect("read staging");
        assert!(staged.contains("777.777."));
        assert!(staged.contains("node-job-1"));
        assert!(!staged.contains("10.0.0."));
        assert_eq!(result.jobs, vec!["node-job-1".to_string()]);

        // The archive round-trips through the bundle codec.
        let prepared = bundle::prepare(
            Path::new(&result.archive_path),
            "export-1.zip",
            result.size_bytes,
            dir.path(),
        )
        .expect("reopen archive");
        let meta = prepared.metadata.expect("metadata present");
        assert_eq!(meta.export_id, "export-1");
        assert_eq!(meta.metrics_count, 6);
        assert_eq!(meta.jobs, vec!["node-job-1".to_string()]);
    }

    #[test]
    fn cancel_between_batches_keeps_the_staging_file() {
        let dir = tempdir().expect("temp dir");
        let staging = dir.path().join("staging.jsonl");
        let exporter = FakeExporter::new(1);
        let cfg = config(0, 180_000, 60);
        let cancel = AtomicBool::new(false);

        let run = execute_export("export-2", &cfg, &exporter, &staging, &cancel, &mut |p| {
            if p.batch_index == 0 {
                cancel.store(true, Ordering::SeqCst);
            }
        })
        .expect("export");

        match run {
            ExportRun::Canceled { completed_batches } => assert_eq!(completed_batches, 1),
            ExportRun::Completed(_) => panic!("must cancel"),
        }
        let staged = fs::read_to_string(&staging).expect("staging survives cancel");
        assert_eq!(staged.lines().count(), 1);
    }

    #[test]
    fn resume_skips_the_already_completed_batches() {
        let dir = tempdir().expect("temp dir");
        let staging = dir.path().join("staging.jsonl");
        fs::write(&staging, "{\"metric\":{\"__name__\":\"up\"},\"values\":[1],\"timestamps\":[0]}\n")
            .expect("seed staging");

        let exporter = FakeExporter::new(1);
        let mut cfg = config(0, 180_000, 60);
        cfg.resume_from_batch = 1;
        cfg.obfuscate = false;
        let cancel = AtomicBool::new(false);

        let run = execute_export("export-3", &cfg, &exporter, &staging, &cancel, &mut |_| {})
            .expect("export");
        assert!(matches!(run, ExportRun::Completed(_)));

        let windows = exporter.windows.lock_unpoisoned().clone();
        assert_eq!(
            windows,
            vec![(60_000, 120_000), (120_000, 180_000)],
            "the first window must be skipped"
        );
        let staged = fs::read_to_string(&staging).expect("read staging");
        assert_eq!(staged.lines().count(), 3, "seeded batch plus two new ones");
    }

    #[test]
    fn empty_ranges_are_rejected() {
        let dir = tempdir().expect("temp dir");
        let staging = dir.path().join("staging.jsonl");
        let exporter = FakeExporter::new(1);
        let cfg = config(1000, 1000, 60);
        let cancel = AtomicBool::new(false);
        let err = execute_export("export-4", &cfg, &exporter, &staging, &cancel, &mut |_| {})
            .expect_err("empty range");
        assert!(err.to_string().contains("empty"));
    }
}
