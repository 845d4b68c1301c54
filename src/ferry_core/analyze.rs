use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io::BufReader;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use crate::ferry_core::domain::{
    AnalysisSummary, BitSet, BundleMetadata, DEFAULT_SAMPLE_LIMIT, LABEL_STATS_TOP_N,
    LABEL_UNIVERSE_CAP, LabelFrequency, MAX_LINE_BYTES, SIMULATION_SERIES_CAP,
};
use crate::ferry_core::fsio::{LimitedLineReader, LineRead};
use crate::ferry_core::normalize::{
    LineOutcome, NormalizeOptions, normalize_line, parse_metric_line,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AnalysisMode {
    /// Stop after `sample_limit` lines; flag `sample_cut` when more exist.
    #[default]
    Sample,
    /// Read to EOF.
    Full,
}

#[derive(Debug, Clone, Default)]
pub struct AnalyzeOptions {
    pub mode: AnalysisMode,
    /// Lines scanned in sample mode; 0 selects the default.
    pub sample_limit: u64,
    pub cutoff_ms: i64,
    pub shift_ms: i64,
    /// Active label limit on the target; 0 means unknown.
    pub max_labels_limit: u32,
    pub metadata: Option<BundleMetadata>,
}

fn rfc3339_ms(raw: &str) -> Option<i64> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.timestamp_millis())
}

fn pinned_range(metadata: Option<&BundleMetadata>) -> Option<(i64, i64)> {
    let range = metadata?.time_range.as_ref()?;
    Some((rfc3339_ms(&range.start)?, rfc3339_ms(&range.end)?))
}

fn push_warnings(summary: &mut AnalysisSummary, cutoff_ms: i64) {
    let now_ms = Utc::now().timestamp_millis();
    if cutoff_ms > 0 {
        if summary.start_ms.is_some_and(|start| start < cutoff_ms) {
            summary
                .warnings
                .push("time range starts before the target retention cutoff".to_string());
        }
        if let (Some(start), Some(end)) = (summary.start_ms, summary.end_ms)
            && end.saturating_sub(start) > now_ms.saturating_sub(cutoff_ms)
        {
            summary
                .warnings
                .push("bundle spans a longer window than the target retention keeps".to_string());
        }
    }
    if summary.skipped_lines > 0 {
        summary
            .warnings
            .push(format!("{} invalid line(s) were skipped", summary.skipped_lines));
    }
    if summary.dropped_old > 0 {
        summary.warnings.push(format!(
            "{} sample(s) fall behind the retention cutoff and would be dropped",
            summary.dropped_old
        ));
    }
    if summary.normalized_ts {
        summary
            .warnings
            .push("timestamps were auto-scaled to milliseconds".to_string());
    }
    if summary.over_label_limit > 0 {
        summary.warnings.push(format!(
            "{} series exceed the target's label limit ({})",
            summary.over_label_limit, summary.max_labels_limit
        ));
    }
}

/// One streaming pass over a metrics file, producing retention estimates,
/// label statistics, and per-series bitsets for label-drop simulation.
pub fn analyze(metrics_path: &Path, opts: &AnalyzeOptions) -> Result<AnalysisSummary> {
    let file = fs::File::open(metrics_path)
        .with_context(|| format!("failed to open {}", metrics_path.display()))?;
    let mut reader = LimitedLineReader::new(BufReader::new(file), MAX_LINE_BYTES);

    let sample_limit = if opts.sample_limit > 0 {
        opts.sample_limit
    } else {
        DEFAULT_SAMPLE_LIMIT
    };

    let normalize_opts = NormalizeOptions {
        cutoff_ms: opts.cutoff_ms,
        shift_ms: opts.shift_ms,
        drop_labels: BTreeSet::new(),
    };

    let mut summary = AnalysisSummary {
        sample_limit,
        max_labels_limit: opts.max_labels_limit,
        ..AnalysisSummary::default()
    };
    let mut universe_index: HashMap<String, usize> = HashMap::new();
    let mut label_counts: HashMap<String, u64> = HashMap::new();

    loop {
        if opts.mode == AnalysisMode::Sample && summary.scanned_lines >= sample_limit {
            // Only probe whether anything is left; the line itself stays
            // unanalyzed.
            summary.sample_cut = !matches!(reader.next_line()?, LineRead::Eof);
            break;
        }
        let line = match reader.next_line()? {
            LineRead::Eof => break,
            LineRead::Oversized { .. } => {
                summary.scanned_lines += 1;
                summary.skipped_lines += 1;
                continue;
            }
            LineRead::Line { line, .. } => line,
        };
        summary.scanned_lines += 1;
        let text = match std::str::from_utf8(&line) {
            Ok(text) => text.trim(),
            Err(_) => {
                summary.skipped_lines += 1;
                continue;
            }
        };
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
        summary.total_points += raw.timestamps.len() as u64;

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

        summary.analyzed_lines += 1;
        summary.points += normalized.timestamps.len() as u64;
        summary.dropped_old += normalized.dropped_old;
        summary.normalized_ts |= normalized.normalized_ts;
        if let (Some(&min_ts), Some(&max_ts)) = (
            normalized.timestamps.iter().min(),
            normalized.timestamps.iter().max(),
        ) {
            summary.start_ms = Some(summary.start_ms.map_or(min_ts, |cur| cur.min(min_ts)));
            summary.end_ms = Some(summary.end_ms.map_or(max_ts, |cur| cur.max(max_ts)));
        }

        let label_count = raw.metric.len() as u32;
        summary.max_labels_seen = summary.max_labels_seen.max(label_count);
        if opts.max_labels_limit > 0 && label_count > opts.max_labels_limit {
            summary.over_label_limit += 1;
        }

        for key in raw.metric.keys() {
            *label_counts.entry(key.clone()).or_insert(0) += 1;
            if !universe_index.contains_key(key) && universe_index.len() < LABEL_UNIVERSE_CAP {
                universe_index.insert(key.clone(), summary.label_universe.len());
                summary.label_universe.push(key.clone());
            }
        }

        if summary.series_label_bitsets.len() < SIMULATION_SERIES_CAP {
            let mut bits = BitSet::with_width(summary.label_universe.len());
            for key in raw.metric.keys() {
                if let Some(&idx) = universe_index.get(key) {
                    bits.set(idx);
                }
            }
            summary.series_label_bitsets.push(bits);
            summary.series_label_counts.push(label_count);
            summary
                .series_point_counts
                .push(raw.timestamps.len() as u64);
        } else {
            summary.simulation_series_capped = true;
        }

        if summary.metric_name.is_empty() {
            summary.metric_name = normalized.metric_name().to_string();
        }
        if summary.examples.len() < 5 {
            summary.examples.push(normalized.labels.clone());
        }
    }

    summary.sim_series = summary.series_label_bitsets.len() as u64;
    summary.total_labels = label_counts.len() as u64;

    // Every bitset indexes into the final universe; pad widths so late
    // additions stay addressable.
    let width = summary.label_universe.len();
    for bits in &mut summary.series_label_bitsets {
        if bits.width < width {
            bits.bytes.resize(width.div_ceil(8), 0);
            bits.width = width;
        }
    }

    let mut stats: Vec<LabelFrequency> = label_counts
        .into_iter()
        .map(|(name, count)| LabelFrequency { name, count })
        .collect();
    stats.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.name.cmp(&b.name)));
    stats.truncate(LABEL_STATS_TOP_N);
    summary.label_stats = stats;

    if let Some((start, end)) = pinned_range(opts.metadata.as_ref()) {
        summary.start_ms = Some(start);
        summary.end_ms = Some(end);
        summary.range_pinned = true;
    }

    push_warnings(&mut summary, opts.cutoff_ms);
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use chrono::Utc;
    use tempfile::tempdir;

    use super::*;
    use crate::ferry_core::domain::MetaTimeRange;

    fn write_lines(dir: &Path, lines: &[String]) -> std::path::PathBuf {
        let path = dir.join("metrics.jsonl");
        let mut file = fs::File::create(&path).expect("create metrics file");
        for line in lines {
            writeln!(file, "{line}").expect("write line");
        }
        path
    }

    fn series(name: &str, extra: &[(&str, &str)], ts: &[i64]) -> String {
        let mut labels = vec![format!("\"__name__\":\"{name}\"")];
        for (k, v) in extra {
            labels.push(format!("\"{k}\":\"{v}\""));
        }
        let values: Vec<String> = ts.iter().map(|_| "1".to_string()).collect();
        format!(
            "{{\"metric\":{{{}}},\"values\":[{}],\"timestamps\":[{}]}}",
            labels.join(","),
            values.join(","),
            ts.iter().map(i64::to_string).collect::<Vec<_>>().join(","),
        )
    }

    #[test]
    fn full_scan_accumulates_points_and_label_stats() {
        let dir = tempdir().expect("temp dir");
        let now = Utc::now().timestamp_millis();
        let path = write_lines(
            dir.path(),
            &[
                series("http_requests_total", &[("job", "api"), ("code", "200")], &[now - 1000, now]),
                series("http_requests_total", &[("job", "api"), ("code", "500")], &[now]),
                series("process_cpu_seconds", &[("job", "node")], &[now]),
                "not json at all".to_string(),
            ],
        );

        let summary = analyze(&path, &AnalyzeOptions {
            mode: AnalysisMode::Full,
            ..AnalyzeOptions::default()
        })
        .expect("analyze");

        assert_eq!(summary.scanned_lines, 4);
        assert_eq!(summary.analyzed_lines, 3);
        assert_eq!(summary.skipped_lines, 1);
        assert_eq!(summary.points, 4);
        assert_eq!(summary.total_points, 4);
        assert_eq!(summary.metric_name, "http_requests_total");
        assert_eq!(summary.max_labels_seen, 3);
        assert!(!summary.sample_cut);

        // __name__ and job appear on all three series; code on two.
        assert_eq!(summary.label_universe[0], "__name__");
        assert!(summary.label_universe.contains(&"code".to_string()));
        let stats: Vec<(&str, u64)> = summary
            .label_stats
            .iter()
            .map(|s| (s.name.as_str(), s.count))
            .collect();
        assert_eq!(stats[0], ("__name__", 3));
        assert_eq!(stats[1], ("job", 3));
        assert_eq!(stats[2], ("code", 2));
        assert_eq!(summary.total_labels, 3);
    }

    #[test]
    fn sample_mode_stops_at_the_limit_and_flags_the_cut() {
        let dir = tempdir().expect("temp dir");
        let now = Utc::now().timestamp_millis();
        let lines: Vec<String> = (0..5)
            .map(|i| series("m", &[("idx", &i.to_string())], &[now]))
            .collect();
        let path = write_lines(dir.path(), &lines);

        let summary = analyze(&path, &AnalyzeOptions {
            mode: AnalysisMode::Sample,
            sample_limit: 3,
            ..AnalyzeOptions::default()
        })
        .expect("analyze");

        assert_eq!(summary.scanned_lines, 3);
        assert_eq!(summary.sample_limit, 3);
        assert!(summary.sample_cut);

        let full = analyze(&path, &AnalyzeOptions {
            mode: AnalysisMode::Sample,
            sample_limit: 5,
            ..AnalyzeOptions::default()
        })
        .expect("analyze");
        assert!(!full.sample_cut);
    }

    #[test]
    fn bitsets_index_into_the_label_universe() {
        let dir = tempdir().expect("temp dir");
        let now = Utc::now().timestamp_millis();
        let path = write_lines(
            dir.path(),
            &[
                series("m", &[("a", "1")], &[now]),
                series("m", &[("b", "2")], &[now, now]),
            ],
        );

        let summary = analyze(&path, &AnalyzeOptions {
            mode: AnalysisMode::Full,
            ..AnalyzeOptions::default()
        })
        .expect("analyze");

        assert_eq!(summary.sim_series, 2);
        assert!(!summary.simulation_series_capped);
        assert_eq!(summary.series_label_counts, vec![2, 2]);
        assert_eq!(summary.series_point_counts, vec![1, 2]);

        let universe = &summary.label_universe;
        let idx_of = |name: &str| universe.iter().position(|n| n == name).expect("in universe");
        let first = &summary.series_label_bitsets[0];
        let second = &summary.series_label_bitsets[1];
        assert_eq!(first.width, universe.len());
        assert_eq!(second.width, universe.len());
        assert!(first.has_bit(idx_of("__name__")));
        assert!(first.has_bit(idx_of("a")));
        assert!(!first.has_bit(idx_of("b")));
        assert!(second.has_bit(idx_of("b")));
        assert!(!second.has_bit(idx_of("a")));
    }

    #[test]
    fn retention_estimate_and_warnings_track_the_cutoff() {
        let dir = tempdir().expect("temp dir");
        let now = Utc::now().timestamp_millis();
        let cutoff = now - 3_600_000;
        let path = write_lines(
            dir.path(),
            &[
                series("m", &[], &[now - 7_200_000]),
                series("m", &[], &[now - 600_000]),
            ],
        );

        let summary = analyze(&path, &AnalyzeOptions {
            mode: AnalysisMode::Full,
            cutoff_ms: cutoff,
            ..AnalyzeOptions::default()
        })
        .expect("analyze");

        assert_eq!(summary.dropped_old, 1);
        assert_eq!(summary.points, 1);
        assert_eq!(summary.total_points, 2);
        assert_eq!(summary.skipped_lines, 0, "retention drops are not invalid lines");
        assert!(
            summary
                .warnings
                .iter()
                .any(|w| w.contains("retention cutoff")),
            "warnings: {:?}",
            summary.warnings
        );
    }

    #[test]
    fn metadata_pins_the_reported_time_range() {
        let dir = tempdir().expect("temp dir");
        let now = Utc::now().timestamp_millis();
        let path = write_lines(dir.path(), &[series("m", &[], &[now])]);

        let summary = analyze(&path, &AnalyzeOptions {
            mode: AnalysisMode::Full,
            metadata: Some(BundleMetadata {
                export_id: "e".to_string(),
                time_range: Some(MetaTimeRange {
                    start: "2026-07-01T00:00:00Z".to_string(),
                    end: "2026-07-02T00:00:00Z".to_string(),
                }),
                metrics_count: 1,
                jobs: vec![],
            }),
            ..AnalyzeOptions::default()
        })
        .expect("analyze");

        assert!(summary.range_pinned);
        assert_eq!(summary.start_ms, Some(1_782_864_000_000));
        assert_eq!(summary.end_ms, Some(1_782_950_400_000));
    }

    #[test]
    fn label_limit_breaches_are_counted_when_the_limit_is_known() {
        let dir = tempdir().expect("temp dir");
        let now = Utc::now().timestamp_millis();
        let path = write_lines(
            dir.path(),
            &[
                series("m", &[("a", "1"), ("b", "2"), ("c", "3")], &[now]),
                series("m", &[], &[now]),
            ],
        );

        let summary = analyze(&path, &AnalyzeOptions {
            mode: AnalysisMode::Full,
            max_labels_limit: 2,
            ..AnalyzeOptions::default()
        })
        .expect("analyze");
        assert_eq!(summary.over_label_limit, 1);
        assert!(summary.warnings.iter().any(|w| w.contains("label limit")));

        let unknown = analyze(&path, &AnalyzeOptions {
            mode: AnalysisMode::Full,
            max_labels_limit: 0,
            ..AnalyzeOptions::default()
        })
        .expect("analyze");
        assert_eq!(unknown.over_label_limit, 0);
    }
}
