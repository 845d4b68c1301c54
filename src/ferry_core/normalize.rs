use std::collections::{BTreeMap, BTreeSet};

use serde::Deserialize;
use serde_json::Value;

use crate::ferry_core::domain::PROTECTED_LABELS;

/// One parsed JSONL record before normalization. Values arrive as JSON
/// numbers, numeric strings, or booleans; the coercion rules live here.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawLine {
    #[serde(default, alias = "labels")]
    pub metric: BTreeMap<String, String>,
    #[serde(default)]
    pub values: Vec<Value>,
    #[serde(default)]
    pub timestamps: Vec<i64>,
}

pub fn parse_metric_line(line: &str) -> Result<RawLine, serde_json::Error> {
    serde_json::from_str(line)
}

/// Per-line normalization knobs, frozen for the whole stream.
#[derive(Debug, Clone, Default)]
pub struct NormalizeOptions {
    /// Samples strictly older than this millisecond cutoff are dropped;
    /// `0` disables retention filtering.
    pub cutoff_ms: i64,
    /// Uniform shift applied after the retention filter.
    pub shift_ms: i64,
    /// Sanitized label-drop set (protected keys already removed).
    pub drop_labels: BTreeSet<String>,
}

/// Canonical output for one accepted line.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedLine {
    pub labels: BTreeMap<String, String>,
    pub values: Vec<f64>,
    pub timestamps: Vec<i64>,
    pub dropped_old: u64,
    pub normalized_ts: bool,
}

impl NormalizedLine {
    pub fn metric_name(&self) -> &str {
        self.labels.get("__name__").map(String::as_str).unwrap_or("")
    }

    /// Canonical JSONL rendering: `metric`, `values`, `timestamps` in that
    /// order, with deterministic label ordering inside `metric`.
    pub fn to_jsonl(&self) -> serde_json::Result<String> {
        #[derive(serde::Serialize)]
        struct Wire<'a> {
            metric: &'a BTreeMap<String, String>,
            values: &'a [f64],
            timestamps: &'a [i64],
        }
        serde_json::to_string(&Wire {
            metric: &self.labels,
            values: &self.values,
            timestamps: &self.timestamps,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LineOutcome {
    Emitted(NormalizedLine),
    /// The whole line was rejected. `dropped_old` still reports samples
    /// removed by the retention filter before the rejection.
    Skipped { dropped_old: u64 },
}

fn coerce_value(value: &Value) -> Option<f64> {
    let num = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        Value::Bool(b) => {
            if *b {
                1.0
            } else {
                0.0
            }
        }
        _ => return None,
    };
    num.is_finite().then_some(num)
}

/// Millisecond scaling derived from the median timestamp magnitude.
fn detect_scale(timestamps: &[i64]) -> (i64, i64, bool) {
    let mut magnitudes: Vec<f64> = timestamps.iter().map(|t| (*t as f64).abs()).collect();
    magnitudes.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let median = magnitudes[magnitudes.len() / 2];

    // (multiplier, divisor, scaled)
    if median < 1e9 {
        (1, 1, false)
    } else if median < 1e11 {
        (1000, 1, true) // seconds
    } else if median < 1e14 {
        (1, 1, false) // already milliseconds
    } else if median < 1e17 {
        (1, 1000, true) // microseconds
    } else {
        (1, 1_000_000, true) // nanoseconds
    }
}

fn is_protected(key: &str) -> bool {
    key.starts_with("__") || PROTECTED_LABELS.contains(&key)
}

/// Normalize one parsed line: coerce values, scale timestamps to
/// milliseconds, apply the retention cutoff and optional shift, and drop
/// requested labels. Pure; all bookkeeping is returned to the caller.
pub fn normalize_line(raw: &RawLine, opts: &NormalizeOptions) -> LineOutcome {
    let mut values = Vec::with_capacity(raw.values.len());
    for value in &raw.values {
        match coerce_value(value) {
            Some(v) => values.push(v),
            None => return LineOutcome::Skipped { dropped_old: 0 },
        }
    }
    if values.is_empty() || values.len() != raw.timestamps.len() {
        return LineOutcome::Skipped { dropped_old: 0 };
    }

    let (mul, div, normalized_ts) = detect_scale(&raw.timestamps);
    let scaled: Vec<i64> = raw
        .timestamps
        .iter()
        .map(|t| t.saturating_mul(mul) / div)
        .collect();

    let mut kept_values = Vec::with_capacity(values.len());
    let mut kept_ts = Vec::with_capacity(scaled.len());
    let mut dropped_old = 0u64;
    for (ts, val) in scaled.into_iter().zip(values.into_iter()) {
        if opts.cutoff_ms > 0 && ts < opts.cutoff_ms {
            dropped_old += 1;
            continue;
        }
        kept_ts.push(ts + opts.shift_ms);
        kept_values.push(val);
    }
    if kept_ts.is_empty() {
        return LineOutcome::Skipped { dropped_old };
    }

    let labels: BTreeMap<String, String> = raw
        .metric
        .iter()
        .filter(|(key, _)| is_protected(key) || !opts.drop_labels.contains(*key))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    LineOutcome::Emitted(NormalizedLine {
        labels,
        values: kept_values,
        timestamps: kept_ts,
        dropped_old,
        normalized_ts,
    })
}
