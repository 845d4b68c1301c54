use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use reqwest::blocking::Client;
use tracing::debug;

use crate::ferry_core::domain::{ConnectionConfig, ImportSummary, VerificationResult};
use crate::ferry_core::endpoint::{apply_request_headers, series_url_from_query};

const VERIFY_ATTEMPTS: u32 = 3;
const VERIFY_PAUSE: Duration = Duration::from_millis(700);

/// Build a series selector from a metric name plus sorted label pairs.
pub fn build_selector(metric_name: &str, labels: &BTreeMap<String, String>) -> String {
    let mut parts = Vec::with_capacity(labels.len() + 1);
    if !metric_name.is_empty() {
        parts.push(format!("__name__=\"{metric_name}\""));
    }
    for (key, value) in labels {
        if key == "__name__" {
            continue;
        }
        parts.push(format!("{key}=\"{value}\""));
    }
    format!("{{{}}}", parts.join(", "))
}

fn attempt(
    client: &Client,
    conn: &ConnectionConfig,
    series_url: &str,
    selector: &str,
    start: i64,
    end: i64,
) -> Result<u64, String> {
    let request = client.get(series_url).query(&[
        ("match[]", selector),
        ("start", &start.to_string()),
        ("end", &end.to_string()),
    ]);
    let response = apply_request_headers(request, conn)
        .send()
        .map_err(|err| format!("series request failed: {err:#}"))?;
    let status = response.status();
    if !status.is_success() {
        return Err(format!("series endpoint returned HTTP {status}"));
    }
    let body: serde_json::Value = response
        .json()
        .map_err(|err| format!("series response is not JSON: {err:#}"))?;
    if body.get("status").and_then(|s| s.as_str()) != Some("success") {
        return Err("series response status is not \"success\"".to_string());
    }
    let seen = body
        .get("data")
        .and_then(|d| d.as_array())
        .map(|d| d.len() as u64)
        .unwrap_or(0);
    if seen == 0 {
        return Err("no matching series visible yet".to_string());
    }
    Ok(seen)
}

/// Confirm that at least one series matching the ingested label set is
/// visible on the target. Retries a fixed number of times with a fixed
/// pause; failure is reported, never escalated.
pub fn verify_import(
    client: &Client,
    conn: &ConnectionConfig,
    query_url: &str,
    summary: &ImportSummary,
    cancel: &AtomicBool,
) -> VerificationResult {
    let selector = build_selector(&summary.metric_name, &summary.labels);
    let series_url = series_url_from_query(query_url);
    let start = summary.start_ms.unwrap_or_default() / 1000 - 60;
    let end = summary.end_ms.unwrap_or_default() / 1000 + 60;

    let mut result = VerificationResult {
        verified: false,
        query: selector.clone(),
        series_seen: 0,
        start,
        end,
        message: String::new(),
    };
    if summary.points == 0 {
        result.message = "nothing was ingested; skipping verification".to_string();
        return result;
    }

    for round in 1..=VERIFY_ATTEMPTS {
        if cancel.load(Ordering::SeqCst) {
            result.message = "verification canceled".to_string();
            return result;
        }
        match attempt(client, conn, &series_url, &selector, start, end) {
            Ok(seen) => {
                result.verified = true;
                result.series_seen = seen;
                result.message = format!("{seen} matching series visible");
                return result;
            }
            Err(message) => {
                debug!(round, %message, "verification attempt failed");
                result.message = message;
            }
        }
        if round < VERIFY_ATTEMPTS {
            thread::sleep(VERIFY_PAUSE);
        }
    }
    result
}
