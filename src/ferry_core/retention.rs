use std::io::{BufRead, BufReader};

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::blocking::Client;
use tracing::debug;

use crate::ferry_core::domain::ConnectionConfig;
use crate::ferry_core::endpoint::{ResolvedEndpoints, apply_request_headers};

/// Parse a VictoriaMetrics retention duration (`400d`, `1y`, `12h`) into
/// milliseconds. Units: y (365 d), w (7 d), d, h, m, s.
pub fn parse_retention_duration_ms(raw: &str) -> Option<i64> {
    let trimmed = raw.trim();
    if trimmed.len() < 2 || !trimmed.is_char_boundary(trimmed.len() - 1) {
        return None;
    }
    let (number, unit) = trimmed.split_at(trimmed.len() - 1);
    let amount: f64 = number.parse().ok()?;
    if !(amount.is_finite() && amount > 0.0) {
        return None;
    }
    let unit_ms: f64 = match unit {
        "y" => 365.0 * 24.0 * 3600.0 * 1000.0,
        "w" => 7.0 * 24.0 * 3600.0 * 1000.0,
        "d" => 24.0 * 3600.0 * 1000.0,
        "h" => 3600.0 * 1000.0,
        "m" => 60.0 * 1000.0,
        "s" => 1000.0,
        _ => return None,
    };
    Some((amount * unit_ms) as i64)
}

static FLAG_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"flag\{[^}]*name="(?P<name>[^"]+)"[^}]*value="(?P<value>[^"]*)"[^}]*\}"#)
        .expect("flag line regex")
});

fn scan_flag_value(body: impl std::io::Read, flag_name: &str) -> Option<String> {
    let reader = BufReader::new(body);
    for line in reader.lines() {
        let line = line.ok()?;
        if !line.starts_with("flag{") {
            continue;
        }
        if let Some(caps) = FLAG_LINE.captures(&line)
            && &caps["name"] == flag_name
        {
            return Some(caps["value"].to_string());
        }
    }
    None
}

fn fetch_flag(
    client: &Client,
    resolved: &ResolvedEndpoints,
    conn: &ConnectionConfig,
    flag_name: &str,
) -> Option<String> {
    let url = resolved.flags_url()?;
    let response = apply_request_headers(client.get(&url), conn).send().ok()?;
    if !response.status().is_success() {
        return None;
    }
    scan_flag_value(response, flag_name)
}

fn retention_from_tsdb_status(
    client: &Client,
    resolved: &ResolvedEndpoints,
    conn: &ConnectionConfig,
) -> Option<String> {
    let url = resolved.tsdb_status_url();
    let response = apply_request_headers(client.get(&url), conn).send().ok()?;
    if !response.status().is_success() {
        return None;
    }
    let value: serde_json::Value = response.json().ok()?;
    value
        .get("data")
        .and_then(|d| d.get("retentionTime"))
        .and_then(|r| r.as_str())
        .map(str::to_string)
}

/// Probe the target's retention period and convert it to a millisecond
/// cutoff (`now - retention`). Any error or unknown format disables
/// filtering by returning 0.
pub fn discover_retention_cutoff_ms(
    client: &Client,
    resolved: &ResolvedEndpoints,
    conn: &ConnectionConfig,
) -> i64 {
    let raw = retention_from_tsdb_status(client, resolved, conn)
        .or_else(|| fetch_flag(client, resolved, conn, "retentionPeriod"));
    let Some(raw) = raw else {
        debug!("retention period not discoverable; retention filtering disabled");
        return 0;
    };
    match parse_retention_duration_ms(&raw) {
        Some(duration_ms) => Utc::now().timestamp_millis().saturating_sub(duration_ms),
        None => {
            debug!(retention = %raw, "unrecognized retention format; filtering disabled");
            0
        }
    }
}

/// Probe the target's `maxLabelsPerTimeseries` flag. 0 means unknown.
pub fn discover_max_labels_limit(
    client: &Client,
    resolved: &ResolvedEndpoints,
    conn: &ConnectionConfig,
) -> u32 {
    fetch_flag(client, resolved, conn, "maxLabelsPerTimeseries")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ferry_core::endpoint::resolve_endpoints;
    use crate::ferry_core::test_support::spawn_mock_server;

    #[test]
    fn duration_units_follow_vm_semantics() {
        assert_eq!(parse_retention_duration_ms("1s"), Some(1000));
        assert_eq!(parse_retention_duration_ms("2m"), Some(120_000));
        assert_eq!(parse_retention_duration_ms("12h"), Some(43_200_000));
        assert_eq!(parse_retention_duration_ms("400d"), Some(34_560_000_000));
        assert_eq!(parse_retention_duration_ms("1w"), Some(604_800_000));
        assert_eq!(parse_retention_duration_ms("1y"), Some(31_536_000_000));
        assert_eq!(parse_retention_duration_ms("1.5h"), Some(5_400_000));
        assert_eq!(parse_retention_duration_ms("400"), None);
        assert_eq!(parse_retention_duration_ms("x"), None);
        assert_eq!(parse_retention_duration_ms("-1d"), None);
    }

    #[test]
    fn flag_lines_are_scanned_for_named_values() {
        let body = concat!(
            "# HELP flag ...\n",
            "flag{name=\"storageDataPath\", value=\"/storage\"} 1\n",
            "flag{name=\"retentionPeriod\", value=\"400d\", is_set=\"true\"} 1\n",
        );
        assert_eq!(
            scan_flag_value(body.as_bytes(), "retentionPeriod").as_deref(),
            Some("400d")
        );
        assert_eq!(scan_flag_value(body.as_bytes(), "maxLabelsPerTimeseries"), None);
    }

    #[test]
    fn tsdb_status_wins_over_flag_scan() {
        let server = spawn_mock_server(|req, _| {
            if req.path.ends_with("/api/v1/status/tsdb") {
                (200, r#"{"status":"success","data":{"retentionTime":"1h"}}"#.to_string())
            } else {
                (404, String::new())
            }
        });
        let resolved = resolve_endpoints(&server.url, "").expect("resolve");
        let conn = ConnectionConfig {
            endpoint: server.url.clone(),
            ..ConnectionConfig::default()
        };
        let client = Client::new();

        let cutoff = discover_retention_cutoff_ms(&client, &resolved, &conn);
        let expected = Utc::now().timestamp_millis() - 3_600_000;
        assert!((cutoff - expected).abs() < 10_000, "cutoff {cutoff} too far from {expected}");
    }

    #[test]
    fn flag_scan_is_the_fallback_and_errors_disable_filtering() {
        let server = spawn_mock_server(|req, _| {
            if req.path == "/metrics" {
                (
                    200,
                    "flag{name=\"retentionPeriod\", value=\"2h\"} 1\nflag{name=\"maxLabelsPerTimeseries\", value=\"30\"} 1\n"
                        .to_string(),
                )
            } else {
                (500, String::new())
            }
        });
        let resolved = resolve_endpoints(&server.url, "").expect("resolve");
        let conn = ConnectionConfig::default();
        let client = Client::new();

        let cutoff = discover_retention_cutoff_ms(&client, &resolved, &conn);
        assert!(cutoff > 0);
        assert_eq!(discover_max_labels_limit(&client, &resolved, &conn), 30);

        let broken = spawn_mock_server(|_, _| (500, String::new()));
        let resolved = resolve_endpoints(&broken.url, "").expect("resolve");
        assert_eq!(discover_retention_cutoff_ms(&client, &resolved, &conn), 0);
        assert_eq!(discover_max_labels_limit(&client, &resolved, &conn), 0);
    }
}
