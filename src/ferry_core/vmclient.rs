use std::io::{BufRead, BufReader};

use anyhow::{Context, Result, bail};
use reqwest::blocking::Client;

use crate::ferry_core::domain::ConnectionConfig;
use crate::ferry_core::endpoint::apply_request_headers;
use crate::ferry_core::httpc::{IMPORT_HTTP_TIMEOUT, build_client};

/// VM query/export collaborator as the export pipeline sees it. One
/// method: stream every raw export line for one time window into `sink`.
pub trait VmExporter: Send + Sync {
    fn export_window(
        &self,
        match_expr: &str,
        start_ms: i64,
        end_ms: i64,
        sink: &mut dyn FnMut(&str) -> Result<()>,
    ) -> Result<u64>;
}

/// Blocking `/api/v1/export` client.
pub struct HttpVmExporter {
    client: Client,
    export_url: String,
    conn: ConnectionConfig,
}

impl HttpVmExporter {
    pub fn new(conn: ConnectionConfig, export_url: String) -> Result<Self> {
        let client = build_client(&conn, IMPORT_HTTP_TIMEOUT)?;
        Ok(Self {
            client,
            export_url,
            conn,
        })
    }
}

impl VmExporter for HttpVmExporter {
    fn export_window(
        &self,
        match_expr: &str,
        start_ms: i64,
        end_ms: i64,
        sink: &mut dyn FnMut(&str) -> Result<()>,
    ) -> Result<u64> {
        let request = self.client.get(&self.export_url).query(&[
            ("match[]", match_expr),
            ("start", &(start_ms / 1000).to_string()),
            ("end", &(end_ms / 1000).to_string()),
        ]);
        let response = apply_request_headers(request, &self.conn)
            .send()
            .with_context(|| format!("export request to {} failed", self.export_url))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            bail!(
                "export request returned HTTP {status}: {}",
                body.chars().take(512).collect::<String>()
            );
        }

        let mut series = 0u64;
        let reader = BufReader::new(response);
        for line in reader.lines() {
            let line = line.context("failed to read export stream")?;
            if line.trim().is_empty() {
                continue;
            }
            sink(&line)?;
            series += 1;
        }
        Ok(series)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ferry_core::test_support::spawn_mock_server;

    #[test]
    fn export_lines_are_streamed_to_the_sink() {
        let server = spawn_mock_server(|_, _| {
            (
                200,
                "{\"metric\":{\"__name__\":\"up\"},\"values\":[1],\"timestamps\":[1]}\n\n{\"metric\":{\"__name__\":\"up\"},\"values\":[0],\"timestamps\":[2]}\n"
                    .to_string(),
            )
        });
        let exporter = HttpVmExporter::new(
            ConnectionConfig::default(),
            format!("{}/api/v1/export", server.url),
        )
        .expect("build exporter");

        let mut lines = Vec::new();
        let series = exporter
            .export_window("{__name__!=\"\"}", 1_000, 61_000, &mut |line| {
                lines.push(line.to_string());
                Ok(())
            })
            .expect("export window");
        assert_eq!(series, 2);
        assert_eq!(lines.len(), 2);

        let requests = server.requests();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].query.contains("start=1"));
        assert!(requests[0].query.contains("end=61"));
    }

    #[test]
    fn upstream_errors_surface_with_status() {
        let server = spawn_mock_server(|_, _| (502, "overloaded".to_string()));
        let exporter = HttpVmExporter::new(
            ConnectionConfig::default(),
            format!("{}/api/v1/export", server.url),
        )
        .expect("build exporter");

        let err = exporter
            .export_window("{}", 0, 1000, &mut |_| Ok(()))
            .expect_err("must fail");
        assert!(err.to_string().contains("502"), "got {err:#}");
    }
}
