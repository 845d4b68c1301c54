use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use tracing::warn;

use crate::ferry_core::domain::ConnectionConfig;
use crate::ferry_core::endpoint::redact_endpoint;

/// Outer timeout for import-side requests; per-chunk POSTs inherit it.
pub const IMPORT_HTTP_TIMEOUT: Duration = Duration::from_secs(300);

/// Shorter budget for read-only probes (retention, flags, verification).
pub const PROBE_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Build a blocking HTTP client for one job.
///
/// Clients are constructed per job rather than shared process-wide so a
/// `skip_tls_verify` connection never mutates transport state other jobs
/// see. The insecure mode is loudly logged once per construction with the
/// endpoint credentials redacted.
pub fn build_client(conn: &ConnectionConfig, timeout: Duration) -> Result<Client> {
    let mut builder = Client::builder().timeout(timeout);
    if conn.skip_tls_verify {
        warn!(
            endpoint = %redact_endpoint(&conn.endpoint),
            "TLS certificate verification disabled for this job"
        );
        builder = builder.danger_accept_invalid_certs(true);
    }
    builder
        .build()
        .with_context(|| format!("failed to build HTTP client for {}", redact_endpoint(&conn.endpoint)))
}
