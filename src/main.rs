//! Thin CLI shell around the vmferry engine: builds frozen configs,
//! starts jobs, and polls snapshots. All pipeline logic lives in the
//! library.

use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::DateTime;
use clap::{Args, Parser, Subcommand};
use tracing::info;

use vmferry::{
    AnalysisMode, AuthKind, ConnectionConfig, EngineOptions, ExportConfig, FerryEngine, JobState,
    TimeRangeMs, UploadConfig, UploadRequest,
};

#[derive(Parser)]
#[command(name = "vmferry", version, about = "Streaming export/import operator tool for VictoriaMetrics")]
struct Cli {
    /// Scratch directory for extracted bundles and staging files.
    #[arg(long, global = true)]
    work_dir: Option<PathBuf>,
    /// Recent-profiles file; omitted = profiles are not persisted.
    #[arg(long, global = true)]
    profiles: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Clone)]
struct ConnectionArgs {
    /// Target VM base URL.
    #[arg(long)]
    endpoint: String,
    /// Multitenant account id; selects the cluster insert/select paths.
    #[arg(long, default_value = "")]
    tenant: String,
    /// Authentication: none, basic, bearer, or header.
    #[arg(long, value_enum, default_value = "none")]
    auth: AuthArg,
    #[arg(long, default_value = "")]
    username: String,
    /// Password for basic auth; the token for bearer auth.
    #[arg(long, default_value = "", env = "VMFERRY_PASSWORD")]
    password: String,
    /// Custom auth header as `Name: value`.
    #[arg(long, default_value = "")]
    auth_header: String,
    #[arg(long)]
    skip_tls_verify: bool,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum AuthArg {
    None,
    Basic,
    Bearer,
    Header,
}

impl ConnectionArgs {
    fn into_config(self) -> ConnectionConfig {
        let (header_name, header_value) = match self.auth_header.split_once(':') {
            Some((name, value)) => (name.trim().to_string(), value.trim().to_string()),
            None => (String::new(), String::new()),
        };
        ConnectionConfig {
            endpoint: self.endpoint,
            tenant_id: self.tenant,
            auth_type: match self.auth {
                AuthArg::None => AuthKind::None,
                AuthArg::Basic => AuthKind::Basic,
                AuthArg::Bearer => AuthKind::Bearer,
                AuthArg::Header => AuthKind::Header,
            },
            username: self.username,
            password: self.password,
            custom_header_name: header_name,
            custom_header_value: header_value,
            skip_tls_verify: self.skip_tls_verify,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Scan a bundle and report retention/label statistics.
    Analyze {
        bundle: PathBuf,
        #[command(flatten)]
        connection: ConnectionArgs,
        /// Read the whole file instead of the first sample.
        #[arg(long)]
        full: bool,
    },
    /// Re-ingest a bundle into a target cluster.
    Import {
        bundle: PathBuf,
        #[command(flatten)]
        connection: ConnectionArgs,
        /// Disable retention-based filtering.
        #[arg(long)]
        keep_old: bool,
        /// Millisecond shift applied to every sample.
        #[arg(long, default_value_t = 0)]
        time_shift_ms: i64,
        /// Label keys to drop before emission (repeatable).
        #[arg(long = "drop-label")]
        drop_labels: Vec<String>,
    },
    /// Pull a time range out of a cluster into an obfuscated bundle.
    Export {
        #[command(flatten)]
        connection: ConnectionArgs,
        /// Range start, RFC 3339.
        #[arg(long)]
        start: String,
        /// Range end, RFC 3339.
        #[arg(long)]
        end: String,
        /// Series selector.
        #[arg(long, default_value = "{__name__!=\"\"}")]
        r#match: String,
        /// Explicit batch window in seconds.
        #[arg(long)]
        window_seconds: Option<u64>,
        /// Keep original label values.
        #[arg(long)]
        no_obfuscate: bool,
        /// Directory the finished archive lands in.
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
}

fn parse_rfc3339_ms(raw: &str) -> Result<i64> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.timestamp_millis())
        .with_context(|| format!("invalid RFC 3339 timestamp {raw:?}"))
}

fn run_import(engine: &FerryEngine, bundle: PathBuf, config: UploadConfig) -> Result<()> {
    let original_name = bundle
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("bundle.jsonl")
        .to_string();
    let size_bytes = std::fs::metadata(&bundle)
        .with_context(|| format!("failed to stat {}", bundle.display()))?
        .len();
    let id = engine.start_import(UploadRequest {
        bundle_path: bundle,
        original_name,
        size_bytes,
        config,
    })?;
    info!(job = %id, "import started");

    loop {
        let job = engine
            .import_status(&id)
            .context("import job disappeared")?;
        if job.state.is_terminal() {
            println!("{}", serde_json::to_string_pretty(&job)?);
            if job.state != JobState::Completed {
                bail!("import {} {:?}", id, job.state);
            }
            return Ok(());
        }
        info!(
            job = %id,
            stage = %job.stage_message,
            percent = format!("{:.0}", job.percent),
            "working"
        );
        thread::sleep(Duration::from_millis(500));
    }
}

fn run_export(engine: &FerryEngine, config: ExportConfig) -> Result<()> {
    let id = engine.start_export(config)?;
    info!(job = %id, "export started");

    loop {
        let job = engine
            .export_status(&id)
            .context("export job disappeared")?;
        if job.state.is_terminal() {
            println!("{}", serde_json::to_string_pretty(&job)?);
            if job.state != JobState::Completed {
                bail!("export {} {:?}", id, job.state);
            }
            return Ok(());
        }
        info!(
            job = %id,
            batches = format!("{}/{}", job.completed_batches, job.total_batches),
            "working"
        );
        thread::sleep(Duration::from_millis(500));
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let cli = Cli::parse();
    let mut opts = EngineOptions::default();
    if let Some(work_dir) = cli.work_dir {
        opts.work_dir = work_dir;
    }
    opts.profiles_path = cli.profiles;
    let engine = FerryEngine::new(opts)?;

    match cli.command {
        Command::Analyze {
            bundle,
            connection,
            full,
        } => {
            let config = UploadConfig {
                connection: connection.into_config(),
                ..UploadConfig::default()
            };
            let mode = if full {
                AnalysisMode::Full
            } else {
                AnalysisMode::Sample
            };
            let original_name = bundle
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("bundle.jsonl")
                .to_string();
            let summary = engine.analyze_bundle(&bundle, &original_name, &config, mode)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        Command::Import {
            bundle,
            connection,
            keep_old,
            time_shift_ms,
            drop_labels,
        } => {
            let mut config = UploadConfig {
                connection: connection.into_config(),
                ..UploadConfig::default()
            };
            config.ingestion.drop_old = !keep_old;
            config.ingestion.time_shift_ms = time_shift_ms;
            config.ingestion.drop_labels = drop_labels;
            run_import(&engine, bundle, config)
        }
        Command::Export {
            connection,
            start,
            end,
            r#match,
            window_seconds,
            no_obfuscate,
            output_dir,
        } => {
            let mut config = ExportConfig {
                connection: connection.into_config(),
                time_range: TimeRangeMs {
                    start_ms: parse_rfc3339_ms(&start)?,
                    end_ms: parse_rfc3339_ms(&end)?,
                },
                match_expr: r#match,
                obfuscate: !no_obfuscate,
                ..ExportConfig::default()
            };
            config.batching.batch_window_seconds = window_seconds;
            config.output_dir = output_dir.map(|p| p.to_string_lossy().into_owned());
            run_export(&engine, config)
        }
    }
}
