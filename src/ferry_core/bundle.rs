use std::fs;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tracing::warn;
use zip::ZipArchive;
use zip::write::SimpleFileOptions;

use crate::ferry_core::domain::BundleMetadata;
use crate::ferry_core::fsio::unique_temp_path;

/// Raised when a bundle holds nothing that looks like a metrics file.
#[derive(Debug, thiserror::Error)]
#[error("bundle contains no usable metrics file")]
pub struct ErrBundleNoMetrics;

/// How many leading lines of a ZIP entry are probed for metric keys.
const PROBE_LINES: usize = 20;

/// Handle that removes the extracted temp file at most once. Resumable
/// jobs disarm it and take ownership of the path instead.
#[derive(Debug, Default)]
pub struct TempCleanup {
    path: Option<PathBuf>,
}

impl TempCleanup {
    fn armed(path: PathBuf) -> Self {
        Self { path: Some(path) }
    }

    /// Remove the extracted file. Safe to call repeatedly; only the first
    /// invocation touches the filesystem.
    pub fn invoke(&mut self) {
        if let Some(path) = self.path.take() {
            let _ = fs::remove_file(path);
        }
    }

    /// Hand the path to the caller without deleting it.
    pub fn disarm(&mut self) -> Option<PathBuf> {
        self.path.take()
    }
}

/// A bundle opened for streaming.
#[derive(Debug)]
pub struct PreparedBundle {
    pub metrics_path: PathBuf,
    pub metadata: Option<BundleMetadata>,
    pub content_type: &'static str,
    pub original_bytes: u64,
    pub extracted_bytes: u64,
    pub cleanup: TempCleanup,
}

fn extension_of(name: &str) -> Option<String> {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
}

fn line_has_metric_keys(line: &str) -> bool {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else {
        return false;
    };
    let Some(obj) = value.as_object() else {
        return false;
    };
    obj.contains_key("metric") || obj.contains_key("labels") || obj.contains_key("__name__")
}

fn probe_reader_for_metrics(reader: impl Read) -> bool {
    let mut lines = BufReader::new(reader).lines();
    for _ in 0..PROBE_LINES {
        match lines.next() {
            Some(Ok(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                if line_has_metric_keys(&line) {
                    return true;
                }
            }
            Some(Err(_)) | None => return false,
        }
    }
    false
}

fn extract_entry(
    archive: &mut ZipArchive<fs::File>,
    index: usize,
    work_dir: &Path,
) -> Result<(PathBuf, u64)> {
    let mut entry = archive
        .by_index(index)
        .with_context(|| format!("failed to open zip entry {index} for extraction"))?;
    fs::create_dir_all(work_dir)
        .with_context(|| format!("failed to create directory {}", work_dir.display()))?;
    let dest = unique_temp_path(work_dir, "metrics", ".jsonl");
    let mut out = fs::File::create(&dest)
        .with_context(|| format!("failed to create {}", dest.display()))?;
    let copied = match std::io::copy(&mut entry, &mut out) {
        Ok(n) => n,
        Err(err) => {
            drop(out);
            let _ = fs::remove_file(&dest);
            return Err(err)
                .with_context(|| format!("failed to extract zip entry to {}", dest.display()));
        }
    };
    Ok((dest, copied))
}

fn read_metadata(archive: &mut ZipArchive<fs::File>) -> Option<BundleMetadata> {
    let index = (0..archive.len()).find(|i| {
        archive
            .by_index(*i)
            .map(|entry| entry.is_file() && entry.name().eq_ignore_ascii_case("metadata.json"))
            .unwrap_or(false)
    })?;
    let entry = archive.by_index(index).ok()?;
    match serde_json::from_reader::<_, BundleMetadata>(BufReader::new(entry)) {
        Ok(meta) => Some(meta),
        Err(err) => {
            warn!("ignoring unparseable metadata.json in bundle: {err:#}");
            None
        }
    }
}

fn prepare_zip(path: &Path, uploaded_bytes: u64, work_dir: &Path) -> Result<PreparedBundle> {
    let file = fs::File::open(path)
        .with_context(|| format!("failed to open bundle {}", path.display()))?;
    let mut archive = ZipArchive::new(file)
        .with_context(|| format!("failed to open zip archive {}", path.display()))?;

    // Pass 1: an entry literally named metrics.jsonl wins outright.
    let mut chosen: Option<usize> = None;
    let mut jsonl_candidates: Vec<usize> = Vec::new();
    for i in 0..archive.len() {
        let entry = archive
            .by_index(i)
            .with_context(|| format!("failed to read zip entry at index {i}"))?;
        if !entry.is_file() {
            continue;
        }
        let name = entry.name().to_string();
        if name.eq_ignore_ascii_case("metrics.jsonl") {
            chosen = Some(i);
            break;
        }
        if extension_of(&name).as_deref() == Some("jsonl") {
            jsonl_candidates.push(i);
        }
    }

    // Pass 2: probe each remaining .jsonl entry for metric-shaped lines.
    if chosen.is_none() {
        for i in jsonl_candidates {
            let entry = archive
                .by_index(i)
                .with_context(|| format!("failed to probe zip entry at index {i}"))?;
            if probe_reader_for_metrics(entry) {
                chosen = Some(i);
                break;
            }
        }
    }

    let Some(index) = chosen else {
        return Err(ErrBundleNoMetrics.into());
    };

    let metadata = read_metadata(&mut archive);
    let (metrics_path, extracted_bytes) = extract_entry(&mut archive, index, work_dir)?;
    Ok(PreparedBundle {
        metrics_path: metrics_path.clone(),
        metadata,
        content_type: "application/jsonl",
        original_bytes: uploaded_bytes,
        extracted_bytes,
        cleanup: TempCleanup::armed(metrics_path),
    })
}

/// Open an uploaded bundle for streaming.
///
/// The kind is detected from the uploader-supplied name first and the
/// on-disk path second, case-insensitively. ZIP bundles get their metrics
/// entry extracted to a temp file under `work_dir`; bare JSONL uploads are
/// streamed in place.
pub fn prepare(
    path: &Path,
    original_name: &str,
    uploaded_bytes: u64,
    work_dir: &Path,
) -> Result<PreparedBundle> {
    let ext = extension_of(original_name)
        .or_else(|| path.to_str().and_then(extension_of))
        .unwrap_or_default();

    match ext.as_str() {
        "zip" => prepare_zip(path, uploaded_bytes, work_dir),
        "jsonl" => {
            let extracted_bytes = fs::metadata(path)
                .with_context(|| format!("failed to stat {}", path.display()))?
                .len();
            Ok(PreparedBundle {
                metrics_path: path.to_path_buf(),
                metadata: None,
                content_type: "application/jsonl",
                original_bytes: uploaded_bytes,
                extracted_bytes,
                cleanup: TempCleanup::default(),
            })
        }
        _ => Err(ErrBundleNoMetrics.into()),
    }
}

/// A finished export archive.
#[derive(Debug, Clone)]
pub struct WrittenBundle {
    pub archive_path: PathBuf,
    pub sha256: String,
    pub size_bytes: u64,
}

fn sha256_of_file(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path)
        .with_context(|| format!("failed to open {} for hashing", path.display()))?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)
        .with_context(|| format!("failed to hash {}", path.display()))?;
    Ok(hex::encode(hasher.finalize()))
}

/// Package a finished staging JSONL plus metadata into a ZIP archive and
/// digest the result.
pub fn write_bundle(
    staging_path: &Path,
    metadata: &BundleMetadata,
    output_path: &Path,
) -> Result<WrittenBundle> {
    if let Some(parent) = output_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }
    let file = fs::File::create(output_path)
        .with_context(|| format!("failed to create archive {}", output_path.display()))?;
    let mut zip = zip::ZipWriter::new(file);
    let options =
        SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    zip.start_file("metrics.jsonl", options)
        .context("failed to start metrics.jsonl archive entry")?;
    let mut staging = fs::File::open(staging_path)
        .with_context(|| format!("failed to open staging file {}", staging_path.display()))?;
    std::io::copy(&mut staging, &mut zip)
        .context("failed to copy staging data into the archive")?;

    zip.start_file("metadata.json", options)
        .context("failed to start metadata.json archive entry")?;
    let meta_bytes =
        serde_json::to_vec_pretty(metadata).context("failed to encode bundle metadata")?;
    zip.write_all(&meta_bytes)
        .context("failed to write bundle metadata")?;
    zip.finish().context("failed to finalize the archive")?;

    let sha256 = sha256_of_file(output_path)?;
    let size_bytes = fs::metadata(output_path)
        .with_context(|| format!("failed to stat {}", output_path.display()))?
        .len();
    Ok(WrittenBundle {
        archive_path: output_path.to_path_buf(),
        sha256,
        size_bytes,
    })
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::ferry_core::domain::MetaTimeRange;

    const LINE: &str = r#"{"metric":{"__name__":"demo"},"values":[1],"timestamps":[1700000000000]}"#;

    fn write_zip(path: &Path, entries: &[(&str, &str)]) {
        let file = fs::File::create(path).expect("create zip");
        let mut zip = zip::ZipWriter::new(file);
        let options =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
        for (name, body) in entries {
            zip.start_file(*name, options).expect("start entry");
            zip.write_all(body.as_bytes()).expect("write entry");
        }
        zip.finish().expect("finish zip");
    }

    #[test]
    fn named_metrics_entry_is_extracted() {
        let dir = tempdir().expect("temp dir");
        let bundle = dir.path().join("upload.zip");
        write_zip(
            &bundle,
            &[
                ("metadata.json", r#"{"export_id":"e1","metrics_count":1}"#),
                ("Metrics.JSONL", LINE),
            ],
        );

        let mut prepared =
            prepare(&bundle, "upload.zip", 123, dir.path()).expect("prepare bundle");
        assert_eq!(prepared.original_bytes, 123);
        assert_eq!(prepared.extracted_bytes, LINE.len() as u64);
        assert_eq!(prepared.content_type, "application/jsonl");
        assert_eq!(
            prepared.metadata.as_ref().map(|m| m.export_id.as_str()),
            Some("e1")
        );
        let extracted = fs::read_to_string(&prepared.metrics_path).expect("read extracted");
        assert_eq!(extracted, LINE);

        let path = prepared.metrics_path.clone();
        prepared.cleanup.invoke();
        assert!(!path.exists(), "cleanup must remove the extracted file");
        prepared.cleanup.invoke(); // second invocation is a no-op
    }

    #[test]
    fn unnamed_jsonl_entries_are_probed_for_metric_keys() {
        let dir = tempdir().expect("temp dir");
        let bundle = dir.path().join("upload.zip");
        write_zip(
            &bundle,
            &[
                ("notes.jsonl", "{\"note\":\"not metrics\"}\n"),
                ("series/export.jsonl", &format!("{LINE}\n{LINE}\n")),
            ],
        );

        let prepared = prepare(&bundle, "upload.zip", 0, dir.path()).expect("prepare bundle");
        let extracted = fs::read_to_string(&prepared.metrics_path).expect("read extracted");
        assert!(extracted.contains("demo"));
    }

    #[test]
    fn bundle_without_metrics_fails_without_leftovers() {
        let dir = tempdir().expect("temp dir");
        let bundle = dir.path().join("upload.zip");
        write_zip(&bundle, &[("readme.txt", "hello")]);

        let err = prepare(&bundle, "upload.zip", 0, dir.path()).expect_err("must fail");
        assert!(err.is::<ErrBundleNoMetrics>());
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .expect("read dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.path() != bundle)
            .collect();
        assert!(leftovers.is_empty(), "no partial extraction may remain");
    }

    #[test]
    fn bare_jsonl_uploads_stream_in_place() {
        let dir = tempdir().expect("temp dir");
        let upload = dir.path().join("upload.tmp");
        fs::write(&upload, format!("{LINE}\n")).expect("write upload");

        let mut prepared =
            prepare(&upload, "export.jsonl", 9, dir.path()).expect("prepare jsonl");
        assert_eq!(prepared.metrics_path, upload);
        assert!(prepared.metadata.is_none());
        // No extraction happened, so cleanup must not delete the upload.
        prepared.cleanup.invoke();
        assert!(upload.exists());
    }

    #[test]
    fn written_bundles_round_trip_through_prepare() {
        let dir = tempdir().expect("temp dir");
        let staging = dir.path().join("staging.jsonl");
        fs::write(&staging, format!("{LINE}\n")).expect("write staging");
        let metadata = BundleMetadata {
            export_id: "export-9".to_string(),
            time_range: Some(MetaTimeRange {
                start: "2026-07-01T00:00:00Z".to_string(),
                end: "2026-07-02T00:00:00Z".to_string(),
            }),
            metrics_count: 1,
            jobs: vec!["node-job-1".to_string()],
        };

        let out = dir.path().join("out").join("bundle.zip");
        let written = write_bundle(&staging, &metadata, &out).expect("write bundle");
        assert_eq!(written.archive_path, out);
        assert_eq!(written.sha256.len(), 64);
        assert!(written.size_bytes > 0);

        let prepared = prepare(&out, "bundle.zip", written.size_bytes, dir.path())
            .expect("re-open written bundle");
        assert_eq!(
            prepared.metadata.as_ref().map(|m| m.export_id.as_str()),
            Some("export-9")
        );
        let extracted = fs::read_to_string(&prepared.metrics_path).expect("read extracted");
        assert_eq!(extracted, format!("{LINE}\n"));
    }
}
