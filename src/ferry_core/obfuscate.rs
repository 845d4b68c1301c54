use std::collections::{BTreeSet, HashMap};

use anyhow::{Context, Result};
use serde_json::Value;

/// Per-session label obfuscation. Mappings are allocated on first sight
/// and reused for the rest of the session, so identical inputs always
/// land on identical tokens within one export job.
#[derive(Debug, Default)]
pub struct Obfuscator {
    custom_labels: BTreeSet<String>,
    host_map: HashMap<String, String>,
    job_map: HashMap<String, String>,
    token_maps: HashMap<String, HashMap<String, String>>,
}

fn job_component(original: &str) -> &str {
    let end = original
        .find(|c: char| !c.is_ascii_alphanumeric())
        .unwrap_or(original.len());
    if end == 0 { "svc" } else { &original[..end] }
}

impl Obfuscator {
    pub fn new(custom_labels: impl IntoIterator<Item = String>) -> Self {
        Self {
            custom_labels: custom_labels.into_iter().collect(),
            ..Self::default()
        }
    }

    fn masked_instance(&mut self, original: &str) -> String {
        // Keep the port visible; only the host is masked.
        let (host, port) = match original.rsplit_once(':') {
            Some((host, port)) if port.parse::<u16>().is_ok() => (host, Some(port)),
            _ => (original, None),
        };
        let next = self.host_map.len() as u64 + 1;
        let masked = self
            .host_map
            .entry(host.to_string())
            .or_insert_with(|| format!("777.777.{}.{}", next / 256, next % 256));
        match port {
            Some(port) => format!("{masked}:{port}"),
            None => masked.clone(),
        }
    }

    fn masked_job(&mut self, original: &str) -> String {
        let next = self.job_map.len() as u64 + 1;
        let component = job_component(original).to_ascii_lowercase();
        self.job_map
            .entry(original.to_string())
            .or_insert_with(|| format!("{component}-job-{next}"))
            .clone()
    }

    fn masked_token(&mut self, key: &str, original: &str) -> String {
        let per_key = self.token_maps.entry(key.to_string()).or_default();
        let next = per_key.len() as u64 + 1;
        per_key
            .entry(original.to_string())
            .or_insert_with(|| format!("obf-{key}-{next}"))
            .clone()
    }

    fn rewrite(&mut self, key: &str, value: &str) -> Option<String> {
        match key {
            "instance" => Some(self.masked_instance(value)),
            "job" => Some(self.masked_job(value)),
            _ if self.custom_labels.contains(key) && !key.starts_with("__") => {
                Some(self.masked_token(key, value))
            }
            _ => None,
        }
    }

    /// Obfuscate one raw export line in place and re-serialize it.
    pub fn obfuscate_line(&mut self, line: &str) -> Result<String> {
        let mut value: Value =
            serde_json::from_str(line).context("failed to parse export line")?;
        if let Some(metric) = value.get_mut("metric").and_then(Value::as_object_mut) {
            let rewrites: Vec<(String, String)> = metric
                .iter()
                .filter_map(|(key, val)| {
                    let original = val.as_str()?;
                    self.rewrite(key, original).map(|masked| (key.clone(), masked))
                })
                .collect();
            for (key, masked) in rewrites {
                metric.insert(key, Value::String(masked));
            }
        }
        serde_json::to_string(&value).context("failed to serialize obfuscated line")
    }

    /// Distinct obfuscated `job` values handed out this session.
    pub fn jobs_seen(&self) -> Vec<String> {
        let mut jobs: Vec<String> = self.job_map.values().cloned().collect();
        jobs.sort();
        jobs
    }
}
