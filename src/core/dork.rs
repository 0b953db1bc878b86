// src/core/dork.rs

//! Target discovery through an external dork-search tool.
//!
//! The scanner only consumes domain tokens; process management stays behind
//! the `DorkRunner` capability.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::core::models::{ProxyRecord, Target};
use crate::core::proxy_pool::ProxyPool;
use crate::error::{ConfigError, DorkError};

/// Tokens containing this are the search engine talking about itself.
pub const DEFAULT_EXCLUSION: &str = "google";

static URL_HOST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bhttps?://([a-z0-9](?:[a-z0-9-]*[a-z0-9])?(?:\.[a-z0-9](?:[a-z0-9-]*[a-z0-9])?)*\.[a-z]{2,})")
        .expect("valid host regex")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DorkLimits {
    pub pages: u32,
    /// Per-request timeout handed to the tool.
    pub timeout: Duration,
    pub max_results: u32,
}

impl Default for DorkLimits {
    fn default() -> Self {
        Self {
            pages: 5,
            timeout: Duration::from_secs(10),
            max_results: 100,
        }
    }
}

impl DorkLimits {
    /// Wall-clock bound for one tool run.
    fn deadline(&self) -> Duration {
        self.timeout.saturating_mul(self.pages.max(1) + 1)
    }
}

#[async_trait]
pub trait DorkRunner: Send + Sync {
    /// Runs one query and returns the tool's raw output lines.
    async fn run_dork_query(
        &self,
        query: &str,
        proxy: Option<&ProxyRecord>,
        limits: &DorkLimits,
    ) -> Result<Vec<String>, DorkError>;
}

/// Pulls unique, lowercased hosts out of raw result lines, dropping any that
/// contain `exclude`.
pub fn extract_domains<'a>(lines: impl IntoIterator<Item = &'a str>, exclude: &str) -> Vec<String> {
    let exclude = exclude.to_ascii_lowercase();
    let mut seen = HashSet::new();
    let mut domains = Vec::new();
    for line in lines {
        for caps in URL_HOST.captures_iter(line) {
            let host = caps[1].to_ascii_lowercase();
            if !exclude.is_empty() && host.contains(&exclude) {
                continue;
            }
            if seen.insert(host.clone()) {
                domains.push(host);
            }
        }
    }
    domains
}

/// Finds `name` as a path or on `PATH`.
pub fn resolve_binary(name: &str) -> Result<PathBuf, ConfigError> {
    let candidate = Path::new(name);
    if candidate.components().count() > 1 {
        return if candidate.is_file() {
            Ok(candidate.to_path_buf())
        } else {
            Err(ConfigError::MissingDorkBinary(name.to_string()))
        };
    }
    std::env::var_os("PATH")
        .iter()
        .flat_map(|paths| std::env::split_paths(paths).collect::<Vec<_>>())
        .map(|dir| dir.join(name))
        .find(|path| path.is_file())
        .ok_or_else(|| ConfigError::MissingDorkBinary(name.to_string()))
}

/// Invokes the tool as
/// `<binary> [leading args] -f <query file> -o <output file> [-p <proxy>] -n <pages> -t <timeout secs> -m <max results>`.
#[derive(Debug)]
pub struct SubprocessDorkRunner {
    binary: PathBuf,
    leading_args: Vec<String>,
}

impl SubprocessDorkRunner {
    /// Fails up front when the binary cannot be found.
    pub fn new(binary: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            binary: resolve_binary(binary)?,
            leading_args: Vec::new(),
        })
    }

    /// Arguments placed before the tool's own, e.g. a script for an interpreter.
    pub fn with_leading_args(mut self, args: Vec<String>) -> Self {
        self.leading_args = args;
        self
    }
}

#[async_trait]
impl DorkRunner for SubprocessDorkRunner {
    async fn run_dork_query(
        &self,
        query: &str,
        proxy: Option<&ProxyRecord>,
        limits: &DorkLimits,
    ) -> Result<Vec<String>, DorkError> {
        let workdir = tempfile::Builder::new()
            .prefix("nextscan-dork")
            .tempdir()
            .map_err(|source: std::io::Error| DorkError::Io {
                path: std::env::temp_dir(),
                source,
            })?;
        let query_file = workdir.path().join("query.txt");
        let output_file = workdir.path().join("results.txt");
        tokio::fs::write(&query_file, format!("{}\n", query))
            .await
            .map_err(|source| DorkError::Io {
                path: query_file.clone(),
                source,
            })?;

        let mut command = Command::new(&self.binary);
        command
            .args(&self.leading_args)
            .arg("-f")
            .arg(&query_file)
            .arg("-o")
            .arg(&output_file);
        if let Some(proxy) = proxy {
            command.arg("-p").arg(&proxy.address);
        }
        command
            .arg("-n")
            .arg(limits.pages.to_string())
            .arg("-t")
            .arg(limits.timeout.as_secs().to_string())
            .arg("-m")
            .arg(limits.max_results.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true);

        debug!(binary = %self.binary.display(), query = %query, proxy = ?proxy.map(|p| &p.address), "Running dork query.");
        let output = match tokio::time::timeout(limits.deadline(), command.output()).await {
            Ok(result) => result.map_err(|source| DorkError::Spawn {
                binary: self.binary.clone(),
                source,
            })?,
            Err(_) => return Err(DorkError::Timeout(limits.deadline())),
        };
        if !output.status.success() {
            return Err(DorkError::Exit(format!(
                "{}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        // No output file means no results.
        match tokio::fs::read_to_string(&output_file).await {
            Ok(text) => Ok(text.lines().map(str::to_string).collect()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(source) => Err(DorkError::Io {
                path: output_file,
                source,
            }),
        }
    }
}

/// Runs every query, optionally through pool proxies, and returns the union
/// of discovered targets in discovery order. A failing query is logged and
/// skipped.
///
/// # Arguments
/// * `runner` - Runs one query.
/// * `queries` - Dork queries, one tool run each.
/// * `pool` - Source of a proxy per query, if any.
/// * `limits` - Page, timeout and result limits handed to the tool.
pub async fn discover_targets(
    runner: &dyn DorkRunner,
    queries: &[String],
    pool: Option<&ProxyPool>,
    limits: &DorkLimits,
) -> Vec<Target> {
    let mut seen = HashSet::new();
    let mut targets = Vec::new();
    for query in queries {
        let proxy = pool.and_then(ProxyPool::select);
        let lines = match runner.run_dork_query(query, proxy.as_ref(), limits).await {
            Ok(lines) => lines,
            Err(err) => {
                warn!(query = %query, error = %err, "Dork query failed.");
                continue;
            }
        };
        let found = extract_domains(lines.iter().map(String::as_str), DEFAULT_EXCLUSION);
        info!(query = %query, domains = found.len(), "Dork query finished.");
        for domain in found {
            if let Some(target) = Target::parse(&format!("https://{}", domain)) {
                if seen.insert(target.clone()) {
                    targets.push(target);
                }
            }
        }
    }
    targets
}

/// Reads dork queries, one per line, `#` comments allowed.
pub async fn load_queries(path: &Path) -> Result<Vec<String>, DorkError> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| DorkError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}
