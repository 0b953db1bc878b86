// src/core/models.rs

use serde::{Deserialize, Serialize};
use std::fmt;
use strum::{AsRefStr, Display};
use url::Url;

// --- Target ---

/// A normalized origin (scheme + host, optional explicit port, never a path).
///
/// Two targets are the same target when their normalized strings are equal,
/// which is what makes the positive set a union rather than an append log.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Target(String);

impl Target {
    /// Normalizes a raw candidate into an origin.
    ///
    /// Bare domains get an `https://` prefix. Anything after the authority
    /// (path, query, fragment) is dropped. Returns `None` for input that does
    /// not carry a usable host.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        let with_scheme = if raw.contains("://") {
            raw.to_string()
        } else {
            format!("https://{}", raw)
        };
        let url = Url::parse(&with_scheme).ok()?;
        if !matches!(url.scheme(), "http" | "https") {
            return None;
        }
        let host = url.host_str()?.to_ascii_lowercase();
        let origin = match url.port() {
            Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
            None => format!("{}://{}", url.scheme(), host),
        };
        Some(Self(origin))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Builds the absolute URL of `path` on this origin.
    pub fn join(&self, path: &str) -> Option<Url> {
        Url::parse(&self.0).ok()?.join(path).ok()
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// --- Probe outcome ---

/// The signal that justified a positive classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr, Serialize, Deserialize)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum Evidence {
    HeadHeader,
    GetHeader,
    StaticPathStatus,
}

/// Coarse classification of a transport-level failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr, Serialize, Deserialize)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum TransportErrorKind {
    Timeout,
    Connect,
    Dns,
    Tls,
    Malformed,
    Other,
}

/// Tagged outcome of running the probe chain against one target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "kebab-case")]
pub enum ProbeResult {
    Positive(Evidence),
    Negative,
    Inconclusive(TransportErrorKind),
}

impl ProbeResult {
    pub fn is_positive(&self) -> bool {
        matches!(self, ProbeResult::Positive(_))
    }
}

// --- Proxies ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
pub enum ProxyHealth {
    Alive,
    Dead,
}

/// An egress proxy address, always carrying a scheme prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyRecord {
    pub address: String,
    pub health: ProxyHealth,
}

impl ProxyRecord {
    pub fn alive(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            health: ProxyHealth::Alive,
        }
    }
}

// --- Dispatch disciplines ---

/// How the scheduler consults the proxy pool on each dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, clap::ValueEnum)]
#[strum(serialize_all = "lowercase")]
pub enum ProxyMode {
    /// Never use a proxy.
    Direct,
    /// Use a proxy when one is available, probe directly otherwise.
    Optional,
    /// Every probe goes through a proxy; an exhausted pool halts the scan.
    Required,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, clap::ValueEnum)]
#[strum(serialize_all = "lowercase")]
pub enum DispatchMode {
    Bulk,
    Chunked,
}

// --- Snapshots ---

/// A point-in-time copy of the scan state, as written at each checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanSnapshot {
    /// Positive targets in lexicographic order.
    pub positives: Vec<String>,
    pub total_attempts: u64,
    pub inconclusive: u64,
    pub dead_proxies: u64,
    pub sessions: u64,
    pub commits: u64,
    pub elapsed_secs: f64,
}

impl ScanSnapshot {
    pub fn total_positives(&self) -> usize {
        self.positives.len()
    }

    /// Probe attempts per hour over the elapsed time of this session.
    pub fn rate_per_hour(&self) -> f64 {
        if self.elapsed_secs <= f64::EPSILON {
            return 0.0;
        }
        self.total_attempts as f64 * 3600.0 / self.elapsed_secs
    }
}
