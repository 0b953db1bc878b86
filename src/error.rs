// src/error.rs

use crate::core::models::TransportErrorKind;
use std::path::PathBuf;
use thiserror::Error;

/// A failed HTTP exchange. Never escapes the prober: each step turns it into
/// "no evidence" and the chain moves on.
#[derive(Error, Debug, Clone)]
#[error("{kind}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Classifies a reqwest error by walking its source chain.
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            TransportErrorKind::Timeout
        } else if err.is_decode() || err.is_body() || err.is_redirect() {
            TransportErrorKind::Malformed
        } else {
            classify_chain(err).unwrap_or(if err.is_connect() {
                TransportErrorKind::Connect
            } else {
                TransportErrorKind::Other
            })
        };
        Self::new(kind, err.to_string())
    }
}

fn classify_chain(err: &(dyn std::error::Error + 'static)) -> Option<TransportErrorKind> {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = current {
        let text = e.to_string().to_ascii_lowercase();
        if text.contains("dns") || text.contains("failed to lookup") || text.contains("resolve") {
            return Some(TransportErrorKind::Dns);
        }
        if text.contains("certificate") || text.contains("tls") || text.contains("handshake") {
            return Some(TransportErrorKind::Tls);
        }
        current = e.source();
    }
    None
}

/// Failure to retrieve a newline-delimited list (targets or proxies).
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} answered with status {status}")]
    Status { url: String, status: u16 },

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0} yielded no usable entries")]
    Empty(String),
}

/// Failure of the external archive step. Always logged, never fatal.
#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with {status}: {stderr}")]
    Exit {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("cannot resolve {path}: {source}")]
    Path {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failure of the external dork-search tool.
#[derive(Error, Debug)]
pub enum DorkError {
    #[error("failed to run dork tool {binary}: {source}")]
    Spawn {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("dork tool exited with {0}")]
    Exit(String),

    #[error("dork tool did not finish within {0:?}")]
    Timeout(std::time::Duration),

    #[error("dork tool file error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Invalid process configuration, reported before any work begins.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("concurrency must be at least 1")]
    ZeroConcurrency,

    #[error("shard index {index} is out of range for {count} shard(s)")]
    InvalidShard { index: usize, count: usize },

    #[error("proxy mode `{0}` needs --proxy-url or --proxy-file")]
    MissingProxySource(String),

    #[error("dork tool binary not found: {0}")]
    MissingDorkBinary(String),

    #[error("{0}")]
    Invalid(String),
}

/// Top-level failure of a scan run.
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("target list fetch failed: {0}")]
    ListFetch(#[source] FetchError),

    #[error("proxy list fetch failed: {0}")]
    ProxyFetch(#[source] FetchError),

    #[error("dork search failed: {0}")]
    Dork(#[from] DorkError),

    #[error("checkpoint write failed at {path}: {source}")]
    Checkpoint {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

pub type ScanResult<T> = Result<T, ScanError>;
