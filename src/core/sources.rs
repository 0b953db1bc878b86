// src/core/sources.rs

//! Newline-delimited list sources for targets and proxies.

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

use crate::core::models::Target;
use crate::error::FetchError;

/// Timeout for list downloads, independent of the probe timeout.
pub const LIST_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Anything that can hand back a newline-delimited text document.
#[async_trait]
pub trait TextSource: Send + Sync {
    async fn fetch(&self) -> Result<String, FetchError>;

    /// Human-readable origin, for logs and errors.
    fn describe(&self) -> String;
}

/// Plain HTTP GET of a text document.
pub struct HttpTextSource {
    url: String,
    client: reqwest::Client,
}

impl HttpTextSource {
    pub fn new(url: impl Into<String>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(LIST_FETCH_TIMEOUT).build()?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

#[async_trait]
impl TextSource for HttpTextSource {
    async fn fetch(&self) -> Result<String, FetchError> {
        debug!(url = %self.url, "Fetching list.");
        let http_err = |source: reqwest::Error| FetchError::Http {
            url: self.url.clone(),
            source,
        };
        let response = self.client.get(&self.url).send().await.map_err(http_err)?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: self.url.clone(),
                status: status.as_u16(),
            });
        }
        response.text().await.map_err(http_err)
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

/// A local file, re-read on every fetch.
pub struct FileTextSource {
    path: PathBuf,
}

impl FileTextSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl TextSource for FileTextSource {
    async fn fetch(&self) -> Result<String, FetchError> {
        tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| FetchError::Io {
                path: self.path.clone(),
                source,
            })
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// An in-memory document, mostly useful for fixtures and inline lists.
pub struct StaticTextSource {
    text: String,
}

impl StaticTextSource {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

#[async_trait]
impl TextSource for StaticTextSource {
    async fn fetch(&self) -> Result<String, FetchError> {
        Ok(self.text.clone())
    }

    fn describe(&self) -> String {
        "inline list".to_string()
    }
}

/// Parses a site list where each line is `<rank> <domain>[,]`.
///
/// The second whitespace-separated field is the domain; commas are stripped
/// and the result is normalized to `https://<domain>`. Lines with fewer than
/// two fields are skipped.
pub fn parse_site_list(text: &str) -> Vec<Target> {
    text.lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let _rank = fields.next()?;
            let domain = fields.next()?.replace(',', "");
            if domain.is_empty() {
                return None;
            }
            Target::parse(&format!("https://{}", domain))
        })
        .collect()
}

/// Parses a plain target list: one host or URL per line, `#` comments allowed.
pub fn parse_target_lines(text: &str) -> Vec<Target> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(Target::parse)
        .collect()
}

/// Parses a proxy list, giving scheme-less entries `<scheme>://`.
pub fn parse_proxy_list(text: &str, default_scheme: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| normalize_proxy(line, default_scheme))
        .collect()
}

pub fn normalize_proxy(entry: &str, default_scheme: &str) -> String {
    if entry.contains("://") {
        entry.to_string()
    } else {
        format!("{}://{}", default_scheme, entry)
    }
}

/// Fetches and parses the site list. An empty result is an error: there is
/// nothing to scan.
///
/// # Arguments
/// * `source` - Where the list text comes from.
/// * `ranked` - Parse `<rank> <domain>` lines instead of one host per line.
///
/// # Returns
/// The targets in list order, or a `FetchError` when the fetch failed or
/// produced no usable target.
pub async fn load_site_list(source: &dyn TextSource, ranked: bool) -> Result<Vec<Target>, FetchError> {
    let text = source.fetch().await?;
    let targets = if ranked {
        parse_site_list(&text)
    } else {
        parse_target_lines(&text)
    };
    if targets.is_empty() {
        return Err(FetchError::Empty(source.describe()));
    }
    info!(count = targets.len(), source = %source.describe(), "Loaded sites.");
    Ok(targets)
}
