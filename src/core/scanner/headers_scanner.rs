// src/core/scanner/headers_scanner.rs

use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::HeaderMap;
use tracing::{debug, warn};

/// A header-based framework signature: a case-insensitive pattern matched
/// against the value of one response header.
struct HeaderSignature<'a> {
    /// Lowercase header name (e.g. "x-powered-by").
    header: &'a str,
    /// What the match means, used only for logging.
    label: &'a str,
    pattern: &'a Lazy<Regex>,
}

static RE_NEXTJS_POWERED_BY: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)next\.js").unwrap());
static RE_VERCEL_SERVER: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)vercel").unwrap());

/// Every signature that identifies the framework from headers alone.
static SIGNATURES: &[HeaderSignature] = &[
    HeaderSignature { header: "x-powered-by", label: "Next.js powered-by", pattern: &RE_NEXTJS_POWERED_BY },
    HeaderSignature { header: "server", label: "Vercel hosting", pattern: &RE_VERCEL_SERVER },
];

/// Reads a header as text. Non-UTF-8 values are treated as absent.
fn header_text<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    let value = headers.get(name)?;
    match value.to_str() {
        Ok(s) => Some(s),
        Err(_) => {
            warn!(header_name = name, "Header found but contained invalid UTF-8.");
            None
        }
    }
}

/// Returns true when any header signature matches.
pub fn has_framework_signature(headers: &HeaderMap) -> bool {
    SIGNATURES.iter().any(|sig| {
        let matched = header_text(headers, sig.header).is_some_and(|v| sig.pattern.is_match(v));
        if matched {
            debug!(header_name = sig.header, signature = sig.label, "Header signature matched.");
        }
        matched
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(*k, HeaderValue::from_static(v));
        }
        map
    }

    #[test]
    fn matches_powered_by_case_insensitively() {
        assert!(has_framework_signature(&headers(&[("x-powered-by", "Next.js")])));
        assert!(has_framework_signature(&headers(&[("x-powered-by", "NEXT.JS 14.1")])));
    }

    #[test]
    fn matches_hosting_platform_on_server() {
        assert!(has_framework_signature(&headers(&[("server", "Vercel")])));
    }

    #[test]
    fn ignores_unrelated_headers() {
        assert!(!has_framework_signature(&headers(&[("x-powered-by", "Express"), ("server", "nginx")])));
        assert!(!has_framework_signature(&headers(&[("x-note", "next.js")])));
        assert!(!has_framework_signature(&HeaderMap::new()));
    }
}
