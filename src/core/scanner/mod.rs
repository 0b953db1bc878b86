// src/core/scanner/mod.rs

// The fingerprint prober: an HTTP capability, the header signature rules,
// and the ordered probe chain built on top of both.
pub mod fingerprint_scanner;
pub mod headers_scanner;
pub mod http_client;

pub use self::fingerprint_scanner::{Prober, ProberConfig, DEFAULT_ACCEPTED_STATUSES, STATIC_ASSET_PATH};
pub use self::http_client::{ProbeClient, ProbeMethod, ProbeRequest, ProbeResponse, ReqwestProbeClient};
