// src/core/scanner/fingerprint_scanner.rs

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::headers_scanner::has_framework_signature;
use super::http_client::{ProbeClient, ProbeMethod, ProbeRequest};
use crate::core::models::{Evidence, ProbeResult, ProxyRecord, Target, TransportErrorKind};
use crate::error::TransportError;

/// Well-known static asset subpath probed as the last step of the chain.
pub const STATIC_ASSET_PATH: &str = "/_next/static/";

/// Static-path statuses accepted as evidence by default.
pub const DEFAULT_ACCEPTED_STATUSES: [u16; 3] = [200, 301, 302];

#[derive(Debug, Clone)]
pub struct ProberConfig {
    /// Independent timeout applied to every step.
    pub step_timeout: Duration,
    pub accepted_statuses: Vec<u16>,
    pub static_path: String,
}

impl ProberConfig {
    pub fn new(step_timeout: Duration) -> Self {
        Self {
            step_timeout,
            accepted_statuses: DEFAULT_ACCEPTED_STATUSES.to_vec(),
            static_path: STATIC_ASSET_PATH.to_string(),
        }
    }

    /// Also treat 403 on the static path as evidence.
    pub fn accept_forbidden(mut self) -> Self {
        if !self.accepted_statuses.contains(&403) {
            self.accepted_statuses.push(403);
        }
        self
    }
}

/// One step of the probe chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    HeadRoot,
    GetRoot,
    StaticPath,
}

impl Step {
    /// Fixed priority order: cheap and precise header checks come first.
    const CHAIN: [Step; 3] = [Step::HeadRoot, Step::GetRoot, Step::StaticPath];

    fn evidence(self) -> Evidence {
        match self {
            Step::HeadRoot => Evidence::HeadHeader,
            Step::GetRoot => Evidence::GetHeader,
            Step::StaticPath => Evidence::StaticPathStatus,
        }
    }
}

enum StepOutcome {
    Evidence,
    NoEvidence,
    Transport(TransportError),
}

/// Runs the fingerprint probe chain against single targets.
pub struct Prober {
    client: Arc<dyn ProbeClient>,
    config: ProberConfig,
}

impl Prober {
    pub fn new(client: Arc<dyn ProbeClient>, config: ProberConfig) -> Self {
        Self { client, config }
    }

    pub fn client(&self) -> &Arc<dyn ProbeClient> {
        &self.client
    }

    /// Classifies `target`, optionally routing every step through `proxy`.
    ///
    /// Steps short-circuit on the first match. A transport failure at one
    /// step only means "no evidence from this step"; the result is
    /// `Inconclusive` only when every step failed at the transport layer.
    /// Wall time is bounded by the number of steps times the step timeout.
    ///
    /// # Arguments
    /// * `target` - The origin to probe.
    /// * `proxy` - Egress proxy for every step, or `None` for direct.
    pub async fn probe(&self, target: &Target, proxy: Option<&ProxyRecord>) -> ProbeResult {
        let mut last_error: Option<TransportErrorKind> = None;
        let mut answered = false;

        for step in Step::CHAIN {
            match self.run_step(step, target, proxy).await {
                StepOutcome::Evidence => {
                    info!(site = %target, "[+] {} -> Next.js suspected ({})", target, step.evidence());
                    return ProbeResult::Positive(step.evidence());
                }
                StepOutcome::NoEvidence => answered = true,
                StepOutcome::Transport(err) => {
                    debug!(site = %target, step = ?step, error = %err, "Probe step failed.");
                    last_error = Some(err.kind);
                }
            }
        }

        match (answered, last_error) {
            (false, Some(kind)) => ProbeResult::Inconclusive(kind),
            _ => ProbeResult::Negative,
        }
    }

    async fn run_step(&self, step: Step, target: &Target, proxy: Option<&ProxyRecord>) -> StepOutcome {
        let (method, path, follow_redirects) = match step {
            Step::HeadRoot => (ProbeMethod::Head, "/", true),
            Step::GetRoot => (ProbeMethod::Get, "/", true),
            // Redirect statuses are evidence here, so they must stay observable.
            Step::StaticPath => (ProbeMethod::Get, self.config.static_path.as_str(), false),
        };
        let Some(url) = target.join(path) else {
            return StepOutcome::Transport(TransportError::new(
                TransportErrorKind::Malformed,
                format!("cannot build URL for {}{}", target, path),
            ));
        };
        let request = ProbeRequest {
            method,
            url,
            follow_redirects,
        };

        let response = match tokio::time::timeout(self.config.step_timeout, self.client.send(&request, proxy)).await {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => return StepOutcome::Transport(err),
            Err(_) => {
                return StepOutcome::Transport(TransportError::new(
                    TransportErrorKind::Timeout,
                    format!("no response within {:?}", self.config.step_timeout),
                ));
            }
        };

        debug!(site = %target, step = ?step, status = response.status, "Probe step answered.");
        let matched = match step {
            Step::HeadRoot | Step::GetRoot => has_framework_signature(&response.headers),
            Step::StaticPath => self.config.accepted_statuses.contains(&response.status),
        };
        if matched {
            StepOutcome::Evidence
        } else {
            StepOutcome::NoEvidence
        }
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! Scripted `ProbeClient` used by unit tests across the crate.

    use super::*;
    use crate::core::scanner::http_client::ProbeResponse;
    use async_trait::async_trait;
    use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// What the fake answers for one (method, url) pair.
    #[derive(Clone)]
    pub enum Reply {
        Respond(u16, Vec<(&'static str, &'static str)>),
        Fail(TransportErrorKind),
        Hang,
    }

    #[derive(Default)]
    pub struct FakeClient {
        replies: HashMap<(ProbeMethod, String), Reply>,
        /// Proxies that refuse every request routed through them.
        broken_proxies: Vec<String>,
        pub delay: Duration,
        pub calls: Mutex<Vec<(ProbeMethod, String, Option<String>)>>,
        pub in_flight: AtomicUsize,
        pub max_in_flight: AtomicUsize,
    }

    impl FakeClient {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn on(mut self, method: ProbeMethod, url: &str, reply: Reply) -> Self {
            self.replies.insert((method, url.to_string()), reply);
            self
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        pub fn with_broken_proxy(mut self, address: &str) -> Self {
            self.broken_proxies.push(address.to_string());
            self
        }

        pub fn call_count(&self, method: ProbeMethod) -> usize {
            self.calls.lock().unwrap().iter().filter(|(m, _, _)| *m == method).count()
        }

        pub fn total_calls(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ProbeClient for FakeClient {
        async fn send(
            &self,
            request: &ProbeRequest,
            proxy: Option<&ProxyRecord>,
        ) -> Result<ProbeResponse, TransportError> {
            self.calls.lock().unwrap().push((
                request.method,
                request.url.to_string(),
                proxy.map(|p| p.address.clone()),
            ));
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if let Some(p) = proxy {
                if self.broken_proxies.contains(&p.address) {
                    return Err(TransportError::new(TransportErrorKind::Connect, "proxy refused"));
                }
            }

            let reply = self
                .replies
                .get(&(request.method, request.url.to_string()))
                .cloned()
                .unwrap_or(Reply::Respond(404, Vec::new()));
            match reply {
                Reply::Respond(status, pairs) => {
                    let mut headers = HeaderMap::new();
                    for (k, v) in pairs {
                        headers.insert(HeaderName::from_static(k), HeaderValue::from_static(v));
                    }
                    Ok(ProbeResponse { status, headers })
                }
                Reply::Fail(kind) => Err(TransportError::new(kind, "scripted failure")),
                Reply::Hang => std::future::pending().await,
            }
        }
    }
}
