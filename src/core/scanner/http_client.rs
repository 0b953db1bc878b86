// src/core/scanner/http_client.rs

//! HTTP capability used by the prober.
//!
//! The prober only sees `ProbeClient`; the reqwest adapter below keeps one
//! pair of clients (redirect-following and not) per egress route so
//! connection pools are reused across targets.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, UPGRADE_INSECURE_REQUESTS};
use reqwest::redirect::Policy;
use reqwest::{Client, Method, Proxy};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::core::models::{ProxyRecord, TransportErrorKind};
use crate::error::TransportError;

const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProbeMethod {
    Head,
    Get,
}

#[derive(Debug, Clone)]
pub struct ProbeRequest {
    pub method: ProbeMethod,
    pub url: Url,
    pub follow_redirects: bool,
}

/// Status line and headers of a response. Bodies are never read.
#[derive(Debug, Clone, Default)]
pub struct ProbeResponse {
    pub status: u16,
    pub headers: HeaderMap,
}

#[async_trait]
pub trait ProbeClient: Send + Sync {
    async fn send(
        &self,
        request: &ProbeRequest,
        proxy: Option<&ProxyRecord>,
    ) -> Result<ProbeResponse, TransportError>;

    /// Drops any cached state tied to a proxy that will not be used again.
    fn forget_proxy(&self, _proxy: &ProxyRecord) {}
}

#[derive(Clone)]
struct ClientPair {
    following: Client,
    direct: Client,
}

/// reqwest-backed `ProbeClient`.
pub struct ReqwestProbeClient {
    timeout: Duration,
    pool_size: usize,
    routes: Mutex<HashMap<Option<String>, ClientPair>>,
}

impl ReqwestProbeClient {
    pub fn new(timeout: Duration, pool_size: usize) -> Result<Self, reqwest::Error> {
        let this = Self {
            timeout,
            pool_size,
            routes: Mutex::new(HashMap::new()),
        };
        // Build the direct route eagerly so a broken TLS backend surfaces at startup.
        let direct = this.build_pair(None)?;
        this.lock_routes().insert(None, direct);
        Ok(this)
    }

    fn lock_routes(&self) -> std::sync::MutexGuard<'_, HashMap<Option<String>, ClientPair>> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn build_pair(&self, proxy: Option<&str>) -> Result<ClientPair, reqwest::Error> {
        Ok(ClientPair {
            following: self.build_client(proxy, Policy::limited(10))?,
            direct: self.build_client(proxy, Policy::none())?,
        })
    }

    fn build_client(&self, proxy: Option<&str>, redirect: Policy) -> Result<Client, reqwest::Error> {
        let mut builder = Client::builder()
            .default_headers(default_headers())
            .user_agent(BROWSER_USER_AGENT)
            .danger_accept_invalid_certs(true)
            .redirect(redirect)
            .timeout(self.timeout)
            .connect_timeout(self.timeout)
            .pool_max_idle_per_host(self.pool_size);
        builder = match proxy {
            Some(address) => builder.proxy(Proxy::all(address)?),
            None => builder.no_proxy(),
        };
        builder.build()
    }

    fn client_for(&self, proxy: Option<&ProxyRecord>, follow: bool) -> Result<Client, TransportError> {
        let key = proxy.map(|p| p.address.clone());
        if let Some(pair) = self.lock_routes().get(&key) {
            return Ok(pick(pair, follow));
        }
        let pair = self
            .build_pair(key.as_deref())
            .map_err(|e| TransportError::new(TransportErrorKind::Other, e.to_string()))?;
        let client = pick(&pair, follow);
        self.lock_routes().insert(key, pair);
        Ok(client)
    }
}

fn pick(pair: &ClientPair, follow: bool) -> Client {
    if follow {
        pair.following.clone()
    } else {
        pair.direct.clone()
    }
}

fn default_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        ACCEPT,
        HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
    );
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));
    headers.insert(UPGRADE_INSECURE_REQUESTS, HeaderValue::from_static("1"));
    headers
}

#[async_trait]
impl ProbeClient for ReqwestProbeClient {
    async fn send(
        &self,
        request: &ProbeRequest,
        proxy: Option<&ProxyRecord>,
    ) -> Result<ProbeResponse, TransportError> {
        let client = self.client_for(proxy, request.follow_redirects)?;
        let method = match request.method {
            ProbeMethod::Head => Method::HEAD,
            ProbeMethod::Get => Method::GET,
        };
        let response = client
            .request(method, request.url.clone())
            .send()
            .await
            .map_err(|e| TransportError::from_reqwest(&e))?;
        debug!(url = %request.url, status = %response.status(), "Received response.");
        Ok(ProbeResponse {
            status: response.status().as_u16(),
            headers: response.headers().clone(),
        })
    }

    fn forget_proxy(&self, proxy: &ProxyRecord) {
        self.lock_routes().remove(&Some(proxy.address.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caches_one_route_per_proxy_and_forgets_dead_ones() {
        let client = ReqwestProbeClient::new(Duration::from_secs(1), 4).unwrap();
        let proxy = ProxyRecord::alive("http://127.0.0.1:3128");

        client.client_for(Some(&proxy), true).unwrap();
        client.client_for(Some(&proxy), false).unwrap();
        assert_eq!(client.lock_routes().len(), 2);

        client.forget_proxy(&proxy);
        assert_eq!(client.lock_routes().len(), 1);
        assert!(client.lock_routes().contains_key(&None));
    }
}
