// src/core/proxy_pool.rs

//! Proxy rotation with permanent eviction.
//!
//! The pool moves through `Refreshing -> Selecting -> Dispatching` while it
//! has usable proxies. A refresh that yields zero usable proxies moves it to
//! `Exhausted`, which is terminal: `select` answers `None` from then on and
//! later refreshes are no-ops. Dead proxies go to a blacklist that lives as
//! long as the pool, so they are never rehabilitated by a refresh.
//!
//! A failed fetch leaves the pool `Selecting` and schedules the next allowed
//! fetch with exponential backoff, so an empty pool is re-fetched at most
//! once per backoff window no matter how many tasks are waiting on it.

use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use strum::Display;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::models::{ProxyHealth, ProxyRecord};
use crate::core::sources::{TextSource, parse_proxy_list};
use crate::error::FetchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum PoolState {
    Refreshing,
    Selecting,
    Dispatching,
    Exhausted,
}

/// Answer to a caller that found the pool empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    /// This many proxies are usable now.
    Ready(usize),
    /// The list could not be fetched; the next fetch is allowed at this instant.
    Backoff(Instant),
    Exhausted,
}

#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            attempts: 4,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    fn delay(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay)
    }
}

#[derive(Debug)]
struct PoolInner {
    alive: Vec<ProxyRecord>,
    blacklist: HashSet<String>,
    state: PoolState,
    /// Consecutive failures per alive proxy.
    strikes: HashMap<String, u32>,
    /// Consecutive failed fetches.
    fetch_failures: u32,
    next_fetch: Option<Instant>,
}

pub struct ProxyPool {
    source: Arc<dyn TextSource>,
    default_scheme: String,
    backoff: BackoffPolicy,
    strike_limit: u32,
    inner: Mutex<PoolInner>,
    // Keeps concurrent refreshes from racing each other.
    refresh_gate: tokio::sync::Mutex<()>,
}

impl ProxyPool {
    /// Creates an empty pool. Nothing is fetched until the first refresh.
    ///
    /// # Arguments
    ///
    /// * `source` - Where the proxy list comes from.
    /// * `default_scheme` - Scheme given to entries written as bare `host:port`.
    pub fn new(source: Arc<dyn TextSource>, default_scheme: impl Into<String>) -> Self {
        Self {
            source,
            default_scheme: default_scheme.into(),
            backoff: BackoffPolicy::default(),
            strike_limit: 1,
            inner: Mutex::new(PoolInner {
                alive: Vec::new(),
                blacklist: HashSet::new(),
                state: PoolState::Selecting,
                strikes: HashMap::new(),
                fetch_failures: 0,
                next_fetch: None,
            }),
            refresh_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Spacing between fetches after a failed one.
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Consecutive failures a proxy may have before it is evicted.
    pub fn with_strike_limit(mut self, limit: u32) -> Self {
        self.strike_limit = limit.max(1);
        self
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replaces the pool with a freshly fetched list, minus blacklisted
    /// entries.
    ///
    /// # Returns
    /// The number of usable proxies; `0` leaves the pool `Exhausted`. A fetch
    /// error keeps the current proxies and pushes the next allowed fetch out
    /// by the backoff delay.
    pub async fn refresh(&self) -> Result<usize, FetchError> {
        let _gate = self.refresh_gate.lock().await;
        self.refresh_locked().await
    }

    /// Makes sure an empty pool gets refilled, at most once per backoff
    /// window. Callers racing on an empty pool share a single fetch.
    ///
    /// # Returns
    ///
    /// * `Availability::Ready` when proxies are usable, possibly after a fetch.
    /// * `Availability::Backoff` when the last fetch failed and the next one
    ///   is not yet due.
    /// * `Availability::Exhausted` once a refresh has yielded nothing usable.
    pub async fn ensure_available(&self) -> Availability {
        let _gate = self.refresh_gate.lock().await;
        {
            let inner = self.lock();
            if inner.state == PoolState::Exhausted {
                return Availability::Exhausted;
            }
            if !inner.alive.is_empty() {
                return Availability::Ready(inner.alive.len());
            }
            if let Some(at) = inner.next_fetch.filter(|at| Instant::now() < *at) {
                return Availability::Backoff(at);
            }
        }
        match self.refresh_locked().await {
            Ok(0) => Availability::Exhausted,
            Ok(count) => Availability::Ready(count),
            Err(err) => {
                let at = self.next_fetch().unwrap_or_else(Instant::now);
                warn!(
                    error = %err,
                    retry_in = ?at.saturating_duration_since(Instant::now()),
                    "Proxy refresh failed while the pool was empty."
                );
                Availability::Backoff(at)
            }
        }
    }

    /// When the next fetch is allowed after a failure, if one is pending.
    pub fn next_fetch(&self) -> Option<Instant> {
        self.lock().next_fetch
    }

    async fn refresh_locked(&self) -> Result<usize, FetchError> {
        {
            let mut inner = self.lock();
            if inner.state == PoolState::Exhausted {
                return Ok(0);
            }
            inner.state = PoolState::Refreshing;
        }

        let text = match self.source.fetch().await {
            Ok(text) => text,
            Err(err) => {
                let mut inner = self.lock();
                inner.state = PoolState::Selecting;
                inner.next_fetch = Some(Instant::now() + self.backoff.delay(inner.fetch_failures));
                inner.fetch_failures = inner.fetch_failures.saturating_add(1);
                return Err(err);
            }
        };

        let mut inner = self.lock();
        inner.fetch_failures = 0;
        inner.next_fetch = None;
        let mut seen = HashSet::new();
        let fresh: Vec<ProxyRecord> = parse_proxy_list(&text, &self.default_scheme)
            .into_iter()
            .filter(|address| !inner.blacklist.contains(address) && seen.insert(address.clone()))
            .map(ProxyRecord::alive)
            .collect();
        let count = fresh.len();
        inner.strikes.retain(|address, _| fresh.iter().any(|p| &p.address == address));
        inner.alive = fresh;
        inner.state = if count == 0 {
            warn!(source = %self.source.describe(), "Proxy refresh yielded no usable proxies, pool exhausted.");
            PoolState::Exhausted
        } else {
            info!(count, blacklisted = inner.blacklist.len(), "Proxy pool refreshed.");
            PoolState::Selecting
        };
        Ok(count)
    }

    /// Retries `refresh` with exponential backoff on fetch errors.
    ///
    /// # Arguments
    /// * `policy` - Attempt count and delay bounds for this call.
    pub async fn refresh_with_backoff(&self, policy: &BackoffPolicy) -> Result<usize, FetchError> {
        let mut attempt = 0;
        loop {
            match self.refresh().await {
                Ok(count) => return Ok(count),
                Err(err) if attempt + 1 < policy.attempts => {
                    let delay = policy.delay(attempt);
                    warn!(error = %err, attempt = attempt + 1, retry_in = ?delay, "Proxy refresh failed, backing off.");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Picks a uniformly random alive proxy.
    ///
    /// # Returns
    ///
    /// * `Some(ProxyRecord)` - An alive proxy; the pool moves to `Dispatching`.
    /// * `None` - The pool is empty or exhausted. An empty pool is refilled
    ///   through `ensure_available`.
    pub fn select(&self) -> Option<ProxyRecord> {
        let mut inner = self.lock();
        if inner.state == PoolState::Exhausted {
            return None;
        }
        let picked = inner.alive.choose(&mut rand::thread_rng()).cloned();
        inner.state = if picked.is_some() {
            PoolState::Dispatching
        } else {
            PoolState::Selecting
        };
        picked
    }

    /// Evicts `proxy` for good. Returns true the first time a proxy dies.
    pub fn mark_dead(&self, proxy: &ProxyRecord) -> bool {
        let mut inner = self.lock();
        inner.strikes.remove(&proxy.address);
        inner.alive.retain(|p| p.address != proxy.address);
        let newly_dead = inner.blacklist.insert(proxy.address.clone());
        if newly_dead {
            warn!(proxy = %proxy.address, remaining = inner.alive.len(), "Proxy marked dead.");
        }
        newly_dead
    }

    /// Counts one failure against `proxy` and evicts it once it reaches the
    /// strike limit. Returns true when this call killed it.
    pub fn report_failure(&self, proxy: &ProxyRecord) -> bool {
        let strikes = {
            let mut inner = self.lock();
            if inner.blacklist.contains(&proxy.address) {
                return false;
            }
            let strikes = inner.strikes.entry(proxy.address.clone()).or_insert(0);
            *strikes += 1;
            *strikes
        };
        if strikes >= self.strike_limit {
            return self.mark_dead(proxy);
        }
        debug!(proxy = %proxy.address, strikes, limit = self.strike_limit, "Proxy failure counted.");
        false
    }

    /// Clears the failure count of a proxy that just carried a conclusive probe.
    pub fn report_success(&self, proxy: &ProxyRecord) {
        self.lock().strikes.remove(&proxy.address);
    }

    pub fn state(&self) -> PoolState {
        self.lock().state
    }

    pub fn is_exhausted(&self) -> bool {
        self.state() == PoolState::Exhausted
    }

    pub fn alive_count(&self) -> usize {
        self.lock().alive.len()
    }

    pub fn dead_count(&self) -> usize {
        self.lock().blacklist.len()
    }

    /// Every record the pool knows about, alive ones first.
    pub fn records(&self) -> Vec<ProxyRecord> {
        let inner = self.lock();
        let mut records = inner.alive.clone();
        records.extend(inner.blacklist.iter().map(|address| ProxyRecord {
            address: address.clone(),
            health: ProxyHealth::Dead,
        }));
        records
    }

    /// Refreshes the pool every `interval` until cancelled or exhausted.
    pub fn spawn_refresher(
        self: Arc<Self>,
        interval: Duration,
        backoff: BackoffPolicy,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                match self.refresh_with_backoff(&backoff).await {
                    Ok(_) if self.is_exhausted() => break,
                    Ok(count) => debug!(count, "Periodic proxy refresh done."),
                    Err(err) => warn!(error = %err, "Periodic proxy refresh gave up, keeping current pool."),
                }
            }
            debug!("Proxy refresher stopped.");
        })
    }
}
