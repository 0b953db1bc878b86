// src/core/scheduler.rs

//! Bounded-concurrency dispatch of targets to the prober.
//!
//! At most `concurrency` probes run at once in either dispatch mode. Results
//! are recorded into `ScanState` as they complete, in no particular order.

use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Semaphore, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::core::checkpoint::CheckpointCoordinator;
use crate::core::models::{DispatchMode, ProbeResult, ProxyMode, ProxyRecord, Target};
use crate::core::proxy_pool::{Availability, ProxyPool};
use crate::core::scanner::Prober;
use crate::core::state::ScanState;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub concurrency: usize,
    pub mode: DispatchMode,
    /// Chunked mode schedules `concurrency * chunk_factor` targets at a time.
    pub chunk_factor: usize,
    pub proxy_mode: ProxyMode,
    /// Extra attempts through a different proxy after a proxy failure.
    pub proxy_retries: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: 200,
            mode: DispatchMode::Bulk,
            chunk_factor: 5,
            proxy_mode: ProxyMode::Direct,
            proxy_retries: 1,
        }
    }
}

/// Keeps positions `index, index + count, index + 2 * count, ...`.
///
/// # Arguments
/// * `items` - The full, ordered target list.
/// * `index` - This instance's shard, below `count`.
/// * `count` - Number of cooperating instances. `0` and `1` keep everything.
///
/// # Returns
/// This shard's slice. The shards of one list are disjoint and cover it.
pub fn shard<T>(items: Vec<T>, index: usize, count: usize) -> Vec<T> {
    if count <= 1 {
        return items;
    }
    items.into_iter().skip(index).step_by(count).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    Completed,
    Cancelled,
    /// Proxies were required and the pool ran out for good.
    ProxyExhausted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanSummary {
    pub outcome: ScanOutcome,
    /// Targets whose probe completed and was recorded.
    pub probed: usize,
    /// Targets never admitted because the scan was stopping.
    pub skipped: usize,
}

enum Dispatch {
    Done(ProbeResult),
    Skipped,
}

/// Per-target work shared by every dispatch task.
struct Dispatcher {
    prober: Arc<Prober>,
    pool: Option<Arc<ProxyPool>>,
    state: Arc<ScanState>,
    checkpoints: Option<Arc<CheckpointCoordinator>>,
    proxy_mode: ProxyMode,
    proxy_retries: usize,
    cancel: CancellationToken,
    halted: AtomicBool,
}

impl Dispatcher {
    fn admission_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.halted.load(Ordering::SeqCst)
    }

    async fn dispatch(&self, target: &Target) -> Dispatch {
        let mut retries_left = self.proxy_retries;
        let mut last: Option<ProbeResult> = None;
        // Proxies that failed this target before a retry.
        let mut suspects: Vec<ProxyRecord> = Vec::new();
        loop {
            let Some(proxy) = self.choose_proxy().await else {
                // A retry that finds no proxy keeps the failed attempt.
                return last.map_or(Dispatch::Skipped, Dispatch::Done);
            };
            let result = self.prober.probe(target, proxy.as_ref()).await;

            if let ProbeResult::Inconclusive(kind) = &result {
                if let Some(p) = &proxy {
                    self.strike(p);
                    if retries_left > 0 && !self.halted.load(Ordering::SeqCst) {
                        retries_left -= 1;
                        debug!(site = %target, proxy = %p.address, error = %kind, "Retrying through another proxy.");
                        suspects.push(p.clone());
                        last = Some(result);
                        continue;
                    }
                }
                return Dispatch::Done(result);
            }

            // The target answered, so the earlier failures were the proxies'.
            if let (Some(pool), Some(p)) = (&self.pool, &proxy) {
                pool.report_success(p);
            }
            let carrier = proxy.as_ref().map(|p| p.address.as_str());
            for suspect in suspects.iter().filter(|s| Some(s.address.as_str()) != carrier) {
                self.evict(suspect);
            }
            return Dispatch::Done(result);
        }
    }

    /// `Some(None)` means probe directly, `None` means stop.
    ///
    /// An empty pool that is still waiting out a fetch backoff sends optional
    /// probes direct and parks required ones until the next fetch is due.
    /// Only a pool that is `Exhausted` halts a required scan.
    async fn choose_proxy(&self) -> Option<Option<ProxyRecord>> {
        let pool = match (&self.pool, self.proxy_mode) {
            (None, _) | (_, ProxyMode::Direct) => return Some(None),
            (Some(pool), _) => pool,
        };
        loop {
            if let Some(proxy) = pool.select() {
                return Some(Some(proxy));
            }
            match pool.ensure_available().await {
                Availability::Ready(_) => continue,
                Availability::Backoff(_) if self.proxy_mode == ProxyMode::Optional => return Some(None),
                Availability::Backoff(at) => {
                    debug!(retry_in = ?at.saturating_duration_since(Instant::now()), "Waiting for the proxy list.");
                    tokio::select! {
                        _ = self.cancel.cancelled() => return None,
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                Availability::Exhausted if self.proxy_mode == ProxyMode::Optional => return Some(None),
                Availability::Exhausted => {
                    if !self.halted.swap(true, Ordering::SeqCst) {
                        error!("No usable proxies left and proxies are required, halting scan.");
                    }
                    return None;
                }
            }
        }
    }

    /// Counts a failure against `proxy`; evicts it at the pool's strike limit.
    fn strike(&self, proxy: &ProxyRecord) {
        if let Some(pool) = &self.pool {
            if pool.report_failure(proxy) {
                self.on_proxy_dead(proxy);
            }
        }
    }

    fn evict(&self, proxy: &ProxyRecord) {
        if let Some(pool) = &self.pool {
            if pool.mark_dead(proxy) {
                self.on_proxy_dead(proxy);
            }
        }
    }

    fn on_proxy_dead(&self, proxy: &ProxyRecord) {
        self.state.record_dead_proxy();
        self.prober.client().forget_proxy(proxy);
    }

    fn record(&self, target: &Target, result: &ProbeResult) {
        if let ProbeResult::Inconclusive(kind) = result {
            debug!(site = %target, error = %kind, "Probe inconclusive.");
        }
        let attempt = self.state.record(target, result);
        if let Some(checkpoints) = &self.checkpoints {
            checkpoints.on_attempt(attempt);
        }
    }
}

// --- Scheduler ---

pub struct Scheduler {
    prober: Arc<Prober>,
    state: Arc<ScanState>,
    pool: Option<Arc<ProxyPool>>,
    checkpoints: Option<Arc<CheckpointCoordinator>>,
    config: SchedulerConfig,
    cancel: CancellationToken,
}

impl Scheduler {
    /// # Arguments
    /// * `prober` - Runs the probe chain for one target.
    /// * `state` - Receives every completed result.
    /// * `config` - Concurrency, dispatch mode and proxy policy.
    /// * `cancel` - Stops admission of new targets when fired.
    pub fn new(
        prober: Arc<Prober>,
        state: Arc<ScanState>,
        config: SchedulerConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            prober,
            state,
            pool: None,
            checkpoints: None,
            config,
            cancel,
        }
    }

    pub fn with_proxy_pool(mut self, pool: Arc<ProxyPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn with_checkpoints(mut self, checkpoints: Arc<CheckpointCoordinator>) -> Self {
        self.checkpoints = Some(checkpoints);
        self
    }

    /// Probes every target once and records each completed result.
    ///
    /// Admission stops when `cancel` fires or, with required proxies, when
    /// the pool is exhausted. Probes already running are always awaited.
    ///
    /// # Arguments
    /// * `targets` - This instance's targets, dispatched in order.
    ///
    /// # Returns
    /// A `ScanSummary` with the outcome and the probed and skipped counts.
    pub async fn run(&self, targets: Vec<Target>) -> ScanSummary {
        let total = targets.len();
        let concurrency = self.config.concurrency.max(1);
        info!(
            targets = total,
            concurrency,
            mode = %self.config.mode,
            proxies = %self.config.proxy_mode,
            "Starting scan."
        );

        let dispatcher = Arc::new(Dispatcher {
            prober: self.prober.clone(),
            pool: self.pool.clone(),
            state: self.state.clone(),
            checkpoints: self.checkpoints.clone(),
            proxy_mode: self.config.proxy_mode,
            proxy_retries: self.config.proxy_retries,
            cancel: self.cancel.clone(),
            halted: AtomicBool::new(false),
        });
        let mut tally = Tally::default();
        match self.config.mode {
            DispatchMode::Bulk => run_bulk(&dispatcher, targets, concurrency, &mut tally).await,
            DispatchMode::Chunked => {
                let chunk_size = concurrency.saturating_mul(self.config.chunk_factor.max(1));
                run_chunked(&dispatcher, targets, concurrency, chunk_size, &mut tally).await
            }
        }

        let outcome = if dispatcher.halted.load(Ordering::SeqCst) {
            ScanOutcome::ProxyExhausted
        } else if self.cancel.is_cancelled() && tally.skipped > 0 {
            ScanOutcome::Cancelled
        } else {
            ScanOutcome::Completed
        };
        info!(probed = tally.probed, skipped = tally.skipped, outcome = ?outcome, "Scan finished.");
        ScanSummary {
            outcome,
            probed: tally.probed,
            skipped: tally.skipped,
        }
    }
}

// --- Dispatch modes ---

/// Spawns every target up front behind a counting gate and drains
/// completions as they arrive.
async fn run_bulk(dispatcher: &Arc<Dispatcher>, targets: Vec<Target>, concurrency: usize, tally: &mut Tally) {
    let gate = Arc::new(Semaphore::new(concurrency));
    let (tx, mut rx) = mpsc::unbounded_channel();

    for target in targets {
        let gate = gate.clone();
        let dispatcher = dispatcher.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let outcome = match gate.acquire_owned().await {
                Ok(_permit) if !dispatcher.admission_closed() => dispatcher.dispatch(&target).await,
                _ => Dispatch::Skipped,
            };
            let _ = tx.send((target, outcome));
        });
    }
    drop(tx);

    while let Some((target, outcome)) = rx.recv().await {
        tally.absorb(dispatcher, &target, outcome);
    }
}

/// Drains one batch of `chunk_size` targets before scheduling the next.
async fn run_chunked(
    dispatcher: &Dispatcher,
    targets: Vec<Target>,
    concurrency: usize,
    chunk_size: usize,
    tally: &mut Tally,
) {
    for (index, chunk) in targets.chunks(chunk_size).enumerate() {
        if dispatcher.admission_closed() {
            tally.skipped += chunk.len();
            continue;
        }
        debug!(chunk = index, size = chunk.len(), "Dispatching chunk.");
        let mut completions = stream::iter(chunk)
            .map(|target| async move {
                let outcome = if dispatcher.admission_closed() {
                    Dispatch::Skipped
                } else {
                    dispatcher.dispatch(target).await
                };
                (target, outcome)
            })
            .buffer_unordered(concurrency);
        while let Some((target, outcome)) = completions.next().await {
            tally.absorb(dispatcher, target, outcome);
        }
    }
}

#[derive(Default)]
struct Tally {
    probed: usize,
    skipped: usize,
}

impl Tally {
    fn absorb(&mut self, dispatcher: &Dispatcher, target: &Target, outcome: Dispatch) {
        match outcome {
            Dispatch::Done(result) => {
                dispatcher.record(target, &result);
                self.probed += 1;
            }
            Dispatch::Skipped => self.skipped += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::scanner::ProberConfig;
    use crate::core::scanner::fingerprint_scanner::fake::{FakeClient, Reply};
    use crate::core::scanner::http_client::ProbeMethod;
    use crate::core::models::TransportErrorKind;
    use crate::core::proxy_pool::BackoffPolicy;
    use crate::core::sources::{StaticTextSource, TextSource};
    use crate::error::FetchError;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Proxy list that plays back canned fetches, repeating the last one.
    struct ScriptedSource {
        script: Vec<Option<&'static str>>,
        fetches: AtomicUsize,
    }

    impl ScriptedSource {
        fn new(script: Vec<Option<&'static str>>) -> Arc<Self> {
            Arc::new(Self {
                script,
                fetches: AtomicUsize::new(0),
            })
        }

        fn fetches(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TextSource for ScriptedSource {
        async fn fetch(&self) -> Result<String, FetchError> {
            let n = self.fetches.fetch_add(1, Ordering::SeqCst);
            match self.script[n.min(self.script.len() - 1)] {
                Some(text) => Ok(text.to_string()),
                None => Err(FetchError::Empty("scripted outage".into())),
            }
        }

        fn describe(&self) -> String {
            "scripted list".into()
        }
    }

    fn targets(n: usize) -> Vec<Target> {
        (0..n)
            .map(|i| Target::parse(&format!("host{}.test", i)).unwrap())
            .collect()
    }

    fn scheduler(client: Arc<FakeClient>, state: Arc<ScanState>, config: SchedulerConfig) -> Scheduler {
        let prober = Arc::new(Prober::new(client, ProberConfig::new(Duration::from_secs(1))));
        Scheduler::new(prober, state, config, CancellationToken::new())
    }

    async fn proxy_pool(list: &str) -> Arc<ProxyPool> {
        let pool = Arc::new(ProxyPool::new(Arc::new(StaticTextSource::new(list)), "http"));
        pool.refresh().await.unwrap();
        pool
    }

    #[tokio::test]
    async fn bulk_mode_never_exceeds_concurrency() {
        let client = Arc::new(FakeClient::new().with_delay(Duration::from_millis(10)));
        let state = Arc::new(ScanState::new());
        let config = SchedulerConfig {
            concurrency: 4,
            ..Default::default()
        };
        let summary = scheduler(client.clone(), state.clone(), config).run(targets(40)).await;

        assert_eq!(summary.outcome, ScanOutcome::Completed);
        assert_eq!(summary.probed, 40);
        assert_eq!(state.attempts(), 40);
        let peak = client.max_in_flight.load(Ordering::SeqCst);
        assert!(peak <= 4, "peak in-flight was {}", peak);
        assert!(peak >= 2, "expected some parallelism, peak was {}", peak);
    }

    #[tokio::test]
    async fn chunked_mode_never_exceeds_concurrency() {
        let client = Arc::new(FakeClient::new().with_delay(Duration::from_millis(5)));
        let state = Arc::new(ScanState::new());
        let config = SchedulerConfig {
            concurrency: 3,
            mode: DispatchMode::Chunked,
            chunk_factor: 2,
            ..Default::default()
        };
        let summary = scheduler(client.clone(), state.clone(), config).run(targets(25)).await;

        assert_eq!(summary.probed, 25);
        assert!(client.max_in_flight.load(Ordering::SeqCst) <= 3);
    }

    #[test]
    fn shards_partition_the_input() {
        let input: Vec<usize> = (0..23).collect();
        for count in 1..6 {
            let mut union: Vec<usize> = (0..count)
                .flat_map(|index| shard(input.clone(), index, count))
                .collect();
            union.sort();
            assert_eq!(union, input, "shard count {}", count);
        }
        assert_eq!(shard(input, 1, 4), vec![1, 5, 9, 13, 17, 21]);
    }

    #[tokio::test]
    async fn positives_are_recorded_once() {
        let client = Arc::new(FakeClient::new().on(
            ProbeMethod::Head,
            "https://host1.test/",
            Reply::Respond(200, vec![("x-powered-by", "Next.js")]),
        ));
        let state = Arc::new(ScanState::new());
        let mut input = targets(3);
        input.push(Target::parse("host1.test").unwrap());
        scheduler(client, state.clone(), SchedulerConfig::default()).run(input).await;

        let snap = state.snapshot();
        assert_eq!(snap.positives, vec!["https://host1.test"]);
        assert_eq!(snap.total_attempts, 4);
    }

    #[tokio::test]
    async fn broken_proxy_is_evicted_and_target_retried() {
        let client = Arc::new(
            FakeClient::new()
                .with_broken_proxy("http://10.0.0.1:80")
                .on(
                    ProbeMethod::Head,
                    "https://host0.test/",
                    Reply::Respond(200, vec![("server", "Vercel")]),
                ),
        );
        let state = Arc::new(ScanState::new());
        let pool = proxy_pool("10.0.0.1:80\n10.0.0.2:80\n").await;
        let config = SchedulerConfig {
            proxy_mode: ProxyMode::Required,
            proxy_retries: 2,
            ..Default::default()
        };
        let summary = scheduler(client, state.clone(), config)
            .with_proxy_pool(pool.clone())
            .run(targets(1))
            .await;

        assert_eq!(summary.outcome, ScanOutcome::Completed);
        let snap = state.snapshot();
        assert_eq!(snap.positives, vec!["https://host0.test"]);
        assert!(snap.dead_proxies <= 1);
        assert_eq!(pool.alive_count() + pool.dead_count(), 2);
    }

    #[tokio::test]
    async fn required_proxies_halt_when_pool_is_exhausted() {
        let client = Arc::new(FakeClient::new().with_broken_proxy("http://10.0.0.1:80"));
        let state = Arc::new(ScanState::new());
        let pool = proxy_pool("10.0.0.1:80\n").await;
        let config = SchedulerConfig {
            concurrency: 1,
            mode: DispatchMode::Chunked,
            proxy_mode: ProxyMode::Required,
            proxy_retries: 1,
            ..Default::default()
        };
        let summary = scheduler(client, state.clone(), config)
            .with_proxy_pool(pool.clone())
            .run(targets(5))
            .await;

        assert_eq!(summary.outcome, ScanOutcome::ProxyExhausted);
        assert_eq!(summary.probed, 1);
        assert_eq!(summary.skipped, 4);
        assert!(pool.is_exhausted());
        let snap = state.snapshot();
        assert_eq!(snap.dead_proxies, 1);
        assert_eq!(snap.inconclusive, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn required_scan_survives_a_failed_refetch() {
        let source = ScriptedSource::new(vec![
            Some("10.0.0.1:80\n10.0.0.2:80\n"),
            None,
            Some("10.0.0.1:80\n10.0.0.2:80\n10.0.0.3:80\n"),
        ]);
        let pool = Arc::new(ProxyPool::new(source.clone(), "http").with_backoff(BackoffPolicy {
            attempts: 1,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        }));
        pool.refresh().await.unwrap();

        let client = Arc::new(
            FakeClient::new()
                .with_broken_proxy("http://10.0.0.1:80")
                .with_broken_proxy("http://10.0.0.2:80")
                .on(
                    ProbeMethod::Head,
                    "https://host1.test/",
                    Reply::Respond(200, vec![("x-powered-by", "Next.js")]),
                ),
        );
        let state = Arc::new(ScanState::new());
        let config = SchedulerConfig {
            concurrency: 1,
            mode: DispatchMode::Chunked,
            proxy_mode: ProxyMode::Required,
            proxy_retries: 1,
            ..Default::default()
        };
        let summary = scheduler(client, state.clone(), config)
            .with_proxy_pool(pool.clone())
            .run(targets(3))
            .await;

        assert_eq!(summary.outcome, ScanOutcome::Completed);
        assert_eq!(summary.probed, 3);
        assert_eq!(summary.skipped, 0);
        assert!(!pool.is_exhausted());
        assert_eq!(source.fetches(), 3);
        let snap = state.snapshot();
        assert_eq!(snap.positives, vec!["https://host1.test"]);
        assert_eq!(snap.dead_proxies, 2);
    }

    #[tokio::test]
    async fn optional_scan_does_not_refetch_during_backoff() {
        let source = ScriptedSource::new(vec![None]);
        let pool = Arc::new(ProxyPool::new(source.clone(), "http"));
        assert!(pool.refresh().await.is_err());

        let client = Arc::new(FakeClient::new());
        let state = Arc::new(ScanState::new());
        let config = SchedulerConfig {
            concurrency: 8,
            proxy_mode: ProxyMode::Optional,
            ..Default::default()
        };
        let summary = scheduler(client.clone(), state, config)
            .with_proxy_pool(pool)
            .run(targets(50))
            .await;

        assert_eq!(summary.outcome, ScanOutcome::Completed);
        assert_eq!(summary.probed, 50);
        assert_eq!(source.fetches(), 1);
        assert!(client.calls.lock().unwrap().iter().all(|(_, _, proxy)| proxy.is_none()));
    }

    #[tokio::test]
    async fn dead_target_does_not_kill_healthy_proxies() {
        let client = Arc::new(
            FakeClient::new()
                .on(ProbeMethod::Head, "https://host0.test/", Reply::Fail(TransportErrorKind::Connect))
                .on(ProbeMethod::Get, "https://host0.test/", Reply::Fail(TransportErrorKind::Connect))
                .on(
                    ProbeMethod::Get,
                    "https://host0.test/_next/static/",
                    Reply::Fail(TransportErrorKind::Connect),
                )
                .on(
                    ProbeMethod::Head,
                    "https://host1.test/",
                    Reply::Respond(200, vec![("x-powered-by", "Next.js")]),
                ),
        );
        let pool = Arc::new(
            ProxyPool::new(Arc::new(StaticTextSource::new("10.0.0.1:80\n10.0.0.2:80\n")), "http")
                .with_strike_limit(3),
        );
        pool.refresh().await.unwrap();
        let state = Arc::new(ScanState::new());
        let config = SchedulerConfig {
            concurrency: 1,
            mode: DispatchMode::Chunked,
            proxy_mode: ProxyMode::Required,
            proxy_retries: 1,
            ..Default::default()
        };
        let summary = scheduler(client, state.clone(), config)
            .with_proxy_pool(pool.clone())
            .run(targets(2))
            .await;

        assert_eq!(summary.outcome, ScanOutcome::Completed);
        assert_eq!(pool.alive_count(), 2);
        let snap = state.snapshot();
        assert_eq!(snap.dead_proxies, 0);
        assert_eq!(snap.inconclusive, 1);
        assert_eq!(snap.positives, vec!["https://host1.test"]);
    }

    #[tokio::test]
    async fn optional_proxies_fall_back_to_direct() {
        let client = Arc::new(
            FakeClient::new()
                .with_broken_proxy("http://10.0.0.1:80")
                .on(
                    ProbeMethod::Head,
                    "https://host0.test/",
                    Reply::Respond(200, vec![("x-powered-by", "Next.js")]),
                ),
        );
        let state = Arc::new(ScanState::new());
        let pool = proxy_pool("10.0.0.1:80\n").await;
        let config = SchedulerConfig {
            proxy_mode: ProxyMode::Optional,
            proxy_retries: 1,
            ..Default::default()
        };
        let summary = scheduler(client.clone(), state.clone(), config)
            .with_proxy_pool(pool)
            .run(targets(1))
            .await;

        assert_eq!(summary.outcome, ScanOutcome::Completed);
        assert_eq!(state.snapshot().positives, vec!["https://host0.test"]);
        let direct_calls = client
            .calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, _, proxy)| proxy.is_none())
            .count();
        assert!(direct_calls >= 1);
    }

    #[tokio::test]
    async fn direct_mode_ignores_the_pool() {
        let client = Arc::new(FakeClient::new());
        let state = Arc::new(ScanState::new());
        let pool = proxy_pool("10.0.0.1:80\n").await;
        scheduler(client.clone(), state, SchedulerConfig::default())
            .with_proxy_pool(pool)
            .run(targets(2))
            .await;
        assert!(client.calls.lock().unwrap().iter().all(|(_, _, proxy)| proxy.is_none()));
    }

    #[tokio::test]
    async fn cancelled_scan_admits_nothing_new() {
        let client = Arc::new(FakeClient::new());
        let state = Arc::new(ScanState::new());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let prober = Arc::new(Prober::new(client.clone(), ProberConfig::new(Duration::from_secs(1))));
        let summary = Scheduler::new(prober, state.clone(), SchedulerConfig::default(), cancel)
            .run(targets(10))
            .await;

        assert_eq!(summary.outcome, ScanOutcome::Cancelled);
        assert_eq!(summary.skipped, 10);
        assert_eq!(client.total_calls(), 0);
        assert_eq!(state.attempts(), 0);
    }

    #[tokio::test]
    async fn cancellation_mid_scan_lets_in_flight_probes_finish() {
        let client = Arc::new(FakeClient::new().with_delay(Duration::from_millis(20)));
        let state = Arc::new(ScanState::new());
        let cancel = CancellationToken::new();
        let prober = Arc::new(Prober::new(client, ProberConfig::new(Duration::from_secs(1))));
        let config = SchedulerConfig {
            concurrency: 2,
            ..Default::default()
        };
        let scheduler = Scheduler::new(prober, state.clone(), config, cancel.clone());

        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });
        let summary = scheduler.run(targets(50)).await;
        stopper.await.unwrap();

        assert_eq!(summary.outcome, ScanOutcome::Cancelled);
        assert!(summary.probed > 0);
        assert_eq!(summary.probed + summary.skipped, 50);
        assert_eq!(state.attempts() as usize, summary.probed);
    }

    #[tokio::test]
    async fn count_trigger_is_fed_by_recorded_attempts() {
        use crate::core::archive::NoopArchiver;
        use crate::core::checkpoint::{CheckpointPaths, CheckpointTriggers};

        let dir = tempfile::tempdir().unwrap();
        let state = Arc::new(ScanState::new());
        let coordinator = Arc::new(CheckpointCoordinator::new(
            state.clone(),
            CheckpointPaths {
                results: dir.path().join("results.txt"),
                stats: dir.path().join("stats.txt"),
            },
            Arc::new(NoopArchiver),
            CheckpointTriggers {
                interval: None,
                every: Some(5),
            },
        ));
        let cancel = CancellationToken::new();
        let handle = coordinator.clone().spawn(cancel.clone());

        let client = Arc::new(FakeClient::new().on(
            ProbeMethod::Head,
            "https://host3.test/",
            Reply::Respond(200, vec![("x-powered-by", "Next.js")]),
        ));
        scheduler(client, state, SchedulerConfig::default())
            .with_checkpoints(coordinator.clone())
            .run(targets(10))
            .await;

        for _ in 0..200 {
            if coordinator.completed() >= 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();
        handle.await.unwrap();
        assert!(coordinator.completed() >= 1);
        assert!(dir.path().join("results.txt").exists());
    }
}
