// src/runner.rs

//! Wires one complete scan: targets, proxies, state, checkpoints, scheduler.

use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{ProxySource, ScanConfig, TargetSource};
use crate::core::archive::{Archiver, GitArchiver, NoopArchiver};
use crate::core::checkpoint::{CheckpointCoordinator, load_previous};
use crate::core::dork::{SubprocessDorkRunner, discover_targets, load_queries};
use crate::core::models::{ProxyMode, ScanSnapshot, Target};
use crate::core::proxy_pool::{BackoffPolicy, ProxyPool};
use crate::core::scanner::{ProbeClient, Prober, ProberConfig, ReqwestProbeClient};
use crate::core::scheduler::{ScanOutcome, ScanSummary, Scheduler, shard};
use crate::core::sources::{FileTextSource, HttpTextSource, TextSource, load_site_list};
use crate::core::state::ScanState;
use crate::error::{ConfigError, FetchError, ScanError, ScanResult};

/// The collaborators a scan talks to.
pub struct Services {
    pub client: Arc<dyn ProbeClient>,
    pub archiver: Arc<dyn Archiver>,
    pub proxy_source: Option<Arc<dyn TextSource>>,
}

impl Services {
    /// Real HTTP, git and proxy-list collaborators for `config`.
    pub fn from_config(config: &ScanConfig) -> ScanResult<Self> {
        let client = ReqwestProbeClient::new(config.timeout, config.scheduler.concurrency)
            .map_err(ScanError::Client)?;
        let archiver: Arc<dyn Archiver> = match &config.archive {
            Some(archive) => Arc::new(GitArchiver::new(&archive.repo, &archive.branch, &archive.remote)),
            None => Arc::new(NoopArchiver),
        };
        let proxy_source: Option<Arc<dyn TextSource>> = match &config.proxy.source {
            Some(ProxySource::Url(url)) => Some(Arc::new(HttpTextSource::new(url).map_err(ScanError::Client)?)),
            Some(ProxySource::File(path)) => Some(Arc::new(FileTextSource::new(path))),
            None => None,
        };
        Ok(Self {
            client: Arc::new(client),
            archiver,
            proxy_source,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    #[serde(skip)]
    pub summary: ScanSummary,
    pub outcome: String,
    pub snapshot: ScanSnapshot,
    pub checkpoints: u64,
}

/// Runs a scan with real collaborators.
pub async fn run(config: &ScanConfig, cancel: CancellationToken) -> ScanResult<RunReport> {
    let services = Services::from_config(config)?;
    run_with(config, services, cancel).await
}

/// Runs a scan until every target is probed, `cancel` fires, or a required
/// proxy pool runs dry. A final checkpoint is always attempted.
pub async fn run_with(config: &ScanConfig, services: Services, cancel: CancellationToken) -> ScanResult<RunReport> {
    // Missing tools are reported before any network work.
    let dork_runner = match &config.target_source {
        TargetSource::Dork {
            binary, leading_args, ..
        } => Some(SubprocessDorkRunner::new(binary)?.with_leading_args(leading_args.clone())),
        _ => None,
    };

    let pool = prepare_pool(config, services.proxy_source).await?;

    let targets = match (&config.target_source, dork_runner) {
        (TargetSource::ListUrl(url), _) => {
            let source = HttpTextSource::new(url).map_err(ScanError::Client)?;
            load_site_list(&source, true).await.map_err(ScanError::ListFetch)?
        }
        (TargetSource::File { path, ranked }, _) => load_site_list(&FileTextSource::new(path), *ranked)
            .await
            .map_err(ScanError::ListFetch)?,
        (TargetSource::Dork { queries, limits, .. }, Some(runner)) => {
            let queries = load_queries(queries).await?;
            let found = discover_targets(&runner, &queries, pool.as_deref(), limits).await;
            if found.is_empty() {
                return Err(ScanError::ListFetch(FetchError::Empty("dork queries".into())));
            }
            found
        }
        (TargetSource::Dork { binary, .. }, None) => {
            return Err(ConfigError::MissingDorkBinary(binary.clone()).into());
        }
    };

    let total = targets.len();
    let targets: Vec<Target> = shard(targets, config.shard_index, config.shard_count);
    info!(
        shard = config.shard_index,
        shards = config.shard_count,
        assigned = targets.len(),
        total,
        "Targets assigned to this shard."
    );
    if targets.is_empty() {
        warn!("This shard has no targets.");
    }

    let state = Arc::new(if config.resume {
        let previous = load_previous(&config.paths).await;
        ScanState::resumed(previous.positives, previous.sessions, previous.commits)
    } else {
        ScanState::new()
    });

    let background = CancellationToken::new();
    let coordinator = Arc::new(CheckpointCoordinator::new(
        state.clone(),
        config.paths.clone(),
        services.archiver,
        config.triggers.clone(),
    ));
    let checkpoint_task = coordinator.clone().spawn(background.clone());
    let refresher_task = match (&pool, config.proxy.refresh_every) {
        (Some(pool), Some(every)) => {
            Some(pool.clone().spawn_refresher(every, BackoffPolicy::default(), background.clone()))
        }
        _ => None,
    };

    let mut prober_config = ProberConfig::new(config.timeout);
    if config.accept_forbidden {
        prober_config = prober_config.accept_forbidden();
    }
    let prober = Arc::new(Prober::new(services.client, prober_config));
    let mut scheduler = Scheduler::new(prober, state.clone(), config.scheduler.clone(), cancel)
        .with_checkpoints(coordinator.clone());
    if let Some(pool) = &pool {
        scheduler = scheduler.with_proxy_pool(pool.clone());
    }

    let summary = scheduler.run(targets).await;
    match summary.outcome {
        ScanOutcome::Completed => {}
        ScanOutcome::Cancelled => warn!(skipped = summary.skipped, "Scan interrupted."),
        ScanOutcome::ProxyExhausted => error!(skipped = summary.skipped, "Scan halted: proxy pool exhausted."),
    }

    background.cancel();
    if let Err(err) = checkpoint_task.await {
        warn!(error = %err, "Checkpoint task ended abnormally.");
    }
    if let Some(task) = refresher_task {
        if let Err(err) = task.await {
            warn!(error = %err, "Proxy refresher ended abnormally.");
        }
    }

    let snapshot = match coordinator.finish().await {
        Some(report) => report.snapshot,
        None => state.snapshot(),
    };
    info!(
        positives = snapshot.total_positives(),
        attempts = snapshot.total_attempts,
        inconclusive = snapshot.inconclusive,
        dead_proxies = snapshot.dead_proxies,
        rate_per_hour = %format!("{:.1}", snapshot.rate_per_hour()),
        "Scan complete."
    );

    Ok(RunReport {
        outcome: format!("{:?}", summary.outcome),
        summary,
        snapshot,
        checkpoints: coordinator.completed(),
    })
}

/// Builds the pool and does the first fetch. No usable proxies at startup is
/// fatal when proxies are required.
async fn prepare_pool(config: &ScanConfig, source: Option<Arc<dyn TextSource>>) -> ScanResult<Option<Arc<ProxyPool>>> {
    if config.proxy.mode == ProxyMode::Direct {
        return Ok(None);
    }
    let Some(source) = source else {
        return Err(ConfigError::MissingProxySource(config.proxy.mode.to_string()).into());
    };
    let describe = source.describe();
    let pool = Arc::new(
        ProxyPool::new(source, config.proxy.scheme.clone()).with_strike_limit(config.proxy.strike_limit),
    );
    let count = match pool.refresh_with_backoff(&BackoffPolicy::default()).await {
        Ok(count) => count,
        Err(err) if config.proxy.mode == ProxyMode::Required => return Err(ScanError::ProxyFetch(err)),
        Err(err) => {
            warn!(error = %err, "Proxy list unavailable, probing directly.");
            0
        }
    };
    if count == 0 && config.proxy.mode == ProxyMode::Required {
        return Err(ScanError::ProxyFetch(FetchError::Empty(describe)));
    }
    info!(count, mode = %config.proxy.mode, "Proxy pool ready.");
    Ok(Some(pool))
}
