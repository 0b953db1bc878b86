// src/config.rs

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::core::archive::default_branch_name;
use crate::core::checkpoint::{CheckpointPaths, CheckpointTriggers};
use crate::core::dork::DorkLimits;
use crate::core::models::{DispatchMode, ProxyMode};
use crate::core::scheduler::SchedulerConfig;
use crate::error::ConfigError;

pub const DEFAULT_LIST_URL: &str = "https://crawler.ninja/files/https-sites.txt";

#[derive(Parser, Debug, Clone)]
#[command(name = "nextscan")]
#[command(version)]
#[command(about = "Finds Next.js sites in large host lists", long_about = None)]
#[command(after_help = "Only scan hosts you are allowed to scan.")]
pub struct Cli {
    /// Ranked site list (`<rank> <domain>` per line).
    #[arg(long, env = "NEXTSCAN_LIST_URL", default_value = DEFAULT_LIST_URL)]
    pub list_url: String,
    /// Local target list, one host or URL per line. Overrides --list-url.
    #[arg(long, env = "NEXTSCAN_TARGETS_FILE", value_name = "FILE")]
    pub targets_file: Option<PathBuf>,
    /// Read --targets-file in the ranked `<rank> <domain>` format.
    #[arg(long, env = "NEXTSCAN_TARGETS_RANKED", requires = "targets_file")]
    pub targets_ranked: bool,
    /// Discover targets by running these dork queries. Overrides both lists.
    #[arg(long, env = "NEXTSCAN_DORK_QUERIES", value_name = "FILE", conflicts_with = "targets_file")]
    pub dork_queries: Option<PathBuf>,
    #[arg(long, env = "NEXTSCAN_DORK_BINARY")]
    pub dork_binary: Option<String>,
    /// Extra leading argument for the dork tool, repeatable.
    #[arg(long = "dork-arg", value_name = "ARG", allow_hyphen_values = true)]
    pub dork_args: Vec<String>,
    #[arg(long, env = "NEXTSCAN_DORK_PAGES", default_value = "5")]
    pub dork_pages: u32,
    #[arg(long, env = "NEXTSCAN_DORK_TIMEOUT_SECS", default_value = "10")]
    pub dork_timeout_secs: u64,
    #[arg(long, env = "NEXTSCAN_DORK_MAX_RESULTS", default_value = "100")]
    pub dork_max_results: u32,

    #[arg(short = 'c', long, env = "NEXTSCAN_CONCURRENCY", default_value = "200")]
    pub concurrency: usize,
    /// Per-step request timeout.
    #[arg(short = 't', long, env = "NEXTSCAN_TIMEOUT_SECS", default_value = "5")]
    pub timeout_secs: u64,
    #[arg(long, env = "NEXTSCAN_DISPATCH", value_enum, default_value = "bulk")]
    pub dispatch: DispatchMode,
    #[arg(long, env = "NEXTSCAN_CHUNK_FACTOR", default_value = "5")]
    pub chunk_factor: usize,
    #[arg(long, env = "NEXTSCAN_SHARD_INDEX", default_value = "0")]
    pub shard_index: usize,
    #[arg(long, env = "NEXTSCAN_SHARD_COUNT", default_value = "1")]
    pub shard_count: usize,

    #[arg(long, env = "NEXTSCAN_PROXY_MODE", value_enum, default_value = "direct")]
    pub proxy_mode: ProxyMode,
    #[arg(long, env = "NEXTSCAN_PROXY_URL", conflicts_with = "proxy_file")]
    pub proxy_url: Option<String>,
    #[arg(long, env = "NEXTSCAN_PROXY_FILE", value_name = "FILE")]
    pub proxy_file: Option<PathBuf>,
    /// Scheme given to proxy entries that lack one.
    #[arg(long, env = "NEXTSCAN_PROXY_SCHEME", default_value = "http")]
    pub proxy_scheme: String,
    /// Background proxy refresh period, 0 disables.
    #[arg(long, env = "NEXTSCAN_PROXY_REFRESH_SECS", default_value = "0")]
    pub proxy_refresh_secs: u64,
    #[arg(long, env = "NEXTSCAN_PROXY_RETRIES", default_value = "1")]
    pub proxy_retries: usize,
    /// Consecutive failed probes before a proxy is evicted. A failure that
    /// another proxy gets past evicts at once.
    #[arg(long, env = "NEXTSCAN_PROXY_STRIKES", default_value = "2")]
    pub proxy_strikes: u32,

    /// Also count 403 on the static asset path as evidence.
    #[arg(long, env = "NEXTSCAN_ACCEPT_FORBIDDEN")]
    pub accept_forbidden: bool,

    /// Checkpoint period, 0 disables the time trigger.
    #[arg(long, env = "NEXTSCAN_CHECKPOINT_SECS", default_value = "60")]
    pub checkpoint_secs: u64,
    /// Checkpoint every N attempts, 0 disables the count trigger.
    #[arg(long, env = "NEXTSCAN_CHECKPOINT_EVERY", default_value = "0")]
    pub checkpoint_every: u64,
    #[arg(short = 'o', long, env = "NEXTSCAN_OUTPUT", default_value = "nextjs_sites.txt")]
    pub output: PathBuf,
    #[arg(long, env = "NEXTSCAN_STATS_OUTPUT", default_value = "scan_stats.txt")]
    pub stats_output: PathBuf,

    /// Commit and push output files at every checkpoint.
    #[arg(long, env = "NEXTSCAN_ARCHIVE")]
    pub archive: bool,
    /// Defaults to `scan<YYYYMMDD>`.
    #[arg(long, env = "NEXTSCAN_ARCHIVE_BRANCH")]
    pub archive_branch: Option<String>,
    #[arg(long, env = "NEXTSCAN_ARCHIVE_REMOTE", default_value = "origin")]
    pub archive_remote: String,
    #[arg(long, env = "NEXTSCAN_ARCHIVE_REPO", default_value = ".")]
    pub archive_repo: PathBuf,

    /// Continue from existing output files.
    #[arg(long, env = "NEXTSCAN_RESUME")]
    pub resume: bool,
    /// Print the final snapshot as JSON on stdout.
    #[arg(long)]
    pub json: bool,
    #[arg(short = 'v', long, env = "NEXTSCAN_VERBOSE")]
    pub verbose: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetSource {
    /// Ranked list over HTTP.
    ListUrl(String),
    /// Local list, plain or ranked.
    File { path: PathBuf, ranked: bool },
    Dork {
        queries: PathBuf,
        binary: String,
        leading_args: Vec<String>,
        limits: DorkLimits,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxySource {
    Url(String),
    File(PathBuf),
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub mode: ProxyMode,
    pub source: Option<ProxySource>,
    pub scheme: String,
    pub refresh_every: Option<Duration>,
    pub strike_limit: u32,
}

#[derive(Debug, Clone)]
pub struct ArchiveConfig {
    pub branch: String,
    pub remote: String,
    pub repo: PathBuf,
}

/// Validated runtime configuration.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub target_source: TargetSource,
    pub scheduler: SchedulerConfig,
    pub timeout: Duration,
    pub shard_index: usize,
    pub shard_count: usize,
    pub proxy: ProxyConfig,
    pub accept_forbidden: bool,
    pub triggers: CheckpointTriggers,
    pub paths: CheckpointPaths,
    pub archive: Option<ArchiveConfig>,
    pub resume: bool,
    pub json: bool,
    pub verbose: bool,
}

impl ScanConfig {
    pub fn from_cli(cli: Cli) -> Result<Self, ConfigError> {
        if cli.concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if cli.shard_count == 0 || cli.shard_index >= cli.shard_count {
            return Err(ConfigError::InvalidShard {
                index: cli.shard_index,
                count: cli.shard_count,
            });
        }
        if cli.chunk_factor == 0 {
            return Err(ConfigError::Invalid("--chunk-factor must be at least 1".into()));
        }
        if cli.proxy_strikes == 0 {
            return Err(ConfigError::Invalid("--proxy-strikes must be at least 1".into()));
        }
        if cli.timeout_secs == 0 {
            return Err(ConfigError::Invalid("--timeout-secs must be at least 1".into()));
        }

        let target_source = match (cli.dork_queries, cli.targets_file) {
            (Some(queries), _) => {
                let binary = cli
                    .dork_binary
                    .ok_or_else(|| ConfigError::Invalid("--dork-queries needs --dork-binary".into()))?;
                TargetSource::Dork {
                    queries,
                    binary,
                    leading_args: cli.dork_args,
                    limits: DorkLimits {
                        pages: cli.dork_pages,
                        timeout: Duration::from_secs(cli.dork_timeout_secs),
                        max_results: cli.dork_max_results,
                    },
                }
            }
            (None, Some(path)) => TargetSource::File {
                path,
                ranked: cli.targets_ranked,
            },
            (None, None) => TargetSource::ListUrl(cli.list_url),
        };

        let proxy_source = match (cli.proxy_url, cli.proxy_file) {
            (Some(url), _) => Some(ProxySource::Url(url)),
            (None, Some(file)) => Some(ProxySource::File(file)),
            (None, None) => None,
        };
        if cli.proxy_mode != ProxyMode::Direct && proxy_source.is_none() {
            return Err(ConfigError::MissingProxySource(cli.proxy_mode.to_string()));
        }

        let archive = cli.archive.then(|| ArchiveConfig {
            branch: cli.archive_branch.unwrap_or_else(default_branch_name),
            remote: cli.archive_remote,
            repo: cli.archive_repo,
        });

        Ok(Self {
            target_source,
            scheduler: SchedulerConfig {
                concurrency: cli.concurrency,
                mode: cli.dispatch,
                chunk_factor: cli.chunk_factor,
                proxy_mode: cli.proxy_mode,
                proxy_retries: cli.proxy_retries,
            },
            timeout: Duration::from_secs(cli.timeout_secs),
            shard_index: cli.shard_index,
            shard_count: cli.shard_count,
            proxy: ProxyConfig {
                mode: cli.proxy_mode,
                source: proxy_source,
                scheme: cli.proxy_scheme,
                refresh_every: (cli.proxy_refresh_secs > 0).then(|| Duration::from_secs(cli.proxy_refresh_secs)),
                strike_limit: cli.proxy_strikes,
            },
            accept_forbidden: cli.accept_forbidden,
            triggers: CheckpointTriggers {
                interval: (cli.checkpoint_secs > 0).then(|| Duration::from_secs(cli.checkpoint_secs)),
                every: (cli.checkpoint_every > 0).then_some(cli.checkpoint_every),
            },
            paths: CheckpointPaths {
                results: cli.output,
                stats: cli.stats_output,
            },
            archive,
            resume: cli.resume,
            json: cli.json,
            verbose: cli.verbose,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<ScanConfig, ConfigError> {
        let mut argv = vec!["nextscan"];
        argv.extend_from_slice(args);
        ScanConfig::from_cli(Cli::try_parse_from(argv).unwrap())
    }

    #[test]
    fn defaults_match_a_plain_scan() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.target_source, TargetSource::ListUrl(DEFAULT_LIST_URL.into()));
        assert_eq!(config.scheduler.concurrency, 200);
        assert_eq!(config.scheduler.mode, DispatchMode::Bulk);
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.triggers.interval, Some(Duration::from_secs(60)));
        assert_eq!(config.triggers.every, None);
        assert_eq!(config.paths.results, PathBuf::from("nextjs_sites.txt"));
        assert_eq!(config.proxy.mode, ProxyMode::Direct);
        assert!(config.archive.is_none());
    }

    #[test]
    fn shard_index_must_be_below_count() {
        assert_eq!(
            parse(&["--shard-index", "3", "--shard-count", "3"]).unwrap_err(),
            ConfigError::InvalidShard { index: 3, count: 3 }
        );
        assert!(parse(&["--shard-index", "2", "--shard-count", "3"]).is_ok());
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        assert_eq!(parse(&["-c", "0"]).unwrap_err(), ConfigError::ZeroConcurrency);
    }

    #[test]
    fn proxy_modes_other_than_direct_need_a_source() {
        assert!(matches!(
            parse(&["--proxy-mode", "required"]).unwrap_err(),
            ConfigError::MissingProxySource(_)
        ));
        let config = parse(&["--proxy-mode", "optional", "--proxy-file", "proxies.txt"]).unwrap();
        assert_eq!(config.proxy.source, Some(ProxySource::File("proxies.txt".into())));
        assert_eq!(config.proxy.strike_limit, 2);
        assert!(matches!(
            parse(&["--proxy-strikes", "0"]).unwrap_err(),
            ConfigError::Invalid(_)
        ));
    }

    #[test]
    fn dork_queries_need_a_binary() {
        assert!(matches!(
            parse(&["--dork-queries", "q.txt"]).unwrap_err(),
            ConfigError::Invalid(_)
        ));
        let config = parse(&["--dork-queries", "q.txt", "--dork-binary", "dorker", "--dork-pages", "2"]).unwrap();
        match config.target_source {
            TargetSource::Dork { binary, limits, .. } => {
                assert_eq!(binary, "dorker");
                assert_eq!(limits.pages, 2);
            }
            other => panic!("unexpected source {:?}", other),
        }
    }

    #[test]
    fn targets_file_can_be_ranked() {
        let config = parse(&["--targets-file", "sites.txt", "--targets-ranked"]).unwrap();
        assert_eq!(
            config.target_source,
            TargetSource::File {
                path: "sites.txt".into(),
                ranked: true
            }
        );
    }

    #[test]
    fn zero_disables_checkpoint_triggers() {
        let config = parse(&["--checkpoint-secs", "0", "--checkpoint-every", "500"]).unwrap();
        assert_eq!(config.triggers.interval, None);
        assert_eq!(config.triggers.every, Some(500));
    }

    #[test]
    fn archive_branch_defaults_to_dated_name() {
        let config = parse(&["--archive"]).unwrap();
        let archive = config.archive.unwrap();
        assert!(archive.branch.starts_with("scan"));
        assert_eq!(archive.remote, "origin");
    }
}
