// src/core/checkpoint.rs

//! Periodic durable snapshots of the scan state.
//!
//! The coordinator runs beside the scheduler and never pauses it: a
//! checkpoint copies the state under its lock, then does all file and
//! archive work on the copy.

use chrono::Utc;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::archive::{ArchiveRecord, Archiver, commit_message};
use crate::core::models::{ScanSnapshot, Target};
use crate::core::sources::parse_target_lines;
use crate::core::state::ScanState;
use crate::error::{ScanError, ScanResult};

#[derive(Debug, Clone)]
pub struct CheckpointPaths {
    pub results: PathBuf,
    pub stats: PathBuf,
}

impl CheckpointPaths {
    pub fn files(&self) -> Vec<PathBuf> {
        vec![self.results.clone(), self.stats.clone()]
    }
}

/// When checkpoints fire besides the final one. Both may be active.
#[derive(Debug, Clone, Default)]
pub struct CheckpointTriggers {
    pub interval: Option<Duration>,
    /// Fire every N completed probe attempts.
    pub every: Option<u64>,
}

/// Outcome of one checkpoint.
#[derive(Debug, Clone)]
pub struct CheckpointReport {
    pub snapshot: ScanSnapshot,
    pub archive: Option<ArchiveRecord>,
}

// --- File formats ---

/// One positive per line, in snapshot (lexicographic) order.
pub fn render_results(snapshot: &ScanSnapshot) -> String {
    let mut out = String::new();
    for target in &snapshot.positives {
        out.push_str(target);
        out.push('\n');
    }
    out
}

/// Renders the statistics file as `key: value` lines.
///
/// # Arguments
/// * `snapshot` - The state to describe.
///
/// # Returns
/// The file body in a fixed key order, ending with an RFC 3339 `updated_at`.
/// `stats_value` reads the integer keys back on resume.
pub fn render_stats(snapshot: &ScanSnapshot) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "total_attempts: {}", snapshot.total_attempts);
    let _ = writeln!(out, "total_positives: {}", snapshot.total_positives());
    let _ = writeln!(out, "inconclusive: {}", snapshot.inconclusive);
    let _ = writeln!(out, "dead_proxies: {}", snapshot.dead_proxies);
    let _ = writeln!(out, "sessions: {}", snapshot.sessions);
    let _ = writeln!(out, "elapsed_secs: {:.0}", snapshot.elapsed_secs);
    let _ = writeln!(out, "rate_per_hour: {:.2}", snapshot.rate_per_hour());
    let _ = writeln!(out, "commits: {}", snapshot.commits);
    let _ = writeln!(out, "updated_at: {}", Utc::now().to_rfc3339());
    out
}

/// Reads one integer value out of a stats file.
pub fn stats_value(stats: &str, key: &str) -> Option<u64> {
    stats.lines().find_map(|line| {
        let (k, v) = line.split_once(':')?;
        (k.trim() == key).then(|| v.trim().parse().ok()).flatten()
    })
}

/// What an earlier run left on disk.
#[derive(Debug, Clone, Default)]
pub struct PreviousRun {
    pub positives: Vec<Target>,
    pub sessions: u64,
    pub commits: u64,
}

/// Loads a previous run's output files. Missing files mean a fresh start.
pub async fn load_previous(paths: &CheckpointPaths) -> PreviousRun {
    let positives = match tokio::fs::read_to_string(&paths.results).await {
        Ok(text) => parse_target_lines(&text),
        Err(_) => Vec::new(),
    };
    let (sessions, commits) = match tokio::fs::read_to_string(&paths.stats).await {
        Ok(text) => (
            stats_value(&text, "sessions").unwrap_or(0),
            stats_value(&text, "commits").unwrap_or(0),
        ),
        Err(_) => (0, 0),
    };
    info!(positives = positives.len(), sessions, commits, "Resuming from previous output.");
    PreviousRun {
        positives,
        sessions,
        commits,
    }
}

/// Writes through a sibling temp file and a rename, so readers never see a
/// half-written checkpoint.
async fn write_atomic(path: &Path, contents: &str) -> ScanResult<()> {
    let io_err = |source: std::io::Error| ScanError::Checkpoint {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, contents).await.map_err(io_err)?;
    tokio::fs::rename(&tmp, path).await.map_err(io_err)
}

// --- Coordinator ---

pub struct CheckpointCoordinator {
    state: Arc<ScanState>,
    paths: CheckpointPaths,
    archiver: Arc<dyn Archiver>,
    triggers: CheckpointTriggers,
    count_trigger: Notify,
    // Serializes checkpoints so timer and count triggers never interleave writes.
    gate: Mutex<()>,
    completed: AtomicU64,
}

impl CheckpointCoordinator {
    /// # Arguments
    /// * `state` - The aggregate to snapshot.
    /// * `paths` - Results and stats files, rewritten atomically each time.
    /// * `archiver` - Receives both files after every write.
    /// * `triggers` - Time and count triggers; the final checkpoint is separate.
    pub fn new(
        state: Arc<ScanState>,
        paths: CheckpointPaths,
        archiver: Arc<dyn Archiver>,
        triggers: CheckpointTriggers,
    ) -> Self {
        Self {
            state,
            paths,
            archiver,
            triggers,
            count_trigger: Notify::new(),
            gate: Mutex::new(()),
            completed: AtomicU64::new(0),
        }
    }

    pub fn paths(&self) -> &CheckpointPaths {
        &self.paths
    }

    /// Number of checkpoints written so far.
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Called after every recorded attempt; wakes the coordinator on each
    /// Nth one. Never blocks.
    pub fn on_attempt(&self, attempt: u64) {
        if let Some(every) = self.triggers.every.filter(|n| *n > 0) {
            if attempt % every == 0 {
                self.count_trigger.notify_one();
            }
        }
    }

    /// Snapshot, write both files, archive. Archive failures are logged and
    /// swallowed; only a failed file write is an error.
    pub async fn checkpoint(&self) -> ScanResult<CheckpointReport> {
        let _guard = self.gate.lock().await;
        let snapshot = self.state.snapshot();

        write_atomic(&self.paths.results, &render_results(&snapshot)).await?;
        write_atomic(&self.paths.stats, &render_stats(&snapshot)).await?;
        self.completed.fetch_add(1, Ordering::Relaxed);
        info!(
            positives = snapshot.total_positives(),
            attempts = snapshot.total_attempts,
            results = %self.paths.results.display(),
            "Checkpoint written."
        );

        let message = commit_message(snapshot.total_positives());
        let archive = match self.archiver.archive(&self.paths.files(), &message).await {
            Ok(record) => {
                if record.commit.is_some() {
                    self.state.record_commit();
                }
                Some(record)
            }
            Err(err) => {
                warn!(error = %err, "Archive failed, continuing scan.");
                None
            }
        };

        Ok(CheckpointReport { snapshot, archive })
    }

    /// Best-effort final checkpoint on completion or cancellation.
    pub async fn finish(&self) -> Option<CheckpointReport> {
        match self.checkpoint().await {
            Ok(report) => Some(report),
            Err(err) => {
                error!(error = %err, "Final checkpoint failed.");
                None
            }
        }
    }

    /// Runs the time and count triggers until `cancel` fires.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = self.triggers.interval.filter(|p| !p.is_zero()).map(|period| {
                let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                ticker
            });

            loop {
                let trigger = tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = async {
                        match ticker.as_mut() {
                            Some(t) => {
                                t.tick().await;
                            }
                            None => std::future::pending::<()>().await,
                        }
                    } => "timer",
                    _ = self.count_trigger.notified() => "count",
                };
                debug!(trigger, "Checkpoint triggered.");
                if let Err(err) = self.checkpoint().await {
                    error!(error = %err, "Checkpoint failed.");
                }
            }
            debug!("Checkpoint coordinator stopped.");
        })
    }
}
