// src/core/state.rs

//! The process-wide scan aggregate.
//!
//! One owner, shared by handle between the scheduler (which records every
//! completed probe) and the checkpoint coordinator (which copies it out).
//! Every mutation goes through a single short critical section.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use crate::core::models::{ProbeResult, ScanSnapshot, Target};

#[derive(Debug, Clone, Default)]
struct Counters {
    attempts: u64,
    inconclusive: u64,
    dead_proxies: u64,
    sessions: u64,
    commits: u64,
}

#[derive(Debug)]
struct StateInner {
    positives: HashSet<Target>,
    counters: Counters,
}

#[derive(Debug)]
pub struct ScanState {
    inner: Mutex<StateInner>,
    started: Instant,
}

impl Default for ScanState {
    fn default() -> Self {
        Self::new()
    }
}

impl ScanState {
    /// Starts a fresh session.
    pub fn new() -> Self {
        Self::resumed(Vec::new(), 0, 0)
    }

    /// Starts a session on top of a previous run's positives and counters.
    pub fn resumed(positives: impl IntoIterator<Item = Target>, previous_sessions: u64, previous_commits: u64) -> Self {
        Self {
            inner: Mutex::new(StateInner {
                positives: positives.into_iter().collect(),
                counters: Counters {
                    sessions: previous_sessions + 1,
                    commits: previous_commits,
                    ..Counters::default()
                },
            }),
            started: Instant::now(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StateInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records one completed probe and returns the new attempt count.
    pub fn record(&self, target: &Target, result: &ProbeResult) -> u64 {
        let mut inner = self.lock();
        inner.counters.attempts += 1;
        match result {
            ProbeResult::Positive(_) => {
                inner.positives.insert(target.clone());
            }
            ProbeResult::Inconclusive(_) => inner.counters.inconclusive += 1,
            ProbeResult::Negative => {}
        }
        inner.counters.attempts
    }

    pub fn record_dead_proxy(&self) {
        self.lock().counters.dead_proxies += 1;
    }

    pub fn record_commit(&self) {
        self.lock().counters.commits += 1;
    }

    pub fn attempts(&self) -> u64 {
        self.lock().counters.attempts
    }

    pub fn contains(&self, target: &Target) -> bool {
        self.lock().positives.contains(target)
    }

    /// Copies the aggregate out. Positives come back sorted so repeated
    /// snapshots of unchanged state serialize identically.
    pub fn snapshot(&self) -> ScanSnapshot {
        let (mut positives, counters) = {
            let inner = self.lock();
            let positives: Vec<String> = inner.positives.iter().map(|t| t.to_string()).collect();
            (positives, inner.counters.clone())
        };
        positives.sort();
        ScanSnapshot {
            positives,
            total_attempts: counters.attempts,
            inconclusive: counters.inconclusive,
            dead_proxies: counters.dead_proxies,
            sessions: counters.sessions,
            commits: counters.commits,
            elapsed_secs: self.started.elapsed().as_secs_f64(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::{Evidence, TransportErrorKind};
    use std::sync::Arc;

    fn t(s: &str) -> Target {
        Target::parse(s).unwrap()
    }

    #[test]
    fn positives_have_union_semantics() {
        let state = ScanState::new();
        state.record(&t("b.test"), &ProbeResult::Positive(Evidence::HeadHeader));
        state.record(&t("a.test"), &ProbeResult::Positive(Evidence::GetHeader));
        state.record(&t("b.test"), &ProbeResult::Positive(Evidence::StaticPathStatus));
        state.record(&t("c.test"), &ProbeResult::Negative);
        state.record(&t("d.test"), &ProbeResult::Inconclusive(TransportErrorKind::Timeout));

        let snap = state.snapshot();
        assert_eq!(snap.positives, vec!["https://a.test", "https://b.test"]);
        assert_eq!(snap.total_attempts, 5);
        assert_eq!(snap.inconclusive, 1);
        assert_eq!(snap.sessions, 1);
    }

    #[test]
    fn resumed_state_continues_counters() {
        let state = ScanState::resumed(vec![t("a.test")], 3, 7);
        state.record(&t("a.test"), &ProbeResult::Positive(Evidence::HeadHeader));
        state.record_commit();
        let snap = state.snapshot();
        assert_eq!(snap.total_positives(), 1);
        assert_eq!(snap.sessions, 4);
        assert_eq!(snap.commits, 8);
    }

    #[test]
    fn concurrent_records_are_not_lost() {
        let state = Arc::new(ScanState::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let state = state.clone();
                std::thread::spawn(move || {
                    for j in 0..250 {
                        let target = t(&format!("host{}-{}.test", i, j % 10));
                        state.record(&target, &ProbeResult::Positive(Evidence::HeadHeader));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let snap = state.snapshot();
        assert_eq!(snap.total_attempts, 2000);
        assert_eq!(snap.total_positives(), 80);
    }
}
