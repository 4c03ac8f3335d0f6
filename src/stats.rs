use std::sync::atomic::{AtomicU64, Ordering};

use crate::transaction::AbortReason;

/// Engine-wide counters, updated lock-free from workers and the logger.
#[derive(Debug, Default)]
pub struct Stats {
    commits: AtomicU64,
    user_aborts: AtomicU64,
    conflict_aborts: AtomicU64,
    panics: AtomicU64,
    failure_aborts: AtomicU64,
    epochs_persisted: AtomicU64,
    segments_written: AtomicU64,
    log_bytes_written: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_commit(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_abort(&self, reason: AbortReason) {
        let counter = match reason {
            AbortReason::User => &self.user_aborts,
            AbortReason::Conflict => &self.conflict_aborts,
            AbortReason::Panic => &self.panics,
            AbortReason::EngineFailed => &self.failure_aborts,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_segment(&self, bytes: u64) {
        self.segments_written.fetch_add(1, Ordering::Relaxed);
        self.log_bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_epochs_persisted(&self, count: u64) {
        self.epochs_persisted.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            commits: self.commits.load(Ordering::Relaxed),
            user_aborts: self.user_aborts.load(Ordering::Relaxed),
            conflict_aborts: self.conflict_aborts.load(Ordering::Relaxed),
            panics: self.panics.load(Ordering::Relaxed),
            failure_aborts: self.failure_aborts.load(Ordering::Relaxed),
            epochs_persisted: self.epochs_persisted.load(Ordering::Relaxed),
            segments_written: self.segments_written.load(Ordering::Relaxed),
            log_bytes_written: self.log_bytes_written.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the engine counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub commits: u64,
    pub user_aborts: u64,
    pub conflict_aborts: u64,
    pub panics: u64,
    pub failure_aborts: u64,
    pub epochs_persisted: u64,
    pub segments_written: u64,
    pub log_bytes_written: u64,
}

impl StatsSnapshot {
    pub fn aborts(&self) -> u64 {
        self.user_aborts + self.conflict_aborts + self.panics + self.failure_aborts
    }
}
