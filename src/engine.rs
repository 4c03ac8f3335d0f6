//! Shared engine state and the per-transaction run loop.
//!
//! [`Engine`] is the state every worker and background task shares: the
//! index, the epoch framework, the optional recovery logger and the
//! counters. [`Engine::run`] drives one submitted transaction from its body
//! through validation to the hand-off that eventually fires its completion.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Condvar, Mutex, PoisonError};

use crate::config::Config;
use crate::epoch::EpochFramework;
use crate::error::Result;
use crate::index::Index;
use crate::logger::{LogEntry, Logger};
use crate::stats::{Stats, StatsSnapshot};
use crate::transaction::{AbortReason, Transaction, TxStatus};

/// User callback receiving the final status of a transaction.
pub type Callback = Box<dyn FnOnce(TxStatus) + Send + 'static>;

/// Counts submitted transactions whose callbacks have not fired yet.
#[derive(Debug, Default)]
pub struct FenceTracker {
    outstanding: Mutex<usize>,
    drained: Condvar,
}

impl FenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn begin(&self) {
        *self.outstanding.lock().unwrap_or_else(PoisonError::into_inner) += 1;
    }

    fn finish(&self) {
        let mut outstanding = self.outstanding.lock().unwrap_or_else(PoisonError::into_inner);
        *outstanding = outstanding.saturating_sub(1);
        if *outstanding == 0 {
            self.drained.notify_all();
        }
    }

    pub fn outstanding(&self) -> usize {
        *self.outstanding.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks until every transaction submitted so far has terminated.
    pub fn wait(&self) {
        let mut outstanding = self.outstanding.lock().unwrap_or_else(PoisonError::into_inner);
        while *outstanding > 0 {
            outstanding = self
                .drained
                .wait(outstanding)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// Fires a transaction's callback exactly once.
///
/// A completion dropped without being fired reports `Aborted`, so a callback
/// is never lost when a transaction is discarded on shutdown or failure.
pub struct Completion {
    callback: Option<Callback>,
    tracker: Arc<FenceTracker>,
    stats: Arc<Stats>,
}

impl Completion {
    pub(crate) fn new(callback: Callback, tracker: Arc<FenceTracker>, stats: Arc<Stats>) -> Self {
        tracker.begin();
        Self {
            callback: Some(callback),
            tracker,
            stats,
        }
    }

    pub fn commit(mut self) {
        self.stats.record_commit();
        self.fire(TxStatus::Committed);
    }

    pub fn abort(mut self, reason: AbortReason) {
        self.stats.record_abort(reason);
        self.fire(TxStatus::Aborted);
    }

    fn fire(&mut self, status: TxStatus) {
        let Some(callback) = self.callback.take() else {
            return;
        };
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(status))) {
            tracing::error!(panic = panic_message(&*panic), "Transaction callback panicked");
        }
        self.tracker.finish();
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if self.callback.is_some() {
            self.stats.record_abort(AbortReason::EngineFailed);
            self.fire(TxStatus::Aborted);
        }
    }
}

pub struct Engine {
    config: Config,
    index: Index,
    epochs: EpochFramework,
    logger: Option<Logger>,
    stats: Arc<Stats>,
    tracker: Arc<FenceTracker>,
    commits: AtomicU64,
}

impl Engine {
    pub fn new(
        config: Config,
        index: Index,
        initial_epoch: u64,
        logger: Option<Logger>,
        stats: Arc<Stats>,
    ) -> Self {
        let epochs = EpochFramework::new(initial_epoch, config.max_thread);
        Self {
            config,
            index,
            epochs,
            logger,
            stats,
            tracker: Arc::new(FenceTracker::new()),
            commits: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn current_epoch(&self) -> u64 {
        self.epochs.current()
    }

    /// Last epoch whose segment is durable, when logging is enabled.
    pub fn persisted_epoch(&self) -> Option<u64> {
        self.logger.as_ref().map(Logger::persisted_epoch)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn is_failed(&self) -> bool {
        self.logger.as_ref().is_some_and(Logger::is_failed)
    }

    /// Registers a new submission; the returned completion must reach
    /// [`Engine::run`] or be dropped.
    pub fn completion(&self, callback: Callback) -> Completion {
        Completion::new(callback, self.tracker.clone(), self.stats.clone())
    }

    pub fn fence(&self) {
        self.tracker.wait();
    }

    /// Executes `body` as one transaction and routes its outcome to
    /// `completion`.
    pub fn run<F>(&self, body: F, completion: Completion)
    where
        F: FnOnce(&mut Transaction<'_>),
    {
        let guard = self.epochs.enter();
        let mut tx = Transaction::new(&self.index, &self.commits, guard.epoch());

        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| body(&mut tx))) {
            tracing::error!(
                epoch = guard.epoch(),
                panic = panic_message(&*panic),
                "Transaction body panicked"
            );
            tx.mark_aborted(AbortReason::Panic);
        }
        if self.is_failed() {
            tx.mark_aborted(AbortReason::EngineFailed);
        }

        let mut prepared = match tx.prepare(&self.epochs, self.config.lock_retry_limit) {
            Ok(prepared) => prepared,
            Err(reason) => {
                drop(guard);
                completion.abort(reason);
                return;
            }
        };

        let epoch = prepared.epoch();
        let batch = prepared.install();

        match &self.logger {
            Some(logger) => {
                // Submitted under the write locks so that per-key log order
                // matches commit order.
                logger.submit(LogEntry {
                    epoch,
                    batch,
                    completion,
                });
                drop(prepared);
                drop(guard);
            }
            None => {
                drop(prepared);
                drop(guard);
                completion.commit();
            }
        }
    }

    /// One tick of the epoch clock.
    pub fn advance_epoch(&self) -> Option<u64> {
        let advanced = self.epochs.try_advance(self.persisted_epoch());
        if let Some(epoch) = advanced {
            tracing::trace!(epoch, "Epoch advanced");
        }
        advanced
    }

    /// Writes buffered commits and persists every epoch no worker can still
    /// commit into.
    pub fn flush_log(&self) -> Result<()> {
        match &self.logger {
            // The bound is read before the logger drains its intake.
            Some(logger) => logger.flush(self.epochs.global_min()),
            None => Ok(()),
        }
    }

    pub fn log_stats(&self) {
        let stats = self.stats.snapshot();
        tracing::info!(
            epoch = self.current_epoch(),
            persisted = ?self.persisted_epoch(),
            keys = self.index.len(),
            commits = stats.commits,
            aborts = stats.aborts(),
            conflicts = stats.conflict_aborts,
            panics = stats.panics,
            segments = stats.segments_written,
            log_bytes = stats.log_bytes_written,
            outstanding = self.tracker.outstanding(),
            "Engine stats"
        );
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
