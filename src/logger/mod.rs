//! Recovery logger: groups committed writes into one segment per epoch.
//!
//! Workers hand every commit to the logger through a bounded channel. A
//! flush pass drains the channel, appends write records to the segment of
//! their epoch, and then closes every epoch the epoch framework reports as
//! finished: the end marker is written, the file and directory are synced,
//! and the epoch's completions fire in submission order.
//!
//! An epoch without write records produces no file; its completions (read
//! only transactions) fire when the epoch is passed.
//!
//! The first I/O error fails the logger for good. Epochs closed before the
//! failing one stay durable and their completions report `Committed`; the
//! failing epoch and every later completion report `Aborted`.

pub mod recovery;
pub mod segment;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, PoisonError};

use crate::engine::Completion;
use crate::error::{Error, Result};
use crate::stats::Stats;
use crate::transaction::commit::WriteBatch;
use crate::transaction::AbortReason;

use segment::SegmentWriter;

/// One committed transaction on its way to disk.
pub struct LogEntry {
    pub epoch: u64,
    pub batch: WriteBatch,
    pub completion: Completion,
}

#[derive(Default)]
struct PendingEpoch {
    writer: Option<SegmentWriter>,
    completions: Vec<Completion>,
}

struct LoggerState {
    receiver: Receiver<LogEntry>,
    pending: BTreeMap<u64, PendingEpoch>,
}

pub struct Logger {
    dir: PathBuf,
    sender: SyncSender<LogEntry>,
    state: Mutex<LoggerState>,
    persisted: AtomicU64,
    failed: AtomicBool,
    stats: Arc<Stats>,
}

impl Logger {
    /// `persisted` is the last epoch already durable in `dir`.
    pub fn new(dir: &Path, capacity: usize, persisted: u64, stats: Arc<Stats>) -> Self {
        let (sender, receiver) = mpsc::sync_channel(capacity);
        Self {
            dir: dir.to_path_buf(),
            sender,
            state: Mutex::new(LoggerState {
                receiver,
                pending: BTreeMap::new(),
            }),
            persisted: AtomicU64::new(persisted),
            failed: AtomicBool::new(false),
            stats,
        }
    }

    pub fn persisted_epoch(&self) -> u64 {
        self.persisted.load(Ordering::Acquire)
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// Queues a commit. Blocks while the channel is full.
    pub fn submit(&self, entry: LogEntry) {
        if self.is_failed() {
            entry.completion.abort(AbortReason::EngineFailed);
            return;
        }
        let entry = match self.sender.try_send(entry) {
            Ok(()) => return self.abort_if_failed(),
            Err(TrySendError::Full(entry)) => {
                tracing::debug!(epoch = entry.epoch, "Log channel full, waiting for flush");
                entry
            }
            Err(TrySendError::Disconnected(entry)) => entry,
        };
        match self.sender.send(entry) {
            Ok(()) => self.abort_if_failed(),
            Err(mpsc::SendError(entry)) => entry.completion.abort(AbortReason::EngineFailed),
        }
    }

    /// The logger may have failed between the check in `submit` and the
    /// send, after the failure already drained the channel.
    fn abort_if_failed(&self) {
        if !self.is_failed() {
            return;
        }
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let LoggerState { receiver, pending } = &mut *state;
        abort_all(receiver, pending);
    }

    /// Writes everything submitted so far and persists every epoch below
    /// `closed_below`.
    ///
    /// The caller must read `closed_below` from the epoch framework before
    /// calling, so every commit into a closed epoch is already queued.
    pub fn flush(&self, closed_below: u64) -> Result<()> {
        let mut state = self.state.lock()?;
        let LoggerState { receiver, pending } = &mut *state;

        if self.is_failed() {
            abort_all(receiver, pending);
            return Ok(());
        }

        if let Err(e) = self.drain(receiver, pending) {
            self.fail(&e, receiver, pending);
            return Err(e);
        }

        let mut ready = Vec::new();
        let mut closed = 0usize;
        let mut failure = None;
        while let Some(entry) = pending.first_entry() {
            if *entry.key() >= closed_below {
                break;
            }
            let (epoch, epoch_state) = entry.remove_entry();
            let PendingEpoch {
                writer,
                completions,
            } = epoch_state;

            if let Some(writer) = writer {
                if let Err(e) = self.close(writer) {
                    for completion in completions {
                        completion.abort(AbortReason::EngineFailed);
                    }
                    failure = Some((epoch, e));
                    break;
                }
            }
            closed += 1;
            ready.extend(completions);
        }

        // Everything below the failing epoch made it to disk.
        let durable_below = failure.as_ref().map_or(closed_below, |(epoch, _)| *epoch);
        self.mark_persisted(durable_below.saturating_sub(1), closed);
        if let Some((_, e)) = &failure {
            self.fail(e, receiver, pending);
        }
        drop(state);

        // Fired outside the lock so callbacks may submit new transactions.
        for completion in ready {
            completion.commit();
        }
        match failure {
            Some((_, e)) => Err(e),
            None => Ok(()),
        }
    }

    fn mark_persisted(&self, epoch: u64, segments: usize) {
        let previous = self.persisted_epoch();
        if epoch > previous {
            self.persisted.store(epoch, Ordering::Release);
            self.stats.record_epochs_persisted(epoch - previous);
            tracing::trace!(persisted = epoch, segments, "Epochs persisted");
        }
    }

    fn drain(
        &self,
        receiver: &Receiver<LogEntry>,
        pending: &mut BTreeMap<u64, PendingEpoch>,
    ) -> Result<()> {
        while let Ok(entry) = receiver.try_recv() {
            let LogEntry {
                epoch,
                batch,
                completion,
            } = entry;

            if epoch <= self.persisted_epoch() {
                // Unreachable while the epoch framework holds its bound.
                tracing::error!(epoch, "Commit arrived for an already persisted epoch");
                completion.abort(AbortReason::EngineFailed);
                continue;
            }

            let epoch_state = pending.entry(epoch).or_default();
            epoch_state.completions.push(completion);
            if batch.is_empty() {
                continue;
            }

            let writer = match epoch_state.writer.take() {
                Some(writer) => writer,
                None => SegmentWriter::create(&self.dir, epoch)?,
            };
            let writer = epoch_state.writer.insert(writer);
            for (key, value) in &batch {
                writer.append(key, value)?;
            }
        }
        Ok(())
    }

    fn close(&self, writer: SegmentWriter) -> Result<()> {
        let epoch = writer.epoch();
        let records = writer.records();
        let size = writer.finish()?;
        segment::sync_dir(&self.dir)?;
        self.stats.record_segment(size);
        tracing::debug!(epoch, records, bytes = size, "Log segment persisted");
        Ok(())
    }

    fn fail(
        &self,
        error: &Error,
        receiver: &Receiver<LogEntry>,
        pending: &mut BTreeMap<u64, PendingEpoch>,
    ) {
        self.failed.store(true, Ordering::SeqCst);
        tracing::error!(
            dir = %self.dir.display(),
            error = %error,
            "Recovery log failed; aborting pending transactions"
        );
        abort_all(receiver, pending);
    }
}

fn abort_all(receiver: &Receiver<LogEntry>, pending: &mut BTreeMap<u64, PendingEpoch>) {
    for (_, epoch_state) in std::mem::take(pending) {
        for completion in epoch_state.completions {
            completion.abort(AbortReason::EngineFailed);
        }
    }
    while let Ok(entry) = receiver.try_recv() {
        entry.completion.abort(AbortReason::EngineFailed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::FenceTracker;
    use crate::transaction::TxStatus;
    use std::sync::mpsc::Receiver as StatusReceiver;

    struct Harness {
        tracker: Arc<FenceTracker>,
        stats: Arc<Stats>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                tracker: Arc::new(FenceTracker::new()),
                stats: Arc::new(Stats::new()),
            }
        }

        fn entry(&self, epoch: u64, writes: &[(&str, &str)]) -> (LogEntry, StatusReceiver<TxStatus>) {
            let (tx, rx) = mpsc::channel();
            let completion = Completion::new(
                Box::new(move |status: TxStatus| {
                    let _ = tx.send(status);
                }),
                self.tracker.clone(),
                self.stats.clone(),
            );
            let batch = writes
                .iter()
                .map(|(k, v)| (k.as_bytes().to_vec(), Arc::from(v.as_bytes())))
                .collect();
            (
                LogEntry {
                    epoch,
                    batch,
                    completion,
                },
                rx,
            )
        }
    }

    #[test]
    fn test_open_epoch_is_not_persisted() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let harness = Harness::new();
        let logger = Logger::new(dir.path(), 16, 0, harness.stats.clone());

        let (entry, rx) = harness.entry(1, &[("alice", "1")]);
        logger.submit(entry);
        logger.flush(1)?;

        assert!(rx.try_recv().is_err());
        assert_eq!(logger.persisted_epoch(), 0);
        assert!(!dir.path().join("epoch_1.log").exists());
        Ok(())
    }

    #[test]
    fn test_closed_epochs_persist_in_order() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let harness = Harness::new();
        let logger = Logger::new(dir.path(), 16, 0, harness.stats.clone());

        let (first, rx1) = harness.entry(1, &[("alice", "1")]);
        let (second, rx2) = harness.entry(2, &[("alice", "2"), ("bob", "2")]);
        let (third, rx3) = harness.entry(3, &[("carol", "3")]);
        logger.submit(first);
        logger.submit(second);
        logger.submit(third);

        logger.flush(3)?;
        assert_eq!(rx1.recv().unwrap(), TxStatus::Committed);
        assert_eq!(rx2.recv().unwrap(), TxStatus::Committed);
        assert!(rx3.try_recv().is_err());
        assert_eq!(logger.persisted_epoch(), 2);

        let segment = segment::Segment::read(&dir.path().join("epoch_2.log"))?;
        assert_eq!(segment.epoch, 2);
        assert_eq!(segment.records.len(), 2);

        let stats = harness.stats.snapshot();
        assert_eq!(stats.segments_written, 2);
        assert_eq!(stats.epochs_persisted, 2);
        assert_eq!(harness.tracker.outstanding(), 1);
        Ok(())
    }

    #[test]
    fn test_read_only_epoch_writes_no_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let harness = Harness::new();
        let logger = Logger::new(dir.path(), 16, 0, harness.stats.clone());

        let (entry, rx) = harness.entry(1, &[]);
        logger.submit(entry);
        logger.flush(2)?;

        assert_eq!(rx.recv().unwrap(), TxStatus::Committed);
        assert!(!dir.path().join("epoch_1.log").exists());
        assert_eq!(logger.persisted_epoch(), 1);
        Ok(())
    }

    #[test]
    fn test_io_failure_aborts_pending_and_later_commits() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let log_dir = dir.path().join("logs");
        std::fs::create_dir(&log_dir)?;
        let harness = Harness::new();
        let logger = Logger::new(&log_dir, 16, 0, harness.stats.clone());

        let (read_only, rx_read) = harness.entry(1, &[]);
        logger.submit(read_only);
        logger.flush(1)?;

        // Segment creation fails once the directory is gone.
        std::fs::remove_dir_all(&log_dir)?;
        let (write, rx_write) = harness.entry(1, &[("alice", "1")]);
        logger.submit(write);
        assert!(logger.flush(2).is_err());
        assert!(logger.is_failed());
        assert_eq!(rx_read.recv().unwrap(), TxStatus::Aborted);
        assert_eq!(rx_write.recv().unwrap(), TxStatus::Aborted);

        let (late, rx_late) = harness.entry(2, &[("bob", "1")]);
        logger.submit(late);
        assert_eq!(rx_late.recv().unwrap(), TxStatus::Aborted);
        assert_eq!(logger.persisted_epoch(), 0);
        assert_eq!(harness.tracker.outstanding(), 0);
        Ok(())
    }

    #[test]
    fn test_entries_queued_after_failure_are_aborted() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let log_dir = dir.path().join("logs");
        std::fs::create_dir(&log_dir)?;
        let harness = Harness::new();
        let logger = Logger::new(&log_dir, 16, 0, harness.stats.clone());

        std::fs::remove_dir_all(&log_dir)?;
        let (write, rx_write) = harness.entry(1, &[("alice", "1")]);
        logger.submit(write);
        assert!(logger.flush(2).is_err());
        assert_eq!(rx_write.recv().unwrap(), TxStatus::Aborted);

        // A submitter that passed the failure check before it latched.
        let (late, rx_late) = harness.entry(2, &[("bob", "1")]);
        logger.sender.try_send(late).map_err(|_| Error::InvalidState("send".into()))?;
        assert!(rx_late.try_recv().is_err());
        logger.abort_if_failed();
        assert_eq!(rx_late.recv().unwrap(), TxStatus::Aborted);

        // A later flush pass clears the channel the same way.
        let (queued, rx_queued) = harness.entry(2, &[("carol", "1")]);
        logger.sender.try_send(queued).map_err(|_| Error::InvalidState("send".into()))?;
        logger.flush(3)?;
        assert_eq!(rx_queued.recv().unwrap(), TxStatus::Aborted);
        assert_eq!(harness.tracker.outstanding(), 0);
        Ok(())
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_close_failure_keeps_earlier_epochs_committed() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let harness = Harness::new();
        let logger = Logger::new(dir.path(), 16, 0, harness.stats.clone());

        // Every write to epoch 2's segment fails with ENOSPC once flushed.
        std::os::unix::fs::symlink("/dev/full", dir.path().join("epoch_2.log"))?;

        let (first, rx1) = harness.entry(1, &[("alice", "1")]);
        let (second, rx2) = harness.entry(2, &[("bob", "2")]);
        let (third, rx3) = harness.entry(3, &[("carol", "3")]);
        logger.submit(first);
        logger.submit(second);
        logger.submit(third);

        assert!(logger.flush(3).is_err());
        assert!(logger.is_failed());
        assert_eq!(rx1.recv().unwrap(), TxStatus::Committed);
        assert_eq!(rx2.recv().unwrap(), TxStatus::Aborted);
        assert_eq!(rx3.recv().unwrap(), TxStatus::Aborted);
        assert_eq!(logger.persisted_epoch(), 1);

        let segment = segment::Segment::read(&dir.path().join("epoch_1.log"))?;
        assert_eq!(segment.records.len(), 1);
        assert_eq!(harness.stats.snapshot().epochs_persisted, 1);
        assert_eq!(harness.tracker.outstanding(), 0);
        Ok(())
    }

    #[test]
    fn test_full_channel_blocks_until_flush() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let harness = Harness::new();
        let logger = Arc::new(Logger::new(dir.path(), 1, 0, harness.stats.clone()));

        let (first, rx1) = harness.entry(1, &[("alice", "1")]);
        let (second, rx2) = harness.entry(1, &[("bob", "1")]);
        logger.submit(first);

        let submitter = {
            let logger = logger.clone();
            std::thread::spawn(move || logger.submit(second))
        };
        while !submitter.is_finished() {
            logger.flush(1)?;
            std::thread::yield_now();
        }
        submitter.join().unwrap();

        logger.flush(2)?;
        assert_eq!(rx1.recv().unwrap(), TxStatus::Committed);
        assert_eq!(rx2.recv().unwrap(), TxStatus::Committed);
        let segment = segment::Segment::read(&dir.path().join("epoch_1.log"))?;
        assert_eq!(segment.records.len(), 2);
        Ok(())
    }
}
