use std::sync::Arc;

use crate::config::Config;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::flock::FileLock;
use crate::index::Index;
use crate::logger::recovery::{self, RecoveryReport};
use crate::logger::Logger;
use crate::scheduler::tasks::{EpochAdvanceTask, LogFlushTask, StatsTask};
use crate::scheduler::Scheduler;
use crate::stats::{Stats, StatsSnapshot};
use crate::transaction::{Transaction, TxStatus};
use crate::worker::{Job, WorkerPool};

/// An embedded transactional key-value store.
///
/// Transactions are submitted with [`Database::execute_transaction`] and run
/// on a pool of `max_thread` workers. Their callbacks fire once the outcome
/// is final: on the worker for aborts and when logging is disabled, on the
/// log flush thread once the commit's epoch is durable otherwise. Calling
/// [`Database::fence`] from inside a callback never returns.
///
/// Dropping the database waits for every submitted transaction, persists the
/// log and stops all threads. It owns a private tokio runtime, so it must not
/// be dropped from inside an async context.
pub struct Database {
    engine: Arc<Engine>,
    workers: Option<WorkerPool>,
    scheduler: Option<Scheduler>,
    recovery: RecoveryReport,
    _lock: Option<FileLock>,
}

impl Database {
    /// Opens the database, replaying the recovery log when logging is on.
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;

        let stats = Arc::new(Stats::new());
        let index = Index::new();

        let (lock, logger, recovery) = if config.enable_logging {
            std::fs::create_dir_all(&config.log_directory)?;
            let lock = FileLock::acquire(&config.log_directory)?;
            let recovery = recovery::replay(&config.log_directory, &index)?;
            tracing::info!(
                dir = %config.log_directory.display(),
                segments = recovery.segments_replayed,
                discarded = recovery.segments_discarded,
                records = recovery.records_applied,
                epoch = recovery.max_epoch,
                "Recovered from log"
            );
            let logger = Logger::new(
                &config.log_directory,
                config.log_channel_capacity,
                recovery.max_epoch,
                stats.clone(),
            );
            (Some(lock), Some(logger), recovery)
        } else {
            (None, None, RecoveryReport::default())
        };

        let engine = Arc::new(Engine::new(
            config.clone(),
            index,
            recovery.next_epoch(),
            logger,
            stats,
        ));

        let workers = WorkerPool::start(config.max_thread, engine.clone())?;

        let scheduler = Scheduler::new()?;
        scheduler.register(Arc::new(EpochAdvanceTask::new(engine.clone())))?;
        if config.enable_logging {
            scheduler.register(Arc::new(LogFlushTask::new(engine.clone())))?;
        }
        scheduler.register(Arc::new(StatsTask::new(engine.clone())))?;

        tracing::info!(
            workers = config.max_thread,
            epoch = engine.current_epoch(),
            logging = config.enable_logging,
            "Database opened"
        );

        Ok(Self {
            engine,
            workers: Some(workers),
            scheduler: Some(scheduler),
            recovery,
            _lock: lock,
        })
    }

    /// Submits a transaction. `body` runs on a worker; `on_finish` receives
    /// `Committed` or `Aborted` exactly once.
    ///
    /// Fails without invoking `on_finish` once the recovery log has failed.
    pub fn execute_transaction<F, C>(&self, body: F, on_finish: C) -> Result<()>
    where
        F: FnOnce(&mut Transaction<'_>) + Send + 'static,
        C: FnOnce(TxStatus) + Send + 'static,
    {
        if self.engine.is_failed() {
            return Err(Error::EngineFailed(
                "recovery log is unavailable".to_string(),
            ));
        }
        let workers = self.workers.as_ref().ok_or(Error::ShutDown)?;

        let completion = self.engine.completion(Box::new(on_finish));
        let job: Job = Box::new(move |engine: &Engine| engine.run(body, completion));
        workers.submit(job)
    }

    /// Blocks until every transaction submitted before the call has
    /// terminated and its callback has returned.
    ///
    /// Must not be called from inside an `on_finish` callback: the callback
    /// counts as outstanding until it returns, so the call never completes.
    pub fn fence(&self) {
        self.engine.fence();
    }

    pub fn config(&self) -> &Config {
        self.engine.config()
    }

    pub fn current_epoch(&self) -> u64 {
        self.engine.current_epoch()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.engine.stats()
    }

    /// What the last open replayed from the log directory.
    pub fn recovery(&self) -> &RecoveryReport {
        &self.recovery
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        self.engine.fence();

        if let Some(mut workers) = self.workers.take() {
            workers.shutdown();
        }
        if let Some(scheduler) = self.scheduler.take() {
            if let Err(e) = scheduler.shutdown() {
                tracing::error!(error = %e, "Background scheduler shutdown failed");
            }
        }
        if let Err(e) = self.engine.flush_log() {
            tracing::error!(error = %e, "Final log flush failed");
        }

        let stats = self.engine.stats();
        tracing::info!(
            commits = stats.commits,
            aborts = stats.aborts(),
            persisted = ?self.engine.persisted_epoch(),
            "Database closed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    fn config(dir: &Path) -> Config {
        Config::new(4).epoch_duration_ms(2).log_directory(dir)
    }

    /// Runs one transaction and waits for its outcome.
    fn execute<F>(db: &Database, body: F) -> TxStatus
    where
        F: FnOnce(&mut Transaction<'_>) + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        db.execute_transaction(body, move |status: TxStatus| {
            let _ = tx.send(status);
        })
        .expect("submission should succeed");
        rx.recv().expect("callback should fire")
    }

    /// Reads keys in one transaction and returns what it saw.
    fn read_all(db: &Database, keys: &[&str]) -> (TxStatus, Vec<Option<Vec<u8>>>) {
        let (tx, rx) = mpsc::channel();
        let keys: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
        let status = execute(db, move |t| {
            let seen: Vec<Option<Vec<u8>>> =
                keys.iter().map(|k| t.read(k).map(|v| v.to_vec())).collect();
            let _ = tx.send(seen);
        });
        (status, rx.recv().expect("body should report"))
    }

    #[test]
    fn test_open_rejects_invalid_config() {
        let result = Database::open(Config::new(0));
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_config_is_returned_unchanged() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = config(dir.path());
        let db = Database::open(config.clone())?;
        assert_eq!(db.config(), &config);
        Ok(())
    }

    #[test]
    fn test_write_then_read() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let db = Database::open(config(dir.path()))?;

        let status = execute(&db, |t| t.write_value("alice", &1i32).unwrap());
        assert_eq!(status, TxStatus::Committed);

        let (tx, rx) = mpsc::channel();
        let status = execute(&db, move |t| {
            let alice = t.read_value::<i32>("alice").unwrap();
            let bob = t.read("bob");
            tx.send((alice, bob.is_none())).unwrap();
        });
        assert_eq!(status, TxStatus::Committed);
        assert_eq!(rx.recv().unwrap(), (Some(1), true));
        Ok(())
    }

    #[test]
    fn test_user_abort_leaves_store_unchanged() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let db = Database::open(config(dir.path()))?;

        let status = execute(&db, |t| {
            t.write("alice", 1i32.to_le_bytes());
            t.abort();
        });
        assert_eq!(status, TxStatus::Aborted);

        let (tx, rx) = mpsc::channel();
        let status = execute(&db, move |t| {
            let before = t.read("alice").is_none();
            t.abort();
            let after = t.read("alice").is_none();
            tx.send((before, after)).unwrap();
        });
        assert_eq!(status, TxStatus::Aborted);
        assert_eq!(rx.recv().unwrap(), (true, true));
        assert_eq!(db.stats().user_aborts, 2);
        Ok(())
    }

    #[test]
    fn test_read_your_own_writes() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let db = Database::open(config(dir.path()))?;

        let (tx, rx) = mpsc::channel();
        let status = execute(&db, move |t| {
            t.write_value("alice", &1i32).unwrap();
            tx.send(t.read_value::<i32>("alice").unwrap()).unwrap();
        });
        assert_eq!(status, TxStatus::Committed);
        assert_eq!(rx.recv().unwrap(), Some(1));
        Ok(())
    }

    #[test]
    fn test_concurrent_insertions() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let db = Database::open(config(dir.path()))?;
        let keys: Vec<String> = (0..=10).map(|i| format!("alice{}", i)).collect();

        std::thread::scope(|s| {
            for _ in 0..4 {
                let keys = keys.clone();
                let db = &db;
                s.spawn(move || {
                    db.execute_transaction(
                        move |t| {
                            for key in &keys {
                                t.write(key, 0xBEEFi32.to_le_bytes());
                            }
                        },
                        |_| {},
                    )
                    .unwrap();
                });
            }
        });
        db.fence();

        let key_refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        let (status, values) = read_all(&db, &key_refs);
        assert_eq!(status, TxStatus::Committed);
        for value in values {
            assert_eq!(value, Some(0xBEEFi32.to_le_bytes().to_vec()));
        }
        Ok(())
    }

    #[test]
    fn test_fence_waits_for_every_callback() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let db = Database::open(config(dir.path()))?;
        let finished = Arc::new(AtomicUsize::new(0));

        for i in 0..100u32 {
            let finished = finished.clone();
            db.execute_transaction(
                move |t| t.write(format!("key{}", i % 10), i.to_le_bytes()),
                move |_| {
                    finished.fetch_add(1, Ordering::SeqCst);
                },
            )?;
        }
        db.fence();
        assert_eq!(finished.load(Ordering::SeqCst), 100);

        let stats = db.stats();
        assert_eq!(stats.commits + stats.aborts(), 100);
        Ok(())
    }

    #[test]
    fn test_concurrent_increments_are_serializable() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let db = Database::open(config(dir.path()))?;
        let committed = Arc::new(AtomicUsize::new(0));

        for _ in 0..200 {
            let committed = committed.clone();
            db.execute_transaction(
                |t| {
                    let current = t.read_value::<u64>("counter").unwrap().unwrap_or(0);
                    t.write_value("counter", &(current + 1)).unwrap();
                },
                move |status| {
                    if status == TxStatus::Committed {
                        committed.fetch_add(1, Ordering::SeqCst);
                    }
                },
            )?;
        }
        db.fence();

        let (tx, rx) = mpsc::channel();
        execute(&db, move |t| {
            tx.send(t.read_value::<u64>("counter").unwrap()).unwrap();
        });
        let counter = rx.recv().unwrap().unwrap_or(0);
        assert_eq!(counter, committed.load(Ordering::SeqCst) as u64);
        assert!(counter > 0);
        Ok(())
    }

    #[test]
    fn test_durable_recovery() -> Result<()> {
        let dir = tempfile::tempdir()?;
        {
            let db = Database::open(config(dir.path()))?;
            assert_eq!(execute(&db, |t| t.write_value("alice", &1i32).unwrap()), TxStatus::Committed);
            assert_eq!(execute(&db, |t| t.write_value("bob", &1i32).unwrap()), TxStatus::Committed);
            db.fence();
        }

        let db = Database::open(config(dir.path()))?;
        assert!(db.recovery().segments_replayed >= 1);
        assert_eq!(db.recovery().records_applied, 2);
        assert!(db.current_epoch() > db.recovery().max_epoch);

        let (tx, rx) = mpsc::channel();
        execute(&db, move |t| {
            let alice = t.read_value::<i32>("alice").unwrap();
            let bob = t.read_value::<i32>("bob").unwrap();
            tx.send((alice, bob)).unwrap();
        });
        assert_eq!(rx.recv().unwrap(), (Some(1), Some(1)));
        Ok(())
    }

    #[test]
    fn test_crash_before_segment_end() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let last_epoch = {
            let db = Database::open(config(dir.path()))?;
            assert_eq!(execute(&db, |t| t.write("alice", b"1")), TxStatus::Committed);
            db.fence();
            db.recovery().max_epoch.max(db.current_epoch())
        };

        // A later epoch whose records reached disk but whose end marker did not.
        let crashed = last_epoch + 1;
        let mut writer = crate::logger::segment::SegmentWriter::create(dir.path(), crashed)?;
        writer.append(b"alice", b"2")?;
        writer.append(b"bob", b"2")?;
        drop(writer);
        let torn = dir.path().join(crate::logger::segment::file_name(crashed));
        assert!(torn.exists());

        let db = Database::open(config(dir.path()))?;
        assert_eq!(db.recovery().segments_discarded, 1);
        assert!(!torn.exists());

        let (status, values) = read_all(&db, &["alice", "bob"]);
        assert_eq!(status, TxStatus::Committed);
        assert_eq!(values, vec![Some(b"1".to_vec()), None]);
        Ok(())
    }

    #[test]
    fn test_second_open_on_same_directory_fails() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let _db = Database::open(config(dir.path()))?;
        assert!(matches!(
            Database::open(config(dir.path())),
            Err(Error::LockError(_))
        ));
        Ok(())
    }

    #[test]
    fn test_without_logging_nothing_is_written() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let log_dir = dir.path().join("logs");
        let db = Database::open(config(&log_dir).enable_logging(false))?;

        assert_eq!(execute(&db, |t| t.write("alice", b"1")), TxStatus::Committed);
        let (_, values) = read_all(&db, &["alice"]);
        assert_eq!(values, vec![Some(b"1".to_vec())]);

        drop(db);
        assert!(!log_dir.exists());
        Ok(())
    }

    #[test]
    fn test_panicking_body_is_aborted() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let db = Database::open(config(dir.path()))?;

        let status = execute(&db, |t| {
            t.write("alice", b"1");
            panic!("body failure");
        });
        assert_eq!(status, TxStatus::Aborted);

        // The worker survives and keeps serving transactions.
        let (_, values) = read_all(&db, &["alice"]);
        assert_eq!(values, vec![None]);
        assert_eq!(db.stats().panics, 1);
        Ok(())
    }

    #[test]
    fn test_segments_are_written_per_epoch() -> Result<()> {
        let dir = tempfile::tempdir()?;
        {
            let db = Database::open(config(dir.path()))?;
            for i in 0..20u32 {
                execute(&db, move |t| t.write(format!("key{}", i), i.to_le_bytes()));
            }
        }

        let segments: Vec<u64> = fs::read_dir(dir.path())?
            .filter_map(|entry| crate::logger::segment::parse_file_name(&entry.ok()?.path()))
            .collect();
        assert!(!segments.is_empty());
        for epoch in segments {
            let segment = crate::logger::segment::Segment::read(
                &dir.path().join(crate::logger::segment::file_name(epoch)),
            )?;
            assert_eq!(segment.epoch, epoch);
            assert!(!segment.records.is_empty());
        }
        Ok(())
    }

    #[test]
    fn test_log_failure_is_terminal() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let log_dir = dir.path().join("logs");
        let db = Database::open(config(&log_dir))?;
        assert_eq!(execute(&db, |t| t.write("alice", b"1")), TxStatus::Committed);

        // Segment creation fails from now on.
        fs::remove_dir_all(&log_dir)?;
        assert_eq!(execute(&db, |t| t.write("bob", b"1")), TxStatus::Aborted);

        let result = db.execute_transaction(
            |t| {
                t.read("alice");
            },
            |_status: TxStatus| panic!("callback of a rejected submission"),
        );
        assert!(matches!(result, Err(Error::EngineFailed(_))));
        assert!(db.stats().failure_aborts >= 1);

        db.fence();
        drop(db);
        Ok(())
    }

    #[test]
    fn test_bodies_never_see_a_mixed_snapshot() -> Result<()> {
        const TOTAL: i64 = 2_000;

        let dir = tempfile::tempdir()?;
        let db = Database::open(config(dir.path()).epoch_duration_ms(1))?;
        let status = execute(&db, |t| {
            t.write_value("a", &(TOTAL / 2)).unwrap();
            t.write_value("b", &(TOTAL / 2)).unwrap();
        });
        assert_eq!(status, TxStatus::Committed);

        let (seen_tx, seen_rx) = mpsc::channel();
        for i in 0..400i64 {
            if i % 2 == 0 {
                let amount = if i % 4 == 0 { 1 } else { -1 };
                db.execute_transaction(
                    move |t| {
                        let a: i64 = t.read_value("a").unwrap().unwrap_or(0);
                        let b: i64 = t.read_value("b").unwrap().unwrap_or(0);
                        t.write_value("a", &(a - amount)).unwrap();
                        t.write_value("b", &(b + amount)).unwrap();
                    },
                    |_status: TxStatus| {},
                )?;
            } else {
                let seen_tx = seen_tx.clone();
                db.execute_transaction(
                    move |t| {
                        let a = t.read_value::<i64>("a").unwrap();
                        std::thread::yield_now();
                        let b = t.read_value::<i64>("b").unwrap();
                        let again = t.read_value::<i64>("a").unwrap();
                        let _ = seen_tx.send((a, b, again, t.is_aborted()));
                    },
                    |_status: TxStatus| {},
                )?;
            }
        }
        drop(seen_tx);
        db.fence();

        for (a, b, again, aborted) in seen_rx {
            assert_eq!(a, again, "repeat read changed (aborted: {})", aborted);
            if let (Some(a), Some(b)) = (a, b) {
                assert_eq!(a + b, TOTAL, "mixed snapshot (aborted: {})", aborted);
            }
            if !aborted {
                assert!(a.is_some() && b.is_some());
            }
        }

        let (tx, rx) = mpsc::channel();
        let status = execute(&db, move |t| {
            let a = t.read_value::<i64>("a").unwrap();
            let b = t.read_value::<i64>("b").unwrap();
            tx.send((a, b)).unwrap();
        });
        assert_eq!(status, TxStatus::Committed);
        let (a, b) = rx.recv().unwrap();
        assert_eq!(a.unwrap() + b.unwrap(), TOTAL);
        Ok(())
    }
}
