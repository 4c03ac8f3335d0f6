use std::{sync::Arc, time::Duration};

use crate::{
    engine::Engine,
    error::{Error, Result},
    scheduler::{BackgroundTask, Context},
};

/// Lower bound for the flush period.
const MIN_FLUSH_INTERVAL: Duration = Duration::from_millis(1);

pub struct EpochAdvanceTask {
    engine: Arc<Engine>,
}

impl EpochAdvanceTask {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for EpochAdvanceTask {
    fn name(&self) -> &'static str {
        "epoch-advance"
    }

    fn interval(&self) -> Duration {
        self.engine.config().epoch_duration()
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        // Held back by stragglers or by durability lag; the next tick retries.
        self.engine.advance_epoch();
        Ok(())
    }
}

pub struct LogFlushTask {
    engine: Arc<Engine>,
}

impl LogFlushTask {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for LogFlushTask {
    fn name(&self) -> &'static str {
        "log-flush"
    }

    fn interval(&self) -> Duration {
        (self.engine.config().epoch_duration() / 2).max(MIN_FLUSH_INTERVAL)
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        // Keeps running after a log failure: each pass aborts whatever was
        // queued since. Segment writes and fsync block; keep them off the
        // timer thread.
        let engine = self.engine.clone();
        tokio::task::spawn_blocking(move || engine.flush_log())
            .await
            .map_err(|e| Error::InvalidState(format!("Log flush join error: {}", e)))?
    }
}

pub struct StatsTask {
    engine: Arc<Engine>,
}

impl StatsTask {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for StatsTask {
    fn name(&self) -> &'static str {
        "stats"
    }

    fn interval(&self) -> Duration {
        self.engine.config().stats_interval
    }

    async fn execute(&self, ctx: Context) -> Result<()> {
        // The first tick fires at startup, before anything happened.
        if ctx.run_id > 1 {
            self.engine.log_stats();
        }
        Ok(())
    }
}
