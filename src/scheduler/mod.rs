pub mod tasks;

use std::sync::Arc;
use std::sync::RwLock;
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};

/// Context provided to background tasks during execution
pub struct Context {
    pub task_name: &'static str,
    pub run_id: u64,
    pub shutdown: broadcast::Receiver<()>,
}

/// Trait for background tasks that run periodically
#[async_trait::async_trait]
pub trait BackgroundTask: Send + Sync {
    /// Task name for logging
    fn name(&self) -> &'static str;

    /// How often to run this task
    fn interval(&self) -> Duration;

    /// Execute the task
    async fn execute(&self, ctx: Context) -> Result<()>;
}

/// Runs periodic background tasks on a dedicated runtime.
///
/// The engine API is synchronous, so the scheduler owns its runtime instead
/// of borrowing the caller's. `shutdown` must not be called from inside an
/// async context.
pub struct Scheduler {
    runtime: Runtime,
    tasks: RwLock<Vec<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Scheduler {
    pub fn new() -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("lineairdb-epoch")
            .enable_all()
            .build()?;
        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            runtime,
            tasks: RwLock::new(Vec::new()),
            shutdown_tx,
        })
    }

    /// Register a periodic background task
    pub fn register<T: BackgroundTask + 'static>(&self, task: Arc<T>) -> Result<&Self> {
        let handle = self.spawn_timer_loop(task);
        self.tasks.write()?.push(handle);
        Ok(self)
    }

    fn spawn_timer_loop<T: BackgroundTask + 'static>(&self, task: Arc<T>) -> JoinHandle<()> {
        let interval = task.interval();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut run_id = 0u64;

        self.runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        run_id += 1;
                        let ctx = Context {
                            task_name: task.name(),
                            run_id,
                            shutdown: shutdown_rx.resubscribe(),
                        };

                        if let Err(e) = task.execute(ctx).await {
                            tracing::error!(
                                task = task.name(),
                                error = %e,
                                "Task execution failed"
                            );
                        }
                    }

                    _ = shutdown_rx.recv() => {
                        tracing::debug!(task = task.name(), "Task shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// Graceful shutdown - wait for all tasks, then stop the runtime
    pub fn shutdown(self) -> Result<()> {
        // Signal all tasks to stop
        self.shutdown_tx.send(()).ok();

        let tasks: Vec<_> = self.tasks.write()?.drain(..).collect();
        self.runtime.block_on(async {
            for task in tasks {
                task.await
                    .map_err(|e| Error::InvalidState(format!("Task join error: {}", e)))?;
            }
            Ok::<(), Error>(())
        })
    }
}
