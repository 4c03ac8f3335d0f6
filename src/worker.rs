use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use crate::engine::Engine;
use crate::error::{Error, Result};

/// A unit of work executed on a worker thread.
pub type Job = Box<dyn FnOnce(&Engine) + Send + 'static>;

/// Fixed set of OS threads executing transaction bodies.
///
/// Each worker registers with the epoch framework only while it runs a
/// transaction, so the pool size bounds the number of epoch participants.
pub struct WorkerPool {
    sender: Option<Sender<Job>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(threads: usize, engine: Arc<Engine>) -> Result<Self> {
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));

        let mut handles = Vec::with_capacity(threads);
        for id in 0..threads {
            let engine = engine.clone();
            let receiver = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("lineairdb-worker-{}", id))
                .spawn(move || work(id, &engine, &receiver))?;
            handles.push(handle);
        }

        tracing::debug!(threads, "Worker pool started");
        Ok(Self {
            sender: Some(sender),
            handles,
        })
    }

    pub fn submit(&self, job: Job) -> Result<()> {
        let sender = self.sender.as_ref().ok_or(Error::ShutDown)?;
        sender.send(job).map_err(|_| Error::ShutDown)
    }

    /// Stops accepting jobs, lets workers drain the queue, and joins them.
    pub fn shutdown(&mut self) {
        if self.sender.take().is_none() {
            return;
        }
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                tracing::error!("Worker thread panicked");
            }
        }
        tracing::debug!("Worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn work(id: usize, engine: &Engine, receiver: &Mutex<Receiver<Job>>) {
    loop {
        let job = {
            let receiver = receiver.lock().unwrap_or_else(PoisonError::into_inner);
            receiver.recv()
        };
        match job {
            Ok(job) => job(engine),
            Err(_) => break,
        }
    }
    tracing::trace!(worker = id, "Worker exiting");
}
