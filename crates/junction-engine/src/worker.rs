//! Bounded pool for long-running, potentially blocking work.
//!
//! Work runs on tokio's blocking thread pool. A semaphore bounds how many
//! items may be admitted (running or waiting for a thread) at once; past
//! that bound `try_submit` rejects instead of blocking. One pool is usually
//! shared by every compartment in the process.

use std::sync::Arc;

use tokio::runtime::{Builder, Runtime};
use tokio::sync::Semaphore;

use junction_core::config::WorkerConfig;
use junction_core::{Result, TransportError};

/// The pool is at capacity. Not an error condition for callers; they are
/// expected to retry later or shed the work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("worker pool at capacity")]
pub struct Rejected;

pub struct WorkerPool {
    // Option so Drop can hand the runtime to shutdown_background.
    runtime: Option<Runtime>,
    permits: Arc<Semaphore>,
    capacity: usize,
    threads: usize,
}

impl WorkerPool {
    pub fn new(config: &WorkerConfig) -> Result<Self> {
        let threads = config.effective_threads();
        let capacity = config.queue_capacity.max(1);
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(threads)
            .thread_name("junction-worker")
            .enable_time()
            .build()
            .map_err(TransportError::fault)?;

        tracing::info!(threads, capacity, "worker pool started");

        Ok(Self {
            runtime: Some(runtime),
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
            threads,
        })
    }

    /// Admit `work` if a slot is free. Never blocks.
    pub fn try_submit<F>(&self, work: F) -> std::result::Result<(), Rejected>
    where
        F: FnOnce() + Send + 'static,
    {
        let runtime = self.runtime.as_ref().ok_or(Rejected)?;
        let permit = Arc::clone(&self.permits)
            .try_acquire_owned()
            .map_err(|_| Rejected)?;
        runtime.spawn_blocking(move || {
            let _permit = permit;
            work();
        });
        Ok(())
    }

    /// Free admission slots.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn threads(&self) -> usize {
        self.threads
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            // Safe from any thread, including this pool's own workers.
            runtime.shutdown_background();
            tracing::debug!("worker pool stopped");
        }
    }
}
