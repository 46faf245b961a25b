//! Dispatch loop that moves jobs from the pending queue onto tasks.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::queue::{JobQueue, NextJob};
use crate::error::{CadenceError, Result};

/// Configuration for the dispatch loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Worker name used in logs
    pub name: String,
    /// Fallback tick when no admission or completion wakes the loop
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "cadence-dispatcher".to_string(),
            poll_interval: Duration::from_millis(1000),
        }
    }
}

/// Statistics for the dispatch loop.
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    /// Jobs moved from pending to running
    pub dispatched: Arc<AtomicU64>,
    /// Times a pending job had to wait for a free slot
    pub saturated: Arc<AtomicU64>,
    /// Highest number of jobs running at once
    pub peak_concurrent: Arc<AtomicU64>,
}

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    pub fn saturated(&self) -> u64 {
        self.saturated.load(Ordering::Relaxed)
    }

    pub fn peak_concurrent(&self) -> u64 {
        self.peak_concurrent.load(Ordering::Relaxed)
    }

    fn record_dispatch(&self, running: usize) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        self.peak_concurrent
            .fetch_max(running as u64, Ordering::Relaxed);
    }
}

/// Handle for controlling a running dispatch loop.
///
/// Dropping the handle leaves the loop running.
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    stats: WorkerStats,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Signal the loop to stop dispatching.
    ///
    /// Jobs already running finish on their own tasks and pending jobs stay
    /// queued.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Signal shutdown and wait for the loop to exit.
    pub async fn stop(self) {
        self.shutdown();
        if let Err(err) = self.task.await {
            tracing::error!(service = "job-worker", error = %err, "Dispatch loop task failed");
        }
    }

    /// Get worker statistics.
    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }
}

/// Drives a [`JobQueue`]: whenever a slot is free and a job is pending, the
/// head job is marked running and spawned on its own task.
pub struct JobWorker {
    config: WorkerConfig,
    stats: WorkerStats,
}

impl JobWorker {
    /// Create a new job worker.
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            config,
            stats: WorkerStats::new(),
        }
    }

    /// Start the dispatch loop, returning a handle for control.
    ///
    /// A queue accepts one dispatch loop at a time.
    pub fn start<T: Send + 'static>(self, queue: JobQueue<T>) -> Result<WorkerHandle> {
        queue.config().validate()?;
        if self.config.poll_interval.is_zero() {
            return Err(CadenceError::validation(
                "poll_interval must be greater than zero",
            ));
        }
        if !queue.claim_dispatcher() {
            return Err(CadenceError::validation(
                "A dispatch loop is already running for this queue",
            ));
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let stats = self.stats.clone();
        let config = self.config;

        let task = tokio::spawn(async move {
            tracing::info!(
                service = "job-worker",
                worker = %config.name,
                max_concurrent_jobs = queue.config().max_concurrent_jobs,
                "Dispatch loop started"
            );

            let mut handle_alive = true;
            loop {
                let stopping = *shutdown_rx.borrow();
                if stopping {
                    tracing::info!(service = "job-worker", worker = %config.name, "Dispatch loop shutting down");
                    break;
                }

                match queue.next_job() {
                    NextJob::Ready { job, running } => {
                        stats.record_dispatch(running);
                        tracing::debug!(
                            service = "job-worker",
                            worker = %config.name,
                            job_id = %job.id,
                            priority = %job.priority,
                            running,
                            "Dispatching job"
                        );
                        queue.launch(job);
                        continue;
                    }
                    NextJob::AtCapacity => {
                        stats.saturated.fetch_add(1, Ordering::Relaxed);
                    }
                    NextJob::Empty => {}
                }

                tokio::select! {
                    changed = shutdown_rx.changed(), if handle_alive => {
                        if changed.is_err() {
                            handle_alive = false;
                        }
                    }
                    _ = queue.dispatch_signalled() => {}
                    _ = tokio::time::sleep(config.poll_interval) => {}
                }
            }

            queue.release_dispatcher();
            tracing::info!(service = "job-worker", worker = %config.name, "Dispatch loop stopped");
        });

        Ok(WorkerHandle {
            shutdown: shutdown_tx,
            stats: self.stats,
            task,
        })
    }
}
