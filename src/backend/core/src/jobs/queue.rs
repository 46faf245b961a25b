//! In-memory priority job queue with a claim-once result store.

use std::any::Any;
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use metrics::{counter, gauge, histogram};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, error_span, info};

use super::job::{Job, JobId, JobOptions, JobPriority, JobState};
use crate::error::{CadenceError, Result};
use crate::rate_limit::{RateLimitConfig, RateLimiter};

/// Configuration for the job queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Ceiling on jobs executing at once
    pub max_concurrent_jobs: usize,
    /// How long an unclaimed result is kept
    #[serde(with = "humantime_serde")]
    pub result_retention: Duration,
    /// Fallback re-check interval for result waiters
    #[serde(with = "humantime_serde")]
    pub result_poll_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 10,
            result_retention: Duration::from_secs(3600),
            result_poll_interval: Duration::from_millis(500),
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_jobs == 0 {
            return Err(CadenceError::validation(
                "max_concurrent_jobs must be at least 1",
            ));
        }
        if self.result_poll_interval.is_zero() {
            return Err(CadenceError::validation(
                "result_poll_interval must be greater than zero",
            ));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Pending Jobs
// ═══════════════════════════════════════════════════════════════════════════════

/// Ordered collection of admitted jobs awaiting dispatch.
///
/// High jobs are pushed to the front, so the newest high job runs first.
/// Normal jobs are placed after every high and normal job already present
/// and ahead of the first low job. Low jobs are appended.
pub struct PendingJobs<T> {
    jobs: VecDeque<Job<T>>,
}

impl<T> PendingJobs<T> {
    pub fn new() -> Self {
        Self {
            jobs: VecDeque::new(),
        }
    }

    pub fn insert(&mut self, job: Job<T>) {
        match job.priority {
            JobPriority::High => self.jobs.push_front(job),
            JobPriority::Low => self.jobs.push_back(job),
            JobPriority::Normal => {
                let index = self
                    .jobs
                    .iter()
                    .position(|queued| queued.priority == JobPriority::Low)
                    .unwrap_or(self.jobs.len());
                self.jobs.insert(index, job);
            }
        }
    }

    pub fn pop_front(&mut self) -> Option<Job<T>> {
        self.jobs.pop_front()
    }

    pub fn contains(&self, id: &JobId) -> bool {
        self.jobs.iter().any(|job| &job.id == id)
    }

    /// Ids in dispatch order.
    pub fn ids(&self) -> impl Iterator<Item = &JobId> {
        self.jobs.iter().map(|job| &job.id)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

impl<T> Default for PendingJobs<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Status
// ═══════════════════════════════════════════════════════════════════════════════

/// Point-in-time sizes of the three job collections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub queued_jobs: usize,
    pub running_jobs: usize,
    pub completed_jobs: usize,
}

/// Queue statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    /// Jobs waiting for dispatch
    pub pending: usize,
    /// Jobs executing now
    pub running: usize,
    /// Results stored and not yet claimed
    pub completed: usize,
    /// Jobs admitted since creation
    pub enqueued_total: u64,
    /// Jobs that finished with a value
    pub succeeded_total: u64,
    /// Jobs that finished with an error or a panic
    pub failed_total: u64,
    /// Results dropped by retention before anyone claimed them
    pub expired_total: u64,
    /// Configured concurrency ceiling
    pub max_concurrent_jobs: usize,
}

#[derive(Debug, Default)]
struct QueueCounters {
    enqueued: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    expired: AtomicU64,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Queue
// ═══════════════════════════════════════════════════════════════════════════════

/// A finished job's outcome and the timer that will drop it.
struct StoredResult<T> {
    outcome: Result<T>,
    expiry: AbortHandle,
}

struct QueueState<T> {
    pending: PendingJobs<T>,
    running: HashSet<JobId>,
    results: HashMap<JobId, StoredResult<T>>,
}

struct Inner<T> {
    config: QueueConfig,
    limiter: Arc<RateLimiter>,
    state: Mutex<QueueState<T>>,
    /// Wakes the dispatch loop on admission and on completion
    dispatch_signal: Notify,
    /// Wakes result waiters when an outcome is stored
    result_signal: Notify,
    counters: QueueCounters,
    dispatcher_active: AtomicBool,
}

impl<T> Inner<T> {
    fn expire(&self, job_id: &JobId) {
        let removed = self.state.lock().results.remove(job_id).is_some();
        if removed {
            self.counters.expired.fetch_add(1, Ordering::Relaxed);
            counter!("cadence_job_results_expired_total").increment(1);
            info!(
                service = "job-queue",
                job_id = %job_id,
                retention_secs = self.config.result_retention.as_secs(),
                "Unclaimed job result expired"
            );
        }
    }
}

/// Outcome of asking the queue for the next job to dispatch.
pub(crate) enum NextJob<T> {
    /// A job was moved from pending to running
    Ready { job: Job<T>, running: usize },
    /// The concurrency ceiling is reached
    AtCapacity,
    /// Nothing is pending
    Empty,
}

/// Cloneable handle to a shared job queue.
///
/// Jobs are admitted through the rate limiter, held in priority order, and
/// executed by a [`JobWorker`](super::JobWorker) dispatch loop. Each outcome is
/// stored until claimed once through [`get_result`](Self::get_result) or until
/// the retention window elapses.
pub struct JobQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for JobQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> JobQueue<T> {
    /// Create a queue with its own rate limiter.
    pub fn new(config: QueueConfig, rate_limit: RateLimitConfig) -> Self {
        Self::with_limiter(config, Arc::new(RateLimiter::new(rate_limit)))
    }

    /// Create a queue that shares an existing rate limiter.
    pub fn with_limiter(config: QueueConfig, limiter: Arc<RateLimiter>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                limiter,
                state: Mutex::new(QueueState {
                    pending: PendingJobs::new(),
                    running: HashSet::new(),
                    results: HashMap::new(),
                }),
                dispatch_signal: Notify::new(),
                result_signal: Notify::new(),
                counters: QueueCounters::default(),
                dispatcher_active: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.inner.limiter
    }

    /// Admit a unit of work.
    ///
    /// The rate limit is checked and consumed before anything is queued; a
    /// rejected job leaves no trace in the queue.
    pub fn add_job<F, Fut>(&self, work: F, options: JobOptions) -> Result<JobId>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        if options.user_id.trim().is_empty() {
            return Err(CadenceError::validation("Job owner user_id must not be empty"));
        }

        self.inner
            .limiter
            .check_and_consume(&options.user_id, options.organization_id.as_deref())?;

        let job = Job::new(Box::new(move || work().boxed()), options);
        let job_id = job.id.clone();
        let priority = job.priority;
        let user_id = job.owner_user_id.clone();

        let queued = {
            let mut state = self.inner.state.lock();
            state.pending.insert(job);
            state.pending.len()
        };

        self.inner.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        counter!("cadence_jobs_enqueued_total", "priority" => priority.as_str()).increment(1);
        info!(
            service = "job-queue",
            job_id = %job_id,
            priority = %priority,
            user_id = %user_id,
            queued,
            "Job queued"
        );

        self.inner.dispatch_signal.notify_one();
        Ok(job_id)
    }

    /// Wait for a job's outcome and claim it.
    ///
    /// Returns the job's value, or the job's own error unchanged. A claimed,
    /// expired or unknown id yields `NOT_FOUND`.
    pub async fn get_result(&self, job_id: &JobId) -> Result<T> {
        loop {
            let notified = self.inner.result_signal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(outcome) = self.try_claim(job_id)? {
                return outcome;
            }

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(self.inner.config.result_poll_interval) => {}
            }
        }
    }

    /// Like [`get_result`](Self::get_result) but gives up after `timeout`.
    ///
    /// Giving up does not claim the result; a later call can still get it.
    pub async fn get_result_timeout(&self, job_id: &JobId, timeout: Duration) -> Result<T> {
        tokio::time::timeout(timeout, self.get_result(job_id))
            .await
            .map_err(|elapsed| {
                CadenceError::from(elapsed).with_context("job_id", job_id.as_str())
            })?
    }

    fn try_claim(&self, job_id: &JobId) -> Result<Option<Result<T>>> {
        let mut state = self.inner.state.lock();
        if let Some(stored) = state.results.remove(job_id) {
            stored.expiry.abort();
            debug!(service = "job-queue", job_id = %job_id, "Job result claimed");
            return Ok(Some(stored.outcome));
        }
        if state.running.contains(job_id) || state.pending.contains(job_id) {
            return Ok(None);
        }
        Err(CadenceError::not_found("Job", job_id.as_str()))
    }

    pub fn get_status(&self) -> QueueStatus {
        let state = self.inner.state.lock();
        QueueStatus {
            queued_jobs: state.pending.len(),
            running_jobs: state.running.len(),
            completed_jobs: state.results.len(),
        }
    }

    pub fn stats(&self) -> QueueStats {
        let status = self.get_status();
        let counters = &self.inner.counters;
        QueueStats {
            pending: status.queued_jobs,
            running: status.running_jobs,
            completed: status.completed_jobs,
            enqueued_total: counters.enqueued.load(Ordering::Relaxed),
            succeeded_total: counters.succeeded.load(Ordering::Relaxed),
            failed_total: counters.failed.load(Ordering::Relaxed),
            expired_total: counters.expired.load(Ordering::Relaxed),
            max_concurrent_jobs: self.inner.config.max_concurrent_jobs,
        }
    }

    /// Which collection holds the job, if any.
    pub fn job_state(&self, job_id: &JobId) -> Option<JobState> {
        let state = self.inner.state.lock();
        if state.results.contains_key(job_id) {
            Some(JobState::Completed)
        } else if state.running.contains(job_id) {
            Some(JobState::Running)
        } else if state.pending.contains(job_id) {
            Some(JobState::Pending)
        } else {
            None
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Dispatch plumbing used by the worker
    // ─────────────────────────────────────────────────────────────────────────

    pub(crate) fn claim_dispatcher(&self) -> bool {
        !self.inner.dispatcher_active.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn release_dispatcher(&self) {
        self.inner.dispatcher_active.store(false, Ordering::Release);
    }

    pub(crate) async fn dispatch_signalled(&self) {
        self.inner.dispatch_signal.notified().await;
    }

    /// Move the head of the pending queue into the running set if there is room.
    pub(crate) fn next_job(&self) -> NextJob<T> {
        let mut state = self.inner.state.lock();
        if state.running.len() >= self.inner.config.max_concurrent_jobs {
            return NextJob::AtCapacity;
        }
        match state.pending.pop_front() {
            Some(job) => {
                state.running.insert(job.id.clone());
                let running = state.running.len();
                drop(state);
                gauge!("cadence_jobs_running").set(running as f64);
                NextJob::Ready { job, running }
            }
            None => NextJob::Empty,
        }
    }

    /// Execute a dispatched job on its own task.
    pub(crate) fn launch(&self, job: Job<T>) {
        let queue = self.clone();
        tokio::spawn(async move {
            let Job {
                id,
                work,
                priority,
                owner_user_id,
                description,
                ..
            } = job;

            debug!(
                service = "job-queue",
                job_id = %id,
                priority = %priority,
                user_id = %owner_user_id,
                description = %description,
                "Job started"
            );

            let started = Instant::now();
            let outcome = match AssertUnwindSafe(async move { work().await })
                .catch_unwind()
                .await
            {
                Ok(outcome) => outcome,
                Err(payload) => Err(CadenceError::internal(format!(
                    "Job panicked: {}",
                    panic_message(payload.as_ref())
                ))
                .with_context("job_id", id.as_str())),
            };
            let elapsed = started.elapsed();
            histogram!("cadence_job_duration_seconds").record(elapsed.as_secs_f64());

            match &outcome {
                Ok(_) => info!(
                    service = "job-queue",
                    job_id = %id,
                    duration_ms = elapsed.as_millis() as u64,
                    "Job completed"
                ),
                Err(err) => {
                    let _job = error_span!(
                        "job_failed",
                        job_id = %id,
                        duration_ms = elapsed.as_millis() as u64
                    )
                    .entered();
                    err.log("job-queue");
                }
            }

            queue.complete(id, outcome);
        });
    }

    fn complete(&self, job_id: JobId, outcome: Result<T>) {
        let succeeded = outcome.is_ok();
        let running = {
            let mut state = self.inner.state.lock();
            // Spawned under the lock so expiry cannot run before the insert.
            let expiry = self.schedule_expiry(job_id.clone());
            state.running.remove(&job_id);
            state.results.insert(job_id, StoredResult { outcome, expiry });
            state.running.len()
        };

        if succeeded {
            self.inner.counters.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner.counters.failed.fetch_add(1, Ordering::Relaxed);
        }
        counter!(
            "cadence_jobs_completed_total",
            "outcome" => if succeeded { "success" } else { "failure" }
        )
        .increment(1);
        gauge!("cadence_jobs_running").set(running as f64);

        self.inner.result_signal.notify_waiters();
        self.inner.dispatch_signal.notify_one();
    }

    /// Spawn the retention timer for a result. Claiming aborts it.
    fn schedule_expiry(&self, job_id: JobId) -> AbortHandle {
        let inner = Arc::downgrade(&self.inner);
        let retention = self.inner.config.result_retention;
        tokio::spawn(async move {
            tokio::time::sleep(retention).await;
            if let Some(inner) = inner.upgrade() {
                inner.expire(&job_id);
            }
        })
        .abort_handle()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
