//! Background job system.
//!
//! - **Job**: deferred work plus its owner and priority
//! - **Queue**: rate-limited admission, priority ordering and the result store
//! - **Worker**: dispatch loop enforcing the concurrency ceiling
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐    ┌──────────────┐    ┌─────────────┐    ┌──────────────┐
//! │   add_job   │───▶│ Rate Limiter │───▶│   Pending   │───▶│  JobWorker   │
//! │             │    │ (user, org)  │    │  (priority) │    │  (dispatch)  │
//! └─────────────┘    └──────────────┘    └─────────────┘    └──────┬───────┘
//!                                                                   │ spawn
//!        ┌──────────────┐         ┌─────────────┐           ┌──────▼───────┐
//!        │  get_result  │◀────────│   Results   │◀──────────│   Running    │
//!        │ (claim once) │         │ (retention) │           │  (ceiling)   │
//!        └──────────────┘         └─────────────┘           └──────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use cadence_core::jobs::{JobOptions, JobPriority, JobQueue, JobWorker, QueueConfig, WorkerConfig};
//! use cadence_core::rate_limit::RateLimitConfig;
//!
//! let queue = JobQueue::new(QueueConfig::default(), RateLimitConfig::default());
//! let worker = JobWorker::new(WorkerConfig::default()).start(queue.clone())?;
//!
//! let id = queue.add_job(
//!     || async { Ok(42) },
//!     JobOptions::new("user-1").priority(JobPriority::High),
//! )?;
//! let value = queue.get_result(&id).await?;
//! ```

pub mod job;
pub mod queue;
pub mod worker;

pub use job::{Job, JobId, JobOptions, JobPriority, JobState, Work};
pub use queue::{JobQueue, PendingJobs, QueueConfig, QueueStats, QueueStatus};
pub use worker::{JobWorker, WorkerConfig, WorkerHandle, WorkerStats};
