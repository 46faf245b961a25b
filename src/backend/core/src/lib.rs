#![allow(clippy::result_large_err)]
//! # Cadence Core
//!
//! Job scheduling and throttling for backends that front slow external work.
//!
//! ## Architecture
//!
//! - **Errors**: One error taxonomy with retryability and HTTP-like status
//! - **Retry**: Capped exponential backoff around any fallible async operation
//! - **Rate Limiter**: Fixed-window admission quotas per user and per organization
//! - **Jobs**: Priority queue, dispatch loop with a concurrency ceiling, and a
//!   claim-once result store with retention
//! - **Telemetry**: Structured logging and metric descriptions

pub mod clock;
pub mod config;
pub mod error;
pub mod jobs;
pub mod rate_limit;
pub mod retry;
pub mod telemetry;

pub use error::{CadenceError, ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::clock::{Clock, ManualClock, TokioClock};
    pub use crate::config::Config;
    pub use crate::error::{
        CadenceError, ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, Result,
    };
    pub use crate::jobs::{
        JobId, JobOptions, JobPriority, JobQueue, JobState, JobWorker, QueueConfig, QueueStatus,
        WorkerConfig, WorkerHandle,
    };
    pub use crate::rate_limit::{LimitScope, RateLimitConfig, RateLimiter};
    pub use crate::retry::{retry, retry_if, with_retry, RetryPolicy, Retryable};
}
