//! Retry executor with capped exponential backoff.
//!
//! Wraps a unit of work with a bounded number of retries. The delay before
//! the Nth retry (zero-based) is `min(initial_delay * factor^N, max_delay)`,
//! optionally scaled by random jitter that never exceeds `max_delay`.
//!
//! # Example
//!
//! ```rust,ignore
//! use cadence_core::retry::{retry, RetryPolicy};
//!
//! let policy = RetryPolicy::with_retries(3).named("create_pod");
//! let pod = retry(&policy, || compute.create_pod(&spec)).await?;
//! ```

use std::fmt;
use std::future::Future;
use std::time::Duration;

use futures::future::BoxFuture;
use metrics::counter;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::error::CadenceError;

/// Errors that know whether another attempt is worthwhile.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for CadenceError {
    fn is_retryable(&self) -> bool {
        CadenceError::is_retryable(self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Retry Policy
// ═══════════════════════════════════════════════════════════════════════════════

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Label used in logs and metrics
    pub name: String,
    /// Additional attempts after the first
    pub retries: u32,
    /// Delay before the first retry
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,
    /// Ceiling for any single delay
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Multiplicative growth per retry
    pub factor: f64,
    /// Random spread in `[0, 1]`; 0 disables jitter
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            name: "operation".to_string(),
            retries: 3,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            factor: 2.0,
            jitter: 0.0,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with no retries.
    pub fn no_retry() -> Self {
        Self {
            retries: 0,
            ..Default::default()
        }
    }

    /// Create a policy with a specific number of retries.
    pub fn with_retries(retries: u32) -> Self {
        Self {
            retries,
            ..Default::default()
        }
    }

    /// Create an exponential policy from its three parameters.
    pub fn exponential(initial_delay: Duration, factor: f64, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            factor,
            max_delay,
            ..Default::default()
        }
    }

    /// Set the log label.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the number of retries.
    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Enable jitter with the given spread.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    fn base_delay_nanos(&self, attempt: u32) -> f64 {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let grown = self.initial_delay.as_nanos() as f64 * self.factor.powi(exponent);
        grown.max(0.0).min(self.max_delay.as_nanos() as f64)
    }

    /// Delay before retry number `attempt` (zero-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let capped = self.base_delay_nanos(attempt);
        let max = self.max_delay.as_nanos() as f64;

        let nanos = if self.jitter > 0.0 {
            let spread = self.jitter.min(1.0);
            let scale = rand::thread_rng().gen_range((1.0 - spread)..=(1.0 + spread));
            (capped * scale).min(max)
        } else {
            capped
        };

        Duration::from_nanos(nanos.round() as u64)
    }

    /// Worst-case total time spent sleeping, ignoring jitter.
    pub fn max_total_delay(&self) -> Duration {
        (0..self.retries)
            .map(|attempt| Duration::from_nanos(self.base_delay_nanos(attempt).round() as u64))
            .sum()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Executor
// ═══════════════════════════════════════════════════════════════════════════════

/// Run `operation`, retrying failures whose `is_retryable()` is true.
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + fmt::Display,
{
    retry_if(policy, E::is_retryable, operation).await
}

/// Run `operation`, retrying failures accepted by `should_retry`.
///
/// The last observed error is returned unchanged once retries are exhausted
/// or the predicate rejects it.
pub async fn retry_if<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    should_retry: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: fmt::Display,
{
    let mut attempt: u32 = 0;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(
                        service = "retry",
                        operation = %policy.name,
                        attempts = attempt + 1,
                        "Operation succeeded after retrying"
                    );
                }
                counter!("cadence_retry_attempts_total", "name" => policy.name.clone(), "outcome" => "success")
                    .increment(1);
                return Ok(value);
            }
            Err(err) => {
                if attempt >= policy.retries || !should_retry(&err) {
                    error!(
                        service = "retry",
                        operation = %policy.name,
                        attempts = attempt + 1,
                        error = %err,
                        "Operation failed, not retrying"
                    );
                    counter!("cadence_retry_attempts_total", "name" => policy.name.clone(), "outcome" => "failure")
                        .increment(1);
                    return Err(err);
                }

                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    service = "retry",
                    operation = %policy.name,
                    attempt = attempt + 1,
                    max_attempts = policy.retries + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Operation failed, retrying"
                );
                counter!("cadence_retry_attempts_total", "name" => policy.name.clone(), "outcome" => "retry")
                    .increment(1);

                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Wrap a repeatable operation into a one-shot unit of work that retries it.
///
/// The result fits [`JobQueue::add_job`](crate::jobs::JobQueue::add_job).
pub fn with_retry<T, E, F, Fut>(
    policy: RetryPolicy,
    operation: F,
) -> impl FnOnce() -> BoxFuture<'static, Result<T, E>> + Send + 'static
where
    T: Send + 'static,
    E: Retryable + fmt::Display + Send + 'static,
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
{
    move || Box::pin(async move { retry(&policy, operation).await })
}
