//! Metric descriptions for the queue, limiter and retry executor.
//!
//! The library only records through the `metrics` facade. Whatever recorder
//! the host installs picks these descriptions up once [`describe_metrics`]
//! has run.

use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};

/// Register descriptions for every metric this crate records.
pub fn describe_metrics() {
    // Job metrics
    describe_counter!(
        "cadence_jobs_enqueued_total",
        "Jobs admitted to the queue, by priority"
    );
    describe_counter!(
        "cadence_jobs_completed_total",
        "Jobs that finished, by outcome"
    );
    describe_counter!(
        "cadence_job_results_expired_total",
        "Job results dropped unclaimed after the retention window"
    );
    describe_gauge!("cadence_jobs_running", "Jobs executing right now");
    describe_histogram!(
        "cadence_job_duration_seconds",
        Unit::Seconds,
        "Job execution time"
    );

    // Admission
    describe_counter!(
        "cadence_rate_limit_rejected_total",
        "Job submissions rejected by the rate limiter, by scope"
    );

    // Retry
    describe_counter!(
        "cadence_retry_attempts_total",
        "Retry executor attempts, by operation and outcome"
    );

    // Errors
    describe_counter!(
        "cadence_errors_total",
        "Errors constructed, by code and category"
    );
}
