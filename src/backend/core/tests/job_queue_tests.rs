//! Integration tests for the job queue and its dispatch loop.
//!
//! Tests cover:
//! - Priority dispatch order
//! - Concurrency ceiling
//! - Admission through the rate limiter
//! - Claim-once results and unknown ids
//! - Failure and panic isolation
//! - Result retention and timer cleanup
//! - Timeouts, shutdown and restart
//! - Retry-wrapped work

use cadence_core::error::{CadenceError, ErrorCode};
use cadence_core::jobs::{
    JobId, JobOptions, JobPriority, JobQueue, JobState, JobWorker, QueueConfig, QueueStatus,
    WorkerConfig, WorkerHandle,
};
use cadence_core::rate_limit::{LimitScope, RateLimitConfig};
use cadence_core::retry::{with_retry, RetryPolicy};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

// ============================================================================
// Helpers
// ============================================================================

fn unlimited() -> RateLimitConfig {
    RateLimitConfig::builder().enabled(false).build()
}

fn queue_with_ceiling<T: Send + 'static>(max_concurrent_jobs: usize) -> JobQueue<T> {
    JobQueue::new(
        QueueConfig {
            max_concurrent_jobs,
            ..Default::default()
        },
        unlimited(),
    )
}

fn start<T: Send + 'static>(queue: &JobQueue<T>) -> WorkerHandle {
    JobWorker::new(WorkerConfig::default())
        .start(queue.clone())
        .expect("dispatch loop should start")
}

async fn wait_for_state<T: Send + 'static>(queue: &JobQueue<T>, id: &JobId, state: JobState) {
    for _ in 0..1000 {
        if queue.job_state(id) == Some(state) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("job {} never reached {:?}", id, state);
}

// ============================================================================
// Ordering
// ============================================================================

#[tokio::test]
async fn test_dispatch_follows_priority_rules() {
    let queue = queue_with_ceiling::<&'static str>(1);
    let order = Arc::new(Mutex::new(Vec::new()));

    let submissions = [
        ("normal-1", JobPriority::Normal),
        ("low-1", JobPriority::Low),
        ("high-1", JobPriority::High),
        ("normal-2", JobPriority::Normal),
        ("high-2", JobPriority::High),
        ("low-2", JobPriority::Low),
    ];

    let mut ids = Vec::new();
    for (label, priority) in submissions {
        let order = Arc::clone(&order);
        let id = queue
            .add_job(
                move || async move {
                    order.lock().push(label);
                    Ok(label)
                },
                JobOptions::new("user-1").priority(priority),
            )
            .unwrap();
        ids.push(id);
    }
    assert_eq!(queue.get_status().queued_jobs, 6);

    let worker = start(&queue);
    for id in &ids {
        assert_ok!(queue.get_result(id).await);
    }
    worker.stop().await;

    assert_eq!(
        *order.lock(),
        vec!["high-2", "high-1", "normal-1", "normal-2", "low-1", "low-2"]
    );
}

#[tokio::test]
async fn test_results_carry_job_values() {
    let queue = queue_with_ceiling::<u32>(4);
    let worker = start(&queue);

    let ids: Vec<JobId> = (0..8u32)
        .map(|n| {
            queue
                .add_job(move || async move { Ok(n * 10) }, JobOptions::new("user-1"))
                .unwrap()
        })
        .collect();

    for (n, id) in ids.iter().enumerate() {
        assert_eq!(queue.get_result(id).await.unwrap(), n as u32 * 10);
    }
    assert_eq!(queue.get_status(), QueueStatus::default());
    worker.stop().await;
}

// ============================================================================
// Concurrency Ceiling
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_running_never_exceeds_ceiling() {
    let queue = queue_with_ceiling::<()>(3);
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let ids: Vec<JobId> = (0..10)
        .map(|_| {
            let current = Arc::clone(&current);
            let peak = Arc::clone(&peak);
            queue
                .add_job(
                    move || async move {
                        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        current.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    },
                    JobOptions::new("user-1"),
                )
                .unwrap()
        })
        .collect();

    let worker = start(&queue);

    tokio::time::sleep(Duration::from_millis(10)).await;
    let status = queue.get_status();
    assert_eq!(status.running_jobs, 3);
    assert_eq!(status.queued_jobs, 7);

    for id in &ids {
        assert_ok!(queue.get_result(id).await);
    }

    assert_eq!(peak.load(Ordering::SeqCst), 3);
    assert_eq!(worker.stats().dispatched(), 10);
    assert_eq!(worker.stats().peak_concurrent(), 3);
    worker.stop().await;
}

// ============================================================================
// Admission
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_rate_limit_applies_at_admission() {
    let config = RateLimitConfig::builder()
        .user_limit(5, Duration::from_secs(60))
        .build();
    let queue: JobQueue<u32> = JobQueue::new(QueueConfig::default(), config);

    for _ in 0..5 {
        assert_ok!(queue.add_job(|| async { Ok(1) }, JobOptions::new("user-1")));
    }

    let error = queue
        .add_job(|| async { Ok(1) }, JobOptions::new("user-1"))
        .unwrap_err();
    assert_eq!(error.code(), ErrorCode::RateLimit);
    assert_eq!(error.retry_after_secs(), Some(60));
    assert!(error.message().contains("Try again in 60 seconds"));
    assert_eq!(queue.get_status().queued_jobs, 5);

    // Other users are unaffected.
    assert_ok!(queue.add_job(|| async { Ok(1) }, JobOptions::new("user-2")));

    tokio::time::advance(Duration::from_secs(60)).await;

    assert_ok!(queue.add_job(|| async { Ok(1) }, JobOptions::new("user-1")));
    let usage = queue.limiter().usage(LimitScope::User, "user-1").unwrap();
    assert_eq!(usage.count, 1);
    assert_eq!(usage.remaining, 4);
}

#[tokio::test]
async fn test_organization_quota_shared_across_users() {
    let config = RateLimitConfig::builder()
        .user_limit(10, Duration::from_secs(60))
        .organization_limit(3, Duration::from_secs(60))
        .build();
    let queue: JobQueue<u32> = JobQueue::new(QueueConfig::default(), config);

    for user in ["alice", "bob", "carol"] {
        assert_ok!(queue.add_job(
            || async { Ok(1) },
            JobOptions::new(user).organization("acme")
        ));
    }

    let error = queue
        .add_job(|| async { Ok(1) }, JobOptions::new("dave").organization("acme"))
        .unwrap_err();
    assert_eq!(error.code(), ErrorCode::RateLimit);
    assert!(error.message().contains("organization"));

    // The rejected submission still consumed dave's user window.
    let usage = queue.limiter().usage(LimitScope::User, "dave").unwrap();
    assert_eq!(usage.count, 1);
    assert_eq!(queue.get_status().queued_jobs, 3);
}

#[tokio::test]
async fn test_empty_user_rejected_before_rate_limit() {
    let queue: JobQueue<u32> = JobQueue::new(QueueConfig::default(), RateLimitConfig::default());
    let error = queue
        .add_job(|| async { Ok(1) }, JobOptions::new(""))
        .unwrap_err();
    assert_eq!(error.code(), ErrorCode::ValidationError);
    assert_eq!(queue.limiter().tracked_keys(), 0);
}

// ============================================================================
// Results
// ============================================================================

#[tokio::test]
async fn test_result_can_be_claimed_once() {
    let queue = queue_with_ceiling::<u32>(2);
    let worker = start(&queue);

    let id = queue
        .add_job(|| async { Ok(42) }, JobOptions::new("user-1"))
        .unwrap();

    assert_eq!(queue.get_result(&id).await.unwrap(), 42);
    let error = queue.get_result(&id).await.unwrap_err();
    assert_eq!(error.code(), ErrorCode::NotFound);
    assert_eq!(queue.job_state(&id), None);
    worker.stop().await;
}

#[tokio::test]
async fn test_unknown_id_not_found_immediately() {
    let queue = queue_with_ceiling::<u32>(2);
    let result = tokio::time::timeout(
        Duration::from_secs(1),
        queue.get_result(&JobId::from("0-missing")),
    )
    .await
    .expect("unknown ids must not wait");

    let error = assert_err!(result);
    assert_eq!(error.code(), ErrorCode::NotFound);
    assert_eq!(error.details().entity_id.as_deref(), Some("0-missing"));
}

#[tokio::test]
async fn test_waiting_before_dispatch_gets_result() {
    let queue = queue_with_ceiling::<u32>(1);
    let id = queue
        .add_job(|| async { Ok(5) }, JobOptions::new("user-1"))
        .unwrap();
    assert_eq!(queue.job_state(&id), Some(JobState::Pending));

    let waiter = {
        let queue = queue.clone();
        let id = id.clone();
        tokio::spawn(async move { queue.get_result(&id).await })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    let worker = start(&queue);

    assert_eq!(waiter.await.unwrap().unwrap(), 5);
    worker.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_unclaimed_result_expires_after_retention() {
    let queue: JobQueue<u32> = JobQueue::new(
        QueueConfig {
            result_retention: Duration::from_secs(10),
            ..Default::default()
        },
        unlimited(),
    );
    let worker = start(&queue);

    let kept = queue
        .add_job(|| async { Ok(1) }, JobOptions::new("user-1"))
        .unwrap();
    let dropped = queue
        .add_job(|| async { Ok(2) }, JobOptions::new("user-1"))
        .unwrap();
    wait_for_state(&queue, &kept, JobState::Completed).await;
    wait_for_state(&queue, &dropped, JobState::Completed).await;

    tokio::time::sleep(Duration::from_secs(9)).await;
    assert_eq!(queue.get_result(&kept).await.unwrap(), 1);

    tokio::time::sleep(Duration::from_secs(2)).await;
    let error = queue.get_result(&dropped).await.unwrap_err();
    assert_eq!(error.code(), ErrorCode::NotFound);

    let stats = queue.stats();
    assert_eq!(stats.expired_total, 1);
    assert_eq!(stats.completed, 0);
    worker.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_claimed_results_cancel_retention_timers() {
    let queue = queue_with_ceiling::<usize>(4);
    let worker = start(&queue);

    let ids: Vec<JobId> = (0..100)
        .map(|n| {
            queue
                .add_job(move || async move { Ok(n) }, JobOptions::new("user-1"))
                .unwrap()
        })
        .collect();
    for (n, id) in ids.iter().enumerate() {
        assert_eq!(queue.get_result(id).await.unwrap(), n);
    }
    worker.stop().await;

    // Let the runtime reap the aborted timers.
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    let metrics = tokio::runtime::Handle::current().metrics();
    assert_eq!(metrics.num_alive_tasks(), 0);
    assert_eq!(queue.stats().expired_total, 0);
}

#[tokio::test(start_paused = true)]
async fn test_get_result_timeout_does_not_claim() {
    let queue = queue_with_ceiling::<u32>(1);
    let worker = start(&queue);

    let id = queue
        .add_job(
            || async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(9)
            },
            JobOptions::new("user-1"),
        )
        .unwrap();

    let error = queue
        .get_result_timeout(&id, Duration::from_secs(1))
        .await
        .unwrap_err();
    assert_eq!(error.code(), ErrorCode::Timeout);
    assert_eq!(queue.job_state(&id), Some(JobState::Running));

    assert_eq!(queue.get_result(&id).await.unwrap(), 9);
    worker.stop().await;
}

// ============================================================================
// Failure Isolation
// ============================================================================

#[tokio::test]
async fn test_failing_job_does_not_block_later_jobs() {
    let queue = queue_with_ceiling::<u32>(1);
    let worker = start(&queue);

    let failing = queue
        .add_job(
            || async { Err(CadenceError::external_service("compute", "pod quota exhausted")) },
            JobOptions::new("user-1"),
        )
        .unwrap();
    let following = queue
        .add_job(|| async { Ok(2) }, JobOptions::new("user-1"))
        .unwrap();

    let error = queue.get_result(&failing).await.unwrap_err();
    assert_eq!(error.code(), ErrorCode::ExternalServiceError);
    assert_eq!(error.message(), "compute error: pod quota exhausted");
    assert_eq!(error.service(), Some("compute"));

    assert_eq!(queue.get_result(&following).await.unwrap(), 2);

    let stats = queue.stats();
    assert_eq!(stats.failed_total, 1);
    assert_eq!(stats.succeeded_total, 1);
    worker.stop().await;
}

#[tokio::test]
async fn test_panicking_job_stored_as_internal_error() {
    let queue = queue_with_ceiling::<u32>(1);
    let worker = start(&queue);

    let panicking = queue
        .add_job(
            || async {
                let missing: Option<u32> = None;
                Ok(missing.expect("boom"))
            },
            JobOptions::new("user-1"),
        )
        .unwrap();
    let following = queue
        .add_job(|| async { Ok(3) }, JobOptions::new("user-1"))
        .unwrap();

    let error = queue.get_result(&panicking).await.unwrap_err();
    assert_eq!(error.code(), ErrorCode::InternalError);
    assert!(error.internal_message().unwrap().contains("Job panicked: boom"));

    assert_eq!(queue.get_result(&following).await.unwrap(), 3);
    assert_eq!(queue.get_status().running_jobs, 0);
    worker.stop().await;
}

// ============================================================================
// Worker Lifecycle
// ============================================================================

#[tokio::test]
async fn test_shutdown_leaves_pending_jobs_queued() {
    let queue = queue_with_ceiling::<u32>(1);
    let worker = start(&queue);
    worker.stop().await;

    let id = queue
        .add_job(|| async { Ok(4) }, JobOptions::new("user-1"))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(queue.job_state(&id), Some(JobState::Pending));

    let worker = start(&queue);
    assert_eq!(queue.get_result(&id).await.unwrap(), 4);
    worker.stop().await;
}

#[tokio::test]
async fn test_only_one_dispatch_loop_per_queue() {
    let queue = queue_with_ceiling::<u32>(1);
    let worker = start(&queue);

    let error = JobWorker::new(WorkerConfig::default())
        .start(queue.clone())
        .err()
        .expect("second loop must be rejected");
    assert_eq!(error.code(), ErrorCode::ValidationError);
    worker.stop().await;
}

// ============================================================================
// Retry-Wrapped Work
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_retry_wrapped_job_recovers() {
    let queue = queue_with_ceiling::<&'static str>(1);
    let worker = start(&queue);
    let attempts = Arc::new(AtomicU32::new(0));

    let policy = RetryPolicy::exponential(Duration::from_millis(100), 2.0, Duration::from_secs(1))
        .retries(3)
        .named("flaky_upload");
    let counter = Arc::clone(&attempts);
    let work = with_retry(policy, move || {
        let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
        async move {
            if attempt < 3 {
                Err(CadenceError::service_unavailable("storage offline"))
            } else {
                Ok("uploaded")
            }
        }
    });

    let id = queue.add_job(work, JobOptions::new("user-1")).unwrap();
    assert_eq!(queue.get_result(&id).await.unwrap(), "uploaded");
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    worker.stop().await;
}
