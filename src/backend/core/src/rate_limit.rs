//! Fixed-window admission rate limiting.
//!
//! Features:
//! - Independent windows per user and per organization
//! - Lazy window rollover on access, optional background sweep
//! - Time-to-reset reported on rejection
//!
//! The user window is checked and consumed before the organization window.
//! A rejection by the organization window leaves the user increment in
//! place.
//!
//! # Example
//!
//! ```rust,ignore
//! use cadence_core::rate_limit::{RateLimiter, RateLimitConfig};
//!
//! let limiter = RateLimiter::new(RateLimitConfig::default());
//! limiter.check_and_consume("user-1", Some("org-9"))?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::clock::{default_clock, Clock};
use crate::error::{CadenceError, ErrorDetails, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// Configuration
// ═══════════════════════════════════════════════════════════════════════════════

/// Quota for one family of windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowLimit {
    /// Admissions allowed per window
    pub quota: u64,

    /// Window length
    #[serde(with = "humantime_serde")]
    pub window: Duration,
}

impl WindowLimit {
    pub fn new(quota: u64, window: Duration) -> Self {
        Self { quota, window }
    }
}

/// Rate limiting configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting
    pub enabled: bool,

    /// Per-user limit
    pub user: WindowLimit,

    /// Per-organization limit
    pub organization: WindowLimit,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            user: WindowLimit::new(5, Duration::from_secs(60)),
            organization: WindowLimit::new(20, Duration::from_secs(60)),
        }
    }
}

impl RateLimitConfig {
    /// Create a new builder for rate limit configuration.
    pub fn builder() -> RateLimitConfigBuilder {
        RateLimitConfigBuilder::default()
    }

    /// Reject windows that could never reset.
    pub fn validate(&self) -> Result<()> {
        for (scope, limit) in [
            (LimitScope::User, self.user),
            (LimitScope::Organization, self.organization),
        ] {
            if limit.window.is_zero() {
                return Err(CadenceError::validation(format!(
                    "rate_limit.{}.window must be greater than zero",
                    scope.as_str()
                )));
            }
        }
        Ok(())
    }
}

/// Builder for rate limit configuration.
#[derive(Debug, Default)]
pub struct RateLimitConfigBuilder {
    config: RateLimitConfig,
}

impl RateLimitConfigBuilder {
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.config.enabled = enabled;
        self
    }

    pub fn user_limit(mut self, quota: u64, window: Duration) -> Self {
        self.config.user = WindowLimit::new(quota, window);
        self
    }

    pub fn organization_limit(mut self, quota: u64, window: Duration) -> Self {
        self.config.organization = WindowLimit::new(quota, window);
        self
    }

    pub fn build(self) -> RateLimitConfig {
        self.config
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Fixed Window
// ═══════════════════════════════════════════════════════════════════════════════

/// Which family of windows a key belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitScope {
    User,
    Organization,
}

impl LimitScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Organization => "organization",
        }
    }
}

/// Stand-in deadline when `now + window` does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

#[derive(Debug, Clone, Copy)]
struct RateWindow {
    count: u64,
    reset_at: Instant,
}

impl RateWindow {
    fn fresh(now: Instant, window: Duration) -> Self {
        Self {
            count: 0,
            reset_at: now
                .checked_add(window)
                .or_else(|| now.checked_add(FAR_FUTURE))
                .unwrap_or(now),
        }
    }

    fn roll_if_elapsed(&mut self, now: Instant, window: Duration) {
        if now >= self.reset_at {
            *self = Self::fresh(now, window);
        }
    }
}

/// Point-in-time view of one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSnapshot {
    /// Admissions consumed in the current window
    pub count: u64,
    /// Admissions left in the current window
    pub remaining: u64,
    /// Time until the window rolls over
    pub reset_in: Duration,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Rate Limiter
// ═══════════════════════════════════════════════════════════════════════════════

/// Fixed-window rate limiter keyed by user and organization.
pub struct RateLimiter {
    config: RateLimitConfig,
    clock: Arc<dyn Clock>,
    user_windows: DashMap<String, RateWindow>,
    organization_windows: DashMap<String, RateWindow>,
}

impl RateLimiter {
    /// Create a limiter reading tokio's clock.
    pub fn new(config: RateLimitConfig) -> Self {
        Self::with_clock(config, default_clock())
    }

    /// Create a limiter with an injected clock.
    pub fn with_clock(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        debug!(
            service = "rate-limiter",
            user_quota = config.user.quota,
            user_window_secs = config.user.window.as_secs(),
            organization_quota = config.organization.quota,
            organization_window_secs = config.organization.window.as_secs(),
            "Rate limiter created"
        );

        Self {
            config,
            clock,
            user_windows: DashMap::new(),
            organization_windows: DashMap::new(),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn scope(&self, scope: LimitScope) -> (&DashMap<String, RateWindow>, WindowLimit) {
        match scope {
            LimitScope::User => (&self.user_windows, self.config.user),
            LimitScope::Organization => (&self.organization_windows, self.config.organization),
        }
    }

    /// Admit one unit of work for `user_id` and, if present, `organization_id`.
    ///
    /// Raises `RATE_LIMIT` when a window's quota is exhausted.
    pub fn check_and_consume(&self, user_id: &str, organization_id: Option<&str>) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }

        self.consume(LimitScope::User, user_id)?;
        if let Some(organization_id) = organization_id {
            self.consume(LimitScope::Organization, organization_id)?;
        }
        Ok(())
    }

    fn consume(&self, scope: LimitScope, key: &str) -> Result<()> {
        let (windows, limit) = self.scope(scope);
        let now = self.clock.now();

        let mut entry = windows
            .entry(key.to_string())
            .or_insert_with(|| RateWindow::fresh(now, limit.window));
        entry.roll_if_elapsed(now, limit.window);

        if entry.count >= limit.quota {
            let reset_in = entry.reset_at.saturating_duration_since(now);
            drop(entry);
            return Err(self.rejection(scope, key, limit, reset_in));
        }

        entry.count += 1;
        Ok(())
    }

    fn rejection(
        &self,
        scope: LimitScope,
        key: &str,
        limit: WindowLimit,
        reset_in: Duration,
    ) -> CadenceError {
        let retry_after_secs = u64::try_from(reset_in.as_millis().div_ceil(1000)).unwrap_or(u64::MAX);

        warn!(
            service = "rate-limiter",
            scope = scope.as_str(),
            key = %key,
            limit = limit.quota,
            retry_after_secs = retry_after_secs,
            "Rate limit exceeded"
        );
        counter!("cadence_rate_limit_rejected_total", "scope" => scope.as_str()).increment(1);

        CadenceError::rate_limit(
            format!(
                "Rate limit exceeded for {}. Try again in {} seconds.",
                scope.as_str(),
                retry_after_secs
            ),
            retry_after_secs,
        )
        .with_details(
            ErrorDetails::new()
                .with_entity(scope.as_str(), key)
                .with_retry_after(retry_after_secs)
                .with_context("scope", scope)
                .with_context("limit", limit.quota),
        )
    }

    /// Current state of a window, treating an elapsed window as empty.
    pub fn usage(&self, scope: LimitScope, key: &str) -> Option<WindowSnapshot> {
        let (windows, limit) = self.scope(scope);
        let now = self.clock.now();
        let window = *windows.get(key)?;

        let (count, reset_in) = if now >= window.reset_at {
            (0, limit.window)
        } else {
            (window.count, window.reset_at - now)
        };

        Some(WindowSnapshot {
            count,
            remaining: limit.quota.saturating_sub(count),
            reset_in,
        })
    }

    /// Number of tracked windows across both scopes.
    pub fn tracked_keys(&self) -> usize {
        self.user_windows.len() + self.organization_windows.len()
    }

    /// Drop windows that have rolled over.
    pub fn cleanup_expired(&self) {
        let now = self.clock.now();
        self.user_windows.retain(|_, window| now < window.reset_at);
        self.organization_windows.retain(|_, window| now < window.reset_at);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Background Cleanup Task
// ═══════════════════════════════════════════════════════════════════════════════

/// Start background cleanup task for expired rate limit windows.
pub fn start_cleanup_task(limiter: Arc<RateLimiter>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval_timer = tokio::time::interval(interval);
        loop {
            interval_timer.tick().await;
            limiter.cleanup_expired();
            debug!(
                service = "rate-limiter",
                tracked = limiter.tracked_keys(),
                "Cleaned up expired rate limit windows"
            );
        }
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::ErrorCode;

    fn limiter(user_quota: u64, organization_quota: u64) -> (RateLimiter, ManualClock) {
        let clock = ManualClock::new();
        let config = RateLimitConfig::builder()
            .user_limit(user_quota, Duration::from_secs(60))
            .organization_limit(organization_quota, Duration::from_secs(60))
            .build();
        (RateLimiter::with_clock(config, Arc::new(clock.clone())), clock)
    }

    #[test]
    fn test_config_defaults() {
        let config = RateLimitConfig::default();
        assert!(config.enabled);
        assert_eq!(config.user, WindowLimit::new(5, Duration::from_secs(60)));
        assert_eq!(config.organization, WindowLimit::new(20, Duration::from_secs(60)));
    }

    #[test]
    fn test_rejection_does_not_increment() {
        let (limiter, _clock) = limiter(2, 20);
        limiter.check_and_consume("u1", None).unwrap();
        limiter.check_and_consume("u1", None).unwrap();
        assert!(limiter.check_and_consume("u1", None).is_err());
        assert!(limiter.check_and_consume("u1", None).is_err());

        let usage = limiter.usage(LimitScope::User, "u1").unwrap();
        assert_eq!(usage.count, 2);
        assert_eq!(usage.remaining, 0);
    }

    #[test]
    fn test_retry_after_rounds_up() {
        let (limiter, clock) = limiter(1, 20);
        limiter.check_and_consume("u1", None).unwrap();
        clock.advance(Duration::from_millis(10_500));

        let error = limiter.check_and_consume("u1", None).unwrap_err();
        assert_eq!(error.code(), ErrorCode::RateLimit);
        // 49.5s left in the window
        assert_eq!(error.retry_after_secs(), Some(50));
        assert!(error.message().contains("50 seconds"));
    }

    #[test]
    fn test_keys_are_independent() {
        let (limiter, _clock) = limiter(1, 20);
        limiter.check_and_consume("u1", None).unwrap();
        limiter.check_and_consume("u2", None).unwrap();
        assert!(limiter.check_and_consume("u1", None).is_err());
    }

    #[test]
    fn test_organization_rejection_keeps_user_increment() {
        let (limiter, _clock) = limiter(5, 1);
        limiter.check_and_consume("u1", Some("org")).unwrap();

        let error = limiter.check_and_consume("u2", Some("org")).unwrap_err();
        assert_eq!(error.code(), ErrorCode::RateLimit);
        assert_eq!(error.details().entity_type.as_deref(), Some("organization"));

        let usage = limiter.usage(LimitScope::User, "u2").unwrap();
        assert_eq!(usage.count, 1);
    }

    #[test]
    fn test_disabled_admits_everything() {
        let config = RateLimitConfig::builder()
            .enabled(false)
            .user_limit(1, Duration::from_secs(60))
            .build();
        let limiter = RateLimiter::new(config);
        for _ in 0..10 {
            limiter.check_and_consume("u1", Some("org")).unwrap();
        }
        assert_eq!(limiter.tracked_keys(), 0);
    }

    #[test]
    fn test_cleanup_drops_elapsed_windows() {
        let (limiter, clock) = limiter(5, 20);
        limiter.check_and_consume("u1", Some("org")).unwrap();
        assert_eq!(limiter.tracked_keys(), 2);

        clock.advance(Duration::from_secs(30));
        limiter.cleanup_expired();
        assert_eq!(limiter.tracked_keys(), 2);

        clock.advance(Duration::from_secs(30));
        limiter.cleanup_expired();
        assert_eq!(limiter.tracked_keys(), 0);
    }

    #[test]
    fn test_oversized_window_saturates() {
        let clock = ManualClock::new();
        let config = RateLimitConfig::builder()
            .user_limit(1, Duration::MAX)
            .build();
        let limiter = RateLimiter::with_clock(config, Arc::new(clock.clone()));

        limiter.check_and_consume("u1", None).unwrap();
        let error = limiter.check_and_consume("u1", None).unwrap_err();
        assert_eq!(error.code(), ErrorCode::RateLimit);
        assert!(error.retry_after_secs().unwrap() > 86_400 * 365);
    }

    #[test]
    fn test_validate_rejects_zero_window() {
        assert!(RateLimitConfig::default().validate().is_ok());

        let config = RateLimitConfig::builder()
            .organization_limit(10, Duration::ZERO)
            .build();
        let error = config.validate().unwrap_err();
        assert_eq!(error.code(), ErrorCode::ValidationError);
        assert!(error.message().contains("rate_limit.organization.window"));
    }

    #[test]
    fn test_usage_of_elapsed_window_reads_empty() {
        let (limiter, clock) = limiter(5, 20);
        limiter.check_and_consume("u1", None).unwrap();
        clock.advance(Duration::from_secs(61));

        let usage = limiter.usage(LimitScope::User, "u1").unwrap();
        assert_eq!(usage.count, 0);
        assert_eq!(usage.remaining, 5);
        assert!(limiter.usage(LimitScope::User, "unknown").is_none());
    }
}
