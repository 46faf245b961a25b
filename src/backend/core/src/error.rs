//! Error taxonomy for Cadence.
//!
//! This module provides:
//! - A small, stable set of error codes shared by the queue, the rate limiter
//!   and the retry executor
//! - HTTP-like status codes for translation at a transport boundary
//! - A retryable flag consumed by the retry executor's default predicate
//! - Structured details (entity, retry-after, free-form context)
//! - Error logging with tracing integration and metrics on construction
//!
//! # Usage
//!
//! ```rust,ignore
//! use cadence_core::error::{CadenceError, ErrorContext, Result};
//!
//! fn load() -> Result<String> {
//!     std::fs::read_to_string("jobs.toml").context("Failed to read job file")
//! }
//! ```

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for Cadence operations.
pub type Result<T> = std::result::Result<T, CadenceError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
///
/// These codes are stable and can be matched on by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ValidationError,
    NotFound,
    Unauthorized,
    Forbidden,
    RateLimit,
    ServiceUnavailable,
    Timeout,
    ExternalServiceError,
    InternalError,
}

impl ErrorCode {
    /// The stable string form of this code.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ValidationError => "VALIDATION_ERROR",
            Self::NotFound => "NOT_FOUND",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Forbidden => "FORBIDDEN",
            Self::RateLimit => "RATE_LIMIT",
            Self::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            Self::Timeout => "TIMEOUT",
            Self::ExternalServiceError => "EXTERNAL_SERVICE_ERROR",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Get the HTTP-like status code for this error.
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::ValidationError => 400,
            Self::Unauthorized => 401,
            Self::Forbidden => 403,
            Self::NotFound => 404,
            Self::RateLimit => 429,
            Self::InternalError => 500,
            Self::ExternalServiceError => 502,
            Self::ServiceUnavailable => 503,
            Self::Timeout => 504,
        }
    }

    /// Check if failures with this code are worth retrying by default.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimit
                | Self::ServiceUnavailable
                | Self::Timeout
                | Self::ExternalServiceError
        )
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self {
            Self::ValidationError => "validation",
            Self::NotFound => "lookup",
            Self::Unauthorized | Self::Forbidden => "authentication",
            Self::RateLimit => "throttling",
            Self::ServiceUnavailable | Self::Timeout | Self::ExternalServiceError => {
                "external_service"
            }
            Self::InternalError => "internal",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Caller errors (bad input, unknown ids)
    Low,
    /// Operational issues (rate limits, timeouts)
    Medium,
    /// Failures of collaborators
    High,
    /// Bugs and broken invariants
    Critical,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::ValidationError | ErrorCode::NotFound => Self::Low,

            ErrorCode::RateLimit
            | ErrorCode::Timeout
            | ErrorCode::Unauthorized
            | ErrorCode::Forbidden => Self::Medium,

            ErrorCode::ServiceUnavailable | ErrorCode::ExternalServiceError => Self::High,

            ErrorCode::InternalError => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Details
// ═══════════════════════════════════════════════════════════════════════════════

/// Additional structured details about an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Additional context key-value pairs
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,

    /// Related entity ID (job, user, organization)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,

    /// Related entity type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,

    /// Seconds until the caller may try again
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

impl ErrorDetails {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(mut self, entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after_secs = Some(seconds);
        self
    }

    fn is_empty(&self) -> bool {
        self.context.is_empty()
            && self.entity_id.is_none()
            && self.retry_after_secs.is_none()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The error type raised by every Cadence component.
///
/// A kind is fixed by its [`ErrorCode`], which determines the status code
/// and the default retryable flag. Only internal errors may override the
/// flag, through [`CadenceError::retryable`].
#[derive(Error, Debug)]
pub struct CadenceError {
    /// Machine-readable error code
    code: ErrorCode,

    /// Human-readable message
    message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// Whether the retry executor should try again by default
    retryable: bool,

    /// Additional structured details
    details: ErrorDetails,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for CadenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl CadenceError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and message.
    pub fn new(code: ErrorCode, message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            message: message.into(),
            internal_message: None,
            retryable: code.is_retryable(),
            details: ErrorDetails::default(),
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Create an error with both a caller-facing and an internal message.
    pub fn with_internal(
        code: ErrorCode,
        message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, message);
        error.internal_message = Some(internal_message.into());
        error
    }

    /// Create an internal error wrapping an unknown failure.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::InternalError, "An internal error occurred", message)
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    /// Create a not found error.
    pub fn not_found(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        let entity_type = entity_type.into();
        let entity_id = entity_id.into();
        Self::new(
            ErrorCode::NotFound,
            format!("{} not found: {}", entity_type, entity_id),
        )
        .with_details(ErrorDetails::new().with_entity(&entity_type, &entity_id))
    }

    /// Create an unauthorized error.
    pub fn unauthorized(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::Unauthorized, message)
    }

    /// Create a forbidden error.
    pub fn forbidden(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::Forbidden, message)
    }

    /// Create a rate limit error.
    pub fn rate_limit(message: impl Into<Cow<'static, str>>, retry_after_secs: u64) -> Self {
        Self::new(ErrorCode::RateLimit, message)
            .with_details(ErrorDetails::new().with_retry_after(retry_after_secs))
    }

    /// Create a service unavailable error.
    pub fn service_unavailable(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::ServiceUnavailable, message)
    }

    /// Create a timeout error.
    pub fn timeout(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::Timeout, message)
    }

    /// Create an error for a failing external collaborator.
    pub fn external_service(service: impl Into<String>, message: impl Into<String>) -> Self {
        let service = service.into();
        Self::new(
            ErrorCode::ExternalServiceError,
            format!("{} error: {}", service, message.into()),
        )
        .with_context("service", &service)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Replace the error details, keeping any context already recorded.
    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        let mut context = std::mem::take(&mut self.details.context);
        context.extend(details.context.clone());
        self.details = ErrorDetails { context, ..details };
        self
    }

    /// Add context to details.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.details.context.insert(key.into(), v);
        }
        self
    }

    /// Override the retryable flag of an internal error.
    ///
    /// Kinds other than `INTERNAL_ERROR` keep the flag fixed by their code.
    pub fn retryable(mut self, retryable: bool) -> Self {
        if self.code == ErrorCode::InternalError {
            self.retryable = retryable;
        }
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    /// Get the error code.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Get the human-readable message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Get the internal message (if any).
    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    /// Get the error details.
    pub fn details(&self) -> &ErrorDetails {
        &self.details
    }

    /// Get the HTTP-like status code.
    pub fn status_code(&self) -> u16 {
        self.code.status_code()
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    /// The failing service of an `EXTERNAL_SERVICE_ERROR`.
    pub fn service(&self) -> Option<&str> {
        self.details.context.get("service").and_then(|v| v.as_str())
    }

    /// Seconds until a rate-limited caller may try again.
    pub fn retry_after_secs(&self) -> Option<u64> {
        self.details.retry_after_secs
    }

    /// Get the error severity.
    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error at the level its severity calls for, tagged with the
    /// reporting service.
    pub fn log(&self, service: &str) {
        let category = self.code.category();
        let status = self.status_code();

        match self.severity() {
            ErrorSeverity::Critical => {
                error!(
                    service = service,
                    error_code = %self.code,
                    category = category,
                    status = status,
                    message = %self.message,
                    internal_message = ?self.internal_message,
                    details = ?self.details,
                    source = ?self.source,
                    "Critical error"
                );
            }
            ErrorSeverity::High => {
                error!(
                    service = service,
                    error_code = %self.code,
                    category = category,
                    status = status,
                    message = %self.message,
                    internal_message = ?self.internal_message,
                    "High severity error"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    service = service,
                    error_code = %self.code,
                    category = category,
                    status = status,
                    message = %self.message,
                    "Medium severity error"
                );
            }
            ErrorSeverity::Low => {
                tracing::debug!(
                    service = service,
                    error_code = %self.code,
                    category = category,
                    status = status,
                    message = %self.message,
                    "Low severity error"
                );
            }
        }
    }

    fn record_metrics(&self) {
        counter!(
            "cadence_errors_total",
            "code" => self.code.as_str(),
            "category" => self.code.category(),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Boundary Response
// ═══════════════════════════════════════════════════════════════════════════════

/// Transport-neutral error body for whoever translates errors at a boundary.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Machine-readable error code
    pub code: ErrorCode,

    /// HTTP-like status
    pub status: u16,

    /// Human-readable message
    pub message: String,

    /// Whether the caller may retry
    pub retryable: bool,

    /// Additional details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<ErrorDetails>,
}

impl From<&CadenceError> for ErrorResponse {
    fn from(error: &CadenceError) -> Self {
        Self {
            code: error.code,
            status: error.status_code(),
            message: error.message.to_string(),
            retryable: error.retryable,
            details: if error.details.is_empty() {
                None
            } else {
                Some(error.details.clone())
            },
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Context Extension Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Extension trait for adding context to errors.
pub trait ErrorContext<T> {
    /// Wrap the failure as an internal error with a message.
    fn context(self, message: impl Into<String>) -> Result<T>;

    /// Wrap the failure with a specific error code.
    fn with_error_code(self, code: ErrorCode) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| CadenceError::internal(message.into()).with_source(e))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.map_err(|e| CadenceError::new(code, e.to_string()).with_source(e))
    }
}

impl<T> ErrorContext<T> for Option<T> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| CadenceError::new(ErrorCode::NotFound, message.into()))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.ok_or_else(|| CadenceError::new(code, "Resource not found"))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// From Implementations for Common Error Types
// ═══════════════════════════════════════════════════════════════════════════════

impl From<tokio::time::error::Elapsed> for CadenceError {
    fn from(error: tokio::time::error::Elapsed) -> Self {
        Self::with_internal(ErrorCode::Timeout, "Operation timed out", error.to_string())
            .with_source(error)
    }
}

impl From<std::io::Error> for CadenceError {
    fn from(error: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let (code, message) = match error.kind() {
            ErrorKind::NotFound => (ErrorCode::NotFound, "File or resource not found"),
            ErrorKind::PermissionDenied => (ErrorCode::Forbidden, "Permission denied"),
            ErrorKind::TimedOut => (ErrorCode::Timeout, "Operation timed out"),
            ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset => {
                (ErrorCode::ServiceUnavailable, "Connection failed")
            }
            _ => (ErrorCode::InternalError, "An I/O error occurred"),
        };

        Self::with_internal(code, message, error.to_string()).with_source(error)
    }
}

impl From<serde_json::Error> for CadenceError {
    fn from(error: serde_json::Error) -> Self {
        let code = if error.is_syntax() || error.is_data() || error.is_eof() {
            ErrorCode::ValidationError
        } else {
            ErrorCode::InternalError
        };

        Self::with_internal(code, "Failed to process JSON data", error.to_string())
            .with_source(error)
    }
}

impl From<config::ConfigError> for CadenceError {
    fn from(error: config::ConfigError) -> Self {
        let message = match &error {
            config::ConfigError::NotFound(_) => "Required configuration not found",
            config::ConfigError::PathParse(_) | config::ConfigError::FileParse { .. } => {
                "Configuration file is invalid"
            }
            _ => "Configuration error occurred",
        };

        Self::with_internal(ErrorCode::ValidationError, message, error.to_string())
    }
}

impl From<anyhow::Error> for CadenceError {
    fn from(error: anyhow::Error) -> Self {
        match error.downcast::<CadenceError>() {
            Ok(cadence_error) => cadence_error,
            Err(error) => Self::internal(format!("{:#}", error)),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
