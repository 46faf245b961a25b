//! Job definitions.
//!
//! This module provides the data model moved through the queue:
//!
//! - **JobId**: time-based identifier with a random suffix
//! - **JobPriority**: the three priority classes
//! - **JobOptions**: what a caller supplies alongside the work
//! - **Job**: an admitted unit of deferred work, never mutated after creation

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{CadenceError, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// Job Identification
// ═══════════════════════════════════════════════════════════════════════════════

const ID_SUFFIX_LEN: usize = 9;

/// Unique identifier for a job instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Create a new id: submission millis plus a random suffix.
    pub fn new() -> Self {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(ID_SUFFIX_LEN)
            .map(|c| char::from(c).to_ascii_lowercase())
            .collect();
        Self(format!("{}-{}", Utc::now().timestamp_millis(), suffix))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for JobId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Priority
// ═══════════════════════════════════════════════════════════════════════════════

/// Priority class for jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    /// Jumps the whole pending queue, newest first
    High,
    /// Runs after every high job and before every low job
    #[default]
    Normal,
    /// Runs last, in submission order
    Low,
}

impl JobPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }
}

impl fmt::Display for JobPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobPriority {
    type Err = CadenceError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" => Ok(Self::High),
            "normal" => Ok(Self::Normal),
            "low" => Ok(Self::Low),
            other => Err(CadenceError::validation(format!(
                "Unknown job priority '{}', expected high, normal or low",
                other
            ))),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job State
// ═══════════════════════════════════════════════════════════════════════════════

/// Where a job currently lives inside the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting in the pending collection
    Pending,
    /// Dispatched and executing
    Running,
    /// Outcome stored and not yet claimed
    Completed,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Options
// ═══════════════════════════════════════════════════════════════════════════════

/// Options supplied with a unit of work at admission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    pub priority: JobPriority,
    pub user_id: String,
    pub organization_id: Option<String>,
    pub description: String,
}

impl JobOptions {
    /// Options for a normal-priority job owned by `user_id`.
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            priority: JobPriority::Normal,
            user_id: user_id.into(),
            organization_id: None,
            description: String::new(),
        }
    }

    pub fn priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn organization(mut self, organization_id: impl Into<String>) -> Self {
        self.organization_id = Some(organization_id.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job
// ═══════════════════════════════════════════════════════════════════════════════

/// A deferred unit of work producing `T`.
pub type Work<T> = Box<dyn FnOnce() -> BoxFuture<'static, Result<T>> + Send>;

/// An admitted unit of work.
pub struct Job<T> {
    pub id: JobId,
    pub work: Work<T>,
    pub priority: JobPriority,
    pub submitted_at: DateTime<Utc>,
    pub owner_user_id: String,
    pub owner_organization_id: Option<String>,
    pub description: String,
}

impl<T> Job<T> {
    pub fn new(work: Work<T>, options: JobOptions) -> Self {
        Self {
            id: JobId::new(),
            work,
            priority: options.priority,
            submitted_at: Utc::now(),
            owner_user_id: options.user_id,
            owner_organization_id: options.organization_id,
            description: options.description,
        }
    }
}

impl<T> fmt::Debug for Job<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("submitted_at", &self.submitted_at)
            .field("owner_user_id", &self.owner_user_id)
            .field("owner_organization_id", &self.owner_organization_id)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
