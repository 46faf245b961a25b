//! Configuration management.
//!
//! Every section has defaults, so an empty environment yields a working
//! configuration. Environment variables use the `CADENCE` prefix and `__` as
//! the nesting separator, e.g. `CADENCE__QUEUE__MAX_CONCURRENT_JOBS=4` or
//! `CADENCE__RATE_LIMIT__USER__WINDOW=30s`.

use config::builder::DefaultState;
use config::ConfigBuilder;
use serde::Deserialize;

use crate::error::Result;
use crate::jobs::{QueueConfig, WorkerConfig};
use crate::rate_limit::RateLimitConfig;
use crate::retry::RetryPolicy;
use crate::telemetry::LoggingConfig;

const ENV_PREFIX: &str = "CADENCE";
const ENV_SEPARATOR: &str = "__";

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct Config {
    /// Job queue configuration
    #[serde(default)]
    pub queue: QueueConfig,

    /// Dispatch loop configuration
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Admission rate limits
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Default retry policy for wrapped work
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from the environment.
    pub fn load() -> Result<Self> {
        let config = with_defaults(config::Config::builder())?
            .add_source(environment())
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from a specific file path, with the environment layered on top.
    pub fn from_file(path: &str) -> Result<Self> {
        let config = with_defaults(config::Config::builder())?
            .add_source(config::File::with_name(path))
            .add_source(environment())
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject settings the queue or the limiter cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.queue.validate()?;
        self.rate_limit.validate()
    }
}

/// Register per-field defaults for the rate limit windows.
///
/// The two scopes share one struct with different defaults, so a section
/// that sets only `quota` or only `window` is completed here rather than by
/// serde.
fn with_defaults(builder: ConfigBuilder<DefaultState>) -> Result<ConfigBuilder<DefaultState>> {
    let defaults = RateLimitConfig::default();
    let mut builder = builder;
    for (scope, limit) in [("user", defaults.user), ("organization", defaults.organization)] {
        builder = builder
            .set_default(
                format!("rate_limit.{}.quota", scope),
                i64::try_from(limit.quota).unwrap_or(i64::MAX),
            )?
            .set_default(
                format!("rate_limit.{}.window", scope),
                format!("{}ms", limit.window.as_millis()),
            )?;
    }
    Ok(builder)
}

fn environment() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator(ENV_SEPARATOR)
        .separator(ENV_SEPARATOR)
        .try_parsing(true)
}
