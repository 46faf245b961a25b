//! Telemetry: structured logging and metric descriptions.
//!
//! - **Logging**: `tracing-subscriber` with JSON, pretty or compact output
//! - **Metrics**: descriptions for the `metrics` facade; no exporter is bundled
//!
//! # Example
//!
//! ```rust,no_run
//! use cadence_core::telemetry::{init_logging, LoggingConfig};
//!
//! init_logging(&LoggingConfig::default()).expect("Failed to initialize logging");
//! ```

pub mod logging;
pub mod metrics;

pub use self::logging::{init_logging, LogFormat, LoggingConfig};
pub use self::metrics::describe_metrics;
