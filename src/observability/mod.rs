// src/observability/mod.rs
//! Logging and metrics
//!
//! # Environment Variables
//!
//! - `OFFLOAD_LOG` - Log filter (overrides RUST_LOG)
//! - `RUST_LOG` - Standard Rust log filter (fallback)
//!
//! Without either, the configured `logging.level` applies. Metrics go
//! through the `metrics` facade; installing a recorder is up to the host.

use crate::utils::config::{LogFormat, LoggingConfig};
use metrics::{describe_counter, describe_gauge};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const METRIC_INSTRUCTIONS_DISPATCHED: &str = "offload_instructions_dispatched_total";
pub const METRIC_INSTRUCTIONS_DROPPED: &str = "offload_instructions_dropped_total";
pub const METRIC_JOBS_COMPLETED: &str = "offload_jobs_completed_total";
pub const METRIC_JOBS_FAILED: &str = "offload_jobs_failed_total";
pub const METRIC_JOBS_TIMED_OUT: &str = "offload_jobs_timed_out_total";
pub const METRIC_UNIT_BUILD_FAILURES: &str = "offload_unit_build_failures_total";
pub const METRIC_SLOTS_REGISTERED: &str = "offload_slots_registered";

/// Build the filter: `OFFLOAD_LOG`, then `RUST_LOG`, then the configured level
pub fn build_filter(config: &LoggingConfig) -> EnvFilter {
    for var in ["OFFLOAD_LOG", "RUST_LOG"] {
        if let Ok(filter) = std::env::var(var) {
            match EnvFilter::try_new(&filter) {
                Ok(filter) => return filter,
                Err(e) => eprintln!("Warning: invalid {} filter '{}': {}", var, filter, e),
            }
        }
    }

    EnvFilter::try_new(&config.level).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber.
///
/// Returns false when a subscriber was already installed; later calls are
/// otherwise ignored.
pub fn init_tracing(config: &LoggingConfig) -> bool {
    let filter = build_filter(config);

    let result = match config.format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_thread_names(true).with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_thread_names(true).with_writer(std::io::stderr))
            .try_init(),
    };

    result.is_ok()
}

/// Register descriptions for every engine metric
pub fn describe_metrics() {
    describe_counter!(METRIC_INSTRUCTIONS_DISPATCHED, "Instructions handed to a slot");
    describe_counter!(METRIC_INSTRUCTIONS_DROPPED, "Instructions refused by a full queue");
    describe_counter!(METRIC_JOBS_COMPLETED, "Jobs finished, any outcome");
    describe_counter!(METRIC_JOBS_FAILED, "Jobs finished with an error");
    describe_counter!(METRIC_JOBS_TIMED_OUT, "Jobs that exceeded their deadline");
    describe_counter!(METRIC_UNIT_BUILD_FAILURES, "Execution units that failed construction");
    describe_gauge!(METRIC_SLOTS_REGISTERED, "Pool slots still registered");
}
