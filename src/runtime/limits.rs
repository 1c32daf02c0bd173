// src/runtime/limits.rs
//! Admission limits for the worker pool
//!
//! Provides the bounds a pool is configured with:
//! - Worker slots (1-16 execution units)
//! - Queue capacity (1-8192 pending instructions)
//! - Per-job deadline (forced unit replacement on expiry)

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

/// Upper bound on execution units per pool
pub const MAX_WORKERS: usize = 16;

/// Upper bound on pending instructions per pool
pub const MAX_QUEUE_SIZE: usize = 8192;

/// Limits applied to a pool at configuration time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolLimits {
    /// Number of execution units requested
    pub max_workers: usize,

    /// Maximum number of pending instructions
    pub max_queue_size: usize,

    /// Per-job deadline in milliseconds (None = wait forever)
    pub job_deadline_ms: Option<u64>,
}

impl Default for PoolLimits {
    fn default() -> Self {
        Self {
            max_workers: 4,
            max_queue_size: 128,
            job_deadline_ms: Some(300_000), // 5 minutes
        }
    }
}

impl PoolLimits {
    /// Limits with the given sizes and the default deadline
    pub fn new(max_workers: usize, max_queue_size: usize) -> Self {
        Self {
            max_workers,
            max_queue_size,
            ..Default::default()
        }
    }

    /// Limits without any job deadline
    pub fn without_deadline(mut self) -> Self {
        self.job_deadline_ms = None;
        self
    }

    /// Set the per-job deadline
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.job_deadline_ms = Some(deadline.as_millis() as u64);
        self
    }

    /// Validate limits
    pub fn validate(&self) -> Result<(), String> {
        if self.max_workers == 0 {
            return Err("max_workers cannot be 0".to_string());
        }
        if self.max_queue_size == 0 {
            return Err("max_queue_size cannot be 0".to_string());
        }
        if self.job_deadline_ms == Some(0) {
            return Err("job_deadline_ms cannot be 0".to_string());
        }
        Ok(())
    }

    /// Clamp sizes to the supported maxima, warning on every adjustment
    pub fn clamped(&self) -> Self {
        let mut limits = self.clone();

        if limits.max_workers > MAX_WORKERS {
            warn!(
                requested = limits.max_workers,
                max = MAX_WORKERS,
                "max_workers above supported maximum, clamping"
            );
            limits.max_workers = MAX_WORKERS;
        }

        if limits.max_queue_size > MAX_QUEUE_SIZE {
            warn!(
                requested = limits.max_queue_size,
                max = MAX_QUEUE_SIZE,
                "max_queue_size above supported maximum, clamping"
            );
            limits.max_queue_size = MAX_QUEUE_SIZE;
        }

        limits
    }

    /// Number of slots a pool with these limits creates
    pub fn slot_count(&self) -> usize {
        self.max_workers.min(self.max_queue_size)
    }

    /// Per-job deadline as a duration
    pub fn job_deadline(&self) -> Option<Duration> {
        self.job_deadline_ms.map(Duration::from_millis)
    }
}
