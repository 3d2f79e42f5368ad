//! Configuration management for Strata.
//!
//! Provides runtime configuration for pipeline execution and daemon
//! supervision. Defaults match the fixed constants of the platform's
//! observed behavior; hosts may override them at construction time.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Global Strata configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StrataConfig {
    /// Pipeline execution configuration.
    pub pipeline: PipelineConfig,
    /// Daemon supervision configuration.
    pub daemon: DaemonConfig,
}

/// Pipeline execution configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Default fan-out width for parallel execution.
    pub parallel_default_size: usize,
    /// Edit batch flush threshold for merge application.
    pub merge_batch_size: usize,
    /// Channel capacity between non-fan-out pipeline stages.
    pub stage_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            parallel_default_size: 8,
            merge_batch_size: 1000,
            stage_capacity: 8,
        }
    }
}

/// Daemon supervision configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Back-off interval between daemon run-loop iterations, in seconds.
    ///
    /// The interval is fixed, not exponential.
    pub backoff_secs: u64,
    /// Bounded capacity of each daemon's run log; oldest entries evicted.
    pub runlog_capacity: usize,
}

impl DaemonConfig {
    /// Back-off interval as a `Duration`.
    pub fn backoff(&self) -> Duration {
        Duration::from_secs(self.backoff_secs)
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            backoff_secs: 1,
            runlog_capacity: 2000,
        }
    }
}
