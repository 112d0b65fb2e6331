//! Runtime configuration for the threading core.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the threading service and its components.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadingConfig {
    /// Hard cap on live dedicated workers, exclusive and shared combined.
    /// Creation beyond the cap fails; it never silently degrades.
    pub max_threads: usize,

    /// Maximum time to wait for a worker thread to terminate on release.
    /// A worker that outlives this is logged as a probable deadlock.
    pub join_timeout: Duration,

    /// Per-tick wall-clock allowance for the budgeted queue.
    pub frame_budget: Duration,
}

impl Default for ThreadingConfig {
    fn default() -> Self {
        Self {
            max_threads: num_cpus::get().max(2),
            join_timeout: Duration::from_secs(5),
            frame_budget: Duration::from_millis(1),
        }
    }
}
