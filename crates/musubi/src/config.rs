//! Engine and watch configuration.
//!
//! Both structs deserialize with every field optional; missing fields take
//! the [`Default`] value.

use musubi_core::{EngineError, Result, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tuning knobs for the flow engine, scheduler and bulk-update paths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Tasks of one flow that may run at the same time.
    pub worker_pool_size: usize,
    /// Flows the scheduler runs at the same time.
    pub max_concurrent_flows: usize,
    /// Retry applied around the engine's own storage writes.
    pub storage_retry: RetryPolicy,
    /// Per-attempt timeout for tasks that do not set their own.
    pub default_task_timeout_secs: u64,
    /// Maximum rows per bulk detail update.
    pub detail_batch_size: usize,
    /// Maximum characters kept of any stored reason.
    pub reason_rune_limit: usize,
    /// Pause between scheduler sweeps.
    pub scheduler_interval_ms: u64,
    /// How long a task may stay running before the watchdog fails it.
    pub task_expire_secs: u64,
    /// How long a running flow may go without any change, and without an
    /// executing task, before the watchdog hands it back to the scheduler.
    pub orphan_flow_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: 10,
            max_concurrent_flows: 20,
            storage_retry: RetryPolicy::default(),
            default_task_timeout_secs: 30,
            detail_batch_size: 100,
            reason_rune_limit: 1000,
            scheduler_interval_ms: 1000,
            task_expire_secs: 3600,
            orphan_flow_ms: 5 * 60 * 1000,
        }
    }
}

impl EngineConfig {
    /// Checks sizes are non-zero and the retry window is well formed.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("worker_pool_size", self.worker_pool_size),
            ("max_concurrent_flows", self.max_concurrent_flows),
            ("detail_batch_size", self.detail_batch_size),
            ("reason_rune_limit", self.reason_rune_limit),
        ] {
            if value == 0 {
                return Err(EngineError::Configuration(format!("{name} must be positive")));
            }
        }
        for (name, value) in [
            ("default_task_timeout_secs", self.default_task_timeout_secs),
            ("scheduler_interval_ms", self.scheduler_interval_ms),
            ("orphan_flow_ms", self.orphan_flow_ms),
        ] {
            if value == 0 {
                return Err(EngineError::Configuration(format!("{name} must be positive")));
            }
        }
        self.storage_retry
            .validate()
            .map_err(|e| EngineError::Configuration(format!("storage_retry: {e}")))
    }

    /// Per-attempt timeout for tasks without their own.
    pub fn default_task_timeout(&self) -> Duration {
        Duration::from_secs(self.default_task_timeout_secs)
    }

    /// Pause between scheduler sweeps.
    pub fn scheduler_interval(&self) -> Duration {
        Duration::from_millis(self.scheduler_interval_ms)
    }

    /// Age after which a running task counts as expired.
    pub fn task_expire(&self) -> Duration {
        Duration::from_secs(self.task_expire_secs)
    }

    /// Quiet period after which a running flow counts as orphaned.
    pub fn orphan_flow(&self) -> Duration {
        Duration::from_millis(self.orphan_flow_ms)
    }
}

/// Polling and staleness settings for [`FlowWatchAction`](crate::FlowWatchAction).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Sleep between two reads of the watched flow.
    pub poll_interval_ms: u64,
    /// Absolute bound on one watch run.
    pub deadline_ms: u64,
    /// Age after which a lock held by a failed flow is released as timed out.
    pub lock_stale_window_secs: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2000,
            deadline_ms: 30 * 60 * 1000,
            lock_stale_window_secs: 24 * 60 * 60,
        }
    }
}

impl WatchConfig {
    /// Checks the interval and deadline are usable.
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(EngineError::Configuration(
                "poll_interval_ms must be positive".to_string(),
            ));
        }
        if self.deadline_ms < self.poll_interval_ms {
            return Err(EngineError::Configuration(
                "deadline_ms must not be shorter than poll_interval_ms".to_string(),
            ));
        }
        Ok(())
    }

    /// Sleep between two reads of the watched flow.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Bound on one watch run.
    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }

    /// Age after which a lock held by a failed flow counts as stale.
    pub fn lock_stale_window(&self) -> Duration {
        Duration::from_secs(self.lock_stale_window_secs)
    }
}
