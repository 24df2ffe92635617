//! Retry policy data.
//!
//! The policy only describes attempts and delays; the runtime crate owns the
//! loop that sleeps between attempts.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Bounded-attempt retry with a randomized sleep between attempts.
///
/// A policy with `count` retries makes at most `count + 1` attempts in total.
/// Each sleep is drawn uniformly from `[min_ms, max_ms]` milliseconds so that
/// many concurrent callers do not retry in lockstep.
///
/// # Examples
///
/// ```
/// use musubi_core::RetryPolicy;
///
/// let policy = RetryPolicy::new(3, 100, 500).expect("valid range");
/// assert_eq!(policy.max_attempts(), 4);
///
/// let delay = policy.next_delay();
/// assert!(delay.as_millis() >= 100 && delay.as_millis() <= 500);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Number of retries after the first attempt.
    pub count: u32,
    /// Lower bound of the sleep window, in milliseconds.
    pub min_ms: u64,
    /// Upper bound of the sleep window, in milliseconds.
    pub max_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            count: 3,
            min_ms: 100,
            max_ms: 500,
        }
    }
}

/// Error returned when a [`RetryPolicy`] range is invalid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicyError(pub &'static str);

impl std::fmt::Display for RetryPolicyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for RetryPolicyError {}

impl RetryPolicy {
    /// Creates a policy, rejecting a window whose lower bound exceeds its upper bound.
    pub fn new(count: u32, min_ms: u64, max_ms: u64) -> Result<Self, RetryPolicyError> {
        let policy = Self {
            count,
            min_ms,
            max_ms,
        };
        policy.validate()?;
        Ok(policy)
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            count: 0,
            min_ms: 0,
            max_ms: 0,
        }
    }

    /// Checks that the sleep window is well formed.
    pub fn validate(&self) -> Result<(), RetryPolicyError> {
        if self.min_ms > self.max_ms {
            return Err(RetryPolicyError("min_ms must not exceed max_ms"));
        }
        Ok(())
    }

    /// Returns the maximum number of retries.
    pub fn max_retries(&self) -> u32 {
        self.count
    }

    /// Returns the maximum number of attempts, the first one included.
    pub fn max_attempts(&self) -> u32 {
        self.count.saturating_add(1)
    }

    /// Samples the sleep before the next attempt.
    pub fn next_delay(&self) -> Duration {
        if self.max_ms <= self.min_ms {
            return Duration::from_millis(self.min_ms);
        }
        let ms = rand::thread_rng().gen_range(self.min_ms..=self.max_ms);
        Duration::from_millis(ms)
    }
}

/// Opt-in re-execution of a task's action after it fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TaskRetry {
    /// Whether a failed attempt is rolled back and re-run.
    pub enable: bool,
    /// How many re-runs are allowed and how long to sleep between them.
    pub policy: RetryPolicy,
}

impl TaskRetry {
    /// Enables task retry with the given policy.
    pub fn enabled(policy: RetryPolicy) -> Self {
        Self {
            enable: true,
            policy,
        }
    }

    /// Returns `true` if another attempt is allowed after `rollback_count`
    /// previous rollbacks.
    pub fn allows(&self, rollback_count: u32) -> bool {
        self.enable && rollback_count < self.policy.count
    }
}
