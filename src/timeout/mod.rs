//! Timeout configuration for git subprocesses and batch execution.

use std::time::Duration;

/// Configuration for timeout behavior during batch execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutConfig {
    /// Maximum time allowed for a single git invocation.
    /// Default: 60 seconds
    pub git_timeout: Duration,

    /// Fixed allowance added to every batch.
    /// Default: 300 seconds (5 minutes)
    pub batch_base_timeout: Duration,

    /// Allowance per wave of tasks in a batch.
    /// Default: 600 seconds (10 minutes)
    pub per_task_timeout: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            git_timeout: Duration::from_secs(60),
            batch_base_timeout: Duration::from_secs(300),
            per_task_timeout: Duration::from_secs(600),
        }
    }
}

impl TimeoutConfig {
    /// Creates a new TimeoutConfig with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the git operation timeout.
    pub fn with_git_timeout(mut self, timeout: Duration) -> Self {
        self.git_timeout = timeout;
        self
    }

    /// Sets the fixed per-batch allowance.
    pub fn with_batch_base_timeout(mut self, timeout: Duration) -> Self {
        self.batch_base_timeout = timeout;
        self
    }

    /// Sets the allowance per wave of tasks.
    pub fn with_per_task_timeout(mut self, timeout: Duration) -> Self {
        self.per_task_timeout = timeout;
        self
    }

    /// Overall timeout for a batch of `batch_len` tasks run `parallelism` at a time.
    ///
    /// Tasks run in waves of `parallelism`, so the budget grows with the number
    /// of waves rather than the raw task count.
    pub fn batch_timeout(&self, batch_len: usize, parallelism: usize) -> Duration {
        let parallelism = parallelism.max(1);
        let waves = batch_len.max(1).div_ceil(parallelism) as u32;
        self.batch_base_timeout + self.per_task_timeout * waves
    }
}
