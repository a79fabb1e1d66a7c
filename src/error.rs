//! Error types for the execution engine.
//!
//! Per-task failures are always contained to the task that produced them.
//! Only shared-store and workspace-lock failures are allowed to reach past a
//! single task, and even those degrade behaviour instead of aborting a run.

use std::time::Duration;

use thiserror::Error;

use crate::ratelimit::StoreError;
use crate::workspace::Violation;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors produced by the engine.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The rate limiter could not hand out a slot before `queue_timeout`.
    #[error("timed out after {waited:?} waiting for a rate limiter slot ({label})")]
    AcquireTimeout {
        /// Caller label the lease was requested for.
        label: String,
        /// How long the caller waited.
        waited: Duration,
    },

    /// Change validation refused to commit a destructive diff.
    #[error("destructive change rejected: {}", describe_violations(.violations))]
    DestructiveChangeRejected {
        /// The hard violations that blocked the commit.
        violations: Vec<Violation>,
    },

    /// A merge or cherry-pick ran out of retries with conflicts remaining.
    #[error("merge conflict in {files:?}")]
    MergeConflict {
        /// Files still conflicting after the last attempt.
        files: Vec<String>,
    },

    /// The distributed counter backing store could not be reached.
    #[error("shared store unavailable: {0}")]
    SharedStoreUnavailable(String),

    /// The task executor reported an opaque failure.
    #[error("task {task_id} failed: {message}")]
    TaskExecutionFailed {
        /// Task that failed.
        task_id: String,
        /// Failure message reported by the executor.
        message: String,
    },

    /// A git invocation exited non-zero.
    #[error("git {command} failed: {stderr}")]
    Git {
        /// Subcommand and arguments that were run.
        command: String,
        /// Captured stderr.
        stderr: String,
    },

    /// A git invocation did not finish within the configured timeout.
    #[error("git {command} timed out after {timeout:?}")]
    GitTimeout {
        /// Subcommand and arguments that were run.
        command: String,
        /// Timeout that elapsed.
        timeout: Duration,
    },

    /// Shared store error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration could not be loaded or is invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// How far an error is allowed to propagate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorScope {
    /// Recorded against the task that produced it; the batch continues.
    Task,
    /// Degrades functionality (local fallback, serialization) but never aborts the run.
    Degrade,
}

impl EngineError {
    /// Create a task execution failure.
    pub fn task_failed(task_id: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::TaskExecutionFailed {
            task_id: task_id.into(),
            message: message.into(),
        }
    }

    /// Create a merge conflict error.
    pub fn merge_conflict(files: Vec<String>) -> Self {
        EngineError::MergeConflict { files }
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        EngineError::Config(msg.into())
    }

    /// Classify how far this error may propagate.
    pub fn scope(&self) -> ErrorScope {
        match self {
            EngineError::SharedStoreUnavailable(_) | EngineError::Store(_) => ErrorScope::Degrade,
            _ => ErrorScope::Task,
        }
    }

    /// Stable label recorded in the evidence journal.
    pub fn label(&self) -> &'static str {
        match self {
            EngineError::AcquireTimeout { .. } => "acquire_timeout",
            EngineError::DestructiveChangeRejected { .. } => "destructive_change_rejected",
            EngineError::MergeConflict { .. } => "merge_conflict",
            EngineError::SharedStoreUnavailable(_) => "shared_store_unavailable",
            EngineError::TaskExecutionFailed { .. } => "task_execution_failed",
            EngineError::Git { .. } => "git",
            EngineError::GitTimeout { .. } => "git_timeout",
            EngineError::Store(_) => "store",
            EngineError::Config(_) => "config",
            EngineError::Io(_) => "io",
            EngineError::Json(_) => "json",
        }
    }
}

fn describe_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| format!("{} ({})", v.path, v.reason))
        .collect::<Vec<_>>()
        .join(", ")
}
