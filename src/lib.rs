//! Concurrent execution and isolation engine for fleets of tasks editing one
//! shared git workspace.
//!
//! Tasks are planned into dependency-respecting batches, executed in isolated
//! worktrees or flat copies, merged onto a delivery branch with conflict
//! retries and re-validated when later work touches files they own. Calls to
//! a rate-limited resource go through a distributed semaphore that degrades
//! to a local one when its store is unreachable.

pub mod config;
pub mod context;
pub mod error;
pub mod evidence;
pub mod logging;
pub mod merge;
pub mod parallel;
pub mod ratelimit;
pub mod regression;
pub mod task;
pub mod timeout;
pub mod workspace;

pub use config::{DriftPolicy, EngineConfig, IsolationMode, MergeStrategy};
pub use context::{ExecutionContext, Feedback, SharedState, TaskExecutor, TaskValidator};
pub use error::{EngineError, ErrorScope, Result};
pub use merge::{CherryPickCoordinator, ConflictCallback, MergeResult, MergeStatus};
pub use parallel::{BatchPlanner, DependencyGraph, ExecutionLoop, RunReport};
pub use ratelimit::{RateLimiter, RateLimiterConfig, ResourceSlot, SemaphoreLease};
pub use regression::{RegressionDetector, RegressionFinding};
pub use task::{FileOwnershipMap, Task, TaskResult, TaskState, ValidationScore};
pub use workspace::{CommitOutcome, IsolationStrategy, WorkspaceHandle};
