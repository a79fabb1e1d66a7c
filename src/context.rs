//! Per-run execution context and the seams to the outside world.
//!
//! An [`ExecutionContext`] is built once per run and handed to every
//! component. It owns the rate limiter, the shared mutable registries and the
//! per-repository git locks; nothing in the crate keeps process-wide state.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::config::EngineConfig;
use crate::error::Result;
use crate::ratelimit::{MemoryStore, RateLimiter, RateLimiterConfig, ResourceSlot, SqliteStore};
use crate::task::{Task, TaskResult, ValidationScore};
use crate::workspace::WorkspaceHandle;

/// Scaffold flag consulted by the planner when `requires_scaffold` is set.
pub const PRIMARY_SCAFFOLD: &str = "primary";

/// Feedback handed to a task when it is executed again.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Feedback {
    pub round: u32,
    pub previous_errors: Vec<String>,
    pub previous_conflicts: Vec<String>,
    /// Why the last attempt failed, whatever the cause.
    pub failure_reason: Option<String>,
    /// Set when the task passed earlier and was demoted by later work.
    pub regression_reason: Option<String>,
    /// Files currently blocking two or more tasks.
    pub shared_error_files: Vec<String>,
    /// Files implicated in this task's last failure.
    pub failure_files: Vec<String>,
}

impl Feedback {
    /// Build feedback for `task` from its last recorded outcome.
    pub fn for_task(task: &Task, round: u32, shared_error_files: Vec<String>) -> Self {
        Self {
            round,
            previous_errors: task.last_errors.clone(),
            previous_conflicts: task.last_conflicts.clone(),
            failure_reason: task.failure_reason.clone(),
            regression_reason: task.regression_reason.clone(),
            shared_error_files,
            failure_files: task.failure_files.iter().cloned().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.previous_errors.is_empty()
            && self.previous_conflicts.is_empty()
            && self.failure_reason.is_none()
            && self.regression_reason.is_none()
            && self.failure_files.is_empty()
    }
}

/// Does the actual work of a task inside its isolated workspace.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Execute `task` in `workspace`. Errors are contained to the task.
    ///
    /// Calls into the rate-limited resource go through
    /// [`WorkspaceHandle::resources`].
    async fn execute(
        &self,
        task: &Task,
        workspace: &WorkspaceHandle,
        feedback: &Feedback,
    ) -> Result<TaskResult>;

    /// Resolve `conflicts` in `workspace` and commit. Returns whether a
    /// resolution was produced.
    async fn resolve_conflicts(
        &self,
        _task: &Task,
        _workspace: &WorkspaceHandle,
        _conflicts: &[String],
    ) -> Result<bool> {
        Ok(false)
    }
}

/// Judges a task's work against the current delivery tree.
#[async_trait]
pub trait TaskValidator: Send + Sync {
    async fn validate(&self, task: &Task, root: &Path) -> Result<ValidationScore>;
}

/// Mutexes serializing git invocations per physical repository.
#[derive(Debug, Default)]
pub struct RepoLocks {
    locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl RepoLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// The single lock for the repository at `path`.
    pub fn lock_for(&self, path: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let key = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        let mut locks = lock_unpoisoned(&self.locks);
        Arc::clone(locks.entry(key).or_default())
    }
}

/// Shared registries, each behind its own lock.
#[derive(Debug, Default)]
pub struct SharedState {
    scaffolds: tokio::sync::Mutex<HashSet<String>>,
    installed: Mutex<HashSet<String>>,
    file_errors: Mutex<BTreeMap<String, BTreeSet<String>>>,
}

impl SharedState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `init` once for scaffold `name`.
    ///
    /// Concurrent callers wait on the scaffold lock; exactly one runs `init`.
    /// Returns `true` for the caller that performed the setup. A failed `init`
    /// leaves the flag unset.
    pub async fn ensure_scaffold<F, Fut>(&self, name: &str, init: F) -> Result<bool>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut ready = self.scaffolds.lock().await;
        if ready.contains(name) {
            return Ok(false);
        }
        init().await?;
        ready.insert(name.to_string());
        tracing::info!(scaffold = name, "scaffold initialized");
        Ok(true)
    }

    pub async fn is_scaffold_ready(&self, name: &str) -> bool {
        self.scaffolds.lock().await.contains(name)
    }

    /// Record an installed package. Returns whether it was new.
    pub fn record_installed(&self, package: &str) -> bool {
        lock_unpoisoned(&self.installed).insert(package.to_string())
    }

    pub fn is_installed(&self, package: &str) -> bool {
        lock_unpoisoned(&self.installed).contains(package)
    }

    /// Record that `file` is blocking `task_id`.
    pub fn record_file_error(&self, file: &str, task_id: &str) {
        lock_unpoisoned(&self.file_errors)
            .entry(file.to_string())
            .or_default()
            .insert(task_id.to_string());
    }

    /// Forget every file error attributed to `task_id`.
    pub fn clear_task_errors(&self, task_id: &str) {
        let mut errors = lock_unpoisoned(&self.file_errors);
        errors.retain(|_, tasks| {
            tasks.remove(task_id);
            !tasks.is_empty()
        });
    }

    /// Files whose breakage blocks two or more tasks.
    pub fn shared_error_files(&self) -> Vec<String> {
        lock_unpoisoned(&self.file_errors)
            .iter()
            .filter(|(_, tasks)| tasks.len() >= 2)
            .map(|(file, _)| file.clone())
            .collect()
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Everything a run shares, constructed once and passed explicitly.
pub struct ExecutionContext {
    config: EngineConfig,
    root: PathBuf,
    limiter: Arc<RateLimiter>,
    shared: SharedState,
    repo_locks: RepoLocks,
}

impl ExecutionContext {
    /// Build a context for the delivery repository at `root`.
    pub fn new(config: EngineConfig, root: impl Into<PathBuf>) -> Result<Self> {
        config.validate()?;
        let limiter = Arc::new(build_limiter(&config));
        Ok(Self {
            config,
            root: root.into(),
            limiter,
            shared: SharedState::new(),
            repo_locks: RepoLocks::new(),
        })
    }

    /// Replace the rate limiter.
    pub fn with_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Delivery repository root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn shared(&self) -> &SharedState {
        &self.shared
    }

    pub fn repo_locks(&self) -> &RepoLocks {
        &self.repo_locks
    }

    /// Run `call` while holding a rate limiter lease for `label`.
    ///
    /// The lease is released whether or not `call` succeeds.
    pub async fn with_resource_slot<F, T>(&self, label: &str, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        ResourceSlot::new(Arc::clone(&self.limiter), label)
            .call(call)
            .await
    }
}

fn build_limiter(config: &EngineConfig) -> RateLimiter {
    let limiter_config = RateLimiterConfig::from_engine(config);
    match &config.store_path {
        Some(path) => match SqliteStore::open(path) {
            Ok(store) => RateLimiter::new(Arc::new(store), limiter_config),
            Err(err) => {
                tracing::debug!(path = %path.display(), "opening shared store failed");
                RateLimiter::degraded(limiter_config, &err)
            }
        },
        None => RateLimiter::new(Arc::new(MemoryStore::new()), limiter_config),
    }
}
