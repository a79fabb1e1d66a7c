//! Engine configuration.
//!
//! Values come from `CONVOY_*` environment variables, optionally layered over a
//! TOML file. Every field has a default so an empty environment yields a usable
//! configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::timeout::TimeoutConfig;

/// Prefix for environment variables (`CONVOY_MAX_CONCURRENT`, ...).
pub const ENV_PREFIX: &str = "CONVOY";

/// How a task's edits are isolated from the delivery line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationMode {
    /// A git worktree on a dedicated task branch.
    #[default]
    Worktree,
    /// A plain directory copy of the delivery tree with a private baseline.
    FlatCopy,
}

/// How isolated commits are brought onto the delivery line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// `git merge --no-ff` of the whole task branch.
    #[default]
    MergeNoFf,
    /// Cherry-pick every task commit in order.
    CherryPick,
}

/// What to do with uncommitted changes found on the delivery line before a merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftPolicy {
    /// Commit the drift so nothing is lost.
    #[default]
    AutoCommit,
    /// Discard the drift with a hard reset and clean.
    HardReset,
}

/// Complete engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Distributed rate limiter slots.
    pub max_concurrent: u32,
    /// Seconds an `acquire` may wait before failing with `AcquireTimeout`.
    pub queue_timeout_secs: u64,
    /// Seconds before an unreleased lease is reclaimed.
    pub lease_ttl_secs: u64,
    /// Key of the distributed counter in the shared store.
    pub limiter_key: String,
    /// SQLite file backing the distributed counter. `None` keeps it in process.
    pub store_path: Option<PathBuf>,
    /// Maximum number of execution rounds.
    pub max_rounds: u32,
    /// Conflict resolution retries per merge.
    pub max_cherry_pick_retries: u32,
    /// Score drop that counts as a regression even if the task still passes.
    pub regression_score_drop_threshold: f64,
    /// Minimum validation score for a task to pass.
    pub pass_threshold: f64,
    /// Upper bound on tasks run concurrently inside one batch.
    pub parallel_cap: usize,
    /// Branch that accepted work is merged into.
    pub delivery_branch: String,
    /// Directory (relative to the repository) holding isolation workspaces.
    pub workspace_dir: PathBuf,
    /// Isolation flavour for task workspaces.
    pub isolation_mode: IsolationMode,
    /// Merge transport onto the delivery line.
    pub merge_strategy: MergeStrategy,
    /// Handling of uncommitted drift on the delivery line.
    pub drift_policy: DriftPolicy,
    /// Glob patterns for generated files whose conflicts resolve to the incoming side.
    pub auto_resolve_patterns: Vec<String>,
    /// Glob patterns for files whose deletion is reported as a warning.
    pub important_patterns: Vec<String>,
    /// Files shorter than this are never flagged as destructively truncated.
    pub destructive_min_original_lines: usize,
    /// A file left with fewer lines than this counts as truncated.
    pub destructive_min_remaining_lines: usize,
    /// Deleted/original line ratio above which a truncation is destructive.
    pub destructive_max_deletion_ratio: f64,
    /// Whether a one-time scaffold step must complete before batches run concurrently.
    pub requires_scaffold: bool,
    /// Seconds allowed for a single git invocation.
    pub git_timeout_secs: u64,
    /// Fixed seconds added to every batch timeout.
    pub batch_base_timeout_secs: u64,
    /// Seconds per wave of tasks added to a batch timeout.
    pub per_task_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            queue_timeout_secs: 120,
            lease_ttl_secs: 300,
            limiter_key: "convoy:llm".to_string(),
            store_path: None,
            max_rounds: 3,
            max_cherry_pick_retries: 3,
            regression_score_drop_threshold: 0.2,
            pass_threshold: 0.8,
            parallel_cap: 4,
            delivery_branch: "main".to_string(),
            workspace_dir: PathBuf::from(".convoy/workspaces"),
            isolation_mode: IsolationMode::default(),
            merge_strategy: MergeStrategy::default(),
            drift_policy: DriftPolicy::default(),
            auto_resolve_patterns: vec![
                "*.lock".to_string(),
                "package-lock.json".to_string(),
                "dist/**".to_string(),
                "build/**".to_string(),
                "**/__pycache__/**".to_string(),
                "*.min.js".to_string(),
            ],
            important_patterns: vec![
                "Cargo.toml".to_string(),
                "Cargo.lock".to_string(),
                "package.json".to_string(),
                "package-lock.json".to_string(),
                "pyproject.toml".to_string(),
                "requirements.txt".to_string(),
                "go.mod".to_string(),
                "**/Cargo.toml".to_string(),
                "**/package.json".to_string(),
            ],
            destructive_min_original_lines: 20,
            destructive_min_remaining_lines: 20,
            destructive_max_deletion_ratio: 0.5,
            requires_scaffold: false,
            git_timeout_secs: 60,
            batch_base_timeout_secs: 300,
            per_task_timeout_secs: 600,
        }
    }
}

impl EngineConfig {
    /// Create a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from `CONVOY_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::load(None)
    }

    /// Load configuration from a TOML file, with environment variables taking precedence.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::load(Some(path.as_ref()))
    }

    fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("auto_resolve_patterns")
                .with_list_parse_key("important_patterns"),
        );

        let loaded: EngineConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| EngineError::config(e.to_string()))?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(EngineError::config("max_concurrent must be at least 1"));
        }
        if self.parallel_cap == 0 {
            return Err(EngineError::config("parallel_cap must be at least 1"));
        }
        if self.max_rounds == 0 {
            return Err(EngineError::config("max_rounds must be at least 1"));
        }
        for (name, value) in [
            ("pass_threshold", self.pass_threshold),
            (
                "regression_score_drop_threshold",
                self.regression_score_drop_threshold,
            ),
            (
                "destructive_max_deletion_ratio",
                self.destructive_max_deletion_ratio,
            ),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(EngineError::config(format!(
                    "{name} must be within [0, 1], got {value}"
                )));
            }
        }
        if self.delivery_branch.trim().is_empty() {
            return Err(EngineError::config("delivery_branch must not be empty"));
        }
        Ok(())
    }

    /// Set the number of distributed rate limiter slots.
    pub fn with_max_concurrent(mut self, slots: u32) -> Self {
        self.max_concurrent = slots;
        self
    }

    /// Set the acquire queue timeout.
    pub fn with_queue_timeout(mut self, timeout: Duration) -> Self {
        self.queue_timeout_secs = timeout.as_secs();
        self
    }

    /// Set the maximum number of rounds.
    pub fn with_max_rounds(mut self, rounds: u32) -> Self {
        self.max_rounds = rounds;
        self
    }

    /// Set the conflict resolution retry budget.
    pub fn with_max_cherry_pick_retries(mut self, retries: u32) -> Self {
        self.max_cherry_pick_retries = retries;
        self
    }

    /// Set the isolation mode.
    pub fn with_isolation_mode(mut self, mode: IsolationMode) -> Self {
        self.isolation_mode = mode;
        self
    }

    /// Set the merge strategy.
    pub fn with_merge_strategy(mut self, strategy: MergeStrategy) -> Self {
        self.merge_strategy = strategy;
        self
    }

    /// Replace the generated-file patterns.
    pub fn with_auto_resolve_patterns(mut self, patterns: Vec<String>) -> Self {
        self.auto_resolve_patterns = patterns;
        self
    }

    /// Set the pass threshold.
    pub fn with_pass_threshold(mut self, threshold: f64) -> Self {
        self.pass_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    /// Set the batch concurrency cap.
    pub fn with_parallel_cap(mut self, cap: usize) -> Self {
        self.parallel_cap = cap;
        self
    }

    /// Require a one-time scaffold before concurrent batches.
    pub fn with_requires_scaffold(mut self, required: bool) -> Self {
        self.requires_scaffold = required;
        self
    }

    /// Point the distributed counter at a SQLite file.
    pub fn with_store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.store_path = Some(path.into());
        self
    }

    /// Queue timeout as a `Duration`.
    pub fn queue_timeout(&self) -> Duration {
        Duration::from_secs(self.queue_timeout_secs)
    }

    /// Lease TTL as a `Duration`.
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    /// Timeout settings derived from this config.
    pub fn timeouts(&self) -> TimeoutConfig {
        TimeoutConfig::new()
            .with_git_timeout(Duration::from_secs(self.git_timeout_secs))
            .with_batch_base_timeout(Duration::from_secs(self.batch_base_timeout_secs))
            .with_per_task_timeout(Duration::from_secs(self.per_task_timeout_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.max_concurrent, 5);
        assert_eq!(config.queue_timeout(), Duration::from_secs(120));
        assert_eq!(config.max_cherry_pick_retries, 3);
        assert!((config.regression_score_drop_threshold - 0.2).abs() < f64::EPSILON);
        assert_eq!(config.isolation_mode, IsolationMode::Worktree);
        assert_eq!(config.merge_strategy, MergeStrategy::MergeNoFf);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_pattern() {
        let config = EngineConfig::new()
            .with_max_concurrent(2)
            .with_queue_timeout(Duration::from_secs(5))
            .with_max_rounds(7)
            .with_isolation_mode(IsolationMode::FlatCopy)
            .with_merge_strategy(MergeStrategy::CherryPick)
            .with_pass_threshold(1.5);

        assert_eq!(config.max_concurrent, 2);
        assert_eq!(config.queue_timeout_secs, 5);
        assert_eq!(config.max_rounds, 7);
        assert_eq!(config.isolation_mode, IsolationMode::FlatCopy);
        assert_eq!(config.merge_strategy, MergeStrategy::CherryPick);
        assert_eq!(config.pass_threshold, 1.0);
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let config = EngineConfig::new().with_max_concurrent(0);
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_out_of_range_threshold() {
        let config = EngineConfig {
            regression_score_drop_threshold: 1.2,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("regression_score_drop_threshold"));
    }

    #[test]
    fn test_from_file_reads_toml() {
        let temp_dir = TempDir::new().expect("temp dir");
        let path = temp_dir.path().join("convoy.toml");
        fs::write(
            &path,
            r#"
max_concurrent = 9
max_rounds = 4
isolation_mode = "flat_copy"
merge_strategy = "cherry_pick"
auto_resolve_patterns = ["config.json"]
"#,
        )
        .expect("write config");

        let config = EngineConfig::from_file(&path).expect("load");
        assert_eq!(config.max_concurrent, 9);
        assert_eq!(config.max_rounds, 4);
        assert_eq!(config.isolation_mode, IsolationMode::FlatCopy);
        assert_eq!(config.merge_strategy, MergeStrategy::CherryPick);
        assert_eq!(config.auto_resolve_patterns, vec!["config.json".to_string()]);
        // untouched fields keep their defaults
        assert_eq!(config.queue_timeout_secs, 120);
    }

    #[test]
    fn test_timeouts_derived_from_seconds() {
        let config = EngineConfig {
            git_timeout_secs: 7,
            ..Default::default()
        };
        assert_eq!(config.timeouts().git_timeout, Duration::from_secs(7));
    }
}
