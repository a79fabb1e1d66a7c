//! Isolated per-task workspaces over a shared delivery repository.
//!
//! Each task gets either a git worktree on its own branch or a flat copy with
//! an independent history. Both are driven through [`IsolationStrategy`].

pub mod git;
pub mod isolation;
pub mod stats;

use std::path::PathBuf;

use glob::{MatchOptions, Pattern};
use serde::Serialize;

pub use git::{Git, GitOutput};
pub use isolation::{
    isolation_for, FlatCopyIsolation, IsolationStrategy, MergeSource, WorktreeIsolation,
};
pub use stats::{ChangeStats, ChangeValidation, DestructivePolicy, LineDelta, Violation};

use crate::config::IsolationMode;
use crate::ratelimit::ResourceSlot;

/// A task's isolated workspace.
#[derive(Debug, Clone)]
pub struct WorkspaceHandle {
    pub task_id: String,
    pub round: u32,
    /// Directory the task reads and writes.
    pub path: PathBuf,
    /// Task branch in the delivery repository (worktree mode only).
    pub branch: Option<String>,
    /// Commit the task's changes are measured against.
    pub base_commit: String,
    pub mode: IsolationMode,
    git: Git,
    resources: ResourceSlot,
}

impl WorkspaceHandle {
    /// Git handle for the workspace directory.
    pub fn git(&self) -> &Git {
        &self.git
    }

    /// Rate-limited resource access for the task running here.
    pub fn resources(&self) -> &ResourceSlot {
        &self.resources
    }
}

/// Result of [`IsolationStrategy::commit`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum CommitOutcome {
    /// The workspace had no changes.
    NothingToCommit,
    Committed {
        commit: String,
        files: Vec<String>,
        warnings: Vec<Violation>,
    },
}

impl CommitOutcome {
    pub fn committed(&self) -> bool {
        matches!(self, CommitOutcome::Committed { .. })
    }
}

/// Glob patterns matched against a path or its file name.
#[derive(Debug, Clone, Default)]
pub struct PatternSet {
    patterns: Vec<Pattern>,
}

impl PatternSet {
    /// Compile `patterns`, skipping invalid ones with a warning.
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Self {
        let patterns = patterns
            .iter()
            .filter_map(|raw| match Pattern::new(raw.as_ref()) {
                Ok(pattern) => Some(pattern),
                Err(err) => {
                    tracing::warn!(pattern = raw.as_ref(), error = %err, "ignoring invalid glob");
                    None
                }
            })
            .collect();
        Self { patterns }
    }

    pub fn matches(&self, path: &str) -> bool {
        let options = MatchOptions {
            case_sensitive: true,
            require_literal_separator: false,
            require_literal_leading_dot: false,
        };
        let file_name = path.rsplit('/').next().unwrap_or(path);
        self.patterns.iter().any(|pattern| {
            pattern.matches_with(path, options) || pattern.matches_with(file_name, options)
        })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// Directory-safe form of a task id.
pub(crate) fn sanitize_id(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
