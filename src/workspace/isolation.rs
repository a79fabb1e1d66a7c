//! Isolation strategies: git worktree per task, or a flat copy with its own history.
//!
//! The two variants share diffing, validation, commit and rollback through
//! [`WorkspaceCore`]. They differ in how a workspace is created, where its
//! work is merged from, how it is resynced after a rejected merge, and how it
//! is torn down; those are required trait methods so neither variant can
//! silently inherit the other's behaviour.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use walkdir::WalkDir;

use crate::config::IsolationMode;
use crate::context::ExecutionContext;
use crate::error::{EngineError, Result};
use crate::ratelimit::ResourceSlot;
use crate::workspace::git::Git;
use crate::workspace::stats::{ChangeStats, ChangeValidation, DestructivePolicy};
use crate::workspace::{sanitize_id, CommitOutcome, PatternSet, WorkspaceHandle};

/// Where a task's committed work is taken from when merging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeSource {
    /// A branch in the delivery repository.
    Branch(String),
    /// An independent repository whose `base..HEAD` diff is applied as a patch.
    Patch { repo: PathBuf, base: String },
}

/// State and helpers shared by both isolation variants.
pub struct WorkspaceCore {
    ctx: Arc<ExecutionContext>,
    delivery: Git,
    policy: DestructivePolicy,
    auto_resolve: PatternSet,
}

impl WorkspaceCore {
    pub fn new(ctx: Arc<ExecutionContext>) -> Self {
        let config = ctx.config();
        let delivery = Git::new(
            ctx.root(),
            ctx.repo_locks().lock_for(ctx.root()),
            config.timeouts().git_timeout,
        );
        let policy = DestructivePolicy::from_config(config);
        let auto_resolve = PatternSet::new(&config.auto_resolve_patterns);
        Self {
            ctx,
            delivery,
            policy,
            auto_resolve,
        }
    }

    /// Git handle for the delivery repository.
    pub fn delivery(&self) -> &Git {
        &self.delivery
    }

    pub fn delivery_branch(&self) -> &str {
        &self.ctx.config().delivery_branch
    }

    pub fn policy(&self) -> &DestructivePolicy {
        &self.policy
    }

    fn resource_slot(&self, task_id: &str) -> ResourceSlot {
        ResourceSlot::new(Arc::clone(self.ctx.limiter()), task_id)
    }

    fn workspace_root(&self) -> PathBuf {
        let dir = &self.ctx.config().workspace_dir;
        if dir.is_absolute() {
            dir.clone()
        } else {
            self.ctx.root().join(dir)
        }
    }

    fn workspace_path(&self, task_id: &str, round: u32) -> PathBuf {
        self.workspace_root()
            .join(format!("{}-r{round}", sanitize_id(task_id)))
    }

    /// Git handle for an independent repository at `path`.
    fn standalone_git(&self, path: &Path) -> Git {
        Git::new(
            path,
            self.ctx.repo_locks().lock_for(path),
            self.ctx.config().timeouts().git_timeout,
        )
    }

    async fn exclude_state_dir(&self) -> Result<()> {
        self.delivery.ensure_excluded("/.convoy/").await?;
        if let Ok(relative) = self.workspace_root().strip_prefix(self.ctx.root()) {
            let pattern = format!("/{}/", relative.to_string_lossy().trim_end_matches('/'));
            self.delivery.ensure_excluded(&pattern).await?;
        }
        Ok(())
    }

    /// Merge `rev` into the workspace repository behind `git`. Conflicted
    /// paths in `real` take the incoming delivery side; `auto` paths, and
    /// generated files not listed as real, keep the task side.
    async fn merge_into_workspace(
        &self,
        git: &Git,
        rev: &str,
        message: &str,
        real: &[String],
        auto: &[String],
    ) -> Result<()> {
        let output = git.merge_no_ff(rev, message).await?;
        if output.success {
            return Ok(());
        }
        if !output.mentions_conflict() {
            git.merge_abort().await?;
            return Err(EngineError::Git {
                command: format!("merge {rev}"),
                stderr: output.stderr.trim().to_string(),
            });
        }
        for path in git.conflicted_files().await? {
            let keep_task_side =
                auto.contains(&path) || (!real.contains(&path) && self.auto_resolve.matches(&path));
            let side = if keep_task_side { "--ours" } else { "--theirs" };
            let picked = git.checkout_side(side, &path).await?;
            if picked.success {
                git.check(&["add", "--", &path]).await?;
            } else {
                git.check(&["rm", "-q", "-f", "--", &path]).await?;
            }
        }
        git.check(&["commit", "-q", "--no-verify", "--no-edit"])
            .await?;
        Ok(())
    }
}

/// How a task's workspace is isolated from the delivery line.
#[async_trait]
pub trait IsolationStrategy: Send + Sync {
    fn core(&self) -> &WorkspaceCore;

    fn mode(&self) -> IsolationMode;

    /// Create an isolated workspace from the current delivery head.
    async fn create(&self, task_id: &str, round: u32) -> Result<WorkspaceHandle>;

    /// Where the coordinator takes this workspace's commits from.
    fn merge_source(&self, ws: &WorkspaceHandle) -> MergeSource;

    /// Bring delivery's current content into the workspace after a rejected
    /// merge. `real` conflicts take delivery's version; `auto` conflicts keep
    /// the task's. Untracked task files survive.
    async fn resync_for_retry(
        &self,
        ws: &mut WorkspaceHandle,
        real: &[String],
        auto: &[String],
    ) -> Result<()>;

    /// Remove the workspace.
    async fn cleanup(&self, ws: &WorkspaceHandle) -> Result<()>;

    /// Changes in the workspace relative to its base.
    async fn diff_from_main(&self, ws: &WorkspaceHandle) -> Result<ChangeStats> {
        ChangeStats::collect(ws.git(), &ws.base_commit).await
    }

    fn validate(&self, stats: &ChangeStats) -> ChangeValidation {
        self.core().policy().validate(stats)
    }

    /// Stage and commit everything unless the diff is destructive.
    async fn commit(&self, ws: &WorkspaceHandle, message: &str) -> Result<CommitOutcome> {
        if ws.git().status_porcelain().await?.is_empty() {
            return Ok(CommitOutcome::NothingToCommit);
        }

        let stats = self.diff_from_main(ws).await?;
        let report = self.validate(&stats);
        if report.is_destructive() {
            tracing::warn!(
                task_id = %ws.task_id,
                violations = report.violations.len(),
                "refusing destructive commit"
            );
            return Err(EngineError::DestructiveChangeRejected {
                violations: report.violations,
            });
        }
        for warning in &report.warnings {
            tracing::warn!(task_id = %ws.task_id, path = %warning.path, reason = %warning.reason, "suspicious change");
        }

        ws.git().add_all().await?;
        if !ws.git().commit_staged(message).await? {
            return Ok(CommitOutcome::NothingToCommit);
        }
        let commit = ws.git().head().await?;
        tracing::debug!(task_id = %ws.task_id, commit = %commit, files = stats.files().len(), "workspace committed");
        Ok(CommitOutcome::Committed {
            commit,
            files: stats.files(),
            warnings: report.warnings,
        })
    }

    /// Discard uncommitted edits and untracked files.
    async fn rollback(&self, ws: &WorkspaceHandle) -> Result<()> {
        ws.git().reset_hard("HEAD").await?;
        ws.git().clean().await?;
        tracing::debug!(task_id = %ws.task_id, "workspace rolled back");
        Ok(())
    }

    /// Current head commit of the workspace.
    async fn head(&self, ws: &WorkspaceHandle) -> Result<String> {
        ws.git().head().await
    }
}

/// Pick the strategy configured for the run.
pub fn isolation_for(ctx: Arc<ExecutionContext>) -> Arc<dyn IsolationStrategy> {
    match ctx.config().isolation_mode {
        IsolationMode::Worktree => Arc::new(WorktreeIsolation::new(ctx)),
        IsolationMode::FlatCopy => Arc::new(FlatCopyIsolation::new(ctx)),
    }
}

/// Worktree on a `task/<id>-r<round>` branch of the delivery repository.
pub struct WorktreeIsolation {
    core: WorkspaceCore,
}

impl WorktreeIsolation {
    pub fn new(ctx: Arc<ExecutionContext>) -> Self {
        Self {
            core: WorkspaceCore::new(ctx),
        }
    }

    fn branch_name(task_id: &str, round: u32) -> String {
        format!("task/{}-r{round}", sanitize_id(task_id))
    }
}

#[async_trait]
impl IsolationStrategy for WorktreeIsolation {
    fn core(&self) -> &WorkspaceCore {
        &self.core
    }

    fn mode(&self) -> IsolationMode {
        IsolationMode::Worktree
    }

    async fn create(&self, task_id: &str, round: u32) -> Result<WorkspaceHandle> {
        let delivery = self.core.delivery();
        self.core.exclude_state_dir().await?;

        let path = self.core.workspace_path(task_id, round);
        let branch = Self::branch_name(task_id, round);
        if path.exists() {
            let _ = delivery.worktree_remove(&path).await;
            if path.exists() {
                tokio::fs::remove_dir_all(&path).await?;
            }
        }
        delivery.worktree_prune().await?;

        let base_commit = delivery
            .check(&["rev-parse", self.core.delivery_branch()])
            .await?;
        delivery.create_branch(&branch, &base_commit).await?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        delivery.worktree_add(&path, &branch).await?;

        tracing::info!(
            task_id,
            round,
            branch = %branch,
            worktree = %path.display(),
            "created worktree for task isolation"
        );

        Ok(WorkspaceHandle {
            task_id: task_id.to_string(),
            round,
            git: delivery.at(&path),
            resources: self.core.resource_slot(task_id),
            path,
            branch: Some(branch),
            base_commit,
            mode: IsolationMode::Worktree,
        })
    }

    fn merge_source(&self, ws: &WorkspaceHandle) -> MergeSource {
        MergeSource::Branch(
            ws.branch
                .clone()
                .unwrap_or_else(|| Self::branch_name(&ws.task_id, ws.round)),
        )
    }

    async fn resync_for_retry(
        &self,
        ws: &mut WorkspaceHandle,
        real: &[String],
        auto: &[String],
    ) -> Result<()> {
        let delivery_branch = self.core.delivery_branch().to_string();
        let git = ws.git().clone();
        let message = format!("convoy: sync {delivery_branch} into {}", ws.task_id);
        self.core
            .merge_into_workspace(&git, &delivery_branch, &message, real, auto)
            .await?;

        ws.base_commit = self
            .core
            .delivery()
            .check(&["rev-parse", &delivery_branch])
            .await?;
        tracing::info!(
            task_id = %ws.task_id,
            conflicts = real.len(),
            "synced delivery into task branch"
        );
        Ok(())
    }

    async fn cleanup(&self, ws: &WorkspaceHandle) -> Result<()> {
        let delivery = self.core.delivery();
        if let Err(err) = delivery.worktree_remove(&ws.path).await {
            tracing::debug!(task_id = %ws.task_id, error = %err, "worktree remove failed");
        }
        if ws.path.exists() {
            tokio::fs::remove_dir_all(&ws.path).await?;
        }
        delivery.worktree_prune().await?;
        if let Some(branch) = &ws.branch {
            delivery.delete_branch(branch).await?;
        }
        Ok(())
    }
}

/// Plain directory copy of the delivery tree with its own baseline commit.
pub struct FlatCopyIsolation {
    core: WorkspaceCore,
}

impl FlatCopyIsolation {
    pub fn new(ctx: Arc<ExecutionContext>) -> Self {
        Self {
            core: WorkspaceCore::new(ctx),
        }
    }

    /// Copy delivery's files into `dest`, skipping git metadata and engine state.
    fn copy_tree(&self, dest: &Path) -> Result<usize> {
        let source = self.core.ctx.root();
        let skip = self.core.workspace_root();
        let mut copied = 0;

        let walker = WalkDir::new(source)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| {
                let name = entry.file_name().to_string_lossy();
                name != ".git" && name != ".convoy" && entry.path() != skip
            });
        for entry in walker {
            let entry = entry.map_err(|e| EngineError::Io(e.into()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(source) else {
                continue;
            };
            let target = dest.join(relative);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
            copied += 1;
        }
        Ok(copied)
    }
}

#[async_trait]
impl IsolationStrategy for FlatCopyIsolation {
    fn core(&self) -> &WorkspaceCore {
        &self.core
    }

    fn mode(&self) -> IsolationMode {
        IsolationMode::FlatCopy
    }

    async fn create(&self, task_id: &str, round: u32) -> Result<WorkspaceHandle> {
        self.core.exclude_state_dir().await?;
        let path = self.core.workspace_path(task_id, round);
        if path.exists() {
            tokio::fs::remove_dir_all(&path).await?;
        }
        tokio::fs::create_dir_all(&path).await?;

        let copied = self.copy_tree(&path)?;
        let git = self.core.standalone_git(&path);
        git.init(self.core.delivery_branch()).await?;
        git.add_all().await?;
        git.check(&[
            "commit",
            "-q",
            "--no-verify",
            "--allow-empty",
            "-m",
            "convoy: baseline",
        ])
        .await?;
        let base_commit = git.head().await?;

        tracing::info!(
            task_id,
            round,
            files = copied,
            dir = %path.display(),
            "created flat copy for task isolation"
        );

        Ok(WorkspaceHandle {
            task_id: task_id.to_string(),
            round,
            path,
            branch: None,
            base_commit,
            mode: IsolationMode::FlatCopy,
            git,
            resources: self.core.resource_slot(task_id),
        })
    }

    fn merge_source(&self, ws: &WorkspaceHandle) -> MergeSource {
        MergeSource::Patch {
            repo: ws.path.clone(),
            base: ws.base_commit.clone(),
        }
    }

    /// The flat copy has no history shared with delivery, so delivery's
    /// current tree is committed on top of the workspace base and merged
    /// into the task's line. The snapshot becomes the new base, so the next
    /// patch carries every task change plus the conflict resolutions.
    async fn resync_for_retry(
        &self,
        ws: &mut WorkspaceHandle,
        real: &[String],
        auto: &[String],
    ) -> Result<()> {
        let git = ws.git().clone();
        let root = self.core.ctx.root();
        let delivery_root = root
            .canonicalize()
            .unwrap_or_else(|_| root.to_path_buf())
            .to_string_lossy()
            .into_owned();
        git.check(&[
            "fetch",
            "-q",
            "--no-tags",
            &delivery_root,
            self.core.delivery_branch(),
        ])
        .await?;
        let tree = git.check(&["rev-parse", "FETCH_HEAD^{tree}"]).await?;
        let snapshot = git
            .check(&[
                "commit-tree",
                &tree,
                "-p",
                &ws.base_commit,
                "-m",
                "convoy: delivery snapshot",
            ])
            .await?;

        let message = format!("convoy: sync delivery into {}", ws.task_id);
        self.core
            .merge_into_workspace(&git, &snapshot, &message, real, auto)
            .await?;
        ws.base_commit = snapshot;

        tracing::info!(
            task_id = %ws.task_id,
            conflicts = real.len(),
            auto = auto.len(),
            "merged delivery snapshot into flat copy"
        );
        Ok(())
    }

    async fn cleanup(&self, ws: &WorkspaceHandle) -> Result<()> {
        if ws.path.exists() {
            tokio::fs::remove_dir_all(&ws.path).await?;
        }
        Ok(())
    }
}
