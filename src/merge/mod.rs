//! Lands a task's isolated commits on the delivery line.
//!
//! Per task the coordinator runs `attempting -> merged | conflicted`. A
//! conflict restores delivery to its pre-attempt head, resyncs the task's
//! workspace from delivery and hands the real conflicts to a callback. If the
//! callback produces a new commit the merge is attempted again, up to the
//! configured retry budget.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::config::{DriftPolicy, EngineConfig, MergeStrategy};
use crate::error::{EngineError, Result};
use crate::workspace::{
    Git, GitOutput, IsolationStrategy, MergeSource, PatternSet, WorkspaceHandle,
};

/// Terminal status of a merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStatus {
    Merged,
    /// The task had nothing delivery did not already contain.
    AlreadyUpToDate,
    /// Retry budget exhausted with real conflicts remaining.
    Conflicted,
}

/// Outcome of [`CherryPickCoordinator::merge`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeResult {
    pub success: bool,
    pub status: MergeStatus,
    /// Real conflicts of the last attempt.
    pub conflicts: Vec<String>,
    /// Generated files resolved by taking the task's side.
    pub auto_resolved: Vec<String>,
    pub message: String,
    /// Delivery head after the merge.
    pub commit: Option<String>,
    pub attempts: u32,
}

impl MergeResult {
    pub fn merged(commit: impl Into<String>, attempts: u32) -> Self {
        Self {
            success: true,
            status: MergeStatus::Merged,
            conflicts: Vec::new(),
            auto_resolved: Vec::new(),
            message: "merged".to_string(),
            commit: Some(commit.into()),
            attempts,
        }
    }

    pub fn up_to_date(commit: impl Into<String>, attempts: u32) -> Self {
        Self {
            status: MergeStatus::AlreadyUpToDate,
            message: "already up to date".to_string(),
            ..Self::merged(commit, attempts)
        }
    }

    pub fn exhausted(conflicts: Vec<String>, attempts: u32) -> Self {
        Self {
            success: false,
            status: MergeStatus::Conflicted,
            message: format!(
                "conflicts remain after {attempts} attempt(s): {}",
                conflicts.join(", ")
            ),
            conflicts,
            auto_resolved: Vec::new(),
            commit: None,
            attempts,
        }
    }

    /// The failure as an error, if the merge did not land.
    pub fn to_error(&self) -> Option<EngineError> {
        (!self.success).then(|| EngineError::merge_conflict(self.conflicts.clone()))
    }
}

/// Asked to resolve real conflicts inside the task's workspace.
#[async_trait]
pub trait ConflictCallback: Send + Sync {
    /// Resolve `conflicts` in `ws` and commit. Returns whether it did.
    async fn resolve(&self, ws: &WorkspaceHandle, conflicts: &[String]) -> Result<bool>;
}

enum Attempt {
    Landed { commit: String, auto: Vec<String> },
    UpToDate,
    Conflicted { real: Vec<String>, auto: Vec<String> },
}

/// Merges or cherry-picks task work onto the delivery line.
pub struct CherryPickCoordinator {
    isolation: Arc<dyn IsolationStrategy>,
    strategy: MergeStrategy,
    drift: DriftPolicy,
    auto_resolve: PatternSet,
    max_retries: u32,
}

impl CherryPickCoordinator {
    pub fn new(config: &EngineConfig, isolation: Arc<dyn IsolationStrategy>) -> Self {
        Self {
            isolation,
            strategy: config.merge_strategy,
            drift: config.drift_policy,
            auto_resolve: PatternSet::new(&config.auto_resolve_patterns),
            max_retries: config.max_cherry_pick_retries,
        }
    }

    fn delivery(&self) -> &Git {
        self.isolation.core().delivery()
    }

    fn delivery_branch(&self) -> &str {
        self.isolation.core().delivery_branch()
    }

    /// Land every commit of `ws` on delivery, retrying after conflict resolution.
    pub async fn merge(
        &self,
        ws: &mut WorkspaceHandle,
        callback: &dyn ConflictCallback,
    ) -> Result<MergeResult> {
        let mut attempts = 0;
        let mut auto_resolved = Vec::new();

        loop {
            attempts += 1;
            self.clean_delivery().await?;
            let pre_head = self.delivery().head().await?;

            let (real, auto) = match self.attempt(ws, &pre_head).await? {
                Attempt::Landed { commit, auto } => {
                    tracing::info!(task_id = %ws.task_id, commit = %commit, attempts, "task merged into delivery");
                    auto_resolved.extend(auto);
                    let mut result = MergeResult::merged(commit, attempts);
                    result.auto_resolved = auto_resolved;
                    return Ok(result);
                }
                Attempt::UpToDate => {
                    tracing::debug!(task_id = %ws.task_id, "nothing to merge");
                    return Ok(MergeResult::up_to_date(pre_head, attempts));
                }
                Attempt::Conflicted { real, auto } => (real, auto),
            };

            tracing::warn!(
                task_id = %ws.task_id,
                attempt = attempts,
                files = ?real,
                "merge conflicted; delivery restored"
            );
            auto_resolved.extend(auto.iter().cloned());

            if attempts > self.max_retries {
                return Ok(MergeResult::exhausted(real, attempts));
            }

            self.reset_delivery_for_retry(ws, &real, &auto).await?;
            let before = self.isolation.head(ws).await?;
            let resolved = match callback.resolve(ws, &real).await {
                Ok(resolved) => resolved,
                Err(err) => {
                    tracing::warn!(task_id = %ws.task_id, error = %err, "conflict resolution failed");
                    false
                }
            };
            let after = self.isolation.head(ws).await?;
            if !resolved || after == before {
                tracing::info!(task_id = %ws.task_id, resolved, "no new commit after conflict callback");
                return Ok(MergeResult::exhausted(real, attempts));
            }
        }
    }

    /// Resync the task workspace from delivery before a retry.
    pub async fn reset_delivery_for_retry(
        &self,
        ws: &mut WorkspaceHandle,
        real: &[String],
        auto: &[String],
    ) -> Result<()> {
        self.clean_delivery().await?;
        self.isolation.resync_for_retry(ws, real, auto).await
    }

    /// Abort stuck operations and deal with uncommitted drift on delivery.
    pub async fn clean_delivery(&self) -> Result<()> {
        let delivery = self.delivery();
        if delivery.is_merging().await? {
            tracing::warn!("aborting stale merge on delivery");
            delivery.merge_abort().await?;
        }
        if delivery.is_cherry_picking().await? {
            tracing::warn!("aborting stale cherry-pick on delivery");
            delivery.cherry_pick_abort().await?;
        }

        let current = delivery
            .run(&["symbolic-ref", "--short", "-q", "HEAD"])
            .await?;
        if current.stdout.trim() != self.delivery_branch() {
            delivery
                .check(&["checkout", "-q", "-f", self.delivery_branch()])
                .await?;
        }

        if !delivery.conflicted_files().await?.is_empty() {
            delivery.reset_hard("HEAD").await?;
        }
        if delivery.status_porcelain().await?.is_empty() {
            return Ok(());
        }
        match self.drift {
            DriftPolicy::AutoCommit => {
                delivery.add_all().await?;
                delivery
                    .commit_staged("convoy: commit uncommitted changes on delivery")
                    .await?;
                tracing::info!("committed drift on delivery");
            }
            DriftPolicy::HardReset => {
                delivery.reset_hard("HEAD").await?;
                delivery.clean().await?;
                tracing::info!("discarded drift on delivery");
            }
        }
        Ok(())
    }

    async fn attempt(&self, ws: &WorkspaceHandle, pre_head: &str) -> Result<Attempt> {
        match (self.isolation.merge_source(ws), self.strategy) {
            (MergeSource::Branch(branch), MergeStrategy::MergeNoFf) => {
                self.attempt_merge(ws, &branch, pre_head).await
            }
            (MergeSource::Branch(branch), MergeStrategy::CherryPick) => {
                self.attempt_cherry_pick(&branch, pre_head).await
            }
            (MergeSource::Patch { base, .. }, _) => self.attempt_patch(ws, &base, pre_head).await,
        }
    }

    async fn attempt_merge(
        &self,
        ws: &WorkspaceHandle,
        branch: &str,
        pre_head: &str,
    ) -> Result<Attempt> {
        let delivery = self.delivery();
        let message = format!("convoy: merge {} (round {})", ws.task_id, ws.round);
        let output = delivery.merge_no_ff(branch, &message).await?;
        if output.success {
            if output.already_up_to_date() {
                return Ok(Attempt::UpToDate);
            }
            return Ok(Attempt::Landed {
                commit: delivery.head().await?,
                auto: Vec::new(),
            });
        }

        let Some((real, auto)) = self.split_conflicts(&output, pre_head).await? else {
            return Err(git_failure("merge", &output));
        };
        if real.is_empty() {
            self.take_incoming(&auto).await?;
            delivery
                .check(&["commit", "-q", "--no-verify", "--no-edit"])
                .await?;
            return Ok(Attempt::Landed {
                commit: delivery.head().await?,
                auto,
            });
        }

        delivery.merge_abort().await?;
        self.restore(pre_head).await?;
        Ok(Attempt::Conflicted { real, auto })
    }

    async fn attempt_cherry_pick(&self, branch: &str, pre_head: &str) -> Result<Attempt> {
        let delivery = self.delivery();
        let mut auto_seen = Vec::new();

        for (commit, mainline) in self.pick_sequence(branch).await? {
            let output = delivery.cherry_pick(&commit, mainline).await?;
            if output.success {
                continue;
            }

            let conflicts = delivery.conflicted_files().await?;
            if conflicts.is_empty() {
                if delivery.is_cherry_picking().await? && output.nothing_to_commit() {
                    tracing::debug!(commit = %commit, "skipping empty cherry-pick");
                    delivery.cherry_pick_skip().await?;
                    continue;
                }
                delivery.cherry_pick_abort().await?;
                self.restore(pre_head).await?;
                return Err(git_failure("cherry-pick", &output));
            }

            let (real, auto) = self.partition(conflicts);
            if !real.is_empty() {
                delivery.cherry_pick_abort().await?;
                self.restore(pre_head).await?;
                auto_seen.extend(auto);
                return Ok(Attempt::Conflicted {
                    real,
                    auto: auto_seen,
                });
            }

            self.take_incoming(&auto).await?;
            auto_seen.extend(auto);
            if delivery.run(&["diff", "--cached", "--quiet"]).await?.success {
                delivery.cherry_pick_skip().await?;
            } else {
                delivery.cherry_pick_continue().await?;
            }
        }

        let head = delivery.head().await?;
        if head == pre_head {
            Ok(Attempt::UpToDate)
        } else {
            Ok(Attempt::Landed {
                commit: head,
                auto: auto_seen,
            })
        }
    }

    async fn attempt_patch(
        &self,
        ws: &WorkspaceHandle,
        base: &str,
        pre_head: &str,
    ) -> Result<Attempt> {
        let delivery = self.delivery();
        let diff = ws.git().run(&["diff", "--binary", base, "HEAD"]).await?;
        if !diff.success {
            return Err(git_failure("diff", &diff));
        }
        if diff.stdout.trim().is_empty() {
            return Ok(Attempt::UpToDate);
        }

        let patch_path = ws.git().git_path("convoy.patch").await?;
        tokio::fs::write(&patch_path, diff.stdout.as_bytes()).await?;
        let patch_arg = patch_path.to_string_lossy().into_owned();
        let output = delivery.run(&["apply", "--3way", &patch_arg]).await?;
        let _ = tokio::fs::remove_file(&patch_path).await;

        let message = format!("convoy: apply {} (round {})", ws.task_id, ws.round);
        if output.success {
            delivery.add_all().await?;
            if !delivery.commit_staged(&message).await? {
                return Ok(Attempt::UpToDate);
            }
            return Ok(Attempt::Landed {
                commit: delivery.head().await?,
                auto: Vec::new(),
            });
        }

        let conflicts = delivery.conflicted_files().await?;
        if conflicts.is_empty() {
            self.restore(pre_head).await?;
            return Err(git_failure("apply --3way", &output));
        }
        let (real, auto) = self.partition(conflicts);
        if real.is_empty() {
            self.take_incoming(&auto).await?;
            delivery.add_all().await?;
            delivery.commit_staged(&message).await?;
            return Ok(Attempt::Landed {
                commit: delivery.head().await?,
                auto,
            });
        }

        self.restore(pre_head).await?;
        Ok(Attempt::Conflicted { real, auto })
    }

    /// Commits to replay for `branch`, oldest first, with the mainline parent
    /// to use for merge commits.
    async fn pick_sequence(&self, branch: &str) -> Result<Vec<(String, Option<u32>)>> {
        let range = format!("{}..{}", self.delivery_branch(), branch);
        let listing = self
            .delivery()
            .check(&["rev-list", "--reverse", "--first-parent", "--parents", &range])
            .await?;
        Ok(pick_sequence_from(&listing))
    }

    async fn split_conflicts(
        &self,
        output: &GitOutput,
        pre_head: &str,
    ) -> Result<Option<(Vec<String>, Vec<String>)>> {
        let conflicts = self.delivery().conflicted_files().await?;
        if conflicts.is_empty() {
            tracing::debug!(conflict_reported = output.mentions_conflict(), "merge failed without unmerged paths");
            self.delivery().merge_abort().await?;
            self.restore(pre_head).await?;
            return Ok(None);
        }
        Ok(Some(self.partition(conflicts)))
    }

    fn partition(&self, conflicts: Vec<String>) -> (Vec<String>, Vec<String>) {
        conflicts
            .into_iter()
            .partition(|path| !self.auto_resolve.matches(path))
    }

    /// Resolve generated files in favour of the incoming task side.
    async fn take_incoming(&self, files: &[String]) -> Result<()> {
        let delivery = self.delivery();
        for path in files {
            let picked = delivery.checkout_side("--theirs", path).await?;
            if picked.success {
                delivery.check(&["add", "--", path]).await?;
            } else {
                delivery.check(&["rm", "-q", "-f", "--", path]).await?;
            }
            tracing::debug!(path = %path, "auto-resolved generated file");
        }
        Ok(())
    }

    /// Put delivery back exactly where it was before the attempt.
    async fn restore(&self, pre_head: &str) -> Result<()> {
        self.delivery().reset_hard(pre_head).await?;
        self.delivery().clean().await
    }
}

fn git_failure(command: &str, output: &GitOutput) -> EngineError {
    EngineError::Git {
        command: command.to_string(),
        stderr: output.stderr.trim().to_string(),
    }
}

/// Build the replay sequence from `rev-list --reverse --first-parent --parents`.
///
/// When the branch contains a sync merge, the last one is replayed against its
/// second parent (the delivery side) so the task's whole delta lands, followed
/// by the commits made after it.
fn pick_sequence_from(listing: &str) -> Vec<(String, Option<u32>)> {
    let entries: Vec<Vec<&str>> = listing
        .lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>())
        .filter(|parts| !parts.is_empty())
        .collect();

    let last_merge = entries.iter().rposition(|parts| parts.len() > 2);
    match last_merge {
        Some(index) => entries[index..]
            .iter()
            .enumerate()
            .map(|(offset, parts)| {
                let mainline = (offset == 0).then_some(2);
                (parts[0].to_string(), mainline)
            })
            .collect(),
        None => entries
            .iter()
            .map(|parts| (parts[0].to_string(), None))
            .collect(),
    }
}
