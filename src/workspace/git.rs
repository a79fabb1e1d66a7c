//! Thin async wrapper over the `git` binary.
//!
//! Every invocation against one physical repository goes through the same
//! lock, so worktrees of one repository never run git concurrently.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::Mutex;

use crate::error::{EngineError, Result};

const COMMITTER_NAME: &str = "convoy";
const COMMITTER_EMAIL: &str = "convoy@localhost";

/// Captured result of one git invocation.
#[derive(Debug, Clone)]
pub struct GitOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    /// Whether git reported a content conflict.
    pub fn mentions_conflict(&self) -> bool {
        self.stdout.contains("CONFLICT")
            || self.stderr.contains("CONFLICT")
            || self.stderr.contains("Automatic merge failed")
            || self.stderr.contains("could not apply")
            || self.stderr.contains("with conflicts")
    }

    /// Whether a merge found nothing to do.
    pub fn already_up_to_date(&self) -> bool {
        self.stdout.contains("Already up to date") || self.stdout.contains("Already up-to-date")
    }

    /// Whether a commit or cherry-pick produced no change.
    pub fn nothing_to_commit(&self) -> bool {
        let text = format!("{}{}", self.stdout, self.stderr);
        text.contains("nothing to commit")
            || text.contains("nothing added to commit")
            || text.contains("previous cherry-pick is now empty")
    }
}

/// Git handle bound to one working directory.
#[derive(Debug, Clone)]
pub struct Git {
    dir: PathBuf,
    lock: Arc<Mutex<()>>,
    timeout: Duration,
}

impl Git {
    /// Create a handle for `dir`. `lock` must be the lock of the repository
    /// that owns `dir`.
    pub fn new(dir: impl Into<PathBuf>, lock: Arc<Mutex<()>>, timeout: Duration) -> Self {
        Self {
            dir: dir.into(),
            lock,
            timeout,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Same repository lock, different working directory.
    pub fn at(&self, dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            lock: Arc::clone(&self.lock),
            timeout: self.timeout,
        }
    }

    /// Run git and capture its output. A non-zero exit is not an error here.
    pub async fn run(&self, args: &[&str]) -> Result<GitOutput> {
        let mut cmd = Command::new("git");
        cmd.arg("-c")
            .arg(format!("user.name={COMMITTER_NAME}"))
            .arg("-c")
            .arg(format!("user.email={COMMITTER_EMAIL}"))
            .args(["-c", "commit.gpgsign=false", "-c", "core.quotepath=false"])
            .args(args)
            .current_dir(&self.dir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("GIT_EDITOR", "true")
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let _guard = self.lock.lock().await;
        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| EngineError::GitTimeout {
                command: args.join(" "),
                timeout: self.timeout,
            })??;

        Ok(GitOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Run git and fail on a non-zero exit. Returns trimmed stdout.
    pub async fn check(&self, args: &[&str]) -> Result<String> {
        let output = self.run(args).await?;
        if output.success {
            Ok(output.stdout.trim().to_string())
        } else {
            Err(EngineError::Git {
                command: args.join(" "),
                stderr: output.stderr.trim().to_string(),
            })
        }
    }

    /// `git init` with `branch` as the initial branch.
    pub async fn init(&self, branch: &str) -> Result<()> {
        self.check(&["init", "-q"]).await?;
        self.check(&["symbolic-ref", "HEAD", &format!("refs/heads/{branch}")])
            .await?;
        Ok(())
    }

    pub async fn head(&self) -> Result<String> {
        self.check(&["rev-parse", "HEAD"]).await
    }

    /// Resolve `rev` to a commit id, or `None` if it does not exist.
    pub async fn resolve(&self, rev: &str) -> Result<Option<String>> {
        let output = self
            .run(&["rev-parse", "-q", "--verify", &format!("{rev}^{{commit}}")])
            .await?;
        Ok(output.success.then(|| output.stdout.trim().to_string()))
    }

    pub async fn create_branch(&self, name: &str, start: &str) -> Result<()> {
        self.check(&["branch", "-f", name, start]).await.map(|_| ())
    }

    pub async fn delete_branch(&self, name: &str) -> Result<()> {
        self.check(&["branch", "-D", name]).await.map(|_| ())
    }

    pub async fn add_all(&self) -> Result<()> {
        self.check(&["add", "-A"]).await.map(|_| ())
    }

    /// Commit whatever is staged. Returns `false` when there was nothing to commit.
    pub async fn commit_staged(&self, message: &str) -> Result<bool> {
        let staged = self.run(&["diff", "--cached", "--quiet"]).await?;
        if staged.success {
            return Ok(false);
        }
        self.check(&["commit", "-q", "--no-verify", "-m", message])
            .await?;
        Ok(true)
    }

    /// Porcelain status lines, empty when the tree is clean.
    pub async fn status_porcelain(&self) -> Result<Vec<String>> {
        let out = self
            .check(&["status", "--porcelain", "--untracked-files=all"])
            .await?;
        Ok(out.lines().map(str::to_string).collect())
    }

    pub async fn merge_no_ff(&self, rev: &str, message: &str) -> Result<GitOutput> {
        self.run(&["merge", "--no-ff", "--no-edit", "-m", message, rev])
            .await
    }

    pub async fn merge_abort(&self) -> Result<()> {
        self.run(&["merge", "--abort"]).await.map(|_| ())
    }

    /// Cherry-pick one commit; `mainline` selects the parent for merge commits.
    pub async fn cherry_pick(&self, commit: &str, mainline: Option<u32>) -> Result<GitOutput> {
        match mainline {
            Some(parent) => {
                let parent = parent.to_string();
                self.run(&["cherry-pick", "-m", &parent, commit]).await
            }
            None => self.run(&["cherry-pick", commit]).await,
        }
    }

    pub async fn cherry_pick_abort(&self) -> Result<()> {
        self.run(&["cherry-pick", "--abort"]).await.map(|_| ())
    }

    pub async fn cherry_pick_skip(&self) -> Result<()> {
        self.check(&["cherry-pick", "--skip"]).await.map(|_| ())
    }

    pub async fn cherry_pick_continue(&self) -> Result<()> {
        self.check(&["cherry-pick", "--continue"]).await.map(|_| ())
    }

    pub async fn worktree_add(&self, path: &Path, branch: &str) -> Result<()> {
        let path = path.to_string_lossy();
        self.check(&["worktree", "add", "-q", "-f", &path, branch])
            .await
            .map(|_| ())
    }

    pub async fn worktree_remove(&self, path: &Path) -> Result<()> {
        let path = path.to_string_lossy();
        self.check(&["worktree", "remove", "--force", &path])
            .await
            .map(|_| ())
    }

    pub async fn worktree_prune(&self) -> Result<()> {
        self.check(&["worktree", "prune"]).await.map(|_| ())
    }

    pub async fn reset_hard(&self, rev: &str) -> Result<()> {
        self.check(&["reset", "-q", "--hard", rev]).await.map(|_| ())
    }

    /// Remove untracked files and directories (ignored files are kept).
    pub async fn clean(&self) -> Result<()> {
        self.check(&["clean", "-q", "-fd"]).await.map(|_| ())
    }

    /// Check out one side (`--ours` / `--theirs`) of a conflicted path.
    pub async fn checkout_side(&self, side: &str, path: &str) -> Result<GitOutput> {
        self.run(&["checkout", side, "--", path]).await
    }

    /// Check out `path` as it is in `rev`.
    pub async fn checkout_path(&self, rev: &str, path: &str) -> Result<()> {
        self.check(&["checkout", rev, "--", path]).await.map(|_| ())
    }

    /// Paths with unmerged index entries.
    pub async fn conflicted_files(&self) -> Result<Vec<String>> {
        let out = self
            .check(&["diff", "--name-only", "--diff-filter=U"])
            .await?;
        let mut files: Vec<String> = out.lines().map(str::to_string).collect();
        files.sort();
        files.dedup();
        Ok(files)
    }

    /// Whether a merge is in progress.
    pub async fn is_merging(&self) -> Result<bool> {
        Ok(self.resolve("MERGE_HEAD").await?.is_some())
    }

    /// Whether a cherry-pick is in progress.
    pub async fn is_cherry_picking(&self) -> Result<bool> {
        Ok(self.resolve("CHERRY_PICK_HEAD").await?.is_some())
    }

    /// Resolve a path inside the git dir, e.g. `info/exclude`.
    pub async fn git_path(&self, name: &str) -> Result<PathBuf> {
        let out = self.check(&["rev-parse", "--git-path", name]).await?;
        let path = PathBuf::from(out);
        Ok(if path.is_absolute() {
            path
        } else {
            self.dir.join(path)
        })
    }

    /// Add `pattern` to `info/exclude` unless it is already there.
    pub async fn ensure_excluded(&self, pattern: &str) -> Result<()> {
        let exclude = self.git_path("info/exclude").await?;
        let existing = tokio::fs::read_to_string(&exclude).await.unwrap_or_default();
        if existing.lines().any(|line| line.trim() == pattern) {
            return Ok(());
        }
        if let Some(parent) = exclude.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut content = existing;
        if !content.is_empty() && !content.ends_with('\n') {
            content.push('\n');
        }
        content.push_str(pattern);
        content.push('\n');
        tokio::fs::write(&exclude, content).await?;
        Ok(())
    }
}
