//! Shared fixtures: a delivery repository and scripted task doubles.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use convoy::workspace::Git;
use convoy::{
    EngineConfig, ExecutionContext, Feedback, Result, Task, TaskExecutor, TaskResult,
    TaskValidator, ValidationScore, WorkspaceHandle,
};
use tempfile::TempDir;
use walkdir::WalkDir;

/// A delivery repository on `main` with an initial commit.
pub struct Fixture {
    pub dir: TempDir,
    pub ctx: Arc<ExecutionContext>,
}

impl Fixture {
    pub async fn new(config: EngineConfig, files: &[(&str, &str)]) -> Self {
        let dir = TempDir::new().expect("temp dir");
        let ctx = Arc::new(ExecutionContext::new(config, dir.path()).expect("context"));
        let fixture = Self { dir, ctx };
        fixture.git().init("main").await.expect("git init");
        fixture.commit_on_delivery(files, "initial").await;
        fixture
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn git(&self) -> Git {
        Git::new(
            self.root(),
            self.ctx.repo_locks().lock_for(self.root()),
            Duration::from_secs(30),
        )
    }

    pub async fn commit_on_delivery(&self, files: &[(&str, &str)], message: &str) {
        for (path, content) in files {
            write_file(self.root(), path, content);
        }
        let git = self.git();
        git.add_all().await.expect("git add");
        assert!(git.commit_staged(message).await.expect("git commit"));
    }

    pub fn read(&self, path: &str) -> String {
        std::fs::read_to_string(self.root().join(path)).expect("read delivery file")
    }

    /// Every file of the delivery checkout except git and engine state.
    pub fn snapshot(&self) -> BTreeMap<String, Vec<u8>> {
        WalkDir::new(self.root())
            .into_iter()
            .filter_entry(|entry| {
                let name = entry.file_name().to_string_lossy();
                name != ".git" && name != ".convoy"
            })
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| {
                let rel = entry
                    .path()
                    .strip_prefix(self.root())
                    .expect("under root")
                    .to_string_lossy()
                    .into_owned();
                let bytes = std::fs::read(entry.path()).expect("read");
                (rel, bytes)
            })
            .collect()
    }
}

pub fn write_file(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("mkdir");
    }
    std::fs::write(path, content).expect("write");
}

pub fn append_file(root: &Path, rel: &str, content: &str) {
    let mut current = std::fs::read_to_string(root.join(rel)).unwrap_or_default();
    current.push_str(content);
    write_file(root, rel, &current);
}

type Script = dyn Fn(&Task, &WorkspaceHandle, &Feedback) -> TaskResult + Send + Sync;

/// Executor running a synchronous script and logging every call.
pub struct ScriptedExecutor {
    script: Box<Script>,
    calls: Mutex<Vec<(String, Feedback)>>,
}

impl ScriptedExecutor {
    pub fn new<F>(script: F) -> Self
    where
        F: Fn(&Task, &WorkspaceHandle, &Feedback) -> TaskResult + Send + Sync + 'static,
    {
        Self {
            script: Box::new(script),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Feedback passed to each execution of `task_id`, in order.
    pub fn feedback_for(&self, task_id: &str) -> Vec<Feedback> {
        self.calls
            .lock()
            .expect("calls")
            .iter()
            .filter(|(id, _)| id == task_id)
            .map(|(_, feedback)| feedback.clone())
            .collect()
    }

    pub fn order(&self) -> Vec<String> {
        self.calls
            .lock()
            .expect("calls")
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }
}

#[async_trait]
impl TaskExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        task: &Task,
        workspace: &WorkspaceHandle,
        feedback: &Feedback,
    ) -> Result<TaskResult> {
        self.calls
            .lock()
            .expect("calls")
            .push((task.id.clone(), feedback.clone()));
        Ok((self.script)(task, workspace, feedback))
    }
}

type Judge = dyn Fn(&Task, &Path) -> f64 + Send + Sync;

/// Validator scoring tasks from the delivery tree.
pub struct ScoreFn(Box<Judge>);

impl ScoreFn {
    pub fn new<F>(judge: F) -> Self
    where
        F: Fn(&Task, &Path) -> f64 + Send + Sync + 'static,
    {
        Self(Box::new(judge))
    }

    pub fn constant(score: f64) -> Self {
        Self::new(move |_, _| score)
    }
}

#[async_trait]
impl TaskValidator for ScoreFn {
    async fn validate(&self, task: &Task, root: &Path) -> Result<ValidationScore> {
        Ok(ValidationScore::new((self.0)(task, root)))
    }
}

pub fn passed(files: &[&str], score: f64) -> TaskResult {
    TaskResult::success(
        files.iter().map(|f| f.to_string()).collect(),
        ValidationScore::new(score),
    )
}
