//! Conflict handling on the delivery line.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use convoy::workspace::{FlatCopyIsolation, WorktreeIsolation};
use convoy::{
    CherryPickCoordinator, ConflictCallback, EngineConfig, IsolationMode, IsolationStrategy,
    MergeStatus, MergeStrategy, Result, WorkspaceHandle,
};

use crate::common::{write_file, Fixture};

struct NoResolution;

#[async_trait]
impl ConflictCallback for NoResolution {
    async fn resolve(&self, _ws: &WorkspaceHandle, _conflicts: &[String]) -> Result<bool> {
        Ok(false)
    }
}

/// Writes a merged version of every conflicting file and commits it.
struct RecordingResolver {
    calls: Mutex<Vec<Vec<String>>>,
}

impl RecordingResolver {
    fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().expect("calls").clone()
    }
}

#[async_trait]
impl ConflictCallback for RecordingResolver {
    async fn resolve(&self, ws: &WorkspaceHandle, conflicts: &[String]) -> Result<bool> {
        self.calls.lock().expect("calls").push(conflicts.to_vec());
        for file in conflicts {
            write_file(&ws.path, file, "a = 'merged'\n");
        }
        ws.git().add_all().await?;
        ws.git().commit_staged("resolve conflicts").await
    }
}

fn isolation(fixture: &Fixture) -> Arc<dyn IsolationStrategy> {
    match fixture.ctx.config().isolation_mode {
        IsolationMode::Worktree => Arc::new(WorktreeIsolation::new(Arc::clone(&fixture.ctx))),
        IsolationMode::FlatCopy => Arc::new(FlatCopyIsolation::new(Arc::clone(&fixture.ctx))),
    }
}

async fn assert_conflict_restores_delivery(config: EngineConfig) {
    let fixture = Fixture::new(config, &[("app.py", "a = 0\n"), ("README.md", "docs\n")]).await;
    let isolation = isolation(&fixture);
    let coordinator = CherryPickCoordinator::new(fixture.ctx.config(), Arc::clone(&isolation));

    let mut ws = isolation.create("X", 1).await.expect("create");
    write_file(&ws.path, "app.py", "a = 'task'\n");
    isolation.commit(&ws, "task edit").await.expect("commit");

    fixture
        .commit_on_delivery(&[("app.py", "a = 'main'\n")], "main edit")
        .await;
    let before = fixture.snapshot();
    let head_before = fixture.git().head().await.expect("head");

    let result = coordinator.merge(&mut ws, &NoResolution).await.expect("merge");

    assert!(!result.success);
    assert_eq!(result.status, MergeStatus::Conflicted);
    assert_eq!(result.conflicts, vec!["app.py".to_string()]);
    assert_eq!(fixture.snapshot(), before);
    assert_eq!(fixture.git().head().await.expect("head"), head_before);
    assert!(!fixture.git().is_merging().await.expect("merging"));
    assert!(!fixture.git().is_cherry_picking().await.expect("picking"));
    assert!(fixture.git().status_porcelain().await.expect("status").is_empty());
}

#[tokio::test]
async fn test_conflicting_merge_leaves_delivery_byte_identical() {
    assert_conflict_restores_delivery(EngineConfig::default()).await;
}

#[tokio::test]
async fn test_conflicting_cherry_pick_leaves_delivery_byte_identical() {
    assert_conflict_restores_delivery(
        EngineConfig::default().with_merge_strategy(MergeStrategy::CherryPick),
    )
    .await;
}

#[tokio::test]
async fn test_conflicting_flat_copy_patch_leaves_delivery_byte_identical() {
    assert_conflict_restores_delivery(
        EngineConfig::default().with_isolation_mode(IsolationMode::FlatCopy),
    )
    .await;
}

async fn assert_generated_conflict_is_auto_resolved(config: EngineConfig) {
    let config = config.with_auto_resolve_patterns(vec!["config.json".to_string()]);
    let fixture = Fixture::new(
        config,
        &[
            ("config.json", "{\"v\": 0}\n"),
            ("app.py", "a = 0\n"),
            ("notes.md", "n0\n"),
        ],
    )
    .await;
    let isolation = isolation(&fixture);
    let coordinator = CherryPickCoordinator::new(fixture.ctx.config(), Arc::clone(&isolation));

    let mut ws = isolation.create("X", 1).await.expect("create");
    write_file(&ws.path, "config.json", "{\"v\": \"task\"}\n");
    write_file(&ws.path, "app.py", "a = 'task'\n");
    write_file(&ws.path, "notes.md", "n1\n");
    isolation.commit(&ws, "task edit").await.expect("commit");

    fixture
        .commit_on_delivery(
            &[("config.json", "{\"v\": \"main\"}\n"), ("app.py", "a = 'main'\n")],
            "main edit",
        )
        .await;

    let resolver = RecordingResolver::new();
    let result = coordinator.merge(&mut ws, &resolver).await.expect("merge");

    assert!(result.success, "{}", result.message);
    assert_eq!(result.status, MergeStatus::Merged);
    assert_eq!(result.attempts, 2);
    assert_eq!(resolver.calls(), vec![vec!["app.py".to_string()]]);
    assert!(result.auto_resolved.contains(&"config.json".to_string()));
    assert_eq!(fixture.read("app.py"), "a = 'merged'\n");
    assert_eq!(fixture.read("config.json"), "{\"v\": \"task\"}\n");
    assert_eq!(fixture.read("notes.md"), "n1\n");
    assert!(fixture.git().status_porcelain().await.expect("status").is_empty());
}

#[tokio::test]
async fn test_generated_conflict_resolved_and_real_conflict_retried_with_merge() {
    assert_generated_conflict_is_auto_resolved(
        EngineConfig::default().with_merge_strategy(MergeStrategy::MergeNoFf),
    )
    .await;
}

#[tokio::test]
async fn test_generated_conflict_resolved_and_real_conflict_retried_with_cherry_pick() {
    assert_generated_conflict_is_auto_resolved(
        EngineConfig::default().with_merge_strategy(MergeStrategy::CherryPick),
    )
    .await;
}

#[tokio::test]
async fn test_generated_conflict_resolved_and_real_conflict_retried_with_flat_copy() {
    assert_generated_conflict_is_auto_resolved(
        EngineConfig::default().with_isolation_mode(IsolationMode::FlatCopy),
    )
    .await;
}

#[tokio::test]
async fn test_retry_budget_is_enforced() {
    let config = EngineConfig::default().with_max_cherry_pick_retries(0);
    let fixture = Fixture::new(config, &[("app.py", "a = 0\n")]).await;
    let isolation = isolation(&fixture);
    let coordinator = CherryPickCoordinator::new(fixture.ctx.config(), Arc::clone(&isolation));

    let mut ws = isolation.create("X", 1).await.expect("create");
    write_file(&ws.path, "app.py", "a = 'task'\n");
    isolation.commit(&ws, "task edit").await.expect("commit");
    fixture
        .commit_on_delivery(&[("app.py", "a = 'main'\n")], "main edit")
        .await;

    let resolver = RecordingResolver::new();
    let result = coordinator.merge(&mut ws, &resolver).await.expect("merge");
    assert!(!result.success);
    assert_eq!(result.attempts, 1);
    assert!(resolver.calls().is_empty());
    assert!(result.to_error().is_some());
}

#[tokio::test]
async fn test_drift_on_delivery_is_committed_before_merge() {
    let fixture = Fixture::new(EngineConfig::default(), &[("app.py", "a = 0\n")]).await;
    let isolation = isolation(&fixture);
    let coordinator = CherryPickCoordinator::new(fixture.ctx.config(), Arc::clone(&isolation));

    let mut ws = isolation.create("X", 1).await.expect("create");
    write_file(&ws.path, "feature.py", "f = 1\n");
    isolation.commit(&ws, "feature").await.expect("commit");

    write_file(fixture.root(), "notes.txt", "left behind\n");
    let result = coordinator.merge(&mut ws, &NoResolution).await.expect("merge");

    assert!(result.success);
    assert!(fixture.root().join("feature.py").exists());
    assert_eq!(fixture.read("notes.txt"), "left behind\n");
    assert!(fixture.git().status_porcelain().await.expect("status").is_empty());
}
