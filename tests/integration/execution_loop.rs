//! End-to-end runs of the execution loop.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use convoy::context::PRIMARY_SCAFFOLD;
use convoy::evidence::EvidenceStore;
use convoy::{
    EngineConfig, ExecutionContext, ExecutionLoop, Feedback, IsolationMode, Result, Task,
    TaskExecutor, TaskResult, TaskState, WorkspaceHandle,
};

use crate::common::{passed, write_file, Fixture, ScoreFn, ScriptedExecutor};

#[tokio::test]
async fn test_independent_tasks_land_in_one_round_with_flat_copies() {
    let config = EngineConfig::default().with_isolation_mode(IsolationMode::FlatCopy);
    let fixture = Fixture::new(config, &[("README.md", "project\n")]).await;

    let executor = Arc::new(ScriptedExecutor::new(|task, ws, _| {
        let file = format!("{}.txt", task.id.to_lowercase());
        write_file(&ws.path, &file, &format!("work of {}\n", task.id));
        passed(&[&file], 0.9)
    }));
    let engine = ExecutionLoop::new(
        Arc::clone(&fixture.ctx),
        executor.clone(),
        Arc::new(ScoreFn::constant(0.9)),
    )
    .without_evidence();

    let tasks = vec![Task::new("A"), Task::new("B"), Task::new("C")];
    let report = engine.run(tasks).await.expect("run");

    assert!(report.all_passed, "{:?}", report.tasks);
    assert_eq!(report.rounds, 1);
    for id in ["a", "b", "c"] {
        assert!(fixture.root().join(format!("{id}.txt")).exists(), "{id}.txt missing");
    }
    let a = report.task("A").expect("A");
    assert_eq!(a.files_modified, vec!["a.txt".to_string()]);
    assert!(fixture.git().status_porcelain().await.expect("status").is_empty());
}

#[tokio::test]
async fn test_dependent_task_sees_its_dependency_merged() {
    let fixture = Fixture::new(EngineConfig::default(), &[("README.md", "project\n")]).await;

    let executor = Arc::new(ScriptedExecutor::new(|task, ws, _| match task.id.as_str() {
        "schema" => {
            write_file(&ws.path, "schema.sql", "create table t (id int);\n");
            passed(&["schema.sql"], 0.95)
        }
        _ => {
            if !ws.path.join("schema.sql").exists() {
                return TaskResult::failure(vec!["schema.sql missing".to_string()]);
            }
            write_file(&ws.path, "api.py", "TABLE = 't'\n");
            passed(&["api.py"], 0.95)
        }
    }));
    let engine = ExecutionLoop::new(
        Arc::clone(&fixture.ctx),
        executor.clone(),
        Arc::new(ScoreFn::constant(0.95)),
    )
    .without_evidence();

    let tasks = vec![
        Task::new("api").with_depends_on(["schema"]),
        Task::new("schema"),
    ];
    let report = engine.run(tasks).await.expect("run");

    assert!(report.all_passed, "{:?}", report.tasks);
    assert_eq!(report.rounds, 1);
    assert_eq!(executor.order(), vec!["schema".to_string(), "api".to_string()]);
}

#[tokio::test]
async fn test_failed_task_is_retried_with_feedback_and_reported() {
    let config = EngineConfig::default().with_max_rounds(2);
    let fixture = Fixture::new(config, &[("README.md", "project\n")]).await;

    let executor = Arc::new(ScriptedExecutor::new(|_, ws, feedback| {
        write_file(&ws.path, "lib.py", "x = 1\n");
        let mut result = passed(&["lib.py"], 0.5);
        result.failure_files = vec!["lib.py".to_string()];
        if feedback.round > 1 {
            result.validation.score = 0.6;
        }
        result
    }));
    let engine = ExecutionLoop::new(
        Arc::clone(&fixture.ctx),
        executor.clone(),
        Arc::new(ScoreFn::constant(0.5)),
    )
    .without_evidence();

    let report = engine.run(vec![Task::new("T-1")]).await.expect("run");

    assert!(!report.all_passed);
    assert_eq!(report.rounds, 2);
    let t1 = report.task("T-1").expect("T-1");
    assert_eq!(t1.state, TaskState::Failed);
    assert_eq!(t1.score, Some(0.6));
    let reason = t1.failure_reason.as_deref().expect("reason");
    assert!(reason.contains("below threshold"), "{reason}");

    let feedback = executor.feedback_for("T-1");
    assert_eq!(feedback.len(), 2);
    assert!(feedback[0].is_empty());
    assert!(feedback[1]
        .failure_reason
        .as_deref()
        .is_some_and(|r| r.contains("below threshold")));
    assert!(feedback[1].regression_reason.is_none());
    assert_eq!(feedback[1].failure_files, vec!["lib.py".to_string()]);
    assert!(!fixture.root().join("lib.py").exists());
}

#[tokio::test]
async fn test_destructive_change_is_rejected_and_delivery_untouched() {
    let body: String = (0..200).map(|i| format!("line {i}\n")).collect();
    let config = EngineConfig::default().with_max_rounds(1);
    let fixture = Fixture::new(config, &[("big.py", body.as_str())]).await;

    let executor = Arc::new(ScriptedExecutor::new(|_, ws, _| {
        let truncated: String = (0..10).map(|i| format!("line {i}\n")).collect();
        write_file(&ws.path, "big.py", &truncated);
        passed(&["big.py"], 0.99)
    }));
    let engine = ExecutionLoop::new(
        Arc::clone(&fixture.ctx),
        executor,
        Arc::new(ScoreFn::constant(0.99)),
    )
    .without_evidence();

    let report = engine.run(vec![Task::new("T-1")]).await.expect("run");

    let t1 = report.task("T-1").expect("T-1");
    assert_eq!(t1.state, TaskState::Failed);
    let reason = t1.failure_reason.as_deref().expect("reason");
    assert!(reason.contains("destructive"), "{reason}");
    assert_eq!(fixture.read("big.py"), body);
}

/// Finishes `fast` immediately and never finishes `slow`.
struct SlowExecutor;

#[async_trait]
impl TaskExecutor for SlowExecutor {
    async fn execute(
        &self,
        task: &Task,
        workspace: &WorkspaceHandle,
        _feedback: &Feedback,
    ) -> Result<TaskResult> {
        if task.id == "slow" {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        write_file(&workspace.path, &format!("{}.txt", task.id), "done\n");
        Ok(TaskResult::success(
            vec![format!("{}.txt", task.id)],
            convoy::ValidationScore::new(0.9),
        ))
    }
}

#[tokio::test]
async fn test_batch_timeout_fails_only_unfinished_tasks() {
    let mut config = EngineConfig::default().with_max_rounds(1);
    config.batch_base_timeout_secs = 2;
    config.per_task_timeout_secs = 0;
    let fixture = Fixture::new(config, &[("README.md", "project\n")]).await;

    let engine = ExecutionLoop::new(
        Arc::clone(&fixture.ctx),
        Arc::new(SlowExecutor),
        Arc::new(ScoreFn::constant(0.9)),
    )
    .without_evidence();

    let report = engine
        .run(vec![Task::new("fast"), Task::new("slow")])
        .await
        .expect("run");

    assert_eq!(report.task("fast").expect("fast").state, TaskState::Passed);
    let slow = report.task("slow").expect("slow");
    assert_eq!(slow.state, TaskState::Failed);
    let reason = slow.failure_reason.as_deref().expect("reason");
    assert!(reason.contains("timed out"), "{reason}");
    assert!(fixture.root().join("fast.txt").exists());
    assert!(!fixture.root().join(".convoy/workspaces/slow-r1").exists());
}

#[tokio::test]
async fn test_run_is_journaled() {
    let fixture = Fixture::new(EngineConfig::default(), &[("README.md", "project\n")]).await;
    let executor = Arc::new(ScriptedExecutor::new(|_, ws, _| {
        write_file(&ws.path, "out.txt", "ok\n");
        passed(&["out.txt"], 0.9)
    }));
    let engine = ExecutionLoop::new(
        Arc::clone(&fixture.ctx),
        executor,
        Arc::new(ScoreFn::constant(0.9)),
    );

    let report = engine.run(vec![Task::new("T-1")]).await.expect("run");
    assert!(report.all_passed);

    let store = EvidenceStore::open(fixture.root(), 0).expect("store");
    let records = store.read_run(engine.run_id()).expect("records");
    let kinds: Vec<String> = records
        .iter()
        .map(|r| serde_json::to_value(r.kind).expect("kind").as_str().unwrap_or("").to_string())
        .collect();
    assert_eq!(kinds.first().map(String::as_str), Some("run_start"));
    assert_eq!(kinds.last().map(String::as_str), Some("run_complete"));
    assert!(kinds.iter().any(|k| k == "merge"));
    assert!(fixture.git().status_porcelain().await.expect("status").is_empty());
}

#[tokio::test]
async fn test_duplicate_task_ids_are_rejected() {
    let fixture = Fixture::new(EngineConfig::default(), &[("README.md", "project\n")]).await;
    let engine = ExecutionLoop::new(
        Arc::clone(&fixture.ctx),
        Arc::new(ScriptedExecutor::new(|_, _, _| passed(&[], 1.0))),
        Arc::new(ScoreFn::constant(1.0)),
    )
    .without_evidence();

    let result = engine.run(vec![Task::new("A"), Task::new("A")]).await;
    tokio_test::assert_err!(result);
}

/// Calls the rate-limited resource once per task and records how many tasks
/// overlapped. A task named `setup` initializes the primary scaffold when a
/// context is given.
#[derive(Default)]
struct MeteredExecutor {
    scaffold: Option<Arc<ExecutionContext>>,
    running: AtomicUsize,
    peak_running: AtomicUsize,
    in_resource: AtomicUsize,
    peak_in_resource: AtomicUsize,
    states: Mutex<Vec<TaskState>>,
}

impl MeteredExecutor {
    fn peak_running(&self) -> usize {
        self.peak_running.load(Ordering::SeqCst)
    }

    fn peak_in_resource(&self) -> usize {
        self.peak_in_resource.load(Ordering::SeqCst)
    }

    fn states(&self) -> Vec<TaskState> {
        self.states.lock().expect("states").clone()
    }
}

#[async_trait]
impl TaskExecutor for MeteredExecutor {
    async fn execute(
        &self,
        task: &Task,
        workspace: &WorkspaceHandle,
        _feedback: &Feedback,
    ) -> Result<TaskResult> {
        self.states.lock().expect("states").push(task.state);
        if let (Some(ctx), "setup") = (&self.scaffold, task.id.as_str()) {
            ctx.shared()
                .ensure_scaffold(PRIMARY_SCAFFOLD, || async { Ok(()) })
                .await?;
        }

        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_running.fetch_max(now, Ordering::SeqCst);
        let called = workspace
            .resources()
            .call(async {
                let inside = self.in_resource.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak_in_resource.fetch_max(inside, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(300)).await;
                self.in_resource.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        called?;

        let file = format!("{}.txt", task.id);
        write_file(&workspace.path, &file, "done\n");
        Ok(TaskResult::success(vec![file], convoy::ValidationScore::new(0.9)))
    }
}

#[tokio::test]
async fn test_rate_limited_calls_never_overlap_inside_a_parallel_batch() {
    let config = EngineConfig::default()
        .with_max_concurrent(1)
        .with_parallel_cap(3);
    let fixture = Fixture::new(config, &[("README.md", "project\n")]).await;
    let executor = Arc::new(MeteredExecutor::default());
    let engine = ExecutionLoop::new(
        Arc::clone(&fixture.ctx),
        executor.clone(),
        Arc::new(ScoreFn::constant(0.9)),
    )
    .without_evidence();

    let report = engine
        .run(vec![Task::new("A"), Task::new("B"), Task::new("C")])
        .await
        .expect("run");

    assert!(report.all_passed, "{:?}", report.tasks);
    assert_eq!(report.rounds, 1);
    assert_eq!(executor.peak_in_resource(), 1);
    if num_cpus::get() >= 2 {
        assert!(executor.peak_running() >= 2, "batch did not run concurrently");
    }
    assert_eq!(fixture.ctx.limiter().in_use().await, 0);
    assert_eq!(executor.states(), vec![TaskState::InProgress; 3]);
}

/// Runs `setup` and then two tasks depending on it; returns how many tasks
/// were ever inside the executor at once.
async fn peak_after_setup(initialize_scaffold: bool) -> usize {
    let config = EngineConfig::default().with_requires_scaffold(true);
    let fixture = Fixture::new(config, &[("README.md", "project\n")]).await;
    let executor = Arc::new(MeteredExecutor {
        scaffold: initialize_scaffold.then(|| Arc::clone(&fixture.ctx)),
        ..Default::default()
    });
    let engine = ExecutionLoop::new(
        Arc::clone(&fixture.ctx),
        executor.clone(),
        Arc::new(ScoreFn::constant(0.9)),
    )
    .without_evidence();

    let report = engine
        .run(vec![
            Task::new("setup"),
            Task::new("A").with_depends_on(["setup"]),
            Task::new("B").with_depends_on(["setup"]),
        ])
        .await
        .expect("run");

    assert!(report.all_passed, "{:?}", report.tasks);
    assert_eq!(report.rounds, 1);
    assert_eq!(
        fixture.ctx.shared().is_scaffold_ready(PRIMARY_SCAFFOLD).await,
        initialize_scaffold
    );
    executor.peak_running()
}

#[tokio::test]
async fn test_batches_stay_serial_while_scaffold_is_missing() {
    assert_eq!(peak_after_setup(false).await, 1);
}

#[tokio::test]
async fn test_batches_turn_parallel_once_scaffold_is_initialized() {
    let peak = peak_after_setup(true).await;
    if num_cpus::get() >= 2 {
        assert_eq!(peak, 2);
    } else {
        assert_eq!(peak, 1);
    }
}
