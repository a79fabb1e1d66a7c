//! Cross-round regression detection through the execution loop.

use std::sync::Arc;

use convoy::{EngineConfig, ExecutionLoop, Task, TaskResult, TaskState};

use crate::common::{append_file, passed, Fixture, ScoreFn, ScriptedExecutor};

#[tokio::test]
async fn test_later_change_to_shared_file_demotes_and_reruns_earlier_task() {
    let config = EngineConfig::default().with_max_rounds(3);
    let fixture = Fixture::new(config, &[("shared.py", "# shared helpers\n")]).await;

    let executor = Arc::new(ScriptedExecutor::new(|task, ws, feedback| {
        match task.id.as_str() {
            "A" if feedback.regression_reason.is_none() => {
                append_file(&ws.path, "shared.py", "def a():\n    return 1\n");
                passed(&["shared.py"], 0.95)
            }
            "A" => {
                append_file(&ws.path, "shared.py", "# fixed after regression\n");
                passed(&["shared.py"], 0.95)
            }
            _ if feedback.round == 1 => TaskResult::failure(vec!["tool crashed".to_string()]),
            _ => {
                append_file(&ws.path, "shared.py", "def b():\n    return 2\n");
                passed(&["shared.py"], 0.9)
            }
        }
    }));
    let validator = ScoreFn::new(|task, root| {
        let shared = std::fs::read_to_string(root.join("shared.py")).unwrap_or_default();
        match task.id.as_str() {
            "A" if shared.contains("def b") && !shared.contains("fixed") => 0.5,
            "A" => 0.95,
            _ => 0.9,
        }
    });
    let engine = ExecutionLoop::new(Arc::clone(&fixture.ctx), executor.clone(), Arc::new(validator))
        .without_evidence();

    let tasks = vec![
        Task::new("A").with_target_files(["shared.py"]),
        Task::new("B").with_target_files(["shared.py"]),
    ];
    let report = engine.run(tasks).await.expect("run");

    assert_eq!(report.regressions.len(), 1);
    let finding = &report.regressions[0];
    assert_eq!(finding.task_id, "A");
    assert_eq!(finding.previous_score, 0.95);
    assert_eq!(finding.current_score, 0.5);
    assert!(finding.reason.contains("shared.py"), "{}", finding.reason);

    let a_runs = executor.feedback_for("A");
    assert_eq!(a_runs.len(), 2);
    assert_eq!(a_runs[1].round, 3);
    let reason = a_runs[1].regression_reason.as_deref().expect("regression feedback");
    assert!(reason.contains("0.95 -> 0.50"), "{reason}");

    assert!(report.all_passed, "{:?}", report.tasks);
    assert_eq!(report.rounds, 3);
    assert_eq!(report.task("A").expect("A").state, TaskState::Passed);
    let shared = fixture.read("shared.py");
    assert!(shared.contains("def a") && shared.contains("def b") && shared.contains("fixed"));
}

#[tokio::test]
async fn test_final_sweep_catches_regression_left_by_last_round() {
    let config = EngineConfig::default().with_max_rounds(1);
    let fixture = Fixture::new(config, &[("shared.py", "# shared helpers\n")]).await;

    let executor = Arc::new(ScriptedExecutor::new(|task, ws, _| {
        append_file(&ws.path, "shared.py", &format!("# touched by {}\n", task.id));
        passed(&["shared.py"], 0.95)
    }));
    let validator = ScoreFn::new(|task, root| {
        let shared = std::fs::read_to_string(root.join("shared.py")).unwrap_or_default();
        if task.id == "A" && shared.contains("touched by B") {
            0.4
        } else {
            0.95
        }
    });
    let engine = ExecutionLoop::new(Arc::clone(&fixture.ctx), executor, Arc::new(validator))
        .without_evidence();

    let tasks = vec![
        Task::new("A").with_target_files(["shared.py"]),
        Task::new("B").with_target_files(["shared.py"]),
    ];
    let report = engine.run(tasks).await.expect("run");

    assert!(!report.all_passed);
    let a = report.task("A").expect("A");
    assert_eq!(a.state, TaskState::Failed);
    assert!(a.failure_reason.as_deref().unwrap_or("").contains("final sweep"));
    assert_eq!(report.task("B").expect("B").state, TaskState::Passed);
}
