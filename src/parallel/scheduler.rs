//! Round-based execution loop.
//!
//! Each round plans the pending tasks into batches, runs every batch inside
//! isolated workspaces, merges accepted work onto the delivery line and then
//! re-validates earlier work the round may have broken. The loop stops when
//! every task has passed or `max_rounds` is reached.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::AbortHandle;

use crate::context::{ExecutionContext, Feedback, TaskExecutor, TaskValidator, PRIMARY_SCAFFOLD};
use crate::error::{EngineError, Result};
use crate::evidence::{generate_run_id, EvidenceWriter};
use crate::merge::{CherryPickCoordinator, ConflictCallback, MergeResult};
use crate::parallel::dependency::{DependencyClassifier, DependencyGraph};
use crate::parallel::planner::{Batch, BatchMode, BatchPlanner};
use crate::regression::{RegressionDetector, RegressionFinding};
use crate::task::{FileOwnershipMap, RoundState, Task, TaskResult, TaskState};
use crate::workspace::{isolation_for, CommitOutcome, IsolationStrategy, WorkspaceHandle};

/// Terminal view of one task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskReport {
    pub id: String,
    pub state: TaskState,
    pub score: Option<f64>,
    pub errors: Vec<String>,
    pub conflicts: Vec<String>,
    pub failure_reason: Option<String>,
    pub files_modified: Vec<String>,
}

impl From<&Task> for TaskReport {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            state: task.state,
            score: task.last_score.as_ref().map(|s| s.score),
            errors: task.last_errors.clone(),
            conflicts: task.last_conflicts.clone(),
            failure_reason: task.failure_reason.clone(),
            files_modified: task.files_modified.iter().cloned().collect(),
        }
    }
}

/// Outcome of [`ExecutionLoop::run`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub rounds: u32,
    pub all_passed: bool,
    pub passed: usize,
    pub total: usize,
    /// Every demotion seen during the run, in order.
    pub regressions: Vec<RegressionFinding>,
    pub tasks: Vec<TaskReport>,
}

impl RunReport {
    fn from_tasks(run_id: String, rounds: u32, tasks: &[Task], regressions: Vec<RegressionFinding>) -> Self {
        let passed = tasks.iter().filter(|t| t.is_passed()).count();
        Self {
            run_id,
            rounds,
            all_passed: passed == tasks.len(),
            passed,
            total: tasks.len(),
            regressions,
            tasks: tasks.iter().map(TaskReport::from).collect(),
        }
    }

    pub fn task(&self, id: &str) -> Option<&TaskReport> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// Tasks that did not pass.
    pub fn failed(&self) -> impl Iterator<Item = &TaskReport> {
        self.tasks.iter().filter(|t| t.state != TaskState::Passed)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// What a single task execution produced, before it is folded into state.
struct TaskOutcome {
    task_id: String,
    result: TaskResult,
    workspace: Option<WorkspaceHandle>,
    /// Files the committed change touched.
    files: Vec<String>,
    /// Error label and message when the run failed outside validation.
    failure: Option<(&'static str, String)>,
}

impl TaskOutcome {
    fn failed(task_id: &str, workspace: Option<WorkspaceHandle>, err: &EngineError) -> Self {
        Self {
            task_id: task_id.to_string(),
            result: TaskResult::failure(vec![err.to_string()]),
            workspace,
            files: Vec::new(),
            failure: Some((err.label(), err.to_string())),
        }
    }
}

/// Workspaces of tasks that have not finished yet.
type InFlight = Arc<Mutex<HashMap<String, WorkspaceHandle>>>;

/// Hands merge conflicts back to the task executor.
struct ExecutorResolver<'a> {
    executor: &'a dyn TaskExecutor,
    task: &'a Task,
}

#[async_trait]
impl ConflictCallback for ExecutorResolver<'_> {
    async fn resolve(&self, ws: &WorkspaceHandle, conflicts: &[String]) -> Result<bool> {
        tracing::info!(task_id = %self.task.id, files = ?conflicts, "asking executor to resolve conflicts");
        self.executor.resolve_conflicts(self.task, ws, conflicts).await
    }
}

/// Drives tasks through rounds of plan, execute, merge and regression check.
pub struct ExecutionLoop {
    ctx: Arc<ExecutionContext>,
    executor: Arc<dyn TaskExecutor>,
    isolation: Arc<dyn IsolationStrategy>,
    coordinator: CherryPickCoordinator,
    detector: RegressionDetector,
    planner: BatchPlanner,
    classifiers: Vec<Box<dyn DependencyClassifier>>,
    evidence: Option<EvidenceWriter>,
    run_id: String,
}

impl ExecutionLoop {
    pub fn new(
        ctx: Arc<ExecutionContext>,
        executor: Arc<dyn TaskExecutor>,
        validator: Arc<dyn TaskValidator>,
    ) -> Self {
        let isolation = isolation_for(Arc::clone(&ctx));
        let config = ctx.config();
        let coordinator = CherryPickCoordinator::new(config, Arc::clone(&isolation));
        let detector = RegressionDetector::new(config, validator);
        let planner = BatchPlanner::new().with_requires_scaffold(config.requires_scaffold);

        let run_id = generate_run_id();
        let evidence = match EvidenceWriter::try_new(ctx.root(), run_id.clone()) {
            Ok(writer) => Some(writer),
            Err(err) => {
                tracing::warn!(error = %err, "evidence journal disabled");
                None
            }
        };

        Self {
            ctx,
            executor,
            isolation,
            coordinator,
            detector,
            planner,
            classifiers: Vec::new(),
            evidence,
            run_id,
        }
    }

    /// Add a dependency classifier consulted when planning each round.
    pub fn with_classifier(mut self, classifier: impl DependencyClassifier + 'static) -> Self {
        self.classifiers.push(Box::new(classifier));
        self
    }

    /// Disable the evidence journal.
    pub fn without_evidence(mut self) -> Self {
        self.evidence = None;
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Run `tasks` to completion or until `max_rounds`.
    pub async fn run(&self, mut tasks: Vec<Task>) -> Result<RunReport> {
        check_unique_ids(&tasks)?;
        let max_rounds = self.ctx.config().max_rounds;
        let mut ownership = FileOwnershipMap::new();
        let mut regressions = Vec::new();
        let mut rounds = 0;

        tracing::info!(run_id = %self.run_id, tasks = tasks.len(), max_rounds, "run starting");
        if let Some(evidence) = &self.evidence {
            evidence.emit_run_start(tasks.len());
        }

        for round in 1..=max_rounds {
            let pending: BTreeSet<String> = tasks
                .iter()
                .filter(|t| !t.is_passed())
                .map(|t| t.id.clone())
                .collect();
            if pending.is_empty() {
                break;
            }
            rounds = round;
            tracing::info!(round, pending = pending.len(), "round starting");
            if let Some(evidence) = &self.evidence {
                evidence.emit_round_start(round, &pending.iter().cloned().collect::<Vec<_>>());
            }

            let mut state = RoundState::new(round, pending);
            let batches = self.plan_round(&mut tasks, &ownership).await;
            for (index, mut batch) in batches.into_iter().enumerate() {
                let scaffold_ready = self.ctx.shared().is_scaffold_ready(PRIMARY_SCAFFOLD).await;
                batch.refresh_mode(self.ctx.config().requires_scaffold, scaffold_ready);
                for task in tasks.iter_mut().filter(|t| batch.task_ids.contains(&t.id)) {
                    task.mark_in_progress();
                }
                tracing::info!(
                    round,
                    batch = index + 1,
                    tasks = batch.len(),
                    mode = ?batch.mode,
                    forced = batch.forced,
                    "running batch"
                );
                let outcomes = self.execute_batch(&tasks, &batch, round).await;
                for outcome in outcomes {
                    self.fold_outcome(&mut tasks, outcome, &mut state, &mut ownership).await;
                }
            }

            let found = self
                .detector
                .check_round(
                    &mut tasks,
                    &ownership,
                    &state.touched_files,
                    &state.processed,
                    self.ctx.root(),
                )
                .await;
            self.record_regressions(round, &found);
            regressions.extend(found);

            if tasks.iter().all(Task::is_passed) {
                tracing::info!(round, "all tasks passed");
                break;
            }
        }

        let found = self.detector.full_sweep(&mut tasks, self.ctx.root()).await;
        self.record_regressions(rounds, &found);
        regressions.extend(found);

        let report = RunReport::from_tasks(self.run_id.clone(), rounds, &tasks, regressions);
        tracing::info!(
            run_id = %self.run_id,
            rounds,
            passed = report.passed,
            total = report.total,
            "run complete"
        );
        if let Some(evidence) = &self.evidence {
            evidence.emit_run_complete(rounds, report.passed, report.total);
        }
        Ok(report)
    }

    /// Rebuild the dependency graph for the current state and plan batches.
    async fn plan_round(&self, tasks: &mut [Task], ownership: &FileOwnershipMap) -> Vec<Batch> {
        let mut graph = DependencyGraph::from_tasks(tasks);
        let classifiers: Vec<&dyn DependencyClassifier> =
            self.classifiers.iter().map(|c| c.as_ref()).collect();
        let inferred = graph.infer_dependencies(tasks, ownership, &classifiers);
        for task in tasks.iter_mut() {
            if let Some(deps) = inferred.get(&task.id) {
                task.inferred_deps.extend(deps.iter().cloned());
            }
        }
        if graph.has_cycles() {
            tracing::warn!(edges = graph.edge_count(), "dependency graph has cycles");
        }

        let completed: HashSet<String> = tasks
            .iter()
            .filter(|t| t.is_passed())
            .map(|t| t.id.clone())
            .collect();
        let scaffold_ready = self.ctx.shared().is_scaffold_ready(PRIMARY_SCAFFOLD).await;
        self.planner.plan(&graph, &completed, scaffold_ready)
    }

    /// Run a batch under the scaled batch timeout.
    ///
    /// Tasks still running at the deadline are aborted, recorded as timeout
    /// failures and their workspaces removed.
    async fn execute_batch(&self, tasks: &[Task], batch: &Batch, round: u32) -> Vec<TaskOutcome> {
        let parallelism = match batch.mode {
            BatchMode::Serial => 1,
            BatchMode::Parallel => num_cpus::get()
                .min(batch.len())
                .min(self.ctx.config().parallel_cap)
                .max(1),
        };
        let timeout = self.ctx.config().timeouts().batch_timeout(batch.len(), parallelism);
        let semaphore = Arc::new(Semaphore::new(parallelism));
        let in_flight: InFlight = Arc::new(Mutex::new(HashMap::new()));
        let done: Arc<Mutex<Vec<TaskOutcome>>> = Arc::new(Mutex::new(Vec::new()));
        let aborts: Mutex<Vec<AbortHandle>> = Mutex::new(Vec::new());
        let shared_errors = self.ctx.shared().shared_error_files();

        let dispatch = async {
            let mut handles = Vec::with_capacity(batch.len());
            for id in &batch.task_ids {
                let Some(task) = tasks.iter().find(|t| &t.id == id).cloned() else {
                    continue;
                };
                let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                    break;
                };
                let feedback = Feedback::for_task(&task, round, shared_errors.clone());
                let isolation = Arc::clone(&self.isolation);
                let executor = Arc::clone(&self.executor);
                let in_flight = Arc::clone(&in_flight);
                let done = Arc::clone(&done);

                let handle = tokio::spawn(async move {
                    let outcome = run_task(isolation, executor, task, round, feedback, in_flight).await;
                    lock(&done).push(outcome);
                    drop(permit);
                });
                lock(&aborts).push(handle.abort_handle());
                handles.push(handle);
            }
            futures::future::join_all(handles).await
        };

        let timed_out = match tokio::time::timeout(timeout, dispatch).await {
            Ok(joined) => {
                for err in joined.into_iter().filter_map(|r| r.err()) {
                    tracing::error!(round, error = %err, "task panicked");
                }
                false
            }
            Err(_) => {
                for handle in lock(&aborts).iter() {
                    handle.abort();
                }
                tracing::warn!(round, timeout = ?timeout, "batch timed out; cancelling unfinished tasks");
                true
            }
        };

        let mut outcomes = std::mem::take(&mut *lock(&done));
        let finished: HashSet<String> = outcomes.iter().map(|o| o.task_id.clone()).collect();
        for id in batch.task_ids.iter().filter(|id| !finished.contains(*id)) {
            let workspace = lock(&in_flight).remove(id);
            let err = if timed_out {
                tracing::warn!(task_id = %id, round, "task timed out");
                None
            } else {
                Some(EngineError::task_failed(id, "task panicked"))
            };
            outcomes.push(match err {
                Some(err) => TaskOutcome::failed(id, workspace, &err),
                None => {
                    let message = format!("timed out after {timeout:?}");
                    TaskOutcome {
                        task_id: id.clone(),
                        result: TaskResult::failure(vec![message.clone()]),
                        workspace,
                        files: Vec::new(),
                        failure: Some(("batch_timeout", message)),
                    }
                }
            });
        }

        // Fold in batch order so merges land deterministically.
        let order: HashMap<&String, usize> =
            batch.task_ids.iter().enumerate().map(|(i, id)| (id, i)).collect();
        outcomes.sort_by_key(|o| order.get(&o.task_id).copied().unwrap_or(usize::MAX));
        outcomes
    }

    /// Merge accepted work and fold the outcome into task state.
    async fn fold_outcome(
        &self,
        tasks: &mut [Task],
        outcome: TaskOutcome,
        state: &mut RoundState,
        ownership: &mut FileOwnershipMap,
    ) {
        let TaskOutcome {
            task_id,
            mut result,
            mut workspace,
            files,
            failure,
        } = outcome;
        let Some(task) = tasks.iter_mut().find(|t| t.id == task_id) else {
            return;
        };
        let round = state.round;
        let threshold = self.ctx.config().pass_threshold;
        let shared = self.ctx.shared();

        let mut merge: Option<MergeResult> = None;
        let verdict: std::result::Result<(), (&'static str, String)> = match (failure, workspace.as_mut()) {
            (Some(failure), _) => Err(failure),
            (None, _) if !result.is_acceptable(threshold) => {
                Err(("validation_failed", rejection_reason(&result, threshold)))
            }
            (None, Some(ws)) => {
                let resolver = ExecutorResolver {
                    executor: self.executor.as_ref(),
                    task: &*task,
                };
                match self.coordinator.merge(ws, &resolver).await {
                    Ok(merged) if merged.success => {
                        merge = Some(merged);
                        Ok(())
                    }
                    Ok(conflicted) => {
                        let message = conflicted.message.clone();
                        merge = Some(conflicted);
                        Err(("merge_conflict", message))
                    }
                    Err(err) => Err((err.label(), err.to_string())),
                }
            }
            (None, None) => Err(("workspace_missing", "no workspace to merge from".to_string())),
        };

        if !files.is_empty() {
            result.files_changed = files;
        }
        if let (Some(evidence), Some(merged)) = (&self.evidence, &merge) {
            evidence.emit_merge(round, &task_id, merged);
        }

        match verdict {
            Ok(()) => {
                task.mark_passed(&result);
                ownership.record(&task_id, &result.files_changed);
                state.touched_files.extend(result.files_changed.iter().cloned());
                shared.clear_task_errors(&task_id);
                tracing::info!(task_id = %task_id, round, score = result.validation.score, "task passed");
                if let Some(evidence) = &self.evidence {
                    evidence.emit_task(round, &task_id, "passed", Some(result.validation.score), None);
                }
            }
            Err((label, message)) => {
                task.mark_failed(message.clone(), Some(&result));
                if let Some(merged) = &merge {
                    task.last_conflicts = merged.conflicts.clone();
                }
                if task.last_errors.is_empty() {
                    task.last_errors = vec![message.clone()];
                }
                for file in &result.failure_files {
                    shared.record_file_error(file, &task_id);
                }
                tracing::warn!(task_id = %task_id, round, error_type = label, reason = %message, "task failed");
                if let Some(evidence) = &self.evidence {
                    evidence.emit_task(
                        round,
                        &task_id,
                        "failed",
                        Some(result.validation.score),
                        Some((label, message)),
                    );
                }
            }
        }

        if let Some(ws) = &workspace {
            if let Err(err) = self.isolation.cleanup(ws).await {
                tracing::warn!(task_id = %task_id, error = %err, "workspace cleanup failed");
            }
        }
        state.record(&task_id, result);
    }

    fn record_regressions(&self, round: u32, findings: &[RegressionFinding]) {
        if let Some(evidence) = &self.evidence {
            for finding in findings {
                evidence.emit_regression(round, &finding.task_id, finding.previous_score, finding.current_score);
            }
        }
    }
}

/// Create a workspace, execute the task in it and commit the result.
async fn run_task(
    isolation: Arc<dyn IsolationStrategy>,
    executor: Arc<dyn TaskExecutor>,
    task: Task,
    round: u32,
    feedback: Feedback,
    in_flight: InFlight,
) -> TaskOutcome {
    let ws = match isolation.create(&task.id, round).await {
        Ok(ws) => ws,
        Err(err) => return TaskOutcome::failed(&task.id, None, &err),
    };
    lock(&in_flight).insert(task.id.clone(), ws.clone());

    let result = match executor.execute(&task, &ws, &feedback).await {
        Ok(result) => result,
        Err(err) => {
            lock(&in_flight).remove(&task.id);
            return TaskOutcome::failed(&task.id, Some(ws), &err);
        }
    };

    let mut files = Vec::new();
    if result.success {
        let message = format!("convoy: {} (round {round})", task.id);
        match isolation.commit(&ws, &message).await {
            Ok(CommitOutcome::Committed { files: committed, .. }) => files = committed,
            Ok(CommitOutcome::NothingToCommit) => {}
            Err(err) => {
                if let EngineError::DestructiveChangeRejected { .. } = err {
                    if let Err(rollback) = isolation.rollback(&ws).await {
                        tracing::warn!(task_id = %task.id, error = %rollback, "rollback failed");
                    }
                }
                lock(&in_flight).remove(&task.id);
                let mut outcome = TaskOutcome::failed(&task.id, Some(ws), &err);
                outcome.result.validation = result.validation;
                return outcome;
            }
        }
    }

    lock(&in_flight).remove(&task.id);
    TaskOutcome {
        task_id: task.id,
        result,
        workspace: Some(ws),
        files,
        failure: None,
    }
}

fn rejection_reason(result: &TaskResult, threshold: f64) -> String {
    if !result.success {
        if let Some(first) = result.errors.first() {
            return format!("execution failed: {first}");
        }
        return "execution failed".to_string();
    }
    let errors: Vec<&String> = result.errors.iter().chain(&result.validation.errors).collect();
    if !errors.is_empty() {
        return format!(
            "validation reported {} error(s): {}",
            errors.len(),
            errors.iter().map(|e| e.as_str()).collect::<Vec<_>>().join("; ")
        );
    }
    format!(
        "validation score {:.2} below threshold {threshold:.2}",
        result.validation.score
    )
}

fn check_unique_ids(tasks: &[Task]) -> Result<()> {
    let mut seen = HashSet::new();
    for task in tasks {
        if task.id.trim().is_empty() {
            return Err(EngineError::config("task id must not be empty"));
        }
        if !seen.insert(task.id.as_str()) {
            return Err(EngineError::config(format!("duplicate task id {}", task.id)));
        }
    }
    Ok(())
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
