//! Task data model: tasks, results, validation scores and file ownership.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    #[default]
    Pending,
    InProgress,
    Passed,
    Failed,
}

impl TaskState {
    pub fn as_label(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::InProgress => "in_progress",
            TaskState::Passed => "passed",
            TaskState::Failed => "failed",
        }
    }
}

/// A validation verdict: a score in [0, 1], errors, and a per-layer breakdown.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationScore {
    pub score: f64,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub layers: BTreeMap<String, f64>,
}

impl ValidationScore {
    /// Create a score, clamped to [0, 1].
    pub fn new(score: f64) -> Self {
        Self {
            score: clamp_unit(score),
            errors: Vec::new(),
            layers: BTreeMap::new(),
        }
    }

    pub fn with_errors(mut self, errors: Vec<String>) -> Self {
        self.errors = errors;
        self
    }

    pub fn with_layer(mut self, name: impl Into<String>, score: f64) -> Self {
        self.layers.insert(name.into(), clamp_unit(score));
        self
    }

    /// A score passes only when it meets `threshold` and carries no errors.
    pub fn passes(&self, threshold: f64) -> bool {
        self.score >= threshold && self.errors.is_empty()
    }
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// What a [`crate::context::TaskExecutor`] reports back for one execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub success: bool,
    /// Workspace-relative paths the execution modified.
    pub files_changed: Vec<String>,
    pub errors: Vec<String>,
    pub validation: ValidationScore,
    /// Sub-criteria the execution satisfied.
    #[serde(default)]
    pub criteria_passed: Vec<String>,
    /// Files implicated in a validation failure.
    #[serde(default)]
    pub failure_files: Vec<String>,
}

impl TaskResult {
    /// A successful execution.
    pub fn success(files_changed: Vec<String>, validation: ValidationScore) -> Self {
        Self {
            success: true,
            files_changed,
            validation,
            ..Self::default()
        }
    }

    /// A failed execution.
    pub fn failure(errors: Vec<String>) -> Self {
        Self {
            success: false,
            errors,
            ..Self::default()
        }
    }

    pub fn with_criteria(mut self, criteria: Vec<String>) -> Self {
        self.criteria_passed = criteria;
        self
    }

    pub fn with_failure_files(mut self, files: Vec<String>) -> Self {
        self.failure_files = files;
        self
    }

    /// Whether the result is acceptable at `threshold`, before merging.
    pub fn is_acceptable(&self, threshold: f64) -> bool {
        self.success && self.errors.is_empty() && self.validation.passes(threshold)
    }
}

/// One independently schedulable unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(default)]
    pub description: String,
    /// Free-form category used by dependency classifiers.
    #[serde(default)]
    pub category: Option<String>,
    /// Declared dependency ids.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Dependencies added by inference.
    #[serde(default)]
    pub inferred_deps: BTreeSet<String>,
    /// Files the task expects to modify.
    #[serde(default)]
    pub target_files: Vec<String>,
    #[serde(default)]
    pub state: TaskState,
    #[serde(default)]
    pub passed_criteria: BTreeSet<String>,
    #[serde(default)]
    pub files_modified: BTreeSet<String>,
    #[serde(default)]
    pub failure_files: BTreeSet<String>,
    #[serde(default)]
    pub last_score: Option<ValidationScore>,
    #[serde(default)]
    pub last_errors: Vec<String>,
    #[serde(default)]
    pub last_conflicts: Vec<String>,
    #[serde(default)]
    pub failure_reason: Option<String>,
    /// Set only when the task was demoted by a regression check.
    #[serde(default)]
    pub regression_reason: Option<String>,
}

impl Task {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            category: None,
            depends_on: Vec::new(),
            inferred_deps: BTreeSet::new(),
            target_files: Vec::new(),
            state: TaskState::Pending,
            passed_criteria: BTreeSet::new(),
            files_modified: BTreeSet::new(),
            failure_files: BTreeSet::new(),
            last_score: None,
            last_errors: Vec::new(),
            last_conflicts: Vec::new(),
            failure_reason: None,
            regression_reason: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_target_files<I, S>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.target_files = files.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_state(mut self, state: TaskState) -> Self {
        self.state = state;
        self
    }

    pub fn is_passed(&self) -> bool {
        self.state == TaskState::Passed
    }

    /// Declared and inferred dependencies, deduplicated.
    pub fn all_dependencies(&self) -> BTreeSet<String> {
        self.depends_on
            .iter()
            .cloned()
            .chain(self.inferred_deps.iter().cloned())
            .collect()
    }

    /// Last validation score value, or 0 if never validated.
    pub fn score_value(&self) -> f64 {
        self.last_score.as_ref().map(|s| s.score).unwrap_or(0.0)
    }

    /// Dispatched to an isolated workspace in the current round.
    pub fn mark_in_progress(&mut self) {
        self.state = TaskState::InProgress;
    }

    /// Record an accepted, merged result.
    pub fn mark_passed(&mut self, result: &TaskResult) {
        self.state = TaskState::Passed;
        self.files_modified.extend(result.files_changed.iter().cloned());
        self.passed_criteria.extend(result.criteria_passed.iter().cloned());
        self.failure_files.clear();
        self.last_score = Some(result.validation.clone());
        self.last_errors.clear();
        self.last_conflicts.clear();
        self.failure_reason = None;
        self.regression_reason = None;
    }

    /// Record a failed attempt with the concrete reason.
    pub fn mark_failed(&mut self, reason: impl Into<String>, result: Option<&TaskResult>) {
        self.state = TaskState::Failed;
        self.failure_reason = Some(reason.into());
        self.regression_reason = None;
        if let Some(result) = result {
            self.files_modified.extend(result.files_changed.iter().cloned());
            self.passed_criteria = result.criteria_passed.iter().cloned().collect();
            self.failure_files = result.failure_files.iter().cloned().collect();
            self.last_score = Some(result.validation.clone());
            let mut errors = result.errors.clone();
            errors.extend(result.validation.errors.iter().cloned());
            self.last_errors = errors;
        }
    }

    /// Demote a previously passed task whose files were broken by later work.
    pub fn mark_regressed(&mut self, current: ValidationScore, reason: impl Into<String>) {
        self.state = TaskState::Failed;
        self.passed_criteria.clear();
        self.last_errors = current.errors.clone();
        self.last_score = Some(current);
        let reason = reason.into();
        self.regression_reason = Some(reason.clone());
        self.failure_reason = Some(reason);
    }
}

/// File path to the set of tasks that modified it. Append-only.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FileOwnershipMap {
    owners: BTreeMap<String, BTreeSet<String>>,
}

impl FileOwnershipMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `task_id` modified `files`.
    pub fn record<I, S>(&mut self, task_id: &str, files: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for file in files {
            self.owners
                .entry(file.as_ref().to_string())
                .or_default()
                .insert(task_id.to_string());
        }
    }

    pub fn owners(&self, file: &str) -> Option<&BTreeSet<String>> {
        self.owners.get(file)
    }

    /// Files modified by `task_id`.
    pub fn files_of(&self, task_id: &str) -> BTreeSet<String> {
        self.owners
            .iter()
            .filter(|(_, tasks)| tasks.contains(task_id))
            .map(|(file, _)| file.clone())
            .collect()
    }

    /// Tasks that modified any of `files`.
    pub fn tasks_touching<'a, I>(&self, files: I) -> BTreeSet<String>
    where
        I: IntoIterator<Item = &'a String>,
    {
        files
            .into_iter()
            .filter_map(|file| self.owners.get(file))
            .flat_map(|tasks| tasks.iter().cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }
}

/// Per-round bookkeeping, discarded once folded into task state.
#[derive(Debug, Clone, Default)]
pub struct RoundState {
    pub round: u32,
    pub pending: BTreeSet<String>,
    /// Raw results by task id.
    pub results: BTreeMap<String, TaskResult>,
    /// Files touched by merged work in this round.
    pub touched_files: BTreeSet<String>,
    /// Tasks that ran in this round.
    pub processed: BTreeSet<String>,
}

impl RoundState {
    pub fn new(round: u32, pending: BTreeSet<String>) -> Self {
        Self {
            round,
            pending,
            ..Self::default()
        }
    }

    pub fn record(&mut self, task_id: &str, result: TaskResult) {
        self.processed.insert(task_id.to_string());
        self.results.insert(task_id.to_string(), result);
    }
}
