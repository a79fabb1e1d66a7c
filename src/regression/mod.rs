//! Cross-round regression detection.
//!
//! After a round lands, every accepted task that owns a file the round touched
//! is validated again against the current delivery tree. A task that no
//! longer passes, or whose score dropped by more than the configured delta,
//! is demoted to failed with a reason describing the drop.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;

use crate::config::EngineConfig;
use crate::context::TaskValidator;
use crate::task::{FileOwnershipMap, Task, TaskState};

/// A demotion recorded by the detector.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegressionFinding {
    pub task_id: String,
    pub previous_score: f64,
    pub current_score: f64,
    pub reason: String,
}

/// Re-validates accepted tasks affected by later work.
pub struct RegressionDetector {
    validator: Arc<dyn TaskValidator>,
    drop_threshold: f64,
    pass_threshold: f64,
}

impl RegressionDetector {
    pub fn new(config: &EngineConfig, validator: Arc<dyn TaskValidator>) -> Self {
        Self {
            validator,
            drop_threshold: config.regression_score_drop_threshold,
            pass_threshold: config.pass_threshold,
        }
    }

    /// Passed tasks outside `processed` that own any of `touched`.
    pub fn candidates(
        &self,
        tasks: &[Task],
        ownership: &FileOwnershipMap,
        touched: &BTreeSet<String>,
        processed: &BTreeSet<String>,
    ) -> Vec<String> {
        let owners = ownership.tasks_touching(touched);
        tasks
            .iter()
            .filter(|task| task.is_passed())
            .filter(|task| !processed.contains(&task.id))
            .filter(|task| owners.contains(&task.id))
            .map(|task| task.id.clone())
            .collect()
    }

    /// Check the tasks affected by one round's touched files.
    pub async fn check_round(
        &self,
        tasks: &mut [Task],
        ownership: &FileOwnershipMap,
        touched: &BTreeSet<String>,
        processed: &BTreeSet<String>,
        root: &Path,
    ) -> Vec<RegressionFinding> {
        let candidates = self.candidates(tasks, ownership, touched, processed);
        if candidates.is_empty() {
            return Vec::new();
        }
        tracing::info!(candidates = candidates.len(), touched = touched.len(), "checking for regressions");

        let mut findings = Vec::new();
        for task in tasks.iter_mut().filter(|t| candidates.contains(&t.id)) {
            let shared: Vec<&String> = task.files_modified.intersection(touched).collect();
            let context = format!(
                "after later changes to {}",
                shared
                    .iter()
                    .map(|f| f.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            if let Some(finding) = self.recheck(task, root, &context).await {
                findings.push(finding);
            }
        }
        findings
    }

    /// Check every task still marked passed.
    pub async fn full_sweep(&self, tasks: &mut [Task], root: &Path) -> Vec<RegressionFinding> {
        let mut findings = Vec::new();
        for task in tasks.iter_mut().filter(|t| t.state == TaskState::Passed) {
            if let Some(finding) = self.recheck(task, root, "in final sweep").await {
                findings.push(finding);
            }
        }
        tracing::info!(regressions = findings.len(), "final regression sweep complete");
        findings
    }

    async fn recheck(&self, task: &mut Task, root: &Path, context: &str) -> Option<RegressionFinding> {
        let previous = task.score_value();
        let current = match self.validator.validate(task, root).await {
            Ok(score) => score,
            Err(err) => {
                tracing::warn!(task_id = %task.id, error = %err, "re-validation failed; leaving state unchanged");
                return None;
            }
        };

        let drop = previous - current.score;
        let still_valid = current.passes(self.pass_threshold);
        if still_valid && drop <= self.drop_threshold {
            return None;
        }

        let mut reason = format!(
            "regression {context}: score {previous:.2} -> {:.2} (delta {:.2})",
            current.score, drop
        );
        if !current.errors.is_empty() {
            reason.push_str(&format!("; errors: {}", current.errors.join("; ")));
        }
        tracing::warn!(task_id = %task.id, previous, current = current.score, "regression detected");

        let current_score = current.score;
        task.mark_regressed(current, reason.clone());
        Some(RegressionFinding {
            task_id: task.id.clone(),
            previous_score: previous,
            current_score,
            reason,
        })
    }
}
