//! Splits pending tasks into dependency-respecting batches.

use std::collections::HashSet;

use serde::Serialize;

use super::dependency::DependencyGraph;

/// How a batch's tasks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchMode {
    Parallel,
    Serial,
}

/// Tasks that may run together.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Batch {
    pub task_ids: Vec<String>,
    pub mode: BatchMode,
    /// Admitted without its dependencies satisfied, to break a cycle.
    pub forced: bool,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.task_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.task_ids.is_empty()
    }

    /// Set the mode from the batch width and the current scaffold state.
    ///
    /// Single-task batches are serial. Wider ones are serial only while a
    /// required scaffold is still missing, so a batch planned serial turns
    /// parallel once the scaffold lands.
    pub fn refresh_mode(&mut self, requires_scaffold: bool, scaffold_ready: bool) {
        let concurrent = self.len() > 1 && (scaffold_ready || !requires_scaffold);
        self.mode = if concurrent {
            BatchMode::Parallel
        } else {
            BatchMode::Serial
        };
    }
}

/// Plans batches over a [`DependencyGraph`].
#[derive(Debug, Clone, Default)]
pub struct BatchPlanner {
    requires_scaffold: bool,
}

impl BatchPlanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plan batches serially while the scaffold is missing.
    pub fn with_requires_scaffold(mut self, requires: bool) -> Self {
        self.requires_scaffold = requires;
        self
    }

    /// Order every task not in `completed` into batches.
    ///
    /// A batch holds tasks whose dependencies are all completed or planned in
    /// an earlier batch. When nothing is admissible the first remaining task
    /// (input order) is admitted alone. Every task lands in exactly one batch.
    pub fn plan(
        &self,
        graph: &DependencyGraph,
        completed: &HashSet<String>,
        scaffold_ready: bool,
    ) -> Vec<Batch> {
        let mut done = completed.clone();
        let mut remaining: Vec<String> = graph
            .task_ids()
            .iter()
            .filter(|id| !completed.contains(*id))
            .cloned()
            .collect();

        let mut batches = Vec::new();
        while !remaining.is_empty() {
            let ready: Vec<String> = remaining
                .iter()
                .filter(|id| graph.dependencies(id).iter().all(|dep| done.contains(dep)))
                .cloned()
                .collect();

            let (task_ids, forced) = if ready.is_empty() {
                let victim = remaining[0].clone();
                tracing::warn!(
                    task_id = %victim,
                    remaining = remaining.len(),
                    "dependency cycle detected; admitting task without its dependencies"
                );
                (vec![victim], true)
            } else {
                (ready, false)
            };

            let admitted: HashSet<&String> = task_ids.iter().collect();
            remaining.retain(|id| !admitted.contains(id));
            done.extend(task_ids.iter().cloned());

            let mut batch = Batch {
                task_ids,
                mode: BatchMode::Serial,
                forced,
            };
            batch.refresh_mode(self.requires_scaffold, scaffold_ready);
            batches.push(batch);
        }

        tracing::debug!(batches = batches.len(), "batch plan ready");
        batches
    }
}
