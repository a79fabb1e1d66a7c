//! Task dependency graph with declared and inferred edges.

use std::collections::{BTreeSet, HashMap, HashSet};

use petgraph::algo;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef as _;
use petgraph::Direction;
use regex::Regex;

use crate::task::{FileOwnershipMap, Task};

/// Why an edge exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    Declared,
    /// Both tasks touch the same file.
    FileOverlap,
    /// Added by a [`DependencyClassifier`].
    Classified,
}

/// Pluggable dependency inference. Returns ids `task` should run after.
pub trait DependencyClassifier: Send + Sync {
    fn infer(&self, task: &Task, all: &[Task]) -> Vec<String>;
}

impl<F> DependencyClassifier for F
where
    F: Fn(&Task, &[Task]) -> Vec<String> + Send + Sync,
{
    fn infer(&self, task: &Task, all: &[Task]) -> Vec<String> {
        self(task, all)
    }
}

/// "Tasks in category X run after every task in categories Y."
#[derive(Debug, Clone, Default)]
pub struct CategoryOrderClassifier {
    rules: Vec<(String, Vec<String>)>,
}

impl CategoryOrderClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `category` run after each of `after`.
    pub fn with_rule<I, S>(mut self, category: impl Into<String>, after: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rules
            .push((category.into(), after.into_iter().map(Into::into).collect()));
        self
    }
}

impl DependencyClassifier for CategoryOrderClassifier {
    fn infer(&self, task: &Task, all: &[Task]) -> Vec<String> {
        let Some(category) = task.category.as_deref() else {
            return Vec::new();
        };
        let after: HashSet<&str> = self
            .rules
            .iter()
            .filter(|(cat, _)| cat.eq_ignore_ascii_case(category))
            .flat_map(|(_, after)| after.iter().map(String::as_str))
            .collect();
        if after.is_empty() {
            return Vec::new();
        }
        all.iter()
            .filter(|other| other.id != task.id)
            .filter(|other| {
                other
                    .category
                    .as_deref()
                    .map(|c| after.iter().any(|a| a.eq_ignore_ascii_case(c)))
                    .unwrap_or(false)
            })
            .map(|other| other.id.clone())
            .collect()
    }
}

/// Reads phrases like "after the backend" or "depends on T-3" in a task's
/// description and points them at matching task ids or categories.
#[derive(Debug, Clone)]
pub struct MentionClassifier {
    pattern: Option<Regex>,
}

impl MentionClassifier {
    pub fn new() -> Self {
        Self {
            pattern: Regex::new(DEFAULT_MENTION_PATTERN).ok(),
        }
    }

    /// Use a custom pattern; its first capture group names the dependency.
    pub fn with_pattern(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Some(Regex::new(pattern)?),
        })
    }
}

impl Default for MentionClassifier {
    fn default() -> Self {
        Self::new()
    }
}

const DEFAULT_MENTION_PATTERN: &str =
    r"(?i)\b(?:after|depends on|requires|builds on|once)\s+(?:the\s+)?([A-Za-z0-9][\w-]*)";

impl DependencyClassifier for MentionClassifier {
    fn infer(&self, task: &Task, all: &[Task]) -> Vec<String> {
        let Some(pattern) = &self.pattern else {
            return Vec::new();
        };
        let mut deps = Vec::new();
        for caps in pattern.captures_iter(&task.description) {
            let Some(name) = caps.get(1).map(|m| m.as_str()) else {
                continue;
            };
            for other in all.iter().filter(|o| o.id != task.id) {
                let by_id = other.id.eq_ignore_ascii_case(name);
                let by_category = other
                    .category
                    .as_deref()
                    .map(|c| c.eq_ignore_ascii_case(name))
                    .unwrap_or(false);
                if (by_id || by_category) && !deps.contains(&other.id) {
                    deps.push(other.id.clone());
                }
            }
        }
        deps
    }
}

/// Directed graph with an edge `dependency -> dependent`.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    graph: DiGraph<String, EdgeKind>,
    nodes: HashMap<String, NodeIndex>,
    order: Vec<String>,
}

impl DependencyGraph {
    /// Build from declared dependencies. Unknown and self dependencies are ignored.
    pub fn from_tasks(tasks: &[Task]) -> Self {
        let mut graph = DiGraph::new();
        let mut nodes = HashMap::new();
        let mut order = Vec::with_capacity(tasks.len());

        for task in tasks {
            if nodes.contains_key(&task.id) {
                continue;
            }
            let node = graph.add_node(task.id.clone());
            nodes.insert(task.id.clone(), node);
            order.push(task.id.clone());
        }

        let mut built = Self {
            graph,
            nodes,
            order,
        };
        for task in tasks {
            for dep in &task.depends_on {
                built.add_edge(dep, &task.id, EdgeKind::Declared);
            }
        }
        built
    }

    /// Add `dependency -> dependent`. Returns whether a new edge was added.
    pub fn add_edge(&mut self, dependency: &str, dependent: &str, kind: EdgeKind) -> bool {
        if dependency == dependent {
            return false;
        }
        let (Some(&from), Some(&to)) = (self.nodes.get(dependency), self.nodes.get(dependent))
        else {
            return false;
        };
        if self.graph.contains_edge(from, to) {
            return false;
        }
        self.graph.add_edge(from, to, kind);
        true
    }

    /// Infer edges from shared files and from `classifiers`.
    ///
    /// A task depends on earlier (input order) tasks that target the same
    /// file, and on tasks that already own a file it targets. Returns the
    /// inferred dependencies per task.
    pub fn infer_dependencies(
        &mut self,
        tasks: &[Task],
        ownership: &FileOwnershipMap,
        classifiers: &[&dyn DependencyClassifier],
    ) -> HashMap<String, BTreeSet<String>> {
        let mut inferred: HashMap<String, BTreeSet<String>> = HashMap::new();
        let mut record = |graph: &mut Self, dep: &str, task: &str, kind: EdgeKind| {
            if graph.add_edge(dep, task, kind) {
                inferred
                    .entry(task.to_string())
                    .or_default()
                    .insert(dep.to_string());
            }
        };

        for (i, task) in tasks.iter().enumerate() {
            let targets: HashSet<&String> = task.target_files.iter().collect();
            for earlier in &tasks[..i] {
                if earlier.target_files.iter().any(|f| targets.contains(f)) {
                    record(self, &earlier.id, &task.id, EdgeKind::FileOverlap);
                }
            }
            for file in &task.target_files {
                if let Some(owners) = ownership.owners(file) {
                    for owner in owners {
                        record(self, owner, &task.id, EdgeKind::FileOverlap);
                    }
                }
            }
            for classifier in classifiers {
                for dep in classifier.infer(task, tasks) {
                    record(self, &dep, &task.id, EdgeKind::Classified);
                }
            }
        }
        inferred
    }

    /// Dependencies of `id` present in the graph.
    pub fn dependencies(&self, id: &str) -> Vec<String> {
        let Some(&node) = self.nodes.get(id) else {
            return Vec::new();
        };
        self.graph
            .edges_directed(node, Direction::Incoming)
            .map(|edge| self.graph[edge.source()].clone())
            .collect()
    }

    /// Tasks not in `completed` whose dependencies all are.
    pub fn ready_tasks(&self, completed: &HashSet<String>) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| !completed.contains(*id))
            .filter(|id| {
                self.dependencies(id)
                    .iter()
                    .all(|dep| completed.contains(dep))
            })
            .cloned()
            .collect()
    }

    pub fn has_cycles(&self) -> bool {
        algo::is_cyclic_directed(&self.graph)
    }

    /// Task ids in input order.
    pub fn task_ids(&self) -> &[String] {
        &self.order
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }
}
