//! Dependency-aware batch planning and the round-based execution loop.

pub mod dependency;
pub mod planner;
pub mod scheduler;

pub use dependency::{
    CategoryOrderClassifier, DependencyClassifier, DependencyGraph, EdgeKind, MentionClassifier,
};
pub use planner::{Batch, BatchMode, BatchPlanner};
pub use scheduler::{ExecutionLoop, RunReport, TaskReport};
