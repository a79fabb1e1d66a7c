//! Integration tests driving real git repositories in temp directories.

mod common;
mod execution_loop;
mod merge_conflicts;
mod rate_limit;
mod regression_rounds;
