//! Change statistics and destructive-change validation.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::config::EngineConfig;
use crate::error::Result;
use crate::workspace::git::Git;
use crate::workspace::PatternSet;

/// Added and deleted line counts for one file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LineDelta {
    pub added: usize,
    pub deleted: usize,
}

/// What a workspace changed relative to its base.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChangeStats {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub deleted: Vec<String>,
    pub lines: BTreeMap<String, LineDelta>,
    /// Line counts at the base for modified and deleted files.
    pub original_lines: BTreeMap<String, usize>,
}

impl ChangeStats {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }

    /// Every changed path, sorted.
    pub fn files(&self) -> Vec<String> {
        let mut files: Vec<String> = self
            .added
            .iter()
            .chain(&self.modified)
            .chain(&self.deleted)
            .cloned()
            .collect();
        files.sort();
        files.dedup();
        files
    }

    /// Stage everything in `git`'s working tree and diff it against `base`.
    pub async fn collect(git: &Git, base: &str) -> Result<Self> {
        git.add_all().await?;
        let numstat = git
            .check(&["diff", "--cached", "--no-renames", "--numstat", base])
            .await?;
        let name_status = git
            .check(&["diff", "--cached", "--no-renames", "--name-status", base])
            .await?;

        let mut stats = parse_name_status(&name_status);
        stats.lines = parse_numstat(&numstat);

        for path in stats.modified.iter().chain(&stats.deleted) {
            let shown = git.run(&["show", &format!("{base}:{path}")]).await?;
            if shown.success {
                stats
                    .original_lines
                    .insert(path.clone(), count_lines(&shown.stdout));
            }
        }
        Ok(stats)
    }
}

fn count_lines(content: &str) -> usize {
    if content.is_empty() {
        0
    } else {
        content.lines().count()
    }
}

/// Parse `git diff --name-status` output.
pub fn parse_name_status(output: &str) -> ChangeStats {
    let mut stats = ChangeStats::default();
    for line in output.lines() {
        let mut parts = line.splitn(2, '\t');
        let (Some(status), Some(path)) = (parts.next(), parts.next()) else {
            continue;
        };
        let path = path.to_string();
        match status.chars().next() {
            Some('A') => stats.added.push(path),
            Some('D') => stats.deleted.push(path),
            Some(_) => stats.modified.push(path),
            None => {}
        }
    }
    stats
}

/// Parse `git diff --numstat` output. Binary files count as zero lines.
pub fn parse_numstat(output: &str) -> BTreeMap<String, LineDelta> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.splitn(3, '\t');
            let added = parts.next()?.parse().unwrap_or(0);
            let deleted = parts.next()?.parse().unwrap_or(0);
            let path = parts.next()?.to_string();
            Some((path, LineDelta { added, deleted }))
        })
        .collect()
}

/// One destructive-change finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    pub path: String,
    pub reason: String,
}

/// Outcome of validating a [`ChangeStats`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChangeValidation {
    /// Hard violations; a commit is refused while any exist.
    pub violations: Vec<Violation>,
    /// Suspicious but allowed changes.
    pub warnings: Vec<Violation>,
}

impl ChangeValidation {
    pub fn is_destructive(&self) -> bool {
        !self.violations.is_empty()
    }
}

/// Thresholds for flagging destructive diffs.
#[derive(Debug, Clone)]
pub struct DestructivePolicy {
    /// Files shorter than this at the base are never flagged.
    pub min_original_lines: usize,
    /// A file left with fewer lines than this counts as truncated.
    pub min_remaining_lines: usize,
    /// Deleted/original ratio above which truncation is destructive.
    pub max_deletion_ratio: f64,
    /// Paths whose deletion produces a warning.
    pub important: PatternSet,
}

impl Default for DestructivePolicy {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

impl DestructivePolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            min_original_lines: config.destructive_min_original_lines,
            min_remaining_lines: config.destructive_min_remaining_lines,
            max_deletion_ratio: config.destructive_max_deletion_ratio,
            important: PatternSet::new(&config.important_patterns),
        }
    }

    pub fn validate(&self, stats: &ChangeStats) -> ChangeValidation {
        let mut report = ChangeValidation::default();

        for path in &stats.deleted {
            let original = stats.original_lines.get(path).copied().unwrap_or(0);
            if original >= self.min_original_lines && original > 0 {
                report.violations.push(Violation {
                    path: path.clone(),
                    reason: format!("deletes {original}-line file"),
                });
            }
            if self.important.matches(path) {
                report.warnings.push(Violation {
                    path: path.clone(),
                    reason: "deletes important file".to_string(),
                });
            }
        }

        for path in &stats.modified {
            let Some(&original) = stats.original_lines.get(path) else {
                continue;
            };
            if original < self.min_original_lines || original == 0 {
                continue;
            }
            let delta = stats.lines.get(path).copied().unwrap_or_default();
            let remaining = (original + delta.added).saturating_sub(delta.deleted);
            let ratio = delta.deleted as f64 / original as f64;
            if remaining < self.min_remaining_lines && ratio > self.max_deletion_ratio {
                report.violations.push(Violation {
                    path: path.clone(),
                    reason: format!(
                        "truncates {original} lines to {remaining} ({:.0}% deleted)",
                        ratio * 100.0
                    ),
                });
            }
        }

        report
    }
}
