use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::json;

use crate::evidence::event::{EventKind, EvidenceRecord};
use crate::evidence::store::{retention_days_from_env, EvidenceResult, EvidenceStore};
use crate::merge::MergeResult;

/// Journals run lifecycle events. Write failures are logged, never returned.
pub struct EvidenceWriter {
    run_id: String,
    store: EvidenceStore,
}

impl EvidenceWriter {
    /// Open the journal under `base_dir` and prune expired runs.
    pub fn try_new(base_dir: &Path, run_id: impl Into<String>) -> EvidenceResult<Self> {
        let store = EvidenceStore::open(base_dir, retention_days_from_env())?;
        match store.enforce_retention() {
            Ok(0) => {}
            Ok(deleted) => tracing::debug!(deleted, "pruned expired evidence runs"),
            Err(err) => tracing::warn!(error = %err, "evidence retention pass failed"),
        }
        Ok(Self {
            run_id: run_id.into(),
            store,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn store(&self) -> &EvidenceStore {
        &self.store
    }

    pub fn emit_run_start(&self, total_tasks: usize) {
        self.write(self.record(EventKind::RunStart).with_detail(json!({ "total_tasks": total_tasks })));
    }

    pub fn emit_round_start(&self, round: u32, pending: &[String]) {
        self.write(
            self.record(EventKind::RoundStart)
                .with_round(round)
                .with_detail(json!({ "pending": pending })),
        );
    }

    pub fn emit_task(
        &self,
        round: u32,
        task_id: &str,
        status: &str,
        score: Option<f64>,
        error: Option<(&str, String)>,
    ) {
        let mut record = self
            .record(EventKind::Task)
            .with_round(round)
            .with_task(task_id)
            .with_status(status);
        if let Some(score) = score {
            record = record.with_detail(json!({ "score": score }));
        }
        if let Some((label, message)) = error {
            record = record.with_error(label, message);
        }
        self.write(record);
    }

    pub fn emit_merge(&self, round: u32, task_id: &str, result: &MergeResult) {
        let mut record = self
            .record(EventKind::Merge)
            .with_round(round)
            .with_task(task_id)
            .with_status(if result.success { "merged" } else { "conflicted" })
            .with_detail(json!({
                "conflicts": result.conflicts,
                "commit": result.commit,
                "attempts": result.attempts,
            }));
        if !result.success {
            record = record.with_error("merge_conflict", result.message.clone());
        }
        self.write(record);
    }

    pub fn emit_regression(&self, round: u32, task_id: &str, previous: f64, current: f64) {
        self.write(
            self.record(EventKind::Regression)
                .with_round(round)
                .with_task(task_id)
                .with_status("failed")
                .with_detail(json!({ "previous_score": previous, "current_score": current })),
        );
    }

    pub fn emit_run_complete(&self, rounds: u32, passed: usize, total: usize) {
        let status = if passed == total { "success" } else { "partial" };
        self.write(
            self.record(EventKind::RunComplete)
                .with_round(rounds)
                .with_status(status)
                .with_detail(json!({ "passed": passed, "total": total })),
        );
    }

    fn record(&self, kind: EventKind) -> EvidenceRecord {
        EvidenceRecord::new(self.run_id.clone(), kind)
    }

    fn write(&self, record: EvidenceRecord) {
        if let Err(err) = self.store.append(&record) {
            tracing::warn!(
                run_id = %self.run_id,
                dir = %self.store.root_dir().display(),
                error = %err,
                "failed to write evidence event"
            );
        }
    }
}

/// Generate a run id from the wall clock and process id.
pub fn generate_run_id() -> String {
    let timestamp_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    format!("run-{}-{}", timestamp_ms, std::process::id())
}
