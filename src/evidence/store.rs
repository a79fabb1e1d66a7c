use std::env;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{Duration, Utc};
use thiserror::Error;

use crate::evidence::event::{EvidenceRecord, RunManifest};

const CONVOY_DIR_NAME: &str = ".convoy";
const EVIDENCE_DIR_NAME: &str = "evidence";
const RUNS_DIR_NAME: &str = "runs";
const MANIFEST_FILE_NAME: &str = "run.json";
const EVENTS_FILE_NAME: &str = "events.jsonl";

/// Environment variable for the retention period in days.
pub const RETENTION_ENV_VAR: &str = "CONVOY_EVIDENCE_RETENTION_DAYS";

/// Default retention period in days.
pub const DEFAULT_RETENTION_DAYS: u64 = 30;

/// Errors that can occur while journaling evidence.
#[derive(Error, Debug)]
pub enum EvidenceError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid run id")]
    InvalidRunId,
}

pub type EvidenceResult<T> = Result<T, EvidenceError>;

/// Read the retention period from the environment, falling back to the default.
pub fn retention_days_from_env() -> u64 {
    env::var(RETENTION_ENV_VAR)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(DEFAULT_RETENTION_DAYS)
}

/// Append-only evidence journal on the local filesystem.
///
/// Layout: `<base>/.convoy/evidence/runs/<run_id>/{events.jsonl,run.json}`.
#[derive(Debug, Clone)]
pub struct EvidenceStore {
    root_dir: PathBuf,
    retention_days: u64,
}

impl EvidenceStore {
    /// Open the journal under `base_dir`. A retention of 0 disables pruning.
    pub fn open(base_dir: impl AsRef<Path>, retention_days: u64) -> EvidenceResult<Self> {
        let root_dir = base_dir
            .as_ref()
            .join(CONVOY_DIR_NAME)
            .join(EVIDENCE_DIR_NAME);
        fs::create_dir_all(root_dir.join(RUNS_DIR_NAME))?;
        Ok(Self {
            root_dir,
            retention_days,
        })
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// Path of a run's event log.
    pub fn events_path(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join(EVENTS_FILE_NAME)
    }

    /// Append one record and bump the run manifest.
    pub fn append(&self, record: &EvidenceRecord) -> EvidenceResult<()> {
        if record.run_id.trim().is_empty() {
            return Err(EvidenceError::InvalidRunId);
        }

        let run_dir = self.run_dir(&record.run_id);
        fs::create_dir_all(&run_dir)?;

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(run_dir.join(EVENTS_FILE_NAME))?;
        writeln!(file, "{}", serde_json::to_string(record)?)?;
        file.sync_all()?;

        let now = Utc::now();
        let mut manifest = self
            .read_manifest(&run_dir.join(MANIFEST_FILE_NAME))?
            .unwrap_or_else(|| RunManifest::new(record.run_id.clone(), now));
        manifest.touch(now);
        self.write_manifest(&run_dir, &manifest)
    }

    /// Read back every record of a run, skipping lines that fail to parse.
    pub fn read_run(&self, run_id: &str) -> EvidenceResult<Vec<EvidenceRecord>> {
        let content = match fs::read_to_string(self.events_path(run_id)) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        Ok(content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }

    /// Delete runs whose manifest is older than the retention period.
    pub fn enforce_retention(&self) -> EvidenceResult<usize> {
        if self.retention_days == 0 {
            return Ok(0);
        }

        let runs_dir = self.root_dir.join(RUNS_DIR_NAME);
        if !runs_dir.exists() {
            return Ok(0);
        }

        let cutoff = Utc::now() - Duration::days(self.retention_days as i64);
        let mut deleted = 0;

        for entry in fs::read_dir(&runs_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }

            let run_dir = entry.path();
            let Some(manifest) = self.read_manifest(&run_dir.join(MANIFEST_FILE_NAME))? else {
                continue;
            };

            if manifest.created_at < cutoff {
                fs::remove_dir_all(&run_dir)?;
                deleted += 1;
            }
        }

        Ok(deleted)
    }

    fn run_dir(&self, run_id: &str) -> PathBuf {
        self.root_dir.join(RUNS_DIR_NAME).join(run_id)
    }

    fn read_manifest(&self, path: &Path) -> EvidenceResult<Option<RunManifest>> {
        match fs::read_to_string(path) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(EvidenceError::Io(err)),
        }
    }

    fn write_manifest(&self, run_dir: &Path, manifest: &RunManifest) -> EvidenceResult<()> {
        let json = serde_json::to_string_pretty(manifest)?;
        let temp_path = run_dir.join(format!("{}.tmp", MANIFEST_FILE_NAME));

        let mut file = fs::File::create(&temp_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        fs::rename(&temp_path, run_dir.join(MANIFEST_FILE_NAME))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::event::EventKind;
    use tempfile::TempDir;

    #[test]
    fn test_append_writes_events_and_manifest() {
        let temp_dir = TempDir::new().expect("temp dir");
        let store = EvidenceStore::open(temp_dir.path(), 30).expect("store");

        store
            .append(&EvidenceRecord::new("run-123", EventKind::RunStart))
            .expect("append");
        store
            .append(&EvidenceRecord::new("run-123", EventKind::RoundStart).with_round(1))
            .expect("append");

        let run_dir = temp_dir
            .path()
            .join(".convoy/evidence/runs/run-123");
        assert!(run_dir.join(EVENTS_FILE_NAME).exists());
        let manifest = store
            .read_manifest(&run_dir.join(MANIFEST_FILE_NAME))
            .expect("read")
            .expect("manifest");
        assert_eq!(manifest.event_count, 2);

        let records = store.read_run("run-123").expect("read run");
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].round, Some(1));
    }

    #[test]
    fn test_append_rejects_blank_run_id() {
        let temp_dir = TempDir::new().expect("temp dir");
        let store = EvidenceStore::open(temp_dir.path(), 30).expect("store");
        let result = store.append(&EvidenceRecord::new("  ", EventKind::RunStart));
        assert!(matches!(result, Err(EvidenceError::InvalidRunId)));
    }

    #[test]
    fn test_enforce_retention_deletes_expired_runs() {
        let temp_dir = TempDir::new().expect("temp dir");
        let store = EvidenceStore::open(temp_dir.path(), 30).expect("store");
        store
            .append(&EvidenceRecord::new("run-old", EventKind::RunStart))
            .expect("append");
        store
            .append(&EvidenceRecord::new("run-new", EventKind::RunStart))
            .expect("append");

        let run_dir = store.run_dir("run-old");
        let manifest_path = run_dir.join(MANIFEST_FILE_NAME);
        let mut manifest = store
            .read_manifest(&manifest_path)
            .expect("read")
            .expect("manifest");
        manifest.created_at = Utc::now() - Duration::days(45);
        store.write_manifest(&run_dir, &manifest).expect("write");

        assert_eq!(store.enforce_retention().expect("retention"), 1);
        assert!(!run_dir.exists());
        assert!(store.run_dir("run-new").exists());
    }

    #[test]
    fn test_enforce_retention_disabled() {
        let temp_dir = TempDir::new().expect("temp dir");
        let store = EvidenceStore::open(temp_dir.path(), 0).expect("store");
        store
            .append(&EvidenceRecord::new("run-keep", EventKind::RunStart))
            .expect("append");

        assert_eq!(store.enforce_retention().expect("retention"), 0);
        assert!(store.run_dir("run-keep").exists());
    }

    #[test]
    fn test_read_run_missing_is_empty() {
        let temp_dir = TempDir::new().expect("temp dir");
        let store = EvidenceStore::open(temp_dir.path(), 30).expect("store");
        assert!(store.read_run("nope").expect("read").is_empty());
    }
}
