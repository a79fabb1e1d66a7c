use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Current evidence schema version.
pub const EVIDENCE_SCHEMA_VERSION: u32 = 1;

/// Kinds of lifecycle events journaled during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RunStart,
    RoundStart,
    Task,
    Merge,
    Regression,
    RunComplete,
}

/// One journaled event. Event-specific fields live in `detail`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceRecord {
    /// Evidence schema version.
    pub schema_version: u32,
    /// Run identifier for correlation.
    pub run_id: String,
    /// Event kind.
    pub kind: EventKind,
    /// RFC 3339 timestamp with millisecond precision.
    pub timestamp: String,
    /// Round the event belongs to, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub round: Option<u32>,
    /// Task the event belongs to, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    /// Outcome label, e.g. `passed`, `failed`, `merged`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Stable error label, see `EngineError::label`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub detail: Value,
}

impl EvidenceRecord {
    /// Create a record stamped with the current time.
    pub fn new(run_id: impl Into<String>, kind: EventKind) -> Self {
        Self {
            schema_version: EVIDENCE_SCHEMA_VERSION,
            run_id: run_id.into(),
            kind,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            round: None,
            task_id: None,
            status: None,
            error_type: None,
            error_message: None,
            detail: Value::Null,
        }
    }

    pub fn with_round(mut self, round: u32) -> Self {
        self.round = Some(round);
        self
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn with_error(mut self, error_type: impl Into<String>, message: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self.error_message = Some(message.into());
        self
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = detail;
        self
    }
}

/// Manifest stored next to a run's event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub schema_version: u32,
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Number of events appended so far.
    pub event_count: u64,
}

impl RunManifest {
    pub fn new(run_id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            schema_version: EVIDENCE_SCHEMA_VERSION,
            run_id: run_id.into(),
            created_at: timestamp,
            updated_at: timestamp,
            event_count: 0,
        }
    }

    /// Account for one more appended event.
    pub fn touch(&mut self, timestamp: DateTime<Utc>) {
        self.updated_at = timestamp;
        self.event_count = self.event_count.saturating_add(1);
    }
}
