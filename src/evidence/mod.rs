//! Evidence journal: JSONL lifecycle events per run.

pub mod event;
pub mod store;
pub mod writer;

pub use event::{EventKind, EvidenceRecord, RunManifest, EVIDENCE_SCHEMA_VERSION};
pub use store::{EvidenceError, EvidenceResult, EvidenceStore, RETENTION_ENV_VAR};
pub use writer::{generate_run_id, EvidenceWriter};
