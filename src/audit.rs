//! Structured, observational audit trail of phase transitions and task
//! completions (SPEC_FULL.md supplementary features). Written as one JSON
//! object per line so each event is appended independently, unlike the
//! teacher's single `AuditRun` document (`src/audit/mod.rs`) that gets
//! rewritten wholesale on every `save_current`; this log only ever grows
//! and is consulted after the fact — nothing here feeds back into
//! `PhaseManager` or the orchestrators.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::phase_machine::Phase;
use crate::session::TaskId;

pub const AUDIT_LOG_FILENAME: &str = "audit.ndjson";

/// One audit record. Every variant carries its own timestamp rather than
/// relying on file-append order, so a reordered or concatenated log is
/// still interpretable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    PhaseEntered { phase: Phase, at: DateTime<Utc> },
    PhaseExited { phase: Phase, at: DateTime<Utc>, duration_secs: f64 },
    TaskCompleted { task_id: TaskId, commit_count: usize, at: DateTime<Utc> },
    TaskFailed { task_id: TaskId, error: String, at: DateTime<Utc> },
    GroupConsolidated { group_index: usize, branch: String, at: DateTime<Utc> },
}

/// Append-only NDJSON sink for [`AuditEvent`]s, rooted at
/// `<claudio_dir>/audit.ndjson`.
pub struct AuditTrail {
    path: PathBuf,
}

impl AuditTrail {
    pub fn new(claudio_dir: impl AsRef<Path>) -> Self {
        Self { path: claudio_dir.as_ref().join(AUDIT_LOG_FILENAME) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one event as a single JSON line. Returns an error on I/O
    /// failure rather than swallowing it, but callers must treat a failed
    /// `record` as non-fatal to orchestration: the audit trail is
    /// observational only and never gates a phase transition or dispatch
    /// decision.
    pub fn record(&self, event: &AuditEvent) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating audit directory {}", parent.display()))?;
        }
        let line = serde_json::to_string(event).context("serializing audit event")?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("opening audit log {}", self.path.display()))?;
        writeln!(file, "{line}").with_context(|| format!("appending to audit log {}", self.path.display()))?;
        Ok(())
    }

    /// Reads every event back in append order. Used by `claudio status` and
    /// by tests; never by the orchestrators themselves.
    pub fn read_all(&self) -> anyhow::Result<Vec<AuditEvent>> {
        if !self.path.is_file() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&self.path)
            .with_context(|| format!("reading audit log {}", self.path.display()))?;
        raw.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).context("parsing audit event"))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn record_then_read_all_round_trips_in_order() {
        let dir = tempdir().unwrap();
        let trail = AuditTrail::new(dir.path());

        trail.record(&AuditEvent::PhaseEntered { phase: Phase::Planning, at: Utc::now() }).unwrap();
        trail
            .record(&AuditEvent::TaskCompleted { task_id: "t1".to_string(), commit_count: 2, at: Utc::now() })
            .unwrap();

        let events = trail.read_all().unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], AuditEvent::PhaseEntered { phase: Phase::Planning, .. }));
        assert!(matches!(&events[1], AuditEvent::TaskCompleted { task_id, commit_count: 2, .. } if task_id == "t1"));
    }

    #[test]
    fn read_all_returns_empty_when_no_log_exists() {
        let dir = tempdir().unwrap();
        let trail = AuditTrail::new(dir.path());
        assert!(trail.read_all().unwrap().is_empty());
    }

    #[test]
    fn each_event_is_one_line() {
        let dir = tempdir().unwrap();
        let trail = AuditTrail::new(dir.path());
        trail.record(&AuditEvent::PhaseExited { phase: Phase::Execution, at: Utc::now(), duration_secs: 12.5 }).unwrap();
        trail
            .record(&AuditEvent::GroupConsolidated { group_index: 0, branch: "claudio/group-1".to_string(), at: Utc::now() })
            .unwrap();

        let raw = std::fs::read_to_string(trail.path()).unwrap();
        assert_eq!(raw.lines().count(), 2);
    }
}
