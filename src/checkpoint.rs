//! Session checkpoint persistence: a single JSON snapshot, generalized from
//! `StateManager`'s append-only log (`src/orchestrator/state.rs`) since the
//! core spec calls for a snapshot rather than a log. The snapshot carries
//! every field §6 requires: phase, phase history, current group, completed/
//! failed task IDs, task→instance mapping, task commit counts, group
//! consolidated branches, group consolidator IDs, group consolidation
//! contexts, group decision, retry state, PR URLs, error string.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::session::Session;

pub const CHECKPOINT_FILENAME: &str = "session.json";

/// A session snapshot, serialized verbatim from [`Session`]. Kept as a
/// thin newtype (rather than re-deriving the same fields) so that
/// `Checkpoint::save`/`load` stay the single seam through which a session
/// is persisted, matching `StateManager::save`/`load`'s role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub session: Session,
}

pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    /// A checkpoint store rooted at `claudio_dir` (typically
    /// `RuntimeConfig::claudio_dir()`), persisting to `<dir>/session.json`.
    pub fn new(claudio_dir: impl AsRef<Path>) -> Self {
        Self { path: claudio_dir.as_ref().join(CHECKPOINT_FILENAME) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save(&self, session: &Session) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating checkpoint directory {}", parent.display()))?;
        }
        let checkpoint = Checkpoint { session: session.clone() };
        let json = serde_json::to_string_pretty(&checkpoint)
            .context("serializing session checkpoint")?;
        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, json)
            .with_context(|| format!("writing checkpoint to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("committing checkpoint to {}", self.path.display()))?;
        Ok(())
    }

    pub fn load(&self) -> anyhow::Result<Option<Session>> {
        if !self.path.is_file() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&self.path)
            .with_context(|| format!("reading checkpoint from {}", self.path.display()))?;
        let checkpoint: Checkpoint = serde_json::from_str(&raw)
            .with_context(|| format!("parsing checkpoint at {}", self.path.display()))?;
        Ok(Some(checkpoint.session))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase_machine::Phase;
    use tempfile::tempdir;

    #[test]
    fn round_trip_preserves_every_required_field() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());

        let mut session = Session::new("ship the feature", "claudio");
        session.current_phase = Phase::Execution;
        session.current_group_index = 1;
        session.mark_task_complete("t1", 3);
        session.mark_task_failed("t2");
        session.record_instance("t3", "instance-9");
        session.pr_urls.push("https://example.invalid/pr/1".to_string());
        session.error_message = Some("group 2 failed".to_string());

        store.save(&session).unwrap();
        let loaded = store.load().unwrap().unwrap();

        assert_eq!(loaded.current_phase, Phase::Execution);
        assert_eq!(loaded.current_group_index, 1);
        assert!(loaded.completed_tasks.contains("t1"));
        assert!(loaded.failed_tasks.contains("t2"));
        assert_eq!(loaded.task_instances.get("t3"), Some(&"instance-9".to_string()));
        assert_eq!(loaded.task_commit_counts.get("t1"), Some(&3));
        assert_eq!(loaded.pr_urls, vec!["https://example.invalid/pr/1".to_string()]);
        assert_eq!(loaded.error_message.as_deref(), Some("group 2 failed"));
        assert_eq!(loaded.session_id, session.session_id);
    }

    #[test]
    fn load_returns_none_when_no_checkpoint_exists() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn save_creates_parent_directory() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("nested").join(".claudio");
        let store = CheckpointStore::new(&nested);
        let session = Session::new("obj", "claudio");
        store.save(&session).unwrap();
        assert!(store.path().is_file());
    }
}
