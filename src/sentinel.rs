//! Persisted JSON sentinel artifacts written by workers and read by the
//! core. The sentinel *file's presence* is the only authoritative
//! completion signal (§4.4/§9) — status polling is a narrowly scoped
//! fallback, guarded elsewhere by a tmux-liveness check.

use std::path::Path;

use serde::{Deserialize, Serialize};

pub const TASK_COMPLETE_FILENAME: &str = ".claudio-task-complete.json";
pub const REVISION_COMPLETE_FILENAME: &str = ".claudio-revision-complete.json";
pub const GROUP_CONSOLIDATION_COMPLETE_FILENAME: &str = ".claudio-group-consolidation-complete.json";

/// Status a worker reports for itself in a task/revision sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskSentinelStatus {
    Complete,
    Blocked,
    Failed,
}

/// `.claudio-task-complete.json` / `.claudio-revision-complete.json` — the
/// two sentinels share this shape; only the filename distinguishes them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSentinel {
    pub task_id: String,
    pub status: TaskSentinelStatus,
    pub summary: String,
    #[serde(default)]
    pub files_modified: Vec<String>,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl TaskSentinel {
    /// Whether either sentinel file exists in `worktree_path`. This is the
    /// entire implementation of `CheckCompletionFile` — no content parsing
    /// is needed for mere presence detection.
    pub fn exists_in(worktree_path: &Path) -> bool {
        worktree_path.join(TASK_COMPLETE_FILENAME).is_file()
            || worktree_path.join(REVISION_COMPLETE_FILENAME).is_file()
    }

    /// Reads and parses whichever sentinel is present, preferring the task
    /// sentinel if (implausibly) both exist.
    pub fn read_from(worktree_path: &Path) -> Result<Option<Self>, SentinelReadError> {
        for name in [TASK_COMPLETE_FILENAME, REVISION_COMPLETE_FILENAME] {
            let path = worktree_path.join(name);
            if path.is_file() {
                let raw = std::fs::read_to_string(&path)
                    .map_err(|source| SentinelReadError::Io { path: path.clone(), source })?;
                let sentinel: TaskSentinel = serde_json::from_str(&raw)
                    .map_err(|source| SentinelReadError::Parse { path, source })?;
                return Ok(Some(sentinel));
            }
        }
        Ok(None)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SentinelReadError {
    #[error("failed to read sentinel file {}: {source}", path.display())]
    Io { path: std::path::PathBuf, #[source] source: std::io::Error },
    #[error("failed to parse sentinel file {}: {source}", path.display())]
    Parse { path: std::path::PathBuf, #[source] source: serde_json::Error },
}

/// One conflict resolution recorded in a group consolidation sentinel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentinelConflictResolution {
    pub file: String,
    pub resolution: String,
}

/// One verification command result recorded in a group consolidation sentinel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentinelCommandResult {
    pub name: String,
    pub command: String,
    pub success: bool,
    pub output: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentinelVerification {
    pub project_type: String,
    #[serde(default)]
    pub commands_run: Vec<SentinelCommandResult>,
    pub overall_success: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SentinelAggregatedContext {
    #[serde(default)]
    pub task_summaries: std::collections::HashMap<String, String>,
    #[serde(default)]
    pub all_issues: Vec<String>,
    #[serde(default)]
    pub all_suggestions: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub notes: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupSentinelStatus {
    Complete,
    Partial,
    Failed,
}

/// `.claudio-group-consolidation-complete.json`, written by the
/// consolidator worker once it finishes a group's consolidation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConsolidationSentinel {
    pub group_index: usize,
    pub status: GroupSentinelStatus,
    pub branch_name: String,
    #[serde(default)]
    pub tasks_consolidated: Vec<String>,
    #[serde(default)]
    pub conflicts_resolved: Vec<SentinelConflictResolution>,
    pub verification: SentinelVerification,
    #[serde(default)]
    pub aggregated_context: SentinelAggregatedContext,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub issues_for_next_group: Vec<String>,
}

impl GroupConsolidationSentinel {
    pub fn path_in(worktree_path: &Path) -> std::path::PathBuf {
        worktree_path.join(GROUP_CONSOLIDATION_COMPLETE_FILENAME)
    }

    pub fn exists_in(worktree_path: &Path) -> bool {
        Self::path_in(worktree_path).is_file()
    }

    pub fn read_from(worktree_path: &Path) -> Result<Option<Self>, SentinelReadError> {
        let path = Self::path_in(worktree_path);
        if !path.is_file() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&path)
            .map_err(|source| SentinelReadError::Io { path: path.clone(), source })?;
        let sentinel = serde_json::from_str(&raw)
            .map_err(|source| SentinelReadError::Parse { path, source })?;
        Ok(Some(sentinel))
    }
}

/// One group's result within the final-consolidation output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalGroupResult {
    pub group_index: usize,
    pub branch_name: String,
    pub tasks_included: Vec<String>,
    pub commit_count: usize,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One pull request opened during final consolidation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequestRecord {
    pub url: String,
    pub title: String,
    pub group_index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalConsolidationMode {
    Stacked,
    Single,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalConsolidationStatus {
    Complete,
    Failed,
}

/// The top-level output of final consolidation: one PR per group (stacked)
/// or a single combined PR (single), plus a summary of what was merged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalConsolidationOutput {
    pub status: FinalConsolidationStatus,
    pub mode: FinalConsolidationMode,
    pub group_results: Vec<FinalGroupResult>,
    pub prs_created: Vec<PullRequestRecord>,
    pub total_commits: usize,
    pub files_changed: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn exists_in_detects_task_sentinel() {
        let dir = tempdir().unwrap();
        assert!(!TaskSentinel::exists_in(dir.path()));
        std::fs::write(dir.path().join(TASK_COMPLETE_FILENAME), "{}").unwrap();
        assert!(TaskSentinel::exists_in(dir.path()));
    }

    #[test]
    fn exists_in_detects_revision_sentinel() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(REVISION_COMPLETE_FILENAME), "{}").unwrap();
        assert!(TaskSentinel::exists_in(dir.path()));
    }

    #[test]
    fn read_from_parses_task_sentinel() {
        let dir = tempdir().unwrap();
        let contents = serde_json::json!({
            "task_id": "t1",
            "status": "complete",
            "summary": "did the thing",
            "files_modified": ["src/lib.rs"],
            "notes": "",
            "issues": [],
            "suggestions": [],
            "dependencies": []
        });
        std::fs::write(
            dir.path().join(TASK_COMPLETE_FILENAME),
            serde_json::to_string(&contents).unwrap(),
        )
        .unwrap();

        let sentinel = TaskSentinel::read_from(dir.path()).unwrap().unwrap();
        assert_eq!(sentinel.task_id, "t1");
        assert_eq!(sentinel.status, TaskSentinelStatus::Complete);
        assert_eq!(sentinel.files_modified, vec!["src/lib.rs".to_string()]);
    }

    #[test]
    fn read_from_returns_none_when_absent() {
        let dir = tempdir().unwrap();
        assert!(TaskSentinel::read_from(dir.path()).unwrap().is_none());
    }

    #[test]
    fn read_from_surfaces_parse_errors() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(TASK_COMPLETE_FILENAME), "not json").unwrap();
        let err = TaskSentinel::read_from(dir.path()).unwrap_err();
        assert!(matches!(err, SentinelReadError::Parse { .. }));
    }

    #[test]
    fn group_consolidation_sentinel_round_trips() {
        let dir = tempdir().unwrap();
        let sentinel = GroupConsolidationSentinel {
            group_index: 0,
            status: GroupSentinelStatus::Complete,
            branch_name: "claudio/ultraplan-abcd1234-group-1".to_string(),
            tasks_consolidated: vec!["t1".to_string()],
            conflicts_resolved: vec![],
            verification: SentinelVerification {
                project_type: "rust".to_string(),
                commands_run: vec![],
                overall_success: true,
            },
            aggregated_context: SentinelAggregatedContext::default(),
            notes: String::new(),
            issues_for_next_group: vec![],
        };
        std::fs::write(
            GroupConsolidationSentinel::path_in(dir.path()),
            serde_json::to_string(&sentinel).unwrap(),
        )
        .unwrap();

        assert!(GroupConsolidationSentinel::exists_in(dir.path()));
        let parsed = GroupConsolidationSentinel::read_from(dir.path()).unwrap().unwrap();
        assert_eq!(parsed.group_index, 0);
        assert_eq!(parsed.status, GroupSentinelStatus::Complete);
    }

    #[test]
    fn final_consolidation_output_serializes_optional_error() {
        let output = FinalConsolidationOutput {
            status: FinalConsolidationStatus::Complete,
            mode: FinalConsolidationMode::Stacked,
            group_results: vec![FinalGroupResult {
                group_index: 0,
                branch_name: "b".to_string(),
                tasks_included: vec!["t1".to_string()],
                commit_count: 2,
                success: true,
                error: None,
            }],
            prs_created: vec![],
            total_commits: 2,
            files_changed: vec![],
        };
        let json = serde_json::to_value(&output).unwrap();
        assert!(json["group_results"][0].get("error").is_none());
    }
}
