//! C6: task verification — commit-count-based success/retry/failure
//! determination, plus the sentinel-presence check the monitor loop polls
//! on its fallback pass.
//!
//! Commit counting goes through the [`crate::collaborators::RepositoryOperator`]
//! trait rather than `git2` directly: `count_commits_between` walks the
//! worktree's HEAD back to `base`, the same shape as the teacher's
//! `GitTracker` but counting commits between two refs instead of diffing a
//! snapshot against the working tree.

use std::path::Path;
use std::sync::Arc;

use crate::collaborators::RepositoryOperator;
use crate::sentinel::TaskSentinel;
use crate::session::TaskId;

/// Options controlling verification policy for one task.
#[derive(Debug, Clone, Copy, Default)]
pub struct VerifyOptions {
    /// True for tasks expected to produce no commits (pure investigation,
    /// review-only tasks); zero commits is then a success, never a retry.
    pub no_code: bool,
}

#[derive(Debug, Clone)]
pub struct VerificationOutcome {
    pub task_id: TaskId,
    pub success: bool,
    pub needs_retry: bool,
    pub commit_count: usize,
}

pub struct TaskVerifier {
    repo: Arc<dyn RepositoryOperator>,
}

impl TaskVerifier {
    pub fn new(repo: Arc<dyn RepositoryOperator>) -> Self {
        Self { repo }
    }

    /// The only authoritative completion signal: does either sentinel file
    /// exist in the worktree.
    pub fn check_completion_file(&self, worktree_path: &Path) -> bool {
        TaskSentinel::exists_in(worktree_path)
    }

    /// Counts commits between `base_branch` and the worktree's HEAD and
    /// applies the noCode/retry policy (§4.6):
    /// - `opts.no_code == true`: any commit count succeeds, never retried.
    /// - commit count == 0 and not noCode: fails with `needs_retry = true`,
    ///   but only on the task's first attempt — callers must not call this
    ///   a second time expecting another retry grant; that is enforced by
    ///   `Session::has_retried`, not here.
    /// - commit count > 0: success.
    pub async fn verify_task_work(
        &self,
        task_id: &str,
        worktree_path: &Path,
        base_branch: &str,
        opts: VerifyOptions,
    ) -> Result<VerificationOutcome, crate::errors::CollaboratorError> {
        let commit_count = self.repo.count_commits_between(base_branch, worktree_path).await?;

        if opts.no_code {
            return Ok(VerificationOutcome {
                task_id: task_id.to_string(),
                success: true,
                needs_retry: false,
                commit_count,
            });
        }

        if commit_count == 0 {
            return Ok(VerificationOutcome {
                task_id: task_id.to_string(),
                success: false,
                needs_retry: true,
                commit_count: 0,
            });
        }

        Ok(VerificationOutcome {
            task_id: task_id.to_string(),
            success: true,
            needs_retry: false,
            commit_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::fakes::FakeRepositoryOperator;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn verifier_with_counts(worktree: &Path, count: usize) -> TaskVerifier {
        let repo = FakeRepositoryOperator::new();
        repo.seed_commit_count(&worktree.to_string_lossy(), count);
        TaskVerifier::new(Arc::new(repo))
    }

    #[tokio::test]
    async fn zero_commits_without_no_code_needs_retry() {
        let worktree = PathBuf::from("/tmp/claudio-wt-1");
        let verifier = verifier_with_counts(&worktree, 0);
        let outcome = verifier
            .verify_task_work("t1", &worktree, "main", VerifyOptions { no_code: false })
            .await
            .unwrap();
        assert!(!outcome.success);
        assert!(outcome.needs_retry);
        assert_eq!(outcome.commit_count, 0);
    }

    #[tokio::test]
    async fn zero_commits_with_no_code_succeeds_without_retry() {
        let worktree = PathBuf::from("/tmp/claudio-wt-2");
        let verifier = verifier_with_counts(&worktree, 0);
        let outcome = verifier
            .verify_task_work("t1", &worktree, "main", VerifyOptions { no_code: true })
            .await
            .unwrap();
        assert!(outcome.success);
        assert!(!outcome.needs_retry);
    }

    #[tokio::test]
    async fn nonzero_commits_succeeds() {
        let worktree = PathBuf::from("/tmp/claudio-wt-3");
        let verifier = verifier_with_counts(&worktree, 3);
        let outcome = verifier
            .verify_task_work("t1", &worktree, "main", VerifyOptions { no_code: false })
            .await
            .unwrap();
        assert!(outcome.success);
        assert!(!outcome.needs_retry);
        assert_eq!(outcome.commit_count, 3);
    }

    #[test]
    fn check_completion_file_detects_either_sentinel() {
        let dir = tempdir().unwrap();
        let repo = FakeRepositoryOperator::new();
        let verifier = TaskVerifier::new(Arc::new(repo));
        assert!(!verifier.check_completion_file(dir.path()));
        std::fs::write(dir.path().join(".claudio-task-complete.json"), "{}").unwrap();
        assert!(verifier.check_completion_file(dir.path()));
    }
}
