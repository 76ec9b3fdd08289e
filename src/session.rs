//! The session aggregate: the single root of mutable orchestration state.
//!
//! Everything the orchestrators read or mutate hangs off a `Session` value,
//! reached through a `SessionHandle` (an `Arc<tokio::sync::Mutex<Session>>`)
//! so that persistence stays centralized behind one collaborator (see
//! [`crate::collaborators::SessionSaver`]) rather than scattered across
//! orchestrator-local state.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::phase_machine::{Phase, PhaseTransition};

pub type TaskId = String;

/// A single unit of work, immutable once planning has produced it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    pub description: String,
    pub expected_files: Vec<String>,
    /// True for tasks that are expected to produce no commits (e.g. pure
    /// investigation tasks); such tasks are never retried for lacking one.
    pub no_code: bool,
}

impl Task {
    pub fn new(id: impl Into<String>, title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: description.into(),
            expected_files: Vec::new(),
            no_code: false,
        }
    }

    pub fn with_expected_files(mut self, files: Vec<String>) -> Self {
        self.expected_files = files;
        self
    }

    pub fn with_no_code(mut self, no_code: bool) -> Self {
        self.no_code = no_code;
        self
    }
}

/// The ordered plan produced by the planning phase: a list of groups, each
/// a list of task IDs, plus the task definitions themselves.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Plan {
    pub tasks: HashMap<TaskId, Task>,
    pub execution_order: Vec<Vec<TaskId>>,
}

impl Plan {
    pub fn total_tasks(&self) -> usize {
        self.execution_order.iter().map(|g| g.len()).sum()
    }

    pub fn total_groups(&self) -> usize {
        self.execution_order.len()
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }
}

/// Status of a worker instance, as last observed by the execution loop.
/// Core code never creates or destroys instances directly — it only holds
/// IDs and this last-known status, per the worker-pool collaborator split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Running,
    Completed,
    WaitingInput,
    Error,
    Timeout,
    Stuck,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Running => "running",
            InstanceStatus::Completed => "completed",
            InstanceStatus::WaitingInput => "waiting_input",
            InstanceStatus::Error => "error",
            InstanceStatus::Timeout => "timeout",
            InstanceStatus::Stuck => "stuck",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "running" => Ok(InstanceStatus::Running),
            "completed" => Ok(InstanceStatus::Completed),
            "waiting_input" => Ok(InstanceStatus::WaitingInput),
            "error" => Ok(InstanceStatus::Error),
            "timeout" => Ok(InstanceStatus::Timeout),
            "stuck" => Ok(InstanceStatus::Stuck),
            other => Err(format!("invalid instance status: {other}")),
        }
    }

    /// Whether this status, if observed without a sentinel file present,
    /// should be treated as a failure by the fallback poller. `WaitingInput`
    /// is deliberately excluded: it is never treated as completion.
    pub fn is_fallback_failure(&self) -> bool {
        matches!(self, InstanceStatus::Error | InstanceStatus::Timeout | InstanceStatus::Stuck)
    }
}

/// Everything the core knows about a worker instance: identifiers and
/// last-observed status. Instances themselves are owned by the worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInstance {
    pub id: String,
    pub worktree_path: std::path::PathBuf,
    pub branch: String,
    pub status: InstanceStatus,
}

/// Ephemeral record describing the outcome of one task's execution,
/// produced by the monitor/fallback poller and consumed once by the
/// execution loop's completion handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCompletionRecord {
    pub task_id: TaskId,
    pub instance_id: String,
    pub success: bool,
    pub error: Option<String>,
    pub needs_retry: bool,
    pub commit_count: usize,
}

/// Per-task retry bookkeeping: at most one retry is ever granted.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryState {
    pub attempted: bool,
}

/// A single conflict resolution recorded during cherry-pick consolidation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictResolution {
    pub file: String,
    pub resolution: String,
}

/// Result of one verification command run against a consolidated branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub name: String,
    pub command: String,
    pub success: bool,
    pub output: String,
}

/// Aggregated verification outcome for a group's consolidated branch.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VerificationResult {
    pub project_type: String,
    pub commands_run: Vec<CommandResult>,
    pub overall_success: bool,
}

/// Context aggregated from all tasks in a group, carried forward into the
/// next group's consolidator prompt.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AggregatedContext {
    pub task_summaries: HashMap<TaskId, String>,
    pub all_issues: Vec<String>,
    pub all_suggestions: Vec<String>,
    pub dependencies: Vec<String>,
    pub notes: Vec<String>,
}

/// Status of one group's consolidation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupConsolidationStatus {
    Complete,
    Partial,
    Failed,
}

/// The persisted record of one group's consolidation, indexed by group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConsolidationRecord {
    pub group_index: usize,
    pub status: GroupConsolidationStatus,
    pub consolidated_branch: String,
    pub tasks_included: Vec<TaskId>,
    pub conflicts_resolved: Vec<ConflictResolution>,
    pub verification: VerificationResult,
    pub aggregated_context: AggregatedContext,
    pub notes: String,
    pub issues_for_next_group: Vec<String>,
}

/// Ephemeral record of a partial group failure awaiting user arbitration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupDecision {
    pub group_index: usize,
    pub succeeded: Vec<TaskId>,
    pub failed: Vec<TaskId>,
    pub awaiting_decision: bool,
}

/// A cherry-pick conflict that has paused consolidation, pending operator
/// resolution via `RepositoryOperator::continue_cherry_pick`/`abort`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictState {
    pub task_id: TaskId,
    pub worktree_path: std::path::PathBuf,
    pub files: Vec<String>,
}

/// The session aggregate (§3). Owns every piece of mutable orchestration
/// state; invariants I1–I5 are maintained by the mutation methods below
/// rather than left to callers to uphold by convention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: Uuid,
    pub objective: String,
    pub plan: Option<Plan>,
    pub current_group_index: usize,
    pub current_phase: Phase,
    pub phase_history: Vec<PhaseTransition>,
    pub task_instances: HashMap<TaskId, String>,
    pub task_commit_counts: HashMap<TaskId, usize>,
    pub group_consolidated_branches: HashMap<usize, String>,
    pub group_consolidator_instance_ids: HashMap<usize, String>,
    pub group_consolidation_contexts: HashMap<usize, GroupConsolidationRecord>,
    pub completed_tasks: HashSet<TaskId>,
    pub failed_tasks: HashSet<TaskId>,
    pub retry_state: HashMap<TaskId, RetryState>,
    pub group_decision: Option<GroupDecision>,
    pub pr_urls: Vec<String>,
    pub error_message: Option<String>,
    pub branch_prefix: String,
    pub conflict: Option<ConflictState>,
    /// True once planning has issued its spawn call; purely observational,
    /// never a precondition (see SPEC_FULL.md §13's single-spawn-path decision).
    pub planning_awaiting_completion: bool,
    /// Coordinator instance IDs dispatched by the planning orchestrator
    /// (§4.3(4): "Record coordinator instance ID on the session"), so a
    /// resumed run can still see which coordinators were spawned even
    /// though `PlanningOrchestrator` itself does not survive a reload.
    pub coordinator_instance_ids: Vec<String>,
    /// The plan-selection worker's instance ID, once multi-pass planning has
    /// spawned one.
    pub selector_instance_id: Option<String>,
}

impl Session {
    pub fn new(objective: impl Into<String>, branch_prefix: impl Into<String>) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            objective: objective.into(),
            plan: None,
            current_group_index: 0,
            current_phase: Phase::Planning,
            phase_history: Vec::new(),
            task_instances: HashMap::new(),
            task_commit_counts: HashMap::new(),
            group_consolidated_branches: HashMap::new(),
            group_consolidator_instance_ids: HashMap::new(),
            group_consolidation_contexts: HashMap::new(),
            completed_tasks: HashSet::new(),
            failed_tasks: HashSet::new(),
            retry_state: HashMap::new(),
            group_decision: None,
            pr_urls: Vec::new(),
            error_message: None,
            branch_prefix: branch_prefix.into(),
            conflict: None,
            planning_awaiting_completion: false,
            coordinator_instance_ids: Vec::new(),
            selector_instance_id: None,
        }
    }

    /// Every task ID belonging to `group_index`, in plan order (I1: each
    /// task belongs to exactly one group, derived from `execution_order`).
    pub fn group_tasks(&self, group_index: usize) -> Vec<TaskId> {
        self.plan
            .as_ref()
            .and_then(|p| p.execution_order.get(group_index))
            .cloned()
            .unwrap_or_default()
    }

    pub fn total_tasks(&self) -> usize {
        self.plan.as_ref().map(Plan::total_tasks).unwrap_or(0)
    }

    pub fn total_groups(&self) -> usize {
        self.plan.as_ref().map(Plan::total_groups).unwrap_or(0)
    }

    /// Record a running instance for a task, without marking completion.
    pub fn record_instance(&mut self, task_id: impl Into<String>, instance_id: impl Into<String>) {
        self.task_instances.insert(task_id.into(), instance_id.into());
    }

    /// Record a planning coordinator's instance ID, so it survives a
    /// checkpoint reload even after `PlanningOrchestrator` itself is gone.
    pub fn record_coordinator_instance(&mut self, instance_id: impl Into<String>) {
        self.coordinator_instance_ids.push(instance_id.into());
    }

    /// Record the plan-selection worker's instance ID.
    pub fn record_selector_instance(&mut self, instance_id: impl Into<String>) {
        self.selector_instance_id = Some(instance_id.into());
    }

    /// Mark a task complete. Preserves I2 by removing any stale failed
    /// membership first; idempotent under duplicate completions.
    pub fn mark_task_complete(&mut self, task_id: &str, commit_count: usize) {
        self.failed_tasks.remove(task_id);
        self.completed_tasks.insert(task_id.to_string());
        self.task_commit_counts.insert(task_id.to_string(), commit_count);
    }

    /// Mark a task failed. Preserves I2 symmetrically with `mark_task_complete`.
    pub fn mark_task_failed(&mut self, task_id: &str) {
        self.completed_tasks.remove(task_id);
        self.failed_tasks.insert(task_id.to_string());
    }

    /// Clear a task's completion/failure membership and instance mapping so
    /// the dispatch loop re-picks it up after `needs_retry` (the instance
    /// mapping is cleared too: the next dispatch must mint a fresh instance).
    pub fn clear_for_retry(&mut self, task_id: &str) {
        self.completed_tasks.remove(task_id);
        self.failed_tasks.remove(task_id);
        self.task_instances.remove(task_id);
        self.retry_state.entry(task_id.to_string()).or_default().attempted = true;
    }

    pub fn has_retried(&self, task_id: &str) -> bool {
        self.retry_state.get(task_id).map(|r| r.attempted).unwrap_or(false)
    }

    /// I3: a `GroupDecision` may only exist while in `Execution`, pinned to
    /// the current group index.
    pub fn set_group_decision(&mut self, decision: GroupDecision) {
        debug_assert_eq!(self.current_phase, Phase::Execution);
        debug_assert_eq!(decision.group_index, self.current_group_index);
        self.group_decision = Some(decision);
    }

    pub fn clear_group_decision(&mut self) {
        self.group_decision = None;
    }

    /// I4: a consolidated branch is only set once a group's consolidation
    /// has actually completed; this is the single place that happens.
    pub fn record_group_consolidation(&mut self, record: GroupConsolidationRecord) {
        let group_index = record.group_index;
        self.group_consolidated_branches
            .insert(group_index, record.consolidated_branch.clone());
        self.group_consolidation_contexts.insert(group_index, record);
    }

    pub fn advance_group(&mut self) {
        self.current_group_index += 1;
    }

    pub fn set_conflict(&mut self, conflict: ConflictState) {
        self.conflict = Some(conflict);
    }

    pub fn clear_conflict(&mut self) {
        self.conflict = None;
    }

    /// Resets all state for groups >= `target`, for use by `retrigger_group`.
    /// Does not touch groups below `target`, preserving their consolidated
    /// branches and PR history.
    pub fn reset_from_group(&mut self, target: usize) {
        let task_ids: Vec<TaskId> = self
            .plan
            .as_ref()
            .map(|p| p.execution_order.iter().skip(target).flatten().cloned().collect())
            .unwrap_or_default();

        for id in &task_ids {
            self.completed_tasks.remove(id);
            self.failed_tasks.remove(id);
            self.task_instances.remove(id);
            self.task_commit_counts.remove(id);
            self.retry_state.remove(id);
        }

        self.group_consolidated_branches.retain(|g, _| *g < target);
        self.group_consolidator_instance_ids.retain(|g, _| *g < target);
        self.group_consolidation_contexts.retain(|g, _| *g < target);
        self.group_decision = None;
        self.current_group_index = target;
        self.conflict = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan_with_two_groups() -> Plan {
        let mut tasks = HashMap::new();
        tasks.insert("t1".to_string(), Task::new("t1", "Task 1", "desc"));
        tasks.insert("t2".to_string(), Task::new("t2", "Task 2", "desc"));
        tasks.insert("t3".to_string(), Task::new("t3", "Task 3", "desc"));
        Plan {
            tasks,
            execution_order: vec![vec!["t1".to_string(), "t2".to_string()], vec!["t3".to_string()]],
        }
    }

    #[test]
    fn mark_complete_then_failed_preserves_i2_disjointness() {
        let mut session = Session::new("obj", "claudio");
        session.mark_task_complete("t1", 2);
        assert!(session.completed_tasks.contains("t1"));
        session.mark_task_failed("t1");
        assert!(!session.completed_tasks.contains("t1"));
        assert!(session.failed_tasks.contains("t1"));
    }

    #[test]
    fn clear_for_retry_removes_membership_and_marks_attempted() {
        let mut session = Session::new("obj", "claudio");
        session.mark_task_failed("t1");
        session.clear_for_retry("t1");
        assert!(!session.failed_tasks.contains("t1"));
        assert!(!session.completed_tasks.contains("t1"));
        assert!(session.has_retried("t1"));
    }

    #[test]
    fn reset_from_group_preserves_earlier_groups() {
        let mut session = Session::new("obj", "claudio");
        session.plan = Some(plan_with_two_groups());
        session.mark_task_complete("t1", 1);
        session.mark_task_complete("t2", 1);
        session.record_group_consolidation(GroupConsolidationRecord {
            group_index: 0,
            status: GroupConsolidationStatus::Complete,
            consolidated_branch: "claudio/group-1".to_string(),
            tasks_included: vec!["t1".to_string(), "t2".to_string()],
            conflicts_resolved: vec![],
            verification: VerificationResult::default(),
            aggregated_context: AggregatedContext::default(),
            notes: String::new(),
            issues_for_next_group: vec![],
        });
        session.advance_group();
        session.mark_task_failed("t3");

        session.reset_from_group(1);

        assert!(session.completed_tasks.contains("t1"));
        assert!(session.completed_tasks.contains("t2"));
        assert!(!session.failed_tasks.contains("t3"));
        assert_eq!(session.current_group_index, 1);
        assert!(session.group_consolidated_branches.contains_key(&0));
    }

    #[test]
    fn group_tasks_returns_plan_order() {
        let mut session = Session::new("obj", "claudio");
        session.plan = Some(plan_with_two_groups());
        assert_eq!(session.group_tasks(0), vec!["t1".to_string(), "t2".to_string()]);
        assert_eq!(session.group_tasks(1), vec!["t3".to_string()]);
        assert_eq!(session.group_tasks(2), Vec::<TaskId>::new());
    }

    #[test]
    fn instance_status_round_trips_through_as_str() {
        for status in [
            InstanceStatus::Running,
            InstanceStatus::Completed,
            InstanceStatus::WaitingInput,
            InstanceStatus::Error,
            InstanceStatus::Timeout,
            InstanceStatus::Stuck,
        ] {
            let parsed = InstanceStatus::from_str(status.as_str()).unwrap();
            assert_eq!(parsed, status);
        }
        assert!(InstanceStatus::from_str("bogus").is_err());
    }

    #[test]
    fn waiting_input_is_never_a_fallback_failure() {
        assert!(!InstanceStatus::WaitingInput.is_fallback_failure());
        assert!(InstanceStatus::Error.is_fallback_failure());
        assert!(InstanceStatus::Stuck.is_fallback_failure());
    }

    #[test]
    fn duplicate_completion_is_idempotent() {
        let mut session = Session::new("obj", "claudio");
        session.mark_task_complete("t1", 3);
        session.mark_task_complete("t1", 3);
        assert_eq!(session.completed_tasks.len(), 1);
        assert_eq!(session.task_commit_counts.get("t1"), Some(&3));
    }
}
