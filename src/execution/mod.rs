//! C4: the execution orchestrator.
//!
//! Dispatches each group's tasks to worker instances bounded by
//! `RuntimeConfig::max_parallel`, consumes completion records off a single
//! channel fed by per-instance monitors (`monitor`) and a fallback poller,
//! hands a completed group to the consolidation orchestrator (C5)
//! synchronously, and arbitrates partial-group failures per §4.4.
//!
//! Grounded on `src/dag/executor.rs`'s `DagExecutor::execute` loop: a
//! semaphore-free variant of the same shape (ready-set → spawn bounded by
//! `max_parallel` → wait on a completion channel → re-check readiness →
//! idle-sleep), adapted from a dependency-graph wave scheduler to the
//! group-linear scheduler this system uses, plus `src/swarm/executor.rs`'s
//! `tokio::select!`-free single-consumer channel pattern.

mod monitor;

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex};

use crate::audit::{AuditEvent, AuditTrail};
use crate::collaborators::{RepositoryOperator, SessionSaver, WorkerPool};
use crate::config::RuntimeConfig;
use crate::consolidation::ConsolidationOrchestrator;
use crate::context::ProgressCallbacks;
use crate::errors::ExecutionError;
use crate::group_tracker::{self, ExecutionOrder};
use crate::phase_machine::{Phase, PhaseError, PhaseManager};
use crate::prompts::build_task_prompt;
use crate::session::{GroupDecision, Session, Task, TaskCompletionRecord, TaskId};
use crate::verifier::{TaskVerifier, VerifyOptions};

/// Tracks which tasks are currently dispatched and which completions have
/// already been folded into session state, so a duplicate record (the
/// monitor and the fallback poller can both observe the same sentinel)
/// is dropped rather than double-counted (§9 "Duplicate completions are
/// expected").
#[derive(Default)]
struct LoopState {
    running: HashSet<TaskId>,
    processed: HashSet<TaskId>,
}

/// The execution orchestrator (C4).
pub struct ExecutionOrchestrator {
    phase_manager: Arc<PhaseManager>,
    worker_pool: Arc<dyn WorkerPool>,
    repo: Arc<dyn RepositoryOperator>,
    session_saver: Arc<dyn SessionSaver>,
    consolidation: Arc<ConsolidationOrchestrator>,
    verifier: TaskVerifier,
    session: Arc<Mutex<Session>>,
    config: RuntimeConfig,
    callbacks: ProgressCallbacks,
    cancelled: Arc<AtomicBool>,
    state: Mutex<LoopState>,
    completion_tx: mpsc::Sender<TaskCompletionRecord>,
    completion_rx: Mutex<mpsc::Receiver<TaskCompletionRecord>>,
    /// Observational only (§9): a failed `record` here never affects
    /// dispatch or consolidation outcomes.
    audit: Option<Arc<AuditTrail>>,
}

impl ExecutionOrchestrator {
    pub fn new(
        phase_manager: Arc<PhaseManager>,
        worker_pool: Arc<dyn WorkerPool>,
        repo: Arc<dyn RepositoryOperator>,
        session_saver: Arc<dyn SessionSaver>,
        session: Arc<Mutex<Session>>,
        config: RuntimeConfig,
        callbacks: ProgressCallbacks,
    ) -> Self {
        let consolidation = Arc::new(ConsolidationOrchestrator::new(repo.clone(), worker_pool.clone()));
        let verifier = TaskVerifier::new(repo.clone());
        let (completion_tx, completion_rx) = mpsc::channel(100);
        Self {
            phase_manager,
            worker_pool,
            repo,
            session_saver,
            consolidation,
            verifier,
            session,
            config,
            callbacks,
            cancelled: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(LoopState::default()),
            completion_tx,
            completion_rx: Mutex::new(completion_rx),
            audit: None,
        }
    }

    /// Attaches an audit trail to record task-completion and group-
    /// consolidation events during `run`. Optional: a caller that doesn't
    /// need the audit trail simply never calls this.
    pub fn with_audit(mut self, audit: Arc<AuditTrail>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Idempotent: repeated calls are no-ops. Stops monitors from reporting
    /// further and causes `run` to return `ExecutionError::Cancelled` at its
    /// next loop iteration.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Runs the dispatch loop until every task has resolved and the session
    /// has transitioned out of `Execution` (to `Synthesis`, `Complete`, or
    /// `Failed`), or until cancellation or an unresolved consolidation
    /// conflict interrupts it. On the conflict path, the caller resolves the
    /// conflict out of band and calls [`Self::resume_after_conflict`], then
    /// `run` again to continue.
    pub async fn run(&self) -> Result<(), ExecutionError> {
        self.ensure_execution_phase()?;

        loop {
            if self.cancelled.load(Ordering::SeqCst) {
                return Err(ExecutionError::Cancelled);
            }
            if self.phase_manager.current_phase() != Phase::Execution {
                return Ok(());
            }

            let mut did_work = false;

            let maybe_record = { self.completion_rx.lock().await.try_recv().ok() };
            if let Some(record) = maybe_record {
                self.handle_completion(record).await?;
                did_work = true;
            }

            if self.poll_fallback_pass().await? {
                did_work = true;
            }

            if self.dispatch_pass().await? {
                did_work = true;
            }

            if self.phase_manager.current_phase() != Phase::Execution {
                return Ok(());
            }

            if !did_work {
                tokio::time::sleep(self.config.completion_poll_interval).await;
            }
        }
    }

    fn ensure_execution_phase(&self) -> Result<(), ExecutionError> {
        self.phase_manager
            .transition_to(Phase::Execution, "execution started", HashMap::new(), None)
            .or_else(|e| match e {
                PhaseError::AlreadyInPhase(Phase::Execution) => Ok(()),
                other => Err(other),
            })?;
        Ok(())
    }

    // -- dispatch --------------------------------------------------------

    async fn dispatch_pass(&self) -> Result<bool, ExecutionError> {
        let (group_index, candidates, awaiting_decision) = {
            let session = self.session.lock().await;
            let group_index = session.current_group_index;
            let awaiting = session.group_decision.as_ref().map(|d| d.awaiting_decision).unwrap_or(false);
            (group_index, session.group_tasks(group_index), awaiting)
        };
        if awaiting_decision {
            return Ok(false);
        }

        let mut dispatched = false;
        for task_id in candidates {
            if !self.has_capacity().await {
                break;
            }
            let already_resolved_or_running = {
                let session = self.session.lock().await;
                let state = self.state.lock().await;
                session.completed_tasks.contains(&task_id)
                    || session.failed_tasks.contains(&task_id)
                    || state.running.contains(&task_id)
            };
            if already_resolved_or_running {
                continue;
            }
            self.start_task(&task_id, group_index).await?;
            dispatched = true;
        }
        Ok(dispatched)
    }

    async fn has_capacity(&self) -> bool {
        if self.config.is_unlimited_parallel() {
            return true;
        }
        let running = self.state.lock().await.running.len();
        running < self.config.max_parallel
    }

    async fn start_task(&self, task_id: &str, group_index: usize) -> Result<(), ExecutionError> {
        let task = {
            let session = self.session.lock().await;
            session
                .plan
                .as_ref()
                .and_then(|p| p.task(task_id))
                .cloned()
                .ok_or_else(|| ExecutionError::Other(anyhow::anyhow!("unknown task {task_id}")))?
        };
        let base_branch = self.base_branch_for_group(group_index).await?;
        let prompt = build_task_prompt(&task, &base_branch);

        let instance_id = self
            .worker_pool
            .add_instance(&prompt, &base_branch)
            .await
            .map_err(|e| ExecutionError::Other(e.into()))?;
        if let Err(e) = self.worker_pool.start_instance(&instance_id).await {
            let _ = self.worker_pool.stop_instance(&instance_id).await;
            return Err(ExecutionError::Other(e.into()));
        }

        {
            let mut session = self.session.lock().await;
            session.record_instance(task_id, instance_id.clone());
        }
        self.state.lock().await.running.insert(task_id.to_string());

        if let Some(cb) = &self.callbacks.on_task_start {
            cb(task_id);
        }

        self.spawn_monitor(task_id.to_string(), instance_id, base_branch, task.no_code);
        Ok(())
    }

    fn spawn_monitor(&self, task_id: TaskId, instance_id: String, base_branch: String, no_code: bool) {
        let worker_pool = self.worker_pool.clone();
        let repo = self.repo.clone();
        let tx = self.completion_tx.clone();
        let cancelled = self.cancelled.clone();
        let tick = self.config.monitor_tick_interval;
        tokio::spawn(async move {
            monitor::watch_instance(monitor::MonitorInputs {
                worker_pool,
                repo,
                tx,
                cancelled,
                tick,
                task_id,
                instance_id,
                base_branch,
                no_code,
            })
            .await;
        });
    }

    async fn base_branch_for_group(&self, group_index: usize) -> Result<String, ExecutionError> {
        if group_index == 0 {
            return self.repo.find_main_branch().await.map_err(|e| ExecutionError::Other(e.into()));
        }
        let previous = {
            let session = self.session.lock().await;
            session.group_consolidated_branches.get(&(group_index - 1)).cloned()
        };
        match previous {
            Some(branch) if !branch.is_empty() => Ok(branch),
            _ => self.repo.find_main_branch().await.map_err(|e| ExecutionError::Other(e.into())),
        }
    }

    async fn base_branch_for_task(&self, task_id: &str) -> Result<String, ExecutionError> {
        let group_index = {
            let session = self.session.lock().await;
            session
                .plan
                .as_ref()
                .and_then(|p| group_tracker::get_task_group_index(&p.execution_order, task_id))
                .unwrap_or(0)
        };
        self.base_branch_for_group(group_index).await
    }

    // -- fallback polling -------------------------------------------------

    /// Second-tier completion detection: checks the sentinel directly for
    /// every task the loop believes is still running, in case a monitor
    /// task never got to report (e.g. it was starved or the process that
    /// spawned it died). Non-blocking send: a full channel just means the
    /// next pass retries.
    async fn poll_fallback_pass(&self) -> Result<bool, ExecutionError> {
        let running_ids: Vec<TaskId> = self.state.lock().await.running.iter().cloned().collect();
        let mut any = false;

        for task_id in running_ids {
            let instance_id = {
                let session = self.session.lock().await;
                session.task_instances.get(&task_id).cloned()
            };
            let Some(instance_id) = instance_id else { continue };

            let view = match self.worker_pool.get_instance(&instance_id).await {
                Ok(view) => view,
                Err(_) => continue,
            };
            if !self.verifier.check_completion_file(&view.worktree_path) {
                continue;
            }

            let _ = self.worker_pool.stop_instance(&instance_id).await;
            let no_code = {
                let session = self.session.lock().await;
                session.plan.as_ref().and_then(|p| p.task(&task_id)).map(|t| t.no_code).unwrap_or(false)
            };
            let base_branch = self.base_branch_for_task(&task_id).await?;
            let outcome = self
                .verifier
                .verify_task_work(&task_id, &view.worktree_path, &base_branch, VerifyOptions { no_code })
                .await
                .map_err(|e| ExecutionError::Other(e.into()))?;

            let record = TaskCompletionRecord {
                task_id: task_id.clone(),
                instance_id,
                success: outcome.success,
                error: if outcome.success { None } else { Some("no commits produced".to_string()) },
                needs_retry: outcome.needs_retry,
                commit_count: outcome.commit_count,
            };
            if self.completion_tx.try_send(record).is_ok() {
                any = true;
            }
        }
        Ok(any)
    }

    // -- completion handling ----------------------------------------------

    async fn handle_completion(&self, record: TaskCompletionRecord) -> Result<(), ExecutionError> {
        if self.state.lock().await.processed.contains(&record.task_id) {
            return Ok(());
        }
        self.state.lock().await.running.remove(&record.task_id);

        let already_retried = {
            let session = self.session.lock().await;
            session.has_retried(&record.task_id)
        };

        if record.needs_retry && !already_retried {
            let mut session = self.session.lock().await;
            session.clear_for_retry(&record.task_id);
            let saved = session.clone();
            drop(session);
            let _ = self.session_saver.save_session(&saved).await;
            return Ok(());
        }

        let success = record.success && !(record.needs_retry && already_retried);
        self.state.lock().await.processed.insert(record.task_id.clone());

        let group_index = {
            let mut session = self.session.lock().await;
            if success {
                session.mark_task_complete(&record.task_id, record.commit_count);
            } else {
                session.mark_task_failed(&record.task_id);
            }
            let group_index = session.current_group_index;
            let saved = session.clone();
            drop(session);
            let _ = self.session_saver.save_session(&saved).await;
            group_index
        };

        if success {
            if let Some(cb) = &self.callbacks.on_task_complete {
                cb(&record.task_id);
            }
            if let Some(audit) = &self.audit {
                let _ = audit.record(&AuditEvent::TaskCompleted {
                    task_id: record.task_id.clone(),
                    commit_count: record.commit_count,
                    at: Utc::now(),
                });
            }
        } else {
            let reason = record.error.as_deref().unwrap_or("task failed");
            if let Some(cb) = &self.callbacks.on_task_failed {
                cb(&record.task_id, reason);
            }
            if let Some(audit) = &self.audit {
                let _ = audit.record(&AuditEvent::TaskFailed {
                    task_id: record.task_id.clone(),
                    error: reason.to_string(),
                    at: Utc::now(),
                });
            }
        }

        self.check_and_advance_group(group_index).await?;
        self.maybe_finish().await
    }

    async fn check_and_advance_group(&self, group_index: usize) -> Result<(), ExecutionError> {
        let (execution_order, completed, failed) = {
            let session = self.session.lock().await;
            (
                session.plan.as_ref().map(|p| p.execution_order.clone()).unwrap_or_default(),
                session.completed_tasks.clone(),
                session.failed_tasks.clone(),
            )
        };

        if !group_tracker::is_group_complete(&execution_order, group_index, &completed, &failed) {
            return Ok(());
        }

        if group_tracker::has_partial_failure(&execution_order, group_index, &completed, &failed) {
            let tasks = group_tracker::get_group_tasks(&execution_order, group_index);
            let succeeded: Vec<_> = tasks.iter().filter(|t| completed.contains(*t)).cloned().collect();
            let failed_tasks: Vec<_> = tasks.iter().filter(|t| failed.contains(*t)).cloned().collect();

            let mut session = self.session.lock().await;
            session.set_group_decision(GroupDecision {
                group_index,
                succeeded,
                failed: failed_tasks,
                awaiting_decision: true,
            });
            let saved = session.clone();
            drop(session);
            let _ = self.session_saver.save_session(&saved).await;
            return Ok(());
        }

        self.consolidate_and_advance(group_index, &execution_order).await
    }

    async fn consolidate_and_advance(
        &self,
        group_index: usize,
        execution_order: &ExecutionOrder,
    ) -> Result<(), ExecutionError> {
        let plan_tasks = self.succeeded_tasks_for_group(group_index, execution_order).await;

        let record = {
            let mut session = self.session.lock().await;
            self.consolidation.consolidate_group(&mut session, group_index, &plan_tasks).await?
        };

        let branch = record.consolidated_branch.clone();
        let mut session = self.session.lock().await;
        session.record_group_consolidation(record);
        session.advance_group();
        let saved = session.clone();
        drop(session);
        let _ = self.session_saver.save_session(&saved).await;

        if let Some(cb) = &self.callbacks.on_group_complete {
            cb(group_index);
        }
        if let Some(audit) = &self.audit {
            let _ = audit.record(&AuditEvent::GroupConsolidated { group_index, branch, at: Utc::now() });
        }
        Ok(())
    }

    async fn succeeded_tasks_for_group(&self, group_index: usize, execution_order: &ExecutionOrder) -> Vec<Task> {
        let session = self.session.lock().await;
        group_tracker::get_group_tasks(execution_order, group_index)
            .iter()
            .filter(|id| session.completed_tasks.contains(*id))
            .filter_map(|id| session.plan.as_ref().and_then(|p| p.task(id)).cloned())
            .collect()
    }

    async fn maybe_finish(&self) -> Result<(), ExecutionError> {
        let (completed_len, failed_len, total) = {
            let session = self.session.lock().await;
            (session.completed_tasks.len(), session.failed_tasks.len(), session.total_tasks())
        };
        if total == 0 || completed_len + failed_len < total {
            return Ok(());
        }
        self.finish_execution(failed_len > 0).await
    }

    async fn finish_execution(&self, any_failed: bool) -> Result<(), ExecutionError> {
        let target = if any_failed {
            Phase::Failed
        } else if !self.config.synthesis_enabled {
            Phase::Complete
        } else {
            Phase::Synthesis
        };
        let reason = if any_failed { "one or more tasks failed" } else { "all tasks resolved" };
        self.phase_manager.transition_to(target, reason, HashMap::new(), None)?;

        let mut session = self.session.lock().await;
        if any_failed && session.error_message.is_none() {
            session.error_message = Some("one or more tasks failed".to_string());
        }
        let saved = session.clone();
        drop(session);
        let _ = self.session_saver.save_session(&saved).await;

        if let Some(cb) = &self.callbacks.on_complete {
            cb(!any_failed, reason);
        }
        Ok(())
    }

    // -- partial-failure arbitration --------------------------------------

    /// Consolidates a partially failed group using only the tasks that
    /// succeeded, then advances past it as if it had fully succeeded.
    pub async fn resume_with_partial_work(&self) -> Result<(), ExecutionError> {
        let (group_index, execution_order) = self.pending_decision_group().await?;
        self.consolidate_and_advance(group_index, &execution_order).await?;
        {
            let mut session = self.session.lock().await;
            session.clear_group_decision();
            let saved = session.clone();
            drop(session);
            let _ = self.session_saver.save_session(&saved).await;
        }
        self.maybe_finish().await
    }

    /// Clears the failed tasks' failure membership, retry bookkeeping, and
    /// instance mapping so the dispatch loop re-picks them up as fresh
    /// tasks on the next pass, and clears the pending decision.
    pub async fn retry_failed_tasks(&self) -> Result<(), ExecutionError> {
        let (_, _) = self.pending_decision_group().await?;

        let failed_tasks = {
            let session = self.session.lock().await;
            session.group_decision.as_ref().map(|d| d.failed.clone()).unwrap_or_default()
        };

        {
            let mut session = self.session.lock().await;
            for task_id in &failed_tasks {
                session.failed_tasks.remove(task_id);
                session.task_instances.remove(task_id);
                session.retry_state.remove(task_id);
            }
            session.clear_group_decision();
            let saved = session.clone();
            drop(session);
            let _ = self.session_saver.save_session(&saved).await;
        }

        let mut state = self.state.lock().await;
        for task_id in &failed_tasks {
            state.processed.remove(task_id);
            state.running.remove(task_id);
        }
        Ok(())
    }

    async fn pending_decision_group(&self) -> Result<(usize, ExecutionOrder), ExecutionError> {
        let session = self.session.lock().await;
        let decision = session
            .group_decision
            .clone()
            .ok_or_else(|| ExecutionError::Other(anyhow::anyhow!("no pending group decision")))?;
        if !decision.awaiting_decision {
            return Err(ExecutionError::Other(anyhow::anyhow!(
                "group decision is not awaiting arbitration"
            )));
        }
        let execution_order = session.plan.as_ref().map(|p| p.execution_order.clone()).unwrap_or_default();
        Ok((decision.group_index, execution_order))
    }

    // -- conflict resume / retrigger ---------------------------------------

    /// Resumes a cherry-pick conflict the consolidation orchestrator paused
    /// on, then re-runs consolidation for the same group from scratch (the
    /// "restart callback" the conflict-pause design calls for).
    pub async fn resume_after_conflict(&self) -> Result<(), ExecutionError> {
        let group_index = {
            let session = self.session.lock().await;
            session.conflict.as_ref().map(|c| session.current_group_index).ok_or_else(|| {
                ExecutionError::Other(anyhow::anyhow!("no conflict is recorded"))
            })?
        };

        {
            let mut session = self.session.lock().await;
            self.consolidation.resume_consolidation(&mut session).await?;
            let saved = session.clone();
            drop(session);
            let _ = self.session_saver.save_session(&saved).await;
        }

        let execution_order = {
            let session = self.session.lock().await;
            session.plan.as_ref().map(|p| p.execution_order.clone()).unwrap_or_default()
        };
        self.consolidate_and_advance(group_index, &execution_order).await?;
        self.maybe_finish().await
    }

    /// Resets all task and consolidation state for groups `>= target` and
    /// re-enters `Execution` so the dispatch loop re-picks up work there.
    /// Requires no tasks currently running and no group decision awaiting
    /// arbitration.
    pub async fn retrigger_group(&self, target: usize) -> Result<(), ExecutionError> {
        {
            let state = self.state.lock().await;
            if !state.running.is_empty() {
                return Err(ExecutionError::Other(anyhow::anyhow!(
                    "cannot retrigger while tasks are running"
                )));
            }
        }
        {
            let session = self.session.lock().await;
            if session.group_decision.as_ref().map(|d| d.awaiting_decision).unwrap_or(false) {
                return Err(ExecutionError::Other(anyhow::anyhow!(
                    "cannot retrigger while a group decision is awaiting arbitration"
                )));
            }
        }

        {
            let mut session = self.session.lock().await;
            session.reset_from_group(target);
            session.pr_urls.clear();
            session.error_message = None;
            let saved = session.clone();
            drop(session);
            let _ = self.session_saver.save_session(&saved).await;
        }
        self.state.lock().await.processed.clear();

        self.phase_manager
            .transition_to(Phase::Execution, format!("retrigger from group {target}"), HashMap::new(), None)
            .or_else(|e| match e {
                PhaseError::AlreadyInPhase(Phase::Execution) => Ok(()),
                other => Err(other),
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::fakes::{FakeRepositoryOperator, FakeSessionSaver, FakeWorkerPool};
    use crate::session::{GroupConsolidationRecord, GroupConsolidationStatus, Plan};
    use std::path::PathBuf;
    use std::time::Duration;
    use tempfile::tempdir;

    fn two_task_group_session() -> Session {
        let mut session = Session::new("ship feature", "claudio");
        let mut plan = Plan::default();
        plan.tasks.insert("t1".to_string(), Task::new("t1", "Task 1", "do thing one"));
        plan.tasks.insert("t2".to_string(), Task::new("t2", "Task 2", "do thing two"));
        plan.execution_order = vec![vec!["t1".to_string(), "t2".to_string()]];
        session.plan = Some(plan);
        session
    }

    fn fast_config(dir: &std::path::Path) -> RuntimeConfig {
        RuntimeConfig::new(dir)
            .unwrap()
            .with_max_parallel(2)
            .with_synthesis_enabled(false)
    }

    struct Harness {
        orchestrator: Arc<ExecutionOrchestrator>,
        pool: Arc<FakeWorkerPool>,
        repo: Arc<FakeRepositoryOperator>,
        saver: Arc<FakeSessionSaver>,
    }

    fn build_harness(session: Session, mut config: RuntimeConfig) -> Harness {
        config.monitor_tick_interval = Duration::from_millis(5);
        config.completion_poll_interval = Duration::from_millis(5);

        let manager = Arc::new(PhaseManager::new(Phase::Execution));
        let pool = Arc::new(FakeWorkerPool::new());
        let repo = Arc::new(FakeRepositoryOperator::new());
        let saver = Arc::new(FakeSessionSaver::new());
        let session = Arc::new(Mutex::new(session));

        let orchestrator = Arc::new(ExecutionOrchestrator::new(
            manager,
            pool.clone(),
            repo.clone(),
            saver.clone(),
            session,
            config,
            ProgressCallbacks::default(),
        ));
        Harness { orchestrator, pool, repo, saver }
    }

    async fn wait_for_instance(pool: &FakeWorkerPool, n: usize) -> Vec<String> {
        for _ in 0..200 {
            let ids: Vec<String> = pool.instances.lock().unwrap().keys().cloned().collect();
            if ids.len() >= n {
                let mut ids = ids;
                ids.sort();
                return ids;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("timed out waiting for {n} instances");
    }

    fn write_task_sentinel(worktree: &std::path::Path) {
        std::fs::write(
            worktree.join(".claudio-task-complete.json"),
            serde_json::json!({
                "task_id": "t",
                "status": "complete",
                "summary": "done",
            })
            .to_string(),
        )
        .unwrap();
    }

    fn write_group_sentinel(worktree: &std::path::Path) {
        std::fs::write(
            crate::sentinel::GroupConsolidationSentinel::path_in(worktree),
            serde_json::to_string(&crate::sentinel::GroupConsolidationSentinel {
                group_index: 0,
                status: crate::sentinel::GroupSentinelStatus::Complete,
                branch_name: "claudio/ultraplan-group-1".to_string(),
                tasks_consolidated: vec!["t1".to_string(), "t2".to_string()],
                conflicts_resolved: vec![],
                verification: crate::sentinel::SentinelVerification {
                    project_type: "rust".to_string(),
                    commands_run: vec![],
                    overall_success: true,
                },
                aggregated_context: crate::sentinel::SentinelAggregatedContext::default(),
                notes: "all good".to_string(),
                issues_for_next_group: vec![],
            })
            .unwrap(),
        )
        .unwrap();
    }

    #[tokio::test]
    async fn happy_path_completes_single_group_and_reaches_complete() {
        let dir = tempdir().unwrap();
        let session = two_task_group_session();
        let session_prefix: String = session.session_id.to_string().chars().take(8).collect();
        let consolidated_branch = format!("claudio/ultraplan-{session_prefix}-group-1");
        let consolidate_worktree = PathBuf::from(format!("/tmp/claudio-consolidate/{consolidated_branch}"));
        std::fs::create_dir_all(&consolidate_worktree).unwrap();

        let harness = build_harness(session, fast_config(dir.path()));

        let run_handle = tokio::spawn({
            let orchestrator = harness.orchestrator.clone();
            async move { orchestrator.run().await }
        });

        let instance_ids = wait_for_instance(&harness.pool, 2).await;
        for id in &instance_ids {
            let worktree = harness.pool.instances.lock().unwrap().get(id).unwrap().worktree_path.clone();
            std::fs::create_dir_all(&worktree).unwrap();
            write_task_sentinel(&worktree);
            harness.repo.seed_commit_count(&worktree.to_string_lossy(), 1);
        }

        harness.repo.seed_commit_count(&consolidate_worktree.to_string_lossy(), 2);
        write_group_sentinel(&consolidate_worktree);

        let result = tokio::time::timeout(Duration::from_secs(5), run_handle).await;
        result.expect("run loop timed out").unwrap().unwrap();

        assert!(harness.saver.save_count() > 0);
    }

    #[tokio::test]
    async fn dispatch_respects_max_parallel() {
        let dir = tempdir().unwrap();
        let mut session = Session::new("obj", "claudio");
        let mut plan = Plan::default();
        plan.tasks.insert("t1".to_string(), Task::new("t1", "Task 1", "d"));
        plan.tasks.insert("t2".to_string(), Task::new("t2", "Task 2", "d"));
        plan.tasks.insert("t3".to_string(), Task::new("t3", "Task 3", "d"));
        plan.execution_order = vec![vec!["t1".to_string(), "t2".to_string(), "t3".to_string()]];
        session.plan = Some(plan);

        let mut config = fast_config(dir.path());
        config = config.with_max_parallel(2);
        let harness = build_harness(session, config);

        harness.orchestrator.dispatch_pass().await.unwrap();
        assert_eq!(harness.orchestrator.state.lock().await.running.len(), 2);
    }

    #[tokio::test]
    async fn partial_failure_sets_group_decision_and_halts_dispatch() {
        let dir = tempdir().unwrap();
        let harness = build_harness(two_task_group_session(), fast_config(dir.path()));

        {
            let mut session = harness.orchestrator.session.lock().await;
            session.record_instance("t1", "instance-t1");
            session.record_instance("t2", "instance-t2");
        }
        harness.orchestrator.state.lock().await.running.insert("t1".to_string());
        harness.orchestrator.state.lock().await.running.insert("t2".to_string());

        harness
            .orchestrator
            .handle_completion(TaskCompletionRecord {
                task_id: "t1".to_string(),
                instance_id: "instance-t1".to_string(),
                success: true,
                error: None,
                needs_retry: false,
                commit_count: 2,
            })
            .await
            .unwrap();
        harness
            .orchestrator
            .handle_completion(TaskCompletionRecord {
                task_id: "t2".to_string(),
                instance_id: "instance-t2".to_string(),
                success: false,
                error: Some("boom".to_string()),
                needs_retry: false,
                commit_count: 0,
            })
            .await
            .unwrap();

        let session = harness.orchestrator.session.lock().await;
        let decision = session.group_decision.as_ref().unwrap();
        assert!(decision.awaiting_decision);
        assert_eq!(decision.succeeded, vec!["t1".to_string()]);
        assert_eq!(decision.failed, vec!["t2".to_string()]);
        drop(session);

        assert!(!harness.orchestrator.dispatch_pass().await.unwrap());
    }

    #[tokio::test]
    async fn retry_is_granted_once_then_treated_as_failure() {
        let dir = tempdir().unwrap();
        let mut session = Session::new("obj", "claudio");
        let mut plan = Plan::default();
        plan.tasks.insert("t1".to_string(), Task::new("t1", "Task 1", "d"));
        plan.execution_order = vec![vec!["t1".to_string()]];
        session.plan = Some(plan);
        let harness = build_harness(session, fast_config(dir.path()));

        {
            let mut session = harness.orchestrator.session.lock().await;
            session.record_instance("t1", "instance-t1");
        }
        harness.orchestrator.state.lock().await.running.insert("t1".to_string());

        let first = TaskCompletionRecord {
            task_id: "t1".to_string(),
            instance_id: "instance-t1".to_string(),
            success: false,
            error: None,
            needs_retry: true,
            commit_count: 0,
        };
        harness.orchestrator.handle_completion(first.clone()).await.unwrap();
        {
            let session = harness.orchestrator.session.lock().await;
            assert!(session.has_retried("t1"));
            assert!(!session.failed_tasks.contains("t1"));
            assert!(!session.completed_tasks.contains("t1"));
        }

        harness.orchestrator.state.lock().await.running.insert("t1".to_string());
        harness.orchestrator.handle_completion(first).await.unwrap();
        {
            let session = harness.orchestrator.session.lock().await;
            assert!(session.failed_tasks.contains("t1"));
        }
    }

    #[tokio::test]
    async fn retry_failed_tasks_clears_membership_and_decision() {
        let dir = tempdir().unwrap();
        let harness = build_harness(two_task_group_session(), fast_config(dir.path()));
        {
            let mut session = harness.orchestrator.session.lock().await;
            session.mark_task_complete("t1", 1);
            session.mark_task_failed("t2");
            session.set_group_decision(GroupDecision {
                group_index: 0,
                succeeded: vec!["t1".to_string()],
                failed: vec!["t2".to_string()],
                awaiting_decision: true,
            });
        }

        harness.orchestrator.retry_failed_tasks().await.unwrap();

        let session = harness.orchestrator.session.lock().await;
        assert!(!session.failed_tasks.contains("t2"));
        assert!(session.group_decision.is_none());
    }

    #[tokio::test]
    async fn retrigger_group_rejects_while_tasks_running() {
        let dir = tempdir().unwrap();
        let harness = build_harness(two_task_group_session(), fast_config(dir.path()));
        harness.orchestrator.state.lock().await.running.insert("t1".to_string());

        let err = harness.orchestrator.retrigger_group(0).await.unwrap_err();
        assert!(matches!(err, ExecutionError::Other(_)));
    }

    #[tokio::test]
    async fn retrigger_group_resets_state_for_target_group_onward() {
        let dir = tempdir().unwrap();
        let mut session = Session::new("obj", "claudio");
        let mut plan = Plan::default();
        plan.tasks.insert("t1".to_string(), Task::new("t1", "Task 1", "d"));
        plan.tasks.insert("t2".to_string(), Task::new("t2", "Task 2", "d"));
        plan.execution_order = vec![vec!["t1".to_string()], vec!["t2".to_string()]];
        session.plan = Some(plan);
        session.mark_task_complete("t1", 1);
        session.record_group_consolidation(GroupConsolidationRecord {
            group_index: 0,
            status: GroupConsolidationStatus::Complete,
            consolidated_branch: "claudio/group-1".to_string(),
            tasks_included: vec!["t1".to_string()],
            conflicts_resolved: vec![],
            verification: Default::default(),
            aggregated_context: Default::default(),
            notes: String::new(),
            issues_for_next_group: vec![],
        });
        session.advance_group();
        session.mark_task_failed("t2");

        let harness = build_harness(session, fast_config(dir.path()));

        harness.orchestrator.retrigger_group(1).await.unwrap();

        let session = harness.orchestrator.session.lock().await;
        assert!(session.completed_tasks.contains("t1"));
        assert!(!session.failed_tasks.contains("t2"));
        assert_eq!(session.current_group_index, 1);
        assert!(session.group_consolidated_branches.contains_key(&0));
    }

    #[tokio::test]
    async fn audit_trail_records_task_completion_and_failure() {
        let dir = tempdir().unwrap();
        let mut session = Session::new("obj", "claudio");
        let mut plan = Plan::default();
        plan.tasks.insert("t1".to_string(), Task::new("t1", "Task 1", "d"));
        plan.tasks.insert("t2".to_string(), Task::new("t2", "Task 2", "d"));
        plan.execution_order = vec![vec!["t1".to_string(), "t2".to_string()]];
        session.plan = Some(plan);

        let manager = Arc::new(PhaseManager::new(Phase::Execution));
        let pool: Arc<dyn WorkerPool> = Arc::new(FakeWorkerPool::new());
        let repo: Arc<dyn RepositoryOperator> = Arc::new(FakeRepositoryOperator::new());
        let saver: Arc<dyn SessionSaver> = Arc::new(FakeSessionSaver::new());
        let session = Arc::new(Mutex::new(session));
        let audit = Arc::new(AuditTrail::new(dir.path()));

        let orchestrator = ExecutionOrchestrator::new(
            manager,
            pool,
            repo,
            saver,
            session.clone(),
            fast_config(dir.path()),
            ProgressCallbacks::default(),
        )
        .with_audit(audit.clone());

        {
            let mut session = session.lock().await;
            session.record_instance("t1", "instance-t1");
            session.record_instance("t2", "instance-t2");
        }
        orchestrator.state.lock().await.running.insert("t1".to_string());
        orchestrator.state.lock().await.running.insert("t2".to_string());

        orchestrator
            .handle_completion(TaskCompletionRecord {
                task_id: "t1".to_string(),
                instance_id: "instance-t1".to_string(),
                success: true,
                error: None,
                needs_retry: false,
                commit_count: 2,
            })
            .await
            .unwrap();
        orchestrator
            .handle_completion(TaskCompletionRecord {
                task_id: "t2".to_string(),
                instance_id: "instance-t2".to_string(),
                success: false,
                error: Some("boom".to_string()),
                needs_retry: false,
                commit_count: 0,
            })
            .await
            .unwrap();

        let events = audit.read_all().unwrap();
        assert!(events.iter().any(|e| matches!(
            e,
            AuditEvent::TaskCompleted { task_id, commit_count: 2, .. } if task_id == "t1"
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            AuditEvent::TaskFailed { task_id, error, .. } if task_id == "t2" && error == "boom"
        )));
    }
}
