//! C3: the planning orchestrator.
//!
//! Single-pass: transition to `Planning`, build a prompt from the
//! objective, spawn one coordinator instance, record its ID, and return
//! without blocking on completion — the calling execution loop observes
//! the coordinator instance the same way it observes task instances.
//!
//! Multi-pass: spawn N coordinator instances with distinct prompts; once
//! all are observed complete (by the caller polling sentinel files the
//! same way C4 does — planning reuses no separate completion machinery),
//! transition to `PlanSelection` and spawn a selector instance whose
//! chosen plan is installed into the session before transitioning to
//! `Refresh`.
//!
//! Grounded on `src/factory/planner.rs`'s `PlanResponse::parse` (direct
//! parse → markdown-fence strip → balanced-brace extraction fallback) for
//! the JSON-parsing chain used on candidate and selected plan output.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::collaborators::WorkerPool;
use crate::errors::{PhaseError, PlanningError};
use crate::phase_machine::{Phase, PhaseManager};
use crate::prompts::{build_plan_selection_prompt, build_planning_prompt};
use crate::session::{Plan, Session, Task};

/// How many independent planning passes to run before selecting a winner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanningMode {
    SinglePass,
    MultiPass { coordinators: usize },
}

/// The raw JSON shape a planner/selector worker is expected to produce.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanResponse {
    #[serde(default)]
    pub reasoning: String,
    pub groups: Vec<PlanGroupResponse>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanGroupResponse {
    pub tasks: Vec<PlanTaskResponse>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanTaskResponse {
    pub id: String,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub expected_files: Vec<String>,
    #[serde(default)]
    pub no_code: bool,
}

impl PlanResponse {
    /// Parses worker output, trying a direct parse first, then stripping a
    /// ```json fenced block, then falling back to a balanced-brace scan for
    /// the first JSON object in the text — the same fallback chain
    /// `PlanResponse::parse` uses.
    pub fn parse(text: &str) -> Result<Self, anyhow::Error> {
        if let Ok(direct) = serde_json::from_str::<Self>(text.trim()) {
            return Ok(direct);
        }

        if let Some(fenced) = extract_fenced_json(text)
            && let Ok(parsed) = serde_json::from_str::<Self>(&fenced)
        {
            return Ok(parsed);
        }

        if let Some(object) = extract_json_object(text) {
            return serde_json::from_str::<Self>(&object)
                .map_err(|e| anyhow::anyhow!("failed to parse extracted plan JSON: {e}"));
        }

        anyhow::bail!("no JSON object found in planner output")
    }

    /// Converts parsed groups into a `Plan`, assigning a stable task id
    /// collision check (duplicate ids across groups are rejected).
    pub fn into_plan(self) -> Result<Plan, anyhow::Error> {
        let mut tasks = HashMap::new();
        let mut execution_order = Vec::new();

        for group in self.groups {
            let mut group_ids = Vec::new();
            for task_response in group.tasks {
                if tasks.contains_key(&task_response.id) {
                    anyhow::bail!("duplicate task id in plan: {}", task_response.id);
                }
                group_ids.push(task_response.id.clone());
                let task = Task::new(task_response.id, task_response.title, task_response.description)
                    .with_expected_files(task_response.expected_files)
                    .with_no_code(task_response.no_code);
                tasks.insert(task.id.clone(), task);
            }
            execution_order.push(group_ids);
        }

        Ok(Plan { tasks, execution_order })
    }
}

fn extract_fenced_json(text: &str) -> Option<String> {
    let start = text.find("```json")? + "```json".len();
    let rest = &text[start..];
    let end = rest.find("```")?;
    Some(rest[..end].trim().to_string())
}

/// Balanced-brace scanner: finds the first complete top-level `{...}`
/// object in `text`, honoring string/escape state so braces inside string
/// literals don't throw off the count.
fn extract_json_object(text: &str) -> Option<String> {
    let bytes = text.as_bytes();
    let start = text.find('{')?;
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape = false;

    for (offset, &byte) in bytes[start..].iter().enumerate() {
        if in_string {
            if escape {
                escape = false;
            } else if byte == b'\\' {
                escape = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    let end = start + offset + 1;
                    return Some(text[start..end].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

/// The planning orchestrator (C3).
///
/// Holds the same session handle every other orchestrator is threaded
/// through, so spawned coordinator/selector instance IDs are recorded on
/// `Session` (SPEC_FULL.md §4.3(4)) rather than living only in
/// orchestrator-local state that would be lost across a checkpoint reload.
pub struct PlanningOrchestrator {
    phase_manager: Arc<PhaseManager>,
    worker_pool: Arc<dyn WorkerPool>,
    session: Arc<tokio::sync::Mutex<Session>>,
    mode: PlanningMode,
    cancelled: Arc<AtomicBool>,
}

impl PlanningOrchestrator {
    pub fn new(
        phase_manager: Arc<PhaseManager>,
        worker_pool: Arc<dyn WorkerPool>,
        session: Arc<tokio::sync::Mutex<Session>>,
        mode: PlanningMode,
    ) -> Self {
        Self {
            phase_manager,
            worker_pool,
            session,
            mode,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Idempotent: repeated calls after the first are no-ops.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn check_cancelled(&self) -> Result<(), PlanningError> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(PlanningError::Cancelled);
        }
        Ok(())
    }

    /// Coordinator instance IDs recorded on the session so far.
    pub async fn coordinator_instance_ids(&self) -> Vec<String> {
        self.session.lock().await.coordinator_instance_ids.clone()
    }

    /// Runs one planning pass per `self.mode`, without blocking on the
    /// spawned coordinator's completion — the caller observes sentinel
    /// files the same way the execution loop does for task instances.
    pub async fn execute(&self, objective: &str) -> Result<(), PlanningError> {
        self.check_cancelled()?;

        self.phase_manager
            .transition_to(Phase::Planning, "planning started", HashMap::new(), None)
            .or_else(|e| match e {
                PhaseError::AlreadyInPhase(Phase::Planning) => Ok(()),
                other => Err(other),
            })?;

        match self.mode {
            PlanningMode::SinglePass => self.spawn_single_pass(objective).await,
            PlanningMode::MultiPass { coordinators } => self.spawn_multi_pass(objective, coordinators).await,
        }
    }

    async fn spawn_single_pass(&self, objective: &str) -> Result<(), PlanningError> {
        self.check_cancelled()?;
        let prompt = build_planning_prompt(objective, None);
        let main_branch = "main";
        let instance_id = self
            .worker_pool
            .add_instance(&prompt, main_branch)
            .await
            .map_err(|e| PlanningError::Other(e.into()))?;
        self.worker_pool
            .start_instance(&instance_id)
            .await
            .map_err(|e| PlanningError::Other(e.into()))?;
        self.session.lock().await.record_coordinator_instance(instance_id);

        self.phase_manager
            .transition_to(Phase::Refresh, "single-pass plan dispatched", HashMap::new(), None)?;
        Ok(())
    }

    async fn spawn_multi_pass(&self, objective: &str, coordinators: usize) -> Result<(), PlanningError> {
        self.check_cancelled()?;
        for i in 0..coordinators {
            let label = format!("coordinator-{i}");
            let prompt = build_planning_prompt(objective, Some(&label));
            let instance_id = self
                .worker_pool
                .add_instance(&prompt, "main")
                .await
                .map_err(|e| PlanningError::Other(e.into()))?;
            self.worker_pool
                .start_instance(&instance_id)
                .await
                .map_err(|e| PlanningError::Other(e.into()))?;
            self.session.lock().await.record_coordinator_instance(instance_id);
        }
        Ok(())
    }

    /// Called once all coordinator instances are observed complete: spawns
    /// the selector and transitions to `PlanSelection`.
    pub async fn spawn_selector(&self, objective: &str, candidate_plans: &[String]) -> Result<String, PlanningError> {
        self.check_cancelled()?;
        self.phase_manager
            .transition_to(Phase::PlanSelection, "all coordinators complete", HashMap::new(), None)?;

        let prompt = build_plan_selection_prompt(objective, candidate_plans);
        let instance_id = self
            .worker_pool
            .add_instance(&prompt, "main")
            .await
            .map_err(|e| PlanningError::Other(e.into()))?;
        self.worker_pool
            .start_instance(&instance_id)
            .await
            .map_err(|e| PlanningError::Other(e.into()))?;
        self.session.lock().await.record_selector_instance(instance_id.clone());
        Ok(instance_id)
    }

    /// Installs the selector's chosen plan and transitions to `Refresh`.
    /// The plan must already have been parsed by the caller via
    /// `PlanResponse::parse` + `into_plan`.
    pub fn install_selected_plan(&self) -> Result<(), PlanningError> {
        self.check_cancelled()?;
        self.phase_manager
            .transition_to(Phase::Refresh, "plan selected", HashMap::new(), None)?;
        Ok(())
    }
}
