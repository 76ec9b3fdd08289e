//! Thin CLI front door: translates flags into a `RuntimeConfig`, wires the
//! real collaborator implementations (`ProcessWorkerPool`,
//! `GitCliRepositoryOperator`, `CheckpointSessionSaver`) into the
//! orchestrators, and drives them. Never reimplements planning or
//! consolidation LLM calls itself — those stay delegated to the worker
//! pool per the core's non-goals.
//!
//! Grounded on the teacher's `src/main.rs` clap-derive `Cli`/`Commands`
//! structure; subcommands narrowed to what this crate's orchestrators
//! actually expose (`run`, `status`, `retrigger`, `resume-partial`,
//! `retry-failed`, `resolve-conflict`).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio::sync::Mutex;
use tracing_subscriber::EnvFilter;

use claudio::audit::{AuditEvent, AuditTrail};
use claudio::checkpoint::CheckpointStore;
use claudio::collaborators::process::{GitCliRepositoryOperator, ProcessWorkerPool};
use claudio::collaborators::{CheckpointSessionSaver, RepositoryOperator, SessionSaver, WorkerPool};
use claudio::config::RuntimeConfig;
use claudio::context::ProgressCallbacks;
use claudio::execution::ExecutionOrchestrator;
use claudio::phase_machine::{Phase, PhaseManager};
use claudio::planning::{PlanResponse, PlanningMode, PlanningOrchestrator};
use claudio::sentinel::FinalConsolidationMode;
use claudio::session::Session;

#[derive(Parser)]
#[command(name = "claudio")]
#[command(version, about = "Phase-orchestration core for a multi-agent code-modification system")]
struct Cli {
    #[arg(long, global = true)]
    project_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start (or resume) a session against an objective.
    Run {
        /// The high-level objective, required unless resuming an existing
        /// checkpoint.
        #[arg(long)]
        objective: Option<String>,

        #[arg(long)]
        max_parallel: Option<usize>,

        #[arg(long)]
        branch_prefix: Option<String>,

        #[arg(long)]
        no_synthesis: bool,

        /// Number of independent planning passes; omit for single-pass.
        #[arg(long)]
        multi_pass: Option<usize>,

        /// Path to a JSON file containing a planner's chosen plan (the
        /// schema `PLANNER_SYSTEM_PROMPT` describes), to install without
        /// re-dispatching a coordinator — used once a coordinator spawned
        /// by an earlier `claudio run` has produced its output out of
        /// band (the core does not capture coordinator stdout itself; see
        /// SPEC_FULL.md §1 non-goal (a)).
        #[arg(long)]
        plan_file: Option<PathBuf>,

        #[arg(long, value_enum, default_value = "stacked")]
        mode: FinalMode,
    },
    /// Print the current session's phase, progress, and PR URLs.
    Status,
    /// Discard state for groups >= GROUP and re-enter Execution.
    Retrigger { group: usize },
    /// Consolidate a partially failed group using only its succeeded tasks.
    ResumePartial,
    /// Re-dispatch a partially failed group's failed tasks.
    RetryFailed,
    /// Resume consolidation after a cherry-pick conflict has been resolved
    /// out of band (conflicting files committed/aborted by the operator).
    ResolveConflict,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum FinalMode {
    Stacked,
    Single,
}

impl From<FinalMode> for FinalConsolidationMode {
    fn from(value: FinalMode) -> Self {
        match value {
            FinalMode::Stacked => FinalConsolidationMode::Stacked,
            FinalMode::Single => FinalConsolidationMode::Single,
        }
    }
}

fn init_tracing() {
    let format = std::env::var("CLAUDIO_LOG_FORMAT").unwrap_or_default();
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(env_filter);
    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let project_dir = match &cli.project_dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("failed to get current directory")?,
    };

    match &cli.command {
        Commands::Run { objective, max_parallel, branch_prefix, no_synthesis, multi_pass, plan_file, mode } => {
            cmd_run(
                &project_dir,
                objective.clone(),
                *max_parallel,
                branch_prefix.clone(),
                *no_synthesis,
                *multi_pass,
                plan_file.clone(),
                (*mode).into(),
            )
            .await
        }
        Commands::Status => cmd_status(&project_dir),
        Commands::Retrigger { group } => cmd_retrigger(&project_dir, *group).await,
        Commands::ResumePartial => cmd_resume_partial(&project_dir).await,
        Commands::RetryFailed => cmd_retry_failed(&project_dir).await,
        Commands::ResolveConflict => cmd_resolve_conflict(&project_dir).await,
    }
}

/// The collaborators and orchestrator wiring shared by every subcommand
/// that needs to drive (rather than just inspect) a session.
struct Rig {
    config: RuntimeConfig,
    checkpoint: CheckpointStore,
    phase_manager: Arc<PhaseManager>,
    session: Arc<Mutex<Session>>,
    repo: Arc<dyn RepositoryOperator>,
    worker_pool: Arc<dyn WorkerPool>,
    saver: Arc<dyn SessionSaver>,
    audit: Arc<AuditTrail>,
}

fn build_rig(
    project_dir: &std::path::Path,
    max_parallel: Option<usize>,
    branch_prefix: Option<String>,
    no_synthesis: bool,
    session: Session,
) -> Result<Rig> {
    let mut config = RuntimeConfig::new(project_dir).context("resolving runtime configuration")?;
    if let Some(max_parallel) = max_parallel {
        config = config.with_max_parallel(max_parallel);
    }
    if let Some(prefix) = branch_prefix {
        config = config.with_branch_prefix(prefix);
    }
    if no_synthesis {
        config = config.with_synthesis_enabled(false);
    }
    config.ensure_directories().context("creating .claudio directory")?;

    let checkpoint = CheckpointStore::new(config.claudio_dir());
    let phase_manager = Arc::new(PhaseManager::new(session.current_phase));
    let worker_pool: Arc<dyn WorkerPool> =
        Arc::new(ProcessWorkerPool::new(config.project_dir.clone(), config.branch_prefix.clone()));
    let repo: Arc<dyn RepositoryOperator> = Arc::new(GitCliRepositoryOperator::new(config.project_dir.clone()));
    let saver: Arc<dyn SessionSaver> =
        Arc::new(CheckpointSessionSaver::new(CheckpointStore::new(config.claudio_dir())));
    let session = Arc::new(Mutex::new(session));

    let audit = Arc::new(AuditTrail::new(config.claudio_dir()));
    register_phase_audit(&phase_manager, audit.clone());

    Ok(Rig { config, checkpoint, phase_manager, session, repo, worker_pool, saver, audit })
}

/// Wires the audit trail in as a registered phase-change observer (the
/// extension point `PhaseManager::on_phase_change` exists for), so every
/// `transition_to` call during a run appends a `PhaseExited`/`PhaseEntered`
/// pair. Never gates a transition: a failed `record` is swallowed.
fn register_phase_audit(phase_manager: &Arc<PhaseManager>, audit: Arc<AuditTrail>) {
    let history_source = phase_manager.clone();
    phase_manager.on_phase_change(move |from, to| {
        let now = Utc::now();
        let history = history_source.history();
        let duration_secs = if history.len() >= 2 {
            let last = &history[history.len() - 1];
            let previous = &history[history.len() - 2];
            (last.timestamp - previous.timestamp).num_milliseconds() as f64 / 1000.0
        } else {
            0.0
        };
        let _ = audit.record(&AuditEvent::PhaseExited { phase: from, at: now, duration_secs });
        let _ = audit.record(&AuditEvent::PhaseEntered { phase: to, at: now });
    });
}

/// Parses a planner's JSON output from disk and installs it as the
/// session's plan, then transitions `Planning -> Refresh` directly (the
/// CLI bypasses `PlanningOrchestrator::spawn_selector`/`install_selected_plan`
/// here since no coordinator round is being driven in-process; the same
/// `PlanResponse::parse` fallback chain applies regardless of source).
async fn install_plan_from_file(rig: &Rig, plan_file: &std::path::Path) -> Result<()> {
    let raw = std::fs::read_to_string(plan_file)
        .with_context(|| format!("reading plan file {}", plan_file.display()))?;
    let response = PlanResponse::parse(&raw).context("parsing plan JSON")?;
    let plan = response.into_plan().context("converting parsed plan")?;
    if plan.total_tasks() == 0 {
        anyhow::bail!("plan file {} contains no tasks", plan_file.display());
    }

    {
        let mut session = rig.session.lock().await;
        session.plan = Some(plan);
    }
    rig.phase_manager
        .transition_to(Phase::Refresh, "plan installed from --plan-file", HashMap::new(), None)
        .or_else(|e| match e {
            claudio::errors::PhaseError::AlreadyInPhase(Phase::Refresh) => Ok(()),
            other => Err(other),
        })
        .context("transitioning to refresh after installing plan")?;
    rig.checkpoint.save(&*rig.session.lock().await)?;
    Ok(())
}

fn load_or_new_session(checkpoint: &CheckpointStore, objective: Option<&str>, branch_prefix: &str) -> Result<Session> {
    if let Some(session) = checkpoint.load().context("loading existing checkpoint")? {
        return Ok(session);
    }
    let objective = objective
        .ok_or_else(|| anyhow::anyhow!("no existing session checkpoint found; pass --objective to start one"))?;
    Ok(Session::new(objective, branch_prefix))
}

fn logging_callbacks() -> ProgressCallbacks {
    ProgressCallbacks {
        on_task_start: Some(Arc::new(|task_id| tracing::info!(task_id, "task dispatched"))),
        on_task_complete: Some(Arc::new(|task_id| tracing::info!(task_id, "task completed"))),
        on_task_failed: Some(Arc::new(|task_id, reason| tracing::warn!(task_id, reason, "task failed"))),
        on_group_complete: Some(Arc::new(|group_index| tracing::info!(group_index, "group consolidated"))),
        on_progress: None,
        on_complete: Some(Arc::new(|success, summary| tracing::info!(success, summary, "execution finished"))),
        on_plan_ready: None,
    }
}

#[allow(clippy::too_many_arguments)]
async fn cmd_run(
    project_dir: &std::path::Path,
    objective: Option<String>,
    max_parallel: Option<usize>,
    branch_prefix: Option<String>,
    no_synthesis: bool,
    multi_pass: Option<usize>,
    plan_file: Option<PathBuf>,
    mode: FinalConsolidationMode,
) -> Result<()> {
    let default_prefix = branch_prefix.clone().unwrap_or_else(|| "claudio".to_string());
    let probe_checkpoint = CheckpointStore::new(project_dir.join(".claudio"));
    let session = load_or_new_session(&probe_checkpoint, objective.as_deref(), &default_prefix)?;
    let is_fresh = session.phase_history.is_empty() && session.current_phase == Phase::Planning;
    let objective_for_planning = session.objective.clone();

    let rig = build_rig(project_dir, max_parallel, branch_prefix, no_synthesis, session)?;

    let has_plan = rig.session.lock().await.plan.is_some();

    if !has_plan {
        if let Some(plan_file) = plan_file {
            // A plan can be installed on a fresh session (no coordinator
            // dispatched yet) or on one left in `Refresh`/`Planning` by an
            // earlier `claudio run` that dispatched coordinators out of
            // band; either way, an absent `session.plan` is what matters.
            install_plan_from_file(&rig, &plan_file).await?;
        } else if is_fresh {
            let planning_mode = match multi_pass {
                Some(n) if n >= 2 => PlanningMode::MultiPass { coordinators: n },
                _ => PlanningMode::SinglePass,
            };
            let planner = PlanningOrchestrator::new(
                rig.phase_manager.clone(),
                rig.worker_pool.clone(),
                rig.session.clone(),
                planning_mode,
            );
            planner.execute(&objective_for_planning).await.context("planning failed to dispatch")?;
            rig.checkpoint.save(&*rig.session.lock().await)?;

            anyhow::bail!(
                "planning dispatched ({} coordinator instance(s)); once a coordinator's plan JSON \
                 is available, re-run with `--plan-file <path>` to install it and proceed to execution.",
                planner.coordinator_instance_ids().await.len()
            );
        } else {
            anyhow::bail!(
                "session has no installed plan; pass `--plan-file <path>` once a coordinator's \
                 plan JSON is available"
            );
        }
    }

    let executor = Arc::new(
        ExecutionOrchestrator::new(
            rig.phase_manager.clone(),
            rig.worker_pool.clone(),
            rig.repo.clone(),
            rig.saver.clone(),
            rig.session.clone(),
            rig.config.clone(),
            logging_callbacks(),
        )
        .with_audit(rig.audit.clone()),
    );

    loop {
        match rig.phase_manager.current_phase() {
            Phase::Refresh | Phase::Execution => {
                // `ExecutionOrchestrator::run` transitions `Refresh -> Execution`
                // itself via `ensure_execution_phase`, so entering the loop in
                // either phase converges on the same dispatch loop.
                executor.run().await.context("execution loop failed")?;
            }
            Phase::Synthesis | Phase::Revision => {
                // Neither phase has a dedicated orchestrator in this core
                // (see SPEC_FULL.md §13): synthesis/revision worker
                // dispatch is out of scope for the seven components this
                // crate implements, so the CLI advances straight to
                // consolidation once execution has resolved every task.
                rig.phase_manager
                    .transition_to(Phase::Consolidation, "no synthesis issues flagged", HashMap::new(), None)
                    .context("advancing to consolidation")?;
            }
            Phase::Consolidation => {
                let mut session = rig.session.lock().await;
                let consolidation = claudio::consolidation::ConsolidationOrchestrator::new(
                    rig.repo.clone(),
                    rig.worker_pool.clone(),
                );
                let output = consolidation
                    .finalize(&mut session, mode)
                    .await
                    .context("final consolidation failed")?;
                drop(session);
                rig.checkpoint.save(&*rig.session.lock().await)?;
                rig.phase_manager
                    .transition_to(Phase::Complete, "final consolidation complete", HashMap::new(), None)
                    .context("completing session")?;
                println!("opened {} pull request(s):", output.prs_created.len());
                for pr in &output.prs_created {
                    println!("  group {}: {}", pr.group_index + 1, pr.url);
                }
            }
            Phase::Complete | Phase::Failed => break,
            other => anyhow::bail!("unexpected phase {other:?} reached by `claudio run`"),
        }
    }

    let session = rig.session.lock().await;
    match session.current_phase {
        Phase::Complete => println!("session complete"),
        Phase::Failed => println!(
            "session failed: {}",
            session.error_message.as_deref().unwrap_or("no error message recorded")
        ),
        _ => unreachable!(),
    }
    Ok(())
}

fn cmd_status(project_dir: &std::path::Path) -> Result<()> {
    let checkpoint = CheckpointStore::new(project_dir.join(".claudio"));
    let Some(session) = checkpoint.load().context("loading checkpoint")? else {
        println!("No session found at {}", checkpoint.path().display());
        return Ok(());
    };

    println!();
    println!("Session: {}", session.session_id);
    println!("Objective: {}", session.objective);
    println!("Phase: {:?}", session.current_phase);
    if let Some(plan) = &session.plan {
        println!(
            "Progress: group {}/{}, {} tasks completed, {} failed (of {} total)",
            session.current_group_index + 1,
            plan.total_groups(),
            session.completed_tasks.len(),
            session.failed_tasks.len(),
            plan.total_tasks(),
        );
    } else {
        println!("Progress: no plan installed yet");
    }
    if let Some(decision) = &session.group_decision {
        if decision.awaiting_decision {
            println!(
                "Awaiting arbitration for group {}: {} succeeded, {} failed",
                decision.group_index + 1,
                decision.succeeded.len(),
                decision.failed.len(),
            );
        }
    }
    if let Some(conflict) = &session.conflict {
        println!(
            "Paused on cherry-pick conflict: task {} in {} ({} file(s))",
            conflict.task_id,
            conflict.worktree_path.display(),
            conflict.files.len(),
        );
    }
    if !session.pr_urls.is_empty() {
        println!("Pull requests:");
        for url in &session.pr_urls {
            println!("  {url}");
        }
    }
    if let Some(err) = &session.error_message {
        println!("Error: {err}");
    }

    let audit = AuditTrail::new(project_dir.join(".claudio"));
    let events = audit.read_all().context("reading audit trail")?;
    if !events.is_empty() {
        println!("Recent activity:");
        for event in events.iter().rev().take(10).rev() {
            println!("  {}", describe_audit_event(event));
        }
    }

    println!();
    Ok(())
}

fn describe_audit_event(event: &AuditEvent) -> String {
    match event {
        AuditEvent::PhaseEntered { phase, at } => format!("[{at}] entered {phase:?}"),
        AuditEvent::PhaseExited { phase, at, duration_secs } => {
            format!("[{at}] left {phase:?} after {duration_secs:.1}s")
        }
        AuditEvent::TaskCompleted { task_id, commit_count, at } => {
            format!("[{at}] task {task_id} completed ({commit_count} commit(s))")
        }
        AuditEvent::TaskFailed { task_id, error, at } => format!("[{at}] task {task_id} failed: {error}"),
        AuditEvent::GroupConsolidated { group_index, branch, at } => {
            format!("[{at}] group {} consolidated onto {branch}", group_index + 1)
        }
    }
}

async fn cmd_retrigger(project_dir: &std::path::Path, group: usize) -> Result<()> {
    let rig = load_existing_rig(project_dir).await?;
    let executor = executor_for(&rig);
    executor.retrigger_group(group).await.context("retrigger failed")?;
    rig.checkpoint.save(&*rig.session.lock().await)?;
    println!("retriggered from group {}", group + 1);
    Ok(())
}

async fn cmd_resume_partial(project_dir: &std::path::Path) -> Result<()> {
    let rig = load_existing_rig(project_dir).await?;
    let executor = executor_for(&rig);
    executor.resume_with_partial_work().await.context("resume with partial work failed")?;
    rig.checkpoint.save(&*rig.session.lock().await)?;
    println!("consolidated partial work and advanced past the group");
    Ok(())
}

async fn cmd_retry_failed(project_dir: &std::path::Path) -> Result<()> {
    let rig = load_existing_rig(project_dir).await?;
    let executor = executor_for(&rig);
    executor.retry_failed_tasks().await.context("retrying failed tasks failed")?;
    rig.checkpoint.save(&*rig.session.lock().await)?;
    println!("cleared failed tasks for re-dispatch; run `claudio run` to continue");
    Ok(())
}

async fn cmd_resolve_conflict(project_dir: &std::path::Path) -> Result<()> {
    let rig = load_existing_rig(project_dir).await?;
    let executor = executor_for(&rig);
    executor.resume_after_conflict().await.context("resuming after conflict failed")?;
    rig.checkpoint.save(&*rig.session.lock().await)?;
    println!("conflict resolved, consolidation resumed");
    Ok(())
}

async fn load_existing_rig(project_dir: &std::path::Path) -> Result<Rig> {
    let checkpoint = CheckpointStore::new(project_dir.join(".claudio"));
    let session = checkpoint
        .load()
        .context("loading checkpoint")?
        .ok_or_else(|| anyhow::anyhow!("no existing session checkpoint at {}", checkpoint.path().display()))?;
    build_rig(project_dir, None, None, false, session)
}

fn executor_for(rig: &Rig) -> ExecutionOrchestrator {
    ExecutionOrchestrator::new(
        rig.phase_manager.clone(),
        rig.worker_pool.clone(),
        rig.repo.clone(),
        rig.saver.clone(),
        rig.session.clone(),
        rig.config.clone(),
        logging_callbacks(),
    )
    .with_audit(rig.audit.clone())
}
