//! Typed error hierarchy for the phase-orchestration core.
//!
//! One enum per subsystem, following the same split used elsewhere in
//! this codebase: errors that are *returned* (cancellation, constraint
//! violations) are not wrapped with extra context; errors that cross an
//! I/O or subprocess boundary carry the operation and path.

use std::path::PathBuf;
use thiserror::Error;

use crate::phase_machine::Phase;

/// Errors from the phase state machine (C1).
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PhaseError {
    #[error("cannot transition from {from:?} to {to:?}: not a permitted successor")]
    InvalidTransition { from: Phase, to: Phase },

    #[error("already in phase {0:?}")]
    AlreadyInPhase(Phase),

    #[error("phase {0:?} is terminal")]
    TerminalPhase(Phase),

    #[error("entry constraint not satisfied for {phase:?}: {message}")]
    ConstraintNotSatisfied { phase: Phase, message: String },

    #[error("phase {phase:?} exceeded its configured timeout")]
    PhaseTimeout { phase: Phase },
}

/// Errors from the planning orchestrator (C3).
#[derive(Debug, Error)]
pub enum PlanningError {
    #[error("planning was cancelled")]
    Cancelled,

    #[error(transparent)]
    Phase(#[from] PhaseError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the execution orchestrator (C4).
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("execution was cancelled")]
    Cancelled,

    #[error("no consolidation record exists for group {0}")]
    NoConsolidation(usize),

    #[error(transparent)]
    Phase(#[from] PhaseError),

    #[error(transparent)]
    Consolidation(#[from] ConsolidationError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the consolidation orchestrator (C5).
#[derive(Debug, Error)]
pub enum ConsolidationError {
    #[error("group consolidation failed: {0}")]
    Failed(String),

    #[error("consolidation is not paused")]
    NotPaused,

    #[error("no conflict worktree is recorded")]
    NoConflictWorktree,

    #[error("unresolved conflicts remain in {worktree}: {files:?}")]
    UnresolvedConflicts {
        worktree: PathBuf,
        files: Vec<String>,
    },

    #[error("repository operation '{operation}' failed at {}: {source}", path.display())]
    RepoOperation {
        operation: String,
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the worker-pool / repository-operator collaborator traits.
#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("instance {0} not found")]
    InstanceNotFound(String),

    #[error("failed to start instance: {0}")]
    StartFailed(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors validating a `PhaseContext` (C2).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ContextError {
    #[error("phase manager is nil")]
    NilManager,
    #[error("worker pool is nil")]
    NilWorkerPool,
    #[error("session is nil")]
    NilSession,
}

/// Errors constructing a `RuntimeConfig`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("max_parallel must not be negative (got {0})")]
    NegativeMaxParallel(i64),

    #[error("failed to resolve project directory {}: {source}", path.display())]
    ProjectDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
