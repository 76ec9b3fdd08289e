//! C2: the validated dependency bundle passed to every orchestrator.
//!
//! `PhaseContext` is intentionally dumb — it bundles collaborators and
//! validates their presence once, up front, so orchestrators never need to
//! check for nil/missing dependencies mid-run.

use std::sync::Arc;

use tracing::Span;

use crate::collaborators::{SessionSaver, WorkerPool};
use crate::errors::ContextError;
use crate::phase_machine::PhaseManager;
use crate::session::Session;

/// Progress callbacks an orchestrator may fire. All are optional; a caller
/// not interested in a given event simply does not register one.
#[derive(Default, Clone)]
pub struct ProgressCallbacks {
    pub on_task_start: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    pub on_task_complete: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    pub on_task_failed: Option<Arc<dyn Fn(&str, &str) + Send + Sync>>,
    pub on_group_complete: Option<Arc<dyn Fn(usize) + Send + Sync>>,
    pub on_progress: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    pub on_complete: Option<Arc<dyn Fn(bool, &str) + Send + Sync>>,
    pub on_plan_ready: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl std::fmt::Debug for ProgressCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressCallbacks").finish_non_exhaustive()
    }
}

/// Immutable bundle of collaborators an orchestrator needs: the phase
/// manager, a worker pool, the session handle, a logging span, and an
/// optional set of progress callbacks.
#[derive(Clone)]
pub struct PhaseContext {
    pub phase_manager: Option<Arc<PhaseManager>>,
    pub worker_pool: Option<Arc<dyn WorkerPool>>,
    pub session_saver: Option<Arc<dyn SessionSaver>>,
    pub session: Arc<tokio::sync::Mutex<Session>>,
    pub logger: Span,
    pub callbacks: ProgressCallbacks,
    have_session: bool,
}

impl PhaseContext {
    pub fn new(
        phase_manager: Arc<PhaseManager>,
        worker_pool: Arc<dyn WorkerPool>,
        session_saver: Arc<dyn SessionSaver>,
        session: Arc<tokio::sync::Mutex<Session>>,
    ) -> Self {
        Self {
            phase_manager: Some(phase_manager),
            worker_pool: Some(worker_pool),
            session_saver: Some(session_saver),
            session,
            logger: tracing::Span::none(),
            callbacks: ProgressCallbacks::default(),
            have_session: true,
        }
    }

    pub fn with_logger(mut self, logger: Span) -> Self {
        self.logger = logger;
        self
    }

    pub fn with_callbacks(mut self, callbacks: ProgressCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    /// Returns the first-encountered validation error, in the order
    /// `NilManager`, `NilWorkerPool`, `NilSession`, matching the spec's
    /// stated precedence.
    pub fn validate(&self) -> Result<(), ContextError> {
        if self.phase_manager.is_none() {
            return Err(ContextError::NilManager);
        }
        if self.worker_pool.is_none() {
            return Err(ContextError::NilWorkerPool);
        }
        if !self.have_session {
            return Err(ContextError::NilSession);
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn without_session(mut self) -> Self {
        self.have_session = false;
        self
    }

    #[cfg(test)]
    pub fn without_manager(mut self) -> Self {
        self.phase_manager = None;
        self
    }

    #[cfg(test)]
    pub fn without_worker_pool(mut self) -> Self {
        self.worker_pool = None;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::fakes::{FakeSessionSaver, FakeWorkerPool};
    use crate::phase_machine::Phase;
    use crate::session::Session;

    fn make_context() -> PhaseContext {
        let manager = Arc::new(PhaseManager::new(Phase::Planning));
        let pool: Arc<dyn WorkerPool> = Arc::new(FakeWorkerPool::new());
        let saver: Arc<dyn SessionSaver> = Arc::new(FakeSessionSaver::new());
        let session = Arc::new(tokio::sync::Mutex::new(Session::new("obj", "claudio")));
        PhaseContext::new(manager, pool, saver, session)
    }

    #[test]
    fn valid_context_passes_validation() {
        assert!(make_context().validate().is_ok());
    }

    #[test]
    fn nil_manager_is_reported_first() {
        let ctx = make_context().without_manager().without_worker_pool().without_session();
        assert_eq!(ctx.validate().unwrap_err(), ContextError::NilManager);
    }

    #[test]
    fn nil_worker_pool_reported_when_manager_present() {
        let ctx = make_context().without_worker_pool().without_session();
        assert_eq!(ctx.validate().unwrap_err(), ContextError::NilWorkerPool);
    }

    #[test]
    fn nil_session_reported_last() {
        let ctx = make_context().without_session();
        assert_eq!(ctx.validate().unwrap_err(), ContextError::NilSession);
    }

    #[test]
    fn missing_logger_and_callbacks_are_fine() {
        let ctx = make_context();
        assert!(ctx.callbacks.on_task_start.is_none());
        assert!(ctx.validate().is_ok());
    }
}
