//! C1: the global phase state machine.
//!
//! Authoritative current phase, transition validation against the fixed
//! table in the spec, an append-only audit history, and phase-change
//! callbacks fired outside the lock guarding (phase, history).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::PhaseError;

/// The seven lifecycle phases, plus the two terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Planning,
    PlanSelection,
    Refresh,
    Execution,
    Synthesis,
    Revision,
    Consolidation,
    Complete,
    Failed,
}

impl Phase {
    /// The set of phases this phase is permitted to transition into.
    pub fn valid_successors(self) -> &'static [Phase] {
        use Phase::*;
        match self {
            Planning => &[PlanSelection, Refresh, Failed],
            PlanSelection => &[Refresh, Failed],
            Refresh => &[Execution, Failed],
            Execution => &[Synthesis, Consolidation, Complete, Failed],
            Synthesis => &[Revision, Consolidation, Complete, Failed],
            Revision => &[Synthesis, Consolidation, Failed],
            Consolidation => &[Complete, Failed],
            Complete | Failed => &[],
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Complete | Phase::Failed)
    }
}

/// Requirements that must hold on the session before entering a phase.
/// Evaluated by the caller (the orchestrators hold the session data this
/// state machine does not); `transition_to` takes the result as `Option<String>`
/// describing the first violated constraint, or `None` if all are satisfied.
pub type ConstraintCheck = Option<String>;

/// Append-only record of one phase transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub from: Phase,
    pub to: Phase,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Per-phase configuration: currently just a timeout.
#[derive(Debug, Clone, Copy, Default)]
pub struct PhaseConfig {
    pub timeout: Option<Duration>,
}

type PhaseChangeCallback = Box<dyn Fn(Phase, Phase) + Send + Sync>;

struct Locked {
    current: Phase,
    history: Vec<PhaseTransition>,
    entered_at: HashMap<usize, DateTime<Utc>>,
}

/// The authoritative phase state machine (C1).
///
/// A single mutex guards `(current phase, history tail)`; callbacks fire
/// after the critical section exits, in registration order.
pub struct PhaseManager {
    locked: Mutex<Locked>,
    callbacks: Mutex<Vec<PhaseChangeCallback>>,
    configs: Mutex<HashMap<u8, PhaseConfig>>,
}

impl PhaseManager {
    pub fn new(initial: Phase) -> Self {
        Self {
            locked: Mutex::new(Locked {
                current: initial,
                history: Vec::new(),
                entered_at: HashMap::new(),
            }),
            callbacks: Mutex::new(Vec::new()),
            configs: Mutex::new(HashMap::new()),
        }
    }

    pub fn current_phase(&self) -> Phase {
        self.locked.lock().unwrap().current
    }

    pub fn can_transition_to(&self, target: Phase) -> bool {
        let current = self.current_phase();
        current != target && current.valid_successors().contains(&target)
    }

    /// Validate and apply a transition, recording it in history and firing
    /// registered callbacks afterward. `constraint` should evaluate the
    /// target phase's entry constraint and return `Some(message)` if it is
    /// violated.
    pub fn transition_to(
        &self,
        target: Phase,
        reason: impl Into<String>,
        metadata: HashMap<String, String>,
        constraint: ConstraintCheck,
    ) -> Result<(), PhaseError> {
        let reason = reason.into();
        let (from, to) = {
            let mut guard = self.locked.lock().unwrap();
            let current = guard.current;

            if current.is_terminal() {
                return Err(PhaseError::TerminalPhase(current));
            }
            if current == target {
                return Err(PhaseError::AlreadyInPhase(current));
            }
            if !current.valid_successors().contains(&target) {
                return Err(PhaseError::InvalidTransition {
                    from: current,
                    to: target,
                });
            }
            if let Some(message) = constraint {
                return Err(PhaseError::ConstraintNotSatisfied {
                    phase: target,
                    message,
                });
            }

            guard.history.push(PhaseTransition {
                from: current,
                to: target,
                timestamp: Utc::now(),
                reason,
                metadata,
            });
            guard.current = target;
            guard.entered_at.insert(guard.history.len(), Utc::now());
            (current, target)
        };

        let callbacks = self.callbacks.lock().unwrap();
        for cb in callbacks.iter() {
            cb(from, to);
        }
        Ok(())
    }

    /// Register a phase-change callback, fired with `(from, to)` in
    /// registration order after each successful transition.
    pub fn on_phase_change<F>(&self, callback: F)
    where
        F: Fn(Phase, Phase) + Send + Sync + 'static,
    {
        self.callbacks.lock().unwrap().push(Box::new(callback));
    }

    pub fn history(&self) -> Vec<PhaseTransition> {
        self.locked.lock().unwrap().history.clone()
    }

    /// Total wall-clock time spent in `phase` across all visits, based on
    /// consecutive pairs of entry/exit transitions in the history.
    pub fn duration_in(&self, phase: Phase) -> Duration {
        let guard = self.locked.lock().unwrap();
        let mut total = Duration::ZERO;
        let mut entered_at: Option<DateTime<Utc>> = None;

        for transition in &guard.history {
            if transition.from == phase {
                if let Some(start) = entered_at.take()
                    && let Ok(delta) = (transition.timestamp - start).to_std()
                {
                    total += delta;
                }
            }
            if transition.to == phase {
                entered_at = Some(transition.timestamp);
            }
        }

        if guard.current == phase
            && let Some(start) = entered_at
            && let Ok(delta) = (Utc::now() - start).to_std()
        {
            total += delta;
        }

        total
    }

    pub fn set_config_for(&self, phase: Phase, config: PhaseConfig) {
        self.configs.lock().unwrap().insert(phase as u8, config);
    }

    pub fn config_for(&self, phase: Phase) -> PhaseConfig {
        self.configs
            .lock()
            .unwrap()
            .get(&(phase as u8))
            .copied()
            .unwrap_or_default()
    }
}

impl Default for PhaseManager {
    fn default() -> Self {
        Self::new(Phase::Planning)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn valid_transitions_succeed() {
        let mgr = PhaseManager::new(Phase::Planning);
        assert!(mgr.can_transition_to(Phase::Refresh));
        mgr.transition_to(Phase::Refresh, "single-pass plan ready", HashMap::new(), None)
            .unwrap();
        assert_eq!(mgr.current_phase(), Phase::Refresh);
    }

    #[test]
    fn invalid_transition_is_rejected() {
        let mgr = PhaseManager::new(Phase::Planning);
        let err = mgr
            .transition_to(Phase::Complete, "skip ahead", HashMap::new(), None)
            .unwrap_err();
        assert!(matches!(err, PhaseError::InvalidTransition { .. }));
    }

    #[test]
    fn same_phase_transition_rejected() {
        let mgr = PhaseManager::new(Phase::Planning);
        let err = mgr
            .transition_to(Phase::Planning, "noop", HashMap::new(), None)
            .unwrap_err();
        assert!(matches!(err, PhaseError::AlreadyInPhase(Phase::Planning)));
    }

    #[test]
    fn terminal_phase_rejects_all_transitions() {
        let mgr = PhaseManager::new(Phase::Planning);
        mgr.transition_to(Phase::Refresh, "r", HashMap::new(), None).unwrap();
        mgr.transition_to(Phase::Execution, "r", HashMap::new(), None).unwrap();
        mgr.transition_to(Phase::Complete, "done", HashMap::new(), None).unwrap();
        let err = mgr
            .transition_to(Phase::Failed, "too late", HashMap::new(), None)
            .unwrap_err();
        assert!(matches!(err, PhaseError::TerminalPhase(Phase::Complete)));
    }

    #[test]
    fn constraint_violation_blocks_transition() {
        let mgr = PhaseManager::new(Phase::Planning);
        let err = mgr
            .transition_to(
                Phase::Refresh,
                "r",
                HashMap::new(),
                Some("plan missing".to_string()),
            )
            .unwrap_err();
        assert!(matches!(err, PhaseError::ConstraintNotSatisfied { .. }));
        // current phase is unchanged
        assert_eq!(mgr.current_phase(), Phase::Planning);
    }

    #[test]
    fn history_is_strictly_monotonic_and_never_repeats_consecutively() {
        let mgr = PhaseManager::new(Phase::Planning);
        mgr.transition_to(Phase::Refresh, "r1", HashMap::new(), None).unwrap();
        mgr.transition_to(Phase::Execution, "r2", HashMap::new(), None).unwrap();
        let history = mgr.history();
        assert_eq!(history.len(), 2);
        for w in history.windows(2) {
            assert_ne!(w[0].to, w[0].from);
            assert_eq!(w[0].to, w[1].from);
        }
    }

    #[test]
    fn callbacks_fire_in_registration_order_with_from_to() {
        let mgr = PhaseManager::new(Phase::Planning);
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let o1 = Arc::clone(&order);
        mgr.on_phase_change(move |from, to| o1.lock().unwrap().push((1, from, to)));
        let o2 = Arc::clone(&order);
        mgr.on_phase_change(move |from, to| o2.lock().unwrap().push((2, from, to)));

        mgr.transition_to(Phase::Refresh, "r", HashMap::new(), None).unwrap();

        let log = order.lock().unwrap();
        assert_eq!(*log, vec![(1, Phase::Planning, Phase::Refresh), (2, Phase::Planning, Phase::Refresh)]);
    }

    #[test]
    fn duration_in_accumulates_across_multiple_visits() {
        let mgr = PhaseManager::new(Phase::Planning);
        mgr.transition_to(Phase::Refresh, "r", HashMap::new(), None).unwrap();
        mgr.transition_to(Phase::Execution, "r", HashMap::new(), None).unwrap();
        mgr.transition_to(Phase::Synthesis, "r", HashMap::new(), None).unwrap();
        mgr.transition_to(Phase::Revision, "r", HashMap::new(), None).unwrap();
        mgr.transition_to(Phase::Synthesis, "r", HashMap::new(), None).unwrap();
        // Visited Synthesis twice; duration_in should not panic and should be >= 0.
        let d = mgr.duration_in(Phase::Synthesis);
        assert!(d >= Duration::ZERO);
    }

    #[test]
    fn config_for_defaults_when_unset() {
        let mgr = PhaseManager::new(Phase::Planning);
        let cfg = mgr.config_for(Phase::Execution);
        assert!(cfg.timeout.is_none());

        mgr.set_config_for(Phase::Execution, PhaseConfig { timeout: Some(Duration::from_secs(60)) });
        assert_eq!(mgr.config_for(Phase::Execution).timeout, Some(Duration::from_secs(60)));
    }

    #[test]
    fn consolidation_is_reachable_directly_from_execution() {
        let mgr = PhaseManager::new(Phase::Execution);
        assert!(mgr.can_transition_to(Phase::Consolidation));
        mgr.transition_to(Phase::Consolidation, "skip synthesis", HashMap::new(), None)
            .unwrap();
        assert_eq!(mgr.current_phase(), Phase::Consolidation);
    }

    #[test]
    fn callback_count_matches_invocations() {
        let mgr = PhaseManager::new(Phase::Planning);
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        mgr.on_phase_change(move |_, _| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        mgr.transition_to(Phase::Refresh, "r", HashMap::new(), None).unwrap();
        mgr.transition_to(Phase::Execution, "r", HashMap::new(), None).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
