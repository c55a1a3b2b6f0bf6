//! Per-subject pipeline state machine.
//!
//! ```text
//! Pending → Reconstructing → Scale(1) → … → Scale(5) → Finalizing → Done
//!    └──────────┴───────────────┴──────────────┴───────────┴──→ Failed
//! ```
//!
//! `Done` and `Failed` are terminal.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::scale::SCALE_COUNT;
use crate::error::PipelineError;

/// State of one subject's pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Pending,
    Reconstructing,
    /// Running the stage for the given 1-based scale index.
    Scale(u8),
    Finalizing,
    Done,
    Failed,
}

impl PipelineState {
    /// Whether no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Done | PipelineState::Failed)
    }

    /// Checks whether moving from `self` to `next` is allowed.
    ///
    /// Valid transitions:
    /// - Pending -> Reconstructing
    /// - Reconstructing -> Scale(1)
    /// - Scale(k) -> Scale(k + 1) for k < 5
    /// - Scale(5) -> Finalizing
    /// - Finalizing -> Done
    /// - any non-terminal state -> Failed
    pub fn can_transition(&self, next: PipelineState) -> bool {
        use PipelineState::*;

        if self.is_terminal() {
            return false;
        }
        match (*self, next) {
            (_, Failed) => true,
            (Pending, Reconstructing) => true,
            (Reconstructing, Scale(1)) => true,
            (Scale(k), Scale(n)) => k < SCALE_COUNT && n == k + 1,
            (Scale(k), Finalizing) => k == SCALE_COUNT,
            (Finalizing, Done) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineState::Pending => write!(f, "pending"),
            PipelineState::Reconstructing => write!(f, "reconstructing"),
            PipelineState::Scale(k) => write!(f, "scale{}", k),
            PipelineState::Finalizing => write!(f, "finalizing"),
            PipelineState::Done => write!(f, "done"),
            PipelineState::Failed => write!(f, "failed"),
        }
    }
}

/// Tracks the state of one subject's run and its transition history.
#[derive(Debug)]
pub struct PipelineRun {
    subject_id: String,
    state: PipelineState,
    history: Vec<PipelineState>,
    started: Instant,
}

impl PipelineRun {
    pub fn new(subject_id: impl Into<String>) -> Self {
        Self {
            subject_id: subject_id.into(),
            state: PipelineState::Pending,
            history: vec![PipelineState::Pending],
            started: Instant::now(),
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Every state visited, starting with `Pending`.
    pub fn history(&self) -> &[PipelineState] {
        &self.history
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.started.elapsed()
    }

    /// Moves to `next`.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::InvalidTransition` when the move is not
    /// allowed; the current state is left unchanged.
    pub fn advance(&mut self, next: PipelineState) -> Result<(), PipelineError> {
        if !self.state.can_transition(next) {
            return Err(PipelineError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        debug!(subject = %self.subject_id, from = %self.state, to = %next, "State transition");
        self.state = next;
        self.history.push(next);
        Ok(())
    }

    /// Marks the run failed. No-op if already terminal.
    pub fn fail(&mut self) {
        if !self.state.is_terminal() {
            self.state = PipelineState::Failed;
            self.history.push(PipelineState::Failed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use PipelineState::*;

    #[test]
    fn test_happy_path() {
        let mut run = PipelineRun::new("sub-01");
        run.advance(Reconstructing).unwrap();
        for k in 1..=5 {
            run.advance(Scale(k)).unwrap();
        }
        run.advance(Finalizing).unwrap();
        run.advance(Done).unwrap();

        assert_eq!(run.state(), Done);
        assert_eq!(run.history().len(), 9);
    }

    #[test]
    fn test_scales_cannot_be_skipped() {
        assert!(!Scale(1).can_transition(Scale(3)));
        assert!(!Reconstructing.can_transition(Scale(2)));
        assert!(!Scale(4).can_transition(Finalizing));
        assert!(!Pending.can_transition(Scale(1)));
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        for next in [Pending, Reconstructing, Scale(1), Finalizing, Done, Failed] {
            assert!(!Done.can_transition(next));
            assert!(!Failed.can_transition(next));
        }
    }

    #[test]
    fn test_failed_reachable_from_any_non_terminal() {
        for from in [Pending, Reconstructing, Scale(3), Finalizing] {
            assert!(from.can_transition(Failed));
        }
    }

    #[test]
    fn test_invalid_advance_keeps_state() {
        let mut run = PipelineRun::new("sub-01");
        let err = run.advance(Done).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::InvalidTransition {
                from: Pending,
                to: Done
            }
        ));
        assert_eq!(run.state(), Pending);
    }

    #[test]
    fn test_fail_is_idempotent_on_terminal() {
        let mut run = PipelineRun::new("sub-01");
        run.fail();
        run.fail();
        assert_eq!(run.state(), Failed);
        assert_eq!(run.history(), &[Pending, Failed]);
    }

    #[test]
    fn test_display() {
        assert_eq!(Scale(2).to_string(), "scale2");
        assert_eq!(Finalizing.to_string(), "finalizing");
    }
}
